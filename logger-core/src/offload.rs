//! Offloaded logging on a dedicated worker task
//!
//! The worker owns the [`DataLogger`] and drains a bounded command queue, so
//! any number of producers can log through cloned [`LoggerHandle`]s while the
//! engine itself only ever sees one caller. Writes are fire-and-forget with
//! back-pressure; reads and erases wait for a reply from the worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::backend::LoggerBackend;
use crate::config::OffloadConfig;
use crate::events::LoggerEvents;
use crate::logger::{DataLogger, EraseError, LoggerState, ReadError, WriteError};
use crate::recovery::RecoveryError;
use crate::watchdog::Watchdog;

/// Erase progress callback run on the worker
pub type ProgressFn = Box<dyn Fn(u32) + Send + Sync>;

/// Offload worker failures
#[derive(Error, Debug)]
pub enum OffloadError {
    #[error("Logger worker has stopped")]
    WorkerStopped,
    #[error("Logger worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Logger worker could not recover: {0}")]
    Recovery(#[from] RecoveryError),
}

enum Command {
    Write {
        block_type: u8,
        data: Vec<u8>,
    },
    Flush,
    Read {
        block_idx: u32,
        offset: u16,
        len: usize,
        reply: oneshot::Sender<Result<Vec<u8>, ReadError>>,
    },
    Erase {
        erase_all: bool,
        progress: Option<ProgressFn>,
        reply: oneshot::Sender<Result<(), EraseError>>,
    },
    BlockSizeChanged {
        block_size: u16,
        reply: oneshot::Sender<Result<(), RecoveryError>>,
    },
    RegisterEvents(Arc<dyn LoggerEvents>),
    Sync(oneshot::Sender<()>),
    Shutdown,
}

/// Cloneable producer side of an offloaded logger
#[derive(Clone)]
pub struct LoggerHandle {
    tx: mpsc::Sender<Command>,
    state: watch::Receiver<LoggerState>,
    erasing: Arc<AtomicBool>,
    persistent: bool,
    max_record_size: usize,
}

impl std::fmt::Debug for LoggerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggerHandle")
            .field("state", &*self.state.borrow())
            .field("max_record_size", &self.max_record_size)
            .finish()
    }
}

/// A [`DataLogger`] running on its own worker task
pub struct OffloadedLogger<B: LoggerBackend> {
    handle: LoggerHandle,
    worker: JoinHandle<DataLogger<B>>,
}

impl<B: LoggerBackend> OffloadedLogger<B> {
    /// Move `logger` onto a new worker task
    pub fn spawn(logger: DataLogger<B>, config: OffloadConfig, watchdog: Arc<dyn Watchdog>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let (state_tx, state_rx) = watch::channel(logger.state());
        let handle = LoggerHandle {
            tx,
            state: state_rx,
            erasing: logger.erasing_flag(),
            persistent: logger.is_persistent(),
            max_record_size: config.max_record_size,
        };

        log::info!(
            "{} -> Offloading writes ({} record queue)",
            logger.name(),
            config.queue_depth
        );
        let worker = tokio::spawn(run_worker(
            logger,
            rx,
            state_tx,
            watchdog,
            config.watchdog_period(),
        ));
        Self { handle, worker }
    }

    pub fn handle(&self) -> LoggerHandle {
        self.handle.clone()
    }

    /// Drain queued commands, flush the RAM buffer and stop the worker
    pub async fn shutdown(self) -> Result<DataLogger<B>, OffloadError> {
        if self.handle.tx.send(Command::Shutdown).await.is_err() {
            log::debug!("Logger worker already stopped");
        }
        Ok(self.worker.await?)
    }
}

impl LoggerHandle {
    /// Queue a record for writing
    ///
    /// Fails immediately when the record cannot be written or the queue is
    /// saturated. Records accepted while an erase runs are dropped.
    pub fn enqueue(&self, block_type: u8, data: &[u8]) -> Result<(), WriteError> {
        self.state.borrow().check_write(data.len())?;
        if data.len() > self.max_record_size {
            return Err(WriteError::TooLarge {
                len: data.len(),
                max: self.max_record_size,
            });
        }
        if self.erasing.load(Ordering::Acquire) {
            return Ok(());
        }

        self.tx
            .try_send(Command::Write {
                block_type,
                data: data.to_vec(),
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => WriteError::QueueFull,
                TrySendError::Closed(_) => WriteError::WorkerStopped,
            })
    }

    /// Request a flush of the RAM buffer
    pub async fn flush(&self) -> Result<(), WriteError> {
        self.tx
            .send(Command::Flush)
            .await
            .map_err(|_| WriteError::WorkerStopped)
    }

    /// Read `len` bytes starting at `offset` within logical block `block_idx`
    pub async fn read(&self, block_idx: u32, offset: u16, len: usize) -> Result<Vec<u8>, ReadError> {
        if !self.persistent {
            return Err(ReadError::NotSupported);
        }
        if self.erasing.load(Ordering::Acquire) {
            return Err(ReadError::Busy);
        }

        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Read {
                block_idx,
                offset,
                len,
                reply,
            })
            .await
            .map_err(|_| ReadError::WorkerStopped)?;
        rx.await.map_err(|_| ReadError::WorkerStopped)?
    }

    /// Erase the log on the worker
    pub async fn erase(&self, erase_all: bool, progress: Option<ProgressFn>) -> Result<(), EraseError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Erase {
                erase_all,
                progress,
                reply,
            })
            .await
            .map_err(|_| EraseError::WorkerStopped)?;
        rx.await.map_err(|_| EraseError::WorkerStopped)?
    }

    /// Last state published by the worker
    pub fn state(&self) -> LoggerState {
        *self.state.borrow()
    }

    pub fn is_erasing(&self) -> bool {
        self.erasing.load(Ordering::Acquire)
    }

    /// Apply a new block size on the worker, recovering the log if needed
    pub async fn block_size_changed(&self, block_size: u16) -> Result<(), OffloadError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::BlockSizeChanged { block_size, reply })
            .await
            .map_err(|_| OffloadError::WorkerStopped)?;
        Ok(rx.await.map_err(|_| OffloadError::WorkerStopped)??)
    }

    pub async fn register_events(&self, events: Arc<dyn LoggerEvents>) -> Result<(), OffloadError> {
        self.tx
            .send(Command::RegisterEvents(events))
            .await
            .map_err(|_| OffloadError::WorkerStopped)
    }

    /// Wait until every command queued before this call has been handled
    pub async fn sync(&self) -> Result<(), OffloadError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Sync(reply))
            .await
            .map_err(|_| OffloadError::WorkerStopped)?;
        rx.await.map_err(|_| OffloadError::WorkerStopped)
    }
}

async fn run_worker<B: LoggerBackend>(
    mut logger: DataLogger<B>,
    mut rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<LoggerState>,
    watchdog: Arc<dyn Watchdog>,
    period: Duration,
) -> DataLogger<B> {
    loop {
        let command = match tokio::time::timeout(period, rx.recv()).await {
            Ok(Some(command)) => command,
            Ok(None) => break,
            Err(_) => {
                watchdog.feed();
                continue;
            }
        };
        watchdog.feed();

        if let Command::Shutdown = command {
            break;
        }
        handle_command(&mut logger, &state_tx, command).await;

        // Feed before sleeping again
        watchdog.feed();
    }

    // Refuse new commands, then finish everything already accepted
    rx.close();
    while let Some(command) = rx.recv().await {
        watchdog.feed();
        if let Command::Shutdown = command {
            continue;
        }
        handle_command(&mut logger, &state_tx, command).await;
    }

    if let Err(e) = logger.flush().await {
        log::error!("Failed to flush {} on shutdown ({})", logger.name(), e);
    }
    state_tx.send_replace(logger.state());
    log::debug!("{} worker stopped", logger.name());
    logger
}

async fn handle_command<B: LoggerBackend>(
    logger: &mut DataLogger<B>,
    state_tx: &watch::Sender<LoggerState>,
    command: Command,
) {
    match command {
        Command::Write { block_type, data } => {
            if let Err(e) = logger.write(block_type, &data).await {
                log::error!("Offload failed to write block on {} ({})", logger.name(), e);
            }
            state_tx.send_replace(logger.state());
        }
        Command::Flush => {
            if let Err(e) = logger.flush().await {
                log::error!("Offload failed to flush {} ({})", logger.name(), e);
            }
            state_tx.send_replace(logger.state());
        }
        Command::Read {
            block_idx,
            offset,
            len,
            reply,
        } => {
            let mut buf = vec![0u8; len];
            let result = logger.read(block_idx, offset, &mut buf).await.map(|()| buf);
            let _ = reply.send(result);
        }
        Command::Erase {
            erase_all,
            progress,
            reply,
        } => {
            let result = logger.erase(erase_all, progress.as_deref()).await;
            state_tx.send_replace(logger.state());
            let _ = reply.send(result);
        }
        Command::BlockSizeChanged { block_size, reply } => {
            let result = logger.block_size_changed(block_size).await;
            state_tx.send_replace(logger.state());
            let _ = reply.send(result);
        }
        Command::RegisterEvents(events) => logger.register_events(events),
        Command::Sync(reply) => {
            let _ = reply.send(());
        }
        Command::Shutdown => {}
    }
}

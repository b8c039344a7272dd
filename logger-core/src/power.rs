//! Backend power gating
//!
//! Every backend access holds a usage reference on the device. Releases are
//! normally deferred by a grace delay so a burst of writes only pays for one
//! power transition.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::backend::BackendError;

/// Power control of the device behind a backend
#[async_trait]
pub trait DevicePower: Send + Sync + 'static {
    async fn power_up(&self) -> Result<(), BackendError>;
    async fn power_down(&self) -> Result<(), BackendError>;
}

/// Device without power control
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOn;

#[async_trait]
impl DevicePower for AlwaysOn {
    async fn power_up(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn power_down(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

struct GateInner {
    device: Arc<dyn DevicePower>,
    usage: Mutex<u32>,
    release_delay: Duration,
}

/// Usage counted power reference
#[derive(Clone)]
pub struct PowerGate {
    inner: Arc<GateInner>,
}

impl std::fmt::Debug for PowerGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerGate")
            .field("release_delay", &self.inner.release_delay)
            .finish()
    }
}

impl PowerGate {
    pub fn new(device: Arc<dyn DevicePower>, release_delay: Duration) -> Self {
        Self {
            inner: Arc::new(GateInner {
                device,
                usage: Mutex::new(0),
                release_delay,
            }),
        }
    }

    /// Gate for a device that is always powered
    pub fn always_on() -> Self {
        Self::new(Arc::new(AlwaysOn), Duration::ZERO)
    }

    /// Take a usage reference, powering the device up if it was idle
    pub async fn get(&self) -> Result<(), BackendError> {
        let mut usage = self.inner.usage.lock().await;
        if *usage == 0 {
            self.inner.device.power_up().await?;
        }
        *usage += 1;
        Ok(())
    }

    /// Drop a usage reference immediately
    pub async fn put(&self) {
        Self::release(&self.inner).await;
    }

    /// Drop a usage reference after the grace delay
    pub async fn put_async(&self) {
        if self.inner.release_delay.is_zero() {
            Self::release(&self.inner).await;
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.release_delay).await;
            Self::release(&inner).await;
        });
    }

    /// Current number of usage references
    pub async fn usage(&self) -> u32 {
        *self.inner.usage.lock().await
    }

    async fn release(inner: &GateInner) {
        let mut usage = inner.usage.lock().await;
        match *usage {
            0 => log::warn!("Power released without a matching get"),
            1 => {
                *usage = 0;
                if let Err(e) = inner.device.power_down().await {
                    log::error!("Failed to power down device: {}", e);
                }
            }
            _ => *usage -= 1,
        }
    }
}

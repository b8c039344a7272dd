//! Storage backends for wraplog

mod backend_trait;
pub mod memory;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::config::FileBackendConfig;

// Re-export the backend trait and related types
pub use self::backend_trait::{
    BackendError, BackendGeometry, LoggerBackend, Result, MAX_WRAP,
};
pub use self::memory::{MemoryBackend, MemoryProbe, Op, WriteRecord};

/// A log image stored in a regular file or raw block device
///
/// Erasing overwrites blocks with the erase value, so the image behaves like
/// an SD card or disk partition rather than NOR flash.
#[derive(Debug)]
pub struct FileBackend {
    file: File,
    path: PathBuf,
    geometry: BackendGeometry,
    read_only: bool,
}

impl FileBackend {
    /// Create a new erased log image of `physical_blocks` blocks
    pub async fn create(
        path: impl AsRef<Path>,
        config: &FileBackendConfig,
        physical_blocks: u32,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;

        let block_size = config.block_size as usize;
        let chunk = vec![config.erase_val; block_size];
        for _ in 0..physical_blocks {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        let geometry = Self::geometry_for(config, physical_blocks);
        log::info!(
            "Created log image {} ({} blocks of {} bytes)",
            path.display(),
            physical_blocks,
            config.block_size
        );

        Ok(Self {
            file,
            path,
            geometry,
            read_only: false,
        })
    }

    /// Open an existing log image
    pub async fn open(
        path: impl AsRef<Path>,
        config: &FileBackendConfig,
        read_only: bool,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .await?;

        // Handles both regular files and block devices
        let size = Self::get_device_size(&path)?;
        let physical_blocks = physical_blocks_for(size, config.block_size)?;
        let geometry = Self::geometry_for(config, physical_blocks);

        Ok(Self {
            file,
            path,
            geometry,
            read_only,
        })
    }

    fn geometry_for(config: &FileBackendConfig, physical_blocks: u32) -> BackendGeometry {
        let max_logical = physical_blocks.saturating_mul(MAX_WRAP as u32);
        BackendGeometry {
            physical_blocks,
            logical_blocks: config
                .logical_blocks
                .map_or(max_logical, |blocks| blocks.min(max_logical)),
            block_size: config.block_size,
            erase_size: config.erase_size,
            erase_val: config.erase_val,
            block_write_align: 1,
            requires_full_block_write: false,
        }
    }

    /// Get the size of a file or block device in bytes
    fn get_device_size(path: &Path) -> Result<u64> {
        #[cfg(unix)]
        {
            Self::get_device_size_unix(path)
        }
        #[cfg(not(unix))]
        {
            Ok(std::fs::metadata(path)?.len())
        }
    }

    /// Unix-specific block device size detection
    #[cfg(unix)]
    fn get_device_size_unix(path: &Path) -> Result<u64> {
        use std::fs::File as StdFile;
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::io::AsRawFd;

        let metadata = std::fs::metadata(path)?;
        if !metadata.file_type().is_block_device() {
            return Ok(metadata.len());
        }

        let file = StdFile::open(path)?;
        let fd = file.as_raw_fd();

        // BLKGETSIZE64 = 0x80081272 on Linux
        const BLKGETSIZE64: libc::c_ulong = 0x80081272;

        let mut size: u64 = 0;
        let result = unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut size as *mut u64) };

        if result == -1 {
            return Err(BackendError::Io(std::io::Error::last_os_error()));
        }

        Ok(size)
    }

    /// Path of the backing image
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the image is read-only
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Flush written data to stable storage
    pub async fn sync(&mut self) -> Result<()> {
        self.file.sync_all().await?;
        Ok(())
    }

    fn byte_offset(&self, phys_block: u32) -> Result<u64> {
        if phys_block >= self.geometry.physical_blocks {
            return Err(BackendError::InvalidBlockNumber(phys_block));
        }
        Ok(phys_block as u64 * self.geometry.block_size as u64)
    }

    fn media_len(&self) -> u64 {
        self.geometry.physical_blocks as u64 * self.geometry.block_size as u64
    }

    async fn fill_blocks(&mut self, phys_block: u32, num: u32) -> Result<()> {
        if self.read_only {
            return Err(BackendError::ReadOnly);
        }
        let offset = self.byte_offset(phys_block)?;
        let len = num as usize * self.geometry.block_size as usize;
        if offset + len as u64 > self.media_len() {
            return Err(BackendError::OutOfRange { offset, len });
        }

        let chunk = vec![self.geometry.erase_val; len];
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(&chunk).await?;
        self.file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl LoggerBackend for FileBackend {
    fn geometry(&self) -> BackendGeometry {
        self.geometry
    }

    async fn write(&mut self, phys_block: u32, _block_type: u8, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BackendError::ReadOnly);
        }
        if data.len() > self.geometry.block_size as usize {
            return Err(BackendError::InvalidLength(data.len()));
        }

        let offset = self.byte_offset(phys_block)?;
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        self.file.flush().await?;
        Ok(())
    }

    async fn read(&mut self, phys_block: u32, offset: u16, buf: &mut [u8]) -> Result<()> {
        let start = self.byte_offset(phys_block)? + offset as u64;
        if start + buf.len() as u64 > self.media_len() {
            return Err(BackendError::OutOfRange {
                offset: start,
                len: buf.len(),
            });
        }

        self.file.seek(SeekFrom::Start(start)).await?;
        self.file.read_exact(buf).await?;
        Ok(())
    }

    async fn erase(&mut self, phys_block: u32, num: u32) -> Result<()> {
        self.fill_blocks(phys_block, num).await
    }

    async fn reset(
        &mut self,
        block_hint: u32,
        progress: Option<&(dyn Fn(u32) + Send + Sync)>,
    ) -> Result<()> {
        let total = block_hint.min(self.geometry.physical_blocks);
        let erase_blocks = self.geometry.erase_blocks().max(1);
        let mut erased = 0;
        while erased < total {
            let num = erase_blocks.min(self.geometry.physical_blocks - erased);
            self.fill_blocks(erased, num).await?;
            erased += num;
            if let Some(progress) = progress {
                progress(erased);
            }
        }
        self.file.sync_all().await?;
        log::debug!("Reset {} blocks of {}", erased, self.path.display());
        Ok(())
    }
}

/// Number of whole blocks in an image of `size` bytes
fn physical_blocks_for(size: u64, block_size: u16) -> Result<u32> {
    if block_size == 0 {
        return Err(BackendError::InvalidLength(0));
    }
    let blocks = size / block_size as u64;
    match u32::try_from(blocks) {
        Ok(0) => Err(BackendError::OutOfRange { offset: 0, len: block_size as usize }),
        Ok(blocks) => Ok(blocks),
        Err(_) => Err(BackendError::OutOfRange {
            offset: size,
            len: block_size as usize,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config() -> FileBackendConfig {
        FileBackendConfig {
            block_size: 512,
            erase_size: 1024,
            ..FileBackendConfig::default()
        }
    }

    #[test]
    fn test_physical_blocks_for_image_size() {
        assert_eq!(physical_blocks_for(8 * 512 + 100, 512).unwrap(), 8);
        assert!(matches!(
            physical_blocks_for(100, 512),
            Err(BackendError::OutOfRange { offset: 0, .. })
        ));
        assert!(matches!(physical_blocks_for(4096, 0), Err(BackendError::InvalidLength(0))));

        // Block counts past u32 must not wrap to a small medium
        let oversized = (u32::MAX as u64 + 1) * 512 + 512;
        assert!(matches!(
            physical_blocks_for(oversized, 512),
            Err(BackendError::OutOfRange { .. })
        ));
        assert_eq!(
            physical_blocks_for(u32::MAX as u64 * 512, 512).unwrap(),
            u32::MAX
        );
    }

    #[tokio::test]
    async fn test_file_backend_operations() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_image.bin");

        let mut backend = FileBackend::create(&file_path, &config(), 8).await.unwrap();
        assert_eq!(backend.geometry().physical_blocks, 8);
        assert_eq!(backend.geometry().logical_blocks, 8 * 254);

        // Freshly created images read back as erased
        let mut header = [0u8; 2];
        backend.read(7, 0, &mut header).await.unwrap();
        assert_eq!(header, [0xFF, 0xFF]);

        for i in 0..8u32 {
            let data = [i as u8; 512];
            backend.write(i, 0x10, &data).await.unwrap();

            let mut read_data = [0u8; 512];
            backend.read(i, 0, &mut read_data).await.unwrap();
            assert_eq!(data, read_data);
        }

        backend.erase(2, 2).await.unwrap();
        let mut buf = [0u8; 1024];
        backend.read(2, 0, &mut buf).await.unwrap();
        assert!(buf.iter().all(|b| *b == 0xFF));
    }

    #[tokio::test]
    async fn test_reopen_and_read_only() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_read_only.bin");

        let mut backend = FileBackend::create(&file_path, &config(), 4).await.unwrap();
        backend.write(0, 0x10, &[0x55; 512]).await.unwrap();
        backend.sync().await.unwrap();
        drop(backend);

        let mut read_only = FileBackend::open(&file_path, &config(), true).await.unwrap();
        assert_eq!(read_only.geometry().physical_blocks, 4);

        let mut read_buf = [0u8; 512];
        read_only.read(0, 0, &mut read_buf).await.unwrap();
        assert_eq!(read_buf, [0x55; 512]);

        let write_result = read_only.write(0, 0x10, &[0u8; 512]).await;
        assert!(matches!(write_result, Err(BackendError::ReadOnly)));
    }

    #[tokio::test]
    async fn test_reset_progress() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test_reset.bin");

        let mut backend = FileBackend::create(&file_path, &config(), 6).await.unwrap();
        for i in 0..6 {
            backend.write(i, 0x10, &[0x01; 512]).await.unwrap();
        }

        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress = move |blocks: u32| sink.lock().push(blocks);
        backend.reset(3, Some(&progress)).await.unwrap();
        assert_eq!(*seen.lock(), vec![2, 4]);

        let mut buf = [0u8; 512];
        backend.read(3, 0, &mut buf).await.unwrap();
        assert_eq!(buf, [0xFF; 512]);
        backend.read(4, 0, &mut buf).await.unwrap();
        assert_eq!(buf, [0x01; 512]);
    }
}

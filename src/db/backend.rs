use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::primitives::io::{FileIo, MemFileIo, StdFileIo};
use crate::types::Result;

const WAL_FILE: &str = "engram.wal";
const CHECKPOINT_FILE: &str = "engram.ckpt";
const CHECKPOINT_TMP: &str = "engram.ckpt.tmp";

/// Where the WAL and checkpoint image live.
pub trait StorageBackend: Send + Sync {
    /// Positioned I/O handle for the WAL.
    fn wal_io(&self) -> Result<Arc<dyn FileIo>>;
    /// Latest checkpoint image, if one was written.
    fn read_checkpoint(&self) -> Result<Option<Vec<u8>>>;
    /// Atomically replaces the checkpoint image.
    fn write_checkpoint(&self, bytes: &[u8]) -> Result<()>;
    /// Human-readable location for logs.
    fn describe(&self) -> String;
}

/// Files under a data directory.
pub struct DiskBackend {
    dir: PathBuf,
}

impl DiskBackend {
    /// Uses `dir`, creating it when missing.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Data directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the WAL file.
    pub fn wal_path(&self) -> PathBuf {
        self.dir.join(WAL_FILE)
    }

    /// Path of the checkpoint file.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    fn sync_dir(&self) -> Result<()> {
        #[cfg(unix)]
        {
            File::open(&self.dir)?.sync_all()?;
        }
        Ok(())
    }
}

impl StorageBackend for DiskBackend {
    fn wal_io(&self) -> Result<Arc<dyn FileIo>> {
        Ok(Arc::new(StdFileIo::open(self.wal_path())?))
    }

    fn read_checkpoint(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(self.checkpoint_path()) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write_checkpoint(&self, bytes: &[u8]) -> Result<()> {
        let tmp = self.dir.join(CHECKPOINT_TMP);
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.checkpoint_path())?;
        self.sync_dir()?;
        debug!(bytes = bytes.len(), dir = %self.dir.display(), "backend.checkpoint.written");
        Ok(())
    }

    fn describe(&self) -> String {
        self.dir.display().to_string()
    }
}

/// In-memory backend used by tests and embedded ephemeral databases.
///
/// The WAL distinguishes written from synced bytes, so [`MemoryBackend::crash_image`]
/// reproduces what a power loss would leave behind.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    wal: MemFileIo,
    checkpoint: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryBackend {
    /// Empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend holding only durable state: synced WAL bytes and the last
    /// completed checkpoint.
    pub fn crash_image(&self) -> MemoryBackend {
        MemoryBackend {
            wal: self.wal.crash_image(),
            checkpoint: Arc::new(Mutex::new(self.checkpoint.lock().clone())),
        }
    }

    /// Underlying WAL file, for corruption tests.
    pub fn wal_file(&self) -> &MemFileIo {
        &self.wal
    }
}

impl StorageBackend for MemoryBackend {
    fn wal_io(&self) -> Result<Arc<dyn FileIo>> {
        Ok(Arc::new(self.wal.clone()))
    }

    fn read_checkpoint(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.checkpoint.lock().clone())
    }

    fn write_checkpoint(&self, bytes: &[u8]) -> Result<()> {
        *self.checkpoint.lock() = Some(bytes.to_vec());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn disk_checkpoint_replaces_atomically() {
        let dir = tempdir().unwrap();
        let backend = DiskBackend::open(dir.path().join("data")).unwrap();
        assert!(backend.read_checkpoint().unwrap().is_none());
        backend.write_checkpoint(b"first").unwrap();
        backend.write_checkpoint(b"second").unwrap();
        assert_eq!(backend.read_checkpoint().unwrap().unwrap(), b"second".to_vec());
        assert!(!dir.path().join("data").join(CHECKPOINT_TMP).exists());
    }

    #[test]
    fn memory_crash_image_keeps_checkpoint() {
        let backend = MemoryBackend::new();
        backend.write_checkpoint(b"image").unwrap();
        let io = backend.wal_io().unwrap();
        io.write_at(0, b"unsynced").unwrap();
        let after = backend.crash_image();
        assert_eq!(after.read_checkpoint().unwrap().unwrap(), b"image".to_vec());
        assert_eq!(after.wal_io().unwrap().len().unwrap(), 0);
    }
}

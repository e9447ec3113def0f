#![forbid(unsafe_code)]

use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind},
    path::Path,
    sync::Arc,
};

use parking_lot::Mutex;

use crate::types::{EngineError, Result};

/// Positioned file I/O used by the WAL.
pub trait FileIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes at `off`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Flushes written data to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current length in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file.
    fn truncate(&self, len: u64) -> Result<()>;
}

/// File-backed implementation over a shared `File` handle.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
    #[cfg(not(unix))]
    cursor: Arc<Mutex<()>>,
}

impl StdFileIo {
    /// Opens or creates a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            inner: Arc::new(file),
            #[cfg(not(unix))]
            cursor: Arc::new(Mutex::new(())),
        })
    }

    #[cfg(unix)]
    fn read_exact(&self, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        while !dst.is_empty() {
            let read = self.inner.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "read_at reached EOF"));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.inner.write_all_at(src, off)
    }

    #[cfg(not(unix))]
    fn read_exact(&self, off: u64, dst: &mut [u8]) -> io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let _guard = self.cursor.lock();
        let mut file = &*self.inner;
        file.seek(SeekFrom::Start(off))?;
        file.read_exact(dst)
    }

    #[cfg(not(unix))]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let _guard = self.cursor.lock();
        let mut file = &*self.inner;
        file.seek(SeekFrom::Start(off))?;
        file.write_all(src)
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.read_exact(off, dst).map_err(EngineError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.write_all(off, src).map_err(EngineError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_data().map_err(EngineError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.set_len(len).map_err(EngineError::from)
    }
}

#[derive(Default)]
struct MemFileState {
    /// Bytes as seen by readers of the running process.
    current: Vec<u8>,
    /// Bytes that survived the last `sync_all`.
    durable: Vec<u8>,
    syncs: u64,
    failing_syncs: u32,
}

/// In-memory file that separates written bytes from synced bytes, so a test
/// can model a process or OS crash by keeping only what was flushed.
#[derive(Clone, Default)]
pub struct MemFileIo {
    state: Arc<Mutex<MemFileState>>,
}

impl MemFileIo {
    /// Creates an empty in-memory file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new file holding only the bytes that were synced, as a
    /// machine restart would observe.
    pub fn crash_image(&self) -> MemFileIo {
        let state = self.state.lock();
        MemFileIo {
            state: Arc::new(Mutex::new(MemFileState {
                current: state.durable.clone(),
                durable: state.durable.clone(),
                syncs: 0,
                failing_syncs: 0,
            })),
        }
    }

    /// Number of `sync_all` calls observed.
    pub fn sync_count(&self) -> u64 {
        self.state.lock().syncs
    }

    /// Makes the next `count` calls to `sync_all` fail with an I/O error,
    /// leaving the durable bytes untouched.
    pub fn fail_next_syncs(&self, count: u32) {
        self.state.lock().failing_syncs = count;
    }

    /// Raw copy of the current contents.
    pub fn snapshot_bytes(&self) -> Vec<u8> {
        self.state.lock().current.clone()
    }

    /// Overwrites the current contents, bypassing the WAL. Test hook for
    /// torn-write and bit-flip scenarios.
    pub fn replace_bytes(&self, bytes: Vec<u8>) {
        let mut state = self.state.lock();
        state.durable = bytes.clone();
        state.current = bytes;
    }
}

impl FileIo for MemFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        let start = off as usize;
        let end = start + dst.len();
        if end > state.current.len() {
            return Err(EngineError::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "read past end of in-memory file",
            )));
        }
        dst.copy_from_slice(&state.current[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let start = off as usize;
        let end = start + src.len();
        if state.current.len() < end {
            state.current.resize(end, 0);
        }
        state.current[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_syncs > 0 {
            state.failing_syncs -= 1;
            return Err(EngineError::Io(io::Error::new(
                ErrorKind::Other,
                "injected sync failure",
            )));
        }
        state.durable = state.current.clone();
        state.syncs += 1;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.state.lock().current.len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.current.resize(len as usize, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("io.bin")).unwrap();
        let payload = b"hello mundo";
        io.write_at(0, payload).unwrap();
        io.sync_all().unwrap();
        let mut buf = vec![0u8; payload.len()];
        io.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, payload);
        assert_eq!(io.len().unwrap(), payload.len() as u64);
    }

    #[test]
    fn read_past_eof_returns_error() {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("io.bin")).unwrap();
        let mut buf = [0u8; 8];
        match io.read_at(0, &mut buf).unwrap_err() {
            EngineError::Io(inner) => assert_eq!(inner.kind(), ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn crash_image_keeps_only_synced_bytes() {
        let io = MemFileIo::new();
        io.write_at(0, b"durable").unwrap();
        io.sync_all().unwrap();
        io.write_at(7, b"-volatile").unwrap();
        assert_eq!(io.len().unwrap(), 16);
        let after = io.crash_image();
        assert_eq!(after.snapshot_bytes(), b"durable".to_vec());
        assert_eq!(io.sync_count(), 1);
    }
}

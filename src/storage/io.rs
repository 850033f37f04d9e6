//! Positional file I/O.
//!
//! A thin platform wrapper over `std::fs::File`: positional reads and writes
//! that do not disturb a shared cursor, plus flush-to-disk. Unix gets the
//! `pread`/`pwrite` family through `FileExt`; Windows uses `seek_read` and
//! `seek_write` loops.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// An open store file with positional access.
pub struct StoreFile {
    file: File,
}

impl StoreFile {
    /// Creates (or truncates) the file for read/write access.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file })
    }

    /// Opens an existing file.
    pub fn open(path: &Path, read_only: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        Ok(Self { file })
    }

    #[cfg(unix)]
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(unix)]
    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)
    }

    #[cfg(windows)]
    pub fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.file.seek_read(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "read past end of file",
                    ))
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    #[cfg(windows)]
    pub fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.file.seek_write(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned zero"))
                }
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Flushes file contents and metadata to stable storage.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_read_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("io.bin");
        let file = StoreFile::create(&path).unwrap();

        file.write_all_at(b"hello", 100).unwrap();
        file.write_all_at(b"world", 0).unwrap();

        let mut buf = [0u8; 5];
        file.read_exact_at(&mut buf, 100).unwrap();
        assert_eq!(&buf, b"hello");
        file.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn read_past_eof_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("io.bin");
        let file = StoreFile::create(&path).unwrap();
        file.write_all_at(b"abc", 0).unwrap();

        let mut buf = [0u8; 8];
        let err = file.read_exact_at(&mut buf, 0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}

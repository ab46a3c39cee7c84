//! Backing files on local disk

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::download::RangeSink;

/// A local file holding cached content
pub struct BackingFile {
    path: PathBuf,
    file: File,
}

impl BackingFile {
    /// Open the backing file at `path`, creating it if needed
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn set_len(&self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }

    /// Read up to `length` bytes at `offset`, fewer at end of file
    pub fn read(&self, offset: u64, length: u64) -> io::Result<Bytes> {
        let mut buffer = vec![0u8; length as usize];
        let mut filled = 0;

        while filled < buffer.len() {
            match self.file.read_at(&mut buffer[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        buffer.truncate(filled);
        Ok(Bytes::from(buffer))
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, offset)
    }

    /// The first `size` bytes of the file
    pub fn snapshot(&self, size: u64) -> io::Result<Bytes> {
        self.read(0, size)
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

impl RangeSink for BackingFile {
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.write(offset, data)
    }

    fn read_at(&self, offset: u64, length: u64) -> io::Result<Bytes> {
        self.read(offset, length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_writes_and_short_reads() {
        let dir = tempfile::tempdir().unwrap();
        let file = BackingFile::open(&dir.path().join("nested").join("f.bin")).unwrap();

        file.write(4, b"tail").unwrap();
        assert_eq!(file.len().unwrap(), 8);
        assert_eq!(&file.read(0, 8).unwrap()[..], b"\0\0\0\0tail");
        assert_eq!(&file.read(6, 100).unwrap()[..], b"il");

        file.set_len(2).unwrap();
        assert!(file.read(4, 4).unwrap().is_empty());
    }
}

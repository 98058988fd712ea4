// Backends are where the bytes of a transfer come from and go to.
//
// Sessions only ever talk to the Reader and Writer traits. The filesystem implementations below
// are what the server uses; anything else (in-memory images, generated boot configs) can plug in
// by implementing the traits. Backend calls are synchronous: a backend sitting on slow storage is
// responsible for its own off-loading.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Source of the data sent to a peer.
pub trait Reader: Send {
    /// Reads up to `size` bytes. Returning fewer than `size` bytes means the data is exhausted.
    fn read(&mut self, size: usize) -> io::Result<Vec<u8>>;

    /// Total size in bytes, if known up front.
    fn size(&self) -> Option<u64> {
        None
    }

    /// Called exactly once when the transfer ends, however it ends.
    fn finish(&mut self);
}

/// Destination of the data received from a peer.
pub trait Writer: Send {
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Called before `finish` when the transfer failed; partial output should be discarded.
    fn cancel(&mut self) {}

    /// Called exactly once when the transfer ends, however it ends.
    fn finish(&mut self);
}

/// Reads a file from disk.
#[derive(Debug)]
pub struct FilesystemReader {
    path: PathBuf,
    file: Option<File>,
    size: u64,
}

impl FilesystemReader {
    pub fn open(path: &Path) -> io::Result<FilesystemReader> {
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a regular file", path.display()),
            ));
        }
        Ok(FilesystemReader {
            path: path.to_path_buf(),
            file: Some(file),
            size: metadata.len(),
        })
    }
}

impl Reader for FilesystemReader {
    fn read(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let file = self.file.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "Reader has already been finished")
        })?;
        let mut buf = vec![0_u8; size];
        let mut cursor = 0;

        // A single call to read is not guaranteed to fill the buffer, so keep reading into the
        // rest of it until it is full or the file runs out.
        while cursor < buf.len() {
            match file.read(&mut buf[cursor..]) {
                Ok(0) => break,
                Ok(n) => cursor += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(cursor);
        Ok(buf)
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn finish(&mut self) {
        if self.file.take().is_some() {
            log::debug!("Finished reading {}", self.path.display());
        }
    }
}

/// Writes a file to disk.
///
/// Data goes to a hidden temporary file next to the destination and only replaces the
/// destination once the transfer has finished cleanly, so a failed upload never leaves a
/// truncated file behind.
#[derive(Debug)]
pub struct FilesystemWriter {
    destination: PathBuf,
    partial: PathBuf,
    file: Option<File>,
    cancelled: bool,
}

impl FilesystemWriter {
    pub fn create(destination: &Path) -> io::Result<FilesystemWriter> {
        if destination.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", destination.display()),
            ));
        }
        let name = destination
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Destination has no file name"))?;
        let partial = destination.with_file_name(format!(".{}.part", name.to_string_lossy()));
        let file = File::options().write(true).create_new(true).open(&partial)?;
        log::info!("Writing to {:#?}", destination);

        Ok(FilesystemWriter {
            destination: destination.to_path_buf(),
            partial,
            file: Some(file),
            cancelled: false,
        })
    }
}

impl Writer for FilesystemWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(data),
            None => Err(io::Error::new(io::ErrorKind::Other, "Writer has already been finished")),
        }
    }

    fn cancel(&mut self) {
        self.cancelled = true;
    }

    fn finish(&mut self) {
        let Some(mut file) = self.file.take() else {
            return;
        };
        if !self.cancelled {
            let committed = file.flush().and_then(|_| fs::rename(&self.partial, &self.destination));
            match committed {
                Ok(()) => return,
                Err(e) => log::warn!("Could not move {} into place: {e}", self.destination.display()),
            }
        }
        drop(file);
        if let Err(e) = fs::remove_file(&self.partial) {
            log::warn!("Could not remove {}: {e}", self.partial.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_reader_invalid_path() {
        assert_eq!(
            FilesystemReader::open(Path::new("/some/invalid/file.txt"))
                .err()
                .unwrap()
                .kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn test_reader_refuses_directories() {
        let tmpdir = TempDir::new("scratch").unwrap();
        assert!(FilesystemReader::open(tmpdir.path()).is_err());
    }

    #[test]
    fn test_reader_reads_blocks_and_reports_size() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("test.txt");
        fs::write(&path, b"line1\nline2\nanotherline").unwrap();

        let mut reader = FilesystemReader::open(&path).unwrap();
        assert_eq!(reader.size(), Some(23));
        assert_eq!(reader.read(5).unwrap(), b"line1".to_vec());
        assert_eq!(reader.read(5).unwrap(), b"\nline".to_vec());
        assert_eq!(reader.read(512).unwrap(), b"2\nanotherline".to_vec());
        assert_eq!(reader.read(512).unwrap(), Vec::<u8>::new());

        reader.finish();
        assert!(reader.read(5).is_err());
    }

    #[test]
    fn test_writer_commits_on_finish() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("upload.bin");

        let mut writer = FilesystemWriter::create(&path).unwrap();
        writer.write(b"foobar").unwrap();
        writer.write(b"baz").unwrap();
        assert!(!path.exists());

        writer.finish();
        assert_eq!(fs::read(&path).unwrap(), b"foobarbaz".to_vec());
        assert_eq!(fs::read_dir(tmpdir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_writer_discards_when_cancelled() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("upload.bin");

        let mut writer = FilesystemWriter::create(&path).unwrap();
        writer.write(b"partial").unwrap();
        writer.cancel();
        writer.finish();

        assert!(!path.exists());
        assert_eq!(fs::read_dir(tmpdir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_writer_refuses_existing_file() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("exists.txt");
        fs::write(&path, b"keep me").unwrap();

        assert_eq!(
            FilesystemWriter::create(&path).err().unwrap().kind(),
            io::ErrorKind::AlreadyExists
        );
        assert_eq!(fs::read(&path).unwrap(), b"keep me".to_vec());
    }

    #[test]
    fn test_writer_invalid_path() {
        assert_eq!(
            FilesystemWriter::create(Path::new("/some/invalid/path.txt"))
                .err()
                .unwrap()
                .kind(),
            io::ErrorKind::NotFound
        );
    }
}

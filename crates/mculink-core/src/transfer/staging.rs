//! On-disk staging for received transfer data.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

/// Append-only byte store backed by an anonymous temporary file.
///
/// Keeps memory flat no matter how large a transfer grows. The file is
/// removed by the OS once the buffer is dropped.
#[derive(Debug)]
pub struct StagingBuffer {
    file: File,
    len: u64,
}

impl StagingBuffer {
    /// Create a buffer in the system temp directory, or in `dir` if given.
    pub fn new(dir: Option<&Path>) -> io::Result<Self> {
        let file = match dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        Ok(Self { file, len: 0 })
    }

    pub fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(data)?;
        self.len += data.len() as u64;
        Ok(())
    }

    pub fn clear(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.len = 0;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read back everything staged so far.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len as usize);
        self.file.seek(SeekFrom::Start(0))?;
        (&mut self.file).take(self.len).read_to_end(&mut out)?;
        Ok(out)
    }

    /// Copy the staged bytes to `path`, replacing any existing file.
    pub fn save_to(&mut self, path: &Path) -> io::Result<u64> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut dst = File::create(path)?;
        let copied = io::copy(&mut (&mut self.file).take(self.len), &mut dst)?;
        dst.flush()?;
        debug!(path = %path.display(), bytes = copied, "Staging buffer saved");
        Ok(copied)
    }
}

/// Where staging files go.
#[derive(Debug, Clone, Default)]
pub struct StagingLocation {
    dir: Option<PathBuf>,
}

impl StagingLocation {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn create(&self) -> io::Result<StagingBuffer> {
        StagingBuffer::new(self.dir.as_deref())
    }
}

//! Creation of the output file. The file is sized once layout knows the image's extent, written
//! through a mutable mapping (with an in-memory fallback for filesystems that won't mmap) and
//! committed exactly once, after all sections and relocations are in place.

use crate::args::Args;
use crate::error::Context as _;
use crate::error::Result;
use memmap2::MmapOptions;
use std::io::Write as _;
use std::ops::Deref;
use std::ops::DerefMut;
use std::path::Path;
use std::path::PathBuf;

pub(crate) struct Output {
    path: PathBuf,
}

pub(crate) struct SizedOutput {
    file: std::fs::File,
    pub(crate) out: OutputBuffer,
    path: PathBuf,
}

pub(crate) enum OutputBuffer {
    Mmap(memmap2::MmapMut),
    InMemory(Vec<u8>),
}

impl Output {
    pub(crate) fn new(args: &Args) -> Output {
        Output {
            path: args.output.clone(),
        }
    }

    /// Creates the output file with its final size. The old output is deleted first; reusing it
    /// would fail if it's currently being executed.
    pub(crate) fn create(&self, file_size: u64) -> Result<SizedOutput> {
        let _ = std::fs::remove_file(&self.path);
        SizedOutput::new(&self.path, file_size)
    }
}

impl SizedOutput {
    fn new(path: &Path, file_size: u64) -> Result<SizedOutput> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to open `{}`", path.display()))?;
        let out = OutputBuffer::new(&file, file_size);
        Ok(SizedOutput {
            file,
            out,
            path: path.to_owned(),
        })
    }

    /// Flushes the buffer to disk, marks the file executable and closes it. Nothing reaches the
    /// filesystem in a partially-written state before this.
    pub(crate) fn commit(mut self) -> Result<()> {
        match &self.out {
            OutputBuffer::Mmap(_) => {}
            OutputBuffer::InMemory(bytes) => self
                .file
                .write_all(bytes)
                .with_context(|| format!("Failed to write to `{}`", self.path.display()))?,
        }
        crate::fs::make_executable(&self.file)
            .with_context(|| format!("Failed to chmod `{}`", self.path.display()))?;
        Ok(())
    }
}

impl OutputBuffer {
    fn new(file: &std::fs::File, file_size: u64) -> OutputBuffer {
        Self::new_mmapped(file, file_size)
            .unwrap_or_else(|| OutputBuffer::InMemory(vec![0; file_size as usize]))
    }

    fn new_mmapped(file: &std::fs::File, file_size: u64) -> Option<OutputBuffer> {
        file.set_len(file_size).ok()?;
        let mmap = unsafe { MmapOptions::new().map_mut(file) }.ok()?;
        Some(OutputBuffer::Mmap(mmap))
    }
}

impl Deref for OutputBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self {
            OutputBuffer::Mmap(mmap) => mmap.deref(),
            OutputBuffer::InMemory(bytes) => bytes.deref(),
        }
    }
}

impl DerefMut for OutputBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            OutputBuffer::Mmap(mmap) => mmap.deref_mut(),
            OutputBuffer::InMemory(bytes) => bytes.deref_mut(),
        }
    }
}

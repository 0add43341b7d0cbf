//! Code for mapping our input files into memory. The mappings are held for the lifetime of the
//! link; everything downstream borrows section contents and symbol names from them.

use crate::args::Args;
use crate::error::Context as _;
use crate::error::Result;
use crate::file_kind::FileKind;
use memmap2::Mmap;
use std::ops::Deref;
use std::path::Path;
use std::path::PathBuf;

pub struct InputData {
    pub(crate) files: Vec<InputFile>,
}

pub(crate) struct InputFile {
    pub(crate) filename: PathBuf,
    pub(crate) kind: FileKind,
    data: FileData,
}

struct FileData {
    bytes: Mmap,
}

impl InputData {
    pub(crate) fn from_args(args: &Args) -> Result<InputData> {
        let files = args
            .inputs
            .iter()
            .map(|path| {
                let data = FileData::new(path)?;
                let kind = FileKind::identify_bytes(&data.bytes)
                    .with_context(|| format!("Failed to parse `{}`", path.display()))?;
                Ok(InputFile {
                    filename: path.clone(),
                    kind,
                    data,
                })
            })
            .collect::<Result<Vec<InputFile>>>()?;
        Ok(InputData { files })
    }
}

impl InputFile {
    pub(crate) fn data(&self) -> &[u8] {
        &self.data.bytes
    }
}

impl FileData {
    fn new(path: &Path) -> Result<FileData> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open input file `{}`", path.display()))?;

        // Safety: this is only safe if the input files aren't modified while we're running. There
        // isn't a way to protect against that, at least on Linux, but the alternative of reading
        // every input up front costs too much for the parts of large libraries that we never
        // touch, so we accept the compromise just like other linkers do.
        let bytes = unsafe { memmap2::MmapOptions::new().map(&file) }
            .with_context(|| format!("Failed to mmap input file `{}`", path.display()))?;

        Ok(FileData { bytes })
    }
}

impl Deref for FileData {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

//! Code for identifying what sort of file we're dealing with based on the bytes of the file.

use crate::error::Result;
use anyhow::bail;
use object::pe;
use object::LittleEndian;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum FileKind {
    /// A relocatable COFF object.
    Coff,
    /// A `!<arch>` archive, i.e. a static library.
    Archive,
    /// A short-form import library member describing one symbol exported from a DLL.
    ImportLibrary,
}

impl FileKind {
    pub(crate) fn identify_bytes(bytes: &[u8]) -> Result<FileKind> {
        if bytes.starts_with(&object::archive::MAGIC) {
            return Ok(FileKind::Archive);
        }
        const HEADER_LEN: usize = size_of::<crate::coff::ImportHeader>();
        if bytes.len() >= HEADER_LEN {
            let header: &crate::coff::ImportHeader = object::from_bytes(&bytes[..HEADER_LEN])
                .map_err(|_| anyhow::anyhow!("Invalid import header"))?
                .0;
            if header.sig1.get(LittleEndian) == pe::IMAGE_FILE_MACHINE_UNKNOWN
                && header.sig2.get(LittleEndian) == 0xffff
            {
                return Ok(FileKind::ImportLibrary);
            }
        }
        if bytes.len() >= 2 {
            let machine = u16::from_le_bytes([bytes[0], bytes[1]]);
            if machine == pe::IMAGE_FILE_MACHINE_AMD64 {
                return Ok(FileKind::Coff);
            }
            if machine != pe::IMAGE_FILE_MACHINE_UNKNOWN {
                bail!("Unsupported machine type 0x{machine:x}, only AMD64 is supported");
            }
        }
        bail!("Couldn't identify file type");
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileKind::Coff => "COFF object",
            FileKind::Archive => "archive",
            FileKind::ImportLibrary => "import library",
        };
        std::fmt::Display::fmt(s, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_archive() {
        assert_eq!(
            FileKind::identify_bytes(b"!<arch>\n").unwrap(),
            FileKind::Archive
        );
    }

    #[test]
    fn identify_object() {
        let mut bytes = vec![0u8; 20];
        bytes[..2].copy_from_slice(&0x8664u16.to_le_bytes());
        assert_eq!(FileKind::identify_bytes(&bytes).unwrap(), FileKind::Coff);
    }

    #[test]
    fn identify_import_library() {
        let mut bytes = vec![0u8; 20];
        bytes[2] = 0xff;
        bytes[3] = 0xff;
        assert_eq!(
            FileKind::identify_bytes(&bytes).unwrap(),
            FileKind::ImportLibrary
        );
    }

    #[test]
    fn reject_other_machines() {
        let mut bytes = vec![0u8; 20];
        bytes[..2].copy_from_slice(&0x14cu16.to_le_bytes());
        assert!(FileKind::identify_bytes(&bytes).is_err());
    }
}

//! The chunk model. Every byte of the output image is owned by exactly one chunk. Chunks either
//! wrap a section of an input object, represent the storage of a common symbol, or are
//! synthesised by the linker for the import tables. Chunks live in a single arena owned by the
//! symbol database and are referred to by `ChunkId`.

use crate::coff;
use crate::parsing::FileId;
use crate::symbol::BodyId;
use object::pe;

/// The subset of section characteristics that propagates to output sections: the three content
/// kinds plus the read/write/execute/shared memory bits.
pub(crate) const PERM_MASK: u32 = 0xF000_00F0;

/// The code bytes of an import thunk: JMP through a 32-bit RIP-relative slot, displacement
/// patched at write time.
pub(crate) const IMPORT_FUNC_DATA: &[u8] = &[0xff, 0x25, 0x00, 0x00, 0x00, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ChunkId(u32);

impl ChunkId {
    pub(crate) fn from_usize(raw: usize) -> ChunkId {
        ChunkId(u32::try_from(raw).expect("chunk count overflowed u32"))
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

pub(crate) struct Chunk<'data> {
    /// Assigned by the layout phase, relative to the output section until the section's own
    /// address is assigned, absolute afterwards.
    pub(crate) rva: u64,
    pub(crate) file_offset: u64,
    pub(crate) alignment: u64,
    pub(crate) kind: ChunkKind<'data>,
}

pub(crate) enum ChunkKind<'data> {
    Section(SectionChunk<'data>),
    Common(CommonChunk),
    String(StringChunk),
    HintName(HintNameChunk),
    Lookup(LookupChunk),
    Directory(DirectoryChunk),
    ImportFunc(ImportFuncChunk),
    Null(NullChunk),
}

/// One section of an input object.
pub(crate) struct SectionChunk<'data> {
    pub(crate) file: FileId,

    /// 1-based section number within the owning object.
    pub(crate) section_number: u32,

    /// The input section name, including any `$suffix`.
    pub(crate) name: &'data [u8],

    /// Raw contents; empty for uninitialized sections.
    pub(crate) data: &'data [u8],

    pub(crate) relocations: &'data [coff::Relocation],
    pub(crate) characteristics: u32,
    pub(crate) size: u64,
    pub(crate) live: bool,
    pub(crate) is_assoc_child: bool,

    /// Sections whose liveness follows ours, declared via section-definition aux records.
    pub(crate) assoc_children: Vec<ChunkId>,
}

/// Storage for a common symbol. Uninitialized, read-write.
pub(crate) struct CommonChunk {
    pub(crate) size: u64,
}

/// A zero-terminated, even-padded string (DLL names).
pub(crate) struct StringChunk {
    pub(crate) data: Vec<u8>,
}

/// A 2-byte hint of zero followed by a zero-terminated symbol name, padded to an even size.
pub(crate) struct HintNameChunk {
    pub(crate) data: Vec<u8>,
}

/// An 8-byte slot in the import lookup or address table. At write time it holds the RVA of its
/// hint/name entry.
pub(crate) struct LookupChunk {
    pub(crate) hint_name: ChunkId,
}

/// An import directory table entry; its three RVA fields are patched at write time from the
/// chunks it references.
pub(crate) struct DirectoryChunk {
    pub(crate) dll_name: ChunkId,
    pub(crate) lookup_table: ChunkId,
    pub(crate) address_table: ChunkId,
}

/// The JMP thunk behind a `DefinedImportFunc`.
pub(crate) struct ImportFuncChunk {
    /// The `DefinedImportData` body whose import address table slot we jump through.
    pub(crate) import_data: BodyId,
}

/// A zero-filled terminator entry.
pub(crate) struct NullChunk {
    pub(crate) size: u64,
}

impl<'data> Chunk<'data> {
    pub(crate) fn section(
        file: FileId,
        section_number: u32,
        name: &'data [u8],
        data: &'data [u8],
        relocations: &'data [coff::Relocation],
        characteristics: u32,
        size: u64,
    ) -> Chunk<'data> {
        Chunk {
            alignment: section_alignment(characteristics),
            kind: ChunkKind::Section(SectionChunk {
                file,
                section_number,
                name,
                data,
                relocations,
                characteristics,
                size,
                live: false,
                is_assoc_child: false,
                assoc_children: Vec::new(),
            }),
            ..Chunk::default()
        }
    }

    pub(crate) fn common(size: u64) -> Chunk<'data> {
        Chunk {
            kind: ChunkKind::Common(CommonChunk { size }),
            ..Chunk::default()
        }
    }

    pub(crate) fn string(value: &[u8]) -> Chunk<'data> {
        let mut data = vec![0; (value.len() + 1).next_multiple_of(2)];
        data[..value.len()].copy_from_slice(value);
        Chunk {
            kind: ChunkKind::String(StringChunk { data }),
            ..Chunk::default()
        }
    }

    pub(crate) fn hint_name(name: &[u8]) -> Chunk<'data> {
        let mut data = vec![0; (name.len() + 3).next_multiple_of(2)];
        data[2..2 + name.len()].copy_from_slice(name);
        Chunk {
            kind: ChunkKind::HintName(HintNameChunk { data }),
            ..Chunk::default()
        }
    }

    pub(crate) fn lookup(hint_name: ChunkId) -> Chunk<'data> {
        Chunk {
            kind: ChunkKind::Lookup(LookupChunk { hint_name }),
            ..Chunk::default()
        }
    }

    pub(crate) fn directory(
        dll_name: ChunkId,
        lookup_table: ChunkId,
        address_table: ChunkId,
    ) -> Chunk<'data> {
        Chunk {
            kind: ChunkKind::Directory(DirectoryChunk {
                dll_name,
                lookup_table,
                address_table,
            }),
            ..Chunk::default()
        }
    }

    pub(crate) fn import_func(import_data: BodyId) -> Chunk<'data> {
        Chunk {
            kind: ChunkKind::ImportFunc(ImportFuncChunk { import_data }),
            ..Chunk::default()
        }
    }

    pub(crate) fn null(size: u64) -> Chunk<'data> {
        Chunk {
            kind: ChunkKind::Null(NullChunk { size }),
            ..Chunk::default()
        }
    }

    pub(crate) fn size(&self) -> u64 {
        match &self.kind {
            ChunkKind::Section(s) => s.size,
            ChunkKind::Common(c) => c.size,
            ChunkKind::String(s) => s.data.len() as u64,
            ChunkKind::HintName(h) => h.data.len() as u64,
            ChunkKind::Lookup(_) => 8,
            ChunkKind::Directory(_) => size_of::<coff::ImportDirectoryEntry>() as u64,
            ChunkKind::ImportFunc(_) => IMPORT_FUNC_DATA.len() as u64,
            ChunkKind::Null(n) => n.size,
        }
    }

    /// The initial bytes to copy into the output, if any. Chunks whose contents are produced
    /// entirely by write-time patching (lookup slots, directory entries) return None and rely on
    /// the output buffer being zeroed.
    pub(crate) fn initial_contents(&self) -> Option<&[u8]> {
        match &self.kind {
            ChunkKind::Section(s) if !self.is_bss() => Some(s.data),
            ChunkKind::String(s) => Some(&s.data),
            ChunkKind::HintName(h) => Some(&h.data),
            ChunkKind::ImportFunc(_) => Some(IMPORT_FUNC_DATA),
            _ => None,
        }
    }

    pub(crate) fn permissions(&self) -> u32 {
        match &self.kind {
            ChunkKind::Section(s) => s.characteristics & PERM_MASK,
            ChunkKind::Common(_) => {
                pe::IMAGE_SCN_CNT_UNINITIALIZED_DATA
                    | pe::IMAGE_SCN_MEM_READ
                    | pe::IMAGE_SCN_MEM_WRITE
            }
            _ => 0,
        }
    }

    pub(crate) fn is_bss(&self) -> bool {
        match &self.kind {
            ChunkKind::Section(s) => {
                s.characteristics & pe::IMAGE_SCN_CNT_UNINITIALIZED_DATA != 0
            }
            ChunkKind::Common(_) => true,
            _ => false,
        }
    }

    /// The name used to group object chunks into output sections. Only section and common chunks
    /// take part in grouping; synthetic chunks are placed explicitly.
    pub(crate) fn section_name(&self) -> &'data [u8] {
        match &self.kind {
            ChunkKind::Section(s) => s.name,
            ChunkKind::Common(_) => b".bss",
            _ => b"",
        }
    }

    /// A liveness root is a section that is not COMDAT, not an associative child and not code.
    /// Everything else must be reached through a relocation or an associative edge.
    pub(crate) fn is_root(&self) -> bool {
        match &self.kind {
            ChunkKind::Section(s) => {
                !s.is_comdat()
                    && !s.is_assoc_child
                    && s.characteristics & pe::IMAGE_SCN_CNT_CODE == 0
            }
            _ => false,
        }
    }

    /// Only section chunks can be garbage collected; everything else is always live.
    pub(crate) fn is_live(&self) -> bool {
        match &self.kind {
            ChunkKind::Section(s) => s.live,
            _ => true,
        }
    }
}

impl<'data> SectionChunk<'data> {
    pub(crate) fn is_comdat(&self) -> bool {
        self.characteristics & pe::IMAGE_SCN_LNK_COMDAT != 0
    }
}

impl Default for Chunk<'_> {
    fn default() -> Self {
        Chunk {
            rva: 0,
            file_offset: 0,
            alignment: 1,
            kind: ChunkKind::Null(NullChunk { size: 0 }),
        }
    }
}

/// Decodes the IMAGE_SCN_ALIGN field. A value of zero means the object didn't record an
/// alignment, which we treat as byte alignment.
pub(crate) fn section_alignment(characteristics: u32) -> u64 {
    let shift = (characteristics & 0x00F0_0000) >> 20;
    if shift == 0 { 1 } else { 1 << (shift - 1) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_decoding() {
        assert_eq!(section_alignment(pe::IMAGE_SCN_ALIGN_1BYTES), 1);
        assert_eq!(section_alignment(pe::IMAGE_SCN_ALIGN_16BYTES), 16);
        assert_eq!(section_alignment(pe::IMAGE_SCN_ALIGN_8192BYTES), 8192);
        assert_eq!(section_alignment(0), 1);
    }

    #[test]
    fn string_and_hint_name_padding() {
        // "abc" plus terminator rounds up to 4 bytes.
        assert_eq!(Chunk::string(b"abc").size(), 4);
        assert_eq!(Chunk::string(b"abcd").size(), 6);
        // Two hint bytes, the name, a terminator, rounded up to even.
        assert_eq!(Chunk::hint_name(b"puts").size(), 8);
        assert_eq!(Chunk::hint_name(b"yield").size(), 8);
        let chunk = Chunk::hint_name(b"puts");
        let ChunkKind::HintName(hint) = &chunk.kind else {
            unreachable!()
        };
        assert_eq!(&hint.data[..6], b"\0\0puts");
    }

    #[test]
    fn import_thunk_shape() {
        let chunk = Chunk::import_func(BodyId::from_usize(0));
        assert_eq!(chunk.size(), 6);
        assert_eq!(&chunk.initial_contents().unwrap()[..2], &[0xff, 0x25]);
    }
}

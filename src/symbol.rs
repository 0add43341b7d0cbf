//! Symbol bodies. A `SymbolBody` is the per-file record of a definition or reference; the symbol
//! database maps each name to a cell holding the current best body for that name. Bodies are
//! arena-allocated and referred to by `BodyId`; cells by `SymbolId`.

use crate::chunks::ChunkId;
use crate::parsing::FileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BodyId(u32);

impl BodyId {
    pub(crate) fn from_usize(raw: usize) -> BodyId {
        BodyId(u32::try_from(raw).expect("symbol body count overflowed u32"))
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// An index into the symbol database's cell table. There is one cell per distinct global name,
/// plus one anonymous cell per local symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SymbolId(u32);

impl SymbolId {
    pub(crate) fn from_usize(raw: usize) -> SymbolId {
        SymbolId(u32::try_from(raw).expect("symbol count overflowed u32"))
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

pub(crate) enum SymbolBody<'data> {
    /// An unresolved reference, optionally with a weak alias to fall back to.
    Undefined(Undefined<'data>),

    /// A fixed virtual address with no backing chunk.
    DefinedAbsolute(DefinedAbsolute<'data>),

    /// A definition backed by a section or common chunk.
    DefinedRegular(DefinedRegular<'data>),

    /// A `__imp_`-prefixed symbol resolving to an import address table slot.
    DefinedImportData(DefinedImportData<'data>),

    /// A thunk that jumps through an import address table slot.
    DefinedImportFunc(DefinedImportFunc<'data>),

    /// A symbol that an archive can define if asked to; names the member to load.
    Lazy(Lazy<'data>),
}

pub(crate) struct Undefined<'data> {
    pub(crate) name: &'data [u8],

    /// The owning file and symbol-table index of the alias, for weak externals. Resolved through
    /// the file's sparse cell table once resolution has finished.
    pub(crate) weak_alias: Option<(FileId, u32)>,
}

pub(crate) struct DefinedAbsolute<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) va: u64,
}

pub(crate) struct DefinedRegular<'data> {
    pub(crate) name: &'data [u8],

    /// Offset of the symbol within its chunk. Zero for common symbols, whose chunk is dedicated
    /// storage.
    pub(crate) value: u32,

    pub(crate) chunk: ChunkId,
}

pub(crate) struct DefinedImportData<'data> {
    /// The resolution name, `__imp_` + export name.
    pub(crate) name: &'data [u8],
    pub(crate) dll_name: &'data [u8],
    pub(crate) export_name: &'data [u8],

    /// Bound to an import address table slot when the import tables are built.
    pub(crate) location: Option<ChunkId>,
}

pub(crate) struct DefinedImportFunc<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) chunk: ChunkId,
}

pub(crate) struct Lazy<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) file: FileId,
    pub(crate) member_offset: usize,
}

impl<'data> SymbolBody<'data> {
    pub(crate) fn name(&self) -> &'data [u8] {
        match self {
            SymbolBody::Undefined(s) => s.name,
            SymbolBody::DefinedAbsolute(s) => s.name,
            SymbolBody::DefinedRegular(s) => s.name,
            SymbolBody::DefinedImportData(s) => s.name,
            SymbolBody::DefinedImportFunc(s) => s.name,
            SymbolBody::Lazy(s) => s.name,
        }
    }

    /// The resolution partial order: an incoming body replaces the current one iff it has
    /// strictly higher rank. Ties between defined bodies are resolved by the symbol database
    /// (COMDAT, common merging) or reported as duplicates.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            SymbolBody::Undefined(_) => 0,
            SymbolBody::Lazy(_) => 1,
            _ => 2,
        }
    }

    pub(crate) fn is_defined(&self) -> bool {
        self.rank() == 2
    }

    /// The chunk backing this body, if any. Used by the liveness mark.
    pub(crate) fn chunk(&self) -> Option<ChunkId> {
        match self {
            SymbolBody::DefinedRegular(s) => Some(s.chunk),
            SymbolBody::DefinedImportFunc(s) => Some(s.chunk),
            _ => None,
        }
    }
}

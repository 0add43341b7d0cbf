//! Turns the bytes of an input file into chunks and symbol bodies. Objects produce a 1-based
//! sparse chunk table (section numbers index it directly) and one body per symbol-table entry
//! that survives filtering. Import libraries produce the pair of bodies that describe one DLL
//! export. Archives produce a lazy body per index entry.

use crate::archive::ArchiveFile;
use crate::chunks::Chunk;
use crate::chunks::ChunkId;
use crate::coff;
use crate::coff::CoffSymbol as _;
use crate::error::Context as _;
use crate::error::Result;
use crate::symbol::BodyId;
use crate::symbol::DefinedAbsolute;
use crate::symbol::DefinedImportData;
use crate::symbol::DefinedImportFunc;
use crate::symbol::DefinedRegular;
use crate::symbol::Lazy;
use crate::symbol::SymbolBody;
use crate::symbol::SymbolId;
use crate::symbol::Undefined;
use crate::symbol_db::SymbolDb;
use object::pe;
use object::LittleEndian;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FileId(u32);

impl FileId {
    pub(crate) fn from_usize(raw: usize) -> FileId {
        FileId(u32::try_from(raw).expect("file count overflowed u32"))
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

pub(crate) enum LinkFile<'data> {
    Object(ObjectFile<'data>),
    Archive(ArchiveInput<'data>),
    Import(ImportFile<'data>),
}

impl<'data> LinkFile<'data> {
    pub(crate) fn name(&self) -> &str {
        match self {
            LinkFile::Object(f) => &f.name,
            LinkFile::Archive(f) => &f.name,
            LinkFile::Import(f) => &f.name,
        }
    }
}

pub(crate) struct ObjectFile<'data> {
    pub(crate) name: String,
    pub(crate) coff: coff::File<'data>,

    /// Chunk handles indexed by 1-based section number; index 0 is permanently empty. Common
    /// chunks are appended past the section slots.
    pub(crate) chunks: Vec<Option<ChunkId>>,

    /// Bodies created from the symbol table, awaiting registration with the resolver.
    pub(crate) pending_symbols: Vec<PendingSymbol>,

    /// Symbol cells indexed by symbol-table index; filled during registration. Relocations
    /// resolve through this to find the current global winner for each name.
    pub(crate) sparse_cells: Vec<Option<SymbolId>>,

    /// Trimmed contents of a `.drectve` section, for the driver.
    pub(crate) directives: Option<&'data [u8]>,
}

pub(crate) struct PendingSymbol {
    pub(crate) symbol_index: u32,
    pub(crate) body: BodyId,

    /// Externally-visible bodies take part in global resolution; the rest get private cells.
    pub(crate) external: bool,
}

pub(crate) struct ArchiveInput<'data> {
    pub(crate) name: String,
    pub(crate) archive: ArchiveFile<'data>,
    pub(crate) lazy_bodies: Vec<BodyId>,
}

pub(crate) struct ImportFile<'data> {
    pub(crate) name: String,
    pub(crate) bodies: Vec<BodyId>,
    pub(crate) _marker: std::marker::PhantomData<&'data ()>,
}

/// Parses a COFF object, creating its chunks and symbol bodies. The caller registers the bodies
/// with the resolver afterwards.
pub(crate) fn parse_object<'data>(
    db: &mut SymbolDb<'data>,
    name: String,
    data: &'data [u8],
) -> Result<FileId> {
    let coff = coff::File::parse(data).with_context(|| format!("broken object file: {name}"))?;
    let file_id = db.next_file_id();

    let (chunks, directives) = initialize_chunks(db, file_id, &coff)?;
    let mut file = ObjectFile {
        name,
        coff,
        chunks,
        pending_symbols: Vec::new(),
        sparse_cells: Vec::new(),
        directives,
    };
    initialize_symbols(db, file_id, &mut file)?;

    db.push_file(LinkFile::Object(file));
    Ok(file_id)
}

fn initialize_chunks<'data>(
    db: &mut SymbolDb<'data>,
    file_id: FileId,
    coff: &coff::File<'data>,
) -> Result<(Vec<Option<ChunkId>>, Option<&'data [u8]>)> {
    let num_sections = coff.sections.len();
    let mut chunks = vec![None; num_sections + 1];
    let mut directives = None;
    for number in 1..=num_sections {
        let section = coff.section(number)?;
        let name = coff.section_name(section)?;
        if name == b".drectve" {
            directives = Some(coff.section_data(section)?.trim_ascii());
            continue;
        }
        if name.starts_with(b".debug") {
            continue;
        }
        let characteristics = section.characteristics.get(LittleEndian);
        if characteristics & pe::IMAGE_SCN_LNK_REMOVE != 0 {
            continue;
        }
        let data = coff.section_data(section)?;
        let relocations = coff.section_relocations(section)?;
        chunks[number] = Some(db.add_chunk(Chunk::section(
            file_id,
            number as u32,
            name,
            data,
            relocations,
            characteristics,
            section.size_of_raw_data.get(LittleEndian) as u64,
        )));
    }
    Ok((chunks, directives))
}

fn initialize_symbols<'data>(
    db: &mut SymbolDb<'data>,
    file_id: FileId,
    file: &mut ObjectFile<'data>,
) -> Result<()> {
    let coff = file.coff;
    let num_symbols = coff.symbols.len();
    file.sparse_cells = vec![None; num_symbols];

    let mut last_section_number = 0;
    let mut index = 0;
    while index < num_symbols {
        let symbol = &coff.symbols[index];
        let next = index + 1 + symbol.num_aux();
        let name = coff
            .symbol_name(symbol)
            .with_context(|| format!("broken object file: {}", file.name))?;
        if name == b"@comp.id" || name == b"@feat.00" {
            index = next;
            continue;
        }

        let section_number = symbol.section_number();
        let body = if symbol.is_undefined() {
            Some((SymbolBody::Undefined(Undefined { name, weak_alias: None }), true))
        } else if symbol.is_common() {
            let chunk = db.add_chunk(Chunk::common(u64::from(symbol.value())));
            file.chunks.push(Some(chunk));
            Some((
                SymbolBody::DefinedRegular(DefinedRegular {
                    name,
                    value: 0,
                    chunk,
                }),
                true,
            ))
        } else if section_number == -1 {
            Some((
                SymbolBody::DefinedAbsolute(DefinedAbsolute {
                    name,
                    va: u64::from(symbol.value()),
                }),
                symbol.is_external(),
            ))
        } else if symbol.is_weak_external() {
            if symbol.num_aux() == 0 {
                anyhow::bail!(
                    "broken object file: {}: weak external `{}` has no aux record",
                    file.name,
                    String::from_utf8_lossy(name)
                );
            }
            let aux = coff.aux_weak_external(index)?;
            let tag = aux.weak_default_sym_index.get(LittleEndian);
            Some((
                SymbolBody::Undefined(Undefined {
                    name,
                    weak_alias: Some((file_id, tag)),
                }),
                true,
            ))
        } else if section_number <= 0 {
            // Debug rows (section -2) and other special records carry no definition.
            None
        } else {
            // The first symbol of each section may carry a section-definition aux record; if its
            // number names another section, this section's liveness follows that one's.
            let is_first = last_section_number != section_number;
            if is_first
                && symbol.num_aux() > 0
                && let Some(&Some(chunk)) = file.chunks.get(section_number as usize)
            {
                let aux = coff.aux_section_definition(index)?;
                let parent_number = aux.number.get(LittleEndian) as usize;
                if parent_number != section_number as usize
                    && let Some(&Some(parent)) = file.chunks.get(parent_number)
                {
                    db.add_associative(parent, chunk);
                }
            }
            file.chunks
                .get(section_number as usize)
                .copied()
                .flatten()
                .map(|chunk| {
                    (
                        SymbolBody::DefinedRegular(DefinedRegular {
                            name,
                            value: symbol.value(),
                            chunk,
                        }),
                        symbol.is_external(),
                    )
                })
        };

        if let Some((body, external)) = body {
            file.pending_symbols.push(PendingSymbol {
                symbol_index: index as u32,
                body: db.add_body(body),
                external,
            });
        }
        last_section_number = section_number;
        index = next;
    }
    Ok(())
}

/// Parses an archive and creates a lazy body for every symbol in its index.
pub(crate) fn parse_archive<'data>(
    db: &mut SymbolDb<'data>,
    name: String,
    data: &'data [u8],
) -> Result<FileId> {
    let archive =
        ArchiveFile::parse(data).with_context(|| format!("Failed to parse archive `{name}`"))?;
    let file_id = db.next_file_id();

    let mut lazy_bodies = Vec::new();
    for symbol in archive.symbols() {
        if symbol.name == b"__NULL_IMPORT_DESCRIPTOR" {
            continue;
        }
        lazy_bodies.push(db.add_body(SymbolBody::Lazy(Lazy {
            name: symbol.name,
            file: file_id,
            member_offset: symbol.member_offset,
        })));
    }

    db.push_file(LinkFile::Archive(ArchiveInput {
        name,
        archive,
        lazy_bodies,
    }));
    Ok(file_id)
}

/// Parses a short import header into the `__imp_` data symbol and, for code imports, the thunk
/// symbol that lets the function be called by its plain name.
pub(crate) fn parse_import_file<'data>(
    db: &mut SymbolDb<'data>,
    name: String,
    data: &'data [u8],
) -> Result<FileId> {
    let (header, export_name, dll_name) =
        coff::parse_import(data).with_context(|| format!("Failed to parse `{name}`"))?;
    let file_id = db.next_file_id();

    let imp_name = db.alloc_name(b"__imp_", export_name);
    let import_data = db.add_body(SymbolBody::DefinedImportData(DefinedImportData {
        name: imp_name,
        dll_name,
        export_name,
        location: None,
    }));
    let mut bodies = vec![import_data];

    if header.name_type.get(LittleEndian) & coff::IMPORT_TYPE_MASK == coff::IMPORT_CODE {
        let chunk = db.add_chunk(Chunk::import_func(import_data));
        bodies.push(db.add_body(SymbolBody::DefinedImportFunc(DefinedImportFunc {
            name: export_name,
            chunk,
        })));
    }

    db.push_file(LinkFile::Import(ImportFile {
        name,
        bodies,
        _marker: std::marker::PhantomData,
    }));
    Ok(file_id)
}

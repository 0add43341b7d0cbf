//! Turns the set of live chunks into output sections with assigned addresses. Grouping strips
//! `$suffix`es and coalesces same-named input sections; within an output section chunks are
//! stable-sorted by their full input name so `.text$mn` precedes `.text$zz` while ties keep
//! input order. The import tables are synthesised here, then empty sections are removed and
//! RVAs and file offsets are assigned.

use crate::chunks::Chunk;
use crate::chunks::ChunkId;
use crate::chunks::PERM_MASK;
use crate::coff;
use crate::error::Result;
use crate::liveness;
use crate::parsing::LinkFile;
use crate::pe_writer::HEADER_SIZE;
use crate::symbol::BodyId;
use crate::symbol::SymbolBody;
use crate::symbol_db::SymbolDb;
use anyhow::bail;
use object::pe;
use std::collections::BTreeMap;

pub(crate) const PAGE_SIZE: u64 = 0x1000;
pub(crate) const FILE_ALIGNMENT: u64 = 0x200;

/// The RVA of the first output section.
pub(crate) const SECTION_BASE_RVA: u64 = 0x1000;

pub(crate) struct OutputSection<'data> {
    pub(crate) name: &'data [u8],

    /// 1-based index matching the emitted section table. Assigned after empty sections are
    /// removed.
    pub(crate) index: u16,

    pub(crate) chunks: Vec<ChunkId>,
    pub(crate) virtual_address: u64,
    pub(crate) pointer_to_raw_data: u64,
    pub(crate) virtual_size: u64,
    pub(crate) size_of_raw_data: u64,
    pub(crate) characteristics: u32,
}

pub(crate) struct Layout<'data> {
    pub(crate) output_sections: Vec<OutputSection<'data>>,
    pub(crate) entry_rva: u64,

    /// End of the headers and section table, rounded up to a page. The first section's data
    /// starts here in the file.
    pub(crate) header_end: u64,

    pub(crate) size_of_image: u64,
    pub(crate) file_size: u64,
    pub(crate) imports: Option<ImportDirectoryInfo>,
}

pub(crate) struct ImportDirectoryInfo {
    pub(crate) directory_rva: u64,
    pub(crate) directory_size: u64,
    pub(crate) iat_rva: u64,
    pub(crate) iat_size: u64,
}

struct ImportTables {
    first_directory: ChunkId,
    first_address: ChunkId,
    iat_size: u64,
}

pub(crate) fn compute<'data>(db: &mut SymbolDb<'data>) -> Result<Layout<'data>> {
    liveness::mark_live(db)?;

    let mut sections = create_sections(db);
    let import_tables = create_import_tables(db, &mut sections)?;

    // Empty sections would emit a zero-sized section table entry; drop them before indices and
    // addresses are assigned.
    sections.retain(|section| section.virtual_size > 0);

    let (header_end, size_of_image, file_size) = assign_addresses(db, &mut sections);

    let imports = import_tables.map(|tables| {
        let idata_size = sections
            .iter()
            .find(|section| section.name == b".idata")
            .map_or(0, |section| section.virtual_size);
        ImportDirectoryInfo {
            directory_rva: db.chunk(tables.first_directory).rva,
            directory_size: idata_size,
            iat_rva: db.chunk(tables.first_address).rva,
            iat_size: tables.iat_size,
        }
    });

    let entry_rva = db.body_rva(db.entry_body()?)?;

    Ok(Layout {
        output_sections: sections,
        entry_rva,
        header_end,
        size_of_image,
        file_size,
        imports,
    })
}

impl<'data> OutputSection<'data> {
    fn new(name: &'data [u8]) -> OutputSection<'data> {
        OutputSection {
            name,
            index: 0,
            chunks: Vec::new(),
            virtual_address: 0,
            pointer_to_raw_data: 0,
            virtual_size: 0,
            size_of_raw_data: 0,
            characteristics: 0,
        }
    }

    /// Appends a chunk: rounds the running size up to the chunk's alignment, records the
    /// section-relative position, then widens the section. Raw data only grows for initialized
    /// chunks, so all-BSS sections occupy no file space.
    fn add_chunk(&mut self, db: &mut SymbolDb<'data>, chunk_id: ChunkId) {
        let chunk = db.chunk_mut(chunk_id);
        let offset = self.virtual_size.next_multiple_of(chunk.alignment);
        chunk.rva = offset;
        chunk.file_offset = offset;
        self.virtual_size = offset + chunk.size();
        if !chunk.is_bss() {
            self.size_of_raw_data = self.virtual_size.next_multiple_of(FILE_ALIGNMENT);
        }
        self.characteristics |= chunk.permissions() & PERM_MASK;
        self.chunks.push(chunk_id);
    }
}

fn create_sections<'data>(db: &mut SymbolDb<'data>) -> Vec<OutputSection<'data>> {
    let mut grouped: BTreeMap<&'data [u8], Vec<ChunkId>> = BTreeMap::new();
    for chunk_id in db.object_chunks() {
        let chunk = db.chunk(chunk_id);
        if chunk.is_live() {
            grouped
                .entry(strip_dollar(chunk.section_name()))
                .or_default()
                .push(chunk_id);
        } else if db.args.verbose {
            liveness::print_discard_message(db, chunk_id);
        }
    }

    let mut sections = Vec::with_capacity(grouped.len());
    for (name, mut chunk_ids) in grouped {
        chunk_ids.sort_by_key(|&id| db.chunk(id).section_name());
        let mut section = OutputSection::new(name);
        for chunk_id in chunk_ids {
            section.add_chunk(db, chunk_id);
        }
        sections.push(section);
    }
    sections
}

/// Builds the import directory subgraph: per DLL one directory entry and name string, per
/// imported symbol a hint/name entry and parallel lookup/address slots, each table
/// zero-terminated. Thunk chunks for code imports go to `.text`.
fn create_import_tables<'data>(
    db: &mut SymbolDb<'data>,
    sections: &mut Vec<OutputSection<'data>>,
) -> Result<Option<ImportTables>> {
    let mut by_dll: BTreeMap<&'data [u8], Vec<BodyId>> = BTreeMap::new();
    let mut thunks = Vec::new();
    for &file_id in &db.import_files {
        let LinkFile::Import(file) = &db.files[file_id.as_usize()] else {
            continue;
        };
        for &body_id in &file.bodies {
            match db.body(body_id) {
                SymbolBody::DefinedImportData(import) => {
                    by_dll.entry(import.dll_name).or_default().push(body_id);
                }
                SymbolBody::DefinedImportFunc(import) => thunks.push(import.chunk),
                _ => {}
            }
        }
    }

    if !thunks.is_empty() {
        let text = find_or_create_section(sections, b".text")?;
        for chunk in thunks {
            sections[text].add_chunk(db, chunk);
        }
    }
    if by_dll.is_empty() {
        return Ok(None);
    }

    struct DllTable {
        dll_name: ChunkId,
        directory: ChunkId,
        lookups: Vec<ChunkId>,
        addresses: Vec<ChunkId>,
        hint_names: Vec<ChunkId>,
    }

    let mut tables = Vec::with_capacity(by_dll.len());
    for (dll_name, mut imports) in by_dll {
        imports.sort_by_key(|&body| db.body(body).name());

        let dll_chunk = db.add_chunk(Chunk::string(dll_name));
        let export_names: Vec<&[u8]> = imports
            .iter()
            .map(|&body| match db.body(body) {
                SymbolBody::DefinedImportData(import) => import.export_name,
                _ => unreachable!(),
            })
            .collect();
        let hint_names: Vec<ChunkId> = export_names
            .iter()
            .map(|&name| db.add_chunk(Chunk::hint_name(name)))
            .collect();
        let lookups: Vec<ChunkId> = hint_names
            .iter()
            .map(|&hint| db.add_chunk(Chunk::lookup(hint)))
            .collect();
        let addresses: Vec<ChunkId> = hint_names
            .iter()
            .map(|&hint| db.add_chunk(Chunk::lookup(hint)))
            .collect();

        // Bind each import symbol to its address table slot.
        for (&body, &slot) in imports.iter().zip(&addresses) {
            if let SymbolBody::DefinedImportData(import) = db.body_mut(body) {
                import.location = Some(slot);
            }
        }

        let directory = db.add_chunk(Chunk::directory(dll_chunk, lookups[0], addresses[0]));
        tables.push(DllTable {
            dll_name: dll_chunk,
            directory,
            lookups,
            addresses,
            hint_names,
        });
    }

    let idata = find_or_create_section(sections, b".idata")?;

    // The directory table, terminated by an all-zero entry.
    for table in &tables {
        sections[idata].add_chunk(db, table.directory);
    }
    let null_directory = db.add_chunk(Chunk::null(size_of::<coff::ImportDirectoryEntry>() as u64));
    sections[idata].add_chunk(db, null_directory);

    // The import lookup tables, one zero-terminated run per DLL.
    for table in &tables {
        for &chunk in &table.lookups {
            sections[idata].add_chunk(db, chunk);
        }
        let terminator = db.add_chunk(Chunk::null(8));
        sections[idata].add_chunk(db, terminator);
    }

    // The import address tables, same contents as the lookup tables.
    let mut iat_size = 0;
    for table in &tables {
        for &chunk in &table.addresses {
            sections[idata].add_chunk(db, chunk);
        }
        let terminator = db.add_chunk(Chunk::null(8));
        sections[idata].add_chunk(db, terminator);
        iat_size += (table.addresses.len() as u64 + 1) * 8;
    }

    for table in &tables {
        for &chunk in &table.hint_names {
            sections[idata].add_chunk(db, chunk);
        }
    }
    for table in &tables {
        sections[idata].add_chunk(db, table.dll_name);
    }

    Ok(Some(ImportTables {
        first_directory: tables[0].directory,
        first_address: tables[0].addresses[0],
        iat_size,
    }))
}

fn find_or_create_section<'data>(
    sections: &mut Vec<OutputSection<'data>>,
    name: &'static [u8],
) -> Result<usize> {
    if let Some(index) = sections.iter().position(|section| section.name == name) {
        return Ok(index);
    }
    let read = pe::IMAGE_SCN_MEM_READ;
    let write = pe::IMAGE_SCN_MEM_WRITE;
    let execute = pe::IMAGE_SCN_MEM_EXECUTE;
    let characteristics = match name {
        b".bss" => pe::IMAGE_SCN_CNT_UNINITIALIZED_DATA | read | write,
        b".data" => pe::IMAGE_SCN_CNT_INITIALIZED_DATA | read | write,
        b".idata" => pe::IMAGE_SCN_CNT_INITIALIZED_DATA | read,
        b".rdata" => pe::IMAGE_SCN_CNT_INITIALIZED_DATA | read,
        b".text" => pe::IMAGE_SCN_CNT_CODE | read | execute,
        _ => bail!(
            "Internal error: no default permissions for section {}",
            String::from_utf8_lossy(name)
        ),
    };
    let mut section = OutputSection::new(name);
    section.characteristics = characteristics;
    sections.push(section);
    Ok(sections.len() - 1)
}

/// Assigns final section indices, RVAs and file offsets. Sections are placed from RVA 0x1000;
/// file data starts at the page-rounded end of the section table.
fn assign_addresses<'data>(
    db: &mut SymbolDb<'data>,
    sections: &mut [OutputSection<'data>],
) -> (u64, u64, u64) {
    let header_end = (HEADER_SIZE as u64
        + sections.len() as u64 * size_of::<coff::SectionHeader>() as u64)
        .next_multiple_of(PAGE_SIZE);

    let mut rva = SECTION_BASE_RVA;
    let mut file_offset = header_end;
    for (index, section) in sections.iter_mut().enumerate() {
        section.index = (index + 1) as u16;
        section.virtual_address = rva;
        if section.size_of_raw_data > 0 {
            section.pointer_to_raw_data = file_offset;
        }
        for &chunk_id in &section.chunks {
            let chunk = db.chunk_mut(chunk_id);
            chunk.rva += rva;
            chunk.file_offset += file_offset;
        }
        rva += section.virtual_size.next_multiple_of(PAGE_SIZE);
        file_offset += section.size_of_raw_data.next_multiple_of(FILE_ALIGNMENT);
    }

    let size_of_image = header_end + (rva - SECTION_BASE_RVA);
    let file_size = file_offset;
    (header_end, size_of_image, file_size)
}

fn strip_dollar(name: &[u8]) -> &[u8] {
    match memchr::memchr(b'$', name) {
        Some(index) => &name[..index],
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dollar_suffix_stripping() {
        assert_eq!(strip_dollar(b".text$mn"), b".text");
        assert_eq!(strip_dollar(b".text"), b".text");
        assert_eq!(strip_dollar(b"$x"), b"");
    }
}

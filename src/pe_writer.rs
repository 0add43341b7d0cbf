//! Emits the PE32+ image: DOS stub, PE magic, COFF and optional headers, data directories,
//! section table, then the raw section data, and finally the relocations, applied directly into
//! the output buffer. The buffer is committed only after everything has been written.

use crate::chunks::ChunkKind;
use crate::coff;
use crate::error::Context as _;
use crate::error::Result;
use crate::file_writer::Output;
use crate::layout::FILE_ALIGNMENT;
use crate::layout::Layout;
use crate::symbol_db::SymbolDb;
use crate::x86_64;
use crate::x86_64::RelocationContext;
use object::pe;
use object::LittleEndian;

pub(crate) const DOS_STUB_SIZE: usize = 64;
pub(crate) const NUM_DATA_DIRECTORIES: usize = 16;
const PE_MAGIC: &[u8; 4] = b"PE\0\0";

/// Size of everything before the section table.
pub(crate) const HEADER_SIZE: usize = DOS_STUB_SIZE
    + PE_MAGIC.len()
    + size_of::<coff::FileHeader>()
    + size_of::<coff::OptionalHeader>()
    + NUM_DATA_DIRECTORIES * size_of::<coff::DataDirectory>();

const _ASSERTS: () = {
    assert!(size_of::<coff::DosHeader>() == DOS_STUB_SIZE);
    assert!(size_of::<coff::OptionalHeader>() == 112);
};

pub(crate) fn write(output: &Output, db: &SymbolDb, layout: &Layout) -> Result<()> {
    let mut sized = output.create(layout.file_size)?;
    write_headers(&mut sized.out, db, layout)?;
    write_sections(&mut sized.out, db, layout)?;
    apply_relocations(&mut sized.out, db, layout)?;
    backfill_headers(&mut sized.out, layout)?;
    sized.commit()
}

fn write_headers(buffer: &mut [u8], db: &SymbolDb, layout: &Layout) -> Result<()> {
    let num_sections = layout.output_sections.len();

    let (dos, rest) = cast_mut::<coff::DosHeader>(buffer)?;
    dos.e_magic.set(LittleEndian, pe::IMAGE_DOS_SIGNATURE);
    dos.e_lfarlc.set(LittleEndian, size_of::<coff::DosHeader>() as u16);
    dos.e_lfanew.set(LittleEndian, DOS_STUB_SIZE as u32);

    let (magic, rest) = rest.split_at_mut(PE_MAGIC.len());
    magic.copy_from_slice(PE_MAGIC);

    let (file_header, rest) = cast_mut::<coff::FileHeader>(rest)?;
    file_header.machine.set(LittleEndian, pe::IMAGE_FILE_MACHINE_AMD64);
    file_header
        .number_of_sections
        .set(LittleEndian, num_sections as u16);
    file_header.size_of_optional_header.set(
        LittleEndian,
        (size_of::<coff::OptionalHeader>()
            + NUM_DATA_DIRECTORIES * size_of::<coff::DataDirectory>()) as u16,
    );
    file_header.characteristics.set(
        LittleEndian,
        pe::IMAGE_FILE_EXECUTABLE_IMAGE
            | pe::IMAGE_FILE_RELOCS_STRIPPED
            | pe::IMAGE_FILE_LARGE_ADDRESS_AWARE,
    );

    let (optional, rest) = cast_mut::<coff::OptionalHeader>(rest)?;
    optional
        .magic
        .set(LittleEndian, pe::IMAGE_NT_OPTIONAL_HDR64_MAGIC);
    optional
        .address_of_entry_point
        .set(LittleEndian, layout.entry_rva as u32);
    optional.image_base.set(LittleEndian, db.args.image_base);
    optional
        .section_alignment
        .set(LittleEndian, crate::layout::PAGE_SIZE as u32);
    optional
        .file_alignment
        .set(LittleEndian, FILE_ALIGNMENT as u32);
    optional.major_operating_system_version.set(LittleEndian, 6);
    optional.major_image_version.set(LittleEndian, 6);
    optional.major_subsystem_version.set(LittleEndian, 6);
    optional
        .size_of_image
        .set(LittleEndian, layout.size_of_image as u32);
    optional.size_of_headers.set(
        LittleEndian,
        (HEADER_SIZE as u64 + num_sections as u64 * size_of::<coff::SectionHeader>() as u64)
            .next_multiple_of(FILE_ALIGNMENT) as u32,
    );
    optional
        .subsystem
        .set(LittleEndian, pe::IMAGE_SUBSYSTEM_WINDOWS_CUI);
    optional
        .size_of_stack_reserve
        .set(LittleEndian, 1024 * 1024);
    optional.size_of_stack_commit.set(LittleEndian, 4096);
    optional.size_of_heap_reserve.set(LittleEndian, 1024 * 1024);
    optional.size_of_heap_commit.set(LittleEndian, 4096);
    optional
        .number_of_rva_and_sizes
        .set(LittleEndian, NUM_DATA_DIRECTORIES as u32);

    let (directories, rest) =
        cast_slice_mut::<coff::DataDirectory>(rest, NUM_DATA_DIRECTORIES)?;
    if let Some(imports) = &layout.imports {
        let import_dir = &mut directories[pe::IMAGE_DIRECTORY_ENTRY_IMPORT];
        import_dir
            .virtual_address
            .set(LittleEndian, imports.directory_rva as u32);
        import_dir.size.set(LittleEndian, imports.directory_size as u32);
        let iat_dir = &mut directories[pe::IMAGE_DIRECTORY_ENTRY_IAT];
        iat_dir.virtual_address.set(LittleEndian, imports.iat_rva as u32);
        iat_dir.size.set(LittleEndian, imports.iat_size as u32);
    }

    // The section table immediately follows the data directories.
    let (table, _) = cast_slice_mut::<coff::SectionHeader>(rest, num_sections)?;
    for (header, section) in table.iter_mut().zip(&layout.output_sections) {
        // The name field isn't zero-terminated when the name is exactly eight bytes.
        let len = section.name.len().min(8);
        header.name[..len].copy_from_slice(&section.name[..len]);
        header
            .virtual_size
            .set(LittleEndian, section.virtual_size as u32);
        header
            .virtual_address
            .set(LittleEndian, section.virtual_address as u32);
        header
            .size_of_raw_data
            .set(LittleEndian, section.size_of_raw_data as u32);
        header
            .pointer_to_raw_data
            .set(LittleEndian, section.pointer_to_raw_data as u32);
        header
            .characteristics
            .set(LittleEndian, section.characteristics);
    }
    Ok(())
}

fn write_sections(buffer: &mut [u8], db: &SymbolDb, layout: &Layout) -> Result<()> {
    for section in &layout.output_sections {
        // Gaps in code sections are filled with int3.
        if section.characteristics & pe::IMAGE_SCN_CNT_CODE != 0 {
            let start = section.pointer_to_raw_data as usize;
            let end = start + section.size_of_raw_data as usize;
            buffer
                .get_mut(start..end)
                .context("Section raw data out of bounds")?
                .fill(0xcc);
        }
        for &chunk_id in &section.chunks {
            let chunk = db.chunk(chunk_id);
            let Some(contents) = chunk.initial_contents() else {
                continue;
            };
            let start = chunk.file_offset as usize;
            buffer
                .get_mut(start..start + contents.len())
                .context("Chunk contents out of bounds")?
                .copy_from_slice(contents);
        }
    }
    Ok(())
}

fn apply_relocations(buffer: &mut [u8], db: &SymbolDb, layout: &Layout) -> Result<()> {
    for section in &layout.output_sections {
        for &chunk_id in &section.chunks {
            let chunk = db.chunk(chunk_id);
            match &chunk.kind {
                ChunkKind::Section(section_chunk) => {
                    for relocation in section_chunk.relocations {
                        let index = relocation.symbol_table_index.get(LittleEndian) as usize;
                        let body = db.resolved_body(section_chunk.file, index)?;
                        let offset = u64::from(relocation.virtual_address.get(LittleEndian));
                        let ctx = RelocationContext {
                            p: chunk.rva + offset,
                            s: db.body_rva(body)?,
                            section_index: section.index,
                            section_rva: section.virtual_address,
                            image_base: db.args.image_base,
                        };
                        x86_64::apply_relocation(
                            buffer,
                            chunk.file_offset + offset,
                            relocation.typ.get(LittleEndian),
                            &ctx,
                        )
                        .with_context(|| {
                            format!(
                                "applying relocations in {}",
                                db.files[section_chunk.file.as_usize()].name()
                            )
                        })?;
                    }
                }
                ChunkKind::ImportFunc(thunk) => {
                    let target = db.body_rva(thunk.import_data)?;
                    let displacement = target.wrapping_sub(chunk.rva).wrapping_sub(chunk.size());
                    x86_64::write32(buffer, chunk.file_offset + 2, displacement as u32)?;
                }
                ChunkKind::Lookup(lookup) => {
                    let hint_rva = db.chunk(lookup.hint_name).rva;
                    x86_64::write32(buffer, chunk.file_offset, hint_rva as u32)?;
                }
                ChunkKind::Directory(directory) => {
                    let start = chunk.file_offset as usize;
                    let bytes = buffer
                        .get_mut(start..start + size_of::<coff::ImportDirectoryEntry>())
                        .context("Import directory out of bounds")?;
                    let (entry, _) = cast_mut::<coff::ImportDirectoryEntry>(bytes)?;
                    entry
                        .original_first_thunk
                        .set(LittleEndian, db.chunk(directory.lookup_table).rva as u32);
                    entry
                        .name
                        .set(LittleEndian, db.chunk(directory.dll_name).rva as u32);
                    entry
                        .first_thunk
                        .set(LittleEndian, db.chunk(directory.address_table).rva as u32);
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Fills in the header fields that depend on the final section list.
fn backfill_headers(buffer: &mut [u8], layout: &Layout) -> Result<()> {
    let offset = DOS_STUB_SIZE + PE_MAGIC.len() + size_of::<coff::FileHeader>();
    let (optional, _) = cast_mut::<coff::OptionalHeader>(&mut buffer[offset..])?;

    if let Some(text) = layout
        .output_sections
        .iter()
        .find(|section| section.name == b".text")
    {
        optional
            .base_of_code
            .set(LittleEndian, text.virtual_address as u32);
        optional
            .size_of_code
            .set(LittleEndian, text.size_of_raw_data as u32);
    }
    optional.size_of_initialized_data.set(
        LittleEndian,
        total_section_size(layout, pe::IMAGE_SCN_CNT_INITIALIZED_DATA),
    );
    optional.size_of_uninitialized_data.set(
        LittleEndian,
        total_section_size(layout, pe::IMAGE_SCN_CNT_UNINITIALIZED_DATA),
    );
    Ok(())
}

fn total_section_size(layout: &Layout, characteristic: u32) -> u32 {
    layout
        .output_sections
        .iter()
        .filter(|section| section.characteristics & characteristic != 0)
        .map(|section| section.size_of_raw_data as u32)
        .sum()
}

fn cast_mut<T: object::Pod>(bytes: &mut [u8]) -> Result<(&mut T, &mut [u8])> {
    object::from_bytes_mut(bytes)
        .map_err(|()| anyhow::anyhow!("Internal error: header write out of bounds"))
}

fn cast_slice_mut<T: object::Pod>(bytes: &mut [u8], count: usize) -> Result<(&mut [T], &mut [u8])> {
    object::slice_from_bytes_mut(bytes, count)
        .map_err(|()| anyhow::anyhow!("Internal error: header write out of bounds"))
}

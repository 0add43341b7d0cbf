//! Typed access to the bytes of COFF object files. We use the raw structs from the `object` crate
//! and do our own traversal, since we need the symbol table in its on-disk order, including
//! auxiliary records, and we need to keep everything borrowed from the input file.

use crate::error::Context as _;
use crate::error::Result;
use anyhow::bail;
use object::LittleEndian;
use object::pe;

pub(crate) type FileHeader = pe::ImageFileHeader;
pub(crate) type SectionHeader = pe::ImageSectionHeader;
pub(crate) type Symbol = pe::ImageSymbol;
pub(crate) type Relocation = pe::ImageRelocation;
pub(crate) type AuxSectionDefinition = pe::ImageAuxSymbolSection;
pub(crate) type AuxWeakExternal = pe::ImageAuxSymbolWeak;
pub(crate) type ImportHeader = pe::ImportObjectHeader;
pub(crate) type DosHeader = pe::ImageDosHeader;
pub(crate) type OptionalHeader = pe::ImageOptionalHeader64;
pub(crate) type DataDirectory = pe::ImageDataDirectory;
pub(crate) type ImportDirectoryEntry = pe::ImageImportDescriptor;

/// The low two bits of an import header's type info field give the import type.
pub(crate) const IMPORT_TYPE_MASK: u16 = 0x3;
pub(crate) const IMPORT_CODE: u16 = 0;

/// A parsed COFF object. Sections, symbols and the string table all borrow from the file's bytes.
#[derive(Clone, Copy)]
pub(crate) struct File<'data> {
    pub(crate) data: &'data [u8],
    pub(crate) sections: &'data [SectionHeader],

    /// The raw symbol table in on-disk order. Auxiliary records occupy slots of their own and are
    /// reinterpreted on demand.
    pub(crate) symbols: &'data [Symbol],

    /// The string table, including its 4-byte length prefix so that on-disk offsets can be used
    /// directly.
    string_table: &'data [u8],
}

impl<'data> File<'data> {
    pub(crate) fn parse(data: &'data [u8]) -> Result<File<'data>> {
        let (header, rest) = object::from_bytes::<FileHeader>(data)
            .map_err(|()| anyhow::anyhow!("File too small for COFF header"))?;

        // Objects generally have no optional header, but skip one if present.
        let opt_size = header.size_of_optional_header.get(LittleEndian) as usize;
        let rest = rest.get(opt_size..).context("Invalid optional header size")?;

        let (sections, _) = object::slice_from_bytes::<SectionHeader>(
            rest,
            header.number_of_sections.get(LittleEndian) as usize,
        )
        .map_err(|()| anyhow::anyhow!("Invalid section table"))?;

        let symtab_offset = header.pointer_to_symbol_table.get(LittleEndian) as usize;
        let num_symbols = header.number_of_symbols.get(LittleEndian) as usize;
        let (symbols, string_table) = if symtab_offset == 0 || num_symbols == 0 {
            (&[][..], &[][..])
        } else {
            let symtab_bytes = data.get(symtab_offset..).context("Invalid symbol table offset")?;
            let (symbols, rest) = object::slice_from_bytes::<Symbol>(symtab_bytes, num_symbols)
                .map_err(|()| anyhow::anyhow!("Invalid symbol table"))?;
            // The string table immediately follows the symbol table. Its first word is the total
            // size including the word itself; it may be absent entirely.
            let string_table = if rest.len() >= 4 {
                let size = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
                &rest[..size.clamp(4, rest.len())]
            } else {
                &[][..]
            };
            (symbols, string_table)
        };

        Ok(File {
            data,
            sections,
            symbols,
            string_table,
        })
    }

    /// Returns the section header for a 1-based COFF section number.
    pub(crate) fn section(&self, number: usize) -> Result<&'data SectionHeader> {
        self.sections
            .get(number.wrapping_sub(1))
            .with_context(|| format!("Invalid section number {number}"))
    }

    pub(crate) fn section_name(&self, section: &'data SectionHeader) -> Result<&'data [u8]> {
        if let Some(rest) = section.name.strip_prefix(b"/") {
            let digits = std::str::from_utf8(rest)
                .ok()
                .map(|s| s.trim_end_matches('\0').trim())
                .context("Invalid long section name")?;
            let offset = digits
                .parse::<usize>()
                .context("Invalid long section name offset")?;
            return self.string(offset);
        }
        let len = memchr::memchr(0, &section.name).unwrap_or(section.name.len());
        Ok(&section.name[..len])
    }

    /// Returns the raw contents of a section, or an empty slice for uninitialized data.
    pub(crate) fn section_data(&self, section: &'data SectionHeader) -> Result<&'data [u8]> {
        if section.characteristics.get(LittleEndian) & pe::IMAGE_SCN_CNT_UNINITIALIZED_DATA != 0 {
            return Ok(&[]);
        }
        let offset = section.pointer_to_raw_data.get(LittleEndian) as usize;
        let size = section.size_of_raw_data.get(LittleEndian) as usize;
        self.data
            .get(offset..offset + size)
            .context("Section data out of bounds")
    }

    pub(crate) fn section_relocations(
        &self,
        section: &'data SectionHeader,
    ) -> Result<&'data [Relocation]> {
        let offset = section.pointer_to_relocations.get(LittleEndian) as usize;
        let count = section.number_of_relocations.get(LittleEndian) as usize;
        if count == 0 {
            return Ok(&[]);
        }
        let bytes = self
            .data
            .get(offset..)
            .context("Relocation table out of bounds")?;
        Ok(object::slice_from_bytes::<Relocation>(bytes, count)
            .map_err(|()| anyhow::anyhow!("Invalid relocation table"))?
            .0)
    }

    pub(crate) fn symbol_name(&self, symbol: &'data Symbol) -> Result<&'data [u8]> {
        if symbol.name[..4] == [0; 4] {
            let offset = u32::from_le_bytes([
                symbol.name[4],
                symbol.name[5],
                symbol.name[6],
                symbol.name[7],
            ]) as usize;
            return self.string(offset);
        }
        let len = memchr::memchr(0, &symbol.name).unwrap_or(symbol.name.len());
        Ok(&symbol.name[..len])
    }

    /// Reinterprets the record following symbol `index` as a section definition.
    pub(crate) fn aux_section_definition(
        &self,
        index: usize,
    ) -> Result<&'data AuxSectionDefinition> {
        let aux = self.aux_record(index)?;
        Ok(object::from_bytes::<AuxSectionDefinition>(aux)
            .map_err(|()| anyhow::anyhow!("Invalid section definition aux record"))?
            .0)
    }

    /// Reinterprets the record following symbol `index` as a weak external record.
    pub(crate) fn aux_weak_external(&self, index: usize) -> Result<&'data AuxWeakExternal> {
        let aux = self.aux_record(index)?;
        Ok(object::from_bytes::<AuxWeakExternal>(aux)
            .map_err(|()| anyhow::anyhow!("Invalid weak external aux record"))?
            .0)
    }

    fn aux_record(&self, index: usize) -> Result<&'data [u8]> {
        let aux = self
            .symbols
            .get(index + 1)
            .with_context(|| format!("Missing aux record for symbol {index}"))?;
        Ok(object::bytes_of(aux))
    }

    fn string(&self, offset: usize) -> Result<&'data [u8]> {
        let bytes = self
            .string_table
            .get(offset..)
            .context("String table offset out of bounds")?;
        let len = memchr::memchr(0, bytes).context("Unterminated string table entry")?;
        Ok(&bytes[..len])
    }
}

/// Accessors for the raw symbol record. Classification mirrors what `COFFSymbolRef` provides in
/// LLVM: an undefined external has section number 0 and value 0, a common symbol has section
/// number 0 and a non-zero value (its size).
pub(crate) trait CoffSymbol {
    fn value(&self) -> u32;
    fn section_number(&self) -> i32;
    fn num_aux(&self) -> usize;
    fn is_external(&self) -> bool;
    fn is_undefined(&self) -> bool;
    fn is_common(&self) -> bool;
    fn is_weak_external(&self) -> bool;
    fn is_function(&self) -> bool;
}

impl CoffSymbol for Symbol {
    fn value(&self) -> u32 {
        self.value.get(LittleEndian)
    }

    fn section_number(&self) -> i32 {
        self.section_number.get(LittleEndian) as i16 as i32
    }

    fn num_aux(&self) -> usize {
        self.number_of_aux_symbols as usize
    }

    fn is_external(&self) -> bool {
        self.storage_class == pe::IMAGE_SYM_CLASS_EXTERNAL
    }

    fn is_undefined(&self) -> bool {
        self.is_external() && self.section_number() == 0 && self.value() == 0
    }

    fn is_common(&self) -> bool {
        self.is_external() && self.section_number() == 0 && self.value() != 0
    }

    fn is_weak_external(&self) -> bool {
        self.storage_class == pe::IMAGE_SYM_CLASS_WEAK_EXTERNAL
    }

    fn is_function(&self) -> bool {
        (self.typ.get(LittleEndian) >> 4) & 0xf == pe::IMAGE_SYM_DTYPE_FUNCTION
    }
}

/// Validates a short import header and returns the symbol and DLL names that follow it.
pub(crate) fn parse_import<'data>(
    data: &'data [u8],
) -> Result<(&'data ImportHeader, &'data [u8], &'data [u8])> {
    let (header, rest) = object::from_bytes::<ImportHeader>(data)
        .map_err(|()| anyhow::anyhow!("File too small for import header"))?;
    if rest.len() != header.size_of_data.get(LittleEndian) as usize {
        bail!("broken import library");
    }
    let name_end = memchr::memchr(0, rest).context("Unterminated import symbol name")?;
    let name = &rest[..name_end];
    let dll_bytes = &rest[name_end + 1..];
    let dll_end = memchr::memchr(0, dll_bytes).context("Unterminated import DLL name")?;
    Ok((header, name, &dll_bytes[..dll_end]))
}

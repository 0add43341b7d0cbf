//! End-to-end tests. Each test builds real COFF objects (and where needed archives and import
//! libraries) as raw bytes, links them through the public API and checks the produced PE32+
//! image byte-for-byte where the format pins values down.

use object::pe;
use object::LittleEndian;
use std::path::Path;
use std::path::PathBuf;

type Result<T = (), E = anyhow::Error> = core::result::Result<T, E>;

// ---------------------------------------------------------------------------
// COFF object builder

const SECTION_HEADER_SIZE: usize = 40;
const RELOCATION_SIZE: usize = 10;

const TEXT: u32 = pe::IMAGE_SCN_CNT_CODE
    | pe::IMAGE_SCN_MEM_READ
    | pe::IMAGE_SCN_MEM_EXECUTE
    | pe::IMAGE_SCN_ALIGN_16BYTES;
const DATA: u32 =
    pe::IMAGE_SCN_CNT_INITIALIZED_DATA | pe::IMAGE_SCN_MEM_READ | pe::IMAGE_SCN_MEM_WRITE
        | pe::IMAGE_SCN_ALIGN_4BYTES;

#[derive(Clone)]
struct SectionSpec {
    name: &'static str,
    data: Vec<u8>,
    characteristics: u32,
    /// (offset, symbol table index, relocation type)
    relocations: Vec<(u32, u32, u16)>,
}

#[derive(Clone)]
struct SymbolSpec {
    name: &'static str,
    value: u32,
    /// 1-based section number, 0 for undefined/common, -1 for absolute.
    section: i16,
    storage_class: u8,
    typ: u16,
    aux: Option<AuxSpec>,
}

#[derive(Clone)]
enum AuxSpec {
    SectionDefinition { number: u16, selection: u8 },
    WeakExternal { tag: u32 },
}

fn defined(name: &'static str, section: i16, value: u32) -> SymbolSpec {
    SymbolSpec {
        name,
        value,
        section,
        storage_class: pe::IMAGE_SYM_CLASS_EXTERNAL,
        typ: 0x20,
        aux: None,
    }
}

fn undefined(name: &'static str) -> SymbolSpec {
    SymbolSpec {
        name,
        value: 0,
        section: 0,
        storage_class: pe::IMAGE_SYM_CLASS_EXTERNAL,
        typ: 0,
        aux: None,
    }
}

fn common(name: &'static str, size: u32) -> SymbolSpec {
    SymbolSpec {
        name,
        value: size,
        section: 0,
        storage_class: pe::IMAGE_SYM_CLASS_EXTERNAL,
        typ: 0,
        aux: None,
    }
}

fn section_symbol(name: &'static str, section: i16, aux: AuxSpec) -> SymbolSpec {
    SymbolSpec {
        name,
        value: 0,
        section,
        storage_class: pe::IMAGE_SYM_CLASS_STATIC,
        typ: 0,
        aux: Some(aux),
    }
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn build_object(sections: &[SectionSpec], symbols: &[SymbolSpec]) -> Vec<u8> {
    let headers_end = 20 + SECTION_HEADER_SIZE * sections.len();

    let mut data_offsets = Vec::new();
    let mut reloc_offsets = Vec::new();
    let mut cursor = headers_end;
    for section in sections {
        data_offsets.push(cursor);
        cursor += section.data.len();
        reloc_offsets.push(if section.relocations.is_empty() { 0 } else { cursor });
        cursor += RELOCATION_SIZE * section.relocations.len();
    }
    let symtab_offset = cursor;
    let num_records: usize = symbols
        .iter()
        .map(|symbol| 1 + symbol.aux.is_some() as usize)
        .sum();

    let mut out = Vec::new();
    push_u16(&mut out, pe::IMAGE_FILE_MACHINE_AMD64);
    push_u16(&mut out, sections.len() as u16);
    push_u32(&mut out, 0);
    push_u32(&mut out, symtab_offset as u32);
    push_u32(&mut out, num_records as u32);
    push_u16(&mut out, 0);
    push_u16(&mut out, 0);

    for (index, section) in sections.iter().enumerate() {
        let mut name = [0u8; 8];
        name[..section.name.len()].copy_from_slice(section.name.as_bytes());
        out.extend_from_slice(&name);
        push_u32(&mut out, 0); // virtual size
        push_u32(&mut out, 0); // virtual address
        push_u32(&mut out, section.data.len() as u32);
        push_u32(&mut out, data_offsets[index] as u32);
        push_u32(&mut out, reloc_offsets[index] as u32);
        push_u32(&mut out, 0); // line numbers
        push_u16(&mut out, section.relocations.len() as u16);
        push_u16(&mut out, 0);
        push_u32(&mut out, section.characteristics);
    }

    for section in sections {
        out.extend_from_slice(&section.data);
        for &(offset, symbol, typ) in &section.relocations {
            push_u32(&mut out, offset);
            push_u32(&mut out, symbol);
            push_u16(&mut out, typ);
        }
    }

    assert_eq!(out.len(), symtab_offset);
    let mut strtab: Vec<u8> = Vec::new();
    for symbol in symbols {
        let name = symbol.name.as_bytes();
        if name.len() <= 8 {
            let mut field = [0u8; 8];
            field[..name.len()].copy_from_slice(name);
            out.extend_from_slice(&field);
        } else {
            push_u32(&mut out, 0);
            push_u32(&mut out, 4 + strtab.len() as u32);
            strtab.extend_from_slice(name);
            strtab.push(0);
        }
        push_u32(&mut out, symbol.value);
        push_u16(&mut out, symbol.section as u16);
        push_u16(&mut out, symbol.typ);
        out.push(symbol.storage_class);
        out.push(symbol.aux.is_some() as u8);
        match &symbol.aux {
            None => {}
            Some(AuxSpec::SectionDefinition { number, selection }) => {
                push_u32(&mut out, 0); // length
                push_u16(&mut out, 0); // relocations
                push_u16(&mut out, 0); // line numbers
                push_u32(&mut out, 0); // checksum
                push_u16(&mut out, *number);
                out.push(*selection);
                out.extend_from_slice(&[0; 3]);
            }
            Some(AuxSpec::WeakExternal { tag }) => {
                push_u32(&mut out, *tag);
                push_u32(&mut out, 3); // search: alias
                out.extend_from_slice(&[0; 10]);
            }
        }
    }
    push_u32(&mut out, 4 + strtab.len() as u32);
    out.extend_from_slice(&strtab);
    out
}

// ---------------------------------------------------------------------------
// Import library and archive builders

fn build_import_member(symbol: &str, dll: &str, code: bool) -> Vec<u8> {
    let mut out = Vec::new();
    push_u16(&mut out, 0); // sig1
    push_u16(&mut out, 0xffff); // sig2
    push_u16(&mut out, 0); // version
    push_u16(&mut out, pe::IMAGE_FILE_MACHINE_AMD64);
    push_u32(&mut out, 0); // timestamp
    push_u32(&mut out, (symbol.len() + dll.len() + 2) as u32);
    push_u16(&mut out, 0); // ordinal/hint
    // Low two bits: import type (0 = code, 1 = data); next three: import by name.
    push_u16(&mut out, (if code { 0 } else { 1 }) | (1 << 2));
    out.extend_from_slice(symbol.as_bytes());
    out.push(0);
    out.extend_from_slice(dll.as_bytes());
    out.push(0);
    out
}

/// Builds an archive with a first linker member indexing `symbols` into `members`.
fn build_archive(members: &[(&str, Vec<u8>)], symbols: &[(&str, usize)]) -> Vec<u8> {
    let index_size = 4 + 4 * symbols.len() + symbols
        .iter()
        .map(|(name, _)| name.len() + 1)
        .sum::<usize>();

    let mut member_offsets = Vec::new();
    let mut cursor = 8 + 60 + index_size + index_size % 2;
    for (_, data) in members {
        member_offsets.push(cursor);
        cursor += 60 + data.len() + data.len() % 2;
    }

    let mut index = Vec::new();
    index.extend_from_slice(&(symbols.len() as u32).to_be_bytes());
    for &(_, member) in symbols {
        index.extend_from_slice(&(member_offsets[member] as u32).to_be_bytes());
    }
    for &(name, _) in symbols {
        index.extend_from_slice(name.as_bytes());
        index.push(0);
    }

    let mut out = Vec::new();
    out.extend_from_slice(&object::archive::MAGIC);
    push_archive_entry(&mut out, "/", &index);
    for (name, data) in members {
        push_archive_entry(&mut out, &format!("{name}/"), data);
    }
    out
}

fn push_archive_entry(out: &mut Vec<u8>, ident: &str, data: &[u8]) {
    let mut header = [b' '; 60];
    header[..ident.len()].copy_from_slice(ident.as_bytes());
    let size = data.len().to_string();
    header[48..48 + size.len()].copy_from_slice(size.as_bytes());
    header[58] = b'`';
    header[59] = b'\n';
    out.extend_from_slice(&header);
    out.extend_from_slice(data);
    if data.len() % 2 == 1 {
        out.push(b'\n');
    }
}

// ---------------------------------------------------------------------------
// Linking and image inspection

fn work_dir(test: &str) -> PathBuf {
    let dir = Path::new(env!("CARGO_TARGET_TMPDIR")).join(test);
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn link(test: &str, inputs: &[(&str, Vec<u8>)]) -> Result<Image> {
    let dir = work_dir(test);
    let mut args = vec!["peld".to_owned()];
    let output = dir.join("out.exe");
    args.push(format!("-out:{}", output.display()));
    for (name, bytes) in inputs {
        let path = dir.join(name);
        std::fs::write(&path, bytes)?;
        args.push(path.display().to_string());
    }
    peld::Linker::from_args(args.iter())?.run()?;
    Ok(Image {
        bytes: std::fs::read(&output)?,
    })
}

#[derive(Debug)]
struct Image {
    bytes: Vec<u8>,
}

impl Image {
    fn lfanew(&self) -> usize {
        u32::from_le_bytes(self.bytes[0x3c..0x40].try_into().unwrap()) as usize
    }

    fn file_header(&self) -> &pe::ImageFileHeader {
        let offset = self.lfanew() + 4;
        object::from_bytes(&self.bytes[offset..offset + 20]).unwrap().0
    }

    fn optional_header(&self) -> &pe::ImageOptionalHeader64 {
        let offset = self.lfanew() + 4 + 20;
        object::from_bytes(&self.bytes[offset..offset + 112]).unwrap().0
    }

    fn data_directory(&self, index: usize) -> (u32, u32) {
        let offset = self.lfanew() + 4 + 20 + 112 + index * 8;
        let entry: &pe::ImageDataDirectory =
            object::from_bytes(&self.bytes[offset..offset + 8]).unwrap().0;
        (
            entry.virtual_address.get(LittleEndian),
            entry.size.get(LittleEndian),
        )
    }

    fn sections(&self) -> &[pe::ImageSectionHeader] {
        let count = self.file_header().number_of_sections.get(LittleEndian) as usize;
        let offset = self.lfanew() + 4 + 20 + 240;
        object::slice_from_bytes(&self.bytes[offset..], count).unwrap().0
    }

    fn section(&self, name: &str) -> &pe::ImageSectionHeader {
        self.try_section(name)
            .unwrap_or_else(|| panic!("no output section named {name}"))
    }

    fn try_section(&self, name: &str) -> Option<&pe::ImageSectionHeader> {
        self.sections().iter().find(|section| {
            let len = memchr::memchr(0, &section.name).unwrap_or(8);
            &section.name[..len] == name.as_bytes()
        })
    }

    fn u32_at(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.bytes[offset..offset + 4].try_into().unwrap())
    }

    fn u64_at(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.bytes[offset..offset + 8].try_into().unwrap())
    }
}

/// The structural invariants every produced image must satisfy.
fn check_invariants(image: &Image) {
    assert_eq!(&image.bytes[..2], b"MZ");
    let optional = image.optional_header();
    assert_eq!(optional.magic.get(LittleEndian), 0x20b);
    assert_eq!(optional.section_alignment.get(LittleEndian), 0x1000);
    assert_eq!(optional.file_alignment.get(LittleEndian), 0x200);
    assert_eq!(optional.number_of_rva_and_sizes.get(LittleEndian), 16);

    let mut previous_rva_end = 0u64;
    let mut previous_file_end = 0u64;
    for section in image.sections() {
        let rva = u64::from(section.virtual_address.get(LittleEndian));
        let raw = u64::from(section.size_of_raw_data.get(LittleEndian));
        let file = u64::from(section.pointer_to_raw_data.get(LittleEndian));
        assert_eq!(rva % 0x1000, 0);
        assert!(rva >= previous_rva_end);
        previous_rva_end = rva + u64::from(section.virtual_size.get(LittleEndian));
        if raw > 0 {
            assert_eq!(file % 0x200, 0);
            assert!(file >= previous_file_end);
            previous_file_end = file + raw;
            assert!(file + raw <= image.bytes.len() as u64);
        }
    }
}

// ---------------------------------------------------------------------------
// Scenarios

#[test]
fn empty_text() {
    // One object whose .text is a single RET.
    let object = build_object(
        &[SectionSpec {
            name: ".text",
            data: vec![0xc3],
            characteristics: TEXT,
            relocations: vec![],
        }],
        &[defined("main", 1, 0)],
    );
    let image = link("empty_text", &[("main.obj", object)]).unwrap();
    check_invariants(&image);

    assert_eq!(image.file_header().number_of_sections.get(LittleEndian), 1);
    let optional = image.optional_header();
    assert_eq!(optional.address_of_entry_point.get(LittleEndian), 0x1000);
    assert_eq!(optional.base_of_code.get(LittleEndian), 0x1000);
    assert_eq!(optional.size_of_code.get(LittleEndian), 0x200);
    assert_eq!(optional.size_of_image.get(LittleEndian), 0x2000);
    assert_eq!(optional.image_base.get(LittleEndian), 0x1_4000_0000);

    let text = image.section(".text");
    assert_eq!(text.virtual_address.get(LittleEndian), 0x1000);
    assert_eq!(text.pointer_to_raw_data.get(LittleEndian), 0x1000);
    assert_eq!(image.bytes[0x1000], 0xc3);
    // Code sections are padded with int3.
    assert_eq!(image.bytes[0x1001], 0xcc);
    assert_eq!(image.bytes.len(), 0x1200);
}

#[test]
fn rel32_across_objects() {
    // Object A calls puts, defined by object B. A's chunk is padded to 0x40 bytes so B's .text
    // lands at RVA 0x1040.
    let mut a_text = vec![0xcc; 0x40];
    a_text[0x10] = 0xe8; // call rel32, displacement at 0x11
    a_text[0x11..0x15].fill(0);
    let a = build_object(
        &[SectionSpec {
            name: ".text",
            data: a_text,
            characteristics: TEXT,
            relocations: vec![(0x11, 1, pe::IMAGE_REL_AMD64_REL32)],
        }],
        &[defined("main", 1, 0), undefined("puts")],
    );
    let b = build_object(
        &[SectionSpec {
            name: ".text",
            data: vec![0xc3],
            characteristics: TEXT,
            relocations: vec![],
        }],
        &[defined("puts", 1, 0)],
    );
    let image = link("rel32", &[("a.obj", a), ("b.obj", b)]).unwrap();
    check_invariants(&image);

    // puts is at 0x1040; the next instruction boundary is 0x1015.
    assert_eq!(image.u32_at(0x1011), 0x1040 - 0x1015);
}

#[test]
fn comdat_dedup() {
    // Both objects carry the same COMDAT section defining foo; the first definition wins and the
    // second chunk must not reach the output.
    let comdat_foo = SectionSpec {
        name: ".text$fo",
        data: vec![0x90, 0x90, 0x90, 0xc3],
        characteristics: TEXT | pe::IMAGE_SCN_LNK_COMDAT,
        relocations: vec![],
    };
    let a = build_object(
        &[
            SectionSpec {
                name: ".text",
                data: vec![0xe8, 0, 0, 0, 0],
                characteristics: TEXT,
                relocations: vec![(1, 1, pe::IMAGE_REL_AMD64_REL32)],
            },
            comdat_foo.clone(),
        ],
        &[defined("main", 1, 0), defined("foo", 2, 0)],
    );
    let b = build_object(&[comdat_foo], &[defined("foo", 1, 0)]);

    let image = link("comdat_dedup", &[("a.obj", a), ("b.obj", b)]).unwrap();
    check_invariants(&image);

    // main (5 bytes), then one copy of foo at the next 16-byte boundary. A second copy would
    // push virtual size to 0x24.
    let text = image.section(".text");
    assert_eq!(text.virtual_size.get(LittleEndian), 0x14);
    // The call resolves to the surviving copy at 0x1010.
    assert_eq!(image.u32_at(0x1001), 0x1010 - 0x1005);
}

#[test]
fn associative_children_follow_parent() {
    // .pdata$fo is associative to .text$fo. When foo is referenced both survive; when it isn't,
    // both are discarded.
    let build = |call_foo: bool| {
        let mut main_text = vec![0xcc; 5];
        let mut relocations = vec![];
        if call_foo {
            main_text = vec![0xe8, 0, 0, 0, 0];
            relocations.push((1, 1, pe::IMAGE_REL_AMD64_REL32));
        }
        build_object(
            &[
                SectionSpec {
                    name: ".text",
                    data: main_text,
                    characteristics: TEXT,
                    relocations,
                },
                SectionSpec {
                    name: ".text$fo",
                    data: vec![0xc3],
                    characteristics: TEXT | pe::IMAGE_SCN_LNK_COMDAT,
                    relocations: vec![],
                },
                SectionSpec {
                    name: ".pdata$fo",
                    data: vec![1, 2, 3, 4, 5, 6, 7, 8],
                    characteristics: DATA | pe::IMAGE_SCN_LNK_COMDAT,
                    relocations: vec![],
                },
            ],
            &[
                defined("main", 1, 0),
                defined("foo", 2, 0),
                section_symbol(
                    ".pdata$f",
                    3,
                    AuxSpec::SectionDefinition {
                        number: 2,
                        selection: pe::IMAGE_COMDAT_SELECT_ASSOCIATIVE,
                    },
                ),
            ],
        )
    };

    let live = link("assoc_live", &[("a.obj", build(true))]).unwrap();
    check_invariants(&live);
    assert_eq!(live.section(".pdata").virtual_size.get(LittleEndian), 8);

    let dead = link("assoc_dead", &[("a.obj", build(false))]).unwrap();
    check_invariants(&dead);
    assert!(dead.try_section(".pdata").is_none());
    assert_eq!(dead.section(".text").virtual_size.get(LittleEndian), 5);
}

#[test]
fn import_thunk() {
    // MessageBoxA is imported from user32.dll via an archive of short import members. The call
    // goes through a synthesized JMP thunk and the import address table.
    let member = build_import_member("MessageBoxA", "user32.dll", true);
    let archive = build_archive(
        &[("user32", member)],
        &[("__imp_MessageBoxA", 0), ("MessageBoxA", 0)],
    );
    let mut main_text = vec![0xcc; 0x10];
    main_text[0x8] = 0xe8;
    main_text[0x9..0xd].fill(0);
    let main = build_object(
        &[SectionSpec {
            name: ".text",
            data: main_text,
            characteristics: TEXT,
            relocations: vec![(0x9, 1, pe::IMAGE_REL_AMD64_REL32)],
        }],
        &[defined("main", 1, 0), undefined("MessageBoxA")],
    );

    let image = link("import_thunk", &[("main.obj", main), ("user32.lib", archive)]).unwrap();
    check_invariants(&image);

    let text = image.section(".text");
    let idata = image.section(".idata");
    assert_eq!(text.virtual_address.get(LittleEndian), 0x1000);
    assert_eq!(idata.virtual_address.get(LittleEndian), 0x2000);
    let idata_file = idata.pointer_to_raw_data.get(LittleEndian) as usize;

    // .idata layout: one directory entry + null (40), lookup table + null (16), address table +
    // null (16), then the hint/name entry and the DLL name.
    let (import_rva, import_size) = image.data_directory(pe::IMAGE_DIRECTORY_ENTRY_IMPORT);
    assert_eq!(import_rva, 0x2000);
    assert_eq!(import_size, idata.virtual_size.get(LittleEndian));
    let (iat_rva, iat_size) = image.data_directory(pe::IMAGE_DIRECTORY_ENTRY_IAT);
    assert_eq!(iat_rva, 0x2000 + 40 + 16);
    assert_eq!(iat_size, 16);

    // The directory entry points at the lookup table, the DLL name and the address table.
    let directory: &pe::ImageImportDescriptor =
        object::from_bytes(&image.bytes[idata_file..idata_file + 20]).unwrap().0;
    assert_eq!(directory.original_first_thunk.get(LittleEndian), 0x2000 + 40);
    assert_eq!(directory.first_thunk.get(LittleEndian), iat_rva);
    let dll_name_rva = directory.name.get(LittleEndian);
    let dll_name_file = idata_file + (dll_name_rva - 0x2000) as usize;
    assert_eq!(
        &image.bytes[dll_name_file..dll_name_file + 11],
        b"user32.dll\0"
    );

    // Both tables hold the RVA of the hint/name entry; the terminator slot is zero.
    let hint_rva = image.u32_at(idata_file + 40);
    assert_eq!(image.u32_at(idata_file + 56), hint_rva);
    assert_eq!(image.u64_at(idata_file + 64), 0);
    let hint_file = idata_file + (hint_rva - 0x2000) as usize;
    assert_eq!(&image.bytes[hint_file..hint_file + 13], b"\0\0MessageBoxA");

    // The thunk sits after main's 16 bytes of .text: FF 25 then the displacement to the IAT.
    assert_eq!(&image.bytes[0x1010..0x1012], &[0xff, 0x25]);
    assert_eq!(image.u32_at(0x1012), iat_rva - 0x1010 - 6);

    // The call in main goes to the thunk.
    assert_eq!(image.u32_at(0x1009), 0x1010 - 0x1009 - 4);
}

#[test]
fn archive_member_loaded_once() {
    // One member defines both bar and baz; referencing both must load it exactly once.
    let member = build_object(
        &[SectionSpec {
            name: ".data",
            data: vec![0x11; 8],
            characteristics: DATA,
            relocations: vec![],
        }],
        &[defined("bar", 1, 0), defined("baz", 1, 4)],
    );
    let archive = build_archive(&[("util", member)], &[("bar", 0), ("baz", 0)]);
    let main = build_object(
        &[SectionSpec {
            name: ".text",
            data: vec![0; 0x10],
            characteristics: TEXT,
            relocations: vec![
                (0x2, 1, pe::IMAGE_REL_AMD64_ADDR32NB),
                (0x8, 2, pe::IMAGE_REL_AMD64_ADDR32NB),
            ],
        }],
        &[defined("main", 1, 0), undefined("bar"), undefined("baz")],
    );

    let image = link(
        "archive_once",
        &[("main.obj", main), ("util.lib", archive)],
    )
    .unwrap();
    check_invariants(&image);

    // Exactly one copy of the member's .data, placed before .text in name order.
    let data = image.section(".data");
    assert_eq!(data.virtual_size.get(LittleEndian), 8);
    let data_rva = data.virtual_address.get(LittleEndian);
    assert_eq!(data_rva, 0x1000);
    let text_file = image.section(".text").pointer_to_raw_data.get(LittleEndian) as usize;
    assert_eq!(image.u32_at(text_file + 0x2), data_rva);
    assert_eq!(image.u32_at(text_file + 0x8), data_rva + 4);
}

#[test]
fn weak_external_falls_back_to_alias() {
    // wk is a weak external aliased to wk_impl; nothing defines wk, so the call lands on
    // wk_impl at 0x1010.
    let mut text = vec![0xcc; 0x20];
    text[0x8] = 0xe8;
    text[0x9..0xd].fill(0);
    text[0x10] = 0xc3;
    let object = build_object(
        &[SectionSpec {
            name: ".text",
            data: text,
            characteristics: TEXT,
            relocations: vec![(0x9, 2, pe::IMAGE_REL_AMD64_REL32)],
        }],
        &[
            defined("main", 1, 0),
            defined("wk_impl", 1, 0x10),
            SymbolSpec {
                name: "wk",
                value: 0,
                section: 0,
                storage_class: pe::IMAGE_SYM_CLASS_WEAK_EXTERNAL,
                typ: 0x20,
                aux: Some(AuxSpec::WeakExternal { tag: 1 }),
            },
        ],
    );
    let image = link("weak_external", &[("main.obj", object)]).unwrap();
    check_invariants(&image);
    assert_eq!(image.u32_at(0x1009), 0x1010 - 0x1009 - 4);
}

#[test]
fn common_symbols_take_largest() {
    // Two tentative definitions of buf; the 64-byte one wins resolution.
    let a = build_object(
        &[SectionSpec {
            name: ".text",
            data: {
                let mut text = vec![0u8; 0x10];
                text[0] = 0xc3;
                text
            },
            characteristics: TEXT,
            relocations: vec![(0x4, 1, pe::IMAGE_REL_AMD64_ADDR32NB)],
        }],
        &[defined("main", 1, 0), common("buf", 16)],
    );
    let b = build_object(&[], &[common("buf", 64)]);
    let image = link("commons", &[("a.obj", a), ("b.obj", b)]).unwrap();
    check_invariants(&image);

    // Both common chunks get .bss storage; the reference resolves to the 64-byte winner, which
    // sits after the loser's 16 bytes.
    let bss = image.section(".bss");
    assert_eq!(bss.size_of_raw_data.get(LittleEndian), 0);
    assert_eq!(bss.pointer_to_raw_data.get(LittleEndian), 0);
    assert_eq!(bss.virtual_size.get(LittleEndian), 80);
    let bss_rva = bss.virtual_address.get(LittleEndian);
    let text = image.section(".text");
    let text_file = text.pointer_to_raw_data.get(LittleEndian) as usize;
    assert_eq!(image.u32_at(text_file + 4), bss_rva + 16);
}

#[test]
fn unresolved_symbol_is_reported() {
    let object = build_object(
        &[SectionSpec {
            name: ".text",
            data: vec![0xe8, 0, 0, 0, 0],
            characteristics: TEXT,
            relocations: vec![(1, 1, pe::IMAGE_REL_AMD64_REL32)],
        }],
        &[defined("main", 1, 0), undefined("missing")],
    );
    let error = link("unresolved", &[("main.obj", object)]).unwrap_err();
    assert!(error.to_string().contains("undefined symbol: missing"));
}

#[test]
fn duplicate_definition_is_reported() {
    let make = || {
        build_object(
            &[SectionSpec {
                name: ".text",
                data: vec![0xc3],
                characteristics: TEXT,
                relocations: vec![],
            }],
            &[defined("main", 1, 0)],
        )
    };
    let error = link("duplicate", &[("a.obj", make()), ("b.obj", make())]).unwrap_err();
    assert!(error.to_string().contains("duplicate symbol: main"));
}

#[test]
fn missing_entry_point_is_reported() {
    let object = build_object(
        &[SectionSpec {
            name: ".text",
            data: vec![0xc3],
            characteristics: TEXT,
            relocations: vec![],
        }],
        &[defined("start", 1, 0)],
    );
    let error = link("missing_entry", &[("start.obj", object)]).unwrap_err();
    assert!(error.to_string().contains("undefined symbol: main"));
}

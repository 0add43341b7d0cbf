//! Code to read static libraries (`.lib` files, which use the ar format). We don't use a library
//! for this because we want to borrow the bytes of each member and we need the symbol index from
//! the first linker member, which maps symbol names to member offsets and drives lazy loading.

use crate::error::Context as _;
use crate::error::Result;
use anyhow::bail;
use bytemuck::Pod;
use bytemuck::Zeroable;
use hashbrown::HashSet;

pub(crate) struct ArchiveFile<'data> {
    data: &'data [u8],

    /// Name to member-offset pairs from the first linker member, in index order.
    symbols: Vec<ArchiveSymbol<'data>>,

    /// The extended filenames member, if present. Member idents of the form `/123` are offsets
    /// into this.
    extended_names: Option<&'data [u8]>,

    /// Offsets of members that we have already handed out, so that the same member isn't
    /// instantiated twice.
    seen: HashSet<usize>,
}

#[derive(Clone, Copy)]
pub(crate) struct ArchiveSymbol<'data> {
    pub(crate) name: &'data [u8],

    /// Offset from the start of the archive of the member's entry header.
    pub(crate) member_offset: usize,
}

pub(crate) struct Member<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) data: &'data [u8],
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
struct EntryHeader {
    ident: [u8; 16],
    _timestamp: [u8; 12],
    _owner_id: [u8; 6],
    _group_id: [u8; 6],
    _mode: [u8; 8],
    size: [u8; 10],
    end: [u8; 2],
}

const _ASSERTS: () = {
    assert!(size_of::<EntryHeader>() == 60);
};

const HEADER_SIZE: usize = size_of::<EntryHeader>();

impl<'data> ArchiveFile<'data> {
    pub(crate) fn parse(data: &'data [u8]) -> Result<ArchiveFile<'data>> {
        let magic = object::archive::MAGIC;
        let Some(mut rest) = data.strip_prefix(&magic) else {
            bail!("Missing archive header");
        };

        let mut symbols = Vec::new();
        let mut extended_names = None;
        let mut seen_index = false;

        while rest.len() >= HEADER_SIZE {
            let (header_bytes, tail) = rest.split_at(HEADER_SIZE);
            let header: &EntryHeader = bytemuck::from_bytes(header_bytes);
            let size = parse_decimal(&header.size).context("Invalid archive entry size")?;
            if tail.len() < size {
                bail!("Entry size is {size}, but only {} bytes left", tail.len());
            }
            let ident = trimmed_ident(&header.ident);
            let entry_data = &tail[..size];

            match ident {
                b"/" if !seen_index => {
                    // The first linker member: a symbol index mapping names to member offsets.
                    symbols = parse_symbol_index(entry_data)?;
                    seen_index = true;
                }
                b"/" => {
                    // The second linker member duplicates the index in little-endian form. The
                    // first one is always present, so this adds nothing.
                }
                b"//" => extended_names = Some(entry_data),
                _ => {}
            }

            let advance = HEADER_SIZE + size.next_multiple_of(2).min(tail.len());
            rest = &rest[advance.min(rest.len())..];
        }

        Ok(ArchiveFile {
            data,
            symbols,
            extended_names,
            seen: HashSet::new(),
        })
    }

    pub(crate) fn symbols(&self) -> &[ArchiveSymbol<'data>] {
        &self.symbols
    }

    /// Returns the member whose entry header is at `offset`, or None if that member has already
    /// been returned. The caller treats None as "already loaded, nothing new to do".
    pub(crate) fn member(&mut self, offset: usize) -> Result<Option<Member<'data>>> {
        if !self.seen.insert(offset) {
            return Ok(None);
        }
        let header_bytes = self
            .data
            .get(offset..offset + HEADER_SIZE)
            .context("Archive member offset out of bounds")?;
        let header: &EntryHeader = bytemuck::from_bytes(header_bytes);
        let size = parse_decimal(&header.size).context("Invalid archive entry size")?;
        let data = self
            .data
            .get(offset + HEADER_SIZE..offset + HEADER_SIZE + size)
            .context("Archive member data out of bounds")?;
        Ok(Some(Member {
            name: self.member_name(&header.ident),
            data,
        }))
    }

    /// Resolves a member ident, looking through the extended filenames member if needed. This is
    /// only used for diagnostics, so failures degrade to the raw ident.
    fn member_name(&self, ident: &'data [u8; 16]) -> &'data [u8] {
        let ident = trimmed_ident(ident);
        if let Some(rest) = ident.strip_prefix(b"/")
            && let Some(names) = self.extended_names
            && let Ok(offset) = std::str::from_utf8(rest).unwrap_or("").parse::<usize>()
            && let Some(names) = names.get(offset..)
        {
            let end = memchr::memchr(b'\n', names).unwrap_or(names.len());
            return names[..end].strip_suffix(b"/").unwrap_or(&names[..end]);
        }
        ident
    }
}

/// Member idents are padded with spaces and, except for the linker members, end with a '/'.
fn trimmed_ident(ident: &[u8; 16]) -> &[u8] {
    let mut bytes: &[u8] = ident;
    while let Some((last, rest)) = bytes.split_last() {
        if *last == b' ' {
            bytes = rest;
        } else {
            break;
        }
    }
    if bytes != b"/" && bytes != b"//" {
        bytes = bytes.strip_suffix(b"/").unwrap_or(bytes);
    }
    bytes
}

fn parse_decimal(bytes: &[u8]) -> Option<usize> {
    let mut value: usize = 0;
    let mut any = false;
    for &b in bytes {
        match b {
            b'0'..=b'9' => {
                value = value.checked_mul(10)?.checked_add((b - b'0') as usize)?;
                any = true;
            }
            b' ' | 0 => break,
            _ => return None,
        }
    }
    any.then_some(value)
}

/// The first linker member is big-endian: a count, then member offsets, then the names as
/// consecutive null-terminated strings.
fn parse_symbol_index(data: &[u8]) -> Result<Vec<ArchiveSymbol<'_>>> {
    let count_bytes: [u8; 4] = data
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .context("Truncated archive symbol index")?;
    let count = u32::from_be_bytes(count_bytes) as usize;
    let offsets_end = 4 + count.checked_mul(4).context("Archive symbol index too large")?;
    let offsets = data
        .get(4..offsets_end)
        .context("Truncated archive symbol index")?;
    let mut names = data.get(offsets_end..).unwrap_or_default();

    let mut symbols = Vec::with_capacity(count);
    for i in 0..count {
        let offset_bytes: [u8; 4] = offsets[i * 4..i * 4 + 4].try_into().unwrap();
        let member_offset = u32::from_be_bytes(offset_bytes) as usize;
        let end = memchr::memchr(0, names).context("Truncated archive symbol names")?;
        symbols.push(ArchiveSymbol {
            name: &names[..end],
            member_offset,
        });
        names = &names[end + 1..];
    }
    Ok(symbols)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_entry(out: &mut Vec<u8>, ident: &[u8], data: &[u8]) -> usize {
        let offset = out.len();
        let mut header = [b' '; HEADER_SIZE];
        header[..ident.len()].copy_from_slice(ident);
        let size = format!("{}", data.len());
        header[48..48 + size.len()].copy_from_slice(size.as_bytes());
        header[58] = b'`';
        header[59] = b'\n';
        out.extend_from_slice(&header);
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(b'\n');
        }
        offset
    }

    fn build_archive() -> (Vec<u8>, usize) {
        let member_data = b"0123456789abcdef";
        // The member ends up after the magic (8), the index header (60) and the index data (20).
        let member_offset = 8 + 60 + 20;
        let mut index = Vec::new();
        index.extend_from_slice(&2u32.to_be_bytes());
        index.extend_from_slice(&(member_offset as u32).to_be_bytes());
        index.extend_from_slice(&(member_offset as u32).to_be_bytes());
        index.extend_from_slice(b"foo\0bar\0");

        let mut out = Vec::new();
        out.extend_from_slice(&object::archive::MAGIC);
        push_entry(&mut out, b"/", &index);
        let actual_offset = push_entry(&mut out, b"m.obj/", member_data);
        assert_eq!(actual_offset, member_offset);
        (out, member_offset)
    }

    #[test]
    fn symbol_index() {
        let (bytes, member_offset) = build_archive();
        let archive = ArchiveFile::parse(&bytes).unwrap();
        let symbols = archive.symbols();
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].name, b"foo");
        assert_eq!(symbols[1].name, b"bar");
        assert_eq!(symbols[0].member_offset, member_offset);
    }

    #[test]
    fn member_returned_once() {
        let (bytes, member_offset) = build_archive();
        let mut archive = ArchiveFile::parse(&bytes).unwrap();
        let member = archive.member(member_offset).unwrap().unwrap();
        assert_eq!(member.name, b"m.obj");
        assert_eq!(member.data, b"0123456789abcdef");
        assert!(archive.member(member_offset).unwrap().is_none());
    }

    #[test]
    fn parse_sizes() {
        assert_eq!(parse_decimal(b"123       "), Some(123));
        assert_eq!(parse_decimal(b"0         "), Some(0));
        assert_eq!(parse_decimal(b"x         "), None);
    }
}

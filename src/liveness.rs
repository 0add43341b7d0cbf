//! Garbage collection of unreferenced sections. Starting from the root set (sections that are
//! not COMDAT, not associative children and not code, plus whatever the entry symbol lives in),
//! chunks are marked live through relocation edges and associative-child edges. Everything left
//! unmarked is dropped by layout.

use crate::chunks::ChunkId;
use crate::chunks::ChunkKind;
use crate::coff::CoffSymbol as _;
use crate::error::Result;
use crate::parsing::LinkFile;
use crate::symbol_db::SymbolDb;
use object::LittleEndian;

pub(crate) fn mark_live(db: &mut SymbolDb) -> Result<()> {
    let mut work_list = Vec::new();

    if let Some(chunk) = db.body(db.entry_body()?).chunk() {
        work_list.push(chunk);
    }
    for chunk_id in db.object_chunks() {
        if db.chunk(chunk_id).is_root() {
            work_list.push(chunk_id);
        }
    }

    while let Some(chunk_id) = work_list.pop() {
        let (file, relocations) = {
            let chunk = db.chunk_mut(chunk_id);
            let ChunkKind::Section(section) = &mut chunk.kind else {
                // Common and synthetic chunks are always live and reference nothing.
                continue;
            };
            if section.live {
                continue;
            }
            section.live = true;
            work_list.extend(section.assoc_children.iter().copied());
            (section.file, section.relocations)
        };

        for relocation in relocations {
            let index = relocation.symbol_table_index.get(LittleEndian) as usize;
            let body = db.resolved_body(file, index)?;
            if let Some(target) = db.body(body).chunk() {
                work_list.push(target);
            }
        }
    }
    Ok(())
}

/// Prints `Discarded <name> from <file>` for every external function symbol defined in the given
/// dead chunk. Only called when verbose output was requested.
pub(crate) fn print_discard_message(db: &SymbolDb, chunk_id: ChunkId) {
    let ChunkKind::Section(section) = &db.chunk(chunk_id).kind else {
        return;
    };
    let LinkFile::Object(object) = &db.files[section.file.as_usize()] else {
        return;
    };

    let mut index = 0;
    while index < object.coff.symbols.len() {
        let symbol = &object.coff.symbols[index];
        let next = index + 1 + symbol.num_aux();
        if symbol.section_number() == section.section_number as i32
            && symbol.is_external()
            && symbol.is_function()
            && let Ok(name) = object.coff.symbol_name(symbol)
        {
            crate::error::warning(&format!(
                "Discarded {} from {}",
                String::from_utf8_lossy(name),
                object.name
            ));
        }
        index = next;
    }
}

//! The symbol database: a map from global names to symbol cells over arenas of symbol bodies,
//! chunks and input files. Resolution follows a partial order (undefined < lazy < defined);
//! lazy archive symbols that an undefined reference asks for are queued and materialised in a
//! fixed-point loop after the explicit inputs have been added.

use crate::args::Args;
use crate::chunks::Chunk;
use crate::chunks::ChunkId;
use crate::chunks::ChunkKind;
use crate::error::Context as _;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::input_data::InputData;
use crate::parsing;
use crate::parsing::FileId;
use crate::parsing::LinkFile;
use crate::symbol::BodyId;
use crate::symbol::DefinedAbsolute;
use crate::symbol::SymbolBody;
use crate::symbol::SymbolId;
use crate::symbol::Undefined;
use anyhow::bail;
use bumpalo::Bump;
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use std::collections::VecDeque;

pub(crate) struct SymbolDb<'data> {
    pub(crate) args: &'data Args,

    /// Arena for names we synthesise during the link (`__imp_` prefixes, the entry name).
    names_alloc: &'data Bump,

    /// Global names to their symbol cell.
    names: HashMap<&'data [u8], SymbolId>,

    /// Global cells in first-mention order, so diagnostics come out in file order then symbol
    /// order.
    global_cells: Vec<SymbolId>,

    /// Cell index to the current best body for that cell's name.
    cells: Vec<BodyId>,

    bodies: Vec<SymbolBody<'data>>,
    pub(crate) chunks: Vec<Chunk<'data>>,
    pub(crate) files: Vec<LinkFile<'data>>,

    /// Files that contribute chunks, in input order.
    pub(crate) object_files: Vec<FileId>,

    /// Import files, in load order. The import tables are built from these.
    pub(crate) import_files: Vec<FileId>,

    /// Lazy bodies that an undefined reference has asked for. Drained to a fixed point by
    /// `load_archive_members`.
    pending_members: VecDeque<BodyId>,

    /// Duplicate-definition diagnostics, reported together with unresolved symbols.
    duplicate_errors: Vec<String>,
}

enum DefinedClass {
    Comdat,
    Common(u64),
    Other,
}

impl<'data> SymbolDb<'data> {
    pub(crate) fn build(
        input_data: &'data InputData,
        names_alloc: &'data Bump,
        args: &'data Args,
    ) -> Result<SymbolDb<'data>> {
        let mut db = SymbolDb {
            args,
            names_alloc,
            names: HashMap::new(),
            global_cells: Vec::new(),
            cells: Vec::new(),
            bodies: Vec::new(),
            chunks: Vec::new(),
            files: Vec::new(),
            object_files: Vec::new(),
            import_files: Vec::new(),
            pending_members: VecDeque::new(),
            duplicate_errors: Vec::new(),
        };

        // The link starts knowing the image base and wanting the entry point.
        let image_base_body = db.add_body(SymbolBody::DefinedAbsolute(DefinedAbsolute {
            name: b"__ImageBase",
            va: args.image_base,
        }));
        db.resolve(image_base_body)?;
        let entry_name = db.alloc_name(b"", args.entry.as_bytes());
        let entry_body = db.add_body(SymbolBody::Undefined(Undefined {
            name: entry_name,
            weak_alias: None,
        }));
        db.resolve(entry_body)?;

        for file in &input_data.files {
            let name = file.filename.display().to_string();
            db.add_file(name, file.data(), file.kind)?;
        }
        Ok(db)
    }

    pub(crate) fn add_file(
        &mut self,
        name: String,
        data: &'data [u8],
        kind: FileKind,
    ) -> Result<()> {
        match kind {
            FileKind::Coff => {
                let file_id = parsing::parse_object(self, name, data)?;
                self.register_object(file_id)?;
            }
            FileKind::Archive => {
                let file_id = parsing::parse_archive(self, name, data)?;
                self.register_archive(file_id)?;
            }
            FileKind::ImportLibrary => {
                let file_id = parsing::parse_import_file(self, name, data)?;
                self.register_import(file_id)?;
            }
        }
        Ok(())
    }

    fn register_object(&mut self, file_id: FileId) -> Result<()> {
        let LinkFile::Object(file) = &mut self.files[file_id.as_usize()] else {
            unreachable!();
        };
        let pending = std::mem::take(&mut file.pending_symbols);
        if let Some(directives) = file.directives {
            tracing::debug!(
                "{}: directives: {}",
                file.name,
                String::from_utf8_lossy(directives)
            );
        }

        let mut sparse_updates = Vec::with_capacity(pending.len());
        for symbol in pending {
            let cell = if symbol.external {
                self.resolve(symbol.body)?
            } else {
                self.add_private_cell(symbol.body)
            };
            sparse_updates.push((symbol.symbol_index as usize, cell));
        }

        let LinkFile::Object(file) = &mut self.files[file_id.as_usize()] else {
            unreachable!();
        };
        for (index, cell) in sparse_updates {
            file.sparse_cells[index] = Some(cell);
        }
        self.object_files.push(file_id);
        Ok(())
    }

    fn register_archive(&mut self, file_id: FileId) -> Result<()> {
        let LinkFile::Archive(file) = &mut self.files[file_id.as_usize()] else {
            unreachable!();
        };
        let bodies = std::mem::take(&mut file.lazy_bodies);
        for body in bodies {
            self.resolve(body)?;
        }
        Ok(())
    }

    fn register_import(&mut self, file_id: FileId) -> Result<()> {
        let LinkFile::Import(file) = &self.files[file_id.as_usize()] else {
            unreachable!();
        };
        let bodies = file.bodies.clone();
        for body in bodies {
            self.resolve(body)?;
        }
        self.import_files.push(file_id);
        Ok(())
    }

    /// Resolves conflicts between an incoming body and whatever already holds its name. An
    /// incoming body wins iff it has strictly higher rank; ties between defined bodies go through
    /// the COMDAT/common rules. Whenever an undefined reference meets a lazy archive symbol, the
    /// member is queued for loading.
    fn resolve(&mut self, new: BodyId) -> Result<SymbolId> {
        let name = self.bodies[new.as_usize()].name();
        let cell = match self.names.entry(name) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                let cell = SymbolId::from_usize(self.cells.len());
                self.cells.push(new);
                entry.insert(cell);
                self.global_cells.push(cell);
                return Ok(cell);
            }
        };

        let existing = self.cells[cell.as_usize()];
        let existing_rank = self.bodies[existing.as_usize()].rank();
        let new_rank = self.bodies[new.as_usize()].rank();
        if new_rank > existing_rank {
            self.cells[cell.as_usize()] = new;
        } else if new_rank == existing_rank {
            match new_rank {
                0 => {
                    // Both undefined. Keep the first, unless only the newcomer brings a weak
                    // alias.
                    if let (SymbolBody::Undefined(e), SymbolBody::Undefined(n)) = (
                        &self.bodies[existing.as_usize()],
                        &self.bodies[new.as_usize()],
                    ) && e.weak_alias.is_none()
                        && n.weak_alias.is_some()
                    {
                        self.cells[cell.as_usize()] = new;
                    }
                }
                1 => {
                    // Both lazy: the first archive on the command line wins.
                }
                _ => self.resolve_defined_pair(cell, existing, new),
            }
        }

        if existing_rank == 0 || new_rank == 0 {
            let winner = self.cells[cell.as_usize()];
            if matches!(self.bodies[winner.as_usize()], SymbolBody::Lazy(_)) {
                self.pending_members.push_back(winner);
            }
        }
        Ok(cell)
    }

    fn resolve_defined_pair(&mut self, cell: SymbolId, existing: BodyId, new: BodyId) {
        match (self.defined_class(existing), self.defined_class(new)) {
            // COMDAT sections are deduplication candidates: the first definition is kept and the
            // newcomer's chunk is left unreferenced for the garbage collector.
            (DefinedClass::Comdat, DefinedClass::Comdat) => {}
            // Two commons keep the larger allocation.
            (DefinedClass::Common(existing_size), DefinedClass::Common(new_size)) => {
                if new_size > existing_size {
                    self.cells[cell.as_usize()] = new;
                }
            }
            // A real definition beats a tentative common one.
            (DefinedClass::Common(_), _) => self.cells[cell.as_usize()] = new,
            (_, DefinedClass::Common(_)) => {}
            _ => {
                let name = self.bodies[new.as_usize()].name();
                self.duplicate_errors
                    .push(format!("duplicate symbol: {}", String::from_utf8_lossy(name)));
            }
        }
    }

    fn defined_class(&self, body: BodyId) -> DefinedClass {
        match &self.bodies[body.as_usize()] {
            SymbolBody::DefinedRegular(regular) => {
                match &self.chunks[regular.chunk.as_usize()].kind {
                    ChunkKind::Common(common) => DefinedClass::Common(common.size),
                    ChunkKind::Section(section) if section.is_comdat() => DefinedClass::Comdat,
                    _ => DefinedClass::Other,
                }
            }
            _ => DefinedClass::Other,
        }
    }

    /// Materialises queued archive members until no undefined symbol still resolves to a lazy
    /// body. Loading a member can introduce new undefined symbols, which can queue more members.
    pub(crate) fn load_archive_members(&mut self) -> Result<()> {
        while let Some(lazy_id) = self.pending_members.pop_front() {
            let SymbolBody::Lazy(lazy) = &self.bodies[lazy_id.as_usize()] else {
                continue;
            };
            let (symbol_name, archive_id, member_offset) =
                (lazy.name, lazy.file, lazy.member_offset);

            // Skip if the name was defined in the meantime, e.g. by a member loaded for another
            // symbol.
            let cell = *self
                .names
                .get(symbol_name)
                .context("Internal error: pending member symbol has no cell")?;
            if self.cells[cell.as_usize()] != lazy_id {
                continue;
            }

            let LinkFile::Archive(archive) = &mut self.files[archive_id.as_usize()] else {
                bail!("Internal error: lazy symbol not owned by an archive");
            };
            let archive_name = archive.name.clone();
            // An already-loaded member defines nothing new.
            let Some(member) = archive.archive.member(member_offset)? else {
                continue;
            };

            let member_name = format!(
                "{archive_name}({})",
                String::from_utf8_lossy(member.name)
            );
            tracing::debug!(
                "Loaded {member_name} for {}",
                String::from_utf8_lossy(symbol_name)
            );

            let kind = FileKind::identify_bytes(member.data)
                .with_context(|| format!("Failed to parse `{member_name}`"))?;
            if kind == FileKind::Archive {
                bail!("Nested archive in `{member_name}`");
            }
            self.add_file(member_name, member.data, kind)?;
        }
        Ok(())
    }

    /// Redirects weak externals whose primary stayed undefined, then reports every remaining
    /// undefined symbol together with any duplicate definitions found during resolution.
    pub(crate) fn finalize(&mut self) -> Result<()> {
        let mut errors = std::mem::take(&mut self.duplicate_errors);
        let globals = self.global_cells.clone();
        for cell in globals {
            let body_id = self.cells[cell.as_usize()];
            let SymbolBody::Undefined(undefined) = &self.bodies[body_id.as_usize()] else {
                continue;
            };
            let name = undefined.name;
            if let Some((file, tag)) = undefined.weak_alias
                && let Some(alias_cell) = self.sparse_cell(file, tag as usize)
            {
                let target = self.cells[alias_cell.as_usize()];
                self.cells[cell.as_usize()] = target;
                if self.bodies[target.as_usize()].is_defined() {
                    continue;
                }
            }
            errors.push(format!(
                "undefined symbol: {}",
                String::from_utf8_lossy(name)
            ));
        }
        if !errors.is_empty() {
            bail!("{}", errors.join("\n"));
        }
        Ok(())
    }

    /// Resolves a relocation's symbol-table index to the current winning body for that name.
    pub(crate) fn resolved_body(&self, file: FileId, symbol_index: usize) -> Result<BodyId> {
        let cell = self
            .sparse_cell(file, symbol_index)
            .with_context(|| "relocation against a symbol with no body")?;
        Ok(self.cells[cell.as_usize()])
    }

    fn sparse_cell(&self, file: FileId, symbol_index: usize) -> Option<SymbolId> {
        let LinkFile::Object(object) = &self.files[file.as_usize()] else {
            return None;
        };
        object.sparse_cells.get(symbol_index).copied().flatten()
    }

    /// The RVA of a defined body. Only valid once layout has assigned addresses.
    pub(crate) fn body_rva(&self, body: BodyId) -> Result<u64> {
        match &self.bodies[body.as_usize()] {
            SymbolBody::DefinedRegular(regular) => {
                Ok(self.chunks[regular.chunk.as_usize()].rva + u64::from(regular.value))
            }
            SymbolBody::DefinedAbsolute(absolute) => {
                Ok(absolute.va.wrapping_sub(self.args.image_base))
            }
            SymbolBody::DefinedImportData(import) => {
                let location = import
                    .location
                    .context("Internal error: import symbol was never assigned a slot")?;
                Ok(self.chunks[location.as_usize()].rva)
            }
            SymbolBody::DefinedImportFunc(import) => Ok(self.chunks[import.chunk.as_usize()].rva),
            SymbolBody::Undefined(undefined) => bail!(
                "Internal error: undefined symbol `{}` survived resolution",
                String::from_utf8_lossy(undefined.name)
            ),
            SymbolBody::Lazy(lazy) => bail!(
                "Internal error: lazy symbol `{}` survived resolution",
                String::from_utf8_lossy(lazy.name)
            ),
        }
    }

    /// The body currently elected for `name`, if any.
    pub(crate) fn lookup(&self, name: &[u8]) -> Option<BodyId> {
        let cell = *self.names.get(name)?;
        Some(self.cells[cell.as_usize()])
    }

    pub(crate) fn entry_body(&self) -> Result<BodyId> {
        self.lookup(self.args.entry.as_bytes())
            .with_context(|| format!("Entry symbol `{}` not found", self.args.entry))
    }

    pub(crate) fn body(&self, id: BodyId) -> &SymbolBody<'data> {
        &self.bodies[id.as_usize()]
    }

    pub(crate) fn body_mut(&mut self, id: BodyId) -> &mut SymbolBody<'data> {
        &mut self.bodies[id.as_usize()]
    }

    pub(crate) fn chunk(&self, id: ChunkId) -> &Chunk<'data> {
        &self.chunks[id.as_usize()]
    }

    pub(crate) fn chunk_mut(&mut self, id: ChunkId) -> &mut Chunk<'data> {
        &mut self.chunks[id.as_usize()]
    }

    pub(crate) fn add_body(&mut self, body: SymbolBody<'data>) -> BodyId {
        let id = BodyId::from_usize(self.bodies.len());
        self.bodies.push(body);
        id
    }

    pub(crate) fn add_chunk(&mut self, chunk: Chunk<'data>) -> ChunkId {
        let id = ChunkId::from_usize(self.chunks.len());
        self.chunks.push(chunk);
        id
    }

    pub(crate) fn add_associative(&mut self, parent: ChunkId, child: ChunkId) {
        if let ChunkKind::Section(section) = &mut self.chunks[child.as_usize()].kind {
            section.is_assoc_child = true;
        }
        if let ChunkKind::Section(section) = &mut self.chunks[parent.as_usize()].kind {
            section.assoc_children.push(child);
        }
    }

    pub(crate) fn next_file_id(&self) -> FileId {
        FileId::from_usize(self.files.len())
    }

    pub(crate) fn push_file(&mut self, file: LinkFile<'data>) {
        self.files.push(file);
    }

    /// Copies `prefix` + `name` into the link-lifetime arena.
    pub(crate) fn alloc_name(&self, prefix: &[u8], name: &[u8]) -> &'data [u8] {
        let bytes = self
            .names_alloc
            .alloc_slice_fill_copy(prefix.len() + name.len(), 0u8);
        bytes[..prefix.len()].copy_from_slice(prefix);
        bytes[prefix.len()..].copy_from_slice(name);
        bytes
    }

    /// All chunks contributed by object files, in input order.
    pub(crate) fn object_chunks(&self) -> Vec<ChunkId> {
        let mut result = Vec::new();
        for &file_id in &self.object_files {
            let LinkFile::Object(object) = &self.files[file_id.as_usize()] else {
                continue;
            };
            result.extend(object.chunks.iter().copied().flatten());
        }
        result
    }

    fn add_private_cell(&mut self, body: BodyId) -> SymbolId {
        let cell = SymbolId::from_usize(self.cells.len());
        self.cells.push(body);
        cell
    }
}

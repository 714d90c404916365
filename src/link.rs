use crate::error::FleError;
use crate::obj::{
    FleObject, ObjectKind, ProgramHeader, Reloc, RelocKind, Section, Symbol, SymbolBinding,
    PAGE_SIZE, PF_R, PF_W, PF_X,
};
use crate::opt::{InputOpt, Opt};
use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Fixed virtual base of the text segment.
pub const BASE_ADDR: u64 = 0x400000;

/// Each PLT stub is an indirect jump `ff 25 disp32`.
const PLT_STUB_SIZE: u64 = 6;
const GOT_SLOT_SIZE: u64 = 8;

fn align_up(x: u64, align: u64) -> u64 {
    (x + align - 1) / align * align
}

fn lookup_file(name: &str, paths: &[String]) -> Option<PathBuf> {
    for path in paths {
        let mut p = PathBuf::from(path);
        p.push(name);
        if p.is_file() {
            info!("File {name} is found at {}", p.display());
            return Some(p);
        }
    }
    None
}

/// Resolve a `-l` namespec. Within each directory the shared stub
/// `libNAME.fso` wins over the archive `libNAME.fa`; `-static` restricts
/// the search to archives.
pub fn find_library(name: &str, paths: &[String], link_static: bool) -> anyhow::Result<PathBuf> {
    let dynamic = format!("lib{name}.fso");
    let archive = format!("lib{name}.fa");
    for path in paths {
        if !link_static {
            if let Some(found) = lookup_file(&dynamic, std::slice::from_ref(path)) {
                return Ok(found);
            }
        }
        if let Some(found) = lookup_file(&archive, std::slice::from_ref(path)) {
            return Ok(found);
        }
    }
    Err(FleError::LibraryNotFound(name.to_string()).into())
}

/// Resolve library namespecs to concrete paths, keeping input order.
pub fn path_resolution(opt: &Opt) -> anyhow::Result<Vec<String>> {
    let mut paths = opt.search_dir.clone();
    paths.push("./".to_string());
    opt.inputs
        .iter()
        .map(|input| match input {
            InputOpt::File(file) => Ok(file.clone()),
            InputOpt::Library(name) => find_library(name, &paths, opt.link_static)
                .map(|path| format!("{}", path.display())),
        })
        .collect()
}

/// Output segment a section lands in, by name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Seg {
    Text,
    Rodata,
    Data,
    Bss,
}

fn classify(name: &str) -> Seg {
    if name.starts_with(".text") {
        Seg::Text
    } else if name.starts_with(".rodata") {
        Seg::Rodata
    } else if name.starts_with(".data") {
        Seg::Data
    } else if name.starts_with(".bss") {
        Seg::Bss
    } else {
        // any other allocatable section
        Seg::Data
    }
}

/// Where an input section ended up in its output segment.
#[derive(Debug)]
struct Placement {
    obj_idx: usize,
    name: String,
    seg: Seg,
    seg_off: u64,
}

struct Linker<'a> {
    opt: &'a Opt,

    archives: Vec<&'a FleObject>,
    shared_deps: Vec<&'a FleObject>,

    // the objects participating in linking, base inputs first
    active: Vec<&'a FleObject>,
    placements: Vec<Placement>,
    section_vaddr: BTreeMap<(usize, String), u64>,

    text: Vec<u8>,
    rodata: Vec<u8>,
    data: Vec<u8>,
    bss_size: u64,

    // names defined global/weak by a shared stub
    so_defined: BTreeSet<String>,
    extern_funcs: BTreeSet<String>,
    got_index: BTreeMap<String, u64>,
    plt_size: u64,
    got_size: u64,

    text_base: u64,
    rodata_base: u64,
    data_base: u64,
    got_base: u64,
    bss_base: u64,
    plt_base: u64,

    // symbol name => (binding, absolute address)
    globals: BTreeMap<String, (SymbolBinding, u64)>,
    // per-object local symbol tables, parallel to `active`
    locals: Vec<BTreeMap<String, u64>>,

    // patched bytes: text | plt | rodata | data
    image: Vec<u8>,
    dyn_relocs: Vec<Reloc>,
}

/// Link the input objects into an executable or shared library.
pub fn link(objects: &[FleObject], opt: &Opt) -> anyhow::Result<FleObject> {
    info!(
        "Linking {} objects into {}",
        objects.len(),
        opt.output
    );

    let mut linker = Linker {
        opt,
        archives: vec![],
        shared_deps: vec![],
        active: vec![],
        placements: vec![],
        section_vaddr: BTreeMap::new(),
        text: vec![],
        rodata: vec![],
        data: vec![],
        bss_size: 0,
        so_defined: BTreeSet::new(),
        extern_funcs: BTreeSet::new(),
        got_index: BTreeMap::new(),
        plt_size: 0,
        got_size: 0,
        text_base: 0,
        rodata_base: 0,
        data_base: 0,
        got_base: 0,
        bss_base: 0,
        plt_base: 0,
        globals: BTreeMap::new(),
        locals: vec![],
        image: vec![],
        dyn_relocs: vec![],
    };

    for obj in objects {
        match obj.kind {
            ObjectKind::Archive => linker.archives.push(obj),
            ObjectKind::Shared => linker.shared_deps.push(obj),
            _ => linker.active.push(obj),
        }
    }

    linker.select_members();
    linker.layout();
    linker.resolve()?;
    linker.relocate()?;
    linker.emit()
}

fn local_names(obj: &FleObject) -> BTreeSet<&str> {
    obj.symbols
        .iter()
        .filter(|sym| !sym.section.is_empty() && sym.binding == SymbolBinding::Local)
        .map(|sym| sym.name.as_str())
        .collect()
}

fn nonlocal_names<'o>(obj: &'o FleObject) -> impl Iterator<Item = &'o str> {
    obj.symbols
        .iter()
        .filter(|sym| {
            !sym.section.is_empty()
                && matches!(sym.binding, SymbolBinding::Weak | SymbolBinding::Global)
        })
        .map(|sym| sym.name.as_str())
}

impl<'a> Linker<'a> {
    /// Names referenced by a relocation of an active object that no local
    /// symbol of the referring object and no global/weak symbol of any
    /// active object defines.
    fn collect_unresolved(&self) -> BTreeSet<String> {
        let globals: BTreeSet<&str> = self.active.iter().flat_map(|obj| nonlocal_names(obj)).collect();
        let mut unresolved = BTreeSet::new();
        for obj in &self.active {
            let locals = local_names(obj);
            for section in obj.sections.values() {
                for reloc in &section.relocs {
                    if !locals.contains(reloc.symbol.as_str())
                        && !globals.contains(reloc.symbol.as_str())
                    {
                        unresolved.insert(reloc.symbol.clone());
                    }
                }
            }
        }
        unresolved
    }

    /// Pull archive members that define unresolved names, in archive
    /// order then archive-internal order, until a full pass adds nothing.
    fn select_members(&mut self) {
        let archives = self.archives.clone();
        let mut included = BTreeSet::new();
        loop {
            let mut unresolved = self.collect_unresolved();
            if unresolved.is_empty() {
                return;
            }
            let mut changed = false;
            for (ai, archive) in archives.iter().enumerate() {
                for (mi, member) in archive.members.iter().enumerate() {
                    if included.contains(&(ai, mi)) {
                        continue;
                    }
                    let useful = member.symbols.iter().any(|sym| {
                        !sym.section.is_empty()
                            && sym.binding != SymbolBinding::Local
                            && unresolved.contains(&sym.name)
                    });
                    if useful {
                        info!(
                            "Selecting member {} of archive {}",
                            member.name, archive.name
                        );
                        self.active.push(member);
                        included.insert((ai, mi));
                        changed = true;
                        unresolved = self.collect_unresolved();
                    }
                }
            }
            if !changed {
                return;
            }
        }
    }

    /// Concatenate sections into segments, size the PLT/GOT and assign
    /// segment bases.
    fn layout(&mut self) {
        let active = self.active.clone();
        for (idx, obj) in active.iter().enumerate() {
            // section-header order; fall back to map order for images
            // that carry no section headers
            let order: Vec<(String, u64)> = if !obj.shdrs.is_empty() {
                obj.shdrs
                    .iter()
                    .filter(|shdr| obj.sections.contains_key(&shdr.name))
                    .map(|shdr| (shdr.name.clone(), shdr.size))
                    .collect()
            } else {
                obj.sections
                    .iter()
                    .map(|(name, section)| (name.clone(), section.data.len() as u64))
                    .collect()
            };
            for (name, size) in order {
                let section = &obj.sections[&name];
                let seg = classify(&name);
                let seg_off = match seg {
                    Seg::Text => {
                        let off = self.text.len() as u64;
                        self.text.extend(&section.data);
                        off
                    }
                    Seg::Rodata => {
                        let off = self.rodata.len() as u64;
                        self.rodata.extend(&section.data);
                        off
                    }
                    Seg::Data => {
                        let off = self.data.len() as u64;
                        self.data.extend(&section.data);
                        off
                    }
                    Seg::Bss => {
                        let off = self.bss_size;
                        self.bss_size += size;
                        off
                    }
                };
                self.placements.push(Placement {
                    obj_idx: idx,
                    name,
                    seg,
                    seg_off,
                });
            }
        }

        for so in &self.shared_deps {
            for name in nonlocal_names(so) {
                self.so_defined.insert(name.to_string());
            }
        }

        // scan external references (executable mode only)
        let mut extern_datas = BTreeSet::new();
        if !self.opt.shared {
            let global_defs: BTreeSet<&str> =
                active.iter().flat_map(|obj| nonlocal_names(obj)).collect();
            let local_defs: Vec<BTreeSet<&str>> =
                active.iter().map(|obj| local_names(obj)).collect();
            for placement in &self.placements {
                let obj = active[placement.obj_idx];
                for reloc in &obj.sections[&placement.name].relocs {
                    // section-name pseudo symbols resolve locally
                    if reloc.symbol.starts_with('.') {
                        continue;
                    }
                    let internal = local_defs[placement.obj_idx].contains(reloc.symbol.as_str())
                        || global_defs.contains(reloc.symbol.as_str());
                    match reloc.kind {
                        RelocKind::Pcrel32 => {
                            if !internal && self.so_defined.contains(&reloc.symbol) {
                                self.extern_funcs.insert(reloc.symbol.clone());
                            }
                        }
                        RelocKind::GotPcrel32 => {
                            // internal references with no stub definition
                            // bypass the GOT entirely
                            if !internal || self.so_defined.contains(&reloc.symbol) {
                                extern_datas.insert(reloc.symbol.clone());
                            }
                        }
                        _ => {}
                    }
                }
            }

            // slot order: external functions first, then remaining data
            let mut index = 0;
            for name in &self.extern_funcs {
                self.got_index.insert(name.clone(), index);
                index += 1;
            }
            for name in &extern_datas {
                if !self.got_index.contains_key(name) {
                    self.got_index.insert(name.clone(), index);
                    index += 1;
                }
            }
        }
        self.plt_size = PLT_STUB_SIZE * self.extern_funcs.len() as u64;
        self.got_size = GOT_SLOT_SIZE * self.got_index.len() as u64;

        self.text_base = BASE_ADDR;
        self.rodata_base = align_up(
            self.text_base + self.text.len() as u64 + self.plt_size,
            PAGE_SIZE,
        );
        self.data_base = align_up(self.rodata_base + self.rodata.len() as u64, PAGE_SIZE);
        self.got_base = align_up(self.data_base + self.data.len() as u64, PAGE_SIZE);
        self.bss_base = align_up(self.got_base + self.got_size, PAGE_SIZE);
        self.plt_base = self.text_base + self.text.len() as u64;
        info!(
            "Layout: text {:#x} rodata {:#x} data {:#x} got {:#x} bss {:#x}",
            self.text_base, self.rodata_base, self.data_base, self.got_base, self.bss_base
        );

        for placement in &self.placements {
            let base = match placement.seg {
                Seg::Text => self.text_base,
                Seg::Rodata => self.rodata_base,
                Seg::Data => self.data_base,
                Seg::Bss => self.bss_base,
            };
            self.section_vaddr.insert(
                (placement.obj_idx, placement.name.clone()),
                base + placement.seg_off,
            );
        }
    }

    /// Build the global and per-object local symbol tables.
    fn resolve(&mut self) -> anyhow::Result<()> {
        self.locals = vec![BTreeMap::new(); self.active.len()];
        let active = self.active.clone();
        for (idx, obj) in active.iter().enumerate() {
            for sym in &obj.symbols {
                if sym.section.is_empty() {
                    // only a reference
                    continue;
                }
                let Some(&base) = self.section_vaddr.get(&(idx, sym.section.clone())) else {
                    continue;
                };
                let addr = base + sym.offset;
                match sym.binding {
                    SymbolBinding::Local => {
                        self.locals[idx].insert(sym.name.clone(), addr);
                    }
                    SymbolBinding::Weak | SymbolBinding::Global => {
                        match self.globals.get_mut(&sym.name) {
                            None => {
                                self.globals.insert(sym.name.clone(), (sym.binding, addr));
                            }
                            Some(existing) => match (existing.0, sym.binding) {
                                (SymbolBinding::Global, SymbolBinding::Global) => {
                                    return Err(FleError::DuplicateStrongSymbol(
                                        sym.name.clone(),
                                    )
                                    .into());
                                }
                                (SymbolBinding::Weak, SymbolBinding::Global) => {
                                    *existing = (SymbolBinding::Global, addr);
                                }
                                // first definition wins
                                _ => {}
                            },
                        }
                    }
                    SymbolBinding::Undefined => {}
                }
            }
        }
        Ok(())
    }

    fn lookup(&self, obj_idx: usize, name: &str) -> anyhow::Result<u64> {
        if let Some(&addr) = self.locals[obj_idx].get(name) {
            return Ok(addr);
        }
        if let Some(&(_, addr)) = self.globals.get(name) {
            return Ok(addr);
        }
        Err(FleError::UndefinedSymbol(name.to_string()).into())
    }

    fn is_internal(&self, obj_idx: usize, name: &str) -> bool {
        self.locals[obj_idx].contains_key(name) || self.globals.contains_key(name)
    }

    /// Byte offset of a patch site within the output image, which is laid
    /// out as text | plt | rodata | data. Bss has no file-backed bytes.
    fn patch_offset(&self, seg: Seg, seg_off: u64, reloc_off: u64) -> Option<usize> {
        let text_end = self.text.len() as u64 + self.plt_size;
        let offset = match seg {
            Seg::Text => seg_off + reloc_off,
            Seg::Rodata => text_end + seg_off + reloc_off,
            Seg::Data => text_end + self.rodata.len() as u64 + seg_off + reloc_off,
            Seg::Bss => return None,
        };
        Some(offset as usize)
    }

    /// Patch every static relocation, emit the PLT stubs and collect the
    /// dynamic relocations.
    fn relocate(&mut self) -> anyhow::Result<()> {
        let mut image = Vec::with_capacity(
            self.text.len() + self.plt_size as usize + self.rodata.len() + self.data.len(),
        );
        image.extend(&self.text);
        image.resize(image.len() + self.plt_size as usize, 0);
        image.extend(&self.rodata);
        image.extend(&self.data);

        let mut dyn_out = vec![];
        for placement in &self.placements {
            let obj = self.active[placement.obj_idx];
            let vaddr = self.section_vaddr[&(placement.obj_idx, placement.name.clone())];
            for reloc in &obj.sections[&placement.name].relocs {
                let a = reloc.addend;
                let p = vaddr + reloc.offset;
                let patch = self.patch_offset(placement.seg, placement.seg_off, reloc.offset);
                let internal = self.is_internal(placement.obj_idx, &reloc.symbol);

                if self.opt.shared {
                    if internal && !self.so_defined.contains(&reloc.symbol) {
                        let s = self.lookup(placement.obj_idx, &reloc.symbol)?;
                        patch_in_place(&mut image, patch, reloc, s, a, p)?;
                    } else {
                        // left for the loader to resolve
                        dyn_out.push(Reloc {
                            kind: reloc.kind,
                            offset: p,
                            symbol: reloc.symbol.clone(),
                            addend: a,
                        });
                    }
                    continue;
                }

                let routes_through_got = reloc.kind == RelocKind::GotPcrel32
                    && self.so_defined.contains(&reloc.symbol);
                if internal && !routes_through_got {
                    let s = self.lookup(placement.obj_idx, &reloc.symbol)?;
                    patch_in_place(&mut image, patch, reloc, s, a, p)?;
                } else if self.so_defined.contains(&reloc.symbol) {
                    match reloc.kind {
                        RelocKind::Pcrel32 => {
                            let stub =
                                self.plt_base + self.got_index[&reloc.symbol] * PLT_STUB_SIZE;
                            let value = pcrel_value(stub, a, p, &reloc.symbol)?;
                            write32(&mut image, patch, value);
                        }
                        RelocKind::GotPcrel32 => {
                            let slot =
                                self.got_base + self.got_index[&reloc.symbol] * GOT_SLOT_SIZE;
                            let value = pcrel_value(slot, a, p, &reloc.symbol)?;
                            write32(&mut image, patch, value);
                        }
                        _ => {
                            return Err(
                                FleError::UndefinedSymbol(reloc.symbol.clone()).into()
                            );
                        }
                    }
                } else {
                    return Err(FleError::UndefinedSymbol(reloc.symbol.clone()).into());
                }
            }
        }

        // plt stubs: ff 25 disp32, disp measured from the stub's end to
        // its got slot
        let stubs: Vec<u64> = self
            .got_index
            .iter()
            .filter(|(name, _)| self.extern_funcs.contains(*name))
            .map(|(_, &index)| index)
            .collect();
        for index in stubs {
            let stub_addr = self.plt_base + index * PLT_STUB_SIZE;
            let slot_addr = self.got_base + index * GOT_SLOT_SIZE;
            let disp = (slot_addr as i64 - (stub_addr + PLT_STUB_SIZE) as i64) as i32;
            let off = self.text.len() + (index * PLT_STUB_SIZE) as usize;
            image[off..off + 2].copy_from_slice(&[0xff, 0x25]);
            image[off + 2..off + 6].copy_from_slice(&disp.to_le_bytes());
        }

        if self.opt.shared {
            dyn_out.sort_by_key(|reloc| reloc.offset);
        } else {
            // every got slot is filled by the loader through an ABS64
            // dynamic relocation
            let mut slots: Vec<(&String, u64)> = self
                .got_index
                .iter()
                .map(|(name, &index)| (name, index))
                .collect();
            slots.sort_by_key(|&(_, index)| index);
            for (name, index) in slots {
                dyn_out.push(Reloc {
                    kind: RelocKind::Abs64,
                    offset: self.got_base + index * GOT_SLOT_SIZE,
                    symbol: name.clone(),
                    addend: 0,
                });
            }
        }

        self.image = image;
        self.dyn_relocs = dyn_out;
        Ok(())
    }

    /// Assemble the output object.
    fn emit(self) -> anyhow::Result<FleObject> {
        let kind = if self.opt.shared {
            ObjectKind::Shared
        } else {
            ObjectKind::Executable
        };
        let mut output = FleObject::new(self.opt.output.clone(), kind);

        let text_end = self.text.len() + self.plt_size as usize;
        let rodata_end = text_end + self.rodata.len();
        let mut push = |name: &str, data: Vec<u8>| {
            output.sections.insert(
                name.to_string(),
                Section {
                    name: name.to_string(),
                    data,
                    relocs: vec![],
                    has_symbols: false,
                },
            );
        };
        push(".text", self.image[..text_end].to_vec());
        push(".rodata", self.image[text_end..rodata_end].to_vec());
        push(".data", self.image[rodata_end..].to_vec());
        if self.got_size > 0 {
            push(".got", vec![0; self.got_size as usize]);
        }
        push(".bss", vec![0; self.bss_size as usize]);

        output.phdrs = vec![
            ProgramHeader {
                name: ".text".to_string(),
                vaddr: self.text_base,
                size: (self.text.len() as u64) + self.plt_size,
                flags: PF_R | PF_X,
            },
            ProgramHeader {
                name: ".rodata".to_string(),
                vaddr: self.rodata_base,
                size: self.rodata.len() as u64,
                flags: PF_R,
            },
            ProgramHeader {
                name: ".data".to_string(),
                vaddr: self.data_base,
                size: self.data.len() as u64,
                flags: PF_R | PF_W,
            },
        ];
        if self.got_size > 0 {
            output.phdrs.push(ProgramHeader {
                name: ".got".to_string(),
                vaddr: self.got_base,
                size: self.got_size,
                flags: PF_R | PF_W,
            });
        }
        output.phdrs.push(ProgramHeader {
            name: ".bss".to_string(),
            vaddr: self.bss_base,
            size: self.bss_size,
            flags: PF_R | PF_W,
        });

        // export the winning global/weak definitions, rebased onto the
        // output segments, in address order
        let mut exports: Vec<(u64, u64, Symbol)> = vec![];
        for (idx, obj) in self.active.iter().enumerate() {
            for sym in &obj.symbols {
                if sym.section.is_empty()
                    || !matches!(sym.binding, SymbolBinding::Weak | SymbolBinding::Global)
                {
                    continue;
                }
                let Some(&base) = self.section_vaddr.get(&(idx, sym.section.clone())) else {
                    continue;
                };
                let addr = base + sym.offset;
                if self.globals.get(&sym.name) != Some(&(sym.binding, addr)) {
                    // superseded by another definition
                    continue;
                }
                let (out_section, out_base) = match classify(&sym.section) {
                    Seg::Text => (".text", self.text_base),
                    Seg::Rodata => (".rodata", self.rodata_base),
                    Seg::Data => (".data", self.data_base),
                    Seg::Bss => (".bss", self.bss_base),
                };
                exports.push((
                    out_base,
                    addr - out_base,
                    Symbol {
                        binding: sym.binding,
                        section: out_section.to_string(),
                        offset: addr - out_base,
                        size: sym.size,
                        name: sym.name.clone(),
                    },
                ));
            }
        }
        exports.sort_by_key(|&(base, offset, _)| (base, offset));
        for (_, _, sym) in exports {
            if let Some(section) = output.sections.get_mut(&sym.section) {
                section.has_symbols = true;
            }
            output.symbols.push(sym);
        }

        for so in &self.shared_deps {
            if !so.name.is_empty() {
                output.needed.push(so.name.clone());
            }
        }

        if !self.opt.shared {
            let entry = match self.globals.get(&self.opt.entry) {
                Some(&(_, addr)) => addr,
                None => {
                    warn!("Entry symbol {} is not defined", self.opt.entry);
                    0
                }
            };
            output.entry = Some(entry);
        }

        output.dyn_relocs = self.dyn_relocs;
        output.validate()?;
        Ok(output)
    }
}

fn write32(image: &mut [u8], offset: Option<usize>, value: u32) {
    if let Some(offset) = offset {
        image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

fn write64(image: &mut [u8], offset: Option<usize>, value: u64) {
    if let Some(offset) = offset {
        image[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}

fn pcrel_value(s: u64, a: i64, p: u64, symbol: &str) -> anyhow::Result<u32> {
    let value = s as i64 + a - p as i64;
    i32::try_from(value)
        .map(|value| value as u32)
        .map_err(|_| FleError::LayoutOverflow(symbol.to_string()).into())
}

/// Patch a site whose symbol is defined inside the active set.
fn patch_in_place(
    image: &mut [u8],
    offset: Option<usize>,
    reloc: &Reloc,
    s: u64,
    a: i64,
    p: u64,
) -> anyhow::Result<()> {
    match reloc.kind {
        RelocKind::Abs32 => {
            let value = u32::try_from(s as i64 + a)
                .map_err(|_| FleError::LayoutOverflow(reloc.symbol.clone()))?;
            write32(image, offset, value);
        }
        RelocKind::Abs32S => {
            let value = i32::try_from(s as i64 + a)
                .map_err(|_| FleError::LayoutOverflow(reloc.symbol.clone()))?;
            write32(image, offset, value as u32);
        }
        // an internally-defined gotpcrel target is reached directly
        RelocKind::Pcrel32 | RelocKind::GotPcrel32 => {
            let value = pcrel_value(s, a, p, &reloc.symbol)?;
            write32(image, offset, value);
        }
        RelocKind::Abs64 => {
            write64(image, offset, (s as i64 + a) as u64);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(name: &str, data: Vec<u8>, relocs: Vec<Reloc>) -> Section {
        Section {
            name: name.to_string(),
            data,
            relocs,
            has_symbols: false,
        }
    }

    fn symbol(binding: SymbolBinding, section: &str, offset: u64, name: &str) -> Symbol {
        Symbol {
            binding,
            section: section.to_string(),
            offset,
            size: 0,
            name: name.to_string(),
        }
    }

    fn reloc(kind: RelocKind, offset: u64, symbol: &str, addend: i64) -> Reloc {
        Reloc {
            kind,
            offset,
            symbol: symbol.to_string(),
            addend,
        }
    }

    fn object(name: &str, sections: Vec<Section>, symbols: Vec<Symbol>) -> FleObject {
        let mut obj = FleObject::new(name, ObjectKind::Relocatable);
        for section in sections {
            obj.sections.insert(section.name.clone(), section);
        }
        obj.symbols = symbols;
        obj
    }

    fn shared_stub(name: &str, symbols: &[&str]) -> FleObject {
        let mut obj = FleObject::new(name, ObjectKind::Shared);
        obj.sections
            .insert(".text".to_string(), section(".text", vec![], vec![]));
        for sym in symbols {
            obj.symbols
                .push(symbol(SymbolBinding::Global, ".text", 0, sym));
        }
        obj
    }

    fn exe_opt() -> Opt {
        Opt::default()
    }

    fn shared_opt() -> Opt {
        Opt {
            shared: true,
            output: "lib.fso".to_string(),
            ..Opt::default()
        }
    }

    #[test]
    fn test_single_object_no_externals() {
        let start = object(
            "start.fle",
            vec![section(".text", vec![0x90; 16], vec![])],
            vec![symbol(SymbolBinding::Global, ".text", 0, "_start")],
        );
        let exe = link(&[start], &exe_opt()).unwrap();
        assert_eq!(exe.kind, ObjectKind::Executable);
        assert_eq!(exe.entry, Some(0x400000));
        assert_eq!(exe.sections[".text"].data, vec![0x90; 16]);
        assert!(!exe.sections.contains_key(".got"));
        assert!(exe.dyn_relocs.is_empty());
        let text = exe.phdrs.iter().find(|p| p.name == ".text").unwrap();
        assert_eq!((text.vaddr, text.size, text.flags), (0x400000, 16, PF_R | PF_X));
    }

    #[test]
    fn test_pcrel32_to_internal_symbol() {
        // call foo at offset 1 of a; foo lives in b's text
        let a = object(
            "a.fle",
            vec![section(
                ".text",
                vec![0xe8, 0, 0, 0, 0, 0x90, 0x90, 0xc3],
                vec![reloc(RelocKind::Pcrel32, 1, "foo", -4)],
            )],
            vec![symbol(SymbolBinding::Global, ".text", 0, "_start")],
        );
        let b = object(
            "b.fle",
            vec![section(".text", vec![0xc3], vec![])],
            vec![symbol(SymbolBinding::Global, ".text", 0, "foo")],
        );
        let exe = link(&[a, b], &exe_opt()).unwrap();
        // S = 0x400008, A = -4, P = 0x400001
        let patched = &exe.sections[".text"].data[1..5];
        assert_eq!(patched, &3i32.to_le_bytes());
        assert_eq!(exe.sections[".text"].data[8], 0xc3);
    }

    #[test]
    fn test_external_function_via_plt() {
        let a = object(
            "a.fle",
            vec![section(
                ".text",
                vec![0x90, 0xe8, 0, 0, 0, 0, 0xc3],
                vec![reloc(RelocKind::Pcrel32, 2, "printf", -4)],
            )],
            vec![symbol(SymbolBinding::Global, ".text", 0, "_start")],
        );
        let libc = shared_stub("libc.fso", &["printf"]);
        let exe = link(&[a, libc], &exe_opt()).unwrap();

        // one 8-byte got slot, one 6-byte plt stub after a's text
        let got = exe.phdrs.iter().find(|p| p.name == ".got").unwrap();
        assert_eq!((got.vaddr, got.size, got.flags), (0x401000, 8, PF_R | PF_W));
        assert_eq!(exe.sections[".got"].data, vec![0; 8]);
        let text = &exe.sections[".text"].data;
        assert_eq!(text.len(), 7 + 6);

        // the call displacement points at the stub: 0x400007 - 4 - 0x400002
        assert_eq!(&text[2..6], &1i32.to_le_bytes());

        // stub: ff 25 disp32 with disp = slot - (stub + 6)
        assert_eq!(&text[7..9], &[0xff, 0x25]);
        let disp = i32::from_le_bytes(text[9..13].try_into().unwrap());
        assert_eq!(disp as i64, 0x401000 - (0x400007 + 6));

        // the loader fills the slot through one ABS64 dynamic relocation
        assert_eq!(
            exe.dyn_relocs,
            vec![reloc(RelocKind::Abs64, 0x401000, "printf", 0)]
        );
        assert_eq!(exe.needed, vec!["libc.fso"]);
    }

    #[test]
    fn test_distinct_externals_get_distinct_slots() {
        let a = object(
            "a.fle",
            vec![section(
                ".text",
                vec![
                    0xe8, 0, 0, 0, 0, //
                    0xe8, 0, 0, 0, 0, //
                    0xe8, 0, 0, 0, 0,
                ],
                vec![
                    reloc(RelocKind::Pcrel32, 1, "write", -4),
                    reloc(RelocKind::Pcrel32, 6, "exit", -4),
                    reloc(RelocKind::Pcrel32, 11, "write", -4),
                ],
            )],
            vec![symbol(SymbolBinding::Global, ".text", 0, "_start")],
        );
        let libc = shared_stub("libc.fso", &["write", "exit"]);
        let exe = link(&[a, libc], &exe_opt()).unwrap();
        // one slot and one stub per distinct symbol
        assert_eq!(exe.sections[".got"].data.len(), 16);
        assert_eq!(exe.sections[".text"].data.len(), 15 + 12);
        assert_eq!(exe.dyn_relocs.len(), 2);
        let offsets: Vec<u64> = exe.dyn_relocs.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0x401000, 0x401008]);
    }

    #[test]
    fn test_got_relocs_ordered_by_slot_not_name() {
        // zwrite sorts after avar, but functions take the lower slots
        let a = object(
            "a.fle",
            vec![section(
                ".text",
                vec![
                    0xe8, 0, 0, 0, 0, //
                    0x48, 0x8b, 0x05, 0, 0, 0, 0,
                ],
                vec![
                    reloc(RelocKind::Pcrel32, 1, "zwrite", -4),
                    reloc(RelocKind::GotPcrel32, 8, "avar", -4),
                ],
            )],
            vec![symbol(SymbolBinding::Global, ".text", 0, "_start")],
        );
        let libc = shared_stub("libc.fso", &["zwrite", "avar"]);
        let exe = link(&[a, libc], &exe_opt()).unwrap();
        assert_eq!(exe.sections[".got"].data.len(), 16);
        assert_eq!(
            exe.dyn_relocs,
            vec![
                reloc(RelocKind::Abs64, 0x401000, "zwrite", 0),
                reloc(RelocKind::Abs64, 0x401008, "avar", 0),
            ]
        );
    }

    #[test]
    fn test_gotpcrel_external_data() {
        let a = object(
            "a.fle",
            vec![section(
                ".text",
                vec![0x48, 0x8b, 0x05, 0, 0, 0, 0],
                vec![reloc(RelocKind::GotPcrel32, 3, "environ", -4)],
            )],
            vec![symbol(SymbolBinding::Global, ".text", 0, "_start")],
        );
        let libc = shared_stub("libc.fso", &["environ"]);
        let exe = link(&[a, libc], &exe_opt()).unwrap();
        // data-only externals get a got slot but no plt stub
        assert_eq!(exe.sections[".got"].data.len(), 8);
        assert_eq!(exe.sections[".text"].data.len(), 7);
        let disp = i32::from_le_bytes(exe.sections[".text"].data[3..7].try_into().unwrap());
        assert_eq!(disp as i64, 0x401000 - 4 - 0x400003);
    }

    #[test]
    fn test_gotpcrel_internal_bypasses_got() {
        let a = object(
            "a.fle",
            vec![
                section(
                    ".text",
                    vec![0x48, 0x8b, 0x05, 0, 0, 0, 0],
                    vec![reloc(RelocKind::GotPcrel32, 3, "counter", -4)],
                ),
                section(".data", vec![0; 8], vec![]),
            ],
            vec![
                symbol(SymbolBinding::Global, ".text", 0, "_start"),
                symbol(SymbolBinding::Global, ".data", 0, "counter"),
            ],
        );
        let exe = link(&[a], &exe_opt()).unwrap();
        assert!(!exe.sections.contains_key(".got"));
        assert!(exe.dyn_relocs.is_empty());
        // patched pc-relative straight at the definition
        let disp = i32::from_le_bytes(exe.sections[".text"].data[3..7].try_into().unwrap());
        let data_base = exe.phdrs.iter().find(|p| p.name == ".data").unwrap().vaddr;
        assert_eq!(disp as i64, data_base as i64 - 4 - 0x400003);
    }

    #[test]
    fn test_archive_member_selection() {
        let a = object(
            "a.fle",
            vec![section(
                ".text",
                vec![0xe8, 0, 0, 0, 0],
                vec![reloc(RelocKind::Pcrel32, 1, "helper", -4)],
            )],
            vec![symbol(SymbolBinding::Global, ".text", 0, "_start")],
        );
        let m1 = object(
            "m1.fle",
            vec![section(".text", vec![0xcc; 32], vec![])],
            vec![symbol(SymbolBinding::Global, ".text", 0, "unused")],
        );
        let m2 = object(
            "m2.fle",
            vec![section(".text", vec![0xc3], vec![])],
            vec![symbol(SymbolBinding::Global, ".text", 0, "helper")],
        );
        let mut archive = FleObject::new("libx.fa", ObjectKind::Archive);
        archive.members = vec![m1, m2];
        let exe = link(&[a, archive], &exe_opt()).unwrap();
        // m2 pulled, m1 left out
        assert_eq!(exe.sections[".text"].data.len(), 6);
        assert_eq!(&exe.sections[".text"].data[1..5], &0i32.to_le_bytes());
    }

    #[test]
    fn test_later_archive_pulls_earlier_member() {
        let a = object(
            "a.fle",
            vec![section(
                ".text",
                vec![0xe8, 0, 0, 0, 0],
                vec![reloc(RelocKind::Pcrel32, 1, "f2", -4)],
            )],
            vec![symbol(SymbolBinding::Global, ".text", 0, "_start")],
        );
        let m1 = object(
            "m1.fle",
            vec![section(".text", vec![0xc3], vec![])],
            vec![symbol(SymbolBinding::Global, ".text", 0, "f1")],
        );
        let m2 = object(
            "m2.fle",
            vec![section(
                ".text",
                vec![0xe8, 0, 0, 0, 0],
                vec![reloc(RelocKind::Pcrel32, 1, "f1", -4)],
            )],
            vec![symbol(SymbolBinding::Global, ".text", 0, "f2")],
        );
        let mut ar1 = FleObject::new("lib1.fa", ObjectKind::Archive);
        ar1.members = vec![m1];
        let mut ar2 = FleObject::new("lib2.fa", ObjectKind::Archive);
        ar2.members = vec![m2];
        let exe = link(&[a, ar1, ar2], &exe_opt()).unwrap();
        // a(5) + m2(5) + m1(1): the second round pulls m1 out of lib1
        assert_eq!(exe.sections[".text"].data.len(), 11);
        let names: Vec<&str> = exe.symbols.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"f1") && names.contains(&"f2"));
    }

    #[test]
    fn test_weak_overridden_by_later_strong() {
        let weak = object(
            "weak.fle",
            vec![section(".data", vec![0x11; 4], vec![])],
            vec![symbol(SymbolBinding::Weak, ".data", 0, "x")],
        );
        let strong = object(
            "strong.fle",
            vec![section(".data", vec![0x22; 4], vec![])],
            vec![symbol(SymbolBinding::Global, ".data", 0, "x")],
        );
        let exe = link(&[weak, strong], &exe_opt()).unwrap();
        let exported: Vec<&Symbol> = exe.symbols.iter().filter(|s| s.name == "x").collect();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].binding, SymbolBinding::Global);
        assert_eq!(exported[0].offset, 4);
    }

    #[test]
    fn test_weak_does_not_override_strong() {
        let strong = object(
            "strong.fle",
            vec![section(".data", vec![0x22; 4], vec![])],
            vec![symbol(SymbolBinding::Global, ".data", 0, "x")],
        );
        let weak = object(
            "weak.fle",
            vec![section(".data", vec![0x11; 4], vec![])],
            vec![symbol(SymbolBinding::Weak, ".data", 0, "x")],
        );
        let exe = link(&[strong, weak], &exe_opt()).unwrap();
        let exported: Vec<&Symbol> = exe.symbols.iter().filter(|s| s.name == "x").collect();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].binding, SymbolBinding::Global);
        assert_eq!(exported[0].offset, 0);
    }

    #[test]
    fn test_duplicate_strong_aborts() {
        let a = object(
            "a.fle",
            vec![section(".data", vec![0; 4], vec![])],
            vec![symbol(SymbolBinding::Global, ".data", 0, "x")],
        );
        let b = object(
            "b.fle",
            vec![section(".data", vec![0; 4], vec![])],
            vec![symbol(SymbolBinding::Global, ".data", 0, "x")],
        );
        let err = link(&[a, b], &exe_opt()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FleError>(),
            Some(FleError::DuplicateStrongSymbol(name)) if name == "x"
        ));
    }

    #[test]
    fn test_undefined_symbol_aborts() {
        let a = object(
            "a.fle",
            vec![section(
                ".text",
                vec![0xe8, 0, 0, 0, 0],
                vec![reloc(RelocKind::Pcrel32, 1, "missing", -4)],
            )],
            vec![symbol(SymbolBinding::Global, ".text", 0, "_start")],
        );
        let err = link(&[a], &exe_opt()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FleError>(),
            Some(FleError::UndefinedSymbol(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_abs64_against_shared_symbol_aborts() {
        let a = object(
            "a.fle",
            vec![section(
                ".data",
                vec![0; 8],
                vec![reloc(RelocKind::Abs64, 0, "printf", 0)],
            )],
            vec![symbol(SymbolBinding::Global, ".data", 0, "_start")],
        );
        let libc = shared_stub("libc.fso", &["printf"]);
        assert!(link(&[a, libc], &exe_opt()).is_err());
    }

    #[test]
    fn test_abs32_overflow_detected() {
        let a = object(
            "a.fle",
            vec![section(
                ".data",
                vec![0; 4],
                vec![reloc(RelocKind::Abs32, 0, "x", -0x500000)],
            )],
            vec![symbol(SymbolBinding::Global, ".data", 0, "x")],
        );
        let err = link(&[a], &exe_opt()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FleError>(),
            Some(FleError::LayoutOverflow(_))
        ));
    }

    #[test]
    fn test_segment_bases_are_page_aligned_and_disjoint() {
        let a = object(
            "a.fle",
            vec![
                section(".text", vec![0x90; 100], vec![]),
                section(".rodata", vec![0x41; 33], vec![]),
                section(".data", vec![0x42; 7], vec![]),
            ],
            vec![symbol(SymbolBinding::Global, ".text", 0, "_start")],
        );
        let exe = link(&[a], &exe_opt()).unwrap();
        for phdr in &exe.phdrs {
            assert_eq!(phdr.vaddr % PAGE_SIZE, 0, "{}", phdr.name);
        }
        let mut ranges: Vec<(u64, u64)> = exe
            .phdrs
            .iter()
            .filter(|p| p.size > 0)
            .map(|p| (p.vaddr, p.vaddr + p.size))
            .collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0);
        }
    }

    #[test]
    fn test_bss_layout_and_abs_patch() {
        // data symbol referenced absolutely from text, bss sized from shdrs
        let mut a = object(
            "a.fle",
            vec![
                section(
                    ".text",
                    vec![0xb8, 0, 0, 0, 0],
                    vec![reloc(RelocKind::Abs32, 1, "buffer", 0)],
                ),
                section(".bss", vec![], vec![]),
            ],
            vec![
                symbol(SymbolBinding::Global, ".text", 0, "_start"),
                symbol(SymbolBinding::Global, ".bss", 0, "buffer"),
            ],
        );
        a.shdrs = vec![
            crate::obj::SectionHeader {
                name: ".text".to_string(),
                sh_type: crate::obj::SHT_PROGBITS,
                flags: crate::obj::SHF_ALLOC | crate::obj::SHF_EXEC,
                addr: 0,
                offset: 0,
                size: 5,
            },
            crate::obj::SectionHeader {
                name: ".bss".to_string(),
                sh_type: crate::obj::SHT_NOBITS,
                flags: crate::obj::SHF_ALLOC | crate::obj::SHF_WRITE | crate::obj::SHF_NOBITS,
                addr: 0,
                offset: 5,
                size: 64,
            },
        ];
        let exe = link(&[a], &exe_opt()).unwrap();
        let bss = exe.phdrs.iter().find(|p| p.name == ".bss").unwrap();
        assert_eq!(bss.size, 64);
        let patched = u32::from_le_bytes(exe.sections[".text"].data[1..5].try_into().unwrap());
        assert_eq!(patched as u64, bss.vaddr);
    }

    #[test]
    fn test_abs64_to_internal_symbol() {
        let a = object(
            "a.fle",
            vec![
                section(".text", vec![0xc3], vec![]),
                section(
                    ".data",
                    vec![0; 8],
                    vec![reloc(RelocKind::Abs64, 0, "target", 8)],
                ),
            ],
            vec![
                symbol(SymbolBinding::Global, ".text", 0, "_start"),
                symbol(SymbolBinding::Global, ".data", 0, "target"),
            ],
        );
        let exe = link(&[a], &exe_opt()).unwrap();
        let data_base = exe.phdrs.iter().find(|p| p.name == ".data").unwrap().vaddr;
        // the eight little-endian bytes hold S + A
        assert_eq!(
            exe.sections[".data"].data,
            (data_base + 8).to_le_bytes().to_vec()
        );
    }

    #[test]
    fn test_shared_mode_defers_externals() {
        let a = object(
            "a.fle",
            vec![section(
                ".text",
                vec![0x90, 0xe8, 0, 0, 0, 0, 0xe8, 0, 0, 0, 0],
                vec![
                    reloc(RelocKind::Pcrel32, 7, "puts", -4),
                    reloc(RelocKind::Pcrel32, 2, "local_fn", -4),
                ],
            )],
            vec![
                symbol(SymbolBinding::Global, ".text", 0, "entry"),
                symbol(SymbolBinding::Global, ".text", 10, "local_fn"),
            ],
        );
        let libc = shared_stub("libc.fso", &["puts"]);
        let lib = link(&[a, libc], &shared_opt()).unwrap();
        assert_eq!(lib.kind, ObjectKind::Shared);
        assert_eq!(lib.entry, None);
        // no plt or got in shared mode
        assert!(!lib.sections.contains_key(".got"));
        assert_eq!(lib.sections[".text"].data.len(), 11);
        // the internal call is patched: S = 0x40000a, P = 0x400002
        let patched = i32::from_le_bytes(lib.sections[".text"].data[2..6].try_into().unwrap());
        assert_eq!(patched, 0x40000a - 4 - 0x400002);
        // the external one is deferred with its site address and addend
        assert_eq!(
            lib.dyn_relocs,
            vec![reloc(RelocKind::Pcrel32, 0x400007, "puts", -4)]
        );
        assert_eq!(lib.needed, vec!["libc.fso"]);
    }

    #[test]
    fn test_shared_exports_rebased_symbols() {
        let a = object(
            "a.fle",
            vec![
                section(".text", vec![0xc3, 0xc3], vec![]),
                section(".data", vec![0x2a; 8], vec![]),
            ],
            vec![
                symbol(SymbolBinding::Global, ".text", 1, "f"),
                symbol(SymbolBinding::Global, ".data", 4, "v"),
                symbol(SymbolBinding::Local, ".text", 0, "hidden"),
            ],
        );
        let lib = link(&[a], &shared_opt()).unwrap();
        assert_eq!(lib.symbols.len(), 2);
        assert_eq!(lib.symbols[0].name, "f");
        assert_eq!(lib.symbols[0].section, ".text");
        assert_eq!(lib.symbols[0].offset, 1);
        assert_eq!(lib.symbols[1].name, "v");
        assert_eq!(lib.symbols[1].section, ".data");
        assert_eq!(lib.symbols[1].offset, 4);
    }

    #[test]
    fn test_relink_is_idempotent() {
        let a = object(
            "a.fle",
            vec![section(
                ".text",
                vec![0xe8, 0, 0, 0, 0, 0x90, 0x90, 0xc3],
                vec![reloc(RelocKind::Pcrel32, 1, "foo", -4)],
            )],
            vec![symbol(SymbolBinding::Global, ".text", 0, "_start")],
        );
        let b = object(
            "b.fle",
            vec![section(".text", vec![0xc3], vec![])],
            vec![symbol(SymbolBinding::Global, ".text", 0, "foo")],
        );
        let exe = link(&[a, b], &exe_opt()).unwrap();
        let again = link(&[exe.clone()], &exe_opt()).unwrap();
        assert_eq!(again, exe);
    }

    #[test]
    fn test_missing_entry_defaults_to_zero() {
        let a = object(
            "a.fle",
            vec![section(".text", vec![0xc3], vec![])],
            vec![symbol(SymbolBinding::Global, ".text", 0, "main")],
        );
        let exe = link(&[a], &exe_opt()).unwrap();
        assert_eq!(exe.entry, Some(0));
    }

    #[test]
    fn test_find_library_prefers_shared(){
        let dir = std::env::temp_dir().join("fled-test-libs");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("libboth.fso"), "{}").unwrap();
        std::fs::write(dir.join("libboth.fa"), "{}").unwrap();
        std::fs::write(dir.join("libonly.fa"), "{}").unwrap();
        let paths = vec![format!("{}", dir.display())];

        let found = find_library("both", &paths, false).unwrap();
        assert!(found.to_string_lossy().ends_with("libboth.fso"));
        let found = find_library("both", &paths, true).unwrap();
        assert!(found.to_string_lossy().ends_with("libboth.fa"));
        let found = find_library("only", &paths, false).unwrap();
        assert!(found.to_string_lossy().ends_with("libonly.fa"));
        let err = find_library("nothere", &paths, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FleError>(),
            Some(FleError::LibraryNotFound(name)) if name == "nothere"
        ));
    }
}

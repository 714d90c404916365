use crate::error::FleError;
use crate::format::load_fle;
use crate::obj::{FleObject, ObjectKind, ProgramHeader, Reloc, RelocKind, PF_R, PF_W, PF_X};
use anyhow::{anyhow, bail};
use log::info;
use std::collections::{BTreeMap, BTreeSet};
use std::io;

/// A mapped image: the executable or one of its dependencies.
struct LoadedModule {
    name: String,
    obj: FleObject,
    load_base: u64,
    // absolute runtime address of every mapped segment
    section_addrs: BTreeMap<String, u64>,
}

/// Modules in load order: the executable first, then dependencies in the
/// order they were first encountered.
struct Loader {
    modules: Vec<LoadedModule>,
    loaded: BTreeSet<String>,
}

/// Map an executable image and its shared-library dependencies into the
/// current process, apply every relocation, lock page permissions and
/// jump to the entry point. Does not return on success.
pub fn exec(obj: FleObject) -> anyhow::Result<()> {
    if obj.kind != ObjectKind::Executable {
        return Err(FleError::MalformedInput("file is not an executable".to_string()).into());
    }
    let entry = obj.entry.unwrap_or(0);
    if entry == 0 {
        bail!("executable has no entry point");
    }

    let mut loader = Loader {
        modules: vec![],
        loaded: BTreeSet::new(),
    };
    let name = if obj.name.is_empty() {
        "main".to_string()
    } else {
        obj.name.clone()
    };
    loader.map_image(name, obj)?;
    loader.apply_relocations()?;
    loader.finalize_protections()?;

    info!("Transferring control to {entry:#x}");
    let func: extern "C" fn() -> i32 = unsafe { std::mem::transmute(entry as usize) };
    func();
    unreachable!("loaded program returned");
}

impl Loader {
    /// Map one image at its addresses (executables are absolute, shared
    /// libraries get a fresh load base), then recurse into `needed`.
    fn map_image(&mut self, name: String, obj: FleObject) -> anyhow::Result<()> {
        let load_base = if obj.kind == ObjectKind::Executable {
            0
        } else {
            let span = image_span(&obj.phdrs);
            if span == 0 {
                0
            } else {
                reserve(span)?
            }
        };
        info!("Loading {} at base {load_base:#x}", name);

        let mut section_addrs = BTreeMap::new();
        for phdr in &obj.phdrs {
            if phdr.size == 0 {
                continue;
            }
            let addr = load_base + phdr.vaddr;
            // segments stay R+W until every relocation is applied
            map_fixed(addr, phdr.size)?;
            let section = obj.sections.get(&phdr.name).ok_or_else(|| {
                FleError::MalformedInput(format!("no section data for segment {}", phdr.name))
            })?;
            // the mapping is already zeroed, bss needs no copy
            if phdr.name != ".bss" && !phdr.name.starts_with(".bss.") {
                let len = section.data.len().min(phdr.size as usize);
                unsafe {
                    std::ptr::copy_nonoverlapping(section.data.as_ptr(), addr as *mut u8, len);
                }
            }
            section_addrs.insert(phdr.name.clone(), addr);
        }

        let needed = obj.needed.clone();
        self.loaded.insert(name.clone());
        self.modules.push(LoadedModule {
            name,
            obj,
            load_base,
            section_addrs,
        });

        for dep in needed {
            self.load_dependency(&dep)?;
        }
        Ok(())
    }

    fn load_dependency(&mut self, dep: &str) -> anyhow::Result<()> {
        if self.loaded.contains(dep) {
            // duplicate loads are idempotent
            return Ok(());
        }
        let obj = load_fle(dep)
            .or_else(|_| load_fle(&format!("{dep}.fle")))
            .map_err(|_| anyhow!("could not load dependency {dep}"))?;
        self.map_image(dep.to_string(), obj)
    }

    /// First global or weak definition in load order.
    fn resolve(&self, name: &str) -> Option<u64> {
        for module in &self.modules {
            for sym in &module.obj.symbols {
                if sym.name == name
                    && matches!(
                        sym.binding,
                        crate::obj::SymbolBinding::Global | crate::obj::SymbolBinding::Weak
                    )
                {
                    if let Some(&base) = module.section_addrs.get(&sym.section) {
                        return Some(base + sym.offset);
                    }
                }
            }
        }
        None
    }

    /// Patch every module: dynamic relocations at `load_base + offset`,
    /// then any static relocations still present in section bodies.
    fn apply_relocations(&self) -> anyhow::Result<()> {
        for module in &self.modules {
            info!("Relocating {}", module.name);
            for reloc in &module.obj.dyn_relocs {
                let target = self.lookup(&reloc.symbol)?;
                let patch = module.load_base + reloc.offset;
                unsafe { apply(reloc, target, patch) };
            }
            for (name, section) in &module.obj.sections {
                let Some(&base) = module.section_addrs.get(name) else {
                    continue;
                };
                for reloc in &section.relocs {
                    let target = self.lookup(&reloc.symbol)?;
                    unsafe { apply(reloc, target, base + reloc.offset) };
                }
            }
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> anyhow::Result<u64> {
        self.resolve(name)
            .ok_or_else(|| FleError::UndefinedSymbol(name.to_string()).into())
    }

    /// Downgrade every segment to its declared permissions, only after
    /// all relocations everywhere have been applied.
    fn finalize_protections(&self) -> anyhow::Result<()> {
        for module in &self.modules {
            for phdr in &module.obj.phdrs {
                if phdr.size == 0 {
                    continue;
                }
                let addr = module.load_base + phdr.vaddr;
                let rc = unsafe {
                    libc::mprotect(
                        addr as *mut libc::c_void,
                        phdr.size as usize,
                        prot_flags(phdr.flags),
                    )
                };
                if rc != 0 {
                    return Err(FleError::MapFailed {
                        op: "mprotect",
                        source: io::Error::last_os_error(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// Highest end address over the image's segments; a shared library is
/// mapped into a reservation of this size.
fn image_span(phdrs: &[ProgramHeader]) -> u64 {
    phdrs
        .iter()
        .filter(|phdr| phdr.size > 0)
        .map(|phdr| phdr.vaddr + phdr.size)
        .max()
        .unwrap_or(0)
}

fn prot_flags(flags: u32) -> libc::c_int {
    let mut prot = 0;
    if flags & PF_R != 0 {
        prot |= libc::PROT_READ;
    }
    if flags & PF_W != 0 {
        prot |= libc::PROT_WRITE;
    }
    if flags & PF_X != 0 {
        prot |= libc::PROT_EXEC;
    }
    prot
}

/// Fixed anonymous private mapping, initially R+W.
fn map_fixed(addr: u64, size: u64) -> anyhow::Result<()> {
    let mapped = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            size as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        return Err(FleError::MapFailed {
            op: "mmap",
            source: io::Error::last_os_error(),
        }
        .into());
    }
    Ok(())
}

/// Reserve an address range without access permissions.
fn reserve(size: u64) -> anyhow::Result<u64> {
    let mapped = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size as usize,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        return Err(FleError::MapFailed {
            op: "mmap",
            source: io::Error::last_os_error(),
        }
        .into());
    }
    Ok(mapped as u64)
}

/// Little-endian patch bytes for one relocation.
fn reloc_bytes(kind: RelocKind, s: u64, a: i64, patch: u64) -> ([u8; 8], usize) {
    let mut bytes = [0; 8];
    match kind {
        RelocKind::Abs64 => {
            bytes.copy_from_slice(&((s as i64 + a) as u64).to_le_bytes());
            (bytes, 8)
        }
        RelocKind::Abs32 | RelocKind::Abs32S => {
            bytes[..4].copy_from_slice(&((s as i64 + a) as u32).to_le_bytes());
            (bytes, 4)
        }
        // a gotpcrel with no got of its own degrades to a pc-relative
        // reference to the definition
        RelocKind::Pcrel32 | RelocKind::GotPcrel32 => {
            bytes[..4].copy_from_slice(&((s as i64 + a - patch as i64) as i32).to_le_bytes());
            (bytes, 4)
        }
    }
}

unsafe fn apply(reloc: &Reloc, target: u64, patch: u64) {
    let (bytes, len) = reloc_bytes(reloc.kind, target, reloc.addend, patch);
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), patch as *mut u8, len);
}

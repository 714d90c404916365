use crate::error::FleError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// Program header permission bits.
pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

// Section header flag bits.
pub const SHF_ALLOC: u32 = 1;
pub const SHF_WRITE: u32 = 2;
pub const SHF_EXEC: u32 = 4;
pub const SHF_NOBITS: u32 = 8;

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_NOBITS: u32 = 8;

/// Page size every segment base is aligned to.
pub const PAGE_SIZE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RelocKind {
    /// R_X86_64_32: 32-bit absolute
    Abs32,
    /// R_X86_64_PC32: 32-bit PC-relative
    Pcrel32,
    /// R_X86_64_64: 64-bit absolute
    Abs64,
    /// R_X86_64_32S: 32-bit signed absolute
    Abs32S,
    /// R_X86_64_GOTPCREL: 32-bit PC-relative GOT slot address
    GotPcrel32,
}

impl RelocKind {
    /// Bytes reserved at the patch site.
    pub fn width(self) -> u64 {
        match self {
            RelocKind::Abs64 => 8,
            _ => 4,
        }
    }

    /// Integer code used by the `dyn_relocs` wire encoding.
    pub fn code(self) -> u32 {
        match self {
            RelocKind::Abs32 => 0,
            RelocKind::Pcrel32 => 1,
            RelocKind::Abs64 => 2,
            RelocKind::Abs32S => 3,
            RelocKind::GotPcrel32 => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<RelocKind> {
        Some(match code {
            0 => RelocKind::Abs32,
            1 => RelocKind::Pcrel32,
            2 => RelocKind::Abs64,
            3 => RelocKind::Abs32S,
            4 => RelocKind::GotPcrel32,
            _ => return None,
        })
    }

    /// Line tag for a static relocation.
    pub fn tag(self) -> &'static str {
        match self {
            RelocKind::Pcrel32 => ".rel",
            RelocKind::Abs64 => ".abs64",
            RelocKind::Abs32 => ".abs",
            RelocKind::Abs32S => ".abs32s",
            RelocKind::GotPcrel32 => ".gotpcrel",
        }
    }

    /// Line tag for a dynamic relocation. R_X86_64_32 and R_X86_64_32S
    /// share a tag on the wire.
    pub fn dyn_tag(self) -> &'static str {
        match self {
            RelocKind::Pcrel32 => ".dynrel",
            RelocKind::Abs64 => ".dynabs64",
            RelocKind::Abs32 | RelocKind::Abs32S => ".dynabs32",
            RelocKind::GotPcrel32 => ".dyngotpcrel",
        }
    }

    /// Parse a line tag. Returns the kind and whether it is dynamic.
    pub fn from_tag(tag: &str) -> Option<(RelocKind, bool)> {
        Some(match tag {
            ".rel" => (RelocKind::Pcrel32, false),
            ".abs64" => (RelocKind::Abs64, false),
            ".abs" => (RelocKind::Abs32, false),
            ".abs32s" => (RelocKind::Abs32S, false),
            ".gotpcrel" => (RelocKind::GotPcrel32, false),
            ".dynrel" => (RelocKind::Pcrel32, true),
            ".dynabs64" => (RelocKind::Abs64, true),
            ".dynabs32" => (RelocKind::Abs32, true),
            ".dyngotpcrel" => (RelocKind::GotPcrel32, true),
            _ => return None,
        })
    }
}

/// A relocation. `offset` is section-relative for static relocations and
/// image-virtual for dynamic relocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reloc {
    pub kind: RelocKind,
    pub offset: u64,
    pub symbol: String,
    pub addend: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SymbolBinding {
    Local,
    Weak,
    Global,
    Undefined,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub binding: SymbolBinding,
    /// Defining section; empty iff the symbol is only a reference.
    pub section: String,
    pub offset: u64,
    pub size: u64,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub data: Vec<u8>,
    pub relocs: Vec<Reloc>,
    /// Whether the section body carries symbol definitions.
    pub has_symbols: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramHeader {
    pub name: String,
    pub vaddr: u64,
    pub size: u64,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionHeader {
    pub name: String,
    #[serde(rename = "type")]
    pub sh_type: u32,
    pub flags: u32,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Relocatable,
    Executable,
    Shared,
    Archive,
}

impl ObjectKind {
    pub fn tag(self) -> &'static str {
        match self {
            ObjectKind::Relocatable => ".obj",
            ObjectKind::Executable => ".exe",
            ObjectKind::Shared => ".so",
            ObjectKind::Archive => ".ar",
        }
    }

    pub fn from_tag(tag: &str) -> Option<ObjectKind> {
        Some(match tag {
            ".obj" => ObjectKind::Relocatable,
            ".exe" => ObjectKind::Executable,
            ".so" => ObjectKind::Shared,
            ".ar" => ObjectKind::Archive,
            _ => return None,
        })
    }
}

/// An FLE object: a relocatable, a linked image, or an archive of members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleObject {
    pub name: String,
    pub kind: ObjectKind,
    pub shdrs: Vec<SectionHeader>,
    pub sections: BTreeMap<String, Section>,
    pub phdrs: Vec<ProgramHeader>,
    pub symbols: Vec<Symbol>,
    pub dyn_relocs: Vec<Reloc>,
    pub needed: Vec<String>,
    pub entry: Option<u64>,
    pub members: Vec<FleObject>,
}

impl FleObject {
    pub fn new(name: impl Into<String>, kind: ObjectKind) -> FleObject {
        FleObject {
            name: name.into(),
            kind,
            shdrs: vec![],
            sections: BTreeMap::new(),
            phdrs: vec![],
            symbols: vec![],
            dyn_relocs: vec![],
            needed: vec![],
            entry: None,
            members: vec![],
        }
    }

    /// Check structural invariants on ingest.
    pub fn validate(&self) -> Result<(), FleError> {
        if self.kind == ObjectKind::Archive {
            for member in &self.members {
                member.validate()?;
            }
            return Ok(());
        }

        for (name, section) in &self.sections {
            for reloc in &section.relocs {
                if reloc.offset + reloc.kind.width() > section.data.len() as u64 {
                    return Err(FleError::MalformedInput(format!(
                        "relocation against {} at {:#x} outside section {}",
                        reloc.symbol, reloc.offset, name
                    )));
                }
            }
        }

        let mut seen = std::collections::BTreeSet::new();
        for symbol in &self.symbols {
            if !symbol.section.is_empty() && !self.sections.contains_key(&symbol.section) {
                return Err(FleError::MalformedInput(format!(
                    "symbol {} defined in unknown section {}",
                    symbol.name, symbol.section
                )));
            }
            // (name, binding) must be unique for non-local definitions
            if matches!(symbol.binding, SymbolBinding::Weak | SymbolBinding::Global)
                && !seen.insert((symbol.name.clone(), symbol.binding))
            {
                return Err(FleError::MalformedInput(format!(
                    "duplicate {:?} definition of {} within one object",
                    symbol.binding, symbol.name
                )));
            }
        }

        if matches!(self.kind, ObjectKind::Executable | ObjectKind::Shared) {
            let mut ranges: Vec<(u64, u64, &str)> = self
                .phdrs
                .iter()
                .filter(|phdr| phdr.size > 0)
                .map(|phdr| (phdr.vaddr, phdr.vaddr + phdr.size, phdr.name.as_str()))
                .collect();
            ranges.sort();
            for window in ranges.windows(2) {
                if window[1].0 < window[0].1 {
                    return Err(FleError::MalformedInput(format!(
                        "segments {} and {} overlap",
                        window[0].2, window[1].2
                    )));
                }
            }
            for phdr in &self.phdrs {
                if phdr.vaddr % PAGE_SIZE != 0 {
                    return Err(FleError::MalformedInput(format!(
                        "segment {} is not page-aligned at {:#x}",
                        phdr.name, phdr.vaddr
                    )));
                }
            }
        }

        Ok(())
    }
}

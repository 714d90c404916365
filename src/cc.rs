use crate::format;
use crate::obj::{
    FleObject, ObjectKind, Reloc, RelocKind, Section, SectionHeader, Symbol, SymbolBinding,
    SHF_ALLOC, SHF_EXEC, SHF_NOBITS, SHF_WRITE, SHT_NOBITS, SHT_PROGBITS,
};
use anyhow::{anyhow, bail, Context};
use log::info;
use object::{
    Object, ObjectSection, ObjectSymbol, RelocationEncoding, RelocationKind, RelocationTarget,
    SectionKind, SymbolKind,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;

const COMPILER_FLAGS: [&str; 4] = [
    "-fno-common",
    "-nostdlib",
    "-ffreestanding",
    "-fno-asynchronous-unwind-tables",
];

/// Compile with the host C compiler, then convert the relocatable ELF
/// output into an FLE document next to it.
pub fn run(args: &[String]) -> anyhow::Result<()> {
    let binary = args
        .windows(2)
        .find(|pair| pair[0] == "-o")
        .map(|pair| pair[1].clone())
        .unwrap_or_else(|| "a.out".to_string());

    // -fPIC rules out -static
    let pic = args.iter().any(|arg| arg == "-fPIC" || arg == "-fpic");

    let mut cmd = Command::new("gcc");
    cmd.arg("-c");
    if !pic {
        cmd.arg("-static");
    }
    cmd.args(COMPILER_FLAGS);
    cmd.args(args);
    info!("Running {cmd:?}");
    let status = cmd.status().context("running gcc")?;
    if !status.success() {
        bail!("gcc compilation failed");
    }

    let data = std::fs::read(&binary).context(format!("Reading file {binary}"))?;
    let file = object::File::parse(&*data)
        .context(format!("Parsing file {binary} as object"))?;
    let output = fle_path(&binary);
    let obj = elf_to_fle(&file, &format::basename(&format!("{}", output.display())))?;
    obj.validate()?;
    format::write_fle(&obj, &format!("{}", output.display()))?;
    std::fs::remove_file(&binary).context(format!("Removing {binary}"))?;
    Ok(())
}

/// `build/foo.o` compiles into `build/foo.fle`.
fn fle_path(binary: &str) -> PathBuf {
    let path = Path::new(binary);
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| binary.to_string());
    path.with_file_name(format!("{stem}.fle"))
}

fn map_reloc_kind(
    kind: RelocationKind,
    encoding: RelocationEncoding,
    size: u8,
) -> Option<RelocKind> {
    // the gotpcrelx relaxation variants keep their raw elf codes
    if let RelocationKind::Elf(code) = kind {
        return match code {
            object::elf::R_X86_64_GOTPCREL
            | object::elf::R_X86_64_GOTPCRELX
            | object::elf::R_X86_64_REX_GOTPCRELX => Some(RelocKind::GotPcrel32),
            _ => None,
        };
    }
    Some(match (kind, encoding, size) {
        (RelocationKind::Absolute, RelocationEncoding::Generic, 64) => RelocKind::Abs64,
        (RelocationKind::Absolute, RelocationEncoding::Generic, 32) => RelocKind::Abs32,
        (RelocationKind::Absolute, RelocationEncoding::X86Signed, 32) => RelocKind::Abs32S,
        (RelocationKind::Relative, RelocationEncoding::Generic, 32) => RelocKind::Pcrel32,
        // no plt in relocatables, a plt-relative call is pc-relative
        (RelocationKind::PltRelative, RelocationEncoding::Generic, 32) => RelocKind::Pcrel32,
        (RelocationKind::GotRelative, RelocationEncoding::Generic, 32) => RelocKind::GotPcrel32,
        _ => return None,
    })
}

/// Convert a relocatable ELF into the FLE object model: allocatable
/// sections with cumulative file offsets, their symbols, and their
/// relocations.
fn elf_to_fle(file: &object::File, name: &str) -> anyhow::Result<FleObject> {
    let mut obj = FleObject::new(name, ObjectKind::Relocatable);

    let mut kept: Vec<(object::SectionIndex, String)> = vec![];
    let mut offset = 0;
    for section in file.sections() {
        let section_name = section.name()?;
        let object::SectionFlags::Elf { sh_flags } = section.flags() else {
            bail!("unsupported object format for section {section_name}");
        };
        if (sh_flags as u32) & object::elf::SHF_ALLOC == 0 {
            // non-alloc, skip
            continue;
        }
        if section_name.contains("note.gnu.property") || section.size() == 0 {
            continue;
        }
        let nobits = section.kind() == SectionKind::UninitializedData;

        let mut flags = SHF_ALLOC;
        if (sh_flags as u32) & object::elf::SHF_WRITE != 0 {
            flags |= SHF_WRITE;
        }
        if (sh_flags as u32) & object::elf::SHF_EXECINSTR != 0 {
            flags |= SHF_EXEC;
        }
        if nobits {
            flags |= SHF_NOBITS;
        }

        info!("Converting section {}", section_name);
        obj.shdrs.push(SectionHeader {
            name: section_name.to_string(),
            sh_type: if nobits { SHT_NOBITS } else { SHT_PROGBITS },
            flags,
            addr: 0,
            offset,
            size: section.size(),
        });
        offset += section.size();

        obj.sections.insert(
            section_name.to_string(),
            Section {
                name: section_name.to_string(),
                data: if nobits {
                    vec![]
                } else {
                    section.data()?.to_vec()
                },
                relocs: vec![],
                has_symbols: false,
            },
        );
        kept.push((section.index(), section_name.to_string()));
    }

    let kept_name = |index: object::SectionIndex| {
        kept.iter()
            .find(|(kept_index, _)| *kept_index == index)
            .map(|(_, name)| name.clone())
    };

    // defined symbols, grouped per section, symtab order within an offset
    let mut per_section: Vec<Vec<Symbol>> = vec![vec![]; kept.len()];
    let position =
        |index: object::SectionIndex| kept.iter().position(|(kept_index, _)| *kept_index == index);
    for symbol in file.symbols() {
        let Some(index) = symbol.section_index() else {
            continue;
        };
        let Some(slot) = position(index) else {
            continue;
        };
        if symbol.kind() == SymbolKind::Section {
            // the section symbol resolves section-relative references
            let section_name = kept[slot].1.clone();
            per_section[slot].push(Symbol {
                binding: SymbolBinding::Local,
                section: section_name.clone(),
                offset: 0,
                size: 0,
                name: section_name,
            });
            continue;
        }
        let symbol_name = symbol.name()?;
        if symbol_name.is_empty() {
            continue;
        }
        let binding = if symbol.is_weak() {
            SymbolBinding::Weak
        } else if symbol.is_global() {
            SymbolBinding::Global
        } else {
            SymbolBinding::Local
        };
        per_section[slot].push(Symbol {
            binding,
            section: kept[slot].1.clone(),
            offset: symbol.address(),
            size: symbol.size(),
            name: symbol_name.to_string(),
        });
    }
    for (slot, (_, section_name)) in kept.iter().enumerate() {
        let mut symbols = std::mem::take(&mut per_section[slot]);
        symbols.sort_by_key(|sym| sym.offset);
        if !symbols.is_empty() {
            obj.sections.get_mut(section_name).unwrap().has_symbols = true;
        }
        obj.symbols.extend(symbols);
    }

    // relocations, in section order then offset order; references with no
    // definition become undefined symbol entries in first-seen order
    let defined: BTreeSet<String> = obj.symbols.iter().map(|sym| sym.name.clone()).collect();
    let mut undefined = BTreeSet::new();
    for (index, section_name) in &kept {
        let section = file.section_by_index(*index)?;
        let mut relocs = vec![];
        for (reloc_offset, relocation) in section.relocations() {
            let kind = map_reloc_kind(
                relocation.kind(),
                relocation.encoding(),
                relocation.size(),
            )
            .ok_or_else(|| {
                anyhow!(
                    "Unsupported relocation {:?} in section {}",
                    relocation,
                    section_name
                )
            })?;
            let RelocationTarget::Symbol(symbol_index) = relocation.target() else {
                bail!("unsupported relocation target in section {section_name}");
            };
            let symbol = file.symbol_by_index(symbol_index)?;
            let symbol_name = if symbol.kind() == SymbolKind::Section {
                let target_index = symbol
                    .section_index()
                    .ok_or_else(|| anyhow!("section symbol without a section"))?;
                kept_name(target_index)
                    .ok_or_else(|| anyhow!("relocation against a discarded section"))?
            } else {
                symbol.name()?.to_string()
            };
            relocs.push(Reloc {
                kind,
                offset: reloc_offset,
                symbol: symbol_name,
                addend: relocation.addend(),
            });
        }
        relocs.sort_by_key(|reloc| reloc.offset);
        for reloc in &relocs {
            if !defined.contains(&reloc.symbol) && undefined.insert(reloc.symbol.clone()) {
                obj.symbols.push(Symbol {
                    binding: SymbolBinding::Undefined,
                    section: String::new(),
                    offset: 0,
                    size: 0,
                    name: reloc.symbol.clone(),
                });
            }
        }
        obj.sections.get_mut(section_name).unwrap().relocs = relocs;
    }

    Ok(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reloc_kind_mapping() {
        use RelocationEncoding::*;
        use RelocationKind::*;
        let cases = [
            ((Absolute, Generic, 64), Some(RelocKind::Abs64)),
            ((Absolute, Generic, 32), Some(RelocKind::Abs32)),
            ((Absolute, X86Signed, 32), Some(RelocKind::Abs32S)),
            ((Relative, Generic, 32), Some(RelocKind::Pcrel32)),
            ((PltRelative, Generic, 32), Some(RelocKind::Pcrel32)),
            ((GotRelative, Generic, 32), Some(RelocKind::GotPcrel32)),
            ((Absolute, Generic, 16), None),
            ((Relative, Generic, 64), None),
        ];
        for ((kind, encoding, size), expected) in cases {
            assert_eq!(map_reloc_kind(kind, encoding, size), expected);
        }
    }

    #[test]
    fn test_gotpcrelx_codes_map_to_gotpcrel() {
        for code in [
            object::elf::R_X86_64_GOTPCREL,
            object::elf::R_X86_64_GOTPCRELX,
            object::elf::R_X86_64_REX_GOTPCRELX,
        ] {
            assert_eq!(
                map_reloc_kind(RelocationKind::Elf(code), RelocationEncoding::Generic, 32),
                Some(RelocKind::GotPcrel32)
            );
        }
        assert_eq!(
            map_reloc_kind(
                RelocationKind::Elf(object::elf::R_X86_64_TPOFF32),
                RelocationEncoding::Generic,
                32
            ),
            None
        );
    }

    #[test]
    fn test_fle_path() {
        assert_eq!(fle_path("foo.o"), PathBuf::from("foo.fle"));
        assert_eq!(fle_path("build/out.o"), PathBuf::from("build/out.fle"));
        assert_eq!(fle_path("a.out"), PathBuf::from("a.fle"));
    }
}

use crate::error::FleError;
use crate::obj::{FleObject, ObjectKind, Reloc, RelocKind, Section, Symbol, SymbolBinding};
use anyhow::Context;
use log::info;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

const PREFIX_LOCAL: &str = "🏷️";
const PREFIX_WEAK: &str = "📎";
const PREFIX_GLOBAL: &str = "📤";
const PREFIX_BYTES: &str = "🔢";
const PREFIX_RELOC: &str = "❓";

/// Top-level keys that are not section bodies.
const RESERVED_KEYS: &[&str] = &[
    "type",
    "name",
    "entry",
    "phdrs",
    "shdrs",
    "needed",
    "members",
    "dyn_relocs",
];

fn malformed(msg: impl Into<String>) -> anyhow::Error {
    FleError::MalformedInput(msg.into()).into()
}

pub fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Read and parse an FLE file. A leading shebang line is stripped.
pub fn load_fle(path: &str) -> anyhow::Result<FleObject> {
    info!("Reading {}", path);
    let content =
        std::fs::read_to_string(path).context(format!("Reading file {}", path))?;
    parse_fle_str(&content, &basename(path))
        .context(format!("Parsing file {}", path))
}

pub fn parse_fle_str(content: &str, name: &str) -> anyhow::Result<FleObject> {
    let content = match content.strip_prefix("#!") {
        Some(rest) => rest.split_once('\n').map(|(_, body)| body).unwrap_or(""),
        None => content,
    };
    let doc: Value = serde_json::from_str(content)
        .map_err(|err| malformed(format!("JSON parse error: {err}")))?;
    let obj = parse_document(&doc, name)?;
    obj.validate()?;
    Ok(obj)
}

fn parse_document(doc: &Value, name: &str) -> anyhow::Result<FleObject> {
    let map = doc
        .as_object()
        .ok_or_else(|| malformed("top level is not a JSON object"))?;
    let kind_tag = map
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing type field"))?;
    let kind = ObjectKind::from_tag(kind_tag)
        .ok_or_else(|| malformed(format!("unknown object type {kind_tag}")))?;
    let name = map.get("name").and_then(Value::as_str).unwrap_or(name);
    let mut obj = FleObject::new(name, kind);

    if kind == ObjectKind::Archive {
        if let Some(members) = map.get("members").and_then(Value::as_array) {
            for member in members {
                let member_name = member
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                obj.members.push(parse_document(member, member_name)?);
            }
        }
        return Ok(obj);
    }

    obj.entry = map.get("entry").and_then(Value::as_u64);
    if let Some(phdrs) = map.get("phdrs") {
        obj.phdrs = serde_json::from_value(phdrs.clone())
            .map_err(|err| malformed(format!("bad phdrs: {err}")))?;
    }
    if let Some(shdrs) = map.get("shdrs") {
        obj.shdrs = serde_json::from_value(shdrs.clone())
            .map_err(|err| malformed(format!("bad shdrs: {err}")))?;
    }
    if let Some(needed) = map.get("needed") {
        obj.needed = serde_json::from_value(needed.clone())
            .map_err(|err| malformed(format!("bad needed: {err}")))?;
    }

    // first pass: collect every symbol definition, so a relocation may
    // reference a symbol from a section that appears later in the document
    let mut defined = BTreeSet::new();
    for (key, value) in map {
        if RESERVED_KEYS.contains(&key.as_str()) {
            continue;
        }
        let lines = value
            .as_array()
            .ok_or_else(|| malformed(format!("section {key} is not an array of lines")))?;
        for line in lines {
            let line = line
                .as_str()
                .ok_or_else(|| malformed(format!("non-string line in section {key}")))?;
            let (prefix, content) = split_line(line, key)?;
            let binding = match prefix {
                PREFIX_LOCAL => SymbolBinding::Local,
                PREFIX_WEAK => SymbolBinding::Weak,
                PREFIX_GLOBAL => SymbolBinding::Global,
                _ => continue,
            };
            let symbol = parse_symbol_line(content, binding, key)?;
            defined.insert(symbol.name.clone());
            obj.symbols.push(symbol);
        }
    }

    // second pass: decode section contents; relocation offsets come from
    // the stream position, each relocation reserving width(kind) bytes
    let mut undefined = BTreeSet::new();
    let mut pending_dyn: Vec<(String, u64, RelocKind, String, i64)> = vec![];
    for (key, value) in map {
        if RESERVED_KEYS.contains(&key.as_str()) {
            continue;
        }
        let mut section = Section {
            name: key.clone(),
            ..Section::default()
        };
        for line in value.as_array().unwrap() {
            let line = line.as_str().unwrap();
            let (prefix, content) = split_line(line, key)?;
            match prefix {
                PREFIX_BYTES => {
                    for byte in content.split_whitespace() {
                        let byte = u8::from_str_radix(byte, 16).map_err(|_| {
                            malformed(format!("bad hex byte {byte} in section {key}"))
                        })?;
                        section.data.push(byte);
                    }
                }
                PREFIX_RELOC => {
                    let (kind, dynamic, symbol, addend) = parse_reloc_line(content, key)?;
                    let offset = section.data.len() as u64;
                    if dynamic {
                        pending_dyn.push((key.clone(), offset, kind, symbol.clone(), addend));
                    } else {
                        section.relocs.push(Reloc {
                            kind,
                            offset,
                            symbol: symbol.clone(),
                            addend,
                        });
                        if !defined.contains(&symbol) && undefined.insert(symbol.clone()) {
                            obj.symbols.push(Symbol {
                                binding: SymbolBinding::Undefined,
                                section: String::new(),
                                offset: 0,
                                size: 0,
                                name: symbol,
                            });
                        }
                    }
                    section.data.extend(std::iter::repeat(0).take(kind.width() as usize));
                }
                PREFIX_LOCAL | PREFIX_WEAK | PREFIX_GLOBAL => {
                    section.has_symbols = true;
                }
                _ => {
                    return Err(malformed(format!(
                        "unknown line prefix {prefix} in section {key}"
                    )));
                }
            }
        }
        obj.sections.insert(key.clone(), section);
    }

    // dynamic relocations carry image-virtual offsets; rebase the stream
    // position onto the section's address
    for (section_name, offset, kind, symbol, addend) in pending_dyn {
        let base = section_base(&obj, &section_name).ok_or_else(|| {
            malformed(format!(
                "dynamic relocation in section {section_name} with no known address"
            ))
        })?;
        obj.dyn_relocs.push(Reloc {
            kind,
            offset: base + offset,
            symbol,
            addend,
        });
    }

    if let Some(relocs) = map.get("dyn_relocs").and_then(Value::as_array) {
        for entry in relocs {
            let code = entry
                .get("type")
                .and_then(Value::as_u64)
                .ok_or_else(|| malformed("dynamic relocation without type"))?;
            let kind = RelocKind::from_code(code as u32)
                .ok_or_else(|| malformed(format!("unknown relocation code {code}")))?;
            obj.dyn_relocs.push(Reloc {
                kind,
                offset: entry
                    .get("offset")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| malformed("dynamic relocation without offset"))?,
                symbol: entry
                    .get("symbol")
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed("dynamic relocation without symbol"))?
                    .to_string(),
                addend: entry.get("addend").and_then(Value::as_i64).unwrap_or(0),
            });
        }
    }

    Ok(obj)
}

fn split_line<'a>(line: &'a str, section: &str) -> anyhow::Result<(&'a str, &'a str)> {
    let (prefix, content) = line
        .split_once(':')
        .ok_or_else(|| malformed(format!("line without prefix in section {section}")))?;
    Ok((prefix.trim(), content.trim()))
}

fn parse_symbol_line(
    content: &str,
    binding: SymbolBinding,
    section: &str,
) -> anyhow::Result<Symbol> {
    let mut parts = content.split_whitespace();
    let (Some(name), Some(size), Some(offset), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed(format!(
            "bad symbol line {content:?} in section {section}"
        )));
    };
    let parse = |field: &str| {
        field
            .parse::<u64>()
            .map_err(|_| malformed(format!("bad symbol line {content:?} in section {section}")))
    };
    Ok(Symbol {
        binding,
        section: section.to_string(),
        offset: parse(offset)?,
        size: parse(size)?,
        name: name.to_string(),
    })
}

/// Decode `TAG(SYMBOL ± HEX_ADDEND)`.
fn parse_reloc_line(
    content: &str,
    section: &str,
) -> anyhow::Result<(RelocKind, bool, String, i64)> {
    let bad = || malformed(format!("invalid relocation {content:?} in section {section}"));
    let (tag, rest) = content.split_once('(').ok_or_else(bad)?;
    let inner = rest.strip_suffix(')').ok_or_else(bad)?;
    let (kind, dynamic) = RelocKind::from_tag(tag.trim()).ok_or_else(bad)?;
    let mut parts = inner.split_whitespace();
    let (Some(symbol), Some(sign), Some(addend), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(bad());
    };
    let addend = i64::from_str_radix(addend, 16).map_err(|_| bad())?;
    let addend = match sign {
        "+" => addend,
        "-" => -addend,
        _ => return Err(bad()),
    };
    Ok((kind, dynamic, symbol.to_string(), addend))
}

/// Address of a section, from its section header or its program header.
fn section_base(obj: &FleObject, name: &str) -> Option<u64> {
    if let Some(shdr) = obj.shdrs.iter().find(|shdr| shdr.name == name) {
        return Some(shdr.addr);
    }
    obj.phdrs
        .iter()
        .find(|phdr| phdr.name == name)
        .map(|phdr| phdr.vaddr)
}

/// Serialize an object back into the on-disk document.
pub fn dump_fle(obj: &FleObject) -> anyhow::Result<Value> {
    let mut map = Map::new();
    map.insert("type".to_string(), Value::from(obj.kind.tag()));

    if obj.kind == ObjectKind::Archive {
        map.insert("name".to_string(), Value::from(obj.name.clone()));
        let mut members = vec![];
        for member in &obj.members {
            let Value::Object(mut doc) = dump_fle(member)? else {
                unreachable!();
            };
            // members must carry their name so it can be recovered
            doc.insert("name".to_string(), Value::from(member.name.clone()));
            members.push(Value::Object(doc));
        }
        map.insert("members".to_string(), Value::from(members));
        return Ok(Value::Object(map));
    }

    if !obj.phdrs.is_empty() {
        map.insert("phdrs".to_string(), serde_json::to_value(&obj.phdrs)?);
    }
    if obj.kind == ObjectKind::Executable {
        map.insert("entry".to_string(), Value::from(obj.entry.unwrap_or(0)));
    }
    if !obj.shdrs.is_empty() {
        map.insert("shdrs".to_string(), serde_json::to_value(&obj.shdrs)?);
    }
    if !obj.needed.is_empty() {
        map.insert("needed".to_string(), serde_json::to_value(&obj.needed)?);
    }

    // scatter dynamic relocations back into the sections whose address
    // range contains them
    let mut dyn_by_section: BTreeMap<&str, Vec<Reloc>> = BTreeMap::new();
    for reloc in &obj.dyn_relocs {
        let owner = obj
            .sections
            .keys()
            .find(|name| {
                section_base(obj, name.as_str()).is_some_and(|base| {
                    let size = section_span(obj, name.as_str());
                    base <= reloc.offset && reloc.offset < base + size
                })
            })
            .ok_or_else(|| {
                malformed(format!(
                    "dynamic relocation offset {:#x} outside known sections",
                    reloc.offset
                ))
            })?;
        let base = section_base(obj, owner).unwrap();
        dyn_by_section.entry(owner).or_default().push(Reloc {
            offset: reloc.offset - base,
            ..reloc.clone()
        });
    }

    // section bodies, ordered by file offset (address for linked images)
    let mut names: Vec<&String> = obj.sections.keys().collect();
    names.sort_by_key(|name| section_order_key(obj, name.as_str()));
    for name in names {
        let lines = section_lines(
            obj,
            &obj.sections[name],
            dyn_by_section.get(name.as_str()).map_or(&[][..], |v| v),
        );
        map.insert(name.clone(), Value::from(lines));
    }

    Ok(Value::Object(map))
}

fn section_span(obj: &FleObject, name: &str) -> u64 {
    if let Some(shdr) = obj.shdrs.iter().find(|shdr| shdr.name == name) {
        return shdr.size;
    }
    obj.phdrs
        .iter()
        .find(|phdr| phdr.name == name)
        .map(|phdr| phdr.size)
        .unwrap_or(0)
}

fn section_order_key(obj: &FleObject, name: &str) -> u64 {
    if let Some(shdr) = obj.shdrs.iter().find(|shdr| shdr.name == name) {
        return shdr.offset;
    }
    obj.phdrs
        .iter()
        .find(|phdr| phdr.name == name)
        .map(|phdr| phdr.vaddr)
        .unwrap_or(0)
}

fn format_reloc(reloc: &Reloc, dynamic: bool) -> String {
    let tag = if dynamic {
        reloc.kind.dyn_tag()
    } else {
        reloc.kind.tag()
    };
    let sign = if reloc.addend < 0 { '-' } else { '+' };
    format!(
        "{PREFIX_RELOC}: {tag}({} {sign} {:x})",
        reloc.symbol,
        reloc.addend.unsigned_abs()
    )
}

fn format_symbol(symbol: &Symbol) -> String {
    let prefix = match symbol.binding {
        SymbolBinding::Local => PREFIX_LOCAL,
        SymbolBinding::Weak => PREFIX_WEAK,
        SymbolBinding::Global => PREFIX_GLOBAL,
        SymbolBinding::Undefined => unreachable!("undefined symbols have no section"),
    };
    format!(
        "{prefix}: {} {} {}",
        symbol.name, symbol.size, symbol.offset
    )
}

fn section_lines(obj: &FleObject, section: &Section, dynamics: &[Reloc]) -> Vec<String> {
    // symbols and relocations indexed by offset; hex rows break at both
    let mut symbol_index: BTreeMap<u64, Vec<&Symbol>> = BTreeMap::new();
    for symbol in &obj.symbols {
        if symbol.binding != SymbolBinding::Undefined && symbol.section == section.name {
            symbol_index.entry(symbol.offset).or_default().push(symbol);
        }
    }
    let mut reloc_index: BTreeMap<u64, Vec<(&Reloc, bool)>> = BTreeMap::new();
    for reloc in &section.relocs {
        reloc_index.entry(reloc.offset).or_default().push((reloc, false));
    }
    for reloc in dynamics {
        reloc_index.entry(reloc.offset).or_default().push((reloc, true));
    }
    let breaks: BTreeSet<u64> = symbol_index
        .keys()
        .chain(reloc_index.keys())
        .copied()
        .collect();

    let len = section.data.len() as u64;
    let mut lines = vec![];
    let mut emitted = BTreeSet::new();
    let mut pos = 0;
    loop {
        if let Some(symbols) = symbol_index.get(&pos) {
            emitted.insert(pos);
            for symbol in symbols {
                lines.push(format_symbol(symbol));
            }
        }
        if let Some(relocs) = reloc_index.get(&pos) {
            for (reloc, dynamic) in relocs {
                lines.push(format_reloc(reloc, *dynamic));
                pos += reloc.kind.width();
            }
            continue;
        }
        if pos >= len {
            break;
        }
        let next = breaks
            .range(pos + 1..)
            .next()
            .copied()
            .unwrap_or(len)
            .min(len);
        while pos < next {
            let chunk = (next - pos).min(16);
            let row: Vec<String> = section.data[pos as usize..(pos + chunk) as usize]
                .iter()
                .map(|byte| format!("{byte:02x}"))
                .collect();
            lines.push(format!("{PREFIX_BYTES}: {}", row.join(" ")));
            pos += chunk;
        }
    }
    // symbols the position walk never reached, e.g. bss symbols past the
    // end of an empty body
    for (offset, symbols) in &symbol_index {
        if !emitted.contains(offset) {
            for symbol in symbols {
                lines.push(format_symbol(symbol));
            }
        }
    }
    lines
}

/// Serialize `obj` and write it to `path`.
pub fn write_fle(obj: &FleObject, path: &str) -> anyhow::Result<()> {
    let doc = dump_fle(obj)?;
    let mut text = serde_json::to_string_pretty(&doc)?;
    text.push('\n');
    std::fs::write(path, text).context(format!("Writing file {}", path))?;
    info!("Wrote {}", path);
    Ok(())
}

use crate::obj::{FleObject, Symbol, SymbolBinding};

/// nm-style class letter, by section prefix and binding. Symbols outside
/// the text/data/bss/rodata families have no letter and are skipped.
fn class_char(symbol: &Symbol) -> Option<char> {
    let section = symbol.section.as_str();
    let is_text = section == ".text" || section.starts_with(".text.");
    let is_data = section == ".data" || section.starts_with(".data.");
    let is_bss = section == ".bss";
    let is_rodata = section == ".rodata" || section.starts_with(".rodata.");

    match symbol.binding {
        SymbolBinding::Weak if is_text => Some('W'),
        SymbolBinding::Weak if is_data || is_bss || is_rodata => Some('V'),
        SymbolBinding::Global | SymbolBinding::Local => {
            let upper = match () {
                _ if is_text => 'T',
                _ if is_data => 'D',
                _ if is_bss => 'B',
                _ if is_rodata => 'R',
                _ => return None,
            };
            if symbol.binding == SymbolBinding::Global {
                Some(upper)
            } else {
                Some(upper.to_ascii_lowercase())
            }
        }
        _ => None,
    }
}

/// Render the symbol table, one `offset class name` line per defined
/// symbol.
pub fn dump(obj: &FleObject) -> String {
    let mut out = String::new();
    for symbol in &obj.symbols {
        if symbol.section.is_empty() {
            continue;
        }
        if let Some(class) = class_char(symbol) {
            out.push_str(&format!("{:016x} {} {}\n", symbol.offset, class, symbol.name));
        }
    }
    out
}

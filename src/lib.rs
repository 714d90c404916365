pub mod cc;
pub mod error;
pub mod format;
pub mod link;
pub mod load;
pub mod nm;
pub mod obj;
pub mod opt;

pub use error::FleError;
pub use format::{dump_fle, load_fle, parse_fle_str, write_fle};
pub use link::{find_library, link, path_resolution};
pub use obj::{FleObject, ObjectKind, Reloc, RelocKind, Section, Symbol, SymbolBinding};
pub use opt::{parse_opts, InputOpt, Opt};

use std::io;
use thiserror::Error;

/// Fatal conditions shared by the linker and the loader.
#[derive(Error, Debug)]
pub enum FleError {
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("undefined symbol: {0}")]
    UndefinedSymbol(String),
    #[error("multiple definition of strong symbol: {0}")]
    DuplicateStrongSymbol(String),
    #[error("cannot find -l{0}")]
    LibraryNotFound(String),
    #[error("relocation against {0} does not fit its width")]
    LayoutOverflow(String),
    #[error("{op} failed: {source}")]
    MapFailed {
        op: &'static str,
        source: io::Error,
    },
}

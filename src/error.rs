use thiserror::Error;

/// Every fallible surface in this crate returns one of these.
#[derive(Error, Debug)]
pub enum WbfsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("binary format error: {0}")]
    BinRw(#[from] binrw::Error),

    #[error("format error: {0}")]
    Format(String),

    #[error("stored geometry disagrees with device geometry: {0}")]
    Integrity(String),

    #[error("container has no free blocks left to satisfy this request")]
    Full,

    #[error("a disc with id {0:?} is already present")]
    Duplicate(String),

    #[error("no disc with id {0:?} was found")]
    NotFound(String),

    #[error("operation aborted by caller")]
    Abort,
}

pub type Result<T> = std::result::Result<T, WbfsError>;

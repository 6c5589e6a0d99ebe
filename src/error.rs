use std::fmt;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PgzError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("bad gzip header: {0}")]
    BadGzipHeader(String),

    #[error("unsupported gzip flag: {0}")]
    UnsupportedFlag(String),

    #[error("corrupt deflate stream: {0}")]
    CorruptStream(String),

    #[error("could not find a block boundary within {0} bits of the assigned offset")]
    SyncFailed(u64),

    #[error("chunk output exceeded the window budget")]
    WindowOverflow,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("worker thread failed: {0}")]
    Thread(String),
}

impl PgzError {
    pub fn corrupt<T: fmt::Display>(msg: T) -> Self {
        PgzError::CorruptStream(msg.to_string())
    }

    pub fn invalid_argument<T: fmt::Display>(msg: T) -> Self {
        PgzError::InvalidArgument(msg.to_string())
    }

    pub fn thread<T: fmt::Display>(msg: T) -> Self {
        PgzError::Thread(msg.to_string())
    }
}

pub type PgzResult<T> = Result<T, PgzError>;

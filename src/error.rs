use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timestamp {timestamp} precedes the ttl bound {bound}")]
    OutOfTtl { timestamp: i64, bound: i64 },
    #[error("insufficient disk space: {0}")]
    DiskSpaceInsufficient(String),
    #[error("load failed: {0}")]
    LoadFile(String),
    #[error("merge failed: {0}")]
    Merge(String),
    #[error("processor close failed: {0}")]
    Processor(String),
    #[error("write rejected: {0}")]
    WriteProcess(String),
    #[error("metadata error: {0}")]
    Metadata(String),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("metadata codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BlockStoreError>;

#[derive(Error, Debug)]
pub enum BlockStoreError {
    #[error("index {index} out of range, must be less than {limit}")]
    OutOfRange { index: usize, limit: usize },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    #[error("no free blocks available")]
    NoSpace,
    #[error("block {0} is already in use")]
    AlreadyUsed(usize),
    #[error("short read: expected {expected} bytes, found {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("could not reserve {0} bytes for block storage")]
    AllocationFailed(usize),
    #[error("block image io failed")]
    Io(#[from] std::io::Error),
}

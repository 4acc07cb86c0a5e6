use object::Address;

use crate::CollectorKind;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    #[error("invalid heap settings: {0}")]
    InvalidSettings(&'static str),
    #[error("failed to map {size} bytes")]
    MapFailed { size: usize },
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("placement not supported by this collector")]
    PlacementUnavailable,
    #[error("object graph does not fit into the copy space")]
    GraphCopyOutOfMemory,
    #[error("address {0} is outside the live heap")]
    ForeignRoot(Address),
    #[error("invalid object layout: {0}")]
    InvalidLayout(&'static str),
    #[error("operation not supported by the {0:?} collector")]
    Unsupported(CollectorKind),
}

pub type HeapResult<T> = Result<T, HeapError>;

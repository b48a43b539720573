#![forbid(unsafe_code)]

use std::fmt;

/// Offset of a node block within the key file. Doubles as the node's
/// stable identity; the root always lives at block 0.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub u64);

/// Sentinel child id meaning "no child allocated".
pub const EMPTY_CHILD: NodeId = NodeId(0);

/// Sentinel value offset marking a slot as a synthetic stride anchor
/// rather than a real inserted key.
pub const SYNTHETIC_VALUE: u64 = u64::MAX;

#[derive(thiserror::Error, Debug)]
pub enum EstriaError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("corruption: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("key has wrong length")]
    KeyWrongLength,
    #[error("key not found")]
    KeyNotFound,
    #[error("value not found")]
    ValueNotFound,
    #[error("value too long")]
    ValueTooLong,
    #[error("zero length value")]
    ZeroLengthValue,
    #[error("short read")]
    ShortRead,
    #[error("short write")]
    ShortWrite,
    #[error("bad commit: {0}")]
    BadCommit(&'static str),
    #[error("key arithmetic overflow")]
    Overflow,
}

pub type Result<T> = std::result::Result<T, EstriaError>;

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        NodeId(value)
    }
}

impl From<NodeId> for u64 {
    fn from(value: NodeId) -> Self {
        value.0
    }
}

/// Everything a PMR operation can fail with.
///
/// Backend callbacks report through the same type, so their errors reach the
/// caller unchanged.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PmrError {
    #[error("logical size does not match chunk size times logical chunk count")]
    BadMappingTableSize,
    #[error("logical offset lies outside the mapping table")]
    BadMapping,
    #[error("chunk index out of range or in the wrong backing state")]
    InvalidChunk,
    #[error("reference or lock count would overflow or underflow")]
    RefcountOverflow,
    #[error("invalid parameters")]
    InvalidParams,
    #[error("operation not permitted in the current resource state")]
    NotPermitted,
    #[error("backend does not implement this operation")]
    NotImplemented,
    #[error("wrong password or stale resource")]
    WrongPasswordOrStaleResource,
    #[error("import attributes do not match the export")]
    MismatchedAttributes,
    #[error("size is not a multiple of the page size")]
    NotPageMultiple,
    #[error("resource flags are unsuitable for this use")]
    InvalidPmrFlags,
    #[error("try again later")]
    Retry,
    #[error("{live} resources still live")]
    LiveResources { live: usize },
    #[error("device id {0} is out of range")]
    InvalidDeviceId(u8),
    #[error("out of memory")]
    OutOfMemory,
    #[error("backend failure: {0}")]
    Factory(&'static str),
}

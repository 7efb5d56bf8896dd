/// Errors that can occur while encoding or decoding values and messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The tag byte does not name any known value type.
    #[error("unknown value tag 0x{0:02x}")]
    UnknownTag(u8),

    /// The buffer ended before a complete value or header was read.
    #[error("truncated input (needed {needed} bytes, {remaining} remaining)")]
    Truncated { needed: usize, remaining: usize },

    /// Containers are nested deeper than the configured limit.
    #[error("nesting depth exceeds {max}")]
    DepthExceeded { max: usize },

    /// A string or byte payload is too long for its u32 length prefix.
    #[error("payload too long ({len} bytes, max {max})")]
    PayloadTooLong { len: usize, max: usize },

    /// A list or map holds more entries than its u16 count prefix allows.
    #[error("too many elements ({len}, max {max})")]
    TooManyElements { len: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Decode failures for binary client and server messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,

    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    #[error("truncated {field}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("string of {0} bytes does not fit a u16 length prefix")]
    StringTooLong(usize),
}

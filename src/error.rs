//! Error taxonomy shared by the server and the client library.
//!
//! Every response on the wire carries a single `i32` result code. The
//! numeric assignments are stable; modules written against older servers
//! depend on them.

use thiserror::Error;

/// Result alias used throughout the core subsystems.
pub type DaxResult<T> = Result<T, ErrorCode>;

/// The wire-level error taxonomy.
///
/// Codes are negative on the wire; `ErrorCode::Ok` is never transmitted as
/// an error (a successful response simply has no error flag set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorCode {
    /// Operation succeeded
    #[error("no error")]
    Ok,
    /// Unspecified failure
    #[error("generic failure")]
    Generic,
    /// No socket connection to the server
    #[error("no socket")]
    NoSocket,
    /// An argument or payload exceeds a size limit
    #[error("argument too large")]
    TooBig,
    /// An argument is missing or malformed
    #[error("bad argument")]
    Arg,
    /// The named object does not exist
    #[error("not found")]
    NotFound,
    /// Failed to send a message
    #[error("message send failed")]
    MsgSend,
    /// Failed to receive a message
    #[error("message receive failed")]
    MsgRecv,
    /// Tag name fails syntax or length rules
    #[error("bad tag name")]
    TagBad,
    /// A tag with that name already exists with a different shape
    #[error("duplicate tag")]
    TagDupl,
    /// Allocation failure
    #[error("allocation failed")]
    Alloc,
    /// A message could not be decoded
    #[error("malformed message")]
    MsgBad,
    /// Duplicate object
    #[error("duplicate")]
    Dupl,
    /// The library has not been initialized
    #[error("not initialized")]
    NoInit,
    /// A request timed out
    #[error("timeout")]
    Timeout,
    /// The operation is not legal in the current state
    #[error("illegal operation")]
    Illegal,
    /// The object is in use and cannot be removed
    #[error("in use")]
    InUse,
    /// Text could not be parsed
    #[error("parse error")]
    Parse,
    /// Internal inconsistency; indicates a server bug
    #[error("internal inconsistency")]
    Arbitrary,
    /// Feature not implemented
    #[error("not implemented")]
    NotImplemented,
    /// A queue or counter overflowed
    #[error("overflow")]
    Overflow,
    /// A queue is empty
    #[error("empty")]
    Empty,
    /// The type code is unknown or unsuitable
    #[error("bad type")]
    BadType,
    /// The index is out of range
    #[error("bad index")]
    BadIndex,
    /// The connection is not registered
    #[error("not authorized")]
    Auth,
    /// The peer disconnected
    #[error("disconnected")]
    Disconnected,
    /// The object is read only
    #[error("read only")]
    ReadOnly,
}

impl ErrorCode {
    /// Numeric wire representation.
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::Generic => -1,
            ErrorCode::NoSocket => -2,
            ErrorCode::TooBig => -3,
            ErrorCode::Arg => -4,
            ErrorCode::NotFound => -5,
            ErrorCode::MsgSend => -6,
            ErrorCode::MsgRecv => -7,
            ErrorCode::TagBad => -8,
            ErrorCode::TagDupl => -9,
            ErrorCode::Alloc => -10,
            ErrorCode::MsgBad => -11,
            ErrorCode::Dupl => -12,
            ErrorCode::NoInit => -13,
            ErrorCode::Timeout => -14,
            ErrorCode::Illegal => -15,
            ErrorCode::InUse => -16,
            ErrorCode::Parse => -17,
            ErrorCode::Arbitrary => -18,
            ErrorCode::NotImplemented => -19,
            ErrorCode::Overflow => -20,
            ErrorCode::Empty => -21,
            ErrorCode::BadType => -22,
            ErrorCode::BadIndex => -23,
            ErrorCode::Auth => -24,
            ErrorCode::Disconnected => -25,
            ErrorCode::ReadOnly => -26,
        }
    }

    /// Decode a wire code. Unknown codes map to `Generic`.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ErrorCode::Ok,
            -2 => ErrorCode::NoSocket,
            -3 => ErrorCode::TooBig,
            -4 => ErrorCode::Arg,
            -5 => ErrorCode::NotFound,
            -6 => ErrorCode::MsgSend,
            -7 => ErrorCode::MsgRecv,
            -8 => ErrorCode::TagBad,
            -9 => ErrorCode::TagDupl,
            -10 => ErrorCode::Alloc,
            -11 => ErrorCode::MsgBad,
            -12 => ErrorCode::Dupl,
            -13 => ErrorCode::NoInit,
            -14 => ErrorCode::Timeout,
            -15 => ErrorCode::Illegal,
            -16 => ErrorCode::InUse,
            -17 => ErrorCode::Parse,
            -18 => ErrorCode::Arbitrary,
            -19 => ErrorCode::NotImplemented,
            -20 => ErrorCode::Overflow,
            -21 => ErrorCode::Empty,
            -22 => ErrorCode::BadType,
            -23 => ErrorCode::BadIndex,
            -24 => ErrorCode::Auth,
            -25 => ErrorCode::Disconnected,
            -26 => ErrorCode::ReadOnly,
            _ => ErrorCode::Generic,
        }
    }
}

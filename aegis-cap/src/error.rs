//! Status codes
//!
//! Every reply frame is tagged with a status word: zero for success, one
//! of the codes below otherwise. On the error arm the callee clears the
//! reply and pushes the code, so a caller must check the status before
//! reading any further payload (`Frame::check_reply` does this).

use core::fmt;

/// Errors surfaced by portal calls and the runtime itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[must_use = "status codes must be handled"]
#[repr(u64)]
pub enum Error {
    /// Malformed request: unknown command, bad CPU, typed-item sequence
    /// not matching the protocol, or a frame overflow.
    ArgsInvalid = 1,

    /// The named service, session, dataspace or region does not exist.
    NotFound = 2,

    /// A registration conflicts with an existing name.
    Exists = 3,

    /// A resource limit was hit: selectors, sessions, GSI slots.
    Capacity = 4,

    /// The callee vanished while the call was in flight, e.g. the
    /// portal was revoked or its protection domain was destroyed.
    Abort = 5,

    /// An internal failure on the supervisor side.
    Failure = 6,

    /// The ELF image is structurally invalid.
    ElfInvalid = 7,

    /// The ELF magic bytes are missing.
    ElfSig = 8,
}

impl Error {
    /// Numeric code as transported in reply frames.
    #[inline]
    #[must_use]
    pub const fn code(self) -> u64 {
        self as u64
    }

    /// Reconstruct an error from a wire code. Zero means success and
    /// yields `None`; unknown codes collapse to [`Error::Failure`].
    pub const fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => None,
            1 => Some(Self::ArgsInvalid),
            2 => Some(Self::NotFound),
            3 => Some(Self::Exists),
            4 => Some(Self::Capacity),
            5 => Some(Self::Abort),
            7 => Some(Self::ElfInvalid),
            8 => Some(Self::ElfSig),
            _ => Some(Self::Failure),
        }
    }

    /// Short description for logs and `Display`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ArgsInvalid => "invalid arguments",
            Self::NotFound => "not found",
            Self::Exists => "already exists",
            Self::Capacity => "out of capacity",
            Self::Abort => "aborted by peer",
            Self::Failure => "internal failure",
            Self::ElfInvalid => "invalid ELF image",
            Self::ElfSig => "missing ELF signature",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

/// Result type used throughout the runtime.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for e in [
            Error::ArgsInvalid,
            Error::NotFound,
            Error::Exists,
            Error::Capacity,
            Error::Abort,
            Error::Failure,
            Error::ElfInvalid,
            Error::ElfSig,
        ] {
            assert_eq!(Error::from_code(e.code()), Some(e));
        }
    }

    #[test]
    fn test_success_and_unknown_codes() {
        assert_eq!(Error::from_code(0), None);
        assert_eq!(Error::from_code(0xdead), Some(Error::Failure));
    }
}

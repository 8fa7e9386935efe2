use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

/// Represents an error encountered when converting or applying capability state.
///
/// Kernel failures are passed through verbatim as [`Error::Os`]; everything else describes input
/// that could not be accepted. None of the parsing errors leave a partially-populated value
/// behind.
#[derive(Copy, Clone, Eq, PartialEq)]
pub enum Error {
    /// An `errno` value reported by the kernel.
    Os(i32),
    /// A capability value outside of `0..maxValues`.
    BadValue,
    /// Text that does not follow the capability grammar.
    BadText,
    /// A binary payload with a bad magic number, an unknown revision, or an inconsistent length.
    BadFormat,
    /// A requested [`Mode`](crate::caps::Mode) that cannot be entered.
    BadMode,
}

impl Error {
    /// Get the last OS error that occured (i.e. the current `errno` value).
    #[inline]
    pub fn last() -> Self {
        Self::Os(unsafe { *libc::__errno_location() })
    }

    /// Construct an `Error` from an `errno` code.
    #[inline]
    pub fn from_code(eno: i32) -> Self {
        Self::Os(eno)
    }

    /// Get the `errno` code represented by this `Error` object, if it came from the kernel.
    #[inline]
    pub fn code(&self) -> Option<i32> {
        match *self {
            Self::Os(eno) => Some(eno),
            _ => None,
        }
    }

    fn strerror(&self) -> &'static str {
        match *self {
            Self::Os(eno) => unsafe { std::ffi::CStr::from_ptr(libc::strerror(eno)) }
                .to_str()
                .unwrap_or("Unknown error"),
            Self::BadValue => "bad capability value",
            Self::BadText => "bad capability text",
            Self::BadFormat => "bad capability payload",
            Self::BadMode => "unsupported mode",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.strerror())?;
        if let Self::Os(eno) = self {
            write!(f, " (code {})", eno)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Os(eno) => f
                .debug_struct("Error")
                .field("code", eno)
                .field("message", &self.strerror())
                .finish(),
            _ => f
                .debug_struct("Error")
                .field("message", &self.strerror())
                .finish(),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for std::io::Error {
    #[inline]
    fn from(e: Error) -> Self {
        match e {
            Error::Os(eno) => Self::from_raw_os_error(eno),
            Error::BadFormat => Self::new(std::io::ErrorKind::InvalidData, e),
            _ => Self::new(std::io::ErrorKind::InvalidInput, e),
        }
    }
}

impl From<std::io::Error> for Error {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        Self::Os(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

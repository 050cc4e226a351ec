//! Errors produced by the 9P codec and server

/// An error decoding a message or serving a connection.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The connection failed
    #[error("9p I/O: {0}")]
    Io(#[from] std::io::Error),
    /// A message ended before all its fields were read
    #[error("truncated 9p message: needed {needed} more bytes for {field}")]
    Truncated {
        /// Field being decoded
        field: &'static str,
        /// Bytes missing
        needed: usize,
    },
    /// A string field was not UTF-8
    #[error("9p string field is not valid UTF-8")]
    InvalidString,
    /// A message type this codec does not know
    #[error("unknown 9p message type {0}")]
    UnknownType(u8),
    /// A message larger than the negotiated msize
    #[error("9p message of {size} bytes exceeds msize {msize}")]
    TooLarge {
        /// Announced size
        size: u32,
        /// Negotiated limit
        msize: u32,
    },
}

/// Maps an I/O error onto the Linux errno sent back in `Rlerror`.
pub fn errno(err: &std::io::Error) -> u32 {
    if let Some(code) = err.raw_os_error() {
        return code as u32;
    }
    use std::io::ErrorKind::*;
    let code = match err.kind() {
        NotFound => libc::ENOENT,
        PermissionDenied => libc::EACCES,
        AlreadyExists => libc::EEXIST,
        InvalidInput | InvalidData => libc::EINVAL,
        Unsupported => libc::EOPNOTSUPP,
        _ => libc::EIO,
    };
    code as u32
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_prefers_the_os_code() {
        let e = std::io::Error::from_raw_os_error(libc::ENOTDIR);
        assert_eq!(errno(&e), libc::ENOTDIR as u32);
        let e = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(errno(&e), libc::ENOENT as u32);
        let e = std::io::Error::new(std::io::ErrorKind::Other, "weird");
        assert_eq!(errno(&e), libc::EIO as u32);
    }
}

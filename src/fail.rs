// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use custom_error::custom_error;

custom_error! {
    /// Errors raised by the shim itself. These are distinct from backend
    /// completion failures, which arrive wrapped in [crate::backend::Completion].
    #[derive(PartialEq)]
    pub Fail

    Malformed { details: &'static str } = "Malformed input: {details}",
    Unsupported { details: &'static str } = "Unsupported: {details}",
    Invalid { details: &'static str } = "Invalid argument: {details}",
    BadFileDescriptor {} = "Bad file descriptor",
    AddressFamilySupport {} = "Address family not supported",
    SocketTypeSupport {} = "Socket type not supported",
    AddressInUse {} = "Address already in use",
    TooManyOpenedFiles {} = "Too many open files",
    ResourceExhausted { details: &'static str } = "Resource exhausted: {details}",
    WouldBlock {} = "Operation would block",
    TimedOut {} = "Operation timed out",
    ConnectionAborted {} = "Connection aborted",
    ConnectionRefused {} = "Connection refused",
    NotSupported { details: &'static str } = "Not supported: {details}",
    Io { details: String } = "I/O error: {details}",
}

impl Fail {
    /// Maps a [Fail] onto the `errno` value the Public API Shim surfaces to callers.
    pub fn errno(&self) -> libc::c_int {
        match self {
            Fail::Malformed { .. } => libc::EINVAL,
            Fail::Unsupported { .. } => libc::EOPNOTSUPP,
            Fail::Invalid { .. } => libc::EINVAL,
            Fail::BadFileDescriptor {} => libc::EBADF,
            Fail::AddressFamilySupport {} => libc::EAFNOSUPPORT,
            Fail::SocketTypeSupport {} => libc::EPROTONOSUPPORT,
            Fail::AddressInUse {} => libc::EADDRINUSE,
            Fail::TooManyOpenedFiles {} => libc::EMFILE,
            Fail::ResourceExhausted { .. } => libc::ENOMEM,
            Fail::WouldBlock {} => libc::EWOULDBLOCK,
            Fail::TimedOut {} => libc::ETIMEDOUT,
            Fail::ConnectionAborted {} => libc::ECONNABORTED,
            Fail::ConnectionRefused {} => libc::ECONNREFUSED,
            Fail::NotSupported { .. } => libc::ENOSYS,
            Fail::Io { .. } => libc::EIO,
        }
    }
}

impl From<std::io::Error> for Fail {
    fn from(e: std::io::Error) -> Self {
        Fail::Io {
            details: e.to_string(),
        }
    }
}

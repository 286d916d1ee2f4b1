// Copyright 2026 Directory Services Engineering

//! LDAP operation results and the crate error type.

use thiserror::Error;

/// LDAP result codes, restricted to the values this layer produces or
/// inspects. Server codes use their RFC 4511 values; client-side codes use
/// the de facto SDK values in the 80+ range and never appear on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ResultCode {
    Success,
    OperationsError,
    NoSuchEntry,
    Busy,
    Unavailable,
    /// A connection to a server could not be established.
    ClientSideConnectError,
    /// A blocking wait on an operation result timed out.
    ClientSideTimeout,
    /// The operation was cancelled by the client before it completed.
    ClientSideUserCancelled,
    /// A single-entry search matched no entries.
    ClientSideNoResultsReturned,
    /// A single-entry search matched more than one entry or a reference.
    ClientSideUnexpectedResultsReturned,
    /// A local (non-protocol) failure, such as use of a closed handle.
    ClientSideLocalError,
    /// Any other protocol result code.
    Other(u16),
}

impl ResultCode {
    /// True for codes generated locally by the client rather than reported
    /// by a server.
    pub fn is_client_side(self) -> bool {
        matches!(
            self,
            ResultCode::ClientSideConnectError
                | ResultCode::ClientSideTimeout
                | ResultCode::ClientSideUserCancelled
                | ResultCode::ClientSideNoResultsReturned
                | ResultCode::ClientSideUnexpectedResultsReturned
                | ResultCode::ClientSideLocalError
        )
    }

    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ResultCode::Success => "success".fmt(fmt),
            ResultCode::OperationsError => "operations error".fmt(fmt),
            ResultCode::NoSuchEntry => "no such entry".fmt(fmt),
            ResultCode::Busy => "busy".fmt(fmt),
            ResultCode::Unavailable => "unavailable".fmt(fmt),
            ResultCode::ClientSideConnectError => "connect error".fmt(fmt),
            ResultCode::ClientSideTimeout => "client-side timeout".fmt(fmt),
            ResultCode::ClientSideUserCancelled => "cancelled by user".fmt(fmt),
            ResultCode::ClientSideNoResultsReturned => {
                "no results returned".fmt(fmt)
            }
            ResultCode::ClientSideUnexpectedResultsReturned => {
                "unexpected results returned".fmt(fmt)
            }
            ResultCode::ClientSideLocalError => "local error".fmt(fmt),
            ResultCode::Other(value) => write!(fmt, "result code {}", value),
        }
    }
}

/// The final outcome of a successfully completed LDAP operation.
#[derive(Clone, Debug)]
pub struct LdapResult {
    pub result_code: ResultCode,
    pub diagnostic_message: String,
    pub matched_dn: Option<String>,
}

impl LdapResult {
    pub fn success() -> Self {
        LdapResult {
            result_code: ResultCode::Success,
            diagnostic_message: String::new(),
            matched_dn: None,
        }
    }

    pub fn new(result_code: ResultCode) -> Self {
        LdapResult {
            result_code,
            diagnostic_message: String::new(),
            matched_dn: None,
        }
    }
}

/// The error type for every fallible operation in this crate.
///
/// `LdapError` is `Clone` because a single underlying failure may need to be
/// delivered to several waiters, e.g. when a connection factory fails while
/// multiple pool claims are pending.
#[derive(Clone, Debug, Error)]
#[error("{result_code}: {message}")]
pub struct LdapError {
    pub result_code: ResultCode,
    pub message: String,
}

impl LdapError {
    pub fn new<S: Into<String>>(result_code: ResultCode, message: S) -> Self {
        LdapError {
            result_code,
            message: message.into(),
        }
    }

    pub fn connect_error<S: Into<String>>(message: S) -> Self {
        LdapError::new(ResultCode::ClientSideConnectError, message)
    }

    pub fn cancelled() -> Self {
        LdapError::new(
            ResultCode::ClientSideUserCancelled,
            "operation cancelled before completion",
        )
    }

    pub fn timeout() -> Self {
        LdapError::new(
            ResultCode::ClientSideTimeout,
            "timed out waiting for operation result",
        )
    }

    pub fn local_error<S: Into<String>>(message: S) -> Self {
        LdapError::new(ResultCode::ClientSideLocalError, message)
    }
}

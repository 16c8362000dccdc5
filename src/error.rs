//! Typed error kinds for the forwarder.
//!
//! The kinds mirror the propagation table in the design: a handful are fatal
//! at startup and carry a process exit code, the rest terminate a single
//! query (or, for [`Error::Oom`], a single event) while the accept/recv loop
//! keeps running.

/// Exit codes used by `main` when a startup error kind surfaces.
pub mod exit_code {
    pub const USAGE: i32 = 1;
    pub const RESOLVE_FAIL: i32 = 2;
    pub const OOM: i32 = 3;
    pub const LISTEN_FAIL: i32 = 4;
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Config file missing, malformed, or missing a required server entry.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// `getaddrinfo`-equivalent resolution of a server or local bind address failed.
    #[error("address resolution failed: {0}")]
    ResolveFail(String),

    /// Binding or configuring a listening socket failed.
    #[error("listener setup failed: {0}")]
    ListenFail(#[source] std::io::Error),

    /// Allocation failure for a per-connection resource. Non-fatal: the
    /// triggering event is dropped and the loop continues.
    #[error("allocation failure: {0}")]
    Oom(String),

    /// The client closed or reset the connection.
    #[error("client reset")]
    ClientReset(#[source] std::io::Error),

    /// `connect()` to the chosen ioserver failed.
    #[error("connect to ioserver failed: {0}")]
    RemoteConnectFail(#[source] std::io::Error),

    /// The ioserver closed or reset the connection after accepting it.
    #[error("ioserver reset")]
    RemoteReset(#[source] std::io::Error),

    /// A `send`/`write` failed for a reason other than the peer resetting.
    #[error("send failed: {0}")]
    SendFail(#[source] std::io::Error),

    /// The outbound DNS message could not be parsed to extract a QNAME.
    #[error("failed to parse DNS query: {0}")]
    ParseFail(String),
}

impl Error {
    /// The process exit code for kinds that are fatal at startup, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::ConfigInvalid(_) => Some(exit_code::USAGE),
            Error::ResolveFail(_) => Some(exit_code::RESOLVE_FAIL),
            Error::Oom(_) => Some(exit_code::OOM),
            Error::ListenFail(_) => Some(exit_code::LISTEN_FAIL),
            _ => None,
        }
    }
}

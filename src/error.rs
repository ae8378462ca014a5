use nix::errno::Errno;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures that can arise while registering a watch or driving the loop.
///
/// Deregistration and handler-driven removal never fail; teardown
/// notifications are infallible by contract.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The kernel refused a registration or poll operation.
    #[error("event mechanism error: {0}")]
    Os(#[from] Errno),

    /// The backend cannot poll this kind of file descriptor.
    #[error("file descriptor type not supported by this backend")]
    UnsupportedFd,

    /// Another signal-capturing backend already owns the process-wide
    /// capture pipe.
    #[error("a signal capture backend is already installed in this process")]
    CaptureBusy,
}

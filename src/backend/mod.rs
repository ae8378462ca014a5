mod interface;

pub use interface::{AsBackend, EventFlags, Interrupter, SigInfo, WatchTables};

#[cfg(all(not(feature = "select"), target_os = "linux"))]
mod epoll;

#[cfg(all(not(feature = "select"), target_os = "linux"))]
pub use epoll::EpollBackend as Backend;

#[cfg(any(feature = "select", not(target_os = "linux")))]
mod select;

#[cfg(any(feature = "select", not(target_os = "linux")))]
pub use select::SelectBackend as Backend;

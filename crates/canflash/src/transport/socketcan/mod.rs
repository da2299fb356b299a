//! SocketCAN frame transport (Linux only)

#[cfg(target_os = "linux")]
mod adapter;

#[cfg(target_os = "linux")]
pub use adapter::SocketCanTransport;

//! Command implementations for the canflash CLI

pub mod flash;
pub mod info;
pub mod monitor;
pub mod send;

pub use flash::{flash, Protocol};
pub use info::info;
pub use monitor::monitor;
pub use send::send;

use tokio_util::sync::CancellationToken;

/// Token cancelled on the first Ctrl-C
pub(crate) fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    token
}

//! Remote side: stream acceptor and per-session dispatcher

mod dispatcher;
mod listener;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use listener::{StreamListener, DEFAULT_HANDSHAKE_TIMEOUT};

mod backend;
mod builder;
mod state;
mod utils;
mod waiter;

pub use backend::{RsipstackBackend, SipBackend};
#[allow(unused_imports)]
pub use builder::{GbSipProxy, GbSipProxyBuilder, ProxyHandle, ProxyRuntime, ShutdownSignal};
pub use state::SipContext;

mod proxy;

pub use proxy::{
    GbSipProxy, GbSipProxyBuilder, ProxyHandle, ProxyRuntime, RsipstackBackend, ShutdownSignal,
    SipBackend, SipContext,
};

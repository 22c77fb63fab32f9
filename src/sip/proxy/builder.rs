use std::any::Any;
use std::sync::Arc;

use tokio::runtime::Builder as RuntimeBuilder;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::registry::DeviceRegistry;

use super::backend::{RsipstackBackend, SipBackend};
use super::state::SipContext;

pub struct GbSipProxyBuilder<B = RsipstackBackend> {
    config: crate::config::ProxyConfig,
    backend: B,
}

impl GbSipProxyBuilder<RsipstackBackend> {
    pub fn new(config: crate::config::ProxyConfig) -> Self {
        Self {
            config,
            backend: RsipstackBackend::default(),
        }
    }
}

impl<B> GbSipProxyBuilder<B>
where
    B: SipBackend,
{
    pub fn with_backend(mut self, backend: B) -> Self {
        self.backend = backend;
        self
    }

    pub async fn build(self) -> Result<ProxyRuntime<B>> {
        DeviceRegistry::validate(&self.config.devices)?;
        let context = SipContext {
            config: Arc::new(self.config),
            registry: Arc::new(DeviceRegistry::new()),
        };

        Ok(ProxyRuntime {
            backend: Arc::new(self.backend),
            context,
        })
    }
}

/// A built but not yet running proxy. `start` hands the event loop to a
/// dedicated worker thread with its own runtime, so the caller's runtime can
/// shut down independently of in-flight SIP transactions.
pub struct ProxyRuntime<B: SipBackend> {
    backend: Arc<B>,
    context: SipContext,
}

impl<B> ProxyRuntime<B>
where
    B: SipBackend,
{
    pub async fn start(self) -> Result<ProxyHandle> {
        self.backend.initialize(&self.context).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backend = self.backend.clone();
        let context = self.context.clone();

        let worker: std::thread::JoinHandle<Result<()>> = std::thread::spawn(move || {
            let runtime = RuntimeBuilder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(Error::Transport)?;

            let mut shutdown = ShutdownSignal::new(shutdown_rx);
            runtime.block_on(async {
                backend.run(context, &mut shutdown).await?;
                backend.shutdown().await
            })
        });

        Ok(ProxyHandle {
            shutdown_tx,
            worker,
        })
    }
}

pub struct ProxyHandle {
    shutdown_tx: watch::Sender<bool>,
    worker: std::thread::JoinHandle<Result<()>>,
}

impl ProxyHandle {
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn wait(self) -> Result<()> {
        let Self {
            shutdown_tx: _,
            worker,
        } = self;
        let handle = tokio::task::spawn_blocking(move || Self::join_worker(worker));
        match handle.await {
            Ok(result) => result,
            Err(join_error) => Err(Error::SipStack(format!("proxy task panicked: {join_error}"))),
        }
    }

    pub async fn shutdown(self) -> Result<()> {
        let Self {
            shutdown_tx,
            worker,
        } = self;
        let _ = shutdown_tx.send(true);
        let handle = tokio::task::spawn_blocking(move || Self::join_worker(worker));
        match handle.await {
            Ok(result) => result,
            Err(join_error) => Err(Error::SipStack(format!("proxy task panicked: {join_error}"))),
        }
    }

    fn join_worker(worker: std::thread::JoinHandle<Result<()>>) -> Result<()> {
        match worker.join() {
            Ok(result) => result,
            Err(panic) => Err(Error::SipStack(format!(
                "proxy worker panicked: {}",
                Self::panic_message(panic),
            ))),
        }
    }

    fn panic_message(panic: Box<dyn Any + Send + 'static>) -> String {
        match panic.downcast::<String>() {
            Ok(msg) => *msg,
            Err(panic) => match panic.downcast::<&'static str>() {
                Ok(msg) => (*msg).to_string(),
                Err(_) => "unknown panic payload".to_string(),
            },
        }
    }
}

pub struct ShutdownSignal {
    inner: watch::Receiver<bool>,
}

impl ShutdownSignal {
    fn new(inner: watch::Receiver<bool>) -> Self {
        Self { inner }
    }

    pub async fn recv(&mut self) {
        if *self.inner.borrow() {
            return;
        }

        while self.inner.changed().await.is_ok() {
            if *self.inner.borrow() {
                break;
            }
        }
    }
}

pub type GbSipProxy = ProxyRuntime<RsipstackBackend>;

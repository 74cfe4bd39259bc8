//! The packtap engine
//!
//! [`Packtap`] owns the pack registry, the plugin host, the lifecycle
//! orchestrator and the telemetry pipeline of one process. Packs are added,
//! then [`Packtap::load`] resolves their modules, freezes the registry and
//! opens the gateway. Interceptors created before `load` hold their
//! requests until it resolves.

use crate::config::PacktapConfig;
use crate::error::InitializationError;
use crate::gateway::{GatewayState, Interceptor, Readiness};
use crate::http::HttpClient;
use crate::lifecycle::Lifecycle;
use crate::log::{LogSink, WriterLogSink};
use crate::pipeline::{PipelineOptions, PipelineState, ShutdownReport};
use crate::registry::Pack;
use crate::signals::{self, ExitGuard};
use crate::transport::{EventTransport, HttpEventTransport};
use futures::future::join_all;
use packtap_api::{PackId, PackManifest};
use packtap_host::{ModuleSource, PluginHost, WasmPluginHost};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

/// A pack removed during `load`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedPack {
    pub pack: PackId,
    pub reason: String,
}

/// What `load` ended up with
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Whether telemetry goes to the collector
    pub network: bool,
    /// Whether per-request records go to the local log
    pub logging: bool,
    /// Active packs in registration order
    pub packs: Vec<PackId>,
    /// Packs whose module could not be resolved or installed
    pub dropped: Vec<DroppedPack>,
}

/// Builder for [`Packtap`]
pub struct PacktapBuilder {
    config: PacktapConfig,
    host: Option<Arc<dyn PluginHost>>,
    transport: Option<Arc<dyn EventTransport>>,
    log_sink: Option<Arc<dyn LogSink>>,
    module_client: Option<reqwest::Client>,
}

impl PacktapBuilder {
    fn new(config: PacktapConfig) -> Self {
        Self {
            config,
            host: None,
            transport: None,
            log_sink: None,
            module_client: None,
        }
    }

    /// Run packs on this host instead of a [`WasmPluginHost`]
    pub fn host(mut self, host: Arc<dyn PluginHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Send telemetry through this transport instead of the collector
    pub fn transport(mut self, transport: Arc<dyn EventTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Write request records here instead of stdout
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Client used to fetch `ModuleSource::Url` modules
    pub fn module_client(mut self, client: reqwest::Client) -> Self {
        self.module_client = Some(client);
        self
    }

    pub fn build(self) -> Result<Packtap, InitializationError> {
        let config = self.config;
        config.validate()?;

        let network = config.network_enabled();
        let logging = config.logging_enabled();

        let host: Arc<dyn PluginHost> = match self.host {
            Some(host) => host,
            None => Arc::new(WasmPluginHost::new(config.host.clone())?),
        };

        let transport = if network {
            match self.transport {
                Some(transport) => Some(transport),
                None => {
                    let secret = config.secret.clone().unwrap_or_default();
                    let transport = HttpEventTransport::new(config.endpoint_base(), secret)
                        .map_err(InitializationError::Transport)?;
                    Some(Arc::new(transport) as Arc<dyn EventTransport>)
                }
            }
        } else {
            None
        };

        let log_sink = if logging {
            Some(
                self.log_sink
                    .unwrap_or_else(|| Arc::new(WriterLogSink::stdout()) as Arc<dyn LogSink>),
            )
        } else {
            None
        };

        let module_client = match self.module_client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .build()
                .map_err(InitializationError::HttpClient)?,
        };

        let pipeline = PipelineState::new(PipelineOptions::from(&config), transport, log_sink);
        let lifecycle = Lifecycle::new(host.clone(), pipeline.clone())
            .with_invocation_timeout(config.invocation_timeout);
        let gateway = Arc::new(
            GatewayState::new(lifecycle).with_max_buffered_body(config.max_buffered_body),
        );

        tracing::debug!(network, logging, "packtap configured");

        Ok(Packtap {
            inner: Arc::new(Inner {
                config,
                host,
                pipeline,
                gateway,
                sources: Mutex::new(Vec::new()),
                module_client,
                loaded: AtomicBool::new(false),
                signal_task: Mutex::new(None),
            }),
        })
    }
}

struct Inner {
    config: PacktapConfig,
    host: Arc<dyn PluginHost>,
    pipeline: Arc<PipelineState>,
    gateway: Arc<GatewayState>,
    sources: Mutex<Vec<(PackId, ModuleSource)>>,
    module_client: reqwest::Client,
    loaded: AtomicBool,
    signal_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one packtap instance; clones share it
#[derive(Clone)]
pub struct Packtap {
    inner: Arc<Inner>,
}

impl Packtap {
    pub fn new(config: PacktapConfig) -> Result<Self, InitializationError> {
        Self::builder(config).build()
    }

    pub fn builder(config: PacktapConfig) -> PacktapBuilder {
        PacktapBuilder::new(config)
    }

    pub fn config(&self) -> &PacktapConfig {
        &self.inner.config
    }

    /// Register a pack and the module it runs
    ///
    /// Returns `Ok(false)` when a pack with the same identity was added
    /// first. Fails after `load`.
    pub fn add(
        &self,
        manifest: PackManifest,
        module: impl Into<ModuleSource>,
    ) -> Result<bool, InitializationError> {
        let pack = Pack::new(manifest)?;
        let id = pack.id().clone();
        if self.inner.loaded.load(Ordering::SeqCst) {
            return Err(InitializationError::RegistryFrozen(id));
        }

        let mut registry = self
            .inner
            .gateway
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !registry.insert(pack)? {
            return Ok(false);
        }

        self.inner
            .sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id.clone(), module.into()));
        tracing::debug!(pack = %id, "Pack added");
        Ok(true)
    }

    /// Resolve and install every added pack, then start intercepting
    ///
    /// A pack whose module fails to resolve or install is dropped for the
    /// session. Can only run once.
    pub async fn load(&self) -> Result<LoadReport, InitializationError> {
        if self.inner.loaded.swap(true, Ordering::SeqCst) {
            return Err(InitializationError::AlreadyInitialized);
        }

        let sources =
            std::mem::take(&mut *self.inner.sources.lock().unwrap_or_else(PoisonError::into_inner));

        let installs = join_all(sources.into_iter().map(|(id, source)| async move {
            let result = match source.resolve(&self.inner.module_client).await {
                Ok(module) => self
                    .inner
                    .host
                    .install(&id, module)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            (id, result)
        }))
        .await;

        let mut dropped = Vec::new();
        let packs = {
            let mut registry = self
                .inner
                .gateway
                .registry
                .write()
                .unwrap_or_else(PoisonError::into_inner);

            for (pack, result) in installs {
                if let Err(reason) = result {
                    tracing::warn!(pack = %pack, error = %reason, "Pack dropped");
                    registry.remove(&pack);
                    dropped.push(DroppedPack { pack, reason });
                }
            }
            registry.freeze();
            registry.iter().map(|p| p.id().clone()).collect::<Vec<_>>()
        };

        self.inner.pipeline.start();
        if self.inner.config.handle_signals {
            let task = signals::install(self.clone());
            *self
                .inner
                .signal_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(task);
        }
        self.inner.gateway.resolve(Readiness::Enabled);

        let report = LoadReport {
            network: self.inner.config.network_enabled(),
            logging: self.inner.config.logging_enabled(),
            packs,
            dropped,
        };
        tracing::info!(
            packs = report.packs.len(),
            dropped = report.dropped.len(),
            network = report.network,
            logging = report.logging,
            "packtap loaded"
        );
        Ok(report)
    }

    /// Whether a SIGINT/SIGTERM handler from `load` is waiting
    pub fn handles_signals(&self) -> bool {
        self.inner
            .signal_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Guard that flushes on normal exit; see [`ExitGuard`]
    pub fn exit_guard(&self) -> ExitGuard {
        ExitGuard::new(self.clone())
    }

    /// Turn interception off; waiting and future requests pass through
    ///
    /// Has no effect once `load` has enabled interception.
    pub fn disable(&self) -> bool {
        self.inner.gateway.resolve(Readiness::Disabled)
    }

    pub fn readiness(&self) -> Readiness {
        self.inner.gateway.readiness()
    }

    /// Active packs in registration order
    pub fn packs(&self) -> Vec<PackId> {
        self.inner
            .gateway
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|p| p.id().clone())
            .collect()
    }

    /// Wrap `client` so its calls run through the pack lifecycle
    pub fn interceptor<C: HttpClient + 'static>(&self, client: C) -> Interceptor<C> {
        Interceptor::new(client, self.inner.gateway.clone())
    }

    pub fn pipeline(&self) -> &Arc<PipelineState> {
        &self.inner.pipeline
    }

    /// Send everything queued now
    pub async fn flush(&self) -> usize {
        self.inner.pipeline.flush().await
    }

    /// Send everything queued, blocking the calling thread
    pub fn flush_blocking(&self) -> usize {
        self.inner.pipeline.flush_blocking()
    }

    /// Stop intercepting, wait for in-flight requests and flush
    pub async fn shutdown(&self) -> ShutdownReport {
        self.inner.pipeline.shutdown().await
    }

    /// [`Packtap::shutdown`] for contexts that cannot await
    pub fn shutdown_blocking(&self) -> ShutdownReport {
        self.inner.pipeline.shutdown_blocking()
    }
}

impl fmt::Debug for Packtap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packtap")
            .field("readiness", &self.readiness())
            .field("packs", &self.packs())
            .finish_non_exhaustive()
    }
}

//! Plugin host: the single invocation interface for packs
//!
//! [`PluginHost`] is what the lifecycle orchestrator talks to.
//! [`WasmPluginHost`] is the wasmtime-backed implementation: one lazily
//! created [`PackInstance`] per pack identity, invoked on the blocking pool
//! with calls to the same identity strictly serialized.

use crate::loader::{HostConfig, LoaderError, PackInstance, PluginLoader};
use async_trait::async_trait;
use packtap_api::{PackId, Phase, PluginOutput, SandboxPayload};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Errors surfaced by a plugin host
///
/// Guest misbehaviour (traps, fuel exhaustion, malformed output) is not an
/// error: it is logged and reported as "no output".
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Pack not found: {0}")]
    PluginNotFound(PackId),

    #[error("Pack module failed to load: {0}")]
    Load(#[from] LoaderError),

    #[error("Pack invocation task failed: {0}")]
    Task(String),
}

/// Invokes pack phases
#[async_trait]
pub trait PluginHost: Send + Sync {
    /// Run `phase` of `pack` against `payload`
    ///
    /// Returns `Ok(None)` when the pack produced no usable output.
    async fn invoke(
        &self,
        pack: &PackId,
        phase: Phase,
        payload: &SandboxPayload,
    ) -> Result<Option<PluginOutput>, HostError>;

    /// Make `module` available under `pack` before the first invocation
    ///
    /// Hosts that resolve packs some other way can ignore the module.
    async fn install(&self, _pack: &PackId, _module: Vec<u8>) -> Result<(), HostError> {
        Ok(())
    }
}

#[async_trait]
impl<H: PluginHost + ?Sized> PluginHost for Arc<H> {
    async fn invoke(
        &self,
        pack: &PackId,
        phase: Phase,
        payload: &SandboxPayload,
    ) -> Result<Option<PluginOutput>, HostError> {
        (**self).invoke(pack, phase, payload).await
    }

    async fn install(&self, pack: &PackId, module: Vec<u8>) -> Result<(), HostError> {
        (**self).install(pack, module).await
    }
}

// ============================================================================
// Wasm backend
// ============================================================================

struct ModuleSlot {
    bytes: Arc<[u8]>,
    instance: Arc<Mutex<Option<PackInstance>>>,
}

enum Invocation {
    /// The module does not export the phase function
    Missing,
    Output(Vec<u8>),
    Failed(LoaderError),
}

/// Wasmtime-backed plugin host
pub struct WasmPluginHost {
    loader: Arc<PluginLoader>,
    modules: RwLock<HashMap<PackId, Arc<ModuleSlot>>>,
}

impl WasmPluginHost {
    /// Create a host with the given limits
    pub fn new(config: HostConfig) -> Result<Self, LoaderError> {
        Ok(Self::with_loader(PluginLoader::new(config)?))
    }

    /// Create with an existing loader
    pub fn with_loader(loader: PluginLoader) -> Self {
        Self {
            loader: Arc::new(loader),
            modules: RwLock::new(HashMap::new()),
        }
    }

    /// Register module bytes for a pack identity
    ///
    /// Re-registering an identity replaces its module and drops any cached
    /// instance.
    pub async fn register(&self, pack: PackId, bytes: impl Into<Arc<[u8]>>) {
        let slot = Arc::new(ModuleSlot {
            bytes: bytes.into(),
            instance: Arc::new(Mutex::new(None)),
        });

        let mut modules = self.modules.write().await;
        if modules.insert(pack.clone(), slot).is_some() {
            tracing::debug!(pack = %pack, "Pack module replaced");
        } else {
            tracing::debug!(pack = %pack, "Pack module registered");
        }
    }

    /// Remove a pack's module
    pub async fn unregister(&self, pack: &PackId) -> bool {
        self.modules.write().await.remove(pack).is_some()
    }

    /// Check if a module is registered for `pack`
    pub async fn contains(&self, pack: &PackId) -> bool {
        self.modules.read().await.contains_key(pack)
    }

    /// Number of registered modules
    pub async fn len(&self) -> usize {
        self.modules.read().await.len()
    }

    /// Check if no modules are registered
    pub async fn is_empty(&self) -> bool {
        self.modules.read().await.is_empty()
    }

    /// Instantiate a pack ahead of its first request
    ///
    /// Surfaces compilation and link errors at warm-up instead of on the
    /// request path.
    pub async fn warm(&self, pack: &PackId) -> Result<(), HostError> {
        let slot = self.slot(pack).await?;
        let mut guard = slot.instance.clone().lock_owned().await;
        let loader = self.loader.clone();
        let bytes = slot.bytes.clone();

        tokio::task::spawn_blocking(move || instance_in(&mut guard, &loader, &bytes).map(|_| ()))
            .await
            .map_err(|e| HostError::Task(e.to_string()))??;

        tracing::debug!(pack = %pack, "Pack instance warmed");
        Ok(())
    }

    async fn slot(&self, pack: &PackId) -> Result<Arc<ModuleSlot>, HostError> {
        self.modules
            .read()
            .await
            .get(pack)
            .cloned()
            .ok_or_else(|| HostError::PluginNotFound(pack.clone()))
    }
}

/// Return the cached instance, instantiating it on first use
fn instance_in<'a>(
    guard: &'a mut OwnedMutexGuard<Option<PackInstance>>,
    loader: &PluginLoader,
    bytes: &[u8],
) -> Result<&'a mut PackInstance, LoaderError> {
    let instance = match guard.take() {
        Some(instance) => instance,
        None => loader.instantiate(bytes)?,
    };
    Ok(guard.insert(instance))
}

fn run_phase(
    mut guard: OwnedMutexGuard<Option<PackInstance>>,
    loader: &PluginLoader,
    bytes: &[u8],
    export: &str,
    input: &[u8],
) -> Result<Invocation, LoaderError> {
    let instance = instance_in(&mut guard, loader, bytes)?;

    if !instance.has_export(export) {
        return Ok(Invocation::Missing);
    }

    match instance.call(export, input) {
        Ok(output) => Ok(Invocation::Output(output)),
        Err(e) => {
            // A trapped instance may hold a half-updated heap; start over
            if e.is_trap() {
                *guard = None;
            }
            Ok(Invocation::Failed(e))
        }
    }
}

#[async_trait]
impl PluginHost for WasmPluginHost {
    async fn invoke(
        &self,
        pack: &PackId,
        phase: Phase,
        payload: &SandboxPayload,
    ) -> Result<Option<PluginOutput>, HostError> {
        let slot = self.slot(pack).await?;

        let input = match serde_json::to_vec(payload) {
            Ok(input) => input,
            Err(e) => {
                tracing::warn!(pack = %pack, phase = %phase, error = %e, "Failed to encode sandbox payload");
                return Ok(None);
            }
        };

        let guard = slot.instance.clone().lock_owned().await;
        let loader = self.loader.clone();
        let bytes = slot.bytes.clone();
        let export = phase.export_name();

        let invocation = tokio::task::spawn_blocking(move || {
            run_phase(guard, &loader, &bytes, export, &input)
        })
        .await
        .map_err(|e| HostError::Task(e.to_string()))??;

        let output = match invocation {
            Invocation::Missing => {
                tracing::debug!(pack = %pack, phase = %phase, "Pack does not export phase");
                return Ok(None);
            }
            Invocation::Failed(e) => {
                tracing::warn!(pack = %pack, phase = %phase, error = %e, "Pack invocation failed");
                return Ok(None);
            }
            Invocation::Output(output) => output,
        };

        if output.is_empty() {
            return Ok(None);
        }

        match serde_json::from_slice::<PluginOutput>(&output) {
            Ok(output) => Ok(Some(output)),
            Err(e) => {
                tracing::warn!(pack = %pack, phase = %phase, error = %e, "Pack returned malformed output");
                Ok(None)
            }
        }
    }

    async fn install(&self, pack: &PackId, module: Vec<u8>) -> Result<(), HostError> {
        self.register(pack.clone(), module).await;
        if let Err(e) = self.warm(pack).await {
            self.unregister(pack).await;
            return Err(e);
        }
        tracing::info!(pack = %pack, "Pack installed");
        Ok(())
    }
}

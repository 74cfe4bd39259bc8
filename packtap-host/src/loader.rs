//! Pack loader using wasmtime
//!
//! Compiles pack modules and provides sandboxed, fuel-limited execution of
//! their phase exports.

use packtap_api::{ALLOC_EXPORT, DEALLOC_EXPORT, MEMORY_EXPORT};
use thiserror::Error;
use wasmtime::*;

/// Errors that can occur during pack loading or execution
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Engine creation failed: {0}")]
    EngineCreation(#[source] anyhow::Error),

    #[error("Module compilation failed: {0}")]
    ModuleCompilation(#[source] anyhow::Error),

    #[error("Instantiation failed: {0}")]
    Instantiation(#[source] anyhow::Error),

    #[error("Export not found: {0}")]
    ExportNotFound(String),

    #[error("Function call failed: {function} - {source}")]
    FunctionCall {
        function: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Store configuration failed: {0}")]
    StoreConfig(String),

    #[error("Memory access error: {0}")]
    MemoryAccess(String),

    #[error("Fuel exhausted (CPU limit exceeded)")]
    FuelExhausted,
}

impl LoaderError {
    /// Whether the guest trapped, leaving its instance in an unknown state
    pub fn is_trap(&self) -> bool {
        matches!(
            self,
            LoaderError::FuelExhausted | LoaderError::FunctionCall { .. }
        )
    }
}

/// Limits applied to every pack instance
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Fuel granted to each phase invocation (CPU limit)
    pub fuel_limit: u64,

    /// Maximum wasm stack size in bytes
    pub max_stack_size: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            fuel_limit: 10_000_000,
            max_stack_size: 1024 * 1024, // 1MB
        }
    }
}

/// Pack loader with a shared wasmtime engine
pub struct PluginLoader {
    engine: Engine,
    config: HostConfig,
}

/// An instantiated pack module
///
/// Owns its store, so guest memory persists across calls. Not safe for
/// concurrent use; callers serialize access.
pub struct PackInstance {
    store: Store<()>,
    instance: Instance,
    memory: Memory,
    alloc_fn: TypedFunc<i32, i32>,
    dealloc_fn: Option<TypedFunc<(i32, i32), ()>>,
    fuel_limit: u64,
}

/// Unpack ptr and len from a packed i64
#[inline]
fn unpack_ptr_len(packed: i64) -> (i32, i32) {
    let ptr = (packed >> 32) as i32;
    let len = (packed & 0xFFFFFFFF) as i32;
    (ptr, len)
}

fn call_error(function: &str, e: anyhow::Error) -> LoaderError {
    if e.downcast_ref::<Trap>()
        .is_some_and(|t| *t == Trap::OutOfFuel)
    {
        LoaderError::FuelExhausted
    } else {
        LoaderError::FunctionCall {
            function: function.to_string(),
            source: e,
        }
    }
}

impl PluginLoader {
    /// Create a new pack loader
    pub fn new(config: HostConfig) -> Result<Self, LoaderError> {
        let mut engine_config = Config::new();
        engine_config.consume_fuel(true);
        engine_config.max_wasm_stack(config.max_stack_size);
        engine_config.wasm_memory64(false);

        let engine = Engine::new(&engine_config).map_err(LoaderError::EngineCreation)?;

        Ok(Self { engine, config })
    }

    /// Compile and instantiate a pack module
    ///
    /// No host imports are linked: a pack that imports anything fails here.
    pub fn instantiate(&self, wasm_bytes: &[u8]) -> Result<PackInstance, LoaderError> {
        let module =
            Module::new(&self.engine, wasm_bytes).map_err(LoaderError::ModuleCompilation)?;

        let mut store = Store::new(&self.engine, ());
        store
            .set_fuel(self.config.fuel_limit)
            .map_err(|e| LoaderError::StoreConfig(format!("Failed to set fuel: {}", e)))?;

        let linker = Linker::new(&self.engine);
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(LoaderError::Instantiation)?;

        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or_else(|| LoaderError::ExportNotFound(MEMORY_EXPORT.to_string()))?;

        let alloc_fn = instance
            .get_typed_func::<i32, i32>(&mut store, ALLOC_EXPORT)
            .map_err(|_| LoaderError::ExportNotFound(ALLOC_EXPORT.to_string()))?;

        // Bump-allocating packs may not free at all
        let dealloc_fn = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, DEALLOC_EXPORT)
            .ok();

        Ok(PackInstance {
            store,
            instance,
            memory,
            alloc_fn,
            dealloc_fn,
            fuel_limit: self.config.fuel_limit,
        })
    }
}

impl PackInstance {
    /// Whether the module exports `function`
    pub fn has_export(&mut self, function: &str) -> bool {
        self.instance.get_func(&mut self.store, function).is_some()
    }

    /// Call a phase export with a JSON input, returning the raw output bytes
    ///
    /// An empty result means the pack produced no output.
    pub fn call(&mut self, function: &str, input: &[u8]) -> Result<Vec<u8>, LoaderError> {
        let entry = self
            .instance
            .get_typed_func::<(i32, i32), i64>(&mut self.store, function)
            .map_err(|_| LoaderError::ExportNotFound(function.to_string()))?;

        // Reset fuel for this invocation
        self.store
            .set_fuel(self.fuel_limit)
            .map_err(|e| LoaderError::StoreConfig(format!("Failed to set fuel: {}", e)))?;

        let input_len: i32 = input.len().try_into().map_err(|_| {
            LoaderError::MemoryAccess(format!(
                "Input too large: {} bytes exceeds i32::MAX",
                input.len()
            ))
        })?;

        let input_ptr = self
            .alloc_fn
            .call(&mut self.store, input_len)
            .map_err(|e| call_error(ALLOC_EXPORT, e))?;

        self.memory
            .write(&mut self.store, input_ptr as usize, input)
            .map_err(|e| LoaderError::MemoryAccess(format!("Failed to write input: {}", e)))?;

        let packed = entry
            .call(&mut self.store, (input_ptr, input_len))
            .map_err(|e| call_error(function, e))?;

        let (output_ptr, output_len) = unpack_ptr_len(packed);

        if output_ptr < 0 || output_len < 0 {
            return Err(LoaderError::MemoryAccess(format!(
                "Invalid output pointer/length: ptr={}, len={}",
                output_ptr, output_len
            )));
        }

        let output = self.read_memory(output_ptr as usize, output_len as usize)?;

        if let Some(dealloc) = &self.dealloc_fn {
            if let Err(e) = dealloc.call(&mut self.store, (input_ptr, input_len)) {
                tracing::warn!(error = %e, "Failed to deallocate input memory");
            }
            if output_len > 0 {
                if let Err(e) = dealloc.call(&mut self.store, (output_ptr, output_len)) {
                    tracing::warn!(error = %e, "Failed to deallocate output memory");
                }
            }
        }

        Ok(output)
    }

    fn read_memory(&self, ptr: usize, len: usize) -> Result<Vec<u8>, LoaderError> {
        let data = self.memory.data(&self.store);
        let end = ptr.checked_add(len).ok_or_else(|| {
            LoaderError::MemoryAccess(format!("Integer overflow: ptr={}, len={}", ptr, len))
        })?;
        if end > data.len() {
            return Err(LoaderError::MemoryAccess(format!(
                "Out of bounds: ptr={}, len={}, memory_size={}",
                ptr,
                len,
                data.len()
            )));
        }
        Ok(data[ptr..end].to_vec())
    }
}

//! packtap-host: Wasm pack host runtime for packtap
//!
//! This crate loads pack modules and runs their lifecycle exports in a
//! fuel-limited wasmtime sandbox.

pub mod environment;
pub mod host;
pub mod loader;
pub mod source;

pub use environment::{validate_env_pattern, EnvAllowList, EnvPatternError};
pub use host::{HostError, PluginHost, WasmPluginHost};
pub use loader::{HostConfig, LoaderError, PackInstance, PluginLoader};
pub use source::{ModuleSource, SourceError};
pub use packtap_api::{PackId, Phase, PluginOutput, SandboxPayload};

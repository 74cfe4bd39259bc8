//! # packtap: sandboxed telemetry packs for outbound HTTP
//!
//! packtap wraps the HTTP client an application already uses. Every call
//! that matches a pack's domain patterns runs through the pack lifecycle:
//!
//! - `pre` before the call, in registration order
//! - `chunk` for each body chunk of a streamed response (opt-in)
//! - `post` after the response, in reverse order
//!
//! Packs are WebAssembly modules. Each one only sees the parts of the
//! exchange its permissions allow, and whatever it captures becomes
//! sequence-numbered telemetry, flushed to a collector and/or written to a
//! local NDJSON log.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use packtap::{HttpClient, ModuleSource, Packtap, PacktapConfig, ReqwestClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let packtap = Packtap::new(PacktapConfig::with_secret(std::env::var("TSKL_API_KEY")?))?;
//!     packtap.add(manifest, ModuleSource::File("packs/openai.wasm".into()))?;
//!     // Also installs the SIGINT/SIGTERM handler
//!     packtap.load().await?;
//!     let _exit = packtap.exit_guard();
//!
//!     let client = packtap.interceptor(ReqwestClient::default());
//!     let response = client.execute(request).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod http;
pub mod lifecycle;
pub mod log;
pub mod pipeline;
pub mod registry;
pub mod sandbox;
pub mod signals;
pub mod transport;

#[cfg(feature = "subscriber")]
pub mod tracing_support;

pub use config::PacktapConfig;
pub use engine::{DroppedPack, LoadReport, Packtap, PacktapBuilder};
pub use error::{InitializationError, LogError, TransportError};
pub use gateway::{Interceptor, Readiness};
pub use http::{
    BodyStream, HttpClient, InboundResponse, OutboundRequest, ReqwestClient, ResponseBody,
    StreamMode,
};
pub use lifecycle::{Lifecycle, PhaseFailure, PhaseReport, RequestContext};
pub use log::{Dimension, FileLogSink, LogRecord, LogSink, MemoryLogSink, WriterLogSink};
pub use pipeline::{CaptureEvent, PipelineState, ShutdownReport};
pub use registry::{Pack, PackRegistry};
pub use signals::ExitGuard;
pub use transport::{EventTransport, HttpEventTransport, NetworkEntry, NetworkPayload};

#[cfg(feature = "subscriber")]
pub use tracing_support::{init_subscriber, init_subscriber_with_config, TracingConfig, TracingFormat};

pub use packtap_api::{
    CaptureValue, FieldAccess, PackContext, PackId, PackManifest, Permissions, Phase, PluginOutput,
    SandboxPayload,
};
pub use packtap_host::{HostConfig, ModuleSource, PluginHost, WasmPluginHost};

//! packtap-api: Shared types for the packtap pack protocol
//!
//! This crate defines the protocol between the host (the packtap engine) and
//! guests (wasm packs). Every value crossing the boundary is JSON.
//!
//! # Flow
//!
//! ```text
//!  host                                   guest (wasm pack)
//!  ────                                   ─────────────────
//!  SandboxPayload ──► serde_json ──► pack_alloc + write ──► pre/post/chunk(ptr, len)
//!  PluginOutput   ◄── serde_json ◄── read (ptr << 32 | len) ◄──┘
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Export name of the guest linear memory
pub const MEMORY_EXPORT: &str = "memory";

/// Export name of the guest allocator, `(len: i32) -> ptr: i32`
pub const ALLOC_EXPORT: &str = "pack_alloc";

/// Export name of the guest deallocator, `(ptr: i32, len: i32)`
pub const DEALLOC_EXPORT: &str = "pack_dealloc";

/// Header marking a request as one packtap must not intercept
///
/// Every call the engine makes on its own behalf (module fetches, telemetry
/// batches, the forwarded request itself) carries it.
pub const BYPASS_HEADER: &str = "x-tskl-bypass";

/// Value of [`BYPASS_HEADER`] that enables the bypass
pub const BYPASS_VALUE: &str = "1";

/// Context state a pack carries between phases of one request
pub type PackContext = Map<String, Value>;

// ============================================================================
// Lifecycle
// ============================================================================

/// A point in a request's life where packs run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Before the outbound request is sent
    Pre,
    /// After the response headers (and body, when buffered) are available
    Post,
    /// Once per chunk of a streamed response body
    Chunk,
}

impl Phase {
    /// Name of the wasm export invoked for this phase
    pub fn export_name(self) -> &'static str {
        match self {
            Phase::Pre => "pre",
            Phase::Post => "post",
            Phase::Chunk => "chunk",
        }
    }

    /// Whether a pack without an explicit `methods` list runs this phase
    pub fn is_default(self) -> bool {
        matches!(self, Phase::Pre | Phase::Post)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.export_name())
    }
}

// ============================================================================
// Pack description
// ============================================================================

/// Identity of a pack, rendered as `name@version`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackId {
    name: String,
    version: String,
}

impl PackId {
    /// Create a pack identity
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Pack name (may itself contain `@`, e.g. `@acme/apm`)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pack version
    pub fn version(&self) -> &str {
        &self.version
    }
}

impl fmt::Display for PackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Pack manifest as shipped next to the wasm module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackManifest {
    /// Pack name
    pub name: String,

    /// Pack version (semver)
    pub version: String,

    /// Short description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Declared lifecycle methods; `None` means `pre` and `post`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<Phase>>,

    /// What the pack may read and emit
    #[serde(default)]
    pub permissions: Permissions,
}

impl PackManifest {
    /// Create a manifest with default methods and no permissions
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            methods: None,
            permissions: Permissions::default(),
        }
    }

    /// Set the declared methods explicitly
    pub fn methods(mut self, methods: impl IntoIterator<Item = Phase>) -> Self {
        self.methods = Some(methods.into_iter().collect());
        self
    }

    /// Set the permissions
    pub fn permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }

    /// Identity of this pack
    pub fn id(&self) -> PackId {
        PackId::new(&self.name, &self.version)
    }

    /// Whether this pack runs the given phase
    pub fn declares(&self, phase: Phase) -> bool {
        match &self.methods {
            Some(methods) => methods.contains(&phase),
            None => phase.is_default(),
        }
    }
}

// ============================================================================
// Permissions
// ============================================================================

/// Read access to one side of the exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldAccess {
    /// Headers are visible
    pub headers: bool,
    /// Body is visible
    pub body: bool,
}

/// What a pack is allowed to see and emit
///
/// Everything defaults to denied. A pack with no `domains` never matches a
/// request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Permissions {
    /// Regular expressions matched against the full request URL
    pub domains: Vec<String>,

    /// Environment keys copied into the sandbox (`KEY` or `PREFIX_*`)
    pub environment: Vec<String>,

    /// Shorthand granting body access on both request and response
    pub body: bool,

    /// Request-side access
    pub request: FieldAccess,

    /// Response-side access
    pub response: FieldAccess,

    /// Dimensions the pack may emit; `None` allows any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captures: Option<Vec<String>>,
}

impl Permissions {
    /// Add domain patterns
    pub fn with_domains(mut self, domains: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.domains.extend(domains.into_iter().map(Into::into));
        self
    }

    /// Add environment keys
    pub fn with_environment(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.environment.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Grant body access on both sides
    pub fn with_body(mut self) -> Self {
        self.body = true;
        self
    }

    /// Grant header access on both sides
    pub fn with_headers(mut self) -> Self {
        self.request.headers = true;
        self.response.headers = true;
        self
    }

    /// Restrict emitted dimensions
    pub fn with_captures(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.captures = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn request_headers(&self) -> bool {
        self.request.headers
    }

    pub fn request_body(&self) -> bool {
        self.body || self.request.body
    }

    pub fn response_headers(&self) -> bool {
        self.response.headers
    }

    pub fn response_body(&self) -> bool {
        self.body || self.response.body
    }

    /// Whether the pack may emit `dimension`
    pub fn may_capture(&self, dimension: &str) -> bool {
        match &self.captures {
            Some(names) => names.iter().any(|n| n == dimension),
            None => true,
        }
    }
}

// ============================================================================
// Sandbox payload (host -> guest)
// ============================================================================

/// Permission-filtered snapshot handed to a pack
///
/// Optional fields are omitted from the JSON, never sent as empty values,
/// so a pack can tell "not permitted" from "empty".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxPayload {
    /// Request identifier shared by every phase of one call
    pub request_id: String,

    /// State this pack returned in an earlier phase of the same request
    #[serde(default)]
    pub context: PackContext,

    /// Request snapshot
    pub request: RequestSnapshot,

    /// Response snapshot (post phase only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseSnapshot>,

    /// Base64 body chunk (chunk phase only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,

    /// Allow-listed environment values
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Request side of a [`SandboxPayload`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub url: String,
    pub method: String,
    pub domain: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<(String, String)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Response side of a [`SandboxPayload`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<(String, String)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

// ============================================================================
// Plugin output (guest -> host)
// ============================================================================

/// What a pack returns from a phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginOutput {
    /// Dimension values captured by this invocation, in emission order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture: Option<IndexMap<String, CaptureValue>>,

    /// Private state round-tripped to the next phase of this request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<PackContext>,
}

impl PluginOutput {
    /// Output carrying only captures
    pub fn capture(entries: impl IntoIterator<Item = (impl Into<String>, CaptureValue)>) -> Self {
        Self {
            capture: Some(entries.into_iter().map(|(k, v)| (k.into(), v)).collect()),
            context: None,
        }
    }

    /// Attach context
    pub fn with_context(mut self, context: PackContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Number of captured dimensions
    pub fn capture_count(&self) -> usize {
        self.capture.as_ref().map_or(0, IndexMap::len)
    }
}

/// A scalar dimension value
///
/// Objects, arrays and `null` are rejected during deserialization, which
/// makes the whole output malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CaptureValue {
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl fmt::Display for CaptureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureValue::Bool(b) => write!(f, "{}", b),
            CaptureValue::Number(n) => write!(f, "{}", n),
            CaptureValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for CaptureValue {
    fn from(value: &str) -> Self {
        CaptureValue::Text(value.to_string())
    }
}

impl From<String> for CaptureValue {
    fn from(value: String) -> Self {
        CaptureValue::Text(value)
    }
}

impl From<u64> for CaptureValue {
    fn from(value: u64) -> Self {
        CaptureValue::Number(value.into())
    }
}

impl From<i64> for CaptureValue {
    fn from(value: i64) -> Self {
        CaptureValue::Number(value.into())
    }
}

impl From<bool> for CaptureValue {
    fn from(value: bool) -> Self {
        CaptureValue::Bool(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_manifest_defaults() {
        let manifest: PackManifest =
            serde_json::from_value(json!({"name": "apm", "version": "1.0.0"})).unwrap();

        assert!(manifest.declares(Phase::Pre));
        assert!(manifest.declares(Phase::Post));
        assert!(!manifest.declares(Phase::Chunk));
        assert!(manifest.permissions.domains.is_empty());
        assert_eq!(manifest.id().to_string(), "apm@1.0.0");
    }

    #[test]
    fn test_manifest_explicit_methods() {
        let manifest: PackManifest = serde_json::from_value(json!({
            "name": "sse",
            "version": "0.1.0",
            "methods": ["chunk"],
            "permissions": {"domains": [".+"], "environment": ["HOME"], "body": true}
        }))
        .unwrap();

        assert!(!manifest.declares(Phase::Pre));
        assert!(manifest.declares(Phase::Chunk));
        assert!(manifest.permissions.request_body());
        assert!(manifest.permissions.response_body());
        assert!(!manifest.permissions.response_headers());
    }

    #[test]
    fn test_payload_omits_unpermitted_fields() {
        let payload = SandboxPayload {
            request_id: "abc".into(),
            context: PackContext::new(),
            request: RequestSnapshot {
                url: "https://example.com/x".into(),
                method: "GET".into(),
                domain: "example.com".into(),
                path: "/x".into(),
                headers: None,
                body: None,
            },
            response: None,
            chunk: None,
            environment: BTreeMap::new(),
        };

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["requestId"], "abc");
        assert!(value["request"].get("headers").is_none());
        assert!(value["request"].get("body").is_none());
        assert!(value.get("response").is_none());
        assert!(value.get("chunk").is_none());
    }

    #[test]
    fn test_output_rejects_non_scalar_capture() {
        let result: Result<PluginOutput, _> =
            serde_json::from_value(json!({"capture": {"nested": {"a": 1}}}));
        assert!(result.is_err());
    }

    #[test]
    fn test_output_preserves_capture_order() {
        let output: PluginOutput = serde_json::from_str(
            r#"{"capture": {"zeta": 1, "alpha": "x", "ok": true}, "context": {"n": 2}}"#,
        )
        .unwrap();

        let keys: Vec<_> = output.capture.as_ref().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["zeta", "alpha", "ok"]);
        assert_eq!(output.capture_count(), 3);
        assert_eq!(output.context.unwrap()["n"], 2);
    }

    #[test]
    fn test_capture_value_display() {
        assert_eq!(CaptureValue::from(200u64).to_string(), "200");
        assert_eq!(CaptureValue::from("ok").to_string(), "ok");
        assert_eq!(CaptureValue::from(false).to_string(), "false");
    }

    #[test]
    fn test_capture_allow_list() {
        let open = Permissions::default();
        assert!(open.may_capture("anything"));

        let restricted = Permissions::default().with_captures(["latency"]);
        assert!(restricted.may_capture("latency"));
        assert!(!restricted.may_capture("tokens"));
    }
}

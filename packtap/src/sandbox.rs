//! Sandbox projector
//!
//! Builds the permission-filtered [`SandboxPayload`] a pack receives. The
//! projection only borrows the live exchange and copies what the pack may
//! see; nothing in the payload refers back to the request or response.

use crate::http::OutboundRequest;
use crate::registry::Pack;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use packtap_api::{PackContext, RequestSnapshot, ResponseSnapshot, SandboxPayload};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::Value;

/// Borrowed view of a response for projection
#[derive(Debug, Clone, Copy)]
pub struct ResponseView<'a> {
    pub status: StatusCode,
    pub headers: &'a HeaderMap,
    /// Buffered body, when it was read
    pub body: Option<&'a [u8]>,
}

/// What one projection may draw from
#[derive(Debug, Clone, Copy)]
pub struct ProjectionInput<'a> {
    pub request: &'a OutboundRequest,
    pub response: Option<ResponseView<'a>>,
    pub chunk: Option<&'a [u8]>,
    pub context: &'a PackContext,
}

impl<'a> ProjectionInput<'a> {
    pub fn new(request: &'a OutboundRequest, context: &'a PackContext) -> Self {
        Self {
            request,
            response: None,
            chunk: None,
            context,
        }
    }

    pub fn with_response(mut self, response: ResponseView<'a>) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_chunk(mut self, chunk: &'a [u8]) -> Self {
        self.chunk = Some(chunk);
        self
    }
}

/// Decode a body as JSON, falling back to its (lossy) text
pub fn decode_body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Build the payload `pack` is allowed to see
pub fn project(request_id: &str, pack: &Pack, input: ProjectionInput<'_>) -> SandboxPayload {
    let permissions = pack.permissions();
    let url = &input.request.url;

    let request = RequestSnapshot {
        url: url.to_string(),
        method: input.request.method.to_string(),
        domain: url.host_str().unwrap_or_default().to_string(),
        path: url.path().to_string(),
        headers: permissions
            .request_headers()
            .then(|| header_pairs(&input.request.headers)),
        body: permissions
            .request_body()
            .then(|| decode_body(input.request.body.as_deref().unwrap_or_default())),
    };

    let response = input.response.map(|response| ResponseSnapshot {
        status: response.status.as_u16(),
        headers: permissions
            .response_headers()
            .then(|| header_pairs(response.headers)),
        body: permissions
            .response_body()
            .then(|| response.body.map(decode_body))
            .flatten(),
    });

    SandboxPayload {
        request_id: request_id.to_string(),
        context: input.context.clone(),
        request,
        response,
        chunk: input.chunk.map(|chunk| STANDARD.encode(chunk)),
        environment: pack.environment().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packtap_api::{PackManifest, Permissions};
    use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
    use reqwest::Url;

    fn request() -> OutboundRequest {
        OutboundRequest::post(
            Url::parse("https://api.example.com/v1/chat?stream=false").unwrap(),
            r#"{"model":"gpt-4o"}"#,
        )
        .with_header(AUTHORIZATION, HeaderValue::from_static("Bearer secret"))
    }

    fn pack(permissions: Permissions) -> Pack {
        Pack::new(PackManifest::new("apm", "1.0.0").permissions(permissions.with_domains([".+"])))
            .unwrap()
    }

    #[test]
    fn test_no_permissions_omits_everything() {
        let request = request();
        let context = PackContext::new();
        let headers = HeaderMap::new();
        let input = ProjectionInput::new(&request, &context).with_response(ResponseView {
            status: StatusCode::OK,
            headers: &headers,
            body: Some(b"{\"ok\":true}".as_slice()),
        });

        let payload = project("r1", &pack(Permissions::default()), input);
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["request"]["url"], "https://api.example.com/v1/chat?stream=false");
        assert_eq!(json["request"]["domain"], "api.example.com");
        assert_eq!(json["request"]["path"], "/v1/chat");
        assert_eq!(json["request"]["method"], "POST");
        assert!(json["request"].get("headers").is_none());
        assert!(json["request"].get("body").is_none());
        assert_eq!(json["response"]["status"], 200);
        assert!(json["response"].get("body").is_none());
        assert!(json.get("chunk").is_none());
        assert_eq!(json["environment"], serde_json::json!({}));
    }

    #[test]
    fn test_body_permission_decodes_json_or_text() {
        let request = request();
        let context = PackContext::new();
        let headers = HeaderMap::new();
        let input = ProjectionInput::new(&request, &context).with_response(ResponseView {
            status: StatusCode::BAD_GATEWAY,
            headers: &headers,
            body: Some(b"upstream down".as_slice()),
        });

        let payload = project("r1", &pack(Permissions::default().with_body()), input);

        assert_eq!(
            payload.request.body,
            Some(serde_json::json!({"model": "gpt-4o"}))
        );
        let response = payload.response.unwrap();
        assert_eq!(response.body, Some(Value::String("upstream down".into())));
        assert!(response.headers.is_none());
    }

    #[test]
    fn test_header_permission_is_per_side() {
        let request = request();
        let context = PackContext::new();
        let mut response_headers = HeaderMap::new();
        response_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut permissions = Permissions::default();
        permissions.request.headers = true;

        let input = ProjectionInput::new(&request, &context).with_response(ResponseView {
            status: StatusCode::OK,
            headers: &response_headers,
            body: None,
        });
        let payload = project("r1", &pack(permissions), input);

        let request_headers = payload.request.headers.unwrap();
        assert!(request_headers
            .iter()
            .any(|(k, v)| k == "authorization" && v == "Bearer secret"));
        assert!(payload.response.unwrap().headers.is_none());
    }

    #[test]
    fn test_chunk_is_base64_and_independent_of_body() {
        let request = request();
        let context = PackContext::new();
        let input = ProjectionInput::new(&request, &context).with_chunk(b"data: {}\n\n");

        let payload = project("r1", &pack(Permissions::default()), input);
        assert_eq!(payload.chunk.as_deref(), Some("ZGF0YToge30KCg=="));
        assert!(payload.request.body.is_none());
    }

    #[test]
    fn test_context_is_copied() {
        let request = request();
        let mut context = PackContext::new();
        context.insert("startedAt".into(), serde_json::json!(17));

        let payload = project(
            "r1",
            &pack(Permissions::default()),
            ProjectionInput::new(&request, &context),
        );
        context.clear();
        assert_eq!(payload.context["startedAt"], 17);
    }

    #[test]
    fn test_decode_body() {
        assert_eq!(decode_body(b"[1,2]"), serde_json::json!([1, 2]));
        assert_eq!(decode_body(b""), Value::String(String::new()));
        assert_eq!(decode_body(b"plain"), Value::String("plain".into()));
    }
}

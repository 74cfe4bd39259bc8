//! Outbound HTTP abstraction
//!
//! packtap does not ship an HTTP stack. The host application's client sits
//! behind [`HttpClient`]; [`crate::Interceptor`] wraps any implementation and
//! is itself an [`HttpClient`].

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use packtap_api::{BYPASS_HEADER, BYPASS_VALUE};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use reqwest::{Method, StatusCode, Url};
use std::fmt;

/// A streamed response body
pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// An outbound request
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl OutboundRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url, body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, url).with_body(body)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Whether the request carries the bypass marker
    pub fn is_bypassed(&self) -> bool {
        self.headers
            .get(BYPASS_HEADER)
            .is_some_and(|v| v.as_bytes() == BYPASS_VALUE.as_bytes())
    }

    /// Add the bypass marker
    pub fn mark_bypassed(&mut self) {
        self.headers.insert(
            HeaderName::from_static(BYPASS_HEADER),
            HeaderValue::from_static(BYPASS_VALUE),
        );
    }
}

/// Response body, either complete or streamed
pub enum ResponseBody {
    Full(Bytes),
    Stream(BodyStream),
}

impl ResponseBody {
    pub fn empty() -> Self {
        ResponseBody::Full(Bytes::new())
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, ResponseBody::Stream(_))
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Full(bytes) => write!(f, "Full({} bytes)", bytes.len()),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// A response as seen by the caller
#[derive(Debug)]
pub struct InboundResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl InboundResponse {
    pub fn new(status: StatusCode, body: ResponseBody) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Read the whole body
    pub async fn bytes(self) -> Result<Bytes, TransportError> {
        match self.body {
            ResponseBody::Full(bytes) => Ok(bytes),
            ResponseBody::Stream(stream) => {
                let chunks: Vec<Bytes> = stream.try_collect().await?;
                Ok(chunks.concat().into())
            }
        }
    }

    /// Read the whole body as text (lossy UTF-8)
    pub async fn text(self) -> Result<String, TransportError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// The host application's outbound HTTP client
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: OutboundRequest) -> Result<InboundResponse, TransportError>;
}

// ============================================================================
// reqwest adapter
// ============================================================================

/// When [`ReqwestClient`] hands back a streamed body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamMode {
    /// Stream when the response has no `content-length` (chunked)
    #[default]
    Unsized,
    /// Always stream
    Always,
    /// Always buffer
    Never,
}

/// [`HttpClient`] over `reqwest`
#[derive(Debug, Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
    stream_mode: StreamMode,
}

impl ReqwestClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            stream_mode: StreamMode::default(),
        }
    }

    pub fn stream_mode(mut self, mode: StreamMode) -> Self {
        self.stream_mode = mode;
        self
    }

    fn streams(&self, headers: &HeaderMap) -> bool {
        match self.stream_mode {
            StreamMode::Always => true,
            StreamMode::Never => false,
            StreamMode::Unsized => !headers.contains_key(CONTENT_LENGTH),
        }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn execute(&self, request: OutboundRequest) -> Result<InboundResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();

        let body = if self.streams(&headers) {
            ResponseBody::Stream(response.bytes_stream().map_err(TransportError::from).boxed())
        } else {
            ResponseBody::Full(response.bytes().await?)
        };

        Ok(InboundResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn test_bypass_marker() {
        let mut request = OutboundRequest::get(Url::parse("https://example.com/").unwrap());
        assert!(!request.is_bypassed());

        request.mark_bypassed();
        assert!(request.is_bypassed());

        let other = OutboundRequest::get(Url::parse("https://example.com/").unwrap())
            .with_header(
                HeaderName::from_static(BYPASS_HEADER),
                HeaderValue::from_static("0"),
            );
        assert!(!other.is_bypassed());
    }

    #[tokio::test]
    async fn test_stream_body_collects() {
        let chunks = stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ]);
        let response = InboundResponse::new(StatusCode::OK, ResponseBody::Stream(chunks.boxed()));
        assert_eq!(response.text().await.unwrap(), "hello world");
    }

    #[test]
    fn test_stream_mode() {
        let client = ReqwestClient::default();
        let mut sized = HeaderMap::new();
        sized.insert(CONTENT_LENGTH, HeaderValue::from_static("5"));

        assert!(!client.streams(&sized));
        assert!(client.streams(&HeaderMap::new()));
        assert!(client.clone().stream_mode(StreamMode::Always).streams(&sized));
        assert!(!client.stream_mode(StreamMode::Never).streams(&HeaderMap::new()));
    }
}

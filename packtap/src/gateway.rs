//! Interception gateway
//!
//! [`Interceptor`] wraps the application's [`HttpClient`] and runs the pack
//! lifecycle around every call that matches at least one pack.

use crate::config::DEFAULT_MAX_BUFFERED_BODY;
use crate::error::TransportError;
use crate::http::{HttpClient, InboundResponse, OutboundRequest, ResponseBody};
use crate::lifecycle::{new_request_id, Lifecycle, RequestContext};
use crate::pipeline::InFlightGuard;
use crate::registry::PackRegistry;
use crate::sandbox::ResponseView;
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use packtap_api::Phase;
use reqwest::header::{HeaderMap, CONTENT_ENCODING, CONTENT_LENGTH};
use reqwest::StatusCode;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::watch;

/// Built-in dimension names
pub mod dims {
    pub const URL: &str = "url";
    pub const DOMAIN: &str = "domain";
    pub const METHOD: &str = "method";
    pub const STATUS: &str = "status";
    pub const DURATION_MS: &str = "durationMs";
}

/// Status recorded when the network call itself fails
pub const NETWORK_FAILURE_STATUS: u16 = 0;

const RELAY_BUFFER: usize = 16;

/// Whether interception is active
///
/// Starts `Pending` and is resolved exactly once by `Packtap::load`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Enabled,
    Disabled,
}

/// State shared by every interceptor of one packtap instance
pub(crate) struct GatewayState {
    pub(crate) registry: RwLock<PackRegistry>,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) readiness: watch::Sender<Readiness>,
    max_buffered_body: usize,
}

impl GatewayState {
    pub(crate) fn new(lifecycle: Lifecycle) -> Self {
        let (readiness, _) = watch::channel(Readiness::Pending);
        Self {
            registry: RwLock::new(PackRegistry::new()),
            lifecycle,
            readiness,
            max_buffered_body: DEFAULT_MAX_BUFFERED_BODY,
        }
    }

    /// Cap the streamed body kept for `post`
    pub(crate) fn with_max_buffered_body(mut self, bytes: usize) -> Self {
        self.max_buffered_body = bytes;
        self
    }

    pub(crate) fn readiness(&self) -> Readiness {
        *self.readiness.borrow()
    }

    /// Resolve readiness; only the first resolution takes effect
    pub(crate) fn resolve(&self, state: Readiness) -> bool {
        self.readiness.send_if_modified(|current| {
            if *current == Readiness::Pending && state != Readiness::Pending {
                *current = state;
                true
            } else {
                false
            }
        })
    }

    async fn ready(&self) -> bool {
        let mut rx = self.readiness.subscribe();
        let enabled = match rx.wait_for(|state| *state != Readiness::Pending).await {
            Ok(state) => *state == Readiness::Enabled,
            Err(_) => false,
        };
        enabled
    }
}

/// An [`HttpClient`] that runs matched packs around each call
pub struct Interceptor<C> {
    inner: Arc<C>,
    state: Arc<GatewayState>,
}

impl<C> Clone for Interceptor<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            state: self.state.clone(),
        }
    }
}

impl<C: HttpClient + 'static> Interceptor<C> {
    pub(crate) fn new(inner: C, state: Arc<GatewayState>) -> Self {
        Self {
            inner: Arc::new(inner),
            state,
        }
    }

    /// The wrapped client
    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn intercept(
        &self,
        request: OutboundRequest,
        guard: InFlightGuard,
    ) -> Result<InboundResponse, TransportError> {
        let packs = self
            .state
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .matching(request.url.as_str());

        if packs.is_empty() {
            return self.inner.execute(request).await;
        }

        let lifecycle = &self.state.lifecycle;
        let mut ctx = RequestContext::new(new_request_id(), packs);
        tracing::debug!(
            request_id = %ctx.request_id(),
            url = %request.url,
            packs = ctx.packs().len(),
            "Request intercepted"
        );

        lifecycle.capture(&mut ctx, dims::URL, request.url.as_str());
        lifecycle.capture(
            &mut ctx,
            dims::DOMAIN,
            request.url.host_str().unwrap_or_default(),
        );
        lifecycle.capture(&mut ctx, dims::METHOD, request.method.as_str());

        lifecycle.pre(&mut ctx, &request).await;

        let mut forwarded = request.clone();
        forwarded.mark_bypassed();

        let started = Instant::now();
        let result = self.inner.execute(forwarded).await;
        let elapsed = started.elapsed().as_millis();

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(request_id = %ctx.request_id(), error = %e, "Network call failed");
                lifecycle.capture(&mut ctx, dims::STATUS, NETWORK_FAILURE_STATUS);
                lifecycle.capture(&mut ctx, dims::DURATION_MS, elapsed);
                lifecycle.complete(ctx);
                return Err(e);
            }
        };

        lifecycle.capture(&mut ctx, dims::STATUS, response.status.as_u16());
        lifecycle.capture(&mut ctx, dims::DURATION_MS, elapsed);

        let InboundResponse {
            status,
            mut headers,
            body,
        } = response;

        match body {
            ResponseBody::Full(bytes) => {
                let state = self.state.clone();
                let post_headers = headers.clone();
                let post_body = bytes.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    finish(&state, ctx, request, status, &post_headers, Some(post_body)).await;
                });
                Ok(InboundResponse {
                    status,
                    headers,
                    body: ResponseBody::Full(bytes),
                })
            }
            ResponseBody::Stream(mut stream) => {
                headers.remove(CONTENT_LENGTH);
                headers.remove(CONTENT_ENCODING);

                let (mut tx, rx) = mpsc::channel::<Result<Bytes, TransportError>>(RELAY_BUFFER);
                let state = self.state.clone();
                let post_headers = headers.clone();

                tokio::spawn(async move {
                    let _guard = guard;
                    let lifecycle = &state.lifecycle;
                    let wants_chunk = ctx.wants(Phase::Chunk);
                    let limit = state.max_buffered_body;
                    let mut buffered = ctx.wants_response_body().then(Vec::new);

                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(chunk) => {
                                if wants_chunk {
                                    lifecycle.chunk(&mut ctx, &request, &chunk).await;
                                }
                                if let Some(buffer) = buffered.as_mut() {
                                    if buffer.len() + chunk.len() > limit {
                                        tracing::debug!(
                                            request_id = %ctx.request_id(),
                                            limit,
                                            "Response body too large for post"
                                        );
                                        buffered = None;
                                    } else {
                                        buffer.extend_from_slice(&chunk);
                                    }
                                }
                                if tx.send(Ok(chunk)).await.is_err() {
                                    tracing::debug!(
                                        request_id = %ctx.request_id(),
                                        "Caller dropped the response stream"
                                    );
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::debug!(
                                    request_id = %ctx.request_id(),
                                    error = %e,
                                    "Response stream failed"
                                );
                                let _ = tx.send(Err(e)).await;
                                break;
                            }
                        }
                    }
                    drop(tx);

                    finish(
                        &state,
                        ctx,
                        request,
                        status,
                        &post_headers,
                        buffered.map(Bytes::from),
                    )
                    .await;
                });

                Ok(InboundResponse {
                    status,
                    headers,
                    body: ResponseBody::Stream(rx.boxed()),
                })
            }
        }
    }
}

/// Run `post` and write the request's log record
async fn finish(
    state: &GatewayState,
    mut ctx: RequestContext,
    request: OutboundRequest,
    status: StatusCode,
    headers: &HeaderMap,
    body: Option<Bytes>,
) {
    let view = ResponseView {
        status,
        headers,
        body: body.as_deref(),
    };
    state.lifecycle.post(&mut ctx, &request, view).await;
    state.lifecycle.complete(ctx);
}

#[async_trait]
impl<C: HttpClient + 'static> HttpClient for Interceptor<C> {
    async fn execute(&self, request: OutboundRequest) -> Result<InboundResponse, TransportError> {
        if request.is_bypassed() {
            return self.inner.execute(request).await;
        }

        let pipeline = self.state.lifecycle.pipeline();
        if pipeline.is_exiting() || !self.state.ready().await {
            return self.inner.execute(request).await;
        }

        // Held until post finishes, wherever that happens
        let guard = pipeline.enter();
        self.intercept(request, guard).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineOptions, PipelineState};
    use packtap_api::{PackId, PluginOutput, SandboxPayload};
    use packtap_host::{HostError, PluginHost};
    use std::time::Duration;

    struct NoopHost;

    #[async_trait]
    impl PluginHost for NoopHost {
        async fn invoke(
            &self,
            _pack: &PackId,
            _phase: Phase,
            _payload: &SandboxPayload,
        ) -> Result<Option<PluginOutput>, HostError> {
            Ok(None)
        }
    }

    fn state() -> GatewayState {
        let pipeline = PipelineState::new(PipelineOptions::default(), None, None);
        GatewayState::new(Lifecycle::new(Arc::new(NoopHost), pipeline))
    }

    #[test]
    fn test_readiness_resolves_once() {
        let state = state();
        assert_eq!(state.readiness(), Readiness::Pending);

        assert!(state.resolve(Readiness::Disabled));
        assert!(!state.resolve(Readiness::Enabled));
        assert_eq!(state.readiness(), Readiness::Disabled);
    }

    #[tokio::test]
    async fn test_ready_waits_for_resolution() {
        let state = Arc::new(state());

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.ready().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        state.resolve(Readiness::Enabled);
        assert!(waiter.await.unwrap());
    }
}

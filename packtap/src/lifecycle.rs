//! Lifecycle orchestrator
//!
//! Runs the matched packs of one request through `pre`, `chunk` and `post`.
//!
//! - `pre` fans out over matched packs in registration order.
//! - `chunk` delivers each body chunk to every pack that explicitly opted
//!   in, and settles before the next chunk is read.
//! - `post` runs in reverse order, so a pack that wraps in `pre` unwraps
//!   symmetrically. The matched list is never reordered; reverse position
//!   `r` maps back to slot `matched - r - 1`.
//!
//! Every phase settles all invocations before applying outputs, and a
//! failing pack never stops its siblings or reaches the caller.

use crate::http::OutboundRequest;
use crate::log::Dimension;
use crate::pipeline::PipelineState;
use crate::registry::Pack;
use crate::sandbox::{project, ProjectionInput, ResponseView};
use futures::future::join_all;
use packtap_api::{PackContext, PackId, Phase, PluginOutput, SandboxPayload};
use packtap_host::PluginHost;
use std::sync::Arc;
use std::time::Duration;

/// New time-ordered request id (UUIDv7, hyphenless hex)
pub fn new_request_id() -> String {
    uuid::Uuid::now_v7().simple().to_string()
}

/// State of one intercepted request
#[derive(Debug)]
pub struct RequestContext {
    request_id: String,
    packs: Vec<Arc<Pack>>,
    slots: Vec<PackContext>,
    dimensions: Vec<Dimension>,
}

impl RequestContext {
    /// Start a request over its matched packs
    pub fn new(request_id: impl Into<String>, packs: Vec<Arc<Pack>>) -> Self {
        let slots = vec![PackContext::new(); packs.len()];
        Self {
            request_id: request_id.into(),
            packs,
            slots,
            dimensions: Vec::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Matched packs in registration order
    pub fn packs(&self) -> &[Arc<Pack>] {
        &self.packs
    }

    /// Context stored for the pack at matched index `index`
    pub fn context(&self, index: usize) -> Option<&PackContext> {
        self.slots.get(index)
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn into_dimensions(self) -> Vec<Dimension> {
        self.dimensions
    }

    /// Whether any matched pack declares `phase`
    pub fn wants(&self, phase: Phase) -> bool {
        self.packs.iter().any(|p| p.declares(phase))
    }

    /// Whether any `post` pack may read the response body
    pub fn wants_response_body(&self) -> bool {
        self.packs
            .iter()
            .any(|p| p.declares(Phase::Post) && p.permissions().response_body())
    }

    fn record(&mut self, name: String, value: String) {
        self.dimensions.push(Dimension { name, value });
    }
}

/// A pack invocation that failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseFailure {
    pub pack: PackId,
    pub error: String,
}

/// Outcome of one phase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseReport {
    /// Packs invoked, in invocation order
    pub invoked: Vec<PackId>,
    /// Invocations that returned output
    pub produced: usize,
    /// Dimensions captured by this phase
    pub captured: usize,
    pub failed: Vec<PhaseFailure>,
}

/// Drives packs through the lifecycle of each request
pub struct Lifecycle {
    host: Arc<dyn PluginHost>,
    pipeline: Arc<PipelineState>,
    invocation_timeout: Option<Duration>,
}

impl Lifecycle {
    pub fn new(host: Arc<dyn PluginHost>, pipeline: Arc<PipelineState>) -> Self {
        Self {
            host,
            pipeline,
            invocation_timeout: None,
        }
    }

    /// Bound each pack invocation in wall-clock time
    pub fn with_invocation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.invocation_timeout = timeout;
        self
    }

    pub fn pipeline(&self) -> &Arc<PipelineState> {
        &self.pipeline
    }

    /// Record a dimension that is not tied to a pack
    pub fn capture(&self, ctx: &mut RequestContext, name: &str, value: impl ToString) {
        let value = value.to_string();
        self.pipeline.capture(&ctx.request_id, name, &value);
        ctx.record(name.to_string(), value);
    }

    /// Run `pre` for every matched pack declaring it
    pub async fn pre(&self, ctx: &mut RequestContext, request: &OutboundRequest) -> PhaseReport {
        let order: Vec<usize> = (0..ctx.packs.len())
            .filter(|&i| ctx.packs[i].declares(Phase::Pre))
            .collect();

        self.run(ctx, Phase::Pre, &order, |pack, context| {
            project(context.0, pack, ProjectionInput::new(request, context.1))
        })
        .await
    }

    /// Deliver one body chunk to every pack that opted into `chunk`
    pub async fn chunk(
        &self,
        ctx: &mut RequestContext,
        request: &OutboundRequest,
        chunk: &[u8],
    ) -> PhaseReport {
        let order: Vec<usize> = (0..ctx.packs.len())
            .filter(|&i| ctx.packs[i].declares(Phase::Chunk))
            .collect();

        self.run(ctx, Phase::Chunk, &order, |pack, context| {
            project(
                context.0,
                pack,
                ProjectionInput::new(request, context.1).with_chunk(chunk),
            )
        })
        .await
    }

    /// Run `post` in reverse registration order
    pub async fn post(
        &self,
        ctx: &mut RequestContext,
        request: &OutboundRequest,
        response: ResponseView<'_>,
    ) -> PhaseReport {
        let matched = ctx.packs.len();
        let order: Vec<usize> = (0..matched)
            .map(|reverse_index| matched - reverse_index - 1)
            .filter(|&i| ctx.packs[i].declares(Phase::Post))
            .collect();

        self.run(ctx, Phase::Post, &order, |pack, context| {
            project(
                context.0,
                pack,
                ProjectionInput::new(request, context.1).with_response(response),
            )
        })
        .await
    }

    /// Write the request's log record
    pub fn complete(&self, ctx: RequestContext) {
        let request_id = ctx.request_id.clone();
        tracing::debug!(request_id = %request_id, dimensions = ctx.dimensions.len(), "Request complete");
        self.pipeline.complete(&request_id, ctx.into_dimensions());
    }

    async fn run<F>(
        &self,
        ctx: &mut RequestContext,
        phase: Phase,
        order: &[usize],
        build: F,
    ) -> PhaseReport
    where
        F: Fn(&Pack, (&str, &PackContext)) -> SandboxPayload,
    {
        let mut report = PhaseReport::default();
        if order.is_empty() {
            return report;
        }

        let calls: Vec<(usize, SandboxPayload)> = order
            .iter()
            .map(|&index| {
                let payload = build(
                    &ctx.packs[index],
                    (ctx.request_id.as_str(), &ctx.slots[index]),
                );
                (index, payload)
            })
            .collect();

        let outcomes = join_all(calls.iter().map(|(index, payload)| {
            let pack = ctx.packs[*index].clone();
            async move {
                let outcome = self.invoke(&pack, phase, payload).await;
                (*index, outcome)
            }
        }))
        .await;

        for (index, outcome) in outcomes {
            let pack = ctx.packs[index].clone();
            report.invoked.push(pack.id().clone());

            match outcome {
                Ok(Some(output)) => {
                    report.produced += 1;
                    report.captured += self.apply(ctx, &pack, index, output);
                    tracing::debug!(
                        request_id = %ctx.request_id,
                        pack = %pack.id(),
                        phase = %phase,
                        "Pack completed"
                    );
                }
                Ok(None) => {
                    tracing::debug!(
                        request_id = %ctx.request_id,
                        pack = %pack.id(),
                        phase = %phase,
                        "Pack returned no output"
                    );
                }
                Err(error) => {
                    tracing::error!(
                        request_id = %ctx.request_id,
                        pack = %pack.id(),
                        phase = %phase,
                        error = %error,
                        "Pack invocation failed"
                    );
                    report.failed.push(PhaseFailure {
                        pack: pack.id().clone(),
                        error,
                    });
                }
            }
        }

        report
    }

    async fn invoke(
        &self,
        pack: &Pack,
        phase: Phase,
        payload: &SandboxPayload,
    ) -> Result<Option<PluginOutput>, String> {
        let call = self.host.invoke(pack.id(), phase, payload);
        let result = match self.invocation_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => return Err(format!("timed out after {}ms", limit.as_millis())),
            },
            None => call.await,
        };
        result.map_err(|e| e.to_string())
    }

    /// Store context and turn captures into events; returns the capture count
    fn apply(
        &self,
        ctx: &mut RequestContext,
        pack: &Pack,
        index: usize,
        output: PluginOutput,
    ) -> usize {
        if let Some(context) = output.context {
            ctx.slots[index] = context;
        }

        let Some(capture) = output.capture else {
            return 0;
        };

        let mut captured = 0;
        for (key, value) in capture {
            if !pack.permissions().may_capture(&key) {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    pack = %pack.id(),
                    dimension = %key,
                    "Undeclared capture dropped"
                );
                continue;
            }
            let name = format!("{}/{}", pack.name(), key.replace('/', ""));
            self.capture(ctx, &name, value);
            captured += 1;
        }
        captured
    }
}

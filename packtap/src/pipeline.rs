//! Capture, batch and flush pipeline
//!
//! Capture events get a process-wide, strictly increasing sequence id and
//! wait in a queue until a flush splices the whole queue out at once. A
//! single drain worker flushes on a periodic interval or on request, then
//! sleeps the throttle interval, so the collector sees at most one dispatch
//! per throttle interval.
//!
//! ```text
//!  capture ──► queue ──┬─► drain worker (interval / drain request) ──► transport
//!                      ├─► flush()            (async)
//!                      └─► flush_blocking()   (OS thread + condvar, exit path)
//! ```
//!
//! Shutdown stops the worker, marks the pipeline as exiting, waits a bounded
//! time for in-flight requests to finish and always performs a final flush.

use crate::config::PacktapConfig;
use crate::log::{Dimension, LogRecord, LogSink};
use crate::transport::{normalize, EventTransport};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// One captured dimension value, ready for transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureEvent {
    pub request_id: String,
    pub dimension: String,
    pub value: String,
    pub sequence_id: u64,
}

/// Pipeline settings derived from [`PacktapConfig`]
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub network: bool,
    pub logging: bool,
    pub force_log: bool,
    pub flush_interval: Duration,
    pub throttle_interval: Duration,
    pub shutdown_timeout: Duration,
    pub exit_flush_timeout: Duration,
}

impl From<&PacktapConfig> for PipelineOptions {
    fn from(config: &PacktapConfig) -> Self {
        Self {
            network: config.network_enabled(),
            logging: config.logging_enabled(),
            force_log: config.force_log,
            flush_interval: config.flush_interval,
            throttle_interval: config.throttle_interval,
            shutdown_timeout: config.shutdown_timeout,
            exit_flush_timeout: config.exit_flush_timeout,
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from(&PacktapConfig::default())
    }
}

/// Outcome of a shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every in-flight request finished before the timeout
    pub drained: bool,
    /// The in-flight wait hit the shutdown timeout
    pub timed_out: bool,
    /// Events handed to the final flush
    pub flushed_events: usize,
}

// ============================================================================
// In-flight reference count
// ============================================================================

/// Count of requests inside the lifecycle
///
/// Entered through [`InFlight::enter`]; the returned guard decrements on
/// drop, so every exit path releases it.
#[derive(Debug, Default)]
pub struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
    notify: Notify,
}

/// Holds one unit of the in-flight count
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl InFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        InFlightGuard {
            in_flight: self.clone(),
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn leave(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            drop(count);
            self.idle.notify_all();
            self.notify.notify_waiters();
        }
    }

    /// Wait until the count is zero; `false` on timeout
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                // Register before checking so a release in between is not missed
                notified.as_mut().enable();
                if self.count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }

    /// Blocking variant of [`InFlight::wait_idle`]
    pub fn wait_idle_blocking(&self, timeout: Duration) -> bool {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let (_count, result) = self
            .idle
            .wait_timeout_while(count, timeout, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
        !result.timed_out()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.leave();
    }
}

// ============================================================================
// Pipeline state
// ============================================================================

/// The one telemetry pipeline of a packtap instance
///
/// Owns the sequence generator, the pending queue, the in-flight count and
/// the drain worker handle. Shared through `Arc`.
pub struct PipelineState {
    options: PipelineOptions,
    sequence: AtomicU64,
    queue: Mutex<Vec<CaptureEvent>>,
    in_flight: Arc<InFlight>,
    exiting: AtomicBool,
    drain: Notify,
    stop: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
    transport: Option<Arc<dyn EventTransport>>,
    log_sink: Option<Arc<dyn LogSink>>,
    report: OnceLock<ShutdownReport>,
}

impl PipelineState {
    pub fn new(
        options: PipelineOptions,
        transport: Option<Arc<dyn EventTransport>>,
        log_sink: Option<Arc<dyn LogSink>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            sequence: AtomicU64::new(0),
            queue: Mutex::new(Vec::new()),
            in_flight: InFlight::new(),
            exiting: AtomicBool::new(false),
            drain: Notify::new(),
            stop: Notify::new(),
            worker: Mutex::new(None),
            transport,
            log_sink,
            report: OnceLock::new(),
        })
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Record a dimension value and return its sequence id
    pub fn capture(&self, request_id: &str, dimension: &str, value: &str) -> u64 {
        let sequence_id = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            // Assigned under the queue lock so queue order is sequence order
            let sequence_id = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            queue.push(CaptureEvent {
                request_id: request_id.to_string(),
                dimension: dimension.to_string(),
                value: value.to_string(),
                sequence_id,
            });
            sequence_id
        };

        tracing::debug!(request_id, dimension, value, seq = sequence_id, "Captured");

        if self.options.network {
            self.drain.notify_one();
        }
        sequence_id
    }

    /// Write the per-request log record
    pub fn complete(&self, request_id: &str, dimensions: Vec<Dimension>) {
        if !self.options.logging {
            return;
        }
        let Some(sink) = &self.log_sink else {
            return;
        };
        let record = LogRecord {
            request_id: request_id.to_string(),
            dimensions,
        };
        if let Err(e) = sink.record(&record) {
            tracing::warn!(request_id, error = %e, "Failed to write request log");
        }
    }

    /// Last sequence id handed out
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Number of queued events
    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn enter(&self) -> InFlightGuard {
        self.in_flight.enter()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    /// Whether shutdown has started
    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    fn take(&self) -> Vec<CaptureEvent> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn network_transport(&self) -> Option<&Arc<dyn EventTransport>> {
        if self.options.network {
            self.transport.as_ref()
        } else {
            None
        }
    }

    fn log_events(&self, events: &[CaptureEvent]) {
        if !self.options.force_log {
            return;
        }
        for event in events {
            tracing::debug!(
                req = %event.request_id,
                seq = event.sequence_id,
                dim = %event.dimension,
                val = %event.value,
                "Telemetry event"
            );
        }
    }

    // ------------------------------------------------------------------------
    // Draining
    // ------------------------------------------------------------------------

    /// Spawn the drain worker on the current runtime
    ///
    /// Calling it again while a worker exists does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() || self.is_exiting() {
            return;
        }
        *worker = Some(tokio::spawn(self.clone().drain_loop()));
        tracing::debug!("Drain worker started");
    }

    async fn drain_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.stop.notified() => break,
                _ = tokio::time::sleep(self.options.flush_interval) => {}
                _ = self.drain.notified() => {}
            }

            self.flush().await;

            tokio::select! {
                _ = self.stop.notified() => break,
                _ = tokio::time::sleep(self.options.throttle_interval) => {}
            }
        }
        tracing::debug!("Drain worker stopped");
    }

    fn stop_worker(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if worker.is_some() {
            // An in-progress flush finishes; the worker exits at its next wait
            self.stop.notify_one();
        }
    }

    /// Send everything queued
    ///
    /// Transport failures are logged and the batch is dropped. Returns the
    /// number of events spliced from the queue.
    pub async fn flush(&self) -> usize {
        self.flush_within(None).await
    }

    /// Like [`PipelineState::flush`], abandoning the send after `limit`
    async fn flush_within(&self, limit: Option<Duration>) -> usize {
        let events = self.take();
        if events.is_empty() {
            return 0;
        }
        self.log_events(&events);

        if let Some(transport) = self.network_transport() {
            let payload = normalize(&events);
            tracing::debug!(requests = payload.len(), events = events.len(), "Flushing telemetry");
            let send = transport.send(&payload);
            let result = match limit {
                Some(limit) => match tokio::time::timeout(limit, send).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(
                            timeout_ms = limit.as_millis() as u64,
                            dropped = events.len(),
                            "Exit flush timed out"
                        );
                        return events.len();
                    }
                },
                None => send.await,
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, dropped = events.len(), "Telemetry batch dropped");
            }
        }
        events.len()
    }

    /// Send everything queued and block until it is delivered
    ///
    /// The batch is posted from a dedicated OS thread running its own
    /// runtime; this thread waits on a condvar for at most the exit flush
    /// timeout. Safe to call from sync code, signal handlers and `Drop`.
    pub fn flush_blocking(&self) -> usize {
        let events = self.take();
        if events.is_empty() {
            return 0;
        }
        self.log_events(&events);

        let Some(transport) = self.network_transport().cloned() else {
            return events.len();
        };

        let payload = normalize(&events);
        let done = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = done.clone();

        let spawned = std::thread::Builder::new()
            .name("packtap-exit-flush".to_string())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => {
                        if let Err(e) = runtime.block_on(transport.send(&payload)) {
                            tracing::warn!(error = %e, "Exit flush failed");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Exit flush runtime failed to start"),
                }

                let (lock, cvar) = &*signal;
                *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
                cvar.notify_all();
            });

        if let Err(e) = spawned {
            tracing::warn!(error = %e, dropped = events.len(), "Exit flush thread failed to start");
            return events.len();
        }

        let (lock, cvar) = &*done;
        let finished = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (_finished, result) = cvar
            .wait_timeout_while(finished, self.options.exit_flush_timeout, |finished| {
                !*finished
            })
            .unwrap_or_else(PoisonError::into_inner);

        if result.timed_out() {
            tracing::warn!(
                timeout_ms = self.options.exit_flush_timeout.as_millis() as u64,
                "Exit flush timed out"
            );
        }
        events.len()
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Returns the earlier report when shutdown already started
    fn begin_shutdown(&self) -> Option<ShutdownReport> {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return Some(self.report.get().copied().unwrap_or_default());
        }
        tracing::debug!(in_flight = self.in_flight(), "Shutting down pipeline");
        self.stop_worker();
        None
    }

    fn finish_shutdown(&self, drained: bool, flushed_events: usize) -> ShutdownReport {
        if !drained {
            tracing::warn!(
                in_flight = self.in_flight(),
                timeout_ms = self.options.shutdown_timeout.as_millis() as u64,
                "Timed out waiting for in-flight requests"
            );
        }
        if let Some(sink) = &self.log_sink {
            if let Err(e) = sink.flush() {
                tracing::warn!(error = %e, "Failed to flush request log");
            }
        }

        let report = ShutdownReport {
            drained,
            timed_out: !drained,
            flushed_events,
        };
        let _ = self.report.set(report);
        report
    }

    /// Stop the pipeline and flush what is left
    ///
    /// Idempotent: later calls return the first report without flushing.
    /// The final flush gives up after the exit flush timeout.
    pub async fn shutdown(&self) -> ShutdownReport {
        if let Some(report) = self.begin_shutdown() {
            return report;
        }
        let drained = self.in_flight.wait_idle(self.options.shutdown_timeout).await;
        let flushed = self
            .flush_within(Some(self.options.exit_flush_timeout))
            .await;
        self.finish_shutdown(drained, flushed)
    }

    /// Blocking variant of [`PipelineState::shutdown`] for exit paths
    pub fn shutdown_blocking(&self) -> ShutdownReport {
        if let Some(report) = self.begin_shutdown() {
            return report;
        }
        let drained = self
            .in_flight
            .wait_idle_blocking(self.options.shutdown_timeout);
        let flushed = self.flush_blocking();
        self.finish_shutdown(drained, flushed)
    }
}

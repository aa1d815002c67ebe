use crate::error::{AppError, Result};
use crate::idempotency::clock::{Clock, SystemClock};
use crate::idempotency::content::{ContentRegistry, ReplayBody};
use crate::idempotency::fingerprint::{Fingerprinter, RequestDescriptor};
use crate::idempotency::policy::{HandlerFailure, OperationPolicy};
use crate::idempotency::record::{IdempotencyRecord, Outcome, ResponseHeaders, StoredFailure, StoredResponse};
use crate::observability::get_metrics;
use crate::repositories::Repository;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Header carrying the time, in milliseconds, a first presentation has been running.
pub const PROCESSING_DURATION_HEADER: &str = "Processing-Duration";

pub const JSON_CONTENT: &str = "application/json;codec=json;v=1";
pub const TEXT_CONTENT: &str = "text/plain;codec=text;v=1";
pub const BYTES_CONTENT: &str = "application/octet-stream;codec=bytes;v=1";

/// Response returned by a protected handler on first presentation.
pub type CapturedResponse = StoredResponse;

impl StoredResponse {
    pub fn json<T: Serialize>(status: u16, body: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize response body: {}", e)))?;
        Ok(Self {
            body: Some(bytes),
            content_descriptor: JSON_CONTENT.to_string(),
            headers: ResponseHeaders::new(),
            status,
        })
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into().into_bytes()),
            content_descriptor: TEXT_CONTENT.to_string(),
            headers: ResponseHeaders::new(),
            status,
        }
    }

    pub fn bytes(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: Some(body.into()),
            content_descriptor: BYTES_CONTENT.to_string(),
            headers: ResponseHeaders::new(),
            status,
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            body: None,
            content_descriptor: String::new(),
            headers: ResponseHeaders::new(),
            status,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }
}

/// Result of looking a fingerprint up in the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(IdempotencyRecord),
    Absent,
    /// The repository could not answer; idempotency is bypassed for this request.
    Skip,
}

/// A first presentation that has not finished yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StillProcessing {
    pub elapsed: chrono::Duration,
}

impl StillProcessing {
    pub fn status(&self) -> http::StatusCode {
        http::StatusCode::ACCEPTED
    }

    pub fn header_name(&self) -> &'static str {
        PROCESSING_DURATION_HEADER
    }

    pub fn header_value(&self) -> String {
        self.elapsed.num_milliseconds().to_string()
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.elapsed.num_milliseconds()
    }
}

/// Stored response decoded for replay.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayedResponse {
    pub status: u16,
    pub headers: ResponseHeaders,
    pub body: ReplayBody,
    pub content_descriptor: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayDecision {
    StillProcessing(StillProcessing),
    ReplayResponse(ReplayedResponse),
    ReplayFailure(StoredFailure),
    /// The stored outcome cannot be replayed; handle as a first presentation.
    Fallthrough,
}

/// What happened to one protected request.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    /// The handler ran and returned a response.
    Executed(CapturedResponse),
    /// The handler ran and failed; the failure is passed through unchanged.
    Failed(HandlerFailure),
    Replayed(ReplayedResponse),
    ReplayedFailure(StoredFailure),
    StillProcessing(StillProcessing),
}

impl Execution {
    pub fn is_replay(&self) -> bool {
        matches!(self, Execution::Replayed(_) | Execution::ReplayedFailure(_))
    }

    pub fn handler_ran(&self) -> bool {
        matches!(self, Execution::Executed(_) | Execution::Failed(_))
    }
}

/// Counters for the coordination protocol.
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    pub requests: AtomicU64,
    pub first_presentations: AtomicU64,
    pub replays: AtomicU64,
    pub still_processing: AtomicU64,
    pub fallthroughs: AtomicU64,
    pub skips: AtomicU64,
    pub completions: AtomicU64,
    pub registered_failures: AtomicU64,
    pub discards: AtomicU64,
}

impl CoordinatorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CoordinatorMetricsSnapshot {
        CoordinatorMetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            first_presentations: self.first_presentations.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            still_processing: self.still_processing.load(Ordering::Relaxed),
            fallthroughs: self.fallthroughs.load(Ordering::Relaxed),
            skips: self.skips.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            registered_failures: self.registered_failures.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorMetricsSnapshot {
    pub requests: u64,
    pub first_presentations: u64,
    pub replays: u64,
    pub still_processing: u64,
    pub fallthroughs: u64,
    pub skips: u64,
    pub completions: u64,
    pub registered_failures: u64,
    pub discards: u64,
}

impl CoordinatorMetricsSnapshot {
    pub fn replay_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.replays as f64 / self.requests as f64
        }
    }
}

/// Drives the per-key state machine `NONE -> RUNNING -> DONE`.
///
/// Repository failures never fail a request: they are logged and the
/// coordinator carries on as if idempotency were not configured.
pub struct Coordinator {
    fingerprinter: Fingerprinter,
    repository: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    registry: ContentRegistry,
    metrics: Arc<CoordinatorMetrics>,
}

impl Coordinator {
    pub fn new(fingerprinter: Fingerprinter, repository: Arc<dyn Repository>) -> Self {
        Self {
            fingerprinter,
            repository,
            clock: Arc::new(SystemClock),
            registry: ContentRegistry::with_defaults(),
            metrics: Arc::new(CoordinatorMetrics::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_registry(mut self, registry: ContentRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn fingerprinter(&self) -> &Fingerprinter {
        &self.fingerprinter
    }

    pub fn registry(&self) -> &ContentRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> Arc<CoordinatorMetrics> {
        Arc::clone(&self.metrics)
    }

    pub async fn lookup(&self, key: &str) -> Lookup {
        match self.repository.get(key).await {
            Ok(Some(record)) => {
                tracing::trace!(key = %key, state = ?record.state(), "Found idempotency record");
                get_metrics().record_lookup("found");
                Lookup::Found(record)
            }
            Ok(None) => {
                tracing::trace!(key = %key, "No idempotency record, first presentation");
                get_metrics().record_lookup("absent");
                Lookup::Absent
            }
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    "Unable to look up request in idempotency repository, skipping idempotency: {}",
                    e
                );
                get_metrics().record_lookup("skip");
                Lookup::Skip
            }
        }
    }

    /// Registers a running record. The record is returned even when it could not be stored.
    pub async fn begin(&self, key: &str) -> IdempotencyRecord {
        let record = IdempotencyRecord::running(key, self.clock.now());
        tracing::trace!(key = %key, "Registering running idempotency record");
        self.store(record.clone()).await;
        record
    }

    /// Completes a running record with the handler's response. A done record is returned untouched.
    pub async fn complete(&self, record: &IdempotencyRecord, response: CapturedResponse) -> IdempotencyRecord {
        match record.finish(Outcome::Response(response)) {
            Some(done) => {
                CoordinatorMetrics::bump(&self.metrics.completions);
                self.store(done.clone()).await;
                done
            }
            None => {
                tracing::debug!(key = %record.key(), "Idempotency record already done, not overwriting");
                record.clone()
            }
        }
    }

    /// Completes a still-running record from a response observed after the handler returned.
    pub async fn complete_observed(
        &self,
        record: &IdempotencyRecord,
        headers: ResponseHeaders,
        status: u16,
    ) -> IdempotencyRecord {
        if record.is_done() {
            return record.clone();
        }
        let observed = StoredResponse {
            body: None,
            content_descriptor: String::new(),
            headers,
            status,
        };
        self.complete(record, observed).await
    }

    /// Settles a first presentation that did not return a response.
    ///
    /// A registerable failure is stored for replay. Anything else, including
    /// cancellation (`None`), removes the record so the request can be retried.
    pub async fn abort(
        &self,
        record: &IdempotencyRecord,
        failure: Option<&HandlerFailure>,
        policy: &OperationPolicy,
    ) -> Option<IdempotencyRecord> {
        if let Some(failure) = failure.filter(|f| policy.is_registerable(&f.descriptor)) {
            tracing::trace!(
                key = %record.key(),
                operation = policy.name(),
                kind = %failure.descriptor,
                "Failure kind is registerable, storing it"
            );
            let done = match record.finish(Outcome::Failure(failure.clone().into())) {
                Some(done) => done,
                None => {
                    tracing::debug!(key = %record.key(), "Idempotency record already done, not overwriting");
                    return Some(record.clone());
                }
            };
            CoordinatorMetrics::bump(&self.metrics.registered_failures);
            self.store(done.clone()).await;
            return Some(done);
        }

        tracing::trace!(key = %record.key(), operation = policy.name(), "Discarding idempotency record");
        CoordinatorMetrics::bump(&self.metrics.discards);
        if let Err(e) = self.repository.delete(record.key()).await {
            tracing::warn!(
                key = %record.key(),
                "Unable to unregister request from idempotency repository: {}",
                e
            );
        }
        None
    }

    /// Decides how to answer a request whose fingerprint is already known.
    pub fn present_subsequent(&self, record: &IdempotencyRecord, registry: &ContentRegistry) -> ReplayDecision {
        let outcome = match record.outcome() {
            None => {
                let elapsed = record.elapsed(self.clock.now());
                tracing::trace!(
                    key = %record.key(),
                    elapsed_ms = elapsed.num_milliseconds(),
                    "First presentation is still running"
                );
                return ReplayDecision::StillProcessing(StillProcessing { elapsed });
            }
            Some(outcome) => outcome,
        };

        match outcome {
            Outcome::Failure(failure) => ReplayDecision::ReplayFailure(failure.clone()),
            Outcome::Response(response) => match Self::decode(response, registry) {
                Ok(body) => ReplayDecision::ReplayResponse(ReplayedResponse {
                    status: response.status,
                    headers: response.headers.clone(),
                    body,
                    content_descriptor: response.content_descriptor.clone(),
                }),
                Err(e) => {
                    tracing::debug!(key = %record.key(), "Stored response cannot be replayed: {}", e);
                    ReplayDecision::Fallthrough
                }
            },
        }
    }

    fn decode(response: &StoredResponse, registry: &ContentRegistry) -> Result<ReplayBody> {
        let body = match &response.body {
            Some(body) => body,
            None => return Ok(ReplayBody::Empty),
        };
        let codec = registry.resolve(&response.content_descriptor).ok_or_else(|| {
            AppError::Unmarshall(format!(
                "no codec registered for '{}'",
                response.content_descriptor
            ))
        })?;
        codec.unmarshal(body)
    }

    /// Runs `handler` under idempotency protection.
    ///
    /// Errors are only returned for requests that cannot be fingerprinted
    /// (missing mandatory key, unreadable body).
    pub async fn execute<F, Fut>(
        &self,
        request: &RequestDescriptor,
        policy: &OperationPolicy,
        handler: F,
    ) -> Result<Execution>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<CapturedResponse, HandlerFailure>>,
    {
        CoordinatorMetrics::bump(&self.metrics.requests);
        self.fingerprinter.check_key_header(request)?;
        let key = self.fingerprinter.fingerprint(request)?;

        match self.lookup(&key).await {
            Lookup::Skip => {
                CoordinatorMetrics::bump(&self.metrics.skips);
                return Ok(match handler().await {
                    Ok(response) => Execution::Executed(response),
                    Err(failure) => Execution::Failed(failure),
                });
            }
            Lookup::Found(record) => match self.present_subsequent(&record, &self.registry) {
                ReplayDecision::StillProcessing(pending) => {
                    CoordinatorMetrics::bump(&self.metrics.still_processing);
                    get_metrics().record_replay("still_processing");
                    return Ok(Execution::StillProcessing(pending));
                }
                ReplayDecision::ReplayResponse(replayed) => {
                    CoordinatorMetrics::bump(&self.metrics.replays);
                    get_metrics().record_replay("response");
                    return Ok(Execution::Replayed(replayed));
                }
                ReplayDecision::ReplayFailure(failure) => {
                    CoordinatorMetrics::bump(&self.metrics.replays);
                    get_metrics().record_replay("failure");
                    return Ok(Execution::ReplayedFailure(failure));
                }
                ReplayDecision::Fallthrough => {
                    CoordinatorMetrics::bump(&self.metrics.fallthroughs);
                    get_metrics().record_replay("fallthrough");
                }
            },
            Lookup::Absent => {}
        }

        CoordinatorMetrics::bump(&self.metrics.first_presentations);
        let record = self.begin(&key).await;

        match handler().await {
            Ok(response) => {
                self.complete(&record, response.clone()).await;
                Ok(Execution::Executed(response))
            }
            Err(failure) => {
                tracing::trace!(key = %key, kind = %failure.descriptor, "Handler failed on first presentation");
                self.abort(&record, Some(&failure), policy).await;
                Ok(Execution::Failed(failure))
            }
        }
    }

    async fn store(&self, record: IdempotencyRecord) {
        let key = record.key().to_string();
        if let Err(e) = self.repository.put(&key, record).await {
            tracing::warn!(
                key = %key,
                "Unable to register request in idempotency repository: {}",
                e
            );
        }
    }
}

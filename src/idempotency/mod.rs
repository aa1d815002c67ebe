pub mod clock;
pub mod content;
pub mod coordinator;
pub mod fingerprint;
pub mod policy;
pub mod record;

pub use clock::{Clock, ManualClock, SystemClock};
pub use content::{BytesCodec, ContentCodec, ContentDescriptor, ContentRegistry, JsonCodec, ReplayBody, TextCodec};
pub use coordinator::{
    CapturedResponse, Coordinator, CoordinatorMetrics, CoordinatorMetricsSnapshot, Execution, Lookup,
    ReplayDecision, ReplayedResponse, StillProcessing, PROCESSING_DURATION_HEADER,
};
pub use fingerprint::{client_identity, Fingerprinter, RequestDescriptor, FORWARDED_FOR_HEADER, IDEMPOTENCY_KEY_HEADER};
pub use policy::{HandlerFailure, OperationPolicy};
pub use record::{IdempotencyRecord, Outcome, RecordState, ResponseHeaders, StoredFailure, StoredResponse};

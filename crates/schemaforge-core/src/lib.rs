//! SchemaForge Core Types
//!
//! The record envelope, the error taxonomy shared by every sink, and the
//! [`SinkService`] / [`RecordIngestor`] seams between workers and sinks.

pub mod errors;
pub mod record;
pub mod sink;

pub use errors::{IngestError, IngestResult, SinkError, SinkResult};
pub use record::{
    DATA_FIELD, DATA_VERSION_FIELD, DELTA_EVENT_TYPE, EVENT_TYPE_FIELD,
    OBJECT_KEY_FIELD, OBJECT_TYPE_FIELD, Record, is_delta_element,
};
pub use sink::{IngestOutcome, RecordIngestor, SinkKind, SinkService};

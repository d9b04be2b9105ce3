// Narrow, validated entry point for low-trust client-side usage events.

pub mod events;

pub use events::{
    ErrorReport, EventAggregator, EventKind, IngestReceipt, UsageEvent, MAX_BATCH_EVENTS,
    MAX_ERROR_MESSAGE_CHARS, MAX_METADATA_BYTES,
};

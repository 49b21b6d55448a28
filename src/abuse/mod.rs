//! Abuse signal recording and challenge escalation.

mod escalation;
mod event;
mod recorder;

pub use escalation::{
    ChallengeScope, EscalationPolicy, EscalationSettings, EscalationState, MAX_WINDOW_SECS,
};
pub use event::{
    AbuseMetricEvent, EventMetadata, MetadataValue, MetricQuery, MetricType, Scalar,
    MAX_METADATA_ENTRIES, MAX_METADATA_TEXT_LEN,
};
pub use recorder::{AbuseMetricsRecorder, DEFAULT_RECORD_TIMEOUT};

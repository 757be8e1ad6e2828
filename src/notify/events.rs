//! Recovery lifecycle events.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::recovery::classifier::{FailureType, Priority};
use crate::recovery::pattern::{PatternSeverity, PatternType};

/// Something that happened to a quarantined job or a failure pattern.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryEvent {
    JobQuarantined {
        tenant_id: String,
        job_id: Uuid,
        queue: String,
        job_type: String,
        failure_type: FailureType,
        priority: Priority,
        is_critical: bool,
        reason: String,
    },
    RetryScheduled {
        tenant_id: String,
        job_id: Uuid,
        log_id: Uuid,
        scheduled_for: DateTime<Utc>,
        attempt: u32,
        requires_approval: bool,
    },
    JobRecovered {
        tenant_id: String,
        job_id: Uuid,
        log_id: Uuid,
        failure_type: FailureType,
        duration_ms: Option<i64>,
    },
    RecoveryFailed {
        tenant_id: String,
        job_id: Uuid,
        log_id: Uuid,
        failure_type: FailureType,
        error: String,
        will_retry: bool,
    },
    JobPermanentlyFailed {
        tenant_id: String,
        job_id: Uuid,
        queue: String,
        job_type: String,
        failure_type: FailureType,
        retry_count: u32,
        reason: String,
    },
    RecoveryTimedOut {
        tenant_id: String,
        job_id: Uuid,
        log_id: Uuid,
    },
    PatternDetected {
        tenant_id: String,
        pattern_id: Uuid,
        pattern_type: PatternType,
        severity: PatternSeverity,
        queue: String,
        failure_type: FailureType,
        occurrence_count: u64,
        created: bool,
    },
    JobArchived {
        tenant_id: String,
        job_id: Uuid,
    },
}

impl RecoveryEvent {
    /// Short label used for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RecoveryEvent::JobQuarantined { .. } => "job_quarantined",
            RecoveryEvent::RetryScheduled { .. } => "retry_scheduled",
            RecoveryEvent::JobRecovered { .. } => "job_recovered",
            RecoveryEvent::RecoveryFailed { .. } => "recovery_failed",
            RecoveryEvent::JobPermanentlyFailed { .. } => "job_permanently_failed",
            RecoveryEvent::RecoveryTimedOut { .. } => "recovery_timed_out",
            RecoveryEvent::PatternDetected { .. } => "pattern_detected",
            RecoveryEvent::JobArchived { .. } => "job_archived",
        }
    }
}

/// Non-blocking sender for [`RecoveryEvent`]s.
///
/// A full or closed channel drops the event with a warning; the orchestrator
/// never waits on consumers.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<RecoveryEvent>>,
}

impl EventSink {
    /// Creates a sink and the receiver that drains it.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RecoveryEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: RecoveryEvent) {
        let Some(tx) = &self.tx else {
            return;
        };

        if let Err(e) = tx.try_send(event) {
            let event = match &e {
                mpsc::error::TrySendError::Full(ev) | mpsc::error::TrySendError::Closed(ev) => ev,
            };
            warn!(event = event.kind(), error = %e, "Dropped recovery event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archived() -> RecoveryEvent {
        RecoveryEvent::JobArchived {
            tenant_id: "t1".into(),
            job_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn emits_to_receiver() {
        let (sink, mut rx) = EventSink::channel(4);
        sink.emit(archived());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "job_archived");
    }

    #[tokio::test]
    async fn full_channel_drops_without_blocking() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.emit(archived());
        sink.emit(archived());

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disabled_sink_is_a_no_op() {
        EventSink::disabled().emit(archived());
    }
}

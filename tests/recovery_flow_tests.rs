mod common;

use chrono::Duration;
use serde_json::json;

use job_recovery::notify::{EventSink, RecoveryEvent};
use job_recovery::recovery::{
    ClassifiedError, DeadLetterStatus, ErrorType, Orchestrator, RecoveryLogStatus,
    RecoveryStrategy, ScheduleOptions,
};
use job_recovery::store::RecoveryStore;

use common::*;

#[tokio::test]
async fn unknown_failure_exhausts_budget_after_three_dispatches() {
    let h = harness(config(), ScriptedQueue::failing("still broken"));
    let job = h
        .orchestrator
        .ingest("t1", failed("1", json!({})), ClassifiedError::new(ErrorType::Unknown, "boom"))
        .await
        .unwrap();
    assert_eq!(job.max_retries, 2);

    for _ in 0..3 {
        h.clock.advance(Duration::hours(1));
        h.orchestrator.run_sweep().await.unwrap();
    }

    let job = h.store.get_job("t1", job.id).await.unwrap().unwrap();
    assert_eq!(job.status, DeadLetterStatus::PermanentlyFailed);
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.next_retry_at, None);
    assert_eq!(job.active_recovery_id, None);
    assert_eq!(h.queue.calls(), 3);

    let logs = h.store.logs_for_job("t1", job.id).await.unwrap();
    assert_eq!(logs.len(), 3);
    assert!(logs.iter().all(|l| l.status == RecoveryLogStatus::Failed));

    let mut attempts: Vec<u32> = logs
        .iter()
        .map(|l| l.recovery_configuration.attempt_number)
        .collect();
    attempts.sort_unstable();
    assert_eq!(attempts, vec![1, 2, 3]);

    // Nothing is dispatched once the job is retired.
    h.clock.advance(Duration::hours(1));
    let report = h.orchestrator.run_sweep().await.unwrap();
    assert_eq!(report.due, 0);
    assert_eq!(h.queue.calls(), 3);
}

#[tokio::test]
async fn job_recovers_after_one_failed_attempt() {
    let (events, mut rx) = EventSink::channel(64);
    let store = std::sync::Arc::new(job_recovery::store::MemoryStore::new());
    let queue = std::sync::Arc::new(ScriptedQueue::with_script(
        vec![Err("connection reset".into())],
        Ok(()),
    ));
    let clock = std::sync::Arc::new(job_recovery::recovery::ManualClock::new(start()));
    let orchestrator = Orchestrator::new(&config(), store.clone(), queue.clone())
        .with_clock(clock.clone())
        .with_events(events);

    let job = orchestrator
        .ingest("t1", failed("1", json!({})), ClassifiedError::new(ErrorType::Network, "reset"))
        .await
        .unwrap();

    clock.advance(Duration::minutes(1));
    let first = orchestrator.run_sweep().await.unwrap();
    assert_eq!(first.rescheduled, 1);

    clock.advance(Duration::minutes(5));
    let second = orchestrator.run_sweep().await.unwrap();
    assert_eq!(second.recovered, 1);

    let job = store.get_job("t1", job.id).await.unwrap().unwrap();
    assert_eq!(job.status, DeadLetterStatus::Recovered);
    assert_eq!(job.recovered_at, Some(start() + Duration::minutes(6)));
    assert_eq!(job.retry_count, 1);

    let mut statuses: Vec<_> = store
        .logs_for_job("t1", job.id)
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.status)
        .collect();
    statuses.sort_by_key(|s| s.as_str());
    assert_eq!(
        statuses,
        vec![RecoveryLogStatus::Completed, RecoveryLogStatus::Failed]
    );

    let mut recovered = 0;
    while let Ok(event) = rx.try_recv() {
        if let RecoveryEvent::JobRecovered { job_id, .. } = event {
            assert_eq!(job_id, job.id);
            recovered += 1;
        }
    }
    assert_eq!(recovered, 1);
}

#[tokio::test]
async fn critical_job_is_dispatched_only_after_approval() {
    let h = harness(config(), ScriptedQueue::accepting());
    let job = h
        .orchestrator
        .ingest(
            "t1",
            failed("1", json!({"isCritical": true})),
            ClassifiedError::new(ErrorType::Timeout, "slow"),
        )
        .await
        .unwrap();
    let log_id = job.active_recovery_id.unwrap();

    h.clock.advance(Duration::minutes(10));
    let report = h.orchestrator.run_sweep().await.unwrap();
    assert_eq!(report.awaiting_approval, 1);
    assert_eq!(h.queue.calls(), 0);

    let log = h
        .orchestrator
        .approve("t1", log_id, "lead", Some("customer confirmed".into()))
        .await
        .unwrap();
    assert_eq!(log.approved_by.as_deref(), Some("lead"));

    let report = h.orchestrator.run_sweep().await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(h.queue.calls(), 1);
}

#[tokio::test]
async fn critical_job_dispatches_directly_when_approval_is_off() {
    let mut config = config();
    config.recovery.critical_requires_approval = false;
    let h = harness(config, ScriptedQueue::accepting());

    let job = h
        .orchestrator
        .ingest(
            "t1",
            failed("1", json!({"orderId": "o-1"})),
            ClassifiedError::new(ErrorType::Timeout, "slow"),
        )
        .await
        .unwrap();

    h.clock.advance(Duration::minutes(10));
    let report = h.orchestrator.run_sweep().await.unwrap();
    assert_eq!(report.recovered, 1);

    let job = h.store.get_job("t1", job.id).await.unwrap().unwrap();
    assert_eq!(job.status, DeadLetterStatus::Recovered);
}

#[tokio::test]
async fn stuck_attempt_is_timed_out_and_rescheduled() {
    let h = harness(config(), ScriptedQueue::accepting());
    let job = h
        .orchestrator
        .ingest("t1", failed("1", json!({})), ClassifiedError::new(ErrorType::Timeout, "slow"))
        .await
        .unwrap();
    let log_id = job.active_recovery_id.unwrap();

    // A dispatcher claims the job, starts the attempt and dies.
    h.clock.advance(Duration::minutes(1));
    let now = start() + Duration::minutes(1);
    let mut claimed = job.clone();
    claimed.begin_retry(now);
    h.store.update_job(&claimed).await.unwrap().unwrap();
    let mut log = h.store.get_log("t1", log_id).await.unwrap().unwrap();
    assert!(log.start(now));
    h.store.update_log(&log).await.unwrap().unwrap();

    h.clock.advance(Duration::minutes(30));
    let report = h.orchestrator.run_watchdog("t1").await.unwrap();
    assert_eq!(report.timed_out, 0);

    h.clock.advance(Duration::hours(2));
    let report = h.orchestrator.run_watchdog("t1").await.unwrap();
    assert_eq!(report.timed_out, 1);

    let log = h.store.get_log("t1", log_id).await.unwrap().unwrap();
    assert_eq!(log.status, RecoveryLogStatus::Timeout);
    assert!(log.recovery_duration_ms.unwrap() > 2 * 3600 * 1000);

    let job = h.store.get_job("t1", job.id).await.unwrap().unwrap();
    assert_eq!(job.status, DeadLetterStatus::RetryScheduled);
    assert_eq!(job.retry_count, 1);
    assert_ne!(job.active_recovery_id, Some(log_id));
    assert!(job.active_recovery_id.is_some());
}

#[tokio::test]
async fn repeated_ingestion_returns_the_same_job() {
    let h = harness(config(), ScriptedQueue::accepting());
    let error = ClassifiedError::new(ErrorType::Network, "reset");

    let first = h
        .orchestrator
        .ingest("t1", failed("42", json!({})), error.clone())
        .await
        .unwrap();
    let second = h
        .orchestrator
        .ingest("t1", failed("42", json!({})), error.clone())
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(h.store.list_jobs("t1").await.unwrap().len(), 1);
    assert_eq!(h.store.logs_for_job("t1", first.id).await.unwrap().len(), 1);

    // Same job id on another tenant is a different job.
    let other = h
        .orchestrator
        .ingest("t2", failed("42", json!({})), error)
        .await
        .unwrap();
    assert_ne!(other.id, first.id);
}

#[tokio::test]
async fn concurrent_sweeps_dispatch_each_job_once() {
    let h = harness(config(), ScriptedQueue::accepting());
    for n in 0..10 {
        h.orchestrator
            .ingest(
                "t1",
                failed(&n.to_string(), json!({})),
                ClassifiedError::new(ErrorType::Timeout, "slow"),
            )
            .await
            .unwrap();
    }

    h.clock.advance(Duration::minutes(5));
    let (a, b) = tokio::join!(h.orchestrator.run_sweep(), h.orchestrator.run_sweep());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.recovered + b.recovered, 10);
    assert_eq!(h.queue.calls(), 10);

    let mut dispatched: Vec<_> = h
        .queue
        .requests()
        .await
        .into_iter()
        .map(|r| r.dead_letter_job_id)
        .collect();
    dispatched.sort();
    dispatched.dedup();
    assert_eq!(dispatched.len(), 10);

    let jobs = h.store.list_jobs("t1").await.unwrap();
    assert!(jobs.iter().all(|j| j.status == DeadLetterStatus::Recovered));
}

#[tokio::test]
async fn fixed_delay_retry_honours_the_requested_delay() {
    let h = harness(config(), ScriptedQueue::accepting());
    let job = h
        .orchestrator
        .ingest(
            "t1",
            failed("1", json!({})),
            ClassifiedError::new(ErrorType::Authentication, "token revoked"),
        )
        .await
        .unwrap();
    assert_eq!(job.status, DeadLetterStatus::Quarantined);
    assert!(job.requires_manual_intervention);

    let log = h
        .orchestrator
        .schedule_retry(
            "t1",
            job.id,
            RecoveryStrategy::FixedDelay { seconds: 600 },
            ScheduleOptions::manual("ops"),
        )
        .await
        .unwrap();
    assert_eq!(
        log.recovery_configuration.scheduled_for,
        start() + Duration::minutes(10)
    );
    assert_eq!(log.initiated_by.as_deref(), Some("ops"));

    h.clock.advance(Duration::minutes(5));
    assert_eq!(h.orchestrator.run_sweep().await.unwrap().due, 0);

    h.clock.advance(Duration::minutes(6));
    assert_eq!(h.orchestrator.run_sweep().await.unwrap().recovered, 1);
}

#[tokio::test]
async fn unapproved_critical_job_does_not_hold_the_batch() {
    let mut config = config();
    config.recovery.batch_size = 1;
    let h = harness(config, ScriptedQueue::accepting());

    let critical = h
        .orchestrator
        .ingest(
            "t1",
            failed("1", json!({"orderId": "o-1"})),
            ClassifiedError::new(ErrorType::Timeout, "slow"),
        )
        .await
        .unwrap();
    let plain = h
        .orchestrator
        .ingest("t1", failed("2", json!({})), ClassifiedError::new(ErrorType::Timeout, "slow"))
        .await
        .unwrap();

    for _ in 0..3 {
        h.clock.advance(Duration::minutes(10));
        let report = h.orchestrator.run_sweep().await.unwrap();
        assert_eq!(report.awaiting_approval, 1);
    }

    let plain = h.store.get_job("t1", plain.id).await.unwrap().unwrap();
    assert_eq!(plain.status, DeadLetterStatus::Recovered);
    let critical = h.store.get_job("t1", critical.id).await.unwrap().unwrap();
    assert_eq!(critical.status, DeadLetterStatus::RetryScheduled);
    assert_eq!(h.queue.calls(), 1);
}

#[tokio::test]
async fn sweep_dispatches_by_priority_then_retry_time() {
    let mut config = config();
    config.recovery.critical_requires_approval = false;
    config.recovery.dispatch_concurrency = 1;
    let h = harness(config, ScriptedQueue::accepting());

    let ingest = |id: &'static str, payload: serde_json::Value, error: ErrorType| {
        let orchestrator = h.orchestrator.clone();
        async move {
            orchestrator
                .ingest("t1", failed(id, payload), ClassifiedError::new(error, "failed"))
                .await
                .unwrap()
        }
    };

    let early = ingest("early", json!({}), ErrorType::Timeout).await;
    h.clock.advance(Duration::minutes(1));
    let late = ingest("late", json!({}), ErrorType::Network).await;
    h.clock.advance(Duration::minutes(1));
    let critical = ingest("critical", json!({"orderId": "o-1"}), ErrorType::Timeout).await;
    assert!(early.next_retry_at < late.next_retry_at);
    assert!(late.next_retry_at < critical.next_retry_at);

    h.clock.advance(Duration::minutes(10));
    let report = h.orchestrator.run_sweep().await.unwrap();
    assert_eq!(report.recovered, 3);

    let order: Vec<_> = h
        .queue
        .requests()
        .await
        .into_iter()
        .map(|r| r.dead_letter_job_id)
        .collect();
    assert_eq!(order, vec![critical.id, early.id, late.id]);
}

#[tokio::test]
async fn failed_attempt_start_returns_job_to_schedule() {
    let (h, flaky) = flaky_harness(config(), ScriptedQueue::accepting());
    let job = h
        .orchestrator
        .ingest("t1", failed("1", json!({})), ClassifiedError::new(ErrorType::Timeout, "slow"))
        .await
        .unwrap();
    let log_id = job.active_recovery_id.unwrap();

    h.clock.advance(Duration::minutes(1));
    flaky.fail_log_updates(1);
    let report = h.orchestrator.run_sweep().await.unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(h.queue.calls(), 0);

    let stored = h.store.get_job("t1", job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeadLetterStatus::RetryScheduled);
    assert_eq!(stored.active_recovery_id, Some(log_id));
    assert!(stored.last_retry_at.is_none());

    h.clock.advance(Duration::hours(3));
    let report = h.orchestrator.run_sweep().await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(h.queue.calls(), 1);

    let log = h.store.get_log("t1", log_id).await.unwrap().unwrap();
    assert_eq!(log.status, RecoveryLogStatus::Completed);
    assert_eq!(log.recovery_configuration.attempt_number, 1);
}

#[tokio::test]
async fn claim_without_started_attempt_is_repaired() {
    let h = harness(config(), ScriptedQueue::accepting());
    let job = h
        .orchestrator
        .ingest("t1", failed("1", json!({})), ClassifiedError::new(ErrorType::Timeout, "slow"))
        .await
        .unwrap();
    let log_id = job.active_recovery_id.unwrap();

    // A dispatcher claims the job and dies before starting the attempt.
    h.clock.advance(Duration::minutes(1));
    let mut claimed = job.clone();
    claimed.begin_retry(start() + Duration::minutes(1));
    h.store.update_job(&claimed).await.unwrap().unwrap();

    h.clock.advance(Duration::minutes(30));
    let report = h.orchestrator.run_sweep().await.unwrap();
    assert_eq!(report.repaired, 0);
    assert_eq!(h.queue.calls(), 0);

    h.clock.advance(Duration::hours(3));
    let report = h.orchestrator.run_sweep().await.unwrap();
    assert_eq!(report.repaired, 1);
    assert_eq!(report.recovered, 1);

    let job = h.store.get_job("t1", job.id).await.unwrap().unwrap();
    assert_eq!(job.status, DeadLetterStatus::Recovered);
    assert_eq!(job.retry_count, 0);
    let log = h.store.get_log("t1", log_id).await.unwrap().unwrap();
    assert_eq!(log.status, RecoveryLogStatus::Completed);
}

//! Prometheus metrics exporter.

use std::net::SocketAddr;
use std::sync::Arc;

use prometheus::{CounterVec, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry};
use tracing::{error, info};

use crate::error::NotificationError;
use crate::notify::events::RecoveryEvent;
use crate::recovery::stats::DeadLetterJobStats;

/// Prometheus metrics for the recovery engine.
pub struct Metrics {
    /// Registry for all metrics.
    registry: Registry,
    /// Jobs quarantined, by failure type.
    pub jobs_quarantined_total: CounterVec,
    /// Finished recovery attempts, by outcome.
    pub recovery_outcomes_total: CounterVec,
    /// Pattern detections, by severity.
    pub patterns_detected_total: CounterVec,
    /// Quarantined jobs by status.
    pub jobs_by_status: GaugeVec,
    /// Scheduled jobs whose retry time has passed.
    pub overdue_jobs: Gauge,
    /// Recovery attempt duration in seconds.
    pub recovery_duration_seconds: Histogram,
    /// Sweep duration in seconds.
    pub sweep_duration_seconds: Histogram,
}

fn prom_err(e: prometheus::Error) -> NotificationError {
    NotificationError::PrometheusFailed(e.to_string())
}

impl Metrics {
    /// Creates a new metrics instance with all gauges and counters.
    pub fn new() -> Result<Self, NotificationError> {
        let registry = Registry::new();

        let jobs_quarantined_total = CounterVec::new(
            Opts::new("recovery_jobs_quarantined_total", "Jobs moved into quarantine"),
            &["failure_type"],
        )
        .map_err(prom_err)?;

        let recovery_outcomes_total = CounterVec::new(
            Opts::new(
                "recovery_outcomes_total",
                "Recovery attempt outcomes and job retirements",
            ),
            &["outcome"],
        )
        .map_err(prom_err)?;

        let patterns_detected_total = CounterVec::new(
            Opts::new("recovery_patterns_detected_total", "Failure pattern detections"),
            &["severity"],
        )
        .map_err(prom_err)?;

        let jobs_by_status = GaugeVec::new(
            Opts::new("recovery_jobs", "Quarantined jobs by status"),
            &["status"],
        )
        .map_err(prom_err)?;

        let overdue_jobs = Gauge::new(
            "recovery_overdue_jobs",
            "Jobs whose scheduled retry time has passed",
        )
        .map_err(prom_err)?;

        let recovery_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "recovery_duration_seconds",
                "Time from dispatch to outcome of recovery attempts",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        )
        .map_err(prom_err)?;

        let sweep_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("recovery_sweep_duration_seconds", "Duration of recovery sweeps")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        )
        .map_err(prom_err)?;

        // Register all metrics
        registry
            .register(Box::new(jobs_quarantined_total.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(recovery_outcomes_total.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(patterns_detected_total.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(jobs_by_status.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(overdue_jobs.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(recovery_duration_seconds.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(sweep_duration_seconds.clone()))
            .map_err(prom_err)?;

        Ok(Self {
            registry,
            jobs_quarantined_total,
            recovery_outcomes_total,
            patterns_detected_total,
            jobs_by_status,
            overdue_jobs,
            recovery_duration_seconds,
            sweep_duration_seconds,
        })
    }

    /// Updates counters from a lifecycle event.
    pub fn observe_event(&self, event: &RecoveryEvent) {
        match event {
            RecoveryEvent::JobQuarantined { failure_type, .. } => self
                .jobs_quarantined_total
                .with_label_values(&[failure_type.as_str()])
                .inc(),
            RecoveryEvent::JobRecovered { duration_ms, .. } => {
                self.recovery_outcomes_total
                    .with_label_values(&["recovered"])
                    .inc();
                if let Some(ms) = duration_ms {
                    self.recovery_duration_seconds.observe(*ms as f64 / 1000.0);
                }
            }
            RecoveryEvent::RecoveryFailed { .. } => self
                .recovery_outcomes_total
                .with_label_values(&["failed"])
                .inc(),
            RecoveryEvent::RecoveryTimedOut { .. } => self
                .recovery_outcomes_total
                .with_label_values(&["timed_out"])
                .inc(),
            RecoveryEvent::JobPermanentlyFailed { .. } => self
                .recovery_outcomes_total
                .with_label_values(&["permanently_failed"])
                .inc(),
            RecoveryEvent::PatternDetected { severity, .. } => self
                .patterns_detected_total
                .with_label_values(&[severity.as_str()])
                .inc(),
            RecoveryEvent::RetryScheduled { .. } | RecoveryEvent::JobArchived { .. } => {}
        }
    }

    /// Refreshes the job gauges from a statistics snapshot covering all tenants.
    pub fn set_job_gauges(&self, stats: &DeadLetterJobStats) {
        for (status, count) in &stats.by_status {
            self.jobs_by_status
                .with_label_values(&[status.as_str()])
                .set(*count as f64);
        }
        self.overdue_jobs.set(stats.overdue_jobs as f64);
    }

    /// Records the duration of one sweep.
    pub fn observe_sweep(&self, secs: f64) {
        self.sweep_duration_seconds.observe(secs);
    }

    /// Returns the metrics in Prometheus text format.
    pub fn gather(&self) -> Result<String, NotificationError> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).map_err(prom_err)?;
        String::from_utf8(buffer).map_err(|e| NotificationError::PrometheusFailed(e.to_string()))
    }
}

/// HTTP server for Prometheus metrics.
pub struct MetricsServer {
    /// Metrics instance.
    metrics: Arc<Metrics>,
    /// Port to listen on.
    port: u16,
}

impl MetricsServer {
    /// Creates a new metrics server.
    pub fn new(metrics: Arc<Metrics>, port: u16) -> Self {
        Self { metrics, port }
    }

    /// Starts the metrics HTTP server.
    pub async fn start(self) -> Result<(), NotificationError> {
        use http_body_util::Full;
        use hyper::body::Bytes;
        use hyper::server::conn::http1;
        use hyper::service::service_fn;
        use hyper::{body::Incoming, Request, Response, StatusCode};
        use hyper_util::rt::TokioIo;

        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| NotificationError::PrometheusFailed(e.to_string()))?;

        info!(port = self.port, "Starting Prometheus metrics server");

        let metrics = self.metrics.clone();

        loop {
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|e| NotificationError::PrometheusFailed(e.to_string()))?;

            let io = TokioIo::new(stream);
            let metrics = metrics.clone();

            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| {
                    let metrics = metrics.clone();
                    async move {
                        let (status, body) = if req.uri().path() != "/metrics" {
                            (StatusCode::NOT_FOUND, "Not Found".to_string())
                        } else {
                            match metrics.gather() {
                                Ok(body) => (StatusCode::OK, body),
                                Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                            }
                        };
                        let mut response = Response::new(Full::new(Bytes::from(body)));
                        *response.status_mut() = status;
                        Ok::<_, hyper::Error>(response)
                    }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!(error = %e, "Error serving connection");
                }
            });
        }
    }
}

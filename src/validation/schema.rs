//! Structural checks: required values and numeric ranges.

use crate::config::model::{AppConfig, StoreBackend};
use super::{ValidationIssue, ValidationResult};

/// Validates required fields and numeric ranges.
pub fn validate(config: &AppConfig) -> ValidationResult {
    let mut result = ValidationResult::new();
    let recovery = &config.recovery;

    if recovery.sweep_interval_seconds == 0 {
        result.add(ValidationIssue::error(
            "recovery.sweep_interval_seconds",
            "Sweep interval must be at least 1 second",
        ));
    }

    if recovery.batch_size == 0 {
        result.add(ValidationIssue::error(
            "recovery.batch_size",
            "Batch size must be at least 1",
        ));
    }

    if recovery.dispatch_concurrency == 0 {
        result.add(ValidationIssue::error(
            "recovery.dispatch_concurrency",
            "Dispatch concurrency must be at least 1",
        ));
    }

    if recovery.watchdog_ceiling_seconds == 0 {
        result.add(ValidationIssue::error(
            "recovery.watchdog_ceiling_seconds",
            "Watchdog ceiling must be at least 1 second",
        ));
    } else if recovery.watchdog_ceiling_seconds < recovery.sweep_interval_seconds {
        result.add(
            ValidationIssue::warning(
                "recovery.watchdog_ceiling_seconds",
                "Watchdog ceiling is shorter than the sweep interval",
            )
            .with_suggestion("Attempts may be timed out before their outcome is recorded"),
        );
    }

    let window = &config.business_hours.window;
    if window.start_hour >= window.end_hour || window.end_hour > 24 {
        result.add(
            ValidationIssue::error(
                "business_hours.window",
                format!(
                    "Business window {}:00-{}:00 is empty or out of range",
                    window.start_hour, window.end_hour
                ),
            )
            .with_suggestion("Use hours between 0 and 24 with start before end"),
        );
    }

    if window.reduced_start_hour >= window.reduced_end_hour
        || window.reduced_start_hour < window.start_hour
        || window.reduced_end_hour > window.end_hour
    {
        result.add(
            ValidationIssue::error(
                "business_hours.window",
                format!(
                    "Reduced window {}:00-{}:00 must lie inside the business window",
                    window.reduced_start_hour, window.reduced_end_hour
                ),
            ),
        );
    }

    if config.patterns.min_similar_jobs == 0 {
        result.add(ValidationIssue::error(
            "patterns.min_similar_jobs",
            "Minimum similar jobs must be at least 1",
        ));
    }

    if config.patterns.window_hours == 0 {
        result.add(ValidationIssue::error(
            "patterns.window_hours",
            "Pattern window must be at least 1 hour",
        ));
    }

    if config.store.backend == StoreBackend::Redis && config.global.redis.host.trim().is_empty() {
        result.add(
            ValidationIssue::error("global.redis.host", "Redis host is required")
                .with_suggestion("Set global.redis.host or use the memory store backend"),
        );
    }

    if config.queue.intake_enabled && config.global.redis.host.trim().is_empty() {
        result.add(ValidationIssue::error(
            "global.redis.host",
            "Redis host is required when intake is enabled",
        ));
    }

    result
}

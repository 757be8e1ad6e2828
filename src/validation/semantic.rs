//! Semantic validation for configuration values.

use std::sync::OnceLock;

use chrono_tz::{Tz, TZ_VARIANTS};
use regex::Regex;

use crate::config::model::AppConfig;

use super::{ValidationIssue, ValidationResult};

/// Key and queue names accepted by the Redis backends.
fn name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_:.\-]+$").ok())
        .as_ref()
}

/// Validates semantic correctness of configuration values.
pub fn validate(config: &AppConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_log_level(&config.global.log_level, &mut result);
    validate_timezone(&config.business_hours.default_timezone, &mut result);

    for (i, period) in config.business_hours.restricted_periods.iter().enumerate() {
        if period.start > period.end {
            result.add(ValidationIssue::error(
                format!("business_hours.restricted_periods[{}]", i),
                format!(
                    "Restricted period '{}' ends ({}) before it starts ({})",
                    period.name, period.end, period.start
                ),
            ));
        }
    }

    let names = [
        ("store.key_prefix", config.store.key_prefix.as_str()),
        ("queue.prefix", config.queue.prefix.as_str()),
        ("queue.intake_key", config.queue.intake_key.as_str()),
    ];
    for (path, value) in names {
        if !name_pattern().map_or(true, |re| re.is_match(value)) {
            result.add(
                ValidationIssue::error(path, format!("Invalid key name: '{}'", value))
                    .with_suggestion("Use letters, digits and _ : . - only"),
            );
        }
    }

    if let Some(discord) = &config.notifications.discord {
        if !discord.webhook_url.starts_with("https://") {
            result.add(
                ValidationIssue::error(
                    "notifications.discord.webhook_url",
                    "Discord webhook URL must use https",
                ),
            );
        }
    }

    result
}

fn validate_log_level(level: &str, result: &mut ValidationResult) {
    const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
    if !LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
        result.add(
            ValidationIssue::warning(
                "global.log_level",
                format!("Unknown log level '{}', falling back to info", level),
            )
            .with_suggestion(format!("Valid levels: {}", LEVELS.join(", "))),
        );
    }
}

fn validate_timezone(name: &str, result: &mut ValidationResult) {
    if name.parse::<Tz>().is_ok() {
        return;
    }

    result.add(
        ValidationIssue::error(
            "business_hours.default_timezone",
            format!("Unknown timezone: '{}'", name),
        )
        .with_suggestion(format!("Did you mean '{}'?", suggest_timezone(name))),
    );
}

/// Suggests the closest IANA timezone name.
fn suggest_timezone(input: &str) -> &'static str {
    let input_lower = input.to_lowercase();

    TZ_VARIANTS
        .iter()
        .map(|tz| tz.name())
        .min_by_key(|name| strsim::levenshtein(&input_lower, &name.to_lowercase()))
        .unwrap_or("UTC")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{DiscordConfig, DiscordEvents};

    #[test]
    fn misspelled_timezone_gets_a_suggestion() {
        let mut config = AppConfig::default();
        config.business_hours.default_timezone = "Asia/Jakarat".into();

        let result = validate(&config);
        let issue = result.errors().next().unwrap();
        assert_eq!(issue.path, "business_hours.default_timezone");
        assert_eq!(issue.suggestion.as_deref(), Some("Did you mean 'Asia/Jakarta'?"));
    }

    #[test]
    fn key_names_must_be_plain() {
        let mut config = AppConfig::default();
        config.queue.intake_key = "queue exhausted".into();

        let result = validate(&config);
        assert_eq!(result.errors().next().unwrap().path, "queue.intake_key");
    }

    #[test]
    fn discord_requires_https() {
        let mut config = AppConfig::default();
        config.notifications.discord = Some(DiscordConfig {
            webhook_url: "http://discord.example/hook".into(),
            events: DiscordEvents::default(),
            mention_on_critical: None,
        });

        assert!(!validate(&config).is_valid());
    }
}

//! Discord webhook notifications.

use serde::Serialize;
use tracing::{error, info};

use crate::config::model::{DiscordConfig, DiscordEvents};
use crate::error::NotificationError;
use crate::notify::events::RecoveryEvent;
use crate::recovery::pattern::PatternSeverity;

/// Sends recovery alerts to Discord via webhook.
pub struct DiscordNotifier {
    /// Webhook URL.
    webhook_url: String,
    /// Event configuration.
    events: DiscordEvents,
    /// Optional user ID to mention on critical alerts.
    mention_on_critical: Option<String>,
    /// HTTP client.
    client: reqwest::Client,
}

impl DiscordNotifier {
    /// Creates a new Discord notifier from config.
    pub fn new(config: &DiscordConfig) -> Self {
        Self {
            webhook_url: config.webhook_url.clone(),
            events: config.events.clone(),
            mention_on_critical: config.mention_on_critical.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// Sends the alert for `event`, if it has one and it is enabled.
    pub async fn handle(&self, event: &RecoveryEvent) -> Result<(), NotificationError> {
        match self.message_for(event) {
            Some((embed, mention)) => {
                let content = if mention {
                    self.mention_on_critical.clone().unwrap_or_default()
                } else {
                    String::new()
                };
                self.send_embed_with_content(embed, &content).await
            }
            None => Ok(()),
        }
    }

    /// Builds the embed for an event. The flag asks for the critical mention.
    fn message_for(&self, event: &RecoveryEvent) -> Option<(DiscordEmbed, bool)> {
        match event {
            RecoveryEvent::JobPermanentlyFailed {
                tenant_id,
                job_id,
                queue,
                job_type,
                failure_type,
                retry_count,
                reason,
            } if self.events.on_permanent_failure => Some((
                DiscordEmbed {
                    title: "Job Permanently Failed".to_string(),
                    color: 0x800000, // Dark red
                    fields: vec![
                        field("Tenant", tenant_id, true),
                        field("Queue", queue, true),
                        field("Job Type", job_type, true),
                        field("Job ID", &job_id.to_string(), false),
                        field("Failure Type", failure_type.as_str(), true),
                        field("Retries", &retry_count.to_string(), true),
                        field("Reason", &truncate(reason, 1024), false),
                    ],
                },
                true,
            )),

            RecoveryEvent::PatternDetected {
                tenant_id,
                pattern_type,
                severity,
                queue,
                failure_type,
                occurrence_count,
                created,
                ..
            } if self.events.on_pattern && *severity >= PatternSeverity::High => Some((
                DiscordEmbed {
                    title: if *created {
                        "Failure Pattern Detected".to_string()
                    } else {
                        "Failure Pattern Recurring".to_string()
                    },
                    color: severity_color(*severity),
                    fields: vec![
                        field("Tenant", tenant_id, true),
                        field("Queue", queue, true),
                        field("Pattern", pattern_type.as_str(), true),
                        field("Severity", severity.as_str(), true),
                        field("Failure Type", failure_type.as_str(), true),
                        field("Occurrences", &occurrence_count.to_string(), true),
                    ],
                },
                *severity == PatternSeverity::Critical,
            )),

            RecoveryEvent::JobQuarantined {
                tenant_id,
                job_id,
                queue,
                job_type,
                failure_type,
                is_critical: true,
                reason,
                ..
            } if self.events.on_critical_quarantine => Some((
                DiscordEmbed {
                    title: "Critical Job Quarantined".to_string(),
                    color: 0xFF0000, // Red
                    fields: vec![
                        field("Tenant", tenant_id, true),
                        field("Queue", queue, true),
                        field("Job Type", job_type, true),
                        field("Job ID", &job_id.to_string(), false),
                        field("Failure Type", failure_type.as_str(), true),
                        field("Reason", &truncate(reason, 1024), false),
                    ],
                },
                true,
            )),

            RecoveryEvent::JobRecovered {
                tenant_id,
                job_id,
                failure_type,
                duration_ms,
                ..
            } if self.events.on_recovered => Some((
                DiscordEmbed {
                    title: "Job Recovered".to_string(),
                    color: 0x00FF00, // Green
                    fields: vec![
                        field("Tenant", tenant_id, true),
                        field("Job ID", &job_id.to_string(), false),
                        field("Failure Type", failure_type.as_str(), true),
                        field(
                            "Duration",
                            &duration_ms
                                .map(|ms| format_duration(ms as f64 / 1000.0))
                                .unwrap_or_else(|| "N/A".to_string()),
                            true,
                        ),
                    ],
                },
                false,
            )),

            _ => None,
        }
    }

    /// Sends an embed with optional content text.
    async fn send_embed_with_content(
        &self,
        embed: DiscordEmbed,
        content: &str,
    ) -> Result<(), NotificationError> {
        let payload = DiscordPayload {
            content: if content.is_empty() { None } else { Some(content.to_string()) },
            embeds: vec![embed],
        };

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            error!(status = %status, body = %text, "Discord webhook failed");
            return Err(NotificationError::DiscordFailed(format!(
                "HTTP {}: {}",
                status, text
            )));
        }

        info!("Discord notification sent");
        Ok(())
    }
}

/// Discord webhook payload.
#[derive(Serialize)]
struct DiscordPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    embeds: Vec<DiscordEmbed>,
}

/// Discord embed structure.
#[derive(Debug, Serialize)]
struct DiscordEmbed {
    title: String,
    color: u32,
    fields: Vec<EmbedField>,
}

/// Discord embed field.
#[derive(Debug, Serialize)]
struct EmbedField {
    name: String,
    value: String,
    inline: bool,
}

fn field(name: &str, value: &str, inline: bool) -> EmbedField {
    EmbedField {
        name: name.to_string(),
        value: value.to_string(),
        inline,
    }
}

fn severity_color(severity: PatternSeverity) -> u32 {
    match severity {
        PatternSeverity::Critical => 0xFF0000,
        PatternSeverity::High => 0xFF8800,
        PatternSeverity::Medium => 0xFFCC00,
        PatternSeverity::Low => 0x0088FF,
    }
}

/// Formats a duration in seconds to a human-readable string.
fn format_duration(secs: f64) -> String {
    let hours = (secs / 3600.0) as u64;
    let minutes = ((secs % 3600.0) / 60.0) as u64;
    let seconds = (secs % 60.0) as u64;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Truncates a string to at most `max_len` bytes on a char boundary.
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len.saturating_sub(3);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

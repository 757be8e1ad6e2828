//! Validation report formatting.

use super::{ValidationIssue, ValidationResult, ValidationSeverity};

/// Formats a validation result for `config-validate` and the startup log.
pub fn format_report(result: &ValidationResult) -> String {
    let errors: Vec<_> = result.errors().collect();
    let warnings: Vec<_> = result.warnings().collect();

    if errors.is_empty() && warnings.is_empty() {
        return "Configuration is valid.".to_string();
    }

    let mut report = String::new();
    if !errors.is_empty() {
        report.push_str("\nConfig Validation Failed\n");
        report.push_str("========================\n\n");
    }

    for issue in errors.iter().chain(warnings.iter()) {
        report.push_str(&format_issue(issue));
        report.push('\n');
    }

    report.push_str(&format!(
        "---\n{} warning(s), {} error(s)\n",
        warnings.len(),
        errors.len()
    ));
    if !errors.is_empty() {
        report.push_str("Config rejected. Current config unchanged.\n");
    }

    report
}

fn format_issue(issue: &ValidationIssue) -> String {
    let prefix = match issue.severity {
        ValidationSeverity::Error => "ERROR",
        ValidationSeverity::Warning => "WARNING",
    };

    let mut output = format!("{} {}\n  └─ {}\n", prefix, issue.path, issue.message);
    if let Some(suggestion) = &issue.suggestion {
        output.push_str(&format!("     {}\n", suggestion));
    }
    output
}

/// One-line summary for reload logs.
pub fn format_brief_summary(result: &ValidationResult) -> String {
    let error_count = result.error_count();
    let warning_count = result.warnings().count();

    match (error_count, warning_count) {
        (0, 0) => "Configuration valid".to_string(),
        (0, w) => format!("Configuration valid with {} warning(s)", w),
        (e, w) => format!("Configuration invalid: {} error(s), {} warning(s)", e, w),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_lists_errors_before_warnings() {
        let mut result = ValidationResult::new();
        result.add(ValidationIssue::warning("global.log_level", "Unknown log level"));
        result.add(
            ValidationIssue::error("recovery.batch_size", "Batch size must be at least 1")
                .with_suggestion("Use 50"),
        );

        let report = format_report(&result);
        let error_at = report.find("ERROR recovery.batch_size").unwrap();
        let warning_at = report.find("WARNING global.log_level").unwrap();
        assert!(error_at < warning_at);
        assert!(report.contains("     Use 50"));
        assert!(report.contains("1 warning(s), 1 error(s)"));
        assert!(report.contains("Config rejected"));
    }

    #[test]
    fn brief_summary_counts() {
        let mut result = ValidationResult::new();
        assert_eq!(format_brief_summary(&result), "Configuration valid");

        result.add(ValidationIssue::warning("a", "b"));
        assert_eq!(
            format_brief_summary(&result),
            "Configuration valid with 1 warning(s)"
        );
    }
}

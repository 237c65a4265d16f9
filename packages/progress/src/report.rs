//! Text reports and failure recovery.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use chirps_cog_pipeline_models::{FailedItemReport, GlobalProgressSummary, ProgressRecord, WorkItem};
use chrono::{DateTime, Utc};

const RULE_WIDTH: usize = 60;

/// Formats `n` with comma thousands separators.
fn grouped(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Renders the status report printed by `status`.
#[must_use]
pub fn render_summary(summary: &GlobalProgressSummary, now: DateTime<Utc>) -> String {
    let rule = "=".repeat(RULE_WIDTH);
    let mut out = String::new();

    let _ = writeln!(out, "{rule}");
    let _ = writeln!(
        out,
        "CHIRPS Processing Progress - {}",
        now.format("%Y-%m-%d %H:%M:%S")
    );
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "Files Completed: {}", grouped(summary.total_completed));
    let _ = writeln!(out, "Files Failed: {}", grouped(summary.total_failed));
    let _ = writeln!(out, "Estimated Total: {}", grouped(summary.estimated_total));
    let _ = writeln!(out, "Progress: {:.1}%", summary.completion_percentage);
    let _ = writeln!(out, "Active Tasks: {}", summary.active_tasks);
    let _ = writeln!(out, "Total Tasks: {}", summary.total_tasks);

    if summary.skipped_records > 0 {
        let _ = writeln!(out, "Unreadable Records: {}", summary.skipped_records);
    }

    if !summary.stalled_tasks.is_empty() {
        let ids: Vec<&str> = summary.stalled_tasks.iter().map(|t| t.as_str()).collect();
        let _ = writeln!(out, "\nStalled Tasks (no recent checkpoint): {}", ids.join(", "));
    }

    out
}

/// Lists every failed item across `records`, one row per failure.
#[must_use]
pub fn failed_items_report(records: &[ProgressRecord]) -> Vec<FailedItemReport> {
    records
        .iter()
        .flat_map(|record| {
            record.failed_files.iter().map(|failed| FailedItemReport {
                task_id: record.task_id.clone(),
                item: failed.item.clone(),
                error: failed.error.clone(),
                timestamp: record.iso_timestamp,
            })
        })
        .collect()
}

/// Renders the failed-items report printed by `status --failed`.
#[must_use]
pub fn render_failed_report(report: &[FailedItemReport]) -> String {
    let mut out = format!("Found {} failed files:\n", report.len());
    for row in report {
        let _ = writeln!(
            out,
            "Task {}: {} ({}) - {}",
            row.task_id, row.item.source_url, row.item.year, row.error
        );
    }
    out
}

/// Builds a new item list from a failed-items report.
///
/// Items are deduplicated by URL, since a task re-run after a crash may
/// list the same failure twice. First-seen order is kept.
#[must_use]
pub fn recovery_items(report: &[FailedItemReport]) -> Vec<WorkItem> {
    let mut seen = BTreeSet::new();
    report
        .iter()
        .filter(|row| seen.insert(row.item.source_url.as_str()))
        .map(|row| row.item.clone())
        .collect()
}

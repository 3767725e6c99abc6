use std::fmt::Write as _;

use sqlshift_db::{MigrationState, MigrationStatus, RunReport};

pub fn render_pending(pending: &[String]) -> String {
    if pending.is_empty() {
        return "none pending\n".to_string();
    }

    let mut out = format!(
        "{} pending migration{}:\n",
        pending.len(),
        if pending.len() == 1 { "" } else { "s" }
    );
    for filename in pending {
        let _ = writeln!(out, "  {filename}");
    }
    out
}

pub fn render_run(report: &RunReport) -> String {
    if report.is_empty() {
        return "schema is up to date, nothing applied\n".to_string();
    }

    let width = report
        .applied
        .iter()
        .map(|m| m.filename.len())
        .max()
        .unwrap_or(0);
    let mut out = format!("applied {}:\n", report.applied.len());
    for m in &report.applied {
        let _ = writeln!(out, "  {:<width$}  {:>6} ms", m.filename, m.duration_ms);
    }
    out
}

pub fn render_status(statuses: &[MigrationStatus]) -> String {
    if statuses.is_empty() {
        return "no migrations found\n".to_string();
    }

    let width = statuses
        .iter()
        .map(|s| s.filename.len())
        .max()
        .unwrap_or(0)
        .max("FILENAME".len());

    let mut out = String::new();
    let _ = writeln!(out, "{:<width$}  {:<8}  APPLIED AT", "FILENAME", "STATE");
    for status in statuses {
        let state = match &status.state {
            MigrationState::Applied => "applied",
            MigrationState::Pending => "pending",
            MigrationState::Drifted { .. } => "DRIFTED",
            MigrationState::Missing => "missing",
        };
        let applied_at = status
            .applied_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(out, "{:<width$}  {state:<8}  {applied_at}", status.filename);
    }

    let drifted = statuses
        .iter()
        .filter(|s| matches!(s.state, MigrationState::Drifted { .. }))
        .count();
    if drifted > 0 {
        let _ = writeln!(
            out,
            "\n{drifted} applied migration(s) changed on disk; `run` will refuse until they are restored"
        );
    }
    out
}

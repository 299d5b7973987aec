//! Output formatting utilities for the CLI
//!
//! Tables for sessions, jobs and events, the status display, and colored
//! status messages.

use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tabled::{
    settings::{Style, Width},
    Table, Tabled,
};

use hd_core::time::format_duration;
use hd_core::types::{Event, EventKind, JobRecord, JobStatus};

use crate::ipc::{DaemonStatus, SessionInfo};

/// Format daemon status as a human-readable string
pub fn format_status(status: &DaemonStatus) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "Daemon Status: {}\n",
        if status.running { "Running" } else { "Stopped" }
    ));
    output.push_str(&format!("Version: {}\n", status.version));
    output.push_str(&format!(
        "Uptime: {}\n",
        format_duration(Duration::from_secs(status.uptime_secs))
    ));
    output.push_str(&format!("Open Sessions: {}\n", status.session_count));
    output.push_str(&format!(
        "Jobs: {} ({} running)\n",
        status.job_count, status.running_jobs
    ));
    output.push_str(&format!(
        "Events: {} ({} unread)\n",
        status.event_count, status.unread_events
    ));
    output.push_str(&format!("Backup Directory: {}\n", status.backup_dir));

    output
}

/// Format open sessions as a table
pub fn format_sessions(sessions: &[SessionInfo]) -> String {
    if sessions.is_empty() {
        return "No open sessions".to_string();
    }

    #[derive(Tabled)]
    struct SessionRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "SHELL")]
        shell: String,
        #[tabled(rename = "STATE")]
        state: String,
        #[tabled(rename = "SIZE")]
        size: String,
        #[tabled(rename = "OPENED")]
        opened: String,
    }

    let rows: Vec<_> = sessions
        .iter()
        .map(|s| SessionRow {
            id: s.id.to_string(),
            pid: s.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            shell: truncate(&s.shell, 24),
            state: s.state.clone(),
            size: format!("{}x{}", s.size.cols, s.size.rows),
            opened: format_time(s.created_at),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Format jobs as a table, in the order given
pub fn format_jobs(jobs: &[JobRecord]) -> String {
    if jobs.is_empty() {
        return "No jobs".to_string();
    }

    #[derive(Tabled)]
    struct JobRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "STATUS")]
        status: String,
        #[tabled(rename = "PROGRESS")]
        progress: String,
        #[tabled(rename = "SIZE")]
        size: String,
        #[tabled(rename = "CREATED")]
        created: String,
        #[tabled(rename = "NOTES")]
        notes: String,
    }

    let rows: Vec<_> = jobs
        .iter()
        .map(|job| JobRow {
            id: job.id.to_string(),
            status: job.status.to_string(),
            progress: format!("{}%", job.progress),
            size: job_size(job),
            created: format_time(job.created_at),
            notes: truncate(&job.notes, 30),
        })
        .collect();

    Table::new(rows)
        .with(Style::rounded())
        .with(Width::truncate(120))
        .to_string()
}

/// Detailed view of a single job
pub fn format_job(job: &JobRecord) -> String {
    let mut output = String::new();

    output.push_str(&format!("Job: {}\n", job.id));
    output.push_str(&format!("Kind: {}\n", job.kind));
    output.push_str(&format!("Status: {}\n", job.status));
    output.push_str(&format!("Progress: {}%\n", job.progress));
    output.push_str(&format!("Size: {}\n", job_size(job)));
    output.push_str(&format!("Created: {}\n", format_time(job.created_at)));
    if let Some(done) = job.completed_at {
        output.push_str(&format!("Finished: {}\n", format_time(done)));
    }
    if let Some(source) = &job.source {
        output.push_str(&format!("Source: {}\n", source));
    }
    if let Some(artifact) = &job.artifact {
        output.push_str(&format!("Archive: {}\n", artifact.display()));
    }
    if !job.notes.is_empty() {
        output.push_str(&format!("Notes: {}\n", job.notes));
    }
    if let Some(error) = &job.error {
        output.push_str(&format!("Error: {}\n", error));
    }

    output
}

fn job_size(job: &JobRecord) -> String {
    match job.status {
        JobStatus::Running | JobStatus::Pending if job.estimated_size > 0 => format!(
            "{} / ~{}",
            format_bytes(job.current_size),
            format_bytes(job.estimated_size)
        ),
        _ => format_bytes(job.current_size),
    }
}

/// Format events as a table, newest first
pub fn format_events(events: &[Event], unread: usize) -> String {
    if events.is_empty() {
        return "No events".to_string();
    }

    #[derive(Tabled)]
    struct EventRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = " ")]
        unread: &'static str,
        #[tabled(rename = "KIND")]
        kind: String,
        #[tabled(rename = "TITLE")]
        title: String,
        #[tabled(rename = "MESSAGE")]
        message: String,
        #[tabled(rename = "TIME")]
        time: String,
    }

    let rows: Vec<_> = events
        .iter()
        .map(|e| EventRow {
            id: e.id.to_string(),
            unread: if e.read { "" } else { "*" },
            kind: e.kind.to_string(),
            title: e.title.clone(),
            message: truncate(&e.message, 50),
            time: format_time(e.created_at),
        })
        .collect();

    let table = Table::new(rows).with(Style::rounded()).to_string();
    format!("{}\n{} unread", table, unread)
}

/// One-line rendering used by `events watch`
pub fn format_event_line(event: &Event) -> String {
    let marker = match event.kind {
        EventKind::Info => "ℹ",
        EventKind::Warning => "⚠",
        EventKind::Error => "✗",
        EventKind::Success => "✓",
    };
    format!(
        "{} [{}] #{} {}: {}",
        format_time(event.created_at),
        marker,
        event.id,
        event.title,
        event.message
    )
}

/// Bytes as B/KiB/MiB/GiB/TiB
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

fn format_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Truncate a string with ellipsis if too long
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red to stderr
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow to stderr
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

//! Backup and restore commands

use std::time::Duration;

use anyhow::Result;

use hd_core::types::JobStatus;

use super::confirm;
use crate::ipc::DaemonClient;
use crate::output::{
    format_bytes, format_job, format_jobs, print_error, print_info, print_success, print_warning,
};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Start a backup, optionally following it until it finishes
pub async fn backup_create(
    client: &mut DaemonClient,
    notes: Option<String>,
    wait: bool,
) -> Result<()> {
    let (job_id, estimated) = match client.create_backup(notes).await {
        Ok(created) => created,
        Err(e) => {
            print_error(&format!("Failed to start backup: {}", e));
            return Err(e);
        }
    };

    print_success(&format!(
        "Backup {} started (estimated {})",
        job_id,
        format_bytes(estimated)
    ));

    if !wait {
        print_info(&format!("Follow it with: hostdeck backup show {}", job_id));
        return Ok(());
    }

    let mut last_progress = None;
    loop {
        let job = client.get_job(&job_id).await?;

        if last_progress != Some(job.progress) && !job.is_terminal() {
            print_info(&format!(
                "{}% ({})",
                job.progress,
                format_bytes(job.current_size)
            ));
            last_progress = Some(job.progress);
        }

        match job.status {
            JobStatus::Completed => {
                print_success(&format!(
                    "Backup {} completed ({})",
                    job.id,
                    format_bytes(job.current_size)
                ));
                return Ok(());
            }
            JobStatus::Failed => {
                let reason = job.error.unwrap_or_else(|| "unknown error".to_string());
                print_error(&format!("Backup {} failed: {}", job.id, reason));
                anyhow::bail!("Backup failed");
            }
            JobStatus::Pending | JobStatus::Running => {}
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// List backup and restore jobs, newest first
pub async fn backup_list(client: &mut DaemonClient) -> Result<()> {
    let jobs = client.list_jobs().await?;
    println!("{}", format_jobs(&jobs));
    Ok(())
}

pub async fn backup_show(client: &mut DaemonClient, job_id: &str) -> Result<()> {
    let job = client.get_job(job_id).await?;
    print!("{}", format_job(&job));
    Ok(())
}

pub async fn backup_notes(client: &mut DaemonClient, job_id: &str, notes: &str) -> Result<()> {
    client.set_notes(job_id, notes).await?;
    print_success(&format!("Updated notes for {}", job_id));
    Ok(())
}

/// Delete finished jobs and their archives
pub async fn backup_delete(client: &mut DaemonClient, job_ids: &[String], force: bool) -> Result<()> {
    if !force && !confirm(&format!("Delete {} job(s) and their archives?", job_ids.len()))? {
        print_warning("Aborted");
        return Ok(());
    }

    let mut failures = 0;
    for job_id in job_ids {
        match client.delete_job(job_id).await {
            Ok(()) => print_success(&format!("Deleted {}", job_id)),
            Err(e) => {
                print_error(&format!("Failed to delete {}: {}", job_id, e));
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("Failed to delete {} job(s)", failures);
    }
    Ok(())
}

/// Restore the host from a completed backup; the host reboots afterwards
pub async fn backup_restore(client: &mut DaemonClient, job_id: &str, yes: bool) -> Result<()> {
    if !yes {
        print_warning(&format!(
            "Restoring {} overwrites files on the host and reboots it.",
            job_id
        ));
        if !confirm("Continue?")? {
            print_warning("Aborted");
            return Ok(());
        }
    }

    match client.restore(job_id).await {
        Ok(restore_id) => {
            print_success(&format!("Restore {} accepted", restore_id));
            print_info("The daemon will extract the archive and reboot the host");
            Ok(())
        }
        Err(e) => {
            print_error(&format!("Restore rejected: {}", e));
            Err(e)
        }
    }
}

//! Interactive shell and session management commands

use anyhow::Result;

use hd_protocol::{SessionId, TerminalSize};

use crate::ipc::{DaemonClient, SessionEnd};
use crate::output::{format_sessions, print_error, print_info, print_success, print_warning};

/// Open a shell on the daemon host and attach the local terminal to it
pub async fn shell_command(mut client: DaemonClient) -> Result<Option<i32>> {
    // Make sure we can talk to the daemon before touching the terminal
    client.connect().await?;

    let size = crossterm::terminal::size()
        .ok()
        .map(|(cols, rows)| TerminalSize::new(rows, cols))
        .filter(TerminalSize::is_valid);

    let session = match client.open_session(size).await {
        Ok(s) => s,
        Err(e) => {
            print_error(&format!("Failed to open shell: {}", e));
            return Err(e);
        }
    };

    print_info(&format!(
        "Session {} opened ({}x{}). Press Ctrl+] to detach.",
        session.session_id(),
        session.size().cols,
        session.size().rows
    ));

    let end = session.run().await?;

    // Raw mode is off again; start on a clean line
    println!();
    match end {
        SessionEnd::Detached => {
            print_success("Detached; the shell was closed");
            Ok(None)
        }
        SessionEnd::Ended { exit_code, reason } => {
            match exit_code {
                Some(code) => print_info(&format!("Shell ended ({}), exit code {}", reason, code)),
                None => print_info(&format!("Shell ended ({})", reason)),
            }
            Ok(exit_code)
        }
        SessionEnd::Disconnected => {
            print_warning("Connection to the daemon was lost");
            Ok(None)
        }
    }
}

/// List open sessions
pub async fn sessions_list(client: &mut DaemonClient) -> Result<()> {
    let sessions = client.list_sessions().await?;
    println!("{}", format_sessions(&sessions));
    Ok(())
}

/// Close sessions by id
pub async fn sessions_close(client: &mut DaemonClient, ids: &[u32]) -> Result<()> {
    let mut failures = 0;

    for &id in ids {
        match client.close_session(SessionId(id)).await {
            Ok(()) => print_success(&format!("Closed session {}", SessionId(id))),
            Err(e) => {
                print_error(&format!("Failed to close session {}: {}", SessionId(id), e));
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("Failed to close {} session(s)", failures);
    }
    Ok(())
}

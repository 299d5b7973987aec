//! Shell selection

use std::path::Path;

use hd_core::error::SessionError;

/// Shells that may be spawned without appearing in /etc/shells
const ALLOWED_SHELLS: &[&str] = &[
    "/bin/sh",
    "/bin/bash",
    "/bin/zsh",
    "/bin/fish",
    "/bin/dash",
    "/bin/ksh",
    "/usr/bin/sh",
    "/usr/bin/bash",
    "/usr/bin/zsh",
    "/usr/bin/fish",
    "/usr/bin/dash",
    "/usr/bin/ksh",
    "/usr/local/bin/bash",
    "/usr/local/bin/zsh",
    "/usr/local/bin/fish",
];

const FALLBACK_SHELL: &str = "/bin/sh";

fn listed_in_etc_shells(shell: &str) -> bool {
    std::fs::read_to_string("/etc/shells")
        .map(|shells| {
            shells
                .lines()
                .map(str::trim)
                .any(|line| !line.starts_with('#') && line == shell)
        })
        .unwrap_or(false)
}

/// Check that `shell` is a known login shell that exists on disk
pub fn validate_shell_path(shell: &str) -> Result<String, SessionError> {
    let allowed = ALLOWED_SHELLS.contains(&shell) || listed_in_etc_shells(shell);
    if !allowed {
        return Err(SessionError::ShellNotAllowed(format!(
            "{} is neither a well-known shell nor listed in /etc/shells",
            shell
        )));
    }

    if !Path::new(shell).exists() {
        return Err(SessionError::ShellNotAllowed(format!(
            "{} does not exist",
            shell
        )));
    }

    Ok(shell.to_string())
}

/// Pick the shell for a new session
///
/// A configured shell must validate. Otherwise `$SHELL` is used when it
/// validates, falling back to `/bin/sh`.
pub fn resolve_shell(configured: Option<&str>) -> Result<String, SessionError> {
    if let Some(shell) = configured {
        return validate_shell_path(shell);
    }

    if let Ok(shell) = std::env::var("SHELL") {
        match validate_shell_path(&shell) {
            Ok(shell) => return Ok(shell),
            Err(e) => tracing::warn!("Ignoring $SHELL: {}", e),
        }
    }

    validate_shell_path(FALLBACK_SHELL)
}

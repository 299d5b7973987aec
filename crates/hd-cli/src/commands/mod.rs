//! CLI command implementations

mod backup;
mod events;
mod shell;
mod status;

pub use backup::{
    backup_create, backup_delete, backup_list, backup_notes, backup_restore, backup_show,
};
pub use events::{events_clear, events_delete, events_list, events_read, events_watch};
pub use shell::{sessions_close, sessions_list, shell_command};
pub use status::status_command;

use std::io::Write;

/// Ask a yes/no question on the terminal; anything but `y` is no
pub(crate) fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{} [y/N] ", prompt);
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

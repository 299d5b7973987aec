//! Event feed commands

use anyhow::Result;

use hd_core::ipc::IpcEvent;
use hd_core::types::{EventId, ReadTarget};

use crate::ipc::DaemonClient;
use crate::output::{format_event_line, format_events, print_success, print_warning};

pub async fn events_list(client: &mut DaemonClient, unread_only: bool) -> Result<()> {
    let (events, unread) = client.list_events().await?;
    let events: Vec<_> = if unread_only {
        events.into_iter().filter(|e| !e.read).collect()
    } else {
        events
    };
    println!("{}", format_events(&events, unread));
    Ok(())
}

/// Print the current events, then follow new ones until the daemon goes away
pub async fn events_watch(client: &mut DaemonClient) -> Result<()> {
    client.subscribe_events().await?;

    while let Some(event) = client.next_event().await? {
        match event {
            IpcEvent::EventsSnapshot { events, .. } => {
                // Snapshot is newest first; print oldest first like the live feed
                for event in events.iter().rev() {
                    println!("{}", format_event_line(event));
                }
            }
            IpcEvent::EventAppended(event) => println!("{}", format_event_line(&event)),
            IpcEvent::EventsDropped { reason } => {
                print_warning(&format!("Event feed dropped: {}", reason));
                anyhow::bail!("Event feed dropped: {}", reason);
            }
        }
    }

    print_warning("Daemon closed the connection");
    Ok(())
}

pub async fn events_read(client: &mut DaemonClient, target: ReadTarget) -> Result<()> {
    client.mark_read(target).await?;
    match target {
        ReadTarget::All => print_success("Marked all events read"),
        ReadTarget::Event(id) => print_success(&format!("Marked event {} read", id)),
    }
    Ok(())
}

pub async fn events_delete(client: &mut DaemonClient, ids: &[u64]) -> Result<()> {
    for &id in ids {
        client.delete_event(EventId(id)).await?;
        print_success(&format!("Deleted event {}", id));
    }
    Ok(())
}

pub async fn events_clear(client: &mut DaemonClient) -> Result<()> {
    client.clear_events().await?;
    print_success("Cleared all events");
    Ok(())
}

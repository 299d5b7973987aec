//! Event log and subscriber fan-out
//!
//! All mutation goes through one mutex. Appends push to subscribers with
//! `try_send` while the lock is held, so every subscriber sees events in
//! append order and a slow subscriber never blocks an append; a subscriber
//! whose queue is full is dropped instead.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use hd_core::config::EventsConfig;
use hd_core::error::EventError;
use hd_core::types::{Event, EventId, EventKind, JobId, ReadTarget};

/// Message delivered to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// The whole log, newest first
    Snapshot {
        events: Vec<Event>,
        unread_count: usize,
    },
    /// One newly appended event
    Appended(Event),
}

/// Identifies a subscription for `unsubscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live feed; the receiver yields `None` once the hub drops it
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub receiver: mpsc::Receiver<HubMessage>,
}

struct HubInner {
    /// Oldest first
    events: VecDeque<Event>,
    next_id: u64,
    subscribers: HashMap<SubscriberId, mpsc::Sender<HubMessage>>,
}

impl HubInner {
    fn newest_first(&self) -> Vec<Event> {
        self.events.iter().rev().cloned().collect()
    }

    fn snapshot(&self) -> HubMessage {
        HubMessage::Snapshot {
            events: self.newest_first(),
            unread_count: self.unread_count(),
        }
    }

    fn unread_count(&self) -> usize {
        self.events.iter().filter(|e| !e.read).count()
    }

    /// Offer a message to every subscriber, dropping those that cannot take it
    fn broadcast(&mut self, message: HubMessage) {
        self.subscribers
            .retain(|id, tx| match tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("Dropping slow event subscriber {}", id);
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("Event subscriber {} went away", id);
                    false
                }
            });
    }
}

/// The event hub
pub struct EventHub {
    inner: Mutex<HubInner>,
    capacity: usize,
    queue_size: usize,
}

impl EventHub {
    pub fn new(config: &EventsConfig) -> Self {
        Self {
            inner: Mutex::new(HubInner {
                events: VecDeque::with_capacity(config.capacity),
                next_id: 1,
                subscribers: HashMap::new(),
            }),
            capacity: config.capacity.max(1),
            queue_size: config.subscriber_queue.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record an event and push it to every subscriber
    ///
    /// Never fails; the oldest events are evicted beyond capacity.
    pub fn append(
        &self,
        kind: EventKind,
        title: impl Into<String>,
        message: impl Into<String>,
        extra: Map<String, Value>,
    ) -> Event {
        let mut inner = self.lock();

        let event = Event {
            id: EventId(inner.next_id),
            kind,
            title: title.into(),
            message: message.into(),
            created_at: hd_core::time::now(),
            read: false,
            extra,
        };
        inner.next_id += 1;

        inner.events.push_back(event.clone());
        while inner.events.len() > self.capacity {
            inner.events.pop_front();
        }

        inner.broadcast(HubMessage::Appended(event.clone()));

        tracing::debug!("Event {} [{}] {}", event.id, event.kind, event.title);
        event
    }

    /// Events newest first, with the unread count
    pub fn list(&self) -> (Vec<Event>, usize) {
        let inner = self.lock();
        (inner.newest_first(), inner.unread_count())
    }

    pub fn unread_count(&self) -> usize {
        self.lock().unread_count()
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    /// Mark one event or all events read; returns how many changed
    pub fn mark_read(&self, target: ReadTarget) -> Result<usize, EventError> {
        let mut inner = self.lock();

        let changed = match target {
            ReadTarget::All => {
                let mut changed = 0;
                for event in inner.events.iter_mut().filter(|e| !e.read) {
                    event.read = true;
                    changed += 1;
                }
                changed
            }
            ReadTarget::Event(id) => {
                let event = inner
                    .events
                    .iter_mut()
                    .find(|e| e.id == id)
                    .ok_or(EventError::NotFound(id))?;
                let changed = !event.read;
                event.read = true;
                usize::from(changed)
            }
        };

        let snapshot = inner.snapshot();
        inner.broadcast(snapshot);
        Ok(changed)
    }

    pub fn delete(&self, id: EventId) -> Result<(), EventError> {
        let mut inner = self.lock();

        let index = inner
            .events
            .iter()
            .position(|e| e.id == id)
            .ok_or(EventError::NotFound(id))?;
        inner.events.remove(index);

        let snapshot = inner.snapshot();
        inner.broadcast(snapshot);
        Ok(())
    }

    /// Remove every event; returns how many were removed
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let removed = inner.events.len();
        inner.events.clear();

        let snapshot = inner.snapshot();
        inner.broadcast(snapshot);
        removed
    }

    /// Start a feed primed with the current log
    pub fn subscribe(&self) -> Subscription {
        let mut inner = self.lock();
        let (tx, rx) = mpsc::channel(self.queue_size);
        let id = SubscriberId(Uuid::new_v4());

        // A fresh queue always has room for the priming snapshot
        if tx.try_send(inner.snapshot()).is_ok() {
            inner.subscribers.insert(id, tx);
        }

        Subscription { id, receiver: rx }
    }

    /// Stop a feed; returns false if it was already gone
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.lock().subscribers.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// `extra` fields linking an event to a job
pub fn job_extra(job_id: &JobId) -> Map<String, Value> {
    let mut extra = Map::new();
    extra.insert("jobId".to_string(), Value::String(job_id.to_string()));
    extra
}

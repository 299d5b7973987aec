//! Event hub: bounded in-memory log of operational events with live fan-out

mod hub;

pub use hub::{job_extra, EventHub, HubMessage, SubscriberId, Subscription};

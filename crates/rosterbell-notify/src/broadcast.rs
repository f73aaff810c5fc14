//! Realtime broadcaster: authorized pub/sub channels for state-change events.
//!
//! Publishers hold a cheap [`BroadcastHandle`] and never wait: `publish` is a
//! send on an unbounded channel. A background task fans each event out to the
//! per-channel `tokio::sync::broadcast` senders. Subscribing checks the
//! channel predicate once; a denied subscriber simply gets nothing.
//!
//! ```text
//!   publish() ──mpsc──▶ Broadcaster task ──┬──▶ employee.42 ──▶ Subscription
//!                                          └──▶ attendance  ──▶ Subscription
//! ```

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use rosterbell_core::config::BroadcastConfig;
use rosterbell_core::types::{Payload, Snapshot};

use crate::mailer::SendReceipt;
use crate::queue::NotificationJob;
use crate::records::AttendanceRecord;

/// Named channels. Anything else is unknown and never authorized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelName {
    /// `employee.{id}`: private to the employee with that id.
    Employee(i64),
    /// `attendance`: privileged roles only.
    Attendance,
    /// `admin`: privileged roles only.
    Admin,
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelName::Employee(id) => write!(f, "employee.{id}"),
            ChannelName::Attendance => f.write_str("attendance"),
            ChannelName::Admin => f.write_str("admin"),
        }
    }
}

impl FromStr for ChannelName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attendance" => Ok(ChannelName::Attendance),
            "admin" => Ok(ChannelName::Admin),
            _ => s
                .strip_prefix("employee.")
                .and_then(|id| id.parse().ok())
                .map(ChannelName::Employee)
                .ok_or_else(|| format!("Unknown channel: '{s}'")),
        }
    }
}

/// Identity of a connecting client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    /// Linked employee record, if the user has one.
    pub employee_id: Option<i64>,
    pub roles: Vec<String>,
}

impl Subscriber {
    pub fn new(employee_id: Option<i64>, roles: &[&str]) -> Self {
        Self {
            employee_id,
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }
}

/// Channel-level authorization predicates.
#[derive(Debug, Clone)]
pub struct ChannelAuthorizer {
    privileged_roles: Vec<String>,
}

impl ChannelAuthorizer {
    pub fn new(privileged_roles: Vec<String>) -> Self {
        Self { privileged_roles }
    }

    pub fn authorize(&self, subscriber: &Subscriber, channel: &ChannelName) -> bool {
        match channel {
            ChannelName::Employee(id) => subscriber.employee_id == Some(*id),
            ChannelName::Attendance | ChannelName::Admin => subscriber
                .roles
                .iter()
                .any(|r| self.privileged_roles.contains(r)),
        }
    }
}

/// A state-change event with a flat payload snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEvent {
    pub name: String,
    pub channels: Vec<ChannelName>,
    pub payload: Payload,
    pub occurred_at: DateTime<Utc>,
}

impl BroadcastEvent {
    pub fn new(name: &str, channels: Vec<ChannelName>, payload: Payload) -> Self {
        Self {
            name: name.to_string(),
            channels,
            payload,
            occurred_at: Utc::now(),
        }
    }

    /// `attendance.clocked_in` on the employee's channel and `attendance`.
    pub fn clocked_in(record: &AttendanceRecord) -> Self {
        Self::new(
            "attendance.clocked_in",
            vec![ChannelName::Employee(record.employee_id), ChannelName::Attendance],
            record.snapshot(),
        )
    }

    /// `notification.sent` on the recipient's private channel.
    pub fn notification_sent(job: &NotificationJob, receipt: &SendReceipt) -> Self {
        let payload = Payload::new()
            .with("job_id", job.id.as_str())
            .with("kind", job.kind.as_str())
            .with("email", job.recipient.email.as_str())
            .with("attempts", job.attempts as i64)
            .with("message_id", receipt.message_id.clone());
        Self::new(
            "notification.sent",
            vec![ChannelName::Employee(job.recipient.employee_id)],
            payload,
        )
    }
}

/// Publisher side. Clone freely.
#[derive(Debug, Clone)]
pub struct BroadcastHandle {
    tx: mpsc::UnboundedSender<BroadcastEvent>,
}

impl BroadcastHandle {
    /// One-way send; never blocks. Dropped silently once the broadcaster stops.
    pub fn publish(&self, event: BroadcastEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("📡 Broadcaster stopped, event dropped");
        }
    }

    /// Handle whose events go nowhere, for one-off CLI commands.
    pub fn disconnected() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self { tx }
    }
}

/// Fan-out hub owning the per-channel senders.
pub struct Broadcaster {
    authorizer: ChannelAuthorizer,
    capacity: usize,
    channels: Mutex<HashMap<ChannelName, broadcast::Sender<Arc<BroadcastEvent>>>>,
}

impl Broadcaster {
    pub fn new(config: &BroadcastConfig) -> Self {
        Self {
            authorizer: ChannelAuthorizer::new(config.privileged_roles.clone()),
            capacity: config.channel_capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to `channel` if the subscriber passes its predicate.
    pub fn subscribe(&self, subscriber: &Subscriber, channel: &str) -> Option<Subscription> {
        let name: ChannelName = match channel.parse() {
            Ok(name) => name,
            Err(e) => {
                tracing::debug!("🔒 Subscribe denied: {e}");
                return None;
            }
        };
        if !self.authorizer.authorize(subscriber, &name) {
            tracing::debug!("🔒 Subscribe denied: {name} for {:?}", subscriber.employee_id);
            return None;
        }

        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.retain(|_, tx| tx.receiver_count() > 0);
        let rx = channels
            .entry(name.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        Some(Subscription { channel: name, rx })
    }

    /// Deliver one event to every target channel that has subscribers.
    /// Returns how many subscriptions received it. Target channels whose
    /// subscribers are all gone are dropped.
    pub fn deliver(&self, event: BroadcastEvent) -> usize {
        let event = Arc::new(event);
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let mut reached = 0;
        for name in &event.channels {
            let Some(tx) = channels.get(name) else {
                continue;
            };
            match tx.send(event.clone()) {
                Ok(n) => reached += n,
                Err(_) => {
                    channels.remove(name);
                }
            }
        }
        tracing::trace!("📡 {} → {} subscriber(s)", event.name, reached);
        reached
    }

    /// Channels that currently hold a sender.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Spawn the fan-out task. It ends when every handle is dropped.
    pub fn start(self: Arc<Self>) -> (BroadcastHandle, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<BroadcastEvent>();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.deliver(event);
            }
            tracing::debug!("📡 Broadcaster stopped");
        });
        (BroadcastHandle { tx }, task)
    }
}

/// An authorized subscription to one channel.
pub struct Subscription {
    channel: ChannelName,
    rx: broadcast::Receiver<Arc<BroadcastEvent>>,
}

impl Subscription {
    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    /// Next event; `None` once the broadcaster is gone. Lagged events are skipped.
    pub async fn recv(&mut self) -> Option<Arc<BroadcastEvent>> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("📡 {} subscriber lagged, {n} event(s) dropped", self.channel);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Arc<BroadcastEvent>> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Arc<BroadcastEvent>> {
        BroadcastStream::new(self.rx).filter_map(|item| item.ok())
    }
}

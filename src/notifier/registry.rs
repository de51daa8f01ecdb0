//! Connected subscribers, keyed by user then connection.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use super::auth::Identity;
use super::events::ServerEvent;

/// Broadcast scope of an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum Channel {
    Organization(String),
    Project(String),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Organization(id) => write!(f, "org:{}", id),
            Channel::Project(id) => write!(f, "project:{}", id),
        }
    }
}

/// Addresses one live connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub user_id: String,
    pub id: Uuid,
}

/// Outcome of pushing one event to a set of connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Connections whose outbox was full or closed.
    pub dropped: usize,
}

impl DeliveryReport {
    fn record(&mut self, outcome: Result<(), TrySendError<ServerEvent>>) {
        match outcome {
            Ok(()) => self.delivered += 1,
            Err(_) => self.dropped += 1,
        }
    }
}

struct Subscriber {
    identity: Identity,
    channels: HashSet<Channel>,
    outbox: mpsc::Sender<ServerEvent>,
}

/// Injectable registry of live connections. Entries are added on connect and
/// removed on disconnect only.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    users: Arc<RwLock<HashMap<String, HashMap<Uuid, Subscriber>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(
        &self,
        identity: Identity,
        channels: impl IntoIterator<Item = Channel>,
        outbox: mpsc::Sender<ServerEvent>,
    ) -> ConnectionKey {
        let key = ConnectionKey {
            user_id: identity.user_id.clone(),
            id: Uuid::new_v4(),
        };
        let subscriber = Subscriber {
            identity,
            channels: channels.into_iter().collect(),
            outbox,
        };
        self.users
            .write()
            .await
            .entry(key.user_id.clone())
            .or_default()
            .insert(key.id, subscriber);
        key
    }

    /// Returns `false` if the connection was not registered.
    pub async fn remove(&self, key: &ConnectionKey) -> bool {
        let mut users = self.users.write().await;
        let Some(connections) = users.get_mut(&key.user_id) else {
            return false;
        };
        let removed = connections.remove(&key.id).is_some();
        if connections.is_empty() {
            users.remove(&key.user_id);
        }
        removed
    }

    pub async fn join(&self, key: &ConnectionKey, channel: Channel) -> bool {
        let mut users = self.users.write().await;
        match users.get_mut(&key.user_id).and_then(|c| c.get_mut(&key.id)) {
            Some(sub) => {
                sub.channels.insert(channel);
                true
            }
            None => false,
        }
    }

    pub async fn leave(&self, key: &ConnectionKey, channel: &Channel) -> bool {
        let mut users = self.users.write().await;
        match users.get_mut(&key.user_id).and_then(|c| c.get_mut(&key.id)) {
            Some(sub) => sub.channels.remove(channel),
            None => false,
        }
    }

    pub async fn channels(&self, key: &ConnectionKey) -> Vec<Channel> {
        let users = self.users.read().await;
        users
            .get(&key.user_id)
            .and_then(|c| c.get(&key.id))
            .map(|sub| sub.channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn identity(&self, key: &ConnectionKey) -> Option<Identity> {
        let users = self.users.read().await;
        users
            .get(&key.user_id)
            .and_then(|c| c.get(&key.id))
            .map(|sub| sub.identity.clone())
    }

    /// Push to every connection that joined `channel`. Never waits on a
    /// slow subscriber.
    pub async fn broadcast(&self, channel: &Channel, event: &ServerEvent) -> DeliveryReport {
        let users = self.users.read().await;
        let mut report = DeliveryReport::default();
        for sub in users.values().flat_map(|c| c.values()) {
            if sub.channels.contains(channel) {
                report.record(sub.outbox.try_send(event.clone()));
            }
        }
        if report.dropped > 0 {
            debug!(channel = %channel, dropped = report.dropped, "Subscribers missed an event");
        }
        report
    }

    pub async fn send_to_user(&self, user_id: &str, event: &ServerEvent) -> DeliveryReport {
        let users = self.users.read().await;
        let mut report = DeliveryReport::default();
        if let Some(connections) = users.get(user_id) {
            for sub in connections.values() {
                report.record(sub.outbox.try_send(event.clone()));
            }
        }
        report
    }

    pub async fn send_to_connection(&self, key: &ConnectionKey, event: &ServerEvent) -> DeliveryReport {
        let users = self.users.read().await;
        let mut report = DeliveryReport::default();
        if let Some(sub) = users.get(&key.user_id).and_then(|c| c.get(&key.id)) {
            report.record(sub.outbox.try_send(event.clone()));
        }
        report
    }

    pub async fn connected_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.users.read().await.keys().cloned().collect();
        users.sort();
        users
    }

    pub async fn connection_count(&self) -> usize {
        self.users.read().await.values().map(HashMap::len).sum()
    }
}

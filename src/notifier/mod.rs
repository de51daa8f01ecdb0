//! Real-time push to authenticated subscribers.
//!
//! A connection presents a credential, gets an identity and is joined to
//! its organization channel. Project channels are joined on request.
//! Events go into a bounded per-connection outbox; a full outbox drops the
//! event for that connection and nothing is replayed.

pub mod auth;
pub mod events;
pub mod registry;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::NotifierAuthError;
use crate::model::ExecutionRecord;

pub use self::auth::{Ed25519TokenVerifier, Identity, TokenVerifier};
pub use self::events::{AlertEvent, ClientCommand, MetricsUpdateEvent, ServerEvent, TestResultEvent};
pub use self::registry::{Channel, ConnectionKey, ConnectionRegistry, DeliveryReport};

pub const DEFAULT_OUTBOX_CAPACITY: usize = 64;

/// A live, authenticated connection.
#[derive(Debug)]
pub struct Subscription {
    pub key: ConnectionKey,
    pub identity: Identity,
    pub events: mpsc::Receiver<ServerEvent>,
}

pub struct Notifier {
    verifier: Arc<dyn TokenVerifier>,
    registry: ConnectionRegistry,
    outbox_capacity: usize,
}

impl Notifier {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        registry: ConnectionRegistry,
        outbox_capacity: usize,
    ) -> Self {
        Self {
            verifier,
            registry,
            outbox_capacity: outbox_capacity.max(1),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Authenticate and register a connection. Rejected credentials never
    /// reach the registry.
    pub async fn connect(&self, token: Option<&str>) -> Result<Subscription, NotifierAuthError> {
        let token = token
            .map(|t| t.strip_prefix("Bearer ").unwrap_or(t))
            .ok_or(NotifierAuthError::MissingToken)?;
        let identity = self.verifier.verify(token)?;

        let (tx, rx) = mpsc::channel(self.outbox_capacity);
        let org = Channel::Organization(identity.organization.clone());
        if let Err(e) = tx.try_send(ServerEvent::Joined {
            channel: org.to_string(),
        }) {
            debug!(user = %identity.user_id, "Join ack not queued: {}", e);
        }
        let key = self.registry.add(identity.clone(), [org], tx).await;

        info!(user = %identity.user_id, org = %identity.organization, connection = %key.id, "Subscriber connected");
        Ok(Subscription {
            key,
            identity,
            events: rx,
        })
    }

    pub async fn disconnect(&self, key: &ConnectionKey) {
        if self.registry.remove(key).await {
            info!(user = %key.user_id, connection = %key.id, "Subscriber disconnected");
        }
    }

    pub async fn join_project(&self, key: &ConnectionKey, project_id: &str) -> bool {
        let channel = Channel::Project(project_id.to_string());
        let joined = self.registry.join(key, channel.clone()).await;
        if joined {
            debug!(user = %key.user_id, channel = %channel, "Joined channel");
            let ack = ServerEvent::Joined {
                channel: channel.to_string(),
            };
            self.emit_to_connection(key, ack).await;
        }
        joined
    }

    pub async fn leave_project(&self, key: &ConnectionKey, project_id: &str) -> bool {
        let channel = Channel::Project(project_id.to_string());
        let left = self.registry.leave(key, &channel).await;
        if left {
            debug!(user = %key.user_id, channel = %channel, "Left channel");
            let ack = ServerEvent::Left {
                channel: channel.to_string(),
            };
            self.emit_to_connection(key, ack).await;
        }
        left
    }

    /// Apply a client frame.
    pub async fn handle_command(&self, key: &ConnectionKey, command: ClientCommand) -> bool {
        match command {
            ClientCommand::JoinProject(project_id) => self.join_project(key, &project_id).await,
            ClientCommand::LeaveProject(project_id) => self.leave_project(key, &project_id).await,
        }
    }

    /// One specific connection.
    pub async fn emit_to_connection(&self, key: &ConnectionKey, event: ServerEvent) -> DeliveryReport {
        self.registry.send_to_connection(key, &event).await
    }

    /// `test_result` on the owning project's channel.
    pub async fn emit_test_result(&self, record: &ExecutionRecord) -> DeliveryReport {
        let channel = Channel::Project(record.project_id.clone());
        let event = ServerEvent::TestResult(TestResultEvent::from(record));
        self.registry.broadcast(&channel, &event).await
    }

    /// `alert` on the organization's channel.
    pub async fn emit_alert(&self, organization: &str, alert: AlertEvent) -> DeliveryReport {
        let channel = Channel::Organization(organization.to_string());
        self.registry
            .broadcast(&channel, &ServerEvent::Alert(alert))
            .await
    }

    /// `metrics_update` on a project's channel.
    pub async fn emit_metrics(&self, project_id: &str, metrics: serde_json::Value) -> DeliveryReport {
        let channel = Channel::Project(project_id.to_string());
        let event = ServerEvent::MetricsUpdate(MetricsUpdateEvent {
            project_id: project_id.to_string(),
            timestamp: Utc::now(),
            metrics,
        });
        self.registry.broadcast(&channel, &event).await
    }

    /// Every connection of one user.
    pub async fn emit_to_user(&self, user_id: &str, event: ServerEvent) -> DeliveryReport {
        self.registry.send_to_user(user_id, &event).await
    }

    pub async fn connected_users(&self) -> Vec<String> {
        self.registry.connected_users().await
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.connection_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::auth::{generate_signing_key, sign_token, Claims};
    use super::*;
    use crate::detect::Severity;
    use crate::model::{Region, RequestTemplate, Test, TriggerMetadata, TriggerSource};
    use ed25519_dalek::SigningKey;

    fn notifier(capacity: usize) -> (SigningKey, Notifier) {
        let signing = generate_signing_key();
        let verifier = Arc::new(Ed25519TokenVerifier::new(signing.verifying_key()));
        (signing, Notifier::new(verifier, ConnectionRegistry::new(), capacity))
    }

    fn token(signing: &SigningKey, user: &str, org: &str) -> String {
        sign_token(signing, &Claims::new(user, org, 300)).unwrap()
    }

    fn drain(sub: &mut Subscription) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = sub.events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_connect_rejects_missing_and_bad_credentials() {
        let (_, notifier) = notifier(8);
        assert_eq!(
            notifier.connect(None).await.unwrap_err(),
            NotifierAuthError::MissingToken
        );
        let foreign = token(&generate_signing_key(), "u1", "org-1");
        assert_eq!(
            notifier.connect(Some(&foreign)).await.unwrap_err(),
            NotifierAuthError::BadSignature
        );
        assert_eq!(notifier.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_connect_auto_joins_organization() {
        let (signing, notifier) = notifier(8);
        let bearer = format!("Bearer {}", token(&signing, "u1", "org-1"));
        let mut sub = notifier.connect(Some(&bearer)).await.unwrap();
        assert_eq!(sub.identity.organization, "org-1");

        let alert = AlertEvent {
            kind: "error_rate".into(),
            severity: Severity::Warning,
            message: "too many failures".into(),
            project_id: "p1".into(),
            timestamp: Utc::now(),
        };
        let report = notifier.emit_alert("org-1", alert.clone()).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(notifier.emit_alert("org-2", alert).await.delivered, 0);

        let events = drain(&mut sub);
        assert!(matches!(events[0], ServerEvent::Joined { .. }));
        assert!(matches!(events[1], ServerEvent::Alert(_)));
    }

    #[tokio::test]
    async fn test_join_ack_takes_first_outbox_slot() {
        let (signing, notifier) = notifier(1);
        let mut sub = notifier
            .connect(Some(&token(&signing, "u1", "org-1")))
            .await
            .unwrap();
        let alert = AlertEvent {
            kind: "error_rate".into(),
            severity: Severity::Warning,
            message: "queued behind the ack".into(),
            project_id: "p1".into(),
            timestamp: Utc::now(),
        };
        let report = notifier.emit_alert("org-1", alert).await;
        assert_eq!(report.delivered, 0);
        assert_eq!(report.dropped, 1);

        let events = drain(&mut sub);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ServerEvent::Joined { .. }));
    }

    #[tokio::test]
    async fn test_test_results_follow_project_membership() {
        let (signing, notifier) = notifier(8);
        let mut sub = notifier
            .connect(Some(&token(&signing, "u1", "org-1")))
            .await
            .unwrap();
        let test = Test::new("t1", "p1", "t", RequestTemplate::get("http://localhost/"));
        let record = ExecutionRecord::start(
            &test,
            Region::UsEast1,
            TriggerMetadata::new(TriggerSource::Manual),
        );

        assert_eq!(notifier.emit_test_result(&record).await.delivered, 0);
        assert!(notifier.join_project(&sub.key, "p1").await);
        assert_eq!(notifier.emit_test_result(&record).await.delivered, 1);
        assert!(notifier.leave_project(&sub.key, "p1").await);
        assert_eq!(notifier.emit_test_result(&record).await.delivered, 0);

        let results: Vec<ServerEvent> = drain(&mut sub)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::TestResult(_)))
            .collect();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_user_addressing_and_disconnect() {
        let (signing, notifier) = notifier(8);
        let a = notifier
            .connect(Some(&token(&signing, "u1", "org-1")))
            .await
            .unwrap();
        let _b = notifier
            .connect(Some(&token(&signing, "u1", "org-1")))
            .await
            .unwrap();
        let _c = notifier
            .connect(Some(&token(&signing, "u2", "org-1")))
            .await
            .unwrap();

        assert_eq!(notifier.connection_count().await, 3);
        assert_eq!(notifier.connected_users().await, vec!["u1", "u2"]);
        let report = notifier
            .emit_to_user(
                "u1",
                ServerEvent::Error {
                    message: "hello".into(),
                },
            )
            .await;
        assert_eq!(report.delivered, 2);

        notifier.disconnect(&a.key).await;
        assert_eq!(notifier.connection_count().await, 2);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_instead_of_blocking() {
        let (signing, notifier) = notifier(2);
        let sub = notifier
            .connect(Some(&token(&signing, "u1", "org-1")))
            .await
            .unwrap();
        notifier.join_project(&sub.key, "p1").await;
        // Outbox now holds the org and project acks.
        let report = notifier.emit_metrics("p1", serde_json::json!({"executions": 3})).await;
        assert_eq!(report, DeliveryReport { delivered: 0, dropped: 1 });
    }
}

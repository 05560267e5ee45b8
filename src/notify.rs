//! Notification fan-out for intervention state changes.
//!
//! State changes are broadcast to any currently-mounted listener through an
//! explicit channel object owned and injected by the caller; there is no
//! global dispatcher. The persisted `notifications` rows and the in-process
//! broadcast are written together, and a lagging or absent subscriber never
//! fails the write path.

use chrono::Utc;
use log::warn;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Error;
use crate::models::NotificationKind;
use crate::Domicare;

/// In-process event mirrored from a persisted notification row
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub aidant_id: Uuid,
    pub intervention_id: Uuid,
    pub kind: NotificationKind,
}

/// Publish/subscribe channel for notification events
pub struct NotificationHub {
    sender: broadcast::Sender<NotificationEvent>,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Attach a listener; events published after this point are delivered
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.sender.subscribe()
    }

    /// Broadcast an event; returns how many listeners received it
    pub fn publish(&self, event: NotificationEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(64)
    }
}

#[derive(Deserialize)]
struct AidantRow {
    aidant_id: Uuid,
}

/// Persists notification rows and mirrors them onto a [`NotificationHub`]
pub struct Notifier<'a> {
    client: &'a Domicare,
    hub: &'a NotificationHub,
}

impl<'a> Notifier<'a> {
    pub(crate) fn new(client: &'a Domicare, hub: &'a NotificationHub) -> Self {
        Self { client, hub }
    }

    /// Fan a state change out to every aidant linked to the patient: one
    /// `notifications` row plus one broadcast event per aidant. A failed
    /// insert is logged and skipped; returns the number delivered.
    pub async fn notify_linked_aidants(
        &self,
        token: &str,
        patient_id: Uuid,
        intervention_id: Uuid,
        kind: NotificationKind,
    ) -> Result<u32, Error> {
        let links: Vec<AidantRow> = self
            .client
            .from("aidant_patient_links")
            .select("aidant_id")
            .eq("patient_id", &patient_id.to_string())
            .with_auth(token)?
            .execute()
            .await?;

        let mut delivered = 0;
        for link in links {
            let row = json!({
                "aidant_id": link.aidant_id,
                "intervention_id": intervention_id,
                "type": kind,
                "sent_at": Utc::now(),
            });

            let insert = self
                .client
                .from("notifications")
                .with_auth(token)?
                .insert(&row)
                .await;

            match insert {
                Ok(_) => {
                    self.hub.publish(NotificationEvent {
                        aidant_id: link.aidant_id,
                        intervention_id,
                        kind,
                    });
                    delivered += 1;
                }
                Err(err) => {
                    warn!(
                        "notification insert for aidant {} skipped: {}",
                        link.aidant_id, err
                    );
                }
            }
        }

        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let hub = NotificationHub::new(8);
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        let event = NotificationEvent {
            aidant_id: Uuid::new_v4(),
            intervention_id: Uuid::new_v4(),
            kind: NotificationKind::CheckIn,
        };

        assert_eq!(hub.publish(event.clone()), 2);

        let received = first.recv().await.unwrap();
        assert_eq!(received.aidant_id, event.aidant_id);
        assert_eq!(received.kind, NotificationKind::CheckIn);

        let received = second.recv().await.unwrap();
        assert_eq!(received.intervention_id, event.intervention_id);
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let hub = NotificationHub::default();
        let event = NotificationEvent {
            aidant_id: Uuid::new_v4(),
            intervention_id: Uuid::new_v4(),
            kind: NotificationKind::Missed,
        };
        assert_eq!(hub.publish(event), 0);
    }

    #[tokio::test]
    async fn test_subscriber_only_sees_events_after_subscribing() {
        let hub = NotificationHub::new(8);

        hub.publish(NotificationEvent {
            aidant_id: Uuid::new_v4(),
            intervention_id: Uuid::new_v4(),
            kind: NotificationKind::CheckOut,
        });

        let mut late = hub.subscribe();
        assert!(matches!(
            late.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}

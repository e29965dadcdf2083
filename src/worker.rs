//! Projection worker: drain the queue, apply ops, publish lag.
//!
//! A single cooperative loop. Per message: decode the recorded event,
//! project it, apply the ops in order, upsert the lag row, then delete
//! the message. A message that fails anywhere is simply not deleted --
//! the queue redelivers it, and because every op is idempotent the retry
//! converges. The outer loop swallows all errors and recurs; scaling out
//! means running more worker processes against the same queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use crate::config::ProjectionTables;
use crate::document_store::{DocumentStore, DocumentStoreError};
use crate::event::RecordedEvent;
use crate::projector::{ProjectionOp, project};
use crate::queue::{MessageQueue, QueueError, QueueMessage};

/// Receive batch size per tick.
const RECEIVE_BATCH: usize = 10;

/// Long-poll duration per receive.
const RECEIVE_WAIT: Duration = Duration::from_secs(20);

/// Partition key of the single lag row.
const LAG_ROW: &str = "main";

/// Failures inside one message's projection.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("undecodable event message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] DocumentStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// The projection worker loop and its table wiring.
pub struct ProjectionWorker {
    queue: Arc<dyn MessageQueue>,
    docs: Arc<dyn DocumentStore>,
    tables: ProjectionTables,
    receive_wait: Duration,
}

impl ProjectionWorker {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        docs: Arc<dyn DocumentStore>,
        tables: ProjectionTables,
    ) -> Self {
        Self {
            queue,
            docs,
            tables,
            receive_wait: RECEIVE_WAIT,
        }
    }

    /// Shorten the long-poll window (tests drive single ticks).
    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    /// Run forever. Errors are logged and swallowed; the loop recurs
    /// unconditionally.
    pub async fn run(&self) -> ! {
        loop {
            match self.tick().await {
                Ok(0) => {}
                Ok(projected) => {
                    tracing::debug!(projected, "projection tick complete");
                }
                Err(e) => {
                    tracing::error!(error = %e, "projection tick failed, continuing");
                }
            }
        }
    }

    /// One receive-project-delete pass.
    ///
    /// Returns the number of messages projected and deleted. Per-message
    /// failures are logged and leave the message undeleted for
    /// redelivery; they do not fail the tick.
    pub async fn tick(&self) -> Result<usize, WorkerError> {
        let batch = self.queue.receive(RECEIVE_BATCH, self.receive_wait).await?;
        let mut projected = 0;
        for message in &batch {
            match self.handle(message).await {
                Ok(()) => {
                    if let Err(e) = self.queue.delete(&message.receipt_handle).await {
                        // The projection itself landed; redelivery will
                        // re-apply idempotent ops and delete again.
                        tracing::warn!(error = %e, "failed to delete projected message");
                    } else {
                        projected += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "projection failed; message will be redelivered"
                    );
                }
            }
        }
        Ok(projected)
    }

    async fn handle(&self, message: &QueueMessage) -> Result<(), WorkerError> {
        let event: RecordedEvent = serde_json::from_str(&message.body)?;
        for op in project(&event) {
            self.apply(&op).await?;
        }
        self.update_lag(event.occurred_at_utc).await?;
        Ok(())
    }

    /// Apply one op. Puts are full-item overwrites keyed by the aggregate
    /// id; updates set attributes to event-derived values. Both are safe
    /// to re-apply.
    pub async fn apply(&self, op: &ProjectionOp) -> Result<(), WorkerError> {
        match op {
            ProjectionOp::PutUser {
                user_id,
                email,
                role,
                created_at_utc,
            } => {
                self.docs
                    .put(
                        &self.tables.users,
                        &user_id.to_string(),
                        json!({
                            "userId": user_id,
                            "email": email,
                            "role": role,
                            "createdAtUtc": created_at_utc,
                        }),
                    )
                    .await?;
            }

            ProjectionOp::SetUserLastLogin {
                user_id,
                last_login_at_utc,
            } => {
                let mut attrs = Map::new();
                attrs.insert("lastLoginAtUtc".into(), json!(last_login_at_utc));
                self.docs
                    .update(&self.tables.users, &user_id.to_string(), attrs)
                    .await?;
            }

            ProjectionOp::PutResource {
                resource_id,
                name,
                details,
                created_at_utc,
                updated_at_utc,
            } => {
                self.docs
                    .put(
                        &self.tables.resources,
                        &resource_id.to_string(),
                        json!({
                            "resourceId": resource_id,
                            "name": name,
                            "details": details,
                            "status": "active",
                            "createdAtUtc": created_at_utc,
                            "updatedAtUtc": updated_at_utc,
                        }),
                    )
                    .await?;
            }

            ProjectionOp::UpdateResourceDetails {
                resource_id,
                name,
                details,
                updated_at_utc,
            } => {
                let mut attrs = Map::new();
                if let Some(name) = name {
                    attrs.insert("name".into(), json!(name));
                }
                if let Some(details) = details {
                    attrs.insert("details".into(), json!(details));
                }
                attrs.insert("updatedAtUtc".into(), json!(updated_at_utc));
                self.docs
                    .update(&self.tables.resources, &resource_id.to_string(), attrs)
                    .await?;
            }

            ProjectionOp::PutReservation {
                reservation_id,
                resource_id,
                user_id,
                from_utc,
                to_utc,
                created_at_utc,
            } => {
                self.docs
                    .put(
                        &self.tables.reservations,
                        &reservation_id.to_string(),
                        json!({
                            "reservationId": reservation_id,
                            "resourceId": resource_id,
                            "userId": user_id,
                            "fromUtc": from_utc,
                            "toUtc": to_utc,
                            "status": "active",
                            "createdAtUtc": created_at_utc,
                            "cancelledAtUtc": null,
                        }),
                    )
                    .await?;
            }

            ProjectionOp::CancelReservation {
                reservation_id,
                cancelled_at_utc,
            } => {
                let mut attrs = Map::new();
                attrs.insert("status".into(), json!("cancelled"));
                attrs.insert("cancelledAtUtc".into(), json!(cancelled_at_utc));
                self.docs
                    .update(&self.tables.reservations, &reservation_id.to_string(), attrs)
                    .await?;
            }
        }
        Ok(())
    }

    async fn update_lag(&self, last_projected: DateTime<Utc>) -> Result<(), WorkerError> {
        let mut attrs = Map::new();
        attrs.insert("projection".into(), Value::String(LAG_ROW.into()));
        attrs.insert("lastProjectedAtUtc".into(), json!(last_projected));
        attrs.insert("eventsBehind".into(), json!(0));
        self.docs
            .update(&self.tables.projection_lag, LAG_ROW, attrs)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::document_store::InMemoryDocumentStore;
    use crate::domain::resource::ResourceEvent;
    use crate::domain::user::{Role, UserEvent};
    use crate::event::{StreamType, encode_event};
    use crate::queue::InMemoryQueue;

    struct Harness {
        queue: Arc<InMemoryQueue>,
        docs: Arc<InMemoryDocumentStore>,
        worker: ProjectionWorker,
    }

    fn harness() -> Harness {
        let queue = Arc::new(InMemoryQueue::new());
        let docs = Arc::new(InMemoryDocumentStore::new());
        let worker = ProjectionWorker::new(
            queue.clone(),
            docs.clone(),
            ProjectionTables::default(),
        )
        .with_receive_wait(Duration::ZERO);
        Harness {
            queue,
            docs,
            worker,
        }
    }

    fn registered_event(user_id: Uuid) -> RecordedEvent {
        let (event_type, payload) = encode_event(&UserEvent::UserRegistered {
            user_id,
            email: "ana@test.com".into(),
            password_hash: "h".into(),
            role: Role::User,
        })
        .expect("encode should succeed");
        RecordedEvent::record(
            StreamType::User,
            user_id,
            1,
            event_type,
            payload,
            Utc::now(),
            Value::Null,
        )
    }

    async fn enqueue(queue: &InMemoryQueue, event: &RecordedEvent) {
        let body = serde_json::to_string(event).expect("serialize should succeed");
        queue.send(body).await.expect("send should succeed");
    }

    #[tokio::test]
    async fn tick_projects_and_deletes_messages() {
        let h = harness();
        let user_id = Uuid::now_v7();
        enqueue(&h.queue, &registered_event(user_id)).await;

        let projected = h.worker.tick().await.expect("tick should succeed");
        assert_eq!(projected, 1);
        assert_eq!(h.queue.depth(), 0);
        assert_eq!(h.queue.in_flight(), 0, "projected messages are deleted");

        let row = h
            .docs
            .get("users_projection", &user_id.to_string())
            .await
            .expect("get should succeed")
            .expect("user row should exist");
        assert_eq!(row["email"], "ana@test.com");
        assert_eq!(row["role"], "user");
    }

    #[tokio::test]
    async fn tick_upserts_the_lag_row() {
        let h = harness();
        enqueue(&h.queue, &registered_event(Uuid::now_v7())).await;
        h.worker.tick().await.expect("tick should succeed");

        let lag = h
            .docs
            .get("projection_lag", "main")
            .await
            .expect("get should succeed")
            .expect("lag row should exist");
        assert_eq!(lag["projection"], "main");
        assert_eq!(lag["eventsBehind"], 0);
        assert!(lag.get("lastProjectedAtUtc").is_some());
    }

    #[tokio::test]
    async fn poison_message_is_left_for_redelivery() {
        let h = harness();
        h.queue
            .send("not json".into())
            .await
            .expect("send should succeed");
        enqueue(&h.queue, &registered_event(Uuid::now_v7())).await;

        let projected = h.worker.tick().await.expect("tick should succeed");
        assert_eq!(projected, 1, "the healthy message still lands");
        assert_eq!(
            h.queue.in_flight(),
            1,
            "the poison message stays undeleted"
        );

        // After visibility expiry the poison message comes back.
        h.queue.redeliver();
        assert_eq!(h.queue.depth(), 1);
    }

    #[tokio::test]
    async fn redelivered_message_reapplies_idempotently() {
        let h = harness();
        let user_id = Uuid::now_v7();
        let event = registered_event(user_id);

        enqueue(&h.queue, &event).await;
        h.worker.tick().await.expect("first tick should succeed");

        // Simulate at-least-once: the same event arrives again.
        enqueue(&h.queue, &event).await;
        h.worker.tick().await.expect("second tick should succeed");

        assert_eq!(h.docs.table_len("users_projection"), 1);
        let row = h
            .docs
            .get("users_projection", &user_id.to_string())
            .await
            .expect("get should succeed")
            .expect("user row should exist");
        assert_eq!(row["email"], "ana@test.com");
    }

    #[tokio::test]
    async fn reservation_lifecycle_lands_in_reservations_table() {
        let h = harness();
        let resource_id = Uuid::now_v7();
        let reservation_id = Uuid::now_v7();
        let user_id = Uuid::now_v7();
        let now = Utc::now();

        let (ty, payload) = encode_event(&ResourceEvent::ReservationAddedToResource {
            reservation_id,
            user_id,
            from_utc: now,
            to_utc: now + chrono::Duration::hours(1),
            created_at_utc: now,
        })
        .expect("encode should succeed");
        let added = RecordedEvent::record(
            StreamType::Resource,
            resource_id,
            2,
            ty,
            payload,
            now,
            Value::Null,
        );

        let (ty, payload) = encode_event(&ResourceEvent::ResourceReservationCancelled {
            reservation_id,
            cancelled_at_utc: now,
        })
        .expect("encode should succeed");
        let cancelled = RecordedEvent::record(
            StreamType::Resource,
            resource_id,
            3,
            ty,
            payload,
            now,
            Value::Null,
        );

        enqueue(&h.queue, &added).await;
        enqueue(&h.queue, &cancelled).await;
        let projected = h.worker.tick().await.expect("tick should succeed");
        assert_eq!(projected, 2);

        let row = h
            .docs
            .get("reservations_projection", &reservation_id.to_string())
            .await
            .expect("get should succeed")
            .expect("reservation row should exist");
        assert_eq!(row["status"], "cancelled");
        assert_eq!(row["resourceId"], resource_id.to_string());
        assert!(row.get("cancelledAtUtc").is_some());
    }
}

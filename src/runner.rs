//! Command runner: rehydrate, build, decide, append, publish, snapshot.
//!
//! One execution is a straight sequence of store calls with no critical
//! section other than the conditional append itself. Losing the append
//! race restarts the whole sequence from rehydration; the retry budget is
//! configuration. Publish and snapshot failures never surface -- the
//! append is the commit point, and everything after it is best-effort.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::domain::{Decider, replay};
use crate::error::{AppError, ErrorCode};
use crate::event::{RecordedEvent, encode_event};
use crate::queue::MessageQueue;
use crate::snapshot::{SnapshotPolicy, StoredSnapshot};
use crate::store::{EventStore, EventStoreError};

/// Event type tag of the conflict-telemetry marker.
const CONFLICT_MARKER_TYPE: &str = "ConcurrencyConflictUnresolved";

/// Runner behavior knobs, lifted from [`Config`](crate::config::Config).
#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    pub snapshots: SnapshotPolicy,
    /// Extra attempts after the first version conflict.
    pub version_conflict_max_retries: u32,
    /// Append a telemetry event when the retries run out.
    pub emit_concurrency_conflict_unresolved_event: bool,
}

/// Names a command execution for event metadata and conflict telemetry.
#[derive(Debug, Clone, Copy)]
pub struct CommandInfo {
    /// Stable command name (e.g. `"CreateReservationInResource"`).
    pub name: &'static str,
    /// Authenticated subject, absent on unauthenticated routes.
    pub actor_user_id: Option<Uuid>,
}

/// A committed command: the durable event and the state after folding it.
pub struct Execution<D: Decider> {
    pub recorded: RecordedEvent,
    pub event: D::Event,
    pub state: Option<D>,
}

// Manual `Debug` because `D::Event` and `D` are not required to be
// `Debug`; the recorded event alone identifies the execution.
impl<D: Decider> std::fmt::Debug for Execution<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("recorded", &self.recorded)
            .finish_non_exhaustive()
    }
}

/// Executes commands against one event store and publishes the results.
#[derive(Clone)]
pub struct CommandRunner {
    store: EventStore,
    queue: Arc<dyn MessageQueue>,
    options: RunnerOptions,
}

impl CommandRunner {
    pub fn new(store: EventStore, queue: Arc<dyn MessageQueue>, options: RunnerOptions) -> Self {
        Self {
            store,
            queue,
            options,
        }
    }

    /// Run one command to durability.
    ///
    /// `build` is invoked per attempt with the freshly rehydrated state,
    /// so builders can verify state-dependent preconditions (e.g. a
    /// password against the stored hash) and stamp per-attempt values
    /// like `now_utc`. Rejections from the builder or the decider
    /// short-circuit without touching the store.
    ///
    /// # Errors
    ///
    /// Domain rejections map to their 4xx codes; an exhausted retry
    /// budget maps to `VERSION_CONFLICT`; a stable listing gap maps to
    /// `STREAM_GAP_DETECTED`.
    pub async fn execute<D, F>(
        &self,
        stream_id: Uuid,
        info: CommandInfo,
        build: F,
    ) -> Result<Execution<D>, AppError>
    where
        D: Decider,
        F: Fn(Option<&D>) -> Result<D::Command, AppError>,
    {
        let attempts = self.options.version_conflict_max_retries.saturating_add(1);
        for attempt in 1..=attempts {
            let (state, last_version) = self.rehydrate::<D>(stream_id).await?;
            let cmd = build(state.as_ref())?;
            let event = D::decide(state.as_ref(), &cmd).map_err(Into::into)?;

            let (event_type, payload) =
                encode_event(&event).map_err(|e| AppError::internal(e.to_string()))?;
            let recorded = RecordedEvent::record(
                D::STREAM_TYPE,
                stream_id,
                last_version + 1,
                event_type,
                payload,
                Utc::now(),
                event_meta(&info),
            );

            match self.store.append_event(&recorded, last_version).await {
                Ok(()) => {
                    self.publish(&recorded).await;
                    let state = D::fold(state, &event);
                    if self.options.snapshots.due(D::STREAM_TYPE, recorded.version) {
                        self.snapshot(&recorded, state.as_ref()).await;
                    }
                    return Ok(Execution {
                        recorded,
                        event,
                        state,
                    });
                }
                Err(EventStoreError::VersionConflict) => {
                    tracing::debug!(
                        stream_id = %stream_id,
                        command = info.name,
                        attempt,
                        "version conflict, restarting command"
                    );
                }
                Err(e) => return Err(map_store_error(e)),
            }
        }

        if self.options.emit_concurrency_conflict_unresolved_event {
            self.append_conflict_marker::<D>(stream_id, &info, attempts)
                .await;
        }
        Err(AppError::new(
            ErrorCode::VersionConflict,
            "optimistic concurrency retries exhausted",
        ))
    }

    /// Load snapshot plus tail and fold to the current state.
    ///
    /// Returns the state and the last event version (0 for a vacant
    /// stream). A snapshot whose state no longer decodes falls back to a
    /// full replay.
    async fn rehydrate<D: Decider>(
        &self,
        stream_id: Uuid,
    ) -> Result<(Option<D>, u64), AppError> {
        let snapshot = self
            .store
            .load_latest_snapshot(D::STREAM_TYPE, stream_id)
            .await
            .map_err(map_store_error)?;

        let (state, snapshot_version) = match snapshot {
            Some(snap) => match serde_json::from_value::<D>(snap.state) {
                Ok(decoded) => (Some(decoded), snap.last_event_version),
                Err(e) => {
                    tracing::warn!(
                        stream_id = %stream_id,
                        error = %e,
                        "snapshot state undecodable, replaying from scratch"
                    );
                    (None, 0)
                }
            },
            None => (None, 0),
        };

        let tail = self
            .store
            .load_stream(D::STREAM_TYPE, stream_id, snapshot_version + 1)
            .await
            .map_err(map_store_error)?;
        let last_version = tail.last().map(|e| e.version).unwrap_or(snapshot_version);
        let state = replay(state, &tail);
        Ok((state, last_version))
    }

    /// Publish the committed event; failures are logged, never surfaced.
    /// An unpublished durable event is recovered by an operational
    /// redrive, not by failing the command.
    async fn publish(&self, recorded: &RecordedEvent) {
        let body = match serde_json::to_string(recorded) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize event for publish");
                return;
            }
        };
        if let Err(e) = self.queue.send(body).await {
            tracing::warn!(
                event_id = %recorded.event_id,
                error = %e,
                "event publish failed; stream is ahead of the queue until redrive"
            );
        }
    }

    /// Take a snapshot at the just-appended version; failures swallowed.
    async fn snapshot<D: Decider>(&self, recorded: &RecordedEvent, state: Option<&D>) {
        let Some(state) = state else {
            return;
        };
        let state_value = match serde_json::to_value(state) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize snapshot state");
                return;
            }
        };
        let snapshot = StoredSnapshot::at(
            recorded.stream_type,
            recorded.stream_id,
            recorded.version,
            state_value,
            Utc::now(),
        );
        if let Err(e) = self.store.put_snapshot(&snapshot).await {
            tracing::warn!(
                stream_id = %recorded.stream_id,
                version = recorded.version,
                error = %e,
                "snapshot write failed, continuing"
            );
        }
    }

    /// Append the audit marker after an exhausted retry budget. Every
    /// failure here is swallowed -- telemetry must not mask the 409.
    async fn append_conflict_marker<D: Decider>(
        &self,
        stream_id: Uuid,
        info: &CommandInfo,
        attempts: u32,
    ) {
        let tail = match self.store.tail_version(D::STREAM_TYPE, stream_id).await {
            Ok(tail) => tail,
            Err(e) => {
                tracing::warn!(error = %e, "conflict marker skipped: tail reload failed");
                return;
            }
        };
        let payload = json!({
            "resourceId": stream_id,
            "commandName": info.name,
            "actorUserId": info.actor_user_id,
            "attempts": attempts,
            "lastKnownVersion": tail,
        });
        let marker = RecordedEvent::record(
            D::STREAM_TYPE,
            stream_id,
            tail + 1,
            CONFLICT_MARKER_TYPE,
            payload,
            Utc::now(),
            Value::Null,
        );
        if let Err(e) = self.store.append_event(&marker, tail).await {
            tracing::warn!(error = %e, "conflict marker append failed, swallowed");
        }
    }
}

fn event_meta(info: &CommandInfo) -> Value {
    let mut meta = serde_json::Map::new();
    meta.insert("commandName".into(), Value::String(info.name.into()));
    if let Some(actor) = info.actor_user_id {
        meta.insert("actorUserId".into(), Value::String(actor.to_string()));
    }
    Value::Object(meta)
}

fn map_store_error(err: EventStoreError) -> AppError {
    match err {
        EventStoreError::VersionConflict => AppError::new(
            ErrorCode::VersionConflict,
            "optimistic concurrency conflict",
        ),
        EventStoreError::StreamGap { expected, actual } => {
            AppError::new(ErrorCode::StreamGapDetected, "stream continuity broken")
                .with_meta(json!({"expected": expected, "actual": actual}))
        }
        other => AppError::internal(other.to_string()),
    }
}

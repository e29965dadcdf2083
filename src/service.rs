//! The command service: every mutating entry point, gated and composed.
//!
//! One `CommandService` owns the write side: it builds commands from
//! validated inputs (hashing passwords, stamping timestamps, consulting
//! advisory read-side checks), runs them through the [`CommandRunner`],
//! and wraps every entry point in the idempotency gate so a client key
//! binds to at most one effect and one reply.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::command::{
    Actor, BootstrapAdminInput, CommandReply, CreateReservationInput, CreateResourceInput,
    LoginUserInput, RegisterUserInput, UpdateResourceInput,
};
use crate::config::Config;
use crate::document_store::{DocumentStore, DocumentStoreError};
use crate::domain::resource::{ResourceCommand, ResourceState};
use crate::domain::user::{UserCommand, UserState};
use crate::error::{AppError, ErrorCode};
use crate::idempotency::{self, IdempotencyDecision, IdempotencyRecord, IdempotencyStore};
use crate::kdf::PasswordHasher;
use crate::object_store::BlobStore;
use crate::queue::MessageQueue;
use crate::readside::ReadSide;
use crate::runner::{CommandInfo, CommandRunner, RunnerOptions};
use crate::store::EventStore;

/// Write-side entry points over the wired stores.
#[derive(Clone)]
pub struct CommandService {
    runner: CommandRunner,
    idempotency: IdempotencyStore,
    readside: ReadSide,
    hasher: Arc<dyn PasswordHasher>,
    config: Arc<Config>,
}

impl CommandService {
    /// Wire a service over its backing stores.
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        docs: Arc<dyn DocumentStore>,
        queue: Arc<dyn MessageQueue>,
        hasher: Arc<dyn PasswordHasher>,
        config: Config,
    ) -> Self {
        let options = RunnerOptions {
            snapshots: config.snapshots.clone(),
            version_conflict_max_retries: config.version_conflict_max_retries,
            emit_concurrency_conflict_unresolved_event: config
                .emit_concurrency_conflict_unresolved_event,
        };
        let runner = CommandRunner::new(EventStore::new(blobs), queue, options);
        let idempotency = IdempotencyStore::new(docs.clone(), config.tables.idempotency.clone());
        let readside = ReadSide::new(docs, config.tables.clone());
        Self {
            runner,
            idempotency,
            readside,
            hasher,
            config: Arc::new(config),
        }
    }

    /// `BootstrapAdmin`: create the first admin, gated by the shared
    /// bootstrap key. Unauthenticated.
    pub async fn bootstrap_admin(
        &self,
        idempotency_key: Option<&str>,
        input: BootstrapAdminInput,
    ) -> CommandReply {
        let body = json!({"email": input.email, "password": input.password});
        self.gated(idempotency_key, "/auth/bootstrap", &body, None, || async move {
            if input.bootstrap_key != self.config.admin_bootstrap_key {
                return Err(AppError::new(
                    ErrorCode::BootstrapForbidden,
                    "bootstrap key mismatch",
                ));
            }
            if self.readside.email_taken(&input.email).await.map_err(store_err)? {
                return Err(AppError::new(
                    ErrorCode::UserAlreadyExists,
                    "email already registered",
                ));
            }

            let user_id = Uuid::now_v7();
            let password_hash = self.hasher.hash(&input.password);
            let info = CommandInfo {
                name: "BootstrapAdmin",
                actor_user_id: None,
            };
            self.runner
                .execute::<UserState, _>(user_id, info, |_| {
                    Ok(UserCommand::BootstrapAdmin {
                        user_id,
                        email: input.email.clone(),
                        password_hash: password_hash.clone(),
                    })
                })
                .await?;
            Ok(CommandReply::created(
                json!({"userId": user_id, "role": "admin"}),
            ))
        })
        .await
    }

    /// `RegisterUser`. Unauthenticated; email uniqueness is an advisory
    /// projection check, the stream guard is the decider's.
    pub async fn register_user(
        &self,
        idempotency_key: Option<&str>,
        input: RegisterUserInput,
    ) -> CommandReply {
        let body = json!({"email": input.email, "password": input.password, "role": input.role});
        self.gated(idempotency_key, "/auth/register", &body, None, || async move {
            if self.readside.email_taken(&input.email).await.map_err(store_err)? {
                return Err(AppError::new(
                    ErrorCode::UserAlreadyExists,
                    "email already registered",
                ));
            }

            let user_id = Uuid::now_v7();
            let password_hash = self.hasher.hash(&input.password);
            let info = CommandInfo {
                name: "RegisterUser",
                actor_user_id: None,
            };
            self.runner
                .execute::<UserState, _>(user_id, info, |_| {
                    Ok(UserCommand::RegisterUser {
                        user_id,
                        email: input.email.clone(),
                        password_hash: password_hash.clone(),
                        role: input.role,
                    })
                })
                .await?;
            Ok(CommandReply::created(
                json!({"userId": user_id, "role": input.role}),
            ))
        })
        .await
    }

    /// `LoginUser`: resolve the email through the projection, verify the
    /// password against the rehydrated hash, record the login.
    pub async fn login_user(
        &self,
        idempotency_key: Option<&str>,
        input: LoginUserInput,
    ) -> CommandReply {
        let body = json!({"email": input.email, "password": input.password});
        self.gated(idempotency_key, "/auth/login", &body, None, || async move {
            let Some(user_id) = self
                .readside
                .find_user_id_by_email(&input.email)
                .await
                .map_err(store_err)?
            else {
                // Indistinguishable from a wrong password on purpose.
                return Err(invalid_credentials());
            };

            let info = CommandInfo {
                name: "LoginUser",
                actor_user_id: Some(user_id),
            };
            let execution = self
                .runner
                .execute::<UserState, _>(user_id, info, |state| {
                    let user = state.ok_or_else(invalid_credentials)?;
                    if !self.hasher.verify(&input.password, &user.password_hash) {
                        return Err(invalid_credentials());
                    }
                    Ok(UserCommand::LoginUser {
                        email: input.email.clone(),
                    })
                })
                .await?;

            let role = execution
                .state
                .map(|user| serde_json::to_value(user.role).unwrap_or(Value::Null))
                .unwrap_or(Value::Null);
            Ok(CommandReply::ok(json!({"userId": user_id, "role": role})))
        })
        .await
    }

    /// `CreateResource` (admin only).
    pub async fn create_resource(
        &self,
        idempotency_key: Option<&str>,
        actor: Actor,
        input: CreateResourceInput,
    ) -> CommandReply {
        let body = json!({"name": input.name, "details": input.details});
        self.gated(
            idempotency_key,
            "/resources",
            &body,
            Some(actor.user_id),
            || async move {
                if self
                    .readside
                    .resource_name_taken(&input.name)
                    .await
                    .map_err(store_err)?
                {
                    return Err(AppError::new(
                        ErrorCode::ResourceNameTaken,
                        "resource name already in use",
                    ));
                }

                let resource_id = Uuid::now_v7();
                let info = CommandInfo {
                    name: "CreateResource",
                    actor_user_id: Some(actor.user_id),
                };
                self.runner
                    .execute::<ResourceState, _>(resource_id, info, |_| {
                        Ok(ResourceCommand::CreateResource {
                            resource_id,
                            name: input.name.clone(),
                            details: input.details.clone(),
                            actor_role: actor.role,
                        })
                    })
                    .await?;
                Ok(CommandReply::created(json!({"resourceId": resource_id})))
            },
        )
        .await
    }

    /// `UpdateResourceMetadata` (admin only).
    pub async fn update_resource(
        &self,
        idempotency_key: Option<&str>,
        actor: Actor,
        resource_id: Uuid,
        input: UpdateResourceInput,
    ) -> CommandReply {
        let path = format!("/resources/{resource_id}");
        let body = serde_json::to_value(&input).unwrap_or(Value::Null);
        self.gated(idempotency_key, &path, &body, Some(actor.user_id), || async move {
            let info = CommandInfo {
                name: "UpdateResourceMetadata",
                actor_user_id: Some(actor.user_id),
            };
            self.runner
                .execute::<ResourceState, _>(resource_id, info, |_| {
                    Ok(ResourceCommand::UpdateResourceMetadata {
                        name: input.name.clone(),
                        details: input.details.clone(),
                        actor_role: actor.role,
                    })
                })
                .await?;
            Ok(CommandReply::ok(json!({"resourceId": resource_id})))
        })
        .await
    }

    /// `CreateReservationInResource`: any authenticated user books for
    /// themselves.
    pub async fn create_reservation(
        &self,
        idempotency_key: Option<&str>,
        actor: Actor,
        resource_id: Uuid,
        input: CreateReservationInput,
    ) -> CommandReply {
        let path = format!("/resources/{resource_id}/reservations");
        let body = json!({"fromUtc": input.from_utc, "toUtc": input.to_utc});
        self.gated(idempotency_key, &path, &body, Some(actor.user_id), || async move {
            let reservation_id = Uuid::now_v7();
            let info = CommandInfo {
                name: "CreateReservationInResource",
                actor_user_id: Some(actor.user_id),
            };
            self.runner
                .execute::<ResourceState, _>(resource_id, info, |_| {
                    Ok(ResourceCommand::CreateReservation {
                        reservation_id,
                        user_id: actor.user_id,
                        from_utc: input.from_utc,
                        to_utc: input.to_utc,
                        // Stamped per attempt: a retried command is
                        // re-validated against the current clock.
                        now_utc: Utc::now(),
                    })
                })
                .await?;
            Ok(CommandReply::created(
                json!({"reservationId": reservation_id, "resourceId": resource_id}),
            ))
        })
        .await
    }

    /// `CancelReservationInResource`: the owner or any admin.
    pub async fn cancel_reservation(
        &self,
        idempotency_key: Option<&str>,
        actor: Actor,
        resource_id: Uuid,
        reservation_id: Uuid,
    ) -> CommandReply {
        let path = format!("/resources/{resource_id}/reservations/{reservation_id}");
        let body = json!({});
        self.gated(idempotency_key, &path, &body, Some(actor.user_id), || async move {
            let info = CommandInfo {
                name: "CancelReservationInResource",
                actor_user_id: Some(actor.user_id),
            };
            self.runner
                .execute::<ResourceState, _>(resource_id, info, |_| {
                    Ok(ResourceCommand::CancelReservation {
                        reservation_id,
                        actor_user_id: actor.user_id,
                        actor_role: actor.role,
                        cancelled_at_utc: Utc::now(),
                    })
                })
                .await?;
            Ok(CommandReply::ok(
                json!({"reservationId": reservation_id, "status": "cancelled"}),
            ))
        })
        .await
    }

    /// The idempotency gate wrapped around every mutating command.
    ///
    /// Missing key: 400 before anything runs. Replay: the stored reply,
    /// verbatim, with no side effects. Mismatch: 409. New: run the
    /// command, then best-effort save -- a save failure (including losing
    /// to a concurrent duplicate) never fails the reply, because the
    /// event append itself is version-guarded.
    async fn gated<F, Fut>(
        &self,
        idempotency_key: Option<&str>,
        path: &str,
        body: &Value,
        actor: Option<Uuid>,
        run: F,
    ) -> CommandReply
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CommandReply, AppError>>,
    {
        let Some(key) = idempotency_key.filter(|key| !key.is_empty()) else {
            return CommandReply::from(&AppError::new(
                ErrorCode::MissingIdempotencyKey,
                "Idempotency-Key header required",
            ));
        };

        let content = idempotency::fingerprint(path, body, actor);
        let existing = match self.idempotency.load(key).await {
            Ok(existing) => existing,
            Err(e) => {
                // Treat an unreadable record as absent; the append guard
                // keeps a re-run harmless.
                tracing::warn!(key = %key, error = %e, "idempotency load failed");
                None
            }
        };

        match idempotency::decide(existing, &content) {
            IdempotencyDecision::Replay(record) => {
                tracing::debug!(key = %key, "idempotent replay");
                CommandReply::new(record.status_code, record.response_body)
            }
            IdempotencyDecision::Mismatch => CommandReply::from(&AppError::new(
                ErrorCode::IdempotencyHashMismatch,
                "idempotency key reused with different content",
            )),
            IdempotencyDecision::New { content_hash } => {
                let reply = match run().await {
                    Ok(reply) => reply,
                    Err(e) => CommandReply::from(&e),
                };
                let record = IdempotencyRecord {
                    idempotency_key: key.to_string(),
                    content_hash,
                    status_code: reply.status_code,
                    response_body: reply.body.clone(),
                    created_at_utc: Utc::now(),
                };
                match self.idempotency.save(&record).await {
                    Ok(()) => {}
                    Err(DocumentStoreError::AlreadyExists { .. }) => {
                        tracing::debug!(key = %key, "lost idempotency save race, keeping stored reply");
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "idempotency save failed");
                    }
                }
                reply
            }
        }
    }
}

fn store_err(err: DocumentStoreError) -> AppError {
    AppError::internal(err.to_string())
}

fn invalid_credentials() -> AppError {
    AppError::new(ErrorCode::InvalidCredentials, "invalid credentials")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_store::InMemoryDocumentStore;
    use crate::kdf::IteratedSha256;
    use crate::object_store::InMemoryBlobStore;
    use crate::queue::DisabledQueue;

    fn service() -> CommandService {
        CommandService::new(
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(DisabledQueue),
            Arc::new(IteratedSha256::with_iterations(2)),
            Config::default(),
        )
    }

    fn bootstrap_input() -> BootstrapAdminInput {
        BootstrapAdminInput {
            bootstrap_key: "bootstrap-local-key".into(),
            email: "admin@test.com".into(),
            password: "Password123".into(),
        }
    }

    #[tokio::test]
    async fn missing_idempotency_key_rejected_up_front() {
        let service = service();
        let reply = service.bootstrap_admin(None, bootstrap_input()).await;
        assert_eq!(reply.status_code, 400);
        assert_eq!(reply.body["error"]["code"], "MISSING_IDEMPOTENCY_KEY");
    }

    #[tokio::test]
    async fn empty_idempotency_key_counts_as_missing() {
        let service = service();
        let reply = service.bootstrap_admin(Some(""), bootstrap_input()).await;
        assert_eq!(reply.status_code, 400);
    }

    #[tokio::test]
    async fn wrong_bootstrap_key_is_forbidden() {
        let service = service();
        let mut input = bootstrap_input();
        input.bootstrap_key = "not-the-key".into();
        let reply = service.bootstrap_admin(Some("k-1"), input).await;
        assert_eq!(reply.status_code, 403);
        assert_eq!(reply.body["error"]["code"], "BOOTSTRAP_FORBIDDEN");
    }

    #[tokio::test]
    async fn bootstrap_creates_admin() {
        let service = service();
        let reply = service.bootstrap_admin(Some("k-1"), bootstrap_input()).await;
        assert_eq!(reply.status_code, 201);
        assert_eq!(reply.body["role"], "admin");
        assert!(reply.body.get("userId").is_some());
    }

    #[tokio::test]
    async fn replay_returns_identical_reply_without_second_effect() {
        let service = service();
        let first = service.bootstrap_admin(Some("k-1"), bootstrap_input()).await;
        let second = service.bootstrap_admin(Some("k-1"), bootstrap_input()).await;
        assert_eq!(first, second, "replay must be byte-identical");
    }

    #[tokio::test]
    async fn same_key_different_content_mismatches() {
        let service = service();
        let first = service.bootstrap_admin(Some("k-1"), bootstrap_input()).await;
        assert_eq!(first.status_code, 201);

        let mut changed = bootstrap_input();
        changed.email = "other@test.com".into();
        let second = service.bootstrap_admin(Some("k-1"), changed).await;
        assert_eq!(second.status_code, 409);
        assert_eq!(second.body["error"]["code"], "IDEMPOTENCY_HASH_MISMATCH");
    }

    #[tokio::test]
    async fn login_against_unknown_email_is_unauthorized() {
        let service = service();
        let reply = service
            .login_user(
                Some("k-login"),
                LoginUserInput {
                    email: "ghost@test.com".into(),
                    password: "pw".into(),
                },
            )
            .await;
        assert_eq!(reply.status_code, 401);
        assert_eq!(reply.body["error"]["code"], "INVALID_CREDENTIALS");
    }
}

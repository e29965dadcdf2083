//! Event-sourced reservation service: the command core.
//!
//! Every state change is an immutable event appended to a per-aggregate
//! stream in an object store; an asynchronous worker projects events into
//! query-side tables. This crate is the write side plus that worker --
//! transport, token issuance, and the query API live elsewhere and
//! consume the contracts exposed here.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`EventStore`] | Append-only per-stream log over a [`BlobStore`]; snapshots; gap-checked reads |
//! | [`Decider`] | Pure domain core: `decide(state, command)` and `fold(state, event)` |
//! | [`CommandRunner`] | Rehydrate, decide, append with bounded retry, publish, snapshot |
//! | [`CommandService`] | Per-command entry points under the idempotency gate |
//! | [`ProjectionWorker`] | Queue-draining loop applying idempotent ops to query tables |
//! | [`Config`] | The recognized options and their environment surface |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use reserva::{
//!     BootstrapAdminInput, CommandService, Config, DisabledQueue, InMemoryBlobStore,
//!     InMemoryDocumentStore, IteratedSha256,
//! };
//!
//! # async fn run() {
//! let service = CommandService::new(
//!     Arc::new(InMemoryBlobStore::new()),
//!     Arc::new(InMemoryDocumentStore::new()),
//!     Arc::new(DisabledQueue),
//!     Arc::new(IteratedSha256::default()),
//!     Config::from_env(),
//! );
//!
//! let reply = service
//!     .bootstrap_admin(
//!         Some("idem-key-1"),
//!         BootstrapAdminInput {
//!             bootstrap_key: "bootstrap-local-key".into(),
//!             email: "admin@test.com".into(),
//!             password: "Password123".into(),
//!         },
//!     )
//!     .await;
//! assert_eq!(reply.status_code, 201);
//! # }
//! ```
//!
//! The only concurrency control in the system is the blob store's
//! create-if-absent put on version-encoded keys; everything else follows
//! from it. See each module's docs for the fine print.

pub mod command;
pub mod config;
pub mod document_store;
pub mod domain;
pub mod error;
pub mod event;
pub mod idempotency;
pub mod kdf;
pub mod object_store;
pub mod projector;
pub mod queue;
pub mod readside;
pub mod runner;
pub mod service;
pub mod snapshot;
pub mod storage;
pub mod store;
pub mod worker;

pub use command::{
    Actor, BootstrapAdminInput, CommandReply, CreateReservationInput, CreateResourceInput,
    LoginUserInput, RegisterUserInput, UpdateResourceInput,
};
pub use config::{Config, ProjectionTables};
pub use document_store::{DocumentStore, DocumentStoreError, InMemoryDocumentStore, ScanPage};
pub use domain::Decider;
pub use domain::resource::{Reservation, ReservationStatus, ResourceState, ResourceStatus};
pub use domain::user::{Role, UserState};
pub use error::{AppError, ErrorCode};
pub use event::{RecordedEvent, StreamType};
pub use idempotency::{IdempotencyDecision, IdempotencyRecord, IdempotencyStore};
pub use kdf::{IteratedSha256, PasswordHasher};
pub use object_store::{BlobPage, BlobStore, BlobStoreError, InMemoryBlobStore};
pub use projector::{ProjectionOp, project};
pub use queue::{DisabledQueue, InMemoryQueue, MessageQueue, QueueError, QueueMessage};
pub use readside::ReadSide;
pub use runner::{CommandInfo, CommandRunner, Execution, RunnerOptions};
pub use service::CommandService;
pub use snapshot::{SnapshotPolicy, StoredSnapshot};
pub use store::{EventStore, EventStoreError};
pub use worker::{ProjectionWorker, WorkerError};

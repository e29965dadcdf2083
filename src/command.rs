//! Actor claims, validated command inputs, and the reply envelope.
//!
//! The transport validates request schemas and bearer tokens before the
//! core runs; what arrives here is already well-formed. Input structs are
//! the `payload` halves of the `{command: {type, payload}}` envelopes and
//! double as the `body` part of the idempotency fingerprint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::user::Role;
use crate::error::AppError;

/// The authenticated subject, extracted from verified bearer claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn admin(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: Role::Admin,
        }
    }

    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: Role::User,
        }
    }
}

fn default_role() -> Role {
    Role::User
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapAdminInput {
    /// Presented `x-admin-bootstrap-key` value.
    pub bootstrap_key: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterUserInput {
    pub email: String,
    pub password: String,
    #[serde(default = "default_role")]
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginUserInput {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResourceInput {
    pub name: String,
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResourceInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReservationInput {
    pub from_utc: DateTime<Utc>,
    pub to_utc: DateTime<Utc>,
}

/// What the transport sends back: an HTTP status and a JSON body.
///
/// Stored verbatim by the idempotency layer, so replays are
/// byte-identical to the first reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReply {
    pub status_code: u16,
    pub body: Value,
}

impl CommandReply {
    pub fn new(status_code: u16, body: Value) -> Self {
        Self { status_code, body }
    }

    /// 201 with the given body.
    pub fn created(body: Value) -> Self {
        Self::new(201, body)
    }

    /// 200 with the given body.
    pub fn ok(body: Value) -> Self {
        Self::new(200, body)
    }
}

impl From<&AppError> for CommandReply {
    fn from(err: &AppError) -> Self {
        Self::new(err.status(), err.to_body())
    }
}

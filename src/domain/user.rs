//! The `user` aggregate: bootstrap, registration, and login.
//!
//! Email uniqueness is an advisory read-side check done by the command
//! builders; the decider only guards its own stream. Password hashes are
//! opaque strings produced by the KDF layer -- the decider never sees a
//! raw password.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, ErrorCode};
use crate::event::StreamType;

use super::Decider;

/// Authorization role carried in bearer claims and user state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

/// Current state of one user stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserState {
    pub user_id: Uuid,
    pub email: String,
    /// Opaque KDF output; stored in user event payloads.
    pub password_hash: String,
    pub role: Role,
}

/// Fully built user commands.
#[derive(Debug, Clone)]
pub enum UserCommand {
    BootstrapAdmin {
        user_id: Uuid,
        email: String,
        password_hash: String,
    },
    RegisterUser {
        user_id: Uuid,
        email: String,
        password_hash: String,
        role: Role,
    },
    LoginUser {
        email: String,
    },
}

/// Events recorded on user streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all_fields = "camelCase")]
pub enum UserEvent {
    AdminBootstrapped {
        user_id: Uuid,
        email: String,
        password_hash: String,
        role: Role,
    },
    UserRegistered {
        user_id: Uuid,
        email: String,
        password_hash: String,
        role: Role,
    },
    /// State-preserving: folded as identity.
    UserLoggedIn {
        user_id: Uuid,
        email: String,
    },
}

/// User command rejections.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UserError {
    #[error("user stream already initialized")]
    AlreadyExists,
    #[error("invalid credentials")]
    InvalidCredentials,
}

impl From<UserError> for AppError {
    fn from(err: UserError) -> Self {
        match err {
            UserError::AlreadyExists => {
                AppError::new(ErrorCode::UserAlreadyExists, err.to_string())
            }
            UserError::InvalidCredentials => {
                AppError::new(ErrorCode::InvalidCredentials, err.to_string())
            }
        }
    }
}

impl Decider for UserState {
    const STREAM_TYPE: StreamType = StreamType::User;

    type Command = UserCommand;
    type Event = UserEvent;
    type Error = UserError;

    fn decide(state: Option<&Self>, cmd: &Self::Command) -> Result<Self::Event, Self::Error> {
        match cmd {
            UserCommand::BootstrapAdmin {
                user_id,
                email,
                password_hash,
            } => {
                if state.is_some() {
                    return Err(UserError::AlreadyExists);
                }
                Ok(UserEvent::AdminBootstrapped {
                    user_id: *user_id,
                    email: email.clone(),
                    password_hash: password_hash.clone(),
                    role: Role::Admin,
                })
            }
            UserCommand::RegisterUser {
                user_id,
                email,
                password_hash,
                role,
            } => {
                if state.is_some() {
                    return Err(UserError::AlreadyExists);
                }
                Ok(UserEvent::UserRegistered {
                    user_id: *user_id,
                    email: email.clone(),
                    password_hash: password_hash.clone(),
                    role: *role,
                })
            }
            UserCommand::LoginUser { email } => match state {
                Some(user) if user.email == *email => Ok(UserEvent::UserLoggedIn {
                    user_id: user.user_id,
                    email: email.clone(),
                }),
                _ => Err(UserError::InvalidCredentials),
            },
        }
    }

    fn fold(state: Option<Self>, event: &Self::Event) -> Option<Self> {
        match event {
            UserEvent::AdminBootstrapped {
                user_id,
                email,
                password_hash,
                role,
            }
            | UserEvent::UserRegistered {
                user_id,
                email,
                password_hash,
                role,
            } => Some(UserState {
                user_id: *user_id,
                email: email.clone(),
                password_hash: password_hash.clone(),
                role: *role,
            }),
            UserEvent::UserLoggedIn { .. } => state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered() -> UserState {
        UserState::fold(
            None,
            &UserEvent::UserRegistered {
                user_id: Uuid::now_v7(),
                email: "ana@test.com".into(),
                password_hash: "h1".into(),
                role: Role::User,
            },
        )
        .expect("registration should create state")
    }

    #[test]
    fn bootstrap_on_empty_stream_emits_admin() {
        let cmd = UserCommand::BootstrapAdmin {
            user_id: Uuid::now_v7(),
            email: "admin@test.com".into(),
            password_hash: "h".into(),
        };
        let event = UserState::decide(None, &cmd).expect("bootstrap should be accepted");
        assert!(
            matches!(event, UserEvent::AdminBootstrapped { role: Role::Admin, .. }),
            "bootstrap must always yield an admin, got: {event:?}"
        );
    }

    #[test]
    fn bootstrap_on_existing_stream_rejected() {
        let state = registered();
        let cmd = UserCommand::BootstrapAdmin {
            user_id: Uuid::now_v7(),
            email: "other@test.com".into(),
            password_hash: "h".into(),
        };
        let result = UserState::decide(Some(&state), &cmd);
        assert_eq!(result, Err(UserError::AlreadyExists));
    }

    #[test]
    fn register_on_existing_stream_rejected() {
        let state = registered();
        let cmd = UserCommand::RegisterUser {
            user_id: state.user_id,
            email: state.email.clone(),
            password_hash: "h2".into(),
            role: Role::User,
        };
        assert_eq!(
            UserState::decide(Some(&state), &cmd),
            Err(UserError::AlreadyExists)
        );
    }

    #[test]
    fn login_with_matching_email_accepted() {
        let state = registered();
        let cmd = UserCommand::LoginUser {
            email: "ana@test.com".into(),
        };
        let event = UserState::decide(Some(&state), &cmd).expect("login should be accepted");
        assert!(matches!(event, UserEvent::UserLoggedIn { .. }));
    }

    #[test]
    fn login_with_wrong_email_rejected() {
        let state = registered();
        let cmd = UserCommand::LoginUser {
            email: "someone-else@test.com".into(),
        };
        assert_eq!(
            UserState::decide(Some(&state), &cmd),
            Err(UserError::InvalidCredentials)
        );
    }

    #[test]
    fn login_on_empty_stream_rejected() {
        let cmd = UserCommand::LoginUser {
            email: "ana@test.com".into(),
        };
        assert_eq!(
            UserState::decide(None, &cmd),
            Err(UserError::InvalidCredentials)
        );
    }

    #[test]
    fn login_folds_as_identity() {
        let state = registered();
        let before = state.clone();
        let after = UserState::fold(
            Some(state),
            &UserEvent::UserLoggedIn {
                user_id: before.user_id,
                email: before.email.clone(),
            },
        )
        .expect("state should survive login fold");
        assert_eq!(after, before);
    }

    #[test]
    fn event_wire_tags_match_taxonomy() {
        let (ty, payload) = crate::event::encode_event(&UserEvent::UserRegistered {
            user_id: Uuid::now_v7(),
            email: "ana@test.com".into(),
            password_hash: "h".into(),
            role: Role::User,
        })
        .expect("encode should succeed");
        assert_eq!(ty, "UserRegistered");
        assert_eq!(payload["email"], "ana@test.com");
        assert_eq!(payload["passwordHash"], "h");
        assert_eq!(payload["role"], "user");
    }
}

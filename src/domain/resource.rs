//! The `resource` aggregate: metadata and the reservation calendar.
//!
//! Reservations exist only inside their owning resource stream, so the
//! no-overlap invariant is enforced here and nowhere else. Intervals are
//! half-open `[from, to)`: two reservations conflict iff
//! `a.from < b.to && b.from < a.to`, which makes back-to-back bookings
//! (`[10:00, 11:00)` then `[11:00, 12:00)`) legal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::{AppError, ErrorCode};
use crate::event::StreamType;

use super::Decider;
use super::user::Role;

/// Lifecycle status of a resource. Only `Active` exists today; the enum
/// keeps the wire field forward-compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Active,
    Cancelled,
}

/// One booking inside a resource's calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub reservation_id: Uuid,
    pub user_id: Uuid,
    pub from_utc: DateTime<Utc>,
    pub to_utc: DateTime<Utc>,
    pub status: ReservationStatus,
    pub created_at_utc: DateTime<Utc>,
    pub cancelled_at_utc: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }

    /// Half-open interval intersection against `[from, to)`.
    fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        from < self.to_utc && self.from_utc < to
    }
}

/// Current state of one resource stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    pub resource_id: Uuid,
    pub name: String,
    pub details: String,
    pub status: ResourceStatus,
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    /// The first active reservation intersecting `[from, to)`, if any.
    fn conflicting(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Option<&Reservation> {
        self.reservations
            .iter()
            .find(|r| r.is_active() && r.overlaps(from, to))
    }
}

/// Fully built resource commands. Actor identity and `now_utc` are
/// resolved by the builders, keeping the decider clock-free.
#[derive(Debug, Clone)]
pub enum ResourceCommand {
    CreateResource {
        resource_id: Uuid,
        name: String,
        details: String,
        actor_role: Role,
    },
    UpdateResourceMetadata {
        name: Option<String>,
        details: Option<String>,
        actor_role: Role,
    },
    CreateReservation {
        reservation_id: Uuid,
        user_id: Uuid,
        from_utc: DateTime<Utc>,
        to_utc: DateTime<Utc>,
        now_utc: DateTime<Utc>,
    },
    CancelReservation {
        reservation_id: Uuid,
        actor_user_id: Uuid,
        actor_role: Role,
        cancelled_at_utc: DateTime<Utc>,
    },
}

/// Events recorded on resource streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all_fields = "camelCase")]
pub enum ResourceEvent {
    ResourceCreated {
        resource_id: Uuid,
        name: String,
        details: String,
    },
    ResourceMetadataUpdated {
        name: Option<String>,
        details: Option<String>,
    },
    ReservationAddedToResource {
        reservation_id: Uuid,
        user_id: Uuid,
        from_utc: DateTime<Utc>,
        to_utc: DateTime<Utc>,
        created_at_utc: DateTime<Utc>,
    },
    ResourceReservationCancelled {
        reservation_id: Uuid,
        cancelled_at_utc: DateTime<Utc>,
    },
}

/// Resource command rejections.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("admin role required")]
    Forbidden,
    #[error("resource stream already initialized")]
    AlreadyExists,
    #[error("resource does not exist")]
    NotFound,
    #[error("reservation interval must end after it starts")]
    InvalidInterval,
    #[error("reservation starts in the past")]
    InPast,
    #[error("interval overlaps an active reservation")]
    Overlap { conflicting: Uuid },
    #[error("reservation does not exist")]
    ReservationNotFound,
    #[error("reservation is already cancelled")]
    AlreadyCancelled,
    #[error("only an admin or the reservation owner may cancel")]
    UnauthorizedCancel,
}

impl From<ResourceError> for AppError {
    fn from(err: ResourceError) -> Self {
        let reason = err.to_string();
        match err {
            ResourceError::Forbidden => AppError::new(ErrorCode::Forbidden, reason),
            ResourceError::AlreadyExists => {
                AppError::new(ErrorCode::ResourceAlreadyExists, reason)
            }
            ResourceError::NotFound => AppError::new(ErrorCode::ResourceNotFound, reason),
            ResourceError::InvalidInterval => AppError::new(ErrorCode::InvalidInterval, reason),
            ResourceError::InPast => AppError::new(ErrorCode::ReservationInPast, reason),
            ResourceError::Overlap { conflicting } => {
                AppError::new(ErrorCode::ReservationOverlap, reason)
                    .with_meta(json!({"conflictingReservationId": conflicting}))
            }
            ResourceError::ReservationNotFound => {
                AppError::new(ErrorCode::ReservationNotFound, reason)
            }
            ResourceError::AlreadyCancelled => {
                AppError::new(ErrorCode::ReservationAlreadyCancelled, reason)
            }
            ResourceError::UnauthorizedCancel => {
                AppError::new(ErrorCode::UnauthorizedCancel, reason)
            }
        }
    }
}

impl Decider for ResourceState {
    const STREAM_TYPE: StreamType = StreamType::Resource;

    type Command = ResourceCommand;
    type Event = ResourceEvent;
    type Error = ResourceError;

    fn decide(state: Option<&Self>, cmd: &Self::Command) -> Result<Self::Event, Self::Error> {
        match cmd {
            ResourceCommand::CreateResource {
                resource_id,
                name,
                details,
                actor_role,
            } => {
                if *actor_role != Role::Admin {
                    return Err(ResourceError::Forbidden);
                }
                if state.is_some() {
                    return Err(ResourceError::AlreadyExists);
                }
                Ok(ResourceEvent::ResourceCreated {
                    resource_id: *resource_id,
                    name: name.clone(),
                    details: details.clone(),
                })
            }

            ResourceCommand::UpdateResourceMetadata {
                name,
                details,
                actor_role,
            } => {
                if *actor_role != Role::Admin {
                    return Err(ResourceError::Forbidden);
                }
                if state.is_none() {
                    return Err(ResourceError::NotFound);
                }
                Ok(ResourceEvent::ResourceMetadataUpdated {
                    name: name.clone(),
                    details: details.clone(),
                })
            }

            ResourceCommand::CreateReservation {
                reservation_id,
                user_id,
                from_utc,
                to_utc,
                now_utc,
            } => {
                let resource = state.ok_or(ResourceError::NotFound)?;
                if from_utc >= to_utc {
                    return Err(ResourceError::InvalidInterval);
                }
                if from_utc < now_utc {
                    return Err(ResourceError::InPast);
                }
                if let Some(conflict) = resource.conflicting(*from_utc, *to_utc) {
                    return Err(ResourceError::Overlap {
                        conflicting: conflict.reservation_id,
                    });
                }
                Ok(ResourceEvent::ReservationAddedToResource {
                    reservation_id: *reservation_id,
                    user_id: *user_id,
                    from_utc: *from_utc,
                    to_utc: *to_utc,
                    created_at_utc: *now_utc,
                })
            }

            ResourceCommand::CancelReservation {
                reservation_id,
                actor_user_id,
                actor_role,
                cancelled_at_utc,
            } => {
                let resource = state.ok_or(ResourceError::NotFound)?;
                let reservation = resource
                    .reservations
                    .iter()
                    .find(|r| r.reservation_id == *reservation_id)
                    .ok_or(ResourceError::ReservationNotFound)?;
                if !reservation.is_active() {
                    return Err(ResourceError::AlreadyCancelled);
                }
                if *actor_role != Role::Admin && reservation.user_id != *actor_user_id {
                    return Err(ResourceError::UnauthorizedCancel);
                }
                Ok(ResourceEvent::ResourceReservationCancelled {
                    reservation_id: *reservation_id,
                    cancelled_at_utc: *cancelled_at_utc,
                })
            }
        }
    }

    fn fold(state: Option<Self>, event: &Self::Event) -> Option<Self> {
        match event {
            ResourceEvent::ResourceCreated {
                resource_id,
                name,
                details,
            } => Some(ResourceState {
                resource_id: *resource_id,
                name: name.clone(),
                details: details.clone(),
                status: ResourceStatus::Active,
                reservations: Vec::new(),
            }),

            ResourceEvent::ResourceMetadataUpdated { name, details } => state.map(|mut s| {
                if let Some(name) = name {
                    s.name = name.clone();
                }
                if let Some(details) = details {
                    s.details = details.clone();
                }
                s
            }),

            ResourceEvent::ReservationAddedToResource {
                reservation_id,
                user_id,
                from_utc,
                to_utc,
                created_at_utc,
            } => state.map(|mut s| {
                s.reservations.push(Reservation {
                    reservation_id: *reservation_id,
                    user_id: *user_id,
                    from_utc: *from_utc,
                    to_utc: *to_utc,
                    status: ReservationStatus::Active,
                    created_at_utc: *created_at_utc,
                    cancelled_at_utc: None,
                });
                s
            }),

            ResourceEvent::ResourceReservationCancelled {
                reservation_id,
                cancelled_at_utc,
            } => state.map(|mut s| {
                if let Some(r) = s
                    .reservations
                    .iter_mut()
                    .find(|r| r.reservation_id == *reservation_id)
                {
                    r.status = ReservationStatus::Cancelled;
                    r.cancelled_at_utc = Some(*cancelled_at_utc);
                }
                s
            }),
        }
    }
}

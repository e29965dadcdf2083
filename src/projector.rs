//! Pure projection: one recorded event to an ordered list of table ops.
//!
//! The projector never touches a store. It decodes the event payload
//! through the domain event enums and emits [`ProjectionOp`]s for the
//! worker to apply. Every op is idempotent -- full-item puts keyed by the
//! aggregate id, or attribute sets to event-derived values -- so
//! at-least-once delivery converges on the same table state.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::resource::ResourceEvent;
use crate::domain::user::{Role, UserEvent};
use crate::event::{RecordedEvent, StreamType, decode_event};

/// One idempotent write against the query-side tables.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionOp {
    PutUser {
        user_id: Uuid,
        email: String,
        role: Role,
        created_at_utc: DateTime<Utc>,
    },
    SetUserLastLogin {
        user_id: Uuid,
        last_login_at_utc: DateTime<Utc>,
    },
    PutResource {
        resource_id: Uuid,
        name: String,
        details: String,
        created_at_utc: DateTime<Utc>,
        updated_at_utc: DateTime<Utc>,
    },
    UpdateResourceDetails {
        resource_id: Uuid,
        name: Option<String>,
        details: Option<String>,
        updated_at_utc: DateTime<Utc>,
    },
    PutReservation {
        reservation_id: Uuid,
        resource_id: Uuid,
        user_id: Uuid,
        from_utc: DateTime<Utc>,
        to_utc: DateTime<Utc>,
        created_at_utc: DateTime<Utc>,
    },
    CancelReservation {
        reservation_id: Uuid,
        cancelled_at_utc: DateTime<Utc>,
    },
}

/// Map one recorded event to its projection ops.
///
/// Events the projector does not recognize (foreign writers, newer
/// schema) produce no ops.
pub fn project(event: &RecordedEvent) -> Vec<ProjectionOp> {
    match event.stream_type {
        StreamType::User => decode_event::<UserEvent>(&event.event_type, &event.payload)
            .map(|decoded| project_user(event, &decoded))
            .unwrap_or_default(),
        StreamType::Resource => decode_event::<ResourceEvent>(&event.event_type, &event.payload)
            .map(|decoded| project_resource(event, &decoded))
            .unwrap_or_default(),
    }
}

fn project_user(event: &RecordedEvent, decoded: &UserEvent) -> Vec<ProjectionOp> {
    match decoded {
        UserEvent::AdminBootstrapped { user_id, email, .. } => vec![ProjectionOp::PutUser {
            user_id: *user_id,
            email: email.clone(),
            role: Role::Admin,
            created_at_utc: event.occurred_at_utc,
        }],
        UserEvent::UserRegistered {
            user_id,
            email,
            role,
            ..
        } => vec![ProjectionOp::PutUser {
            user_id: *user_id,
            email: email.clone(),
            role: *role,
            created_at_utc: event.occurred_at_utc,
        }],
        UserEvent::UserLoggedIn { user_id, .. } => vec![ProjectionOp::SetUserLastLogin {
            user_id: *user_id,
            last_login_at_utc: event.occurred_at_utc,
        }],
    }
}

fn project_resource(event: &RecordedEvent, decoded: &ResourceEvent) -> Vec<ProjectionOp> {
    match decoded {
        ResourceEvent::ResourceCreated {
            resource_id,
            name,
            details,
        } => vec![ProjectionOp::PutResource {
            resource_id: *resource_id,
            name: name.clone(),
            details: details.clone(),
            created_at_utc: event.occurred_at_utc,
            updated_at_utc: event.occurred_at_utc,
        }],
        ResourceEvent::ResourceMetadataUpdated { name, details } => {
            vec![ProjectionOp::UpdateResourceDetails {
                resource_id: event.stream_id,
                name: name.clone(),
                details: details.clone(),
                updated_at_utc: event.occurred_at_utc,
            }]
        }
        ResourceEvent::ReservationAddedToResource {
            reservation_id,
            user_id,
            from_utc,
            to_utc,
            created_at_utc,
        } => vec![ProjectionOp::PutReservation {
            reservation_id: *reservation_id,
            resource_id: event.stream_id,
            user_id: *user_id,
            from_utc: *from_utc,
            to_utc: *to_utc,
            created_at_utc: *created_at_utc,
        }],
        ResourceEvent::ResourceReservationCancelled {
            reservation_id,
            cancelled_at_utc,
        } => vec![ProjectionOp::CancelReservation {
            reservation_id: *reservation_id,
            cancelled_at_utc: *cancelled_at_utc,
        }],
    }
}

//! Pure domain deciders.
//!
//! A decider is two functions over one aggregate: `decide` validates a
//! command against the current state and names the event that records it,
//! and `fold` derives the next state from an event. Both are pure -- no
//! I/O, no clock reads, no randomness. Everything effectful (hashing,
//! timestamps, identifier generation, read-side lookups) happens in the
//! command builders before `decide` runs.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::AppError;
use crate::event::{RecordedEvent, StreamType, decode_event};

pub mod resource;
pub mod user;

/// One aggregate family's pure decision core.
///
/// The implementing type is the aggregate state itself. State is modeled
/// as `Option<Self>`: `None` until the stream's creation event, `Some`
/// after.
///
/// # Contract
///
/// - `decide` is a pure decision function over `(state, command)`. It
///   either names exactly one event or rejects with a domain error.
/// - `fold` is pure and total. Events that do not apply to the current
///   state (including events from newer writers the fold does not know)
///   leave it unchanged.
pub trait Decider: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The stream family this decider owns.
    const STREAM_TYPE: StreamType;

    /// Commands this aggregate accepts, fully built (hashes, timestamps,
    /// and actor identity already resolved).
    type Command: Send + Sync;

    /// Events this aggregate records and folds.
    type Event: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Command rejection reasons; each maps onto the wire error taxonomy.
    type Error: std::error::Error + Into<AppError> + Send + Sync + 'static;

    /// Validate a command against the current state.
    fn decide(state: Option<&Self>, cmd: &Self::Command) -> Result<Self::Event, Self::Error>;

    /// Derive the next state from an event.
    fn fold(state: Option<Self>, event: &Self::Event) -> Option<Self>;
}

/// Fold one recorded event into the state, skipping unknown event types.
///
/// The payload is decoded through the adjacently tagged event enum;
/// decode failures (foreign or newer event types) fold as identity, which
/// is what keeps replays total.
pub fn fold_recorded<D: Decider>(state: Option<D>, recorded: &RecordedEvent) -> Option<D> {
    match decode_event::<D::Event>(&recorded.event_type, &recorded.payload) {
        Some(event) => D::fold(state, &event),
        None => state,
    }
}

/// Fold a contiguous run of recorded events onto a starting state.
pub fn replay<'a, D, I>(state: Option<D>, events: I) -> Option<D>
where
    D: Decider,
    I: IntoIterator<Item = &'a RecordedEvent>,
{
    events.into_iter().fold(state, fold_recorded)
}

//! Typed publish/subscribe event bus.
//!
//! Synchronous fan-out over string topics with wildcard and one-shot
//! listeners. Handlers for a single `emit` run to completion in registration
//! order before the call returns; a panicking handler does not prevent later
//! handlers from running and is reported on the `error` topic.

mod bus;

pub use bus::{BusStats, Event, EventBus, Subscription, ERROR_TOPIC, WILDCARD};

//! Firehose event pipeline: sequencing, persistence, and fan-out.
//!
//! Every repository commit becomes one frame in a host-global, strictly
//! ordered event log. The [`EventManager`] persists each commit through an
//! [`EventStore`] (which assigns the sequence number), encodes the wire
//! frame once, and broadcasts it to every live subscriber. Subscribers
//! connect with an optional cursor and receive historical frames first,
//! then live frames, with no gaps and no duplicates.

pub mod frames;
pub mod manager;
pub mod persister;

mod error;

pub use crate::error::EventError;
pub use crate::frames::CommitInfo;
pub use crate::manager::{EventManager, Subscription};
pub use crate::persister::{EventStore, MemEventStore, PgEventStore};

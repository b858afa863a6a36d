//! Session groups for real-time servers.
//!
//! A [`Group`] multiplexes live sessions into a named, addressable set and
//! fans messages out to them. Payloads are encoded once per call and the same
//! buffer is pushed to every recipient. One member failing never stops the
//! others from receiving the message.
//!
//! # Components
//!
//! - [`Session`]: what a group needs from a connection (identity and push)
//! - [`Group`]: membership, lookups, broadcast/multicast, open/closed lifecycle
//! - [`Codec`]: payload encoding shared by all members of a group
//! - [`GroupError`]: lifecycle, membership, and fan-out failures
//!
//! Groups optionally carry one backend from [`huddle_drivers`], either shared
//! through a [`DriverRegistry`] or connected and owned by the group itself.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
pub mod group;
mod session;

pub use codec::{Codec, CodecError};
pub use error::GroupError;
pub use group::{DEFAULT_PUSH_TIMEOUT, FanOutReport, Group, GroupConfig, GroupStatus, PushFailure};
pub use huddle_drivers::{DriverKind, DriverRef, DriverRegistry};
pub use session::{PushError, SHORT_UUID_LEN, Session, SessionId, Uid};

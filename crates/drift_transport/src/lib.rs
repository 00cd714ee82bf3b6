//! Reliable session transport over ephemeral carriers.
//!
//! A [`Session`] is a logical byte-stream between a client and the relay
//! server that survives the loss and replacement of the underlying pipe.
//! Carriers come and go (volunteer-operated data channels rarely live
//! long); the session keeps every unacknowledged byte buffered and replays
//! it, with the original sequence numbers, on whatever carrier is attached
//! next. The server side routes incoming carriers to their session through
//! the [`SessionRegistry`].

pub mod carrier;
pub mod registry;
pub mod session;

pub use carrier::Carrier;
pub use registry::{Adopted, SessionRegistry};
pub use session::{Session, SessionConfig};

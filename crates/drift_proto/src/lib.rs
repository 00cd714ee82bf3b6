//! Wire types shared by the Driftway broker and session transport.

pub mod framing;
pub mod messages;

pub use framing::{read_header, Header, SessionId, HEADER_LEN, MAX_PAYLOAD, SESSION_ID_LEN};

//! Carrier abstraction: the bidirectional byte pipe underneath a session.
//!
//! A carrier is ordered and reliable for the bytes it does deliver, but may
//! disappear at any moment. Anything that reads and writes bytes
//! asynchronously qualifies: a TCP stream, an in-memory duplex pipe in
//! tests, or the adapter around an external data channel.

use tokio::io::{AsyncRead, AsyncWrite};

/// Marker trait for session carriers.
///
/// Close semantics are inherited from [`AsyncWrite::poll_shutdown`]:
/// shutting down is idempotent, reads on the far side then yield
/// end-of-stream, and further writes fail.
pub trait Carrier: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Carrier for T {}

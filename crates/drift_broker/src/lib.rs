//! Rendezvous broker: pairs clients trapped behind filtering networks
//! with polling volunteer proxies by shuttling opaque session-description
//! blobs between them, and publishes privacy-preserving aggregate metrics.
//!
//! The HTTP surface is thin glue over [`matching::Matcher`]; handlers
//! acquire the matcher lock only to mutate state and park off-lock on
//! one-shot delivery channels with a deadline.

pub mod config;
pub mod geoip;
pub mod http;
pub mod matching;
pub mod metrics;
pub mod tls;

pub use config::BrokerConfig;
pub use http::{build_router, AppState};
pub use matching::{Matcher, MatcherConfig};
pub use metrics::Metrics;

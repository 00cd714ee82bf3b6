//! Server-side session registry: routes newly arriving carriers to the
//! session they belong to.
//!
//! An initiating client prefixes every carrier with its raw 8-byte session
//! id. The registry reads that prefix, then either attaches the carrier to
//! the live session with that id or creates a fresh session adopting it.
//! The caller learns whether the session is new so it can hand new ones to
//! the relay-side byte shuttler.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use drift_proto::framing::{read_session_id, SessionId};

use crate::carrier::Carrier;
use crate::session::{Session, SessionConfig};

#[derive(Debug)]
pub struct Adopted {
    pub session: Arc<Session>,
    pub is_new: bool,
}

/// Map of live sessions keyed by session id.
pub struct SessionRegistry {
    config: SessionConfig,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Read the session-id prefix from `carrier` and attach it to the
    /// owning session, creating one if the id is unknown.
    ///
    /// Concurrent calls serialize on the registry lock, so only the most
    /// recent carrier of a session ends up active.
    pub async fn dispatch(&self, mut carrier: Box<dyn Carrier>) -> io::Result<Adopted> {
        let id = read_session_id(&mut carrier).await?;

        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&id) {
            debug!(session = %id, "attaching replacement carrier");
            session.attach(carrier, false).await?;
            Ok(Adopted {
                session: session.clone(),
                is_new: false,
            })
        } else {
            info!(session = %id, "new session");
            let session = Arc::new(Session::adopt(id, self.config.clone()));
            session.attach(carrier, false).await?;
            sessions.insert(id, session.clone());
            Ok(Adopted {
                session,
                is_new: true,
            })
        }
    }

    /// Drop a session from the registry, closing it.
    pub async fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let session = self.sessions.lock().await.remove(&id);
        if let Some(session) = &session {
            session.close().await;
        }
        session
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

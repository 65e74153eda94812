//! Append watcher
//!
//! Other nodes append to the shared store without touching our sessions.
//! The store announces appends; for each one that concerns a session on
//! this node, the session is told to check storage. Lost announcements are
//! covered by each session's own periodic storage poll.

use super::registry::SessionRegistry;
use crate::models::Uaid;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

pub struct AppendWatcher {
    appends: broadcast::Receiver<Uaid>,
    sessions: Arc<SessionRegistry>,
}

impl AppendWatcher {
    pub fn new(appends: broadcast::Receiver<Uaid>, sessions: Arc<SessionRegistry>) -> Self {
        Self { appends, sessions }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("Append watcher started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                received = self.appends.recv() => match received {
                    Ok(uaid) => {
                        self.sessions.signal_check(&uaid);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        let signalled = self.sessions.signal_all_check();
                        warn!(
                            missed,
                            signalled,
                            "Append watcher lagged; asked every session to check storage"
                        );
                    }
                    Err(RecvError::Closed) => {
                        debug!("Append stream closed");
                        break;
                    }
                }
            }
        }
        info!("Append watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::registry::{SessionHandle, SessionSignal};
    use crate::models::ClaimVersion;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[tokio::test]
    async fn appends_for_local_sessions_become_storage_checks() {
        let sessions = Arc::new(SessionRegistry::new());
        let (appends, _) = broadcast::channel(8);
        let (shutdown, _) = broadcast::channel(1);
        let uaid = Uaid::new();
        let (tx, mut rx) = mpsc::channel(4);
        sessions.register(uaid, SessionHandle::new(Uuid::new_v4(), ClaimVersion(1), tx));

        let watcher = AppendWatcher::new(appends.subscribe(), sessions.clone());
        let task = tokio::spawn(watcher.run(shutdown.subscribe()));

        appends.send(Uaid::new()).unwrap();
        appends.send(uaid).unwrap();
        assert_eq!(rx.recv().await, Some(SessionSignal::CheckStorage));

        shutdown.send(()).unwrap();
        task.await.unwrap();
    }
}

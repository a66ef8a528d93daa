//! Per-session transport registry with periodic eviction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{TransportClient, TransportClientBuilder, TransportResult};

const DEFAULT_MAX_SESSION_AGE: Duration = Duration::from_secs(4 * 3600);

/// Hands out one shared client per session id.
#[derive(Clone)]
pub struct TransportRegistry {
    template: TransportClientBuilder,
    clients: Arc<Mutex<HashMap<String, Arc<TransportClient>>>>,
    max_session_age: Duration,
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("sessions", &self.len())
            .field("max_session_age", &self.max_session_age)
            .finish()
    }
}

impl TransportRegistry {
    pub fn new(template: TransportClientBuilder) -> Self {
        Self {
            template,
            clients: Arc::new(Mutex::new(HashMap::new())),
            max_session_age: DEFAULT_MAX_SESSION_AGE,
        }
    }

    pub fn with_max_session_age(mut self, age: Duration) -> Self {
        self.max_session_age = age;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<TransportClient>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_or_create(&self, session_id: &str) -> TransportResult<Arc<TransportClient>> {
        let mut clients = self.lock();
        if let Some(client) = clients.get(session_id)
            && !client.is_closed()
        {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(self.template.build(session_id)?);
        clients.insert(session_id.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Remove and close the session's client.
    pub fn remove(&self, session_id: &str) -> bool {
        match self.lock().remove(session_id) {
            Some(client) => {
                client.close();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict clients whose session outlived the maximum age. Returns the
    /// number evicted.
    pub async fn sweep(&self) -> usize {
        let snapshot: Vec<(String, Arc<TransportClient>)> = self
            .lock()
            .iter()
            .map(|(id, client)| (id.clone(), Arc::clone(client)))
            .collect();

        let mut expired = Vec::new();
        for (id, client) in snapshot {
            if client.is_closed() || client.session_age().await > self.max_session_age {
                expired.push(id);
            }
        }

        let mut clients = self.lock();
        let mut evicted = 0;
        for id in expired {
            if let Some(client) = clients.remove(&id) {
                client.close();
                evicted += 1;
            }
        }
        if evicted > 0 {
            log::info!("evicted {evicted} stale transport sessions");
        }
        evicted
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.sweep().await;
                    }
                }
            }
            log::debug!("transport sweeper stopped");
        })
    }
}

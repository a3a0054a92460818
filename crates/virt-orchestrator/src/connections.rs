//! Per-backend SSH client registry
//!
//! Clients are shared between the task engine and borrowed-mode health
//! checkers; close ownership stays here. A client is replaced when it goes
//! unhealthy or when the backend's reachability fields change underneath it.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use virt_db::BackendRow;
use virt_ssh::{SshClient, SshError, SshTarget};

pub fn target_from_row(backend: &BackendRow) -> SshTarget {
    let mut target = SshTarget::new(
        backend.host.clone(),
        backend.ssh_port as u16,
        backend.ssh_username.clone(),
    );
    if let Some(key) = &backend.ssh_private_key {
        target = target.with_private_key(key.clone());
    }
    if let Some(password) = &backend.ssh_password {
        target = target.with_password(password.clone());
    }
    target
}

#[derive(Default)]
pub struct ConnectionManager {
    clients: DashMap<i64, Arc<SshClient>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn client_for(&self, backend: &BackendRow) -> Result<Arc<SshClient>, SshError> {
        if let Some(entry) = self.clients.get(&backend.id) {
            let client = entry.clone();
            drop(entry);
            let target = client.target();
            let unchanged = target.host == backend.host
                && target.port == backend.ssh_port as u16
                && target.username == backend.ssh_username;
            if client.is_healthy() && unchanged {
                return Ok(client);
            }
            debug!(backend = %backend.name, "discarding stale ssh client");
            self.clients.remove(&backend.id);
            client.close().await;
        }

        let fresh = SshClient::connect(target_from_row(backend)).await?;
        info!(backend = %backend.name, host = %backend.host, "ssh client connected");
        self.clients.insert(backend.id, fresh.clone());
        Ok(fresh)
    }

    /// Drop a backend's client, e.g. after its credentials were edited.
    pub async fn invalidate(&self, backend_id: i64) {
        if let Some((_, client)) = self.clients.remove(&backend_id) {
            client.close().await;
        }
    }

    pub async fn close_all(&self) {
        let ids: Vec<i64> = self.clients.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.invalidate(id).await;
        }
    }
}

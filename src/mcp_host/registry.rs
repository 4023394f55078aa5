//! Shared server state.
//!
//! Three independent tables, each behind its own lock:
//! - server id → managed process
//! - server id → initialization state
//! - confirmation id → pending confirmation
//!
//! Lock order is always processes before init states. No operation spans
//! the confirmation table and the other two.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use super::errors::BridgeError;
use super::lifecycle::ManagedProcess;
use super::types::{ConfirmationSummary, InitState};

// ─── Pending Confirmations ───────────────────────────────────────────────────

/// A MEDIUM risk call parked until a human approves or rejects it.
#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub confirmation_id: String,
    pub server_id: String,
    pub method: String,
    pub params: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingConfirmation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Whether this confirmation was issued for exactly this call.
    pub fn matches(&self, server_id: &str, method: &str, params: &serde_json::Value) -> bool {
        self.server_id == server_id && self.method == method && &self.params == params
    }

    pub fn tool_name(&self) -> Option<String> {
        self.params
            .get("name")
            .and_then(|n| n.as_str())
            .map(String::from)
    }

    pub fn summary(&self) -> ConfirmationSummary {
        ConfirmationSummary {
            confirmation_id: self.confirmation_id.clone(),
            server_id: self.server_id.clone(),
            method: self.method.clone(),
            tool_name: self.tool_name(),
            created_at: self.created_at.to_rfc3339(),
            expires_at: self.expires_at.to_rfc3339(),
        }
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Process-wide server state, shared by every component via `Arc`.
#[derive(Default)]
pub struct Registry {
    processes: RwLock<HashMap<String, Arc<ManagedProcess>>>,
    init_states: RwLock<HashMap<String, InitState>>,
    confirmations: Mutex<HashMap<String, PendingConfirmation>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Processes ───────────────────────────────────────────────────────

    /// Register the process produced by `launch` under `id`, in state
    /// STARTING.
    ///
    /// Fails with `AlreadyRunning` if a live process holds the id. An exited
    /// entry (a handshake failure kept for inspection) is replaced. `launch`
    /// runs under the table lock, so two concurrent registrations of the same
    /// id cannot both spawn.
    pub async fn insert_process_with<F>(
        &self,
        id: &str,
        launch: F,
    ) -> Result<Arc<ManagedProcess>, BridgeError>
    where
        F: FnOnce() -> Result<ManagedProcess, BridgeError>,
    {
        let mut processes = self.processes.write().await;
        if let Some(existing) = processes.get(id) {
            if !existing.poll_exit() {
                return Err(BridgeError::AlreadyRunning {
                    server: id.to_string(),
                });
            }
        }

        let process = Arc::new(launch()?);
        processes.insert(id.to_string(), Arc::clone(&process));
        self.init_states
            .write()
            .await
            .insert(id.to_string(), InitState::Starting);

        Ok(process)
    }

    pub async fn get_process(&self, id: &str) -> Option<Arc<ManagedProcess>> {
        self.processes.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.processes.read().await.contains_key(id)
    }

    /// Sorted ids of every registered server.
    pub async fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.processes.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every registered process with its initialization state, sorted by id.
    pub async fn snapshot(&self) -> Vec<(Arc<ManagedProcess>, Option<InitState>)> {
        let processes = self.processes.read().await;
        let states = self.init_states.read().await;
        let mut entries: Vec<_> = processes
            .iter()
            .map(|(id, p)| (Arc::clone(p), states.get(id).copied()))
            .collect();
        entries.sort_by(|a, b| a.0.server_id.cmp(&b.0.server_id));
        entries
    }

    /// Remove `id` from both tables, but only while it still belongs to the
    /// spawn identified by `instance`. Returns whether anything was removed.
    pub async fn remove_instance(&self, id: &str, instance: uuid::Uuid) -> bool {
        let mut processes = self.processes.write().await;
        match processes.get(id) {
            Some(p) if p.instance() == instance => {
                processes.remove(id);
                self.init_states.write().await.remove(id);
                true
            }
            _ => false,
        }
    }

    // ─── Initialization States ───────────────────────────────────────────

    pub async fn init_state(&self, id: &str) -> Option<InitState> {
        self.init_states.read().await.get(id).copied()
    }

    /// Record a state transition for the spawn identified by `instance`.
    ///
    /// Ignored when the id has since been removed or re-spawned.
    pub async fn set_init_state(&self, id: &str, instance: uuid::Uuid, state: InitState) -> bool {
        let processes = self.processes.read().await;
        match processes.get(id) {
            Some(p) if p.instance() == instance => {
                self.init_states.write().await.insert(id.to_string(), state);
                true
            }
            _ => false,
        }
    }

    // ─── Confirmations ───────────────────────────────────────────────────

    pub async fn insert_confirmation(&self, confirmation: PendingConfirmation) {
        self.confirmations
            .lock()
            .await
            .insert(confirmation.confirmation_id.clone(), confirmation);
    }

    /// Remove and return a confirmation. At most one caller gets `Some`.
    pub async fn take_confirmation(&self, confirmation_id: &str) -> Option<PendingConfirmation> {
        self.confirmations.lock().await.remove(confirmation_id)
    }

    /// Run `f` with exclusive access to the confirmation table.
    pub async fn with_confirmations<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, PendingConfirmation>) -> R,
    ) -> R {
        let mut table = self.confirmations.lock().await;
        f(&mut table)
    }

    /// Drop every confirmation expired at `now`. Returns how many were dropped.
    pub async fn purge_expired_confirmations(&self, now: DateTime<Utc>) -> usize {
        let mut table = self.confirmations.lock().await;
        let before = table.len();
        table.retain(|_, c| !c.is_expired(now));
        before - table.len()
    }

    /// Outstanding confirmations, oldest first.
    pub async fn confirmations(&self) -> Vec<PendingConfirmation> {
        let mut list: Vec<_> = self.confirmations.lock().await.values().cloned().collect();
        list.sort_by_key(|c| c.created_at);
        list
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! MCP Bridge: the interface exposed to collaborators.
//!
//! Ties together configuration, the supervisor, and the risk gate. Every
//! protocol operation goes through the risk gate before reaching a server.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::config::{self, BridgeSettings};
use super::errors::BridgeError;
use super::lifecycle::{ManagedProcess, Supervisor};
use super::registry::Registry;
use super::risk_gate::RiskGate;
use super::types::{
    ConfirmOutcome, ConfirmationSummary, CreatedServer, InvokeOutcome, RiskTier, ServerDefinition,
    ServerSummary, TOOLS_CALL,
};

const STATUS_CONNECTED: &str = "connected";

// ─── McpBridge ───────────────────────────────────────────────────────────────

/// Supervises every configured server and routes calls to them.
pub struct McpBridge {
    registry: Arc<Registry>,
    supervisor: Supervisor,
    gate: RiskGate,
    /// Definitions loaded from configuration, started by `start_all`.
    definitions: HashMap<String, ServerDefinition>,
}

impl McpBridge {
    /// Create a bridge with no configured servers.
    pub fn new(settings: BridgeSettings) -> Self {
        Self::with_definitions(settings, HashMap::new())
    }

    pub fn with_definitions(
        settings: BridgeSettings,
        definitions: HashMap<String, ServerDefinition>,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let settings = Arc::new(settings);
        Self {
            supervisor: Supervisor::new(Arc::clone(&registry), Arc::clone(&settings)),
            gate: RiskGate::new(Arc::clone(&registry), settings),
            registry,
            definitions,
        }
    }

    /// Load definitions from the config file (or `MCP_CONFIG_PATH`) and the
    /// `MCP_SERVER_*` environment.
    pub fn from_config(config_path: Option<&Path>, settings: BridgeSettings) -> Self {
        let definitions = config::load_server_definitions(config_path, settings.high_tier_policy);
        Self::with_definitions(settings, definitions)
    }

    /// Ids of the configured (not necessarily running) servers, sorted.
    pub fn configured_servers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.definitions.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start every configured server concurrently.
    ///
    /// Returns the servers that failed to start (partial startup is OK).
    pub async fn start_all(&self) -> Vec<(String, BridgeError)> {
        let mut defs: Vec<&ServerDefinition> = self.definitions.values().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));

        let outcomes =
            futures::future::join_all(defs.iter().map(|def| self.create_server(def))).await;

        let mut failures = Vec::new();
        for (def, outcome) in defs.iter().zip(outcomes) {
            match outcome {
                Ok(created) => {
                    tracing::info!(server = %created.id, pid = ?created.pid, "server started");
                }
                Err(e) => {
                    tracing::error!(server = %def.id, error = %e, "failed to start server");
                    failures.push((def.id.clone(), e));
                }
            }
        }
        failures
    }

    /// Stop every running server.
    pub async fn shutdown_all(&self) {
        self.supervisor.shutdown_all().await;
    }

    // ─── Server Management ───────────────────────────────────────────────

    /// Every registered server with its state, sorted by id.
    pub async fn list_servers(&self) -> Vec<ServerSummary> {
        self.registry
            .snapshot()
            .await
            .into_iter()
            .map(|(process, state)| {
                let (risk_level, risk_description, running_in_sandbox) = risk_fields(&process);
                ServerSummary {
                    id: process.server_id.clone(),
                    connected: !process.has_exited(),
                    pid: process.pid,
                    initialization_state: state,
                    risk_level,
                    risk_description,
                    running_in_sandbox,
                }
            })
            .collect()
    }

    /// Spawn a server and wait for its handshake.
    ///
    /// A HIGH risk definition without a valid sandbox is refused outright;
    /// this path never downgrades.
    pub async fn create_server(&self, def: &ServerDefinition) -> Result<CreatedServer, BridgeError> {
        let process = self
            .supervisor
            .spawn_definition(def)
            .await?
            .wait_ready()
            .await?;

        let (risk_level, risk_description, running_in_sandbox) = risk_fields(&process);
        Ok(CreatedServer {
            id: process.server_id.clone(),
            status: STATUS_CONNECTED.to_string(),
            pid: process.pid,
            risk_level,
            risk_description,
            running_in_sandbox,
        })
    }

    /// Stop a server and forget it.
    pub async fn delete_server(&self, server_id: &str) -> Result<(), BridgeError> {
        if !self.supervisor.shutdown(server_id).await {
            return Err(BridgeError::ServerNotFound {
                server: server_id.to_string(),
            });
        }
        Ok(())
    }

    // ─── Protocol Operations ─────────────────────────────────────────────

    pub async fn list_tools(&self, server_id: &str) -> Result<InvokeOutcome, BridgeError> {
        self.invoke(server_id, "tools/list", serde_json::json!({}), None)
            .await
    }

    /// Call a tool. `confirmation_id` resubmits a previously confirmed call.
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
        confirmation_id: Option<&str>,
    ) -> Result<InvokeOutcome, BridgeError> {
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        self.invoke(server_id, TOOLS_CALL, params, confirmation_id)
            .await
    }

    pub async fn list_resources(&self, server_id: &str) -> Result<InvokeOutcome, BridgeError> {
        self.invoke(server_id, "resources/list", serde_json::json!({}), None)
            .await
    }

    pub async fn read_resource(
        &self,
        server_id: &str,
        uri: &str,
    ) -> Result<InvokeOutcome, BridgeError> {
        self.invoke(server_id, "resources/read", serde_json::json!({ "uri": uri }), None)
            .await
    }

    pub async fn list_prompts(&self, server_id: &str) -> Result<InvokeOutcome, BridgeError> {
        self.invoke(server_id, "prompts/list", serde_json::json!({}), None)
            .await
    }

    pub async fn get_prompt(
        &self,
        server_id: &str,
        prompt_name: &str,
        arguments: serde_json::Value,
    ) -> Result<InvokeOutcome, BridgeError> {
        let params = serde_json::json!({
            "name": prompt_name,
            "arguments": arguments,
        });
        self.invoke(server_id, "prompts/get", params, None).await
    }

    /// Route an arbitrary method through the risk gate.
    pub async fn invoke(
        &self,
        server_id: &str,
        method: &str,
        params: serde_json::Value,
        confirmation_id: Option<&str>,
    ) -> Result<InvokeOutcome, BridgeError> {
        self.gate
            .invoke(server_id, method, params, confirmation_id)
            .await
    }

    // ─── Confirmations ───────────────────────────────────────────────────

    pub async fn confirm(
        &self,
        confirmation_id: &str,
        approve: bool,
    ) -> Result<ConfirmOutcome, BridgeError> {
        self.gate.confirm(confirmation_id, approve).await
    }

    pub async fn list_confirmations(&self) -> Vec<ConfirmationSummary> {
        self.gate.list_confirmations().await
    }
}

/// Risk fields reported only when the tier was set explicitly.
fn risk_fields(process: &ManagedProcess) -> (Option<RiskTier>, Option<String>, Option<bool>) {
    match process.risk_tier {
        Some(tier) => (
            Some(tier),
            Some(tier.description().to_string()),
            (tier == RiskTier::High).then(|| process.is_sandboxed()),
        ),
        None => (None, None, None),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! Risk tier enforcement in front of the correlator.
//!
//! LOW (or unset) calls pass straight through. MEDIUM tool invocations are
//! parked as pending confirmations until a human approves them. HIGH calls
//! pass through (the process already runs sandboxed) and their results are
//! annotated with the execution environment.

use std::sync::Arc;

use chrono::Utc;

use super::config::BridgeSettings;
use super::errors::BridgeError;
use super::lifecycle::ManagedProcess;
use super::registry::{PendingConfirmation, Registry};
use super::transport::send_on;
use super::types::{
    CallResult, ConfirmOutcome, ConfirmationRequired, ConfirmationSummary, ExecutionEnvironment,
    InitState, InvokeOutcome, RiskTier, TOOLS_CALL,
};

const REJECTED_MESSAGE: &str = "Request was rejected";

/// Fallback when a sandboxed process has no recorded image.
const UNKNOWN_IMAGE: &str = "unknown";

#[derive(Clone)]
pub struct RiskGate {
    registry: Arc<Registry>,
    settings: Arc<BridgeSettings>,
}

impl RiskGate {
    pub fn new(registry: Arc<Registry>, settings: Arc<BridgeSettings>) -> Self {
        Self { registry, settings }
    }

    /// Route one call through the gate.
    ///
    /// With `confirmation_id`, the matching pending confirmation is consumed
    /// and the call is delegated directly.
    pub async fn invoke(
        &self,
        server_id: &str,
        method: &str,
        params: serde_json::Value,
        confirmation_id: Option<&str>,
    ) -> Result<InvokeOutcome, BridgeError> {
        let process = self
            .registry
            .get_process(server_id)
            .await
            .ok_or_else(|| BridgeError::ServerNotFound {
                server: server_id.to_string(),
            })?;

        if let Some(confirmation_id) = confirmation_id {
            self.consume_confirmation(confirmation_id, server_id, method, &params)
                .await?;
            return self
                .dispatch(&process, method, params)
                .await
                .map(InvokeOutcome::Completed);
        }

        if process.risk_tier == Some(RiskTier::Medium) && method == TOOLS_CALL {
            match self.registry.init_state(server_id).await {
                Some(InitState::Initialized) => {}
                state => {
                    return Err(BridgeError::NotInitialized {
                        server: server_id.to_string(),
                        state,
                    })
                }
            }
            let required = self.issue_confirmation(server_id, method, params).await;
            return Ok(InvokeOutcome::ConfirmationRequired(required));
        }

        self.dispatch(&process, method, params)
            .await
            .map(InvokeOutcome::Completed)
    }

    /// Approve or reject a pending confirmation. The record is consumed
    /// before anything else happens, so each id resolves at most once.
    pub async fn confirm(
        &self,
        confirmation_id: &str,
        approve: bool,
    ) -> Result<ConfirmOutcome, BridgeError> {
        let pending = self
            .registry
            .take_confirmation(confirmation_id)
            .await
            .ok_or_else(|| BridgeError::ConfirmationNotFound {
                confirmation_id: confirmation_id.to_string(),
            })?;

        if pending.is_expired(Utc::now()) {
            tracing::info!(confirmation_id, server = %pending.server_id, "confirmation expired");
            return Err(BridgeError::Expired {
                confirmation_id: confirmation_id.to_string(),
            });
        }

        if !approve {
            tracing::info!(
                confirmation_id,
                server = %pending.server_id,
                tool = ?pending.tool_name(),
                "request rejected"
            );
            return Ok(ConfirmOutcome::Rejected {
                message: REJECTED_MESSAGE.to_string(),
            });
        }

        tracing::info!(
            confirmation_id,
            server = %pending.server_id,
            tool = ?pending.tool_name(),
            "request approved"
        );

        let process = self
            .registry
            .get_process(&pending.server_id)
            .await
            .ok_or_else(|| BridgeError::ServerNotFound {
                server: pending.server_id.clone(),
            })?;

        self.dispatch(&process, &pending.method, pending.params)
            .await
            .map(ConfirmOutcome::Completed)
    }

    /// Outstanding confirmations, oldest first. Expired ones are dropped.
    pub async fn list_confirmations(&self) -> Vec<ConfirmationSummary> {
        let purged = self.registry.purge_expired_confirmations(Utc::now()).await;
        if purged > 0 {
            tracing::debug!(purged, "dropped expired confirmations");
        }
        self.registry
            .confirmations()
            .await
            .iter()
            .map(PendingConfirmation::summary)
            .collect()
    }

    async fn dispatch(
        &self,
        process: &ManagedProcess,
        method: &str,
        params: serde_json::Value,
    ) -> Result<CallResult, BridgeError> {
        let result = send_on(
            &self.registry,
            process,
            method,
            params,
            self.settings.request_timeout,
        )
        .await?;

        let execution_environment = (process.risk_tier == Some(RiskTier::High)).then(|| {
            ExecutionEnvironment {
                risk_level: RiskTier::High,
                risk_description: RiskTier::High.description().to_string(),
                sandboxed: process.is_sandboxed(),
                image: process
                    .sandbox_image
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_IMAGE.to_string()),
            }
        });

        Ok(CallResult {
            result,
            execution_environment,
        })
    }

    async fn issue_confirmation(
        &self,
        server_id: &str,
        method: &str,
        params: serde_json::Value,
    ) -> ConfirmationRequired {
        let created_at = Utc::now();
        let purged = self.registry.purge_expired_confirmations(created_at).await;
        if purged > 0 {
            tracing::debug!(purged, "dropped expired confirmations");
        }
        let ttl = chrono::Duration::from_std(self.settings.confirmation_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));

        let pending = PendingConfirmation {
            confirmation_id: uuid::Uuid::new_v4().to_string(),
            server_id: server_id.to_string(),
            method: method.to_string(),
            params,
            created_at,
            expires_at: created_at + ttl,
        };

        let required = ConfirmationRequired {
            requires_confirmation: true,
            confirmation_id: pending.confirmation_id.clone(),
            risk_level: RiskTier::Medium,
            risk_description: RiskTier::Medium.description().to_string(),
            server_id: pending.server_id.clone(),
            method: pending.method.clone(),
            tool_name: pending.tool_name(),
            expires_at: pending.expires_at.to_rfc3339(),
        };

        tracing::info!(
            server = server_id,
            confirmation_id = %pending.confirmation_id,
            tool = ?required.tool_name,
            "confirmation required"
        );
        self.registry.insert_confirmation(pending).await;
        required
    }

    async fn consume_confirmation(
        &self,
        confirmation_id: &str,
        server_id: &str,
        method: &str,
        params: &serde_json::Value,
    ) -> Result<(), BridgeError> {
        let now = Utc::now();
        let not_found = || BridgeError::ConfirmationNotFound {
            confirmation_id: confirmation_id.to_string(),
        };

        self.registry
            .with_confirmations(|table| {
                let pending = table.get(confirmation_id).ok_or_else(not_found)?;
                if pending.is_expired(now) {
                    table.remove(confirmation_id);
                    return Err(BridgeError::Expired {
                        confirmation_id: confirmation_id.to_string(),
                    });
                }
                if !pending.matches(server_id, method, params) {
                    tracing::warn!(
                        confirmation_id,
                        server = server_id,
                        method,
                        "confirmation was issued for a different call"
                    );
                    return Err(not_found());
                }
                table.remove(confirmation_id);
                Ok(())
            })
            .await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::mcp_host::lifecycle::tests::{echo_definition, fast_settings, ECHO_SCRIPT};
    use crate::mcp_host::lifecycle::Supervisor;
    use crate::mcp_host::types::{LaunchSpec, ServerDefinition};

    struct Harness {
        supervisor: Supervisor,
        gate: RiskGate,
        _dir: tempfile::TempDir,
        log: std::path::PathBuf,
    }

    fn harness_with(settings: BridgeSettings) -> Harness {
        let registry = Arc::new(Registry::new());
        let settings = Arc::new(settings);
        let dir = tempfile::TempDir::new().unwrap();
        Harness {
            supervisor: Supervisor::new(Arc::clone(&registry), Arc::clone(&settings)),
            gate: RiskGate::new(registry, settings),
            log: dir.path().join("stdin.log"),
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(fast_settings())
    }

    /// Echo server that also appends everything it reads to `log`.
    fn recording_echo(id: &str, log: &Path) -> ServerDefinition {
        ServerDefinition::new(id, "sh").with_args([
            "-c",
            r#"tee -a "$0" | sed -u -e "$1""#,
            log.to_str().unwrap(),
            ECHO_SCRIPT,
        ])
    }

    async fn start(h: &Harness, def: ServerDefinition) {
        h.supervisor
            .spawn_definition(&def)
            .await
            .unwrap()
            .wait_ready()
            .await
            .unwrap();
    }

    fn stdin_log(h: &Harness) -> String {
        std::fs::read_to_string(&h.log).unwrap_or_default()
    }

    fn write_file_params() -> serde_json::Value {
        serde_json::json!({"name": "write_file", "arguments": {"path": "/tmp/out.txt"}})
    }

    async fn request_confirmation(h: &Harness, id: &str) -> ConfirmationRequired {
        match h
            .gate
            .invoke(id, TOOLS_CALL, write_file_params(), None)
            .await
            .unwrap()
        {
            InvokeOutcome::ConfirmationRequired(required) => required,
            other => panic!("expected confirmation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_medium_tool_call_parked_without_reaching_server() {
        let h = harness();
        start(&h, recording_echo("fs", &h.log).with_risk_tier(RiskTier::Medium)).await;

        let required = request_confirmation(&h, "fs").await;
        assert!(required.requires_confirmation);
        assert_eq!(required.risk_level, RiskTier::Medium);
        assert_eq!(required.risk_description, "Medium risk - Requires confirmation");
        assert_eq!(required.server_id, "fs");
        assert_eq!(required.method, "tools/call");
        assert_eq!(required.tool_name.as_deref(), Some("write_file"));

        // Non-invocation methods are not gated.
        let listed = h
            .gate
            .invoke("fs", "tools/list", serde_json::json!({}), None)
            .await
            .unwrap();
        assert!(!listed.is_confirmation_required());

        assert!(stdin_log(&h).contains("tools/list"));
        assert!(!stdin_log(&h).contains("tools/call"));

        let pending = h.gate.list_confirmations().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].confirmation_id, required.confirmation_id);
        h.supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_approved_confirmation_executes_exactly_once() {
        let h = harness();
        start(&h, recording_echo("fs", &h.log).with_risk_tier(RiskTier::Medium)).await;
        let required = request_confirmation(&h, "fs").await;

        match h.gate.confirm(&required.confirmation_id, true).await.unwrap() {
            ConfirmOutcome::Completed(call) => {
                assert_eq!(call.result, write_file_params());
                assert!(call.execution_environment.is_none());
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(stdin_log(&h).matches("tools/call").count(), 1);

        let again = h.gate.confirm(&required.confirmation_id, true).await.unwrap_err();
        assert!(matches!(again, BridgeError::ConfirmationNotFound { .. }));
        let reject = h.gate.confirm(&required.confirmation_id, false).await.unwrap_err();
        assert!(matches!(reject, BridgeError::ConfirmationNotFound { .. }));
        assert!(h.gate.list_confirmations().await.is_empty());
        h.supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_rejected_confirmation_never_calls_server() {
        let h = harness();
        start(&h, recording_echo("fs", &h.log).with_risk_tier(RiskTier::Medium)).await;
        let required = request_confirmation(&h, "fs").await;

        match h.gate.confirm(&required.confirmation_id, false).await.unwrap() {
            ConfirmOutcome::Rejected { message } => assert_eq!(message, "Request was rejected"),
            other => panic!("expected rejection, got {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stdin_log(&h).contains("tools/call"));
        h.supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_expired_confirmation_is_refused_and_removed() {
        let h = harness_with(BridgeSettings {
            confirmation_ttl: Duration::from_millis(1),
            ..fast_settings()
        });
        start(&h, echo_definition("fs").with_risk_tier(RiskTier::Medium)).await;
        let required = request_confirmation(&h, "fs").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = h.gate.confirm(&required.confirmation_id, true).await.unwrap_err();
        assert!(matches!(err, BridgeError::Expired { .. }));
        let err = h.gate.confirm(&required.confirmation_id, true).await.unwrap_err();
        assert!(matches!(err, BridgeError::ConfirmationNotFound { .. }));

        let second = request_confirmation(&h, "fs").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = h
            .gate
            .invoke("fs", TOOLS_CALL, write_file_params(), Some(&second.confirmation_id))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Expired { .. }));
        assert!(h.gate.list_confirmations().await.is_empty());
        h.supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_issuing_confirmation_drops_expired_ones() {
        let h = harness_with(BridgeSettings {
            confirmation_ttl: Duration::from_millis(1),
            ..fast_settings()
        });
        start(&h, echo_definition("fs").with_risk_tier(RiskTier::Medium)).await;

        for _ in 0..50 {
            request_confirmation(&h, "fs").await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let latest = request_confirmation(&h, "fs").await;

        let table = h.gate.registry.confirmations().await;
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].confirmation_id, latest.confirmation_id);
        h.supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_confirmation_expires_one_ttl_from_now() {
        let h = harness();
        start(&h, echo_definition("fs").with_risk_tier(RiskTier::Medium)).await;

        let before = Utc::now();
        let required = request_confirmation(&h, "fs").await;
        let expires_at = chrono::DateTime::parse_from_rfc3339(&required.expires_at)
            .unwrap()
            .with_timezone(&Utc);

        let ttl = chrono::Duration::from_std(h.gate.settings.confirmation_ttl).unwrap();
        assert!(expires_at > Utc::now());
        assert!(expires_at >= before + ttl);
        assert!(expires_at <= Utc::now() + ttl);
        h.supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_initialized_notification_precedes_first_request() {
        let h = harness();
        start(&h, recording_echo("fs", &h.log)).await;
        h.gate
            .invoke("fs", "tools/list", serde_json::json!({}), None)
            .await
            .unwrap();

        let log = stdin_log(&h);
        let lines: Vec<serde_json::Value> = log
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3, "unexpected stdin: {log}");

        assert_eq!(lines[0]["method"], "initialize");
        assert_eq!(lines[0]["id"], 1);
        assert_eq!(lines[1]["method"], "notifications/initialized");
        assert!(lines[1].get("id").is_none());
        assert_eq!(lines[2]["method"], "tools/list");
        h.supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_invoke_with_confirmation_id_requires_same_call() {
        let h = harness();
        start(&h, echo_definition("fs").with_risk_tier(RiskTier::Medium)).await;
        let required = request_confirmation(&h, "fs").await;
        let cid = required.confirmation_id.as_str();

        let other_params = serde_json::json!({"name": "delete_file"});
        let err = h
            .gate
            .invoke("fs", TOOLS_CALL, other_params, Some(cid))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ConfirmationNotFound { .. }));

        // Mismatch did not consume it.
        let outcome = h
            .gate
            .invoke("fs", TOOLS_CALL, write_file_params(), Some(cid))
            .await
            .unwrap();
        match outcome {
            InvokeOutcome::Completed(call) => assert_eq!(call.result, write_file_params()),
            other => panic!("expected completion, got {other:?}"),
        }

        let err = h
            .gate
            .invoke("fs", TOOLS_CALL, write_file_params(), Some(cid))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ConfirmationNotFound { .. }));
        h.supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_low_and_unset_tiers_pass_through() {
        let h = harness();
        start(&h, echo_definition("plain")).await;
        start(&h, echo_definition("low").with_risk_tier(RiskTier::Low)).await;

        for id in ["plain", "low"] {
            match h.gate.invoke(id, TOOLS_CALL, write_file_params(), None).await.unwrap() {
                InvokeOutcome::Completed(call) => {
                    assert_eq!(call.result, write_file_params());
                    assert!(call.execution_environment.is_none());
                }
                other => panic!("expected completion, got {other:?}"),
            }
        }
        h.supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_high_tier_result_annotated() {
        let h = harness();
        let launch = LaunchSpec {
            program: "sed".into(),
            args: vec!["-u".into(), "-e".into(), ECHO_SCRIPT.into()],
            env: Default::default(),
            cwd: None,
            sandboxed: true,
            original_command: Some("sed".into()),
        };
        h.supervisor
            .spawn("boxed", launch, Some(RiskTier::High), Some("mcp/echo:latest".into()))
            .await
            .unwrap()
            .wait_ready()
            .await
            .unwrap();

        let outcome = h.gate.invoke("boxed", TOOLS_CALL, write_file_params(), None).await.unwrap();
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["name"], "write_file");
        assert_eq!(json["arguments"]["path"], "/tmp/out.txt");
        assert_eq!(json["execution_environment"]["risk_level"], 3);
        assert_eq!(json["execution_environment"]["image"], "mcp/echo:latest");

        match outcome {
            InvokeOutcome::Completed(call) => {
                assert_eq!(call.result, write_file_params());
                let env = call.execution_environment.unwrap();
                assert_eq!(env.risk_level, RiskTier::High);
                assert!(env.sandboxed);
                assert_eq!(env.image, "mcp/echo:latest");
            }
            other => panic!("expected completion, got {other:?}"),
        }
        h.supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_unknown_server_and_starting_server() {
        let h = harness();
        let err = h
            .gate
            .invoke("ghost", "tools/list", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ServerNotFound { .. }));

        let _pending = h
            .supervisor
            .spawn_definition(&ServerDefinition::new("slow", "cat").with_risk_tier(RiskTier::Medium))
            .await
            .unwrap();
        let err = h
            .gate
            .invoke("slow", TOOLS_CALL, write_file_params(), None)
            .await
            .unwrap_err();
        match err {
            BridgeError::NotInitialized { state, .. } => assert_eq!(state, Some(InitState::Starting)),
            other => panic!("expected NotInitialized, got {other:?}"),
        }
        assert!(h.gate.list_confirmations().await.is_empty());
        h.supervisor.shutdown_all().await;
    }
}

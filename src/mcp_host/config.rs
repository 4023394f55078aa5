//! Server definition loading and runtime settings.
//!
//! Reads `mcp_config.json` (or a YAML equivalent), normalizes every entry
//! into a [`ServerDefinition`] once, then layers `MCP_SERVER_<NAME>_*`
//! environment overrides on top. Bad entries are dropped or downgraded with a
//! warning; loading never fails as a whole and never spawns anything.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use super::errors::BridgeError;
use super::types::{RiskTier, SandboxSpec, ServerDefinition};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Env var naming the config file.
pub const CONFIG_PATH_VAR: &str = "MCP_CONFIG_PATH";

/// Default config file name, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "mcp_config.json";

const SERVER_VAR_PREFIX: &str = "MCP_SERVER_";
const COMMAND_SUFFIX: &str = "_COMMAND";

// ─── Policy & Settings ──────────────────────────────────────────────────────

/// What to do with a HIGH risk entry that has no usable sandbox spec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HighTierPolicy {
    /// Keep the server but treat it as MEDIUM (confirmation required).
    #[default]
    Downgrade,
    /// Drop the entry entirely.
    Reject,
}

impl FromStr for HighTierPolicy {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "downgrade" => Ok(HighTierPolicy::Downgrade),
            "reject" => Ok(HighTierPolicy::Reject),
            other => Err(BridgeError::Config {
                reason: format!("unknown high tier policy '{other}' (expected downgrade|reject)"),
            }),
        }
    }
}

/// Timeouts and policies shared by every component.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Wall-clock bound on the initialization handshake.
    pub handshake_timeout: Duration,
    /// Wall-clock bound on a single request.
    pub request_timeout: Duration,
    /// How long `shutdown` waits after the graceful signal before killing.
    pub shutdown_grace: Duration,
    /// Liveness poll interval of the exit monitor.
    pub exit_poll_interval: Duration,
    /// Lifetime of a pending confirmation.
    pub confirmation_ttl: Duration,
    pub high_tier_policy: HighTierPolicy,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            exit_poll_interval: Duration::from_secs(1),
            confirmation_ttl: Duration::from_secs(10 * 60),
            high_tier_policy: HighTierPolicy::Downgrade,
        }
    }
}

impl BridgeSettings {
    /// Defaults overridden by `MCP_BRIDGE_*` variables of the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Defaults overridden by `MCP_BRIDGE_*` variables from `vars`.
    ///
    /// Unparsable values keep the default and log a warning.
    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut settings = Self::default();

        for (key, value) in vars {
            let slot = match key.as_str() {
                "MCP_BRIDGE_HANDSHAKE_TIMEOUT_MS" => &mut settings.handshake_timeout,
                "MCP_BRIDGE_REQUEST_TIMEOUT_MS" => &mut settings.request_timeout,
                "MCP_BRIDGE_SHUTDOWN_GRACE_MS" => &mut settings.shutdown_grace,
                "MCP_BRIDGE_EXIT_POLL_MS" => &mut settings.exit_poll_interval,
                "MCP_BRIDGE_CONFIRMATION_TTL_MS" => &mut settings.confirmation_ttl,
                "MCP_BRIDGE_HIGH_TIER_POLICY" => {
                    match value.parse::<HighTierPolicy>() {
                        Ok(policy) => settings.high_tier_policy = policy,
                        Err(e) => tracing::warn!(error = %e, "ignoring MCP_BRIDGE_HIGH_TIER_POLICY"),
                    }
                    continue;
                }
                _ => continue,
            };

            match value.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => *slot = Duration::from_millis(ms),
                _ => tracing::warn!(
                    var = %key,
                    value = %value,
                    "ignoring invalid duration override (expected positive milliseconds)"
                ),
            }
        }

        settings
    }
}

// ─── Raw Format ──────────────────────────────────────────────────────────────

/// Top-level config document (`{"mcpServers": {...}}`).
///
/// Entries stay untyped here so one malformed server cannot sink the file.
#[derive(Debug, Default, Deserialize)]
struct ConfigDocument {
    #[serde(default, rename = "mcpServers", alias = "mcp_servers")]
    mcp_servers: HashMap<String, serde_json::Value>,
}

/// One server entry as written by users.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerEntry {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default, alias = "risk_level")]
    risk_level: Option<serde_json::Value>,
    #[serde(default)]
    docker: Option<serde_json::Value>,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolve the config path: explicit path, then `MCP_CONFIG_PATH`, then
/// `./mcp_config.json`.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    std::env::current_dir()
        .unwrap_or_default()
        .join(DEFAULT_CONFIG_FILE)
}

/// Load every server definition from the config file and the process
/// environment.
pub fn load_server_definitions(
    explicit_path: Option<&Path>,
    policy: HighTierPolicy,
) -> HashMap<String, ServerDefinition> {
    let path = resolve_config_path(explicit_path);
    tracing::info!(path = %path.display(), "loading server configuration");

    let mut definitions = match load_config_file(&path, policy) {
        Ok(defs) => defs,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "ignoring unreadable config file");
            HashMap::new()
        }
    };

    apply_env_overrides(&mut definitions, std::env::vars(), policy);

    let mut ids: Vec<&String> = definitions.keys().collect();
    ids.sort();
    tracing::info!(count = definitions.len(), servers = ?ids, "loaded server configurations");

    definitions
}

/// Read and parse one config file. A missing file yields an empty map.
pub fn load_config_file(
    path: &Path,
    policy: HighTierPolicy,
) -> Result<HashMap<String, ServerDefinition>, BridgeError> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file found, using environment only");
        return Ok(HashMap::new());
    }

    let raw = std::fs::read_to_string(path).map_err(|e| BridgeError::Config {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    parse_config_document(&interpolate_env_vars(&raw), is_yaml, policy)
}

/// Parse a config document and normalize its entries.
pub fn parse_config_document(
    content: &str,
    is_yaml: bool,
    policy: HighTierPolicy,
) -> Result<HashMap<String, ServerDefinition>, BridgeError> {
    let doc: ConfigDocument = if is_yaml {
        serde_yaml::from_str(content).map_err(|e| BridgeError::Config {
            reason: format!("failed to parse YAML config: {e}"),
        })?
    } else {
        serde_json::from_str(content).map_err(|e| BridgeError::Config {
            reason: format!("failed to parse JSON config: {e}"),
        })?
    };

    let mut definitions = HashMap::new();
    for (id, value) in doc.mcp_servers {
        let entry: RawServerEntry = match serde_json::from_value(value) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(server = %id, error = %e, "dropping malformed server entry");
                continue;
            }
        };
        if let Some(def) = normalize_entry(&id, entry, policy) {
            definitions.insert(id, def);
        }
    }

    Ok(definitions)
}

/// Validate one raw entry. Returns `None` when the entry must be dropped.
fn normalize_entry(id: &str, entry: RawServerEntry, policy: HighTierPolicy) -> Option<ServerDefinition> {
    let command = match entry.command {
        Some(c) if !c.trim().is_empty() => c,
        _ => {
            tracing::warn!(server = %id, "dropping server entry without a command");
            return None;
        }
    };

    let risk_tier = match entry.risk_level {
        None | Some(serde_json::Value::Null) => None,
        Some(value) => {
            let tier = RiskTier::from_value(&value);
            if tier.is_none() {
                tracing::warn!(server = %id, risk_level = %value, "invalid risk level, ignoring risk level");
            }
            tier
        }
    };

    let sandbox = match entry.docker {
        None | Some(serde_json::Value::Null) => None,
        Some(value) => match serde_json::from_value::<SandboxSpec>(value) {
            Ok(spec) => Some(spec),
            Err(e) => {
                tracing::warn!(server = %id, error = %e, "invalid docker configuration");
                None
            }
        },
    };

    apply_high_tier_policy(
        ServerDefinition {
            id: id.to_string(),
            command,
            args: entry.args,
            env: entry.env,
            cwd: entry.cwd,
            risk_tier,
            sandbox,
        },
        policy,
    )
}

/// Enforce the policy for HIGH risk definitions without a valid sandbox.
pub fn apply_high_tier_policy(
    mut def: ServerDefinition,
    policy: HighTierPolicy,
) -> Option<ServerDefinition> {
    let sandbox_ok = def.sandbox.as_ref().is_some_and(SandboxSpec::is_valid);
    if def.risk_tier != Some(RiskTier::High) || sandbox_ok {
        return Some(def);
    }

    match policy {
        HighTierPolicy::Downgrade => {
            tracing::warn!(
                server = %def.id,
                "server has HIGH risk level but no docker configuration, downgrading to MEDIUM risk level"
            );
            def.risk_tier = Some(RiskTier::Medium);
            Some(def)
        }
        HighTierPolicy::Reject => {
            tracing::error!(
                server = %def.id,
                "server has HIGH risk level but no docker configuration, rejecting definition"
            );
            None
        }
    }
}

// ─── Environment Overrides ──────────────────────────────────────────────────

/// Layer `MCP_SERVER_<NAME>_*` variables over `definitions`.
///
/// `MCP_SERVER_<NAME>_COMMAND` (re)defines server `<name>` (lower-cased);
/// `_ARGS` is comma separated, `_ENV` and `_DOCKER_CONFIG` are JSON objects,
/// `_RISK_LEVEL` is an integer tier. Malformed values are skipped.
pub fn apply_env_overrides<I>(
    definitions: &mut HashMap<String, ServerDefinition>,
    vars: I,
    policy: HighTierPolicy,
) where
    I: IntoIterator<Item = (String, String)>,
{
    let vars: HashMap<String, String> = vars.into_iter().collect();

    let mut names: Vec<&str> = vars
        .keys()
        .filter_map(|key| key.strip_prefix(SERVER_VAR_PREFIX)?.strip_suffix(COMMAND_SUFFIX))
        .filter(|name| !name.is_empty())
        .collect();
    names.sort_unstable();

    for name in names {
        let var = |suffix: &str| vars.get(&format!("{SERVER_VAR_PREFIX}{name}_{suffix}"));
        let id = name.to_ascii_lowercase();

        let mut entry = RawServerEntry {
            command: var("COMMAND").cloned(),
            ..RawServerEntry::default()
        };

        if let Some(args) = var("ARGS") {
            entry.args = args
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(env) = var("ENV") {
            match serde_json::from_str::<HashMap<String, String>>(env) {
                Ok(env) => entry.env = env,
                Err(e) => tracing::warn!(server = %id, error = %e, "ignoring malformed environment override"),
            }
        }

        if let Some(level) = var("RISK_LEVEL") {
            match level.trim().parse::<i64>().ok().and_then(RiskTier::from_level) {
                Some(tier) => entry.risk_level = Some(serde_json::json!(tier.level())),
                None => tracing::warn!(server = %id, value = %level, "ignoring invalid risk level override"),
            }
        }

        if let Some(docker) = var("DOCKER_CONFIG") {
            match serde_json::from_str::<serde_json::Value>(docker) {
                Ok(value) => entry.docker = Some(value),
                Err(e) => tracing::warn!(server = %id, error = %e, "ignoring malformed docker configuration override"),
            }
        }

        if let Some(def) = normalize_entry(&id, entry, policy) {
            tracing::info!(server = %id, "added server from environment");
            definitions.insert(id, def);
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in the raw config text.
fn interpolate_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&resolve_var_expr(&after[..end]));
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated placeholder: keep it verbatim.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_full_entry() {
        let json = r#"{
            "mcpServers": {
                "sandboxed": {
                    "command": "python3",
                    "args": ["-m", "server"],
                    "env": {"TOKEN": "abc"},
                    "riskLevel": 3,
                    "docker": {"image": "mcp/py:latest", "volumes": ["/data:/data"], "network": "none"}
                }
            }
        }"#;
        let defs = parse_config_document(json, false, HighTierPolicy::Downgrade).unwrap();
        let def = &defs["sandboxed"];
        assert_eq!(def.command, "python3");
        assert_eq!(def.args, vec!["-m", "server"]);
        assert_eq!(def.env["TOKEN"], "abc");
        assert_eq!(def.risk_tier, Some(RiskTier::High));
        let sandbox = def.sandbox.as_ref().unwrap();
        assert_eq!(sandbox.image, "mcp/py:latest");
        assert_eq!(sandbox.volumes, vec!["/data:/data"]);
        assert_eq!(sandbox.network.as_deref(), Some("none"));
    }

    #[test]
    fn test_unknown_tier_is_dropped_not_fatal() {
        let json = r#"{"mcpServers": {
            "a": {"command": "x", "riskLevel": 9},
            "b": {"command": "y", "riskLevel": 1}
        }}"#;
        let defs = parse_config_document(json, false, HighTierPolicy::Downgrade).unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs["a"].risk_tier, None);
        assert_eq!(defs["b"].risk_tier, Some(RiskTier::Low));
    }

    #[test]
    fn test_high_without_sandbox_downgrades() {
        let json = r#"{"mcpServers": {
            "nodocker": {"command": "x", "riskLevel": 3},
            "blank": {"command": "x", "riskLevel": 3, "docker": {"image": "  "}}
        }}"#;
        let defs = parse_config_document(json, false, HighTierPolicy::Downgrade).unwrap();
        assert_eq!(defs["nodocker"].risk_tier, Some(RiskTier::Medium));
        assert_eq!(defs["blank"].risk_tier, Some(RiskTier::Medium));
    }

    #[test]
    fn test_high_without_sandbox_rejected_by_policy() {
        let json = r#"{"mcpServers": {"nodocker": {"command": "x", "riskLevel": "high"}}}"#;
        let defs = parse_config_document(json, false, HighTierPolicy::Reject).unwrap();
        assert!(defs.is_empty());
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let json = r#"{"mcpServers": {
            "no_command": {"args": ["x"]},
            "bad_args": {"command": "x", "args": "not-a-list"},
            "ok": {"command": "cat"}
        }}"#;
        let defs = parse_config_document(json, false, HighTierPolicy::Downgrade).unwrap();
        assert_eq!(defs.len(), 1);
        assert!(defs.contains_key("ok"));
    }

    #[test]
    fn test_yaml_document() {
        let yaml = r#"
mcpServers:
  files:
    command: npx
    args: ["-y", "@modelcontextprotocol/server-filesystem"]
    riskLevel: medium
"#;
        let defs = parse_config_document(yaml, true, HighTierPolicy::Downgrade).unwrap();
        assert_eq!(defs["files"].risk_tier, Some(RiskTier::Medium));
        assert_eq!(defs["files"].args.len(), 2);
    }

    #[test]
    fn test_invalid_document_is_config_error() {
        let err = parse_config_document("{not json", false, HighTierPolicy::Downgrade).unwrap_err();
        assert!(matches!(err, BridgeError::Config { .. }));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let defs = load_config_file(
            Path::new("/nonexistent/mcp_config.json"),
            HighTierPolicy::Downgrade,
        )
        .unwrap();
        assert!(defs.is_empty());
    }

    #[test]
    fn test_load_file_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mcp_config.json");
        std::fs::write(&path, r#"{"mcpServers": {"echo": {"command": "cat"}}}"#).unwrap();
        let defs = load_config_file(&path, HighTierPolicy::Downgrade).unwrap();
        assert_eq!(defs["echo"].command, "cat");
    }

    #[test]
    fn test_env_override_adds_server() {
        let mut defs = HashMap::new();
        apply_env_overrides(
            &mut defs,
            vars(&[
                ("MCP_SERVER_GIT_TOOLS_COMMAND", "uvx"),
                ("MCP_SERVER_GIT_TOOLS_ARGS", "mcp-server-git, --repository,."),
                ("MCP_SERVER_GIT_TOOLS_ENV", r#"{"GIT_DIR": "/repo"}"#),
                ("MCP_SERVER_GIT_TOOLS_RISK_LEVEL", "2"),
                ("UNRELATED", "1"),
            ]),
            HighTierPolicy::Downgrade,
        );
        let def = &defs["git_tools"];
        assert_eq!(def.command, "uvx");
        assert_eq!(def.args, vec!["mcp-server-git", "--repository", "."]);
        assert_eq!(def.env["GIT_DIR"], "/repo");
        assert_eq!(def.risk_tier, Some(RiskTier::Medium));
    }

    #[test]
    fn test_env_override_replaces_file_entry() {
        let mut defs = HashMap::new();
        defs.insert(
            "fs".to_string(),
            ServerDefinition::new("fs", "npx").with_risk_tier(RiskTier::Low),
        );
        apply_env_overrides(
            &mut defs,
            vars(&[("MCP_SERVER_FS_COMMAND", "node")]),
            HighTierPolicy::Downgrade,
        );
        assert_eq!(defs["fs"].command, "node");
        assert_eq!(defs["fs"].risk_tier, None);
    }

    #[test]
    fn test_env_override_malformed_values_ignored() {
        let mut defs = HashMap::new();
        apply_env_overrides(
            &mut defs,
            vars(&[
                ("MCP_SERVER_X_COMMAND", "cat"),
                ("MCP_SERVER_X_ENV", "{broken"),
                ("MCP_SERVER_X_RISK_LEVEL", "very"),
            ]),
            HighTierPolicy::Downgrade,
        );
        let def = &defs["x"];
        assert!(def.env.is_empty());
        assert_eq!(def.risk_tier, None);
    }

    #[test]
    fn test_env_override_high_tier_docker() {
        let mut defs = HashMap::new();
        apply_env_overrides(
            &mut defs,
            vars(&[
                ("MCP_SERVER_BOX_COMMAND", "server"),
                ("MCP_SERVER_BOX_RISK_LEVEL", "3"),
                ("MCP_SERVER_BOX_DOCKER_CONFIG", r#"{"image": "mcp/box"}"#),
                ("MCP_SERVER_NOBOX_COMMAND", "server"),
                ("MCP_SERVER_NOBOX_RISK_LEVEL", "3"),
                ("MCP_SERVER_BADBOX_COMMAND", "server"),
                ("MCP_SERVER_BADBOX_RISK_LEVEL", "3"),
                ("MCP_SERVER_BADBOX_DOCKER_CONFIG", "not json"),
            ]),
            HighTierPolicy::Downgrade,
        );
        assert_eq!(defs["box"].risk_tier, Some(RiskTier::High));
        assert_eq!(defs["box"].sandbox.as_ref().unwrap().image, "mcp/box");
        assert_eq!(defs["nobox"].risk_tier, Some(RiskTier::Medium));
        assert_eq!(defs["badbox"].risk_tier, Some(RiskTier::Medium));
    }

    #[test]
    fn test_settings_from_vars() {
        let settings = BridgeSettings::from_vars(vars(&[
            ("MCP_BRIDGE_REQUEST_TIMEOUT_MS", "250"),
            ("MCP_BRIDGE_HANDSHAKE_TIMEOUT_MS", "garbage"),
            ("MCP_BRIDGE_HIGH_TIER_POLICY", "reject"),
        ]));
        assert_eq!(settings.request_timeout, Duration::from_millis(250));
        assert_eq!(settings.handshake_timeout, Duration::from_secs(30));
        assert_eq!(settings.high_tier_policy, HighTierPolicy::Reject);
        assert_eq!(settings.confirmation_ttl, Duration::from_secs(600));
    }

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__MCP_BRIDGE_TEST_UNSET__");
        let out = interpolate_env_vars(r#"{"cwd": "${__MCP_BRIDGE_TEST_UNSET__:-/srv/mcp}"}"#);
        assert_eq!(out, r#"{"cwd": "/srv/mcp"}"#);
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__MCP_BRIDGE_TEST_SET__", "/opt/tools");
        let out = interpolate_env_vars("${__MCP_BRIDGE_TEST_SET__}/bin");
        assert_eq!(out, "/opt/tools/bin");
        std::env::remove_var("__MCP_BRIDGE_TEST_SET__");
    }

    #[test]
    fn test_interpolate_unterminated_kept() {
        assert_eq!(interpolate_env_vars("a ${OOPS"), "a ${OOPS");
        assert_eq!(interpolate_env_vars("plain"), "plain");
    }
}

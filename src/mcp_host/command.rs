//! Launch command resolution.
//!
//! Maps a [`ServerDefinition`] to the invocation actually spawned:
//! - HIGH risk servers with a sandbox spec are rewritten into `docker run`
//! - `npx` / `npm` launchers are resolved to a concrete executable path
//! - Windows `.cmd` / `.bat` wrappers are routed through `cmd /c`
//!
//! This is a best-effort mapping and never fails. A HIGH risk definition
//! without a sandbox comes back with `sandboxed: false`; refusing to run it
//! is the supervisor's job.

use std::path::{Path, PathBuf};

use super::types::{LaunchSpec, RiskTier, ServerDefinition};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Container runtime used for sandboxed execution.
pub const SANDBOX_RUNTIME: &str = "docker";

/// Package-runner launchers that are resolved to a full path.
///
/// Inside a container they are the image's entrypoint, so they are not
/// repeated after the image reference.
const PACKAGE_RUNNERS: &[&str] = &["npx", "npm"];

/// Script extensions that must go through the Windows command interpreter.
const WINDOWS_SCRIPT_EXTENSIONS: &[&str] = &["cmd", "bat"];

// ─── Platform ────────────────────────────────────────────────────────────────

/// Host platform family, for the parts of resolution that differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Unix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

// ─── Transform ───────────────────────────────────────────────────────────────

/// Resolve the launch invocation for `def` on the current platform.
pub fn transform(def: &ServerDefinition) -> LaunchSpec {
    transform_for(def, Platform::current(), &|name| {
        resolve_package_runner(name, Platform::current())
    })
}

/// Platform-parameterized transform. `resolve` maps a package-runner name to
/// an executable path, or `None` to keep the bare name.
pub fn transform_for(
    def: &ServerDefinition,
    platform: Platform,
    resolve: &dyn Fn(&str) -> Option<PathBuf>,
) -> LaunchSpec {
    let mut spec = if def.risk_tier == Some(RiskTier::High) {
        match sandboxed_invocation(def) {
            Some(spec) => spec,
            None => {
                tracing::warn!(
                    server = %def.id,
                    "HIGH risk server has no usable sandbox spec, leaving command untransformed"
                );
                direct_invocation(def, def.command.clone())
            }
        }
    } else if PACKAGE_RUNNERS.contains(&def.command.as_str()) {
        let program = match resolve(&def.command) {
            Some(path) => {
                tracing::info!(server = %def.id, command = %def.command, path = %path.display(), "resolved launcher path");
                path.to_string_lossy().into_owned()
            }
            None => {
                tracing::debug!(server = %def.id, command = %def.command, "launcher not resolved, using bare name");
                def.command.clone()
            }
        };
        direct_invocation(def, program)
    } else {
        direct_invocation(def, def.command.clone())
    };

    if platform == Platform::Windows && is_windows_script(&spec.program) {
        let mut args = Vec::with_capacity(spec.args.len() + 2);
        args.push("/c".to_string());
        args.push(std::mem::replace(&mut spec.program, "cmd".to_string()));
        args.append(&mut spec.args);
        spec.args = args;
    }

    spec
}

fn direct_invocation(def: &ServerDefinition, program: String) -> LaunchSpec {
    let original_command = (program != def.command).then(|| def.command.clone());
    LaunchSpec {
        program,
        args: def.args.clone(),
        env: def.env.clone(),
        cwd: def.cwd.clone(),
        sandboxed: false,
        original_command,
    }
}

/// `docker run --rm -i [-e K=V]... [-v VOL]... [--network NET] IMAGE [CMD] ARGS...`
fn sandboxed_invocation(def: &ServerDefinition) -> Option<LaunchSpec> {
    let sandbox = def.sandbox.as_ref().filter(|s| s.is_valid())?;

    // `-i` keeps stdin attached; the protocol runs over it.
    let mut args: Vec<String> = vec!["run".into(), "--rm".into(), "-i".into()];

    let mut env: Vec<(&String, &String)> = def.env.iter().collect();
    env.sort();
    for (key, value) in env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }

    for volume in &sandbox.volumes {
        args.push("-v".into());
        args.push(volume.clone());
    }

    if let Some(network) = &sandbox.network {
        args.push("--network".into());
        args.push(network.clone());
    }

    args.push(sandbox.image.clone());

    if !PACKAGE_RUNNERS.contains(&def.command.as_str()) {
        args.push(def.command.clone());
    }
    args.extend(def.args.iter().cloned());

    Some(LaunchSpec {
        program: SANDBOX_RUNTIME.to_string(),
        args,
        env: Default::default(),
        cwd: def.cwd.clone(),
        sandboxed: true,
        original_command: Some(def.command.clone()),
    })
}

fn is_windows_script(program: &str) -> bool {
    Path::new(program)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            WINDOWS_SCRIPT_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

// ─── Launcher Resolution ─────────────────────────────────────────────────────

/// Find `npx` / `npm`: well-known install dirs on Windows, `PATH` elsewhere.
pub fn resolve_package_runner(command: &str, platform: Platform) -> Option<PathBuf> {
    match platform {
        Platform::Windows => {
            let file = format!("{command}.cmd");
            let mut candidates = Vec::new();
            if let Ok(appdata) = std::env::var("APPDATA") {
                candidates.push(PathBuf::from(appdata).join("npm").join(&file));
            }
            if let Ok(program_files) = std::env::var("ProgramFiles") {
                candidates.push(PathBuf::from(program_files).join("nodejs").join(&file));
            }
            candidates.push(PathBuf::from(r"C:\Program Files\nodejs").join(&file));
            candidates.into_iter().find(|p| p.is_file())
        }
        Platform::Unix => {
            let path_var = std::env::var_os("PATH")?;
            find_in_path(command, &path_var)
        }
    }
}

/// `which`-style lookup of `command` through a `PATH`-formatted value.
pub fn find_in_path(command: &str, path_var: &std::ffi::OsStr) -> Option<PathBuf> {
    std::env::split_paths(path_var)
        .map(|dir| dir.join(command))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! Environment construction for sandboxed children.
//!
//! Children never inherit the engine's environment wholesale. A short
//! allow-list is copied from the host, then profile and caller variables are
//! layered on top, and credential-looking variables are stripped at the end
//! even if a caller asked for them.

use std::collections::BTreeMap;

/// Variables that never reach a sandboxed process.
pub const FILTERED_ENV_VARS: &[&str] = &[
    // Model provider keys
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GEMINI_API_KEY",
    "OPENROUTER_API_KEY",
    "HF_TOKEN",
    // Cloud provider credentials
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "GOOGLE_APPLICATION_CREDENTIALS",
    "AZURE_CLIENT_SECRET",
    // Forge and registry tokens
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "NPM_TOKEN",
    "CARGO_REGISTRY_TOKEN",
    "PYPI_TOKEN",
    // Database credentials
    "DATABASE_URL",
    "PGPASSWORD",
    "MYSQL_PWD",
    "REDIS_PASSWORD",
    // Agents and sockets
    "SSH_AUTH_SOCK",
    "GPG_AGENT_INFO",
    "VAULT_TOKEN",
    "KUBECONFIG",
    // Dynamic linker hooks
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
];

/// Variables copied from the engine's environment when present.
pub const PRESERVED_ENV_VARS: &[&str] = &["PATH", "LANG", "LC_ALL", "LC_CTYPE", "TZ", "TERM"];

/// Marker set in every sandboxed process.
pub const SANDBOX_MARKER_VAR: &str = "WSBOX_SANDBOX";

/// Fallback `PATH` when the host does not provide one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Whether `name` looks like a credential that must not leak into a sandbox.
pub fn is_filtered(name: &str) -> bool {
    if FILTERED_ENV_VARS.contains(&name) {
        return true;
    }
    let upper = name.to_ascii_uppercase();
    upper.ends_with("_API_KEY") || upper.ends_with("_SECRET") || upper.ends_with("_PASSWORD")
}

/// Build the environment for a sandboxed process.
///
/// `host` supplies the engine's variables (normally `std::env::vars()`), the
/// `layers` are applied in order so later layers win.
pub fn build_sandbox_env<I>(
    host: I,
    layers: &[&BTreeMap<String, String>],
    sandbox_id: &str,
) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: BTreeMap<String, String> = host
        .into_iter()
        .filter(|(key, _)| PRESERVED_ENV_VARS.contains(&key.as_str()))
        .collect();
    env.entry("PATH".to_string())
        .or_insert_with(|| DEFAULT_PATH.to_string());

    for layer in layers {
        for (key, value) in layer.iter() {
            env.insert(key.clone(), value.clone());
        }
    }

    env.retain(|key, _| !is_filtered(key));
    env.insert(SANDBOX_MARKER_VAR.to_string(), sandbox_id.to_string());
    env
}

//! Input validators consulted by capability adapters before they act
//!
//! Every validator is a pure predicate: it never panics and never touches
//! the network or the file system. The caller decides whether a rejection
//! fails the script operation.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tether_protocol::Rejection;
use url::Url;

use crate::{Limits, Verdict};

/// Longest relative path accepted by `validate_path`
pub const MAX_PATH_LEN: usize = 1024;

/// Network access rules for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPolicy {
    /// Lower-case schemes scripts may use
    pub allowed_schemes: Vec<String>,
    /// Hosts (and their subdomains) scripts may not reach
    pub deny_hosts: Vec<String>,
    pub max_url_len: usize,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            allowed_schemes: vec!["http".into(), "https".into(), "ws".into(), "wss".into()],
            deny_hosts: vec![],
            max_url_len: 2048,
        }
    }
}

impl NetworkPolicy {
    /// Deny a host and all its subdomains
    pub fn deny_host(&mut self, host: impl Into<String>) {
        let host = host.into().to_lowercase();
        if !self.deny_hosts.contains(&host) {
            self.deny_hosts.push(host);
        }
    }

    fn host_denied(&self, host: &str) -> Option<&str> {
        let host = host.to_lowercase();
        self.deny_hosts
            .iter()
            .find(|denied| host == **denied || host.ends_with(&format!(".{denied}")))
            .map(String::as_str)
    }
}

/// Check a URL a script wants to reach
pub fn validate_url(raw: &str, policy: &NetworkPolicy) -> Verdict {
    if raw.is_empty() {
        return Verdict::reject("url_empty", "URL is empty");
    }
    if raw.len() > policy.max_url_len {
        return Verdict::reject(
            "url_too_long",
            format!("URL is {} bytes (limit {})", raw.len(), policy.max_url_len),
        );
    }

    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(e) => return Verdict::reject("url_malformed", format!("Invalid URL '{raw}': {e}")),
    };

    let scheme = url.scheme();
    if !policy.allowed_schemes.iter().any(|s| s == scheme) {
        return Verdict::reject(
            "scheme_denied",
            format!("Scheme '{scheme}' is not allowed"),
        );
    }

    let Some(host) = url.host_str() else {
        return Verdict::reject("host_missing", format!("URL '{raw}' has no host"));
    };

    if let Some(denied) = policy.host_denied(host) {
        return Verdict::reject(
            "host_denied",
            format!("Host '{host}' matches deny entry '{denied}'"),
        );
    }

    Verdict::Accept
}

/// Check a workspace-relative path a script wants to read or write
pub fn validate_path(path: &str, workspace_root: &Path) -> Verdict {
    if path.is_empty() {
        return Verdict::reject("path_empty", "Path is empty");
    }
    if path.len() > MAX_PATH_LEN {
        return Verdict::reject(
            "path_too_long",
            format!("Path is {} bytes (limit {MAX_PATH_LEN})", path.len()),
        );
    }
    if path.contains('\0') {
        return Verdict::reject("path_nul", "Path contains a NUL byte");
    }
    if workspace_root.as_os_str().is_empty() {
        return Verdict::reject("workspace_unset", "No workspace root is configured");
    }

    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Verdict::reject(
                    "path_traversal",
                    format!("Path '{path}' escapes the workspace"),
                );
            }
            Component::RootDir | Component::Prefix(_) => {
                return Verdict::reject(
                    "path_absolute",
                    format!("Path '{path}' must be relative to the workspace"),
                );
            }
        }
    }

    Verdict::Accept
}

/// Validate then join a script path onto the workspace root
pub fn resolve_workspace_path(path: &str, workspace_root: &Path) -> Result<PathBuf, Rejection> {
    validate_path(path, workspace_root).into_result()?;
    Ok(workspace_root.join(path))
}

/// Check the size of a source about to be compiled
pub fn validate_source_size(len: usize, limits: &Limits) -> Verdict {
    if len > limits.max_source_bytes {
        return Verdict::reject(
            "source_too_large",
            format!("Source is {len} bytes (limit {})", limits.max_source_bytes),
        );
    }
    Verdict::Accept
}

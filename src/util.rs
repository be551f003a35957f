use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Raised when an executable name cannot be resolved through PATH.
/// Carries a dedicated wire error code so the postexec hook can stay silent.
#[derive(Debug)]
pub struct BinaryNotFound(pub String);

impl fmt::Display for BinaryNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot find binary in PATH: {}", self.0)
    }
}

impl std::error::Error for BinaryNotFound {}

#[derive(Debug)]
pub struct NotImplemented(pub String);

impl fmt::Display for NotImplemented {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not implemented: {}", self.0)
    }
}

impl std::error::Error for NotImplemented {}

/// Chain hash over a list of strings. Feeding the previous digest back into
/// the hasher makes `["ab", "c"]` and `["a", "bc"]` distinct, which a plain
/// concatenation hash would not.
pub fn hash_strings(items: &[String]) -> String {
    let mut chained: Vec<u8> = Vec::new();
    for item in items {
        let mut hasher = Sha256::new();
        hasher.update(&chained);
        hasher.update(item.as_bytes());
        chained = hasher.finalize().to_vec();
    }
    hex_string(&chained)
}

pub fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => !meta.is_dir() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

/// Resolve `name` the way the shell would: names containing a separator are
/// taken relative to `dir`, bare names are searched in `path_var`. Empty PATH
/// entries mean the working directory.
pub fn find_executable(name: &str, dir: &str, path_var: &str) -> anyhow::Result<PathBuf> {
    if name.contains('/') {
        let path = Path::new(name);
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        return Ok(Path::new(dir).join(path));
    }
    for path_dir in path_var.split(':') {
        let path_dir = if path_dir.is_empty() { "." } else { path_dir };
        let mut candidate = Path::new(path_dir).join(name);
        if !candidate.is_absolute() {
            candidate = Path::new(dir).join(candidate);
        }
        if is_executable_file(&candidate) {
            return Ok(candidate);
        }
    }
    Err(BinaryNotFound(name.to_string()).into())
}

pub fn get_env_var<'a>(environ: &'a [String], key: &str) -> &'a str {
    let prefix_len = key.len() + 1;
    environ
        .iter()
        .find(|e| e.len() >= prefix_len && e.starts_with(key) && e.as_bytes()[key.len()] == b'=')
        .map(|e| &e[prefix_len..])
        .unwrap_or("")
}

/// Non-fatal observation carried back in a response envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Warning {
    pub warning: String,
}

/// Collects warnings during request handling.
#[derive(Debug, Default)]
pub struct Warner {
    pub warns: Vec<Warning>,
}

impl Warner {
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{message}");
        self.warns.push(Warning { warning: message });
    }

    pub fn into_warnings(self) -> Option<Vec<Warning>> {
        if self.warns.is_empty() {
            None
        } else {
            Some(self.warns)
        }
    }
}

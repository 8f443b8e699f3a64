//! Secret reference resolver.
//!
//! The cookie header is a long-lived secret and should not sit in
//! `config.toml` in plain text. The configured value may instead reference
//! where to find it:
//!
//! - `env::VAR_NAME` - reads `$VAR_NAME`
//! - `file::path/to/cookies.txt` - reads the file, surrounding whitespace trimmed
//! - `pass::path/in/store` - first line of `pass show path/in/store`
//! - anything else - used as-is

use std::path::Path;

use crate::error::{RpcError, RpcResult};

/// Resolves a value that may be a secret reference.
pub fn resolve(value: &str) -> RpcResult<String> {
    let resolved = if let Some(var) = value.strip_prefix("env::") {
        resolve_env(var)
    } else if let Some(path) = value.strip_prefix("file::") {
        resolve_file(Path::new(path))
    } else if let Some(path) = value.strip_prefix("pass::") {
        resolve_pass(path)
    } else {
        Ok(value.to_string())
    };
    resolved.map_err(RpcError::Config)
}

fn resolve_env(var: &str) -> Result<String, String> {
    std::env::var(var).map_err(|_| format!("environment variable `{}` is not set", var))
}

fn resolve_file(path: &Path) -> Result<String, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let content = content.trim();
    if content.is_empty() {
        return Err(format!("{} is empty", path.display()));
    }
    Ok(content.to_string())
}

fn resolve_pass(path: &str) -> Result<String, String> {
    let output = std::process::Command::new("pass")
        .arg("show")
        .arg(path)
        .output()
        .map_err(|e| format!("failed to run `pass show {}`: {}", path, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "`pass show {}` failed (exit {}): {}",
            path,
            output.status,
            stderr.trim()
        ));
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(str::to_string)
        .ok_or_else(|| format!("`pass show {}` produced no output", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_value_passthrough() {
        assert_eq!(resolve("SID=abc; HSID=def").unwrap(), "SID=abc; HSID=def");
        assert_eq!(resolve("").unwrap(), "");
    }

    #[test]
    fn env_reference() {
        unsafe {
            std::env::set_var("_RPCWIRE_TEST_COOKIES", "SID=from-env");
        }
        assert_eq!(resolve("env::_RPCWIRE_TEST_COOKIES").unwrap(), "SID=from-env");
        unsafe {
            std::env::remove_var("_RPCWIRE_TEST_COOKIES");
        }
    }

    #[test]
    fn missing_env_reference() {
        let err = resolve("env::_RPCWIRE_NONEXISTENT_VAR_12345").unwrap_err();
        assert!(matches!(err, RpcError::Config(ref m) if m.contains("not set")));
    }

    #[test]
    fn file_reference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.txt");
        std::fs::write(&path, "  SID=from-file\n").unwrap();

        let value = resolve(&format!("file::{}", path.display())).unwrap();
        assert_eq!(value, "SID=from-file");

        std::fs::write(&path, "\n").unwrap();
        assert!(resolve(&format!("file::{}", path.display())).is_err());
    }

    #[test]
    fn pass_reference_failure() {
        let result = resolve("pass::nonexistent/entry/that/should/not/exist/12345");
        assert!(matches!(result, Err(RpcError::Config(_))));
    }
}

//! HTTP Basic authentication against the flat user file
//!
//! Credentials live in `.users` inside the authoritative destination's
//! directory, one `user:password` line per user. The file loads on first
//! use and stays cached for the run; editing it takes a restart. There is
//! no lockout, rate limiting, or timing-safe comparison here; the check
//! is exact equality against `Basic base64(user:password)` per user, which
//! is all the emulated API ever did.

use crate::error::ProtocolError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// File name of the credential list inside the authoritative directory.
pub const USERS_FILE: &str = ".users";

/// Validates Basic credentials and knows the user roster.
pub struct AuthGate {
    path: PathBuf,
    users: Mutex<Option<Vec<(String, String)>>>,
}

impl AuthGate {
    /// The gate reads `<authoritative_dir>/.users`.
    pub fn new(authoritative_dir: &Path) -> Self {
        AuthGate {
            path: authoritative_dir.join(USERS_FILE),
            users: Mutex::new(None),
        }
    }

    /// Check an `Authorization` header value against every known user.
    ///
    /// Returns the matched username; the homepage fragment needs to know
    /// which caller it is talking to.
    pub fn check_basic_auth(&self, header: Option<&str>) -> Result<String, ProtocolError> {
        let users = self.load()?;
        let Some(header) = header else {
            return Err(ProtocolError::Unauthorized);
        };
        for (user, password) in &users {
            let expect = format!("Basic {}", BASE64.encode(format!("{}:{}", user, password)));
            if expect == header {
                return Ok(user.clone());
            }
        }
        Err(ProtocolError::Unauthorized)
    }

    /// All known usernames, sorted. The homepage `mid` value is an index
    /// into this list.
    pub fn sorted_users(&self) -> Result<Vec<String>, ProtocolError> {
        let users = self.load()?;
        let mut names: Vec<String> = users.into_iter().map(|(user, _)| user).collect();
        names.sort();
        Ok(names)
    }

    fn load(&self) -> Result<Vec<(String, String)>, ProtocolError> {
        let mut guard = self.users.lock().unwrap();
        if let Some(users) = guard.as_ref() {
            return Ok(users.clone());
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|_| ProtocolError::ConfigurationMissing(self.path.display().to_string()))?;
        let mut users = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once(':') {
                Some((user, password)) => users.push((user.to_string(), password.to_string())),
                None => tracing::warn!(path = %self.path.display(), line, "skipping malformed user line"),
            }
        }
        tracing::debug!(count = users.len(), path = %self.path.display(), "loaded user file");
        *guard = Some(users.clone());
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_with(lines: &str) -> (tempfile::TempDir, AuthGate) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(USERS_FILE), lines).unwrap();
        let gate = AuthGate::new(dir.path());
        (dir, gate)
    }

    fn basic(user: &str, password: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{}:{}", user, password)))
    }

    #[test]
    fn test_valid_credentials_return_username() {
        let (_dir, gate) = gate_with("wanda:secret\npietro:faster\n");
        let header = basic("wanda", "secret");
        assert_eq!(gate.check_basic_auth(Some(&header)).unwrap(), "wanda");
    }

    #[test]
    fn test_wrong_password_rejected() {
        let (_dir, gate) = gate_with("wanda:secret\n");
        let header = basic("wanda", "guess");
        assert!(matches!(
            gate.check_basic_auth(Some(&header)),
            Err(ProtocolError::Unauthorized)
        ));
    }

    #[test]
    fn test_malformed_and_missing_headers_rejected() {
        let (_dir, gate) = gate_with("wanda:secret\n");
        for header in [Some("Bearer xyz"), Some("Basic !!!"), Some(""), None] {
            assert!(matches!(
                gate.check_basic_auth(header),
                Err(ProtocolError::Unauthorized)
            ));
        }
    }

    #[test]
    fn test_missing_user_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let gate = AuthGate::new(dir.path());
        match gate.check_basic_auth(Some("Basic abc")) {
            Err(ProtocolError::ConfigurationMissing(path)) => {
                assert!(path.ends_with(USERS_FILE));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_file_read_once_then_cached() {
        let (dir, gate) = gate_with("wanda:secret\n");
        let header = basic("wanda", "secret");
        gate.check_basic_auth(Some(&header)).unwrap();
        // Deleting the file after the first load must not matter.
        std::fs::remove_file(dir.path().join(USERS_FILE)).unwrap();
        assert_eq!(gate.check_basic_auth(Some(&header)).unwrap(), "wanda");
    }

    #[test]
    fn test_sorted_users() {
        let (_dir, gate) = gate_with("zeno:a\nanna:b\nmara:c\n");
        assert_eq!(gate.sorted_users().unwrap(), vec!["anna", "mara", "zeno"]);
    }

    #[test]
    fn test_password_may_contain_colon() {
        let (_dir, gate) = gate_with("kim:se:cr:et\n");
        let header = basic("kim", "se:cr:et");
        assert_eq!(gate.check_basic_auth(Some(&header)).unwrap(), "kim");
    }
}

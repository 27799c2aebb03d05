//! Persisted connection state
//!
//! The whole record is kept in a single JSON file under the per-user config
//! directory. Mutations follow a load-whole / mutate / save-whole discipline:
//! there are no partial or merge writes, so after a crash the last complete
//! write wins.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

const STATE_FILE: &str = "snx-data.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to access state file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("No per-user config directory available")]
    NoConfigDir,
}

/// One saved route table entry, flattened for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub domain: String,
    pub address: String,
}

/// The full persisted record.
///
/// The route table is an explicit domain -> address-list mapping. Addresses
/// within a domain are unique; an entry emptied by removal is deleted rather
/// than left as an empty list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub office_mode_ip: Option<String>,
    pub keep_credentials: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub keep_routes: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub routes: BTreeMap<String, Vec<String>>,
}

impl PersistedState {
    /// Union the resolved addresses into the domain's entry, keeping insertion
    /// order and skipping duplicates.
    pub fn add_addresses(&mut self, domain: &str, addresses: &[String]) {
        let entry = self.routes.entry(domain.to_string()).or_default();
        for addr in addresses {
            if !entry.contains(addr) {
                entry.push(addr.clone());
            }
        }
    }

    /// Remove one address from a domain's entry. Deletes the entry entirely
    /// when its last address is removed. Returns whether anything changed.
    pub fn remove_address(&mut self, domain: &str, address: &str) -> bool {
        let Some(entry) = self.routes.get_mut(domain) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|a| a != address);
        let changed = entry.len() != before;
        if entry.is_empty() {
            self.routes.remove(domain);
        }
        changed
    }

    /// All saved (domain, address) pairs.
    pub fn route_entries(&self) -> Vec<RouteEntry> {
        self.routes
            .iter()
            .flat_map(|(domain, addrs)| {
                addrs.iter().map(|addr| RouteEntry {
                    domain: domain.clone(),
                    address: addr.clone(),
                })
            })
            .collect()
    }

    /// Apply the disconnect retention policy.
    ///
    /// With `keep_credentials` unset everything is dropped. With it set,
    /// credentials survive; the route table survives only if `keep_routes` is
    /// also set. The office-mode IP never survives a disconnect.
    pub fn after_disconnect(self) -> PersistedState {
        if !self.keep_credentials {
            return PersistedState::default();
        }
        let mut kept = PersistedState {
            keep_credentials: true,
            server: self.server,
            username: self.username,
            password: self.password,
            ..PersistedState::default()
        };
        if self.keep_routes {
            kept.keep_routes = true;
            kept.routes = self.routes;
        }
        kept
    }
}

/// Handle to the on-disk state file.
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    /// Store at `~/.config/snx-connect/snx-data.json`, creating the directory.
    pub fn default_location() -> Result<Self, StoreError> {
        let dir = dirs::config_dir()
            .ok_or(StoreError::NoConfigDir)?
            .join("snx-connect");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            path: dir.join(STATE_FILE),
        })
    }

    /// Store at an explicit file path.
    pub fn at(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the whole record. A missing file yields the empty record; an
    /// unreadable record is treated the same, since losing saved routes is
    /// preferable to refusing every operation.
    pub fn load(&self) -> Result<PersistedState, StoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedState::default());
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        match serde_json::from_str(&content) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!("State file {} is corrupt ({}), starting empty", self.path.display(), e);
                Ok(PersistedState::default())
            }
        }
    }

    /// Persist the whole record in one write.
    pub fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(state)?;
        std::fs::write(&self.path, content)?;
        debug!("State saved to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::at(dir.path().join(STATE_FILE));
        (dir, store)
    }

    fn sample_state() -> PersistedState {
        let mut state = PersistedState {
            office_mode_ip: Some("10.10.5.7".to_string()),
            keep_credentials: true,
            server: Some("vpn.example.com".to_string()),
            username: Some("alice".to_string()),
            password: Some("secret".to_string()),
            keep_routes: true,
            ..PersistedState::default()
        };
        state.add_addresses("cluster.example.com", &["192.0.2.10".to_string(), "192.0.2.11".to_string()]);
        state
    }

    #[test]
    fn load_missing_file_yields_empty_record() {
        let (_dir, store) = scratch_store();
        assert_eq!(store.load().unwrap(), PersistedState::default());
    }

    #[test]
    fn load_corrupt_file_yields_empty_record() {
        let (_dir, store) = scratch_store();
        std::fs::write(store.path(), "{not json").unwrap();
        assert_eq!(store.load().unwrap(), PersistedState::default());
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let (_dir, store) = scratch_store();
        let state = sample_state();
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn add_addresses_is_idempotent_union() {
        let mut state = PersistedState::default();
        state.add_addresses("d.example.com", &["192.0.2.1".to_string(), "192.0.2.2".to_string()]);
        state.add_addresses("d.example.com", &["192.0.2.2".to_string(), "192.0.2.3".to_string()]);
        assert_eq!(
            state.routes["d.example.com"],
            vec!["192.0.2.1", "192.0.2.2", "192.0.2.3"]
        );
    }

    #[test]
    fn removing_last_address_deletes_the_domain() {
        let mut state = PersistedState::default();
        state.add_addresses("d.example.com", &["192.0.2.1".to_string()]);
        assert!(state.remove_address("d.example.com", "192.0.2.1"));
        assert!(state.routes.is_empty());
        assert!(!state.remove_address("d.example.com", "192.0.2.1"));
    }

    #[test]
    fn route_entries_flatten_all_pairs() {
        let state = sample_state();
        let entries = state.route_entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.domain == "cluster.example.com"));
    }

    #[test]
    fn disconnect_without_keep_credentials_clears_everything() {
        let mut state = sample_state();
        state.keep_credentials = false;
        assert_eq!(state.after_disconnect(), PersistedState::default());
    }

    #[test]
    fn disconnect_keeping_credentials_only_drops_routes() {
        let mut state = sample_state();
        state.keep_routes = false;
        let kept = state.after_disconnect();
        assert_eq!(kept.server.as_deref(), Some("vpn.example.com"));
        assert_eq!(kept.username.as_deref(), Some("alice"));
        assert_eq!(kept.password.as_deref(), Some("secret"));
        assert!(kept.keep_credentials);
        assert!(kept.routes.is_empty());
        assert!(!kept.keep_routes);
        assert!(kept.office_mode_ip.is_none());
    }

    #[test]
    fn disconnect_keeping_both_retains_route_table() {
        let state = sample_state();
        let routes = state.routes.clone();
        let kept = state.after_disconnect();
        assert!(kept.keep_credentials);
        assert!(kept.keep_routes);
        assert_eq!(kept.routes, routes);
        assert!(kept.office_mode_ip.is_none());
    }
}

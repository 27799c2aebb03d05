//! Route reconciliation between the system routing table and saved state
//!
//! Every route this tool manages points a single destination address at the
//! office-mode IP gateway. Mutations for one logical operation are batched
//! into a single elevated invocation, and the saved route table is only
//! updated after the batch succeeds, so state and system never diverge for
//! longer than one operation.
//!
//! Routes are gateway-scoped only (`ip route ... via <gateway>`), not bound
//! to a tunnel device name.

use crate::elevate::{ElevateError, PrivilegedRunner};
use crate::resolver::{ResolveError, Resolver};
use crate::store::{SessionStore, StoreError};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("No active VPN session; the office-mode IP is not set")]
    NoActiveSession,
    #[error("No valid IPv4 addresses found for {0}")]
    NoAddressesResolved(String),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Elevate(#[from] ElevateError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct RouteReconciler {
    runner: PrivilegedRunner,
    resolver: Resolver,
}

impl Default for RouteReconciler {
    fn default() -> Self {
        Self::new(PrivilegedRunner::default(), Resolver::default())
    }
}

impl RouteReconciler {
    pub fn new(runner: PrivilegedRunner, resolver: Resolver) -> Self {
        Self { runner, resolver }
    }

    pub fn runner(&self) -> &PrivilegedRunner {
        &self.runner
    }

    /// Resolve a domain and route every resolved address through the gateway.
    ///
    /// The saved route table is only touched once the whole batch has run, and
    /// addresses already present for the domain are not duplicated.
    pub async fn add_route(
        &self,
        store: &SessionStore,
        gateway: &str,
        domain: &str,
    ) -> Result<Vec<String>, RouteError> {
        let addresses = self.resolver.resolve(domain).await?;
        if addresses.is_empty() {
            return Err(RouteError::NoAddressesResolved(domain.to_string()));
        }

        let commands: Vec<String> = addresses
            .iter()
            .map(|addr| add_command(addr, gateway))
            .collect();
        self.runner.run_batch(&commands).await?;

        let mut state = store.load()?;
        state.add_addresses(domain, &addresses);
        store.save(&state)?;
        info!("Added {} route(s) for {} via {}", addresses.len(), domain, gateway);
        Ok(addresses)
    }

    /// Drop a single saved route and its table entry. The domain's entry is
    /// deleted entirely when this removes its last address.
    pub async fn remove_route(
        &self,
        store: &SessionStore,
        gateway: &str,
        domain: &str,
        address: &str,
    ) -> Result<(), RouteError> {
        self.runner
            .run_batch(&[delete_command(address, gateway)])
            .await?;

        let mut state = store.load()?;
        if state.remove_address(domain, address) {
            store.save(&state)?;
        }
        info!("Removed route {} ({})", address, domain);
        Ok(())
    }

    /// Re-apply every saved route after a successful connect.
    ///
    /// Best-effort: a failure here must not abort a connection that already
    /// succeeded, so it is logged and swallowed.
    pub async fn reapply_saved(&self, store: &SessionStore, gateway: &str) {
        let commands = match store.load() {
            Ok(state) => batch(&state.route_entries(), gateway, add_command),
            Err(e) => {
                warn!("Could not load saved routes for re-apply: {}", e);
                return;
            }
        };
        if commands.is_empty() {
            info!("No saved routes to re-apply");
            return;
        }
        match self.runner.run_batch(&commands).await {
            Ok(()) => info!("Re-applied {} saved route(s)", commands.len()),
            Err(e) => warn!("Failed to re-apply saved routes: {}", e),
        }
    }

    /// Tear down every saved route at disconnect.
    ///
    /// Best-effort for the same reason: disconnect must still finish its
    /// state cleanup even when the routing table refuses to cooperate.
    pub async fn teardown_all(&self, store: &SessionStore, gateway: &str) {
        let commands = match store.load() {
            Ok(state) => batch(&state.route_entries(), gateway, delete_command),
            Err(e) => {
                warn!("Could not load saved routes for teardown: {}", e);
                return;
            }
        };
        if commands.is_empty() {
            return;
        }
        match self.runner.run_batch(&commands).await {
            Ok(()) => info!("Removed {} saved route(s)", commands.len()),
            Err(e) => warn!("Failed to delete saved routes on disconnect: {}", e),
        }
    }
}

fn add_command(address: &str, gateway: &str) -> String {
    format!("ip route add {address} via {gateway}")
}

fn delete_command(address: &str, gateway: &str) -> String {
    format!("ip route del {address} via {gateway}")
}

fn batch(
    entries: &[crate::store::RouteEntry],
    gateway: &str,
    command: fn(&str, &str) -> String,
) -> Vec<String> {
    entries
        .iter()
        .map(|entry| command(&entry.address, gateway))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PersistedState;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    fn executable(path: &Path, body: &str) -> String {
        std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn recording_runner(dir: &Path) -> (PrivilegedRunner, PathBuf) {
        let log = dir.join("commands.log");
        let helper = executable(
            &dir.join("fake-helper"),
            &format!("cat >> {}", log.display()),
        );
        (PrivilegedRunner::new(helper, "bash"), log)
    }

    fn fake_resolver(dir: &Path, answers: &[&str]) -> Resolver {
        let mut body = String::new();
        for answer in answers {
            body.push_str(&format!("echo 'Name: query'\necho 'Address: {answer}'\n"));
        }
        Resolver::new(executable(&dir.join("fake-nslookup"), &body))
    }

    fn scratch_store(dir: &Path) -> SessionStore {
        SessionStore::at(dir.join("state.json"))
    }

    #[tokio::test]
    async fn add_route_batches_commands_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, log) = recording_runner(dir.path());
        let resolver = fake_resolver(dir.path(), &["192.0.2.10", "192.0.2.11"]);
        let reconciler = RouteReconciler::new(runner, resolver);
        let store = scratch_store(dir.path());

        let addresses = reconciler
            .add_route(&store, "10.10.5.7", "cluster.example.com")
            .await
            .unwrap();
        assert_eq!(addresses, vec!["192.0.2.10", "192.0.2.11"]);

        let recorded = std::fs::read_to_string(&log).unwrap();
        assert_eq!(
            recorded,
            "ip route add 192.0.2.10 via 10.10.5.7\nip route add 192.0.2.11 via 10.10.5.7\n"
        );

        let state = store.load().unwrap();
        assert_eq!(state.routes["cluster.example.com"], addresses);
    }

    #[tokio::test]
    async fn add_route_twice_keeps_entries_unique() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, _log) = recording_runner(dir.path());
        let resolver = fake_resolver(dir.path(), &["192.0.2.10"]);
        let reconciler = RouteReconciler::new(runner, resolver);
        let store = scratch_store(dir.path());

        reconciler
            .add_route(&store, "10.10.5.7", "cluster.example.com")
            .await
            .unwrap();
        reconciler
            .add_route(&store, "10.10.5.7", "cluster.example.com")
            .await
            .unwrap();

        let state = store.load().unwrap();
        assert_eq!(state.routes["cluster.example.com"], vec!["192.0.2.10"]);
    }

    #[tokio::test]
    async fn add_route_with_no_answers_fails_before_elevation() {
        let dir = tempfile::tempdir().unwrap();
        let runner = PrivilegedRunner::new("/nonexistent/helper", "bash");
        let resolver = fake_resolver(dir.path(), &[]);
        let reconciler = RouteReconciler::new(runner, resolver);
        let store = scratch_store(dir.path());

        let err = reconciler
            .add_route(&store, "10.10.5.7", "unknown.example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::NoAddressesResolved(_)));
        assert!(store.load().unwrap().routes.is_empty());
    }

    #[tokio::test]
    async fn failed_batch_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let helper = executable(&dir.path().join("failing-helper"), "echo nope >&2\nexit 1");
        let runner = PrivilegedRunner::new(helper, "bash");
        let resolver = fake_resolver(dir.path(), &["192.0.2.10"]);
        let reconciler = RouteReconciler::new(runner, resolver);
        let store = scratch_store(dir.path());

        let err = reconciler
            .add_route(&store, "10.10.5.7", "cluster.example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::Elevate(_)));
        assert!(store.load().unwrap().routes.is_empty());
    }

    #[tokio::test]
    async fn remove_last_route_deletes_the_domain_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, log) = recording_runner(dir.path());
        let reconciler = RouteReconciler::new(runner, fake_resolver(dir.path(), &[]));
        let store = scratch_store(dir.path());

        let mut state = PersistedState::default();
        state.add_addresses("cluster.example.com", &["192.0.2.10".to_string()]);
        store.save(&state).unwrap();

        reconciler
            .remove_route(&store, "10.10.5.7", "cluster.example.com", "192.0.2.10")
            .await
            .unwrap();

        let recorded = std::fs::read_to_string(&log).unwrap();
        assert_eq!(recorded, "ip route del 192.0.2.10 via 10.10.5.7\n");
        assert!(store.load().unwrap().routes.is_empty());
    }

    #[tokio::test]
    async fn teardown_deletes_every_saved_pair() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, log) = recording_runner(dir.path());
        let reconciler = RouteReconciler::new(runner, fake_resolver(dir.path(), &[]));
        let store = scratch_store(dir.path());

        let mut state = PersistedState::default();
        state.add_addresses("a.example.com", &["192.0.2.1".to_string()]);
        state.add_addresses("b.example.com", &["192.0.2.2".to_string()]);
        store.save(&state).unwrap();

        reconciler.teardown_all(&store, "10.10.5.7").await;

        let recorded = std::fs::read_to_string(&log).unwrap();
        assert_eq!(
            recorded,
            "ip route del 192.0.2.1 via 10.10.5.7\nip route del 192.0.2.2 via 10.10.5.7\n"
        );
    }

    #[tokio::test]
    async fn teardown_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let runner = PrivilegedRunner::new("/nonexistent/helper", "bash");
        let reconciler = RouteReconciler::new(runner, fake_resolver(dir.path(), &[]));
        let store = scratch_store(dir.path());

        let mut state = PersistedState::default();
        state.add_addresses("a.example.com", &["192.0.2.1".to_string()]);
        store.save(&state).unwrap();

        // Must not error or panic even though the helper is missing.
        reconciler.teardown_all(&store, "10.10.5.7").await;
        reconciler.reapply_saved(&store, "10.10.5.7").await;
    }
}

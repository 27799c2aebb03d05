//! VPN session lifecycle orchestration
//!
//! `VpnManager` ties the pieces together: it drives the SNX client through
//! authentication, keeps the persisted record in step with the live session,
//! and delegates route work to the reconciler. Methods are async and
//! sequential; callers are expected to serialize session-affecting
//! operations.

use crate::deps::{self, Dependencies, DependencyError};
use crate::routes::{RouteError, RouteReconciler};
use crate::session::{ConnectError, SnxClient};
use crate::store::{PersistedState, RouteEntry, SessionStore, StoreError};
use std::path::PathBuf;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DisconnectError {
    #[error("Could not invoke the SNX client to disconnect: {0}")]
    ClientUnavailable(std::io::Error),
}

pub struct VpnManager {
    store: SessionStore,
    client: SnxClient,
    reconciler: RouteReconciler,
    install_script: Option<PathBuf>,
    office_mode_ip: Option<String>,
}

impl VpnManager {
    /// Manager over the default store location and system binaries.
    pub fn new() -> Result<Self, StoreError> {
        Self::with_parts(
            SessionStore::default_location()?,
            SnxClient::default(),
            RouteReconciler::default(),
        )
    }

    /// Manager over explicit collaborators.
    ///
    /// The office-mode IP of a still-live session is primed from the store,
    /// so route operations keep working after a restart of this process.
    pub fn with_parts(
        store: SessionStore,
        client: SnxClient,
        reconciler: RouteReconciler,
    ) -> Result<Self, StoreError> {
        let office_mode_ip = store.load()?.office_mode_ip;
        Ok(Self {
            store,
            client,
            reconciler,
            install_script: None,
            office_mode_ip,
        })
    }

    pub fn set_install_script(&mut self, script: PathBuf) {
        self.install_script = Some(script);
    }

    pub fn office_mode_ip(&self) -> Option<&str> {
        self.office_mode_ip.as_deref()
    }

    /// Authenticate against the server and record the session.
    ///
    /// On success the office-mode IP is persisted, credentials are saved when
    /// requested, and saved routes are re-applied (best-effort) if the
    /// keep-routes flag is set.
    pub async fn connect(
        &mut self,
        server: &str,
        username: &str,
        password: &str,
        keep_credentials: bool,
    ) -> Result<String, ConnectError> {
        if server.is_empty() || username.is_empty() || password.is_empty() {
            return Err(ConnectError::MissingCredentials);
        }

        let mut state = self.store.load()?;
        let office_ip = self
            .client
            .authenticate(server, username, password, state.office_mode_ip.clone())
            .await?;

        state.office_mode_ip = Some(office_ip.clone());
        if keep_credentials {
            state.keep_credentials = true;
            state.server = Some(server.to_string());
            state.username = Some(username.to_string());
            state.password = Some(password.to_string());
        }
        self.store.save(&state)?;
        self.office_mode_ip = Some(office_ip.clone());
        info!("Connected; office-mode IP {}", office_ip);

        if state.keep_routes {
            self.reconciler.reapply_saved(&self.store, &office_ip).await;
        } else {
            debug!("Keep-routes disabled; not re-applying saved routes");
        }
        Ok(office_ip)
    }

    /// Disconnect and clean up.
    ///
    /// `snx -d` frequently exits non-zero even when teardown worked, so a
    /// failing exit is logged and tolerated. Route teardown and state pruning
    /// always run; only a client binary that cannot be invoked at all is
    /// fatal.
    pub async fn disconnect(&mut self) -> Result<String, DisconnectError> {
        info!("Disconnecting via '{} -d'", self.client.bin());
        let output = Command::new(self.client.bin())
            .arg("-d")
            .output()
            .await
            .map_err(DisconnectError::ClientUnavailable)?;

        let message = if output.status.success() {
            "Disconnected successfully.".to_string()
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!("'{} -d' reported an error (often harmless): {}", self.client.bin(), stderr);
            "Disconnected; the SNX client reported an error (might be ok).".to_string()
        };

        let gateway = self.office_mode_ip.clone().or_else(|| {
            self.store
                .load()
                .ok()
                .and_then(|state| state.office_mode_ip)
        });
        if let Some(gateway) = gateway {
            self.reconciler.teardown_all(&self.store, &gateway).await;
        }

        match self.store.load() {
            Ok(state) => {
                if let Err(e) = self.store.save(&state.after_disconnect()) {
                    warn!("Could not prune state after disconnect: {}", e);
                }
            }
            Err(e) => warn!("Could not load state for disconnect pruning: {}", e),
        }
        self.office_mode_ip = None;
        Ok(message)
    }

    /// Resolve a domain and route it through the active session.
    pub async fn add_route(&self, domain: &str) -> Result<Vec<String>, RouteError> {
        let gateway = self
            .office_mode_ip
            .as_deref()
            .ok_or(RouteError::NoActiveSession)?;
        self.reconciler.add_route(&self.store, gateway, domain).await
    }

    /// Remove one saved route from the active session.
    pub async fn remove_route(&self, domain: &str, address: &str) -> Result<(), RouteError> {
        let gateway = self
            .office_mode_ip
            .as_deref()
            .ok_or(RouteError::NoActiveSession)?;
        self.reconciler
            .remove_route(&self.store, gateway, domain, address)
            .await
    }

    pub fn saved_routes(&self) -> Result<Vec<RouteEntry>, StoreError> {
        Ok(self.store.load()?.route_entries())
    }

    pub fn saved_state(&self) -> Result<PersistedState, StoreError> {
        self.store.load()
    }

    pub fn set_keep_routes(&self, keep: bool) -> Result<(), StoreError> {
        let mut state = self.store.load()?;
        state.keep_routes = keep;
        self.store.save(&state)?;
        info!("Keep routes set to {}", keep);
        Ok(())
    }

    pub fn check_dependencies(&self) -> Dependencies {
        deps::check(self.client.bin(), self.reconciler.runner().helper())
    }

    /// Run the bundled SNX install script under elevation.
    pub async fn install_client(&self) -> Result<String, DependencyError> {
        let script = match &self.install_script {
            Some(script) => script.clone(),
            None => deps::default_install_script()
                .ok_or_else(|| DependencyError::ScriptMissing(PathBuf::from(deps::INSTALL_SCRIPT)))?,
        };
        deps::install_client(self.reconciler.runner().helper(), &script).await
    }
}

//! Background worker layer for embedders
//!
//! A GUI (or any event-loop caller) must never block on a connect or a route
//! mutation. Commands go in over an async channel and are handled one at a
//! time by a worker task; each command produces exactly one event on a
//! standard mpsc sender the embedder polls from its own thread. Operations
//! cannot be cancelled mid-flight; callers serialize session-affecting
//! commands themselves.

use crate::error::VpnError;
use crate::manager::VpnManager;
use std::sync::mpsc::Sender;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{info, warn};

#[derive(Error, Debug)]
#[error("VPN service worker is no longer running")]
pub struct ServiceClosed;

#[derive(Debug)]
pub enum VpnCommand {
    Connect {
        server: String,
        username: String,
        password: String,
        keep_credentials: bool,
    },
    Disconnect,
    AddRoute {
        domain: String,
    },
    RemoveRoute {
        domain: String,
        address: String,
    },
    Install,
    Shutdown,
}

/// Which operation an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Disconnect,
    AddRoute,
    RemoveRoute,
    Install,
}

/// Outcome of one command. Exactly one event is emitted per command.
#[derive(Debug)]
pub enum VpnEvent {
    Connected {
        office_ip: String,
    },
    Disconnected {
        message: String,
    },
    RouteAdded {
        domain: String,
        addresses: Vec<String>,
    },
    RouteRemoved {
        domain: String,
        address: String,
    },
    InstallFinished {
        message: String,
    },
    Failed {
        operation: Operation,
        error: VpnError,
    },
}

/// Handle for submitting commands to the worker. Cloneable and cheap.
#[derive(Clone)]
pub struct VpnService {
    command_tx: UnboundedSender<VpnCommand>,
}

impl VpnService {
    /// Start the worker task on the current tokio runtime.
    pub fn spawn(manager: VpnManager, event_tx: Sender<VpnEvent>) -> Self {
        let (command_tx, command_rx) = unbounded_channel();
        tokio::spawn(run_loop(manager, command_rx, event_tx));
        Self { command_tx }
    }

    pub fn connect(
        &self,
        server: String,
        username: String,
        password: String,
        keep_credentials: bool,
    ) -> Result<(), ServiceClosed> {
        self.send(VpnCommand::Connect {
            server,
            username,
            password,
            keep_credentials,
        })
    }

    pub fn disconnect(&self) -> Result<(), ServiceClosed> {
        self.send(VpnCommand::Disconnect)
    }

    pub fn add_route(&self, domain: String) -> Result<(), ServiceClosed> {
        self.send(VpnCommand::AddRoute { domain })
    }

    pub fn remove_route(&self, domain: String, address: String) -> Result<(), ServiceClosed> {
        self.send(VpnCommand::RemoveRoute { domain, address })
    }

    pub fn install(&self) -> Result<(), ServiceClosed> {
        self.send(VpnCommand::Install)
    }

    pub fn shutdown(&self) -> Result<(), ServiceClosed> {
        self.send(VpnCommand::Shutdown)
    }

    fn send(&self, command: VpnCommand) -> Result<(), ServiceClosed> {
        self.command_tx.send(command).map_err(|_| ServiceClosed)
    }
}

async fn run_loop(
    mut manager: VpnManager,
    mut command_rx: UnboundedReceiver<VpnCommand>,
    event_tx: Sender<VpnEvent>,
) {
    info!("VPN service worker started");
    while let Some(command) = command_rx.recv().await {
        let event = match command {
            VpnCommand::Shutdown => break,
            VpnCommand::Connect {
                server,
                username,
                password,
                keep_credentials,
            } => match manager
                .connect(&server, &username, &password, keep_credentials)
                .await
            {
                Ok(office_ip) => VpnEvent::Connected { office_ip },
                Err(e) => failed(Operation::Connect, e.into()),
            },
            VpnCommand::Disconnect => match manager.disconnect().await {
                Ok(message) => VpnEvent::Disconnected { message },
                Err(e) => failed(Operation::Disconnect, e.into()),
            },
            VpnCommand::AddRoute { domain } => match manager.add_route(&domain).await {
                Ok(addresses) => VpnEvent::RouteAdded { domain, addresses },
                Err(e) => failed(Operation::AddRoute, e.into()),
            },
            VpnCommand::RemoveRoute { domain, address } => {
                match manager.remove_route(&domain, &address).await {
                    Ok(()) => VpnEvent::RouteRemoved { domain, address },
                    Err(e) => failed(Operation::RemoveRoute, e.into()),
                }
            }
            VpnCommand::Install => match manager.install_client().await {
                Ok(message) => VpnEvent::InstallFinished { message },
                Err(e) => failed(Operation::Install, e.into()),
            },
        };
        if event_tx.send(event).is_err() {
            warn!("VPN event receiver dropped; stopping worker");
            break;
        }
    }
    info!("VPN service worker stopped");
}

fn failed(operation: Operation, error: VpnError) -> VpnEvent {
    warn!("{:?} failed: {}", operation, error);
    VpnEvent::Failed { operation, error }
}

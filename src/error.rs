//! Top-level error family
//!
//! Every failure surfaced to a caller belongs to one of these kinds; the
//! per-module enums carry the specific variant and detail string.

use crate::deps::DependencyError;
use crate::manager::DisconnectError;
use crate::routes::RouteError;
use crate::session::ConnectError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VpnError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Disconnect(#[from] DisconnectError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Dependency(#[from] DependencyError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

//! zca-js sidecar backend for `zalo-accounts`.
//!
//! The sidecar is a Node.js process that speaks the Zalo protocol. This crate
//! connects to it over a local WebSocket and exposes each login as a
//! [`zalo_accounts::PlatformSession`].

pub mod connector;
pub mod error;
pub mod session;
pub mod sidecar;
pub mod types;

pub use {
    connector::{SidecarConfig, SidecarConnector},
    error::SidecarError,
    session::SidecarSession,
    sidecar::{DEFAULT_REQUEST_TIMEOUT, DEFAULT_SIDECAR_URL, SidecarHandle},
};

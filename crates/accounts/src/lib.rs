//! Account connection manager for the Zalo relay.
//!
//! Keeps many authenticated platform sessions alive at once, each optionally
//! routed through a capacity-limited proxy, and forwards their push events to
//! per-account webhooks tagged with the account id.
//!
//! The platform wire protocol is behind [`session::PlatformConnector`] and
//! [`session::PlatformSession`]; `zalo-sidecar` provides the production
//! implementation.

pub mod actions;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod factory;
pub mod manager;
pub mod proxy;
pub mod reconnect;
pub mod registry;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use {
    actions::{AccountAction, ActionOutcome, ThreadType, UsedAccount},
    credentials::{CredentialRecord, CredentialStore, FileCredentialStore, MemoryCredentialStore},
    dispatch::{EventDispatcher, WebhookResolver, WebhookSink, tag_payload},
    error::{AccountError, Result},
    factory::{AssignedProxy, OpenRequest, SessionFactory},
    manager::{
        AccountDetail, AccountManager, LoginProgress, LoginTicket, ManagerOptions, ManagerParts,
        RestoreReport,
    },
    proxy::{DEFAULT_PROXY_CAPACITY, ProxyEntry, ProxyListFile, ProxyPool},
    reconnect::{RELOGIN_COOLDOWN, ReloginTracker},
    registry::{AccountRegistry, AccountSession, AccountStatus, AccountSummary, StatusChange},
    session::{
        AccountProfile, ConnectionState, EventKind, LoginChallenge, PlatformConnector,
        PlatformSession, SessionEvent, SessionEvents, SessionHandle,
    },
};

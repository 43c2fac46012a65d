//! Opens platform sessions: proxy routing, resume with interactive fallback,
//! identity lookup and credential persistence.

use std::sync::Arc;

use {
    serde::Serialize,
    tokio::sync::oneshot,
    tracing::{debug, info, instrument, warn},
    url::Url,
};

use crate::{
    credentials::{CredentialRecord, CredentialStore},
    error::{AccountError, Result},
    proxy::{ProxyLease, ProxyPool, parse_proxy_url},
    session::{AccountProfile, LoginChallenge, PlatformConnector, SessionHandle},
};

/// Inputs of one login attempt.
#[derive(Debug, Clone, Default)]
pub struct OpenRequest {
    /// Caller-supplied proxy. Malformed values fall back to pool selection.
    pub proxy: Option<String>,
    /// Stored login material to resume from.
    pub credential: Option<CredentialRecord>,
}

/// Proxy an account is routed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignedProxy {
    pub url: String,
    /// `true` when picked from the pool and counted against its capacity.
    pub pooled: bool,
}

/// A freshly opened, identified session.
pub struct OpenedSession {
    pub own_id: String,
    pub profile: AccountProfile,
    pub handle: SessionHandle,
    pub proxy: Option<AssignedProxy>,
    /// `true` if stored credentials were accepted without a QR scan.
    pub resumed: bool,
}

impl std::fmt::Debug for OpenedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedSession")
            .field("own_id", &self.own_id)
            .field("proxy", &self.proxy)
            .field("resumed", &self.resumed)
            .finish_non_exhaustive()
    }
}

enum Route {
    Explicit(Url),
    Pooled(ProxyLease, Url),
    Direct,
}

impl Route {
    fn url(&self) -> Option<&Url> {
        match self {
            Self::Explicit(url) | Self::Pooled(_, url) => Some(url),
            Self::Direct => None,
        }
    }
}

/// Produces live session handles.
pub struct SessionFactory {
    connector: Arc<dyn PlatformConnector>,
    pool: Arc<ProxyPool>,
    credentials: Arc<dyn CredentialStore>,
}

impl SessionFactory {
    pub fn new(
        connector: Arc<dyn PlatformConnector>,
        pool: Arc<ProxyPool>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            connector,
            pool,
            credentials,
        }
    }

    fn resolve_route(&self, explicit: Option<&str>) -> Route {
        if let Some(raw) = explicit.filter(|p| !p.trim().is_empty()) {
            match parse_proxy_url(raw) {
                Ok(url) => {
                    self.pool.ensure_listed(raw.trim());
                    debug!(proxy = %url, "using caller-supplied proxy");
                    return Route::Explicit(url);
                },
                Err(e) => {
                    warn!(error = %e, "rejected caller-supplied proxy, selecting from pool");
                },
            }
        }

        let Some(lease) = self.pool.reserve() else {
            info!("no proxy with spare capacity, logging in without proxy");
            return Route::Direct;
        };
        match parse_proxy_url(lease.url()) {
            Ok(url) => {
                debug!(proxy = %url, "using pool proxy");
                Route::Pooled(lease, url)
            },
            Err(e) => {
                warn!(error = %e, "pool proxy unusable, logging in without proxy");
                Route::Direct
            },
        }
    }

    /// Open a session, resuming from `request.credential` when possible.
    ///
    /// An interactive login sends its challenge on `challenge` before this
    /// future resolves.
    #[instrument(skip_all, fields(resume = request.credential.is_some()))]
    pub async fn open(
        &self,
        request: OpenRequest,
        challenge: oneshot::Sender<LoginChallenge>,
    ) -> Result<OpenedSession> {
        let route = self.resolve_route(request.proxy.as_deref());
        let proxy_url = route.url().cloned();

        let (handle, resumed) = match &request.credential {
            Some(credential) => match self.connector.resume(proxy_url.as_ref(), credential).await {
                Ok(handle) => (handle, true),
                Err(e) => {
                    let e = match e {
                        AccountError::ResumeFailed(_) => e,
                        other => AccountError::ResumeFailed(other.to_string()),
                    };
                    warn!(error = %e, "falling back to interactive login");
                    let handle = self
                        .connector
                        .login_interactive(proxy_url.as_ref(), challenge)
                        .await?;
                    (handle, false)
                },
            },
            None => {
                let handle = self
                    .connector
                    .login_interactive(proxy_url.as_ref(), challenge)
                    .await?;
                (handle, false)
            },
        };

        let profile = match handle.fetch_profile().await {
            Ok(profile) if !profile.user_id.is_empty() => profile,
            Ok(_) => {
                handle.close().await;
                return Err(AccountError::ProfileFetchFailed(
                    "profile has no user id".into(),
                ));
            },
            Err(e) => {
                handle.close().await;
                return Err(AccountError::ProfileFetchFailed(e.to_string()));
            },
        };
        let own_id = profile.user_id.clone();

        self.persist_credential(&own_id, &handle).await;

        let proxy = match route {
            Route::Pooled(lease, url) => match lease.commit(&own_id) {
                Ok(entry) => {
                    info!(own_id, proxy = %entry.url, used = entry.used_count, "pool proxy assigned");
                    Some(AssignedProxy {
                        url: entry.url,
                        pooled: true,
                    })
                },
                Err(e) => {
                    warn!(own_id, error = %e, "could not record pool proxy assignment");
                    Some(AssignedProxy {
                        url: url.to_string(),
                        pooled: false,
                    })
                },
            },
            Route::Explicit(url) => Some(AssignedProxy {
                url: request.proxy.map_or_else(|| url.to_string(), |p| p.trim().to_string()),
                pooled: false,
            }),
            Route::Direct => None,
        };

        info!(
            own_id,
            phone = profile.phone_number.as_deref().unwrap_or(""),
            proxy = proxy.as_ref().map_or("none", |p| p.url.as_str()),
            resumed,
            "login succeeded"
        );

        Ok(OpenedSession {
            own_id,
            profile,
            handle,
            proxy,
            resumed,
        })
    }

    async fn persist_credential(&self, own_id: &str, handle: &SessionHandle) {
        let record = match handle.credential().await {
            Ok(record) => record,
            Err(e) => {
                warn!(own_id, error = %e, "could not read session credential");
                return;
            },
        };
        match self.credentials.write(own_id, &record).await {
            Ok(true) => {},
            Ok(false) => debug!(own_id, "credential already stored"),
            Err(e) => warn!(own_id, error = %e, "failed to persist credential"),
        }
    }
}

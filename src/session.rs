//! Per-user authenticated session.
//!
//! A session owns one access token. Requests borrow it through a
//! [`TokenGuard`], which holds the session's read lock for as long as the
//! request runs. The background refresher takes the write lock, so it waits for
//! the in-flight request to finish and blocks new ones until the new token is
//! in place. With a single refresher task per session there is never more than
//! one refresh outstanding.
//!
//! The [`SessionState`] sits outside the token lock. A refresh marks the session
//! `Expiring` before it queues for the write lock, so the state stays readable
//! while the refresh waits or runs.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    sync::{RwLock, RwLockReadGuard, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    api::{Credentials, IdentityApi, TokenGrant},
    error::SessionError,
};

/// Refresh happens at least this long before the server-side expiry.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    /// A refresh is due: it is waiting for in-flight requests or running.
    Expiring,
    Terminated,
}

/// The configured interval, capped at `ttl - EXPIRY_MARGIN` when the server
/// reports a TTL longer than the margin.
pub fn effective_refresh_interval(configured: Duration, ttl: Duration) -> Duration {
    if ttl > EXPIRY_MARGIN {
        configured.min(ttl - EXPIRY_MARGIN)
    } else {
        configured
    }
}

#[derive(Debug)]
struct Inner {
    grant: Option<TokenGrant>,
    issued_at: Option<Instant>,
    terminated_at: Option<Instant>,
}

pub struct Session<A> {
    virtual_user_id: usize,
    api: Arc<A>,
    credentials: Arc<Credentials>,
    refresh_interval: Duration,
    state: Mutex<SessionState>,
    inner: RwLock<Inner>,
}

/// Read access to the current token. Refresh is blocked while this is alive.
pub struct TokenGuard<'a> {
    inner: RwLockReadGuard<'a, Inner>,
}

impl TokenGuard<'_> {
    pub fn token(&self) -> &str {
        // a guard is only handed out for an authenticated session
        self.inner
            .grant
            .as_ref()
            .map(|g| g.access_token.as_str())
            .unwrap_or_default()
    }

    pub fn issued_at(&self) -> Option<Instant> {
        self.inner.issued_at
    }
}

impl<A: IdentityApi> Session<A> {
    pub fn new(
        virtual_user_id: usize,
        api: Arc<A>,
        credentials: Arc<Credentials>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            virtual_user_id,
            api,
            credentials,
            refresh_interval,
            state: Mutex::new(SessionState::Unauthenticated),
            inner: RwLock::new(Inner {
                grant: None,
                issued_at: None,
                terminated_at: None,
            }),
        }
    }

    pub fn virtual_user_id(&self) -> usize {
        self.virtual_user_id
    }

    /// Performs the initial credential exchange.
    pub async fn establish(&self) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;
        let grant = self
            .api
            .authenticate(&self.credentials)
            .await
            .map_err(SessionError::Startup)?;
        inner.grant = Some(grant);
        inner.issued_at = Some(Instant::now());
        *self.state.lock() = SessionState::Authenticated;
        tracing::debug!(user = self.virtual_user_id, "Session established");
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SessionState::Terminated
    }

    /// When the session was terminated by a failed refresh.
    pub async fn terminated_at(&self) -> Option<Instant> {
        self.inner.read().await.terminated_at
    }

    /// Borrows the current token for one or more requests.
    pub async fn authorize(&self) -> Result<TokenGuard<'_>, SessionError> {
        let inner = self.inner.read().await;
        match self.state() {
            SessionState::Authenticated | SessionState::Expiring if inner.grant.is_some() => {
                Ok(TokenGuard { inner })
            }
            _ => Err(SessionError::Terminated),
        }
    }

    /// When the next refresh is due, `None` unless authenticated.
    pub async fn refresh_deadline(&self) -> Option<Instant> {
        let inner = self.inner.read().await;
        if self.state() != SessionState::Authenticated {
            return None;
        }
        let ttl = inner.grant.as_ref()?.ttl();
        let issued_at = inner.issued_at?;
        Some(issued_at + effective_refresh_interval(self.refresh_interval, ttl))
    }

    /// Replaces the token. On failure the session is terminated.
    pub async fn refresh(&self) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Authenticated {
                return Err(SessionError::Terminated);
            }
            *state = SessionState::Expiring;
        }

        let mut inner = self.inner.write().await;
        let Some(current) = inner.grant.clone() else {
            *self.state.lock() = SessionState::Terminated;
            return Err(SessionError::Terminated);
        };

        match self.api.refresh(&self.credentials, &current).await {
            Ok(grant) => {
                inner.grant = Some(grant);
                inner.issued_at = Some(Instant::now());
                *self.state.lock() = SessionState::Authenticated;
                tracing::debug!(user = self.virtual_user_id, "Token refreshed");
                Ok(())
            }
            Err(e) => {
                inner.grant = None;
                inner.terminated_at = Some(Instant::now());
                *self.state.lock() = SessionState::Terminated;
                Err(SessionError::Expired(e))
            }
        }
    }

    /// Starts the task that keeps the token fresh until shutdown or until a
    /// refresh fails.
    pub fn spawn_refresher(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(deadline) = session.refresh_deadline().await {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = shutdown.wait_for(|stop| *stop) => break,
                }
                if let Err(e) = session.refresh().await {
                    tracing::warn!(user = session.virtual_user_id, "Session terminated: {e}");
                    break;
                }
            }
        })
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::RemoteError;
use crate::remote::{RemoteServer, SessionToken};

use super::{CallOutput, RemoteCall, RemoteSession, SessionConfig, SessionStatus};

/// Mutable session state, shared with outstanding guards.
struct SessionState {
    status: SessionStatus,
    token: Option<SessionToken>,

    /// Incremented on every successful login
    generation: u64,

    last_used: Option<Instant>,
    in_flight: usize,
}

impl SessionState {
    fn new() -> Self {
        Self {
            status: SessionStatus::Disconnected,
            token: None,
            generation: 0,
            last_used: None,
            in_flight: 0,
        }
    }

    fn is_idle(&self, idle_timeout: Option<Duration>) -> bool {
        match (idle_timeout, self.last_used) {
            (Some(limit), Some(last)) => self.in_flight == 0 && last.elapsed() > limit,
            _ => false,
        }
    }
}

// =============================================================================
// Session Guard
// =============================================================================

/// A pooled connection on an authenticated session.
///
/// Holding the guard holds one pool permit. Dropping it returns the permit
/// and records the session as used.
pub struct SessionGuard {
    token: SessionToken,
    generation: u64,
    state: Arc<Mutex<SessionState>>,
    _permit: OwnedSemaphorePermit,
}

impl SessionGuard {
    /// Token of the session this connection was taken from.
    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    /// Login generation the token belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.last_used = Some(Instant::now());
    }
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Session Manager
// =============================================================================

/// Owns the one authenticated session to a remote server.
///
/// Login happens lazily on first use. Concurrent callers that find the
/// session missing or expired serialize on a login lock and compare the
/// login generation they observed, so a burst of failures produces a single
/// re-authentication.
///
/// The number of concurrent remote calls is bounded by a fair semaphore:
/// callers beyond `pool_size` queue in arrival order and give up with
/// [`RemoteError::PoolTimeout`] after `pool_wait_timeout`.
pub struct SessionManager<R: RemoteServer> {
    remote: Arc<R>,
    config: SessionConfig,
    state: Arc<Mutex<SessionState>>,
    login: tokio::sync::Mutex<()>,
    pool: Arc<Semaphore>,
}

impl<R: RemoteServer> SessionManager<R> {
    pub fn new(remote: Arc<R>, config: SessionConfig) -> Self {
        let pool = Arc::new(Semaphore::new(config.pool_size.max(1)));
        Self {
            remote,
            config,
            state: Arc::new(Mutex::new(SessionState::new())),
            login: tokio::sync::Mutex::new(()),
            pool,
        }
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Number of pooled connections currently handed out.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, RemoteError> {
        let waited = self.config.pool_wait_timeout;
        match timeout(waited, self.pool.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(RemoteError::Session("connection pool closed".to_string())),
            Err(_) => {
                warn!("No pooled connection available after {:?}", waited);
                Err(RemoteError::PoolTimeout { waited })
            }
        }
    }

    /// Return a usable token and its generation, logging in if needed.
    async fn ensure_token(&self) -> Result<(SessionToken, u64), RemoteError> {
        let seen = {
            let mut state = self.state.lock();
            if state.status == SessionStatus::Authenticated
                && state.is_idle(self.config.idle_timeout)
            {
                info!(
                    "Session to {} idle for longer than {:?}, reconnecting",
                    self.remote.identifier(),
                    self.config.idle_timeout.unwrap_or_default()
                );
                state.status = SessionStatus::Expired;
            }

            match (&state.token, state.status) {
                (Some(token), SessionStatus::Authenticated) => {
                    return Ok((token.clone(), state.generation))
                }
                _ => state.generation,
            }
        };

        self.authenticate(seen).await
    }

    /// Log in unless another caller already replaced generation `seen`.
    async fn authenticate(&self, seen: u64) -> Result<(SessionToken, u64), RemoteError> {
        let _login = self.login.lock().await;

        {
            let mut state = self.state.lock();
            if state.generation != seen && state.status == SessionStatus::Authenticated {
                if let Some(token) = &state.token {
                    debug!("Reusing session established by a concurrent login");
                    return Ok((token.clone(), state.generation));
                }
            }
            state.status = SessionStatus::Connecting;
        }

        debug!(
            "Authenticating to {} as {}",
            self.remote.identifier(),
            self.config.credentials.username
        );

        let result = timeout(
            self.config.call_timeout,
            self.remote.authenticate(&self.config.credentials),
        )
        .await;

        let mut state = self.state.lock();
        match result {
            Ok(Ok(token)) => {
                state.token = Some(token.clone());
                state.generation += 1;
                state.status = SessionStatus::Authenticated;
                state.last_used = Some(Instant::now());
                info!(
                    "Authenticated to {} as {}",
                    self.remote.identifier(),
                    self.config.credentials.username
                );
                Ok((token, state.generation))
            }
            Ok(Err(err)) => {
                state.token = None;
                state.status = SessionStatus::Disconnected;
                Err(RemoteError::Session(format!("authentication failed: {err}")))
            }
            Err(_) => {
                state.token = None;
                state.status = SessionStatus::Disconnected;
                Err(RemoteError::Session(format!(
                    "authentication timed out after {:?}",
                    self.config.call_timeout
                )))
            }
        }
    }

    /// Mark the session expired, unless it was already replaced.
    fn mark_expired(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation && state.status == SessionStatus::Authenticated {
            state.status = SessionStatus::Expired;
        }
    }

    /// Drop the session after the server refused our credentials.
    fn tear_down(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.token = None;
            state.status = SessionStatus::Disconnected;
        }
    }

    /// Run one call with the given token, bounded by the call timeout.
    async fn dispatch(
        &self,
        token: &SessionToken,
        generation: u64,
        call: &RemoteCall,
    ) -> Result<CallOutput, RemoteError> {
        let request = async {
            match call {
                RemoteCall::Metadata(id) => self
                    .remote
                    .fetch_metadata(token, *id)
                    .await
                    .map(CallOutput::Metadata),
                RemoteCall::Plane(key) => self
                    .remote
                    .fetch_plane(token, key)
                    .await
                    .map(CallOutput::Plane),
            }
        };

        match timeout(self.config.call_timeout, request).await {
            Ok(Err(RemoteError::Unauthorized(message))) => {
                warn!("Credentials no longer accepted: {}", message);
                self.tear_down(generation);
                Err(RemoteError::Session(message))
            }
            Ok(result) => result,
            Err(_) => Err(RemoteError::Transient(format!(
                "call timed out after {:?}",
                self.config.call_timeout
            ))),
        }
    }
}

#[async_trait]
impl<R: RemoteServer + 'static> RemoteSession for SessionManager<R> {
    async fn acquire(&self) -> Result<SessionGuard, RemoteError> {
        let permit = self.acquire_permit().await?;
        let (token, generation) = self.ensure_token().await?;

        self.state.lock().in_flight += 1;
        Ok(SessionGuard {
            token,
            generation,
            state: self.state.clone(),
            _permit: permit,
        })
    }

    async fn execute(&self, call: RemoteCall) -> Result<CallOutput, RemoteError> {
        let guard = self.acquire().await?;

        match self.dispatch(guard.token(), guard.generation(), &call).await {
            Err(RemoteError::Expired) => {}
            other => return other,
        }

        warn!(
            "Session to {} expired, re-authenticating",
            self.remote.identifier()
        );
        self.mark_expired(guard.generation());
        let (token, generation) = self.authenticate(guard.generation()).await?;

        match self.dispatch(&token, generation, &call).await {
            Err(RemoteError::Expired) => {
                self.mark_expired(generation);
                Err(RemoteError::Session(
                    "session expired again after re-authentication".to_string(),
                ))
            }
            other => other,
        }
    }

    async fn logout(&self) {
        let _login = self.login.lock().await;

        let token = {
            let mut state = self.state.lock();
            state.status = SessionStatus::Disconnected;
            state.token.take()
        };

        let Some(token) = token else {
            debug!("Logout requested with no open session");
            return;
        };

        match timeout(self.config.call_timeout, self.remote.logout(&token)).await {
            Ok(Ok(())) => info!("Logged out of {}", self.remote.identifier()),
            Ok(Err(err)) => warn!("Logout from {} failed: {}", self.remote.identifier(), err),
            Err(_) => warn!(
                "Logout from {} timed out after {:?}",
                self.remote.identifier(),
                self.config.call_timeout
            ),
        }
    }

    fn status(&self) -> SessionStatus {
        self.state.lock().status
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Session registry
//!
//! This module provides the process-wide directory of live sessions:
//! - Session creation for remote peers and local transfers
//! - Lookup for workers resolving blocks
//! - Control-message routing from the transport layer
//! - A drain barrier that blocks until no session is left
//!
//! # Architecture
//!
//! Sessions are stored in a concurrent DashMap keyed by [`SessionId`]. The
//! drain barrier is a separate mutex and condition variable guarding only
//! the "map became empty" transition and the last shutdown reason, which
//! are always read and written together.
//!
//! ```text
//! transport ──route_control_message──▶ SessionRegistry ──get──▶ writers
//!                                          │
//!                                   finish(id) ──▶ map empty? ──▶ wake await_drain
//! ```

use crate::config::SessionConfig;
use crate::error::{Cause, Error, Result};
use crate::file::{ChannelProvider, lock};
use crate::session::{
    ControlAction, ControlHandle, ControlMessage, Direction, Endpoint, Session, SessionId,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

#[derive(Default)]
struct DrainState {
    last_message: Option<String>,
    last_cause: Option<Cause>,
}

/// Directory of live transfer sessions
///
/// Thread-safe and designed for concurrent access from writers, transport
/// threads and the process entry point.
pub struct SessionRegistry {
    config: SessionConfig,
    provider: Arc<dyn ChannelProvider>,
    sessions: DashMap<SessionId, Arc<Session>>,
    inited: AtomicBool,
    closed: AtomicBool,
    drain: Mutex<DrainState>,
    drained: Condvar,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(config: SessionConfig, provider: Arc<dyn ChannelProvider>) -> Arc<Self> {
        Arc::new(Self {
            config,
            provider,
            sessions: DashMap::new(),
            inited: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            drain: Mutex::new(DrainState::default()),
            drained: Condvar::new(),
        })
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Channel provider handed to new sessions
    pub fn provider(&self) -> &Arc<dyn ChannelProvider> {
        &self.provider
    }

    /// Create a session for a remote peer.
    ///
    /// The peer's pull request decides the direction: a pulling peer makes
    /// this side a reader.
    ///
    /// # Errors
    ///
    /// Returns `Error::RegistryClosed` after [`close`](Self::close), or
    /// `Error::SessionSetup` if the handle cannot be attached. The session
    /// and the handle are both closed before the error is returned.
    pub fn create_client_session(&self, handle: Arc<dyn ControlHandle>) -> Result<Arc<Session>> {
        if self.closed.load(Ordering::Acquire) {
            handle.close("session registry is closed", None);
            return Err(Error::RegistryClosed);
        }

        let direction = if handle.remote_pull() {
            Direction::Reader
        } else {
            Direction::Writer
        };
        let id = SessionId::new();
        let session = Arc::new(Session::new(
            id,
            direction,
            Endpoint::Remote(Arc::clone(&handle)),
            &self.config,
            Arc::clone(&self.provider),
        ));

        let attached = handle
            .attach(id)
            .and_then(|()| self.insert(Arc::clone(&session)));

        if let Err(e) = attached {
            warn!(session = %id, error = %e, "Failed to set up client session");
            let reason = e.to_string();
            // Closing the session also closes its remote handle
            session.close("session setup failed", Some(Arc::new(e)));
            return Err(Error::SessionSetup(reason));
        }

        info!(session = %id, ?direction, "Client session created");
        Ok(session)
    }

    /// Create a session for a local transfer bound to `port`.
    ///
    /// In pull mode this side receives data and becomes a writer.
    ///
    /// # Errors
    ///
    /// Returns `Error::RegistryClosed` after [`close`](Self::close).
    pub fn create_local_session(&self, port: u16) -> Result<Arc<Session>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::RegistryClosed);
        }

        let direction = if self.config.pull_mode {
            Direction::Writer
        } else {
            Direction::Reader
        };
        let id = SessionId::new();
        let session = Arc::new(Session::new(
            id,
            direction,
            Endpoint::Local { port },
            &self.config,
            Arc::clone(&self.provider),
        ));

        if let Err(e) = self.insert(Arc::clone(&session)) {
            let reason = e.to_string();
            session.close("session setup failed", Some(Arc::new(e)));
            return Err(Error::SessionSetup(reason));
        }

        info!(session = %id, ?direction, port, "Local session created");
        Ok(session)
    }

    fn insert(&self, session: Arc<Session>) -> Result<()> {
        match self.sessions.entry(session.id()) {
            Entry::Occupied(_) => Err(Error::DuplicateSession(session.id())),
            Entry::Vacant(slot) => {
                slot.insert(session);
                self.inited.store(true, Ordering::Release);
                Ok(())
            }
        }
    }

    /// Look up a live session
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| Arc::clone(s.value()))
    }

    /// Remove a session and close it.
    ///
    /// When the registry becomes empty, `message` and `cause` become the
    /// last shutdown reason and drain waiters are woken. Returns whether
    /// this call closed the session.
    pub fn finish(&self, id: SessionId, message: &str, cause: Option<Cause>) -> bool {
        let removed = self.sessions.remove(&id).map(|(_, s)| s);
        debug!(
            session = %id,
            removed = removed.is_some(),
            remaining = self.sessions.len(),
            "Finishing session"
        );

        if self.sessions.is_empty() {
            let mut state = lock(&self.drain);
            state.last_message = Some(message.to_string());
            state.last_cause.clone_from(&cause);
            self.drained.notify_all();
        }

        match removed {
            Some(session) => session.close(message, cause),
            None => false,
        }
    }

    /// Route a control message from the transport to its session.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownSession` if the handle's session is not live,
    /// or the error raised by the session while handling the message.
    pub fn route_control_message(
        &self,
        handle: &dyn ControlHandle,
        msg: ControlMessage,
    ) -> Result<()> {
        let id = handle
            .session_id()
            .ok_or(Error::control("control handle is not attached to a session"))?;
        let session = self.get(id).ok_or(Error::UnknownSession(id))?;

        match session.handle_control(msg)? {
            ControlAction::Continue => {}
            ControlAction::Finish { message, cause } => {
                self.finish(id, &message, cause);
            }
        }
        Ok(())
    }

    /// The transport for a session went down; finish the session if it is
    /// still live
    pub fn notify_session_down(&self, handle: &dyn ControlHandle, cause: Option<Cause>) {
        let Some(id) = handle.session_id() else {
            debug!("Control channel down before attaching to a session");
            return;
        };
        if self.sessions.contains_key(&id) {
            self.finish(id, "control channel down", cause);
        } else {
            trace!(session = %id, "Control channel down for finished session");
        }
    }

    /// Block until no session is live.
    ///
    /// The map is re-checked every `drain_recheck_interval` in addition to
    /// the wake-up from [`finish`](Self::finish).
    pub fn await_drain(&self) {
        let mut state = lock(&self.drain);
        while !self.sessions.is_empty() {
            state = self
                .drained
                .wait_timeout(state, self.config.drain_recheck_interval)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
            trace!(remaining = self.sessions.len(), "Waiting for sessions to finish");
        }
    }

    /// Block until no session is live or `timeout` elapses.
    ///
    /// Returns true if the registry drained.
    pub fn await_drain_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.drain);
        while !self.sessions.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = (deadline - now).min(self.config.drain_recheck_interval);
            state = self
                .drained
                .wait_timeout(state, wait)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Message and cause recorded when the registry last became empty
    pub fn last_shutdown_reason(&self) -> (Option<String>, Option<Cause>) {
        let state = lock(&self.drain);
        (state.last_message.clone(), state.last_cause.clone())
    }

    /// Returns true once at least one session has been registered
    pub fn has_had_session(&self) -> bool {
        self.inited.load(Ordering::Acquire)
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Identifiers of live sessions
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|s| *s.key()).collect()
    }

    /// Refuse new sessions and finish every live one with `message`
    pub fn close(&self, message: &str) {
        self.closed.store(true, Ordering::Release);
        for id in self.session_ids() {
            self.finish(id, message, None);
        }
        info!("Session registry closed: {}", message);
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("inited", &self.has_had_session())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::LocalChannelProvider;
    use crate::session::FileSpec;
    use std::sync::Mutex as StdMutex;
    use std::thread;

    struct TestHandle {
        id: StdMutex<Option<SessionId>>,
        pull: bool,
        fail_attach: bool,
        closed: AtomicBool,
    }

    impl TestHandle {
        fn new(pull: bool, fail_attach: bool) -> Arc<Self> {
            Arc::new(Self {
                id: StdMutex::new(None),
                pull,
                fail_attach,
                closed: AtomicBool::new(false),
            })
        }
    }

    impl ControlHandle for TestHandle {
        fn attach(&self, session_id: SessionId) -> Result<()> {
            if self.fail_attach {
                return Err(Error::control("connect refused"));
            }
            *self.id.lock().unwrap() = Some(session_id);
            Ok(())
        }

        fn session_id(&self) -> Option<SessionId> {
            *self.id.lock().unwrap()
        }

        fn remote_pull(&self) -> bool {
            self.pull
        }

        fn send(&self, _msg: ControlMessage) -> Result<()> {
            Ok(())
        }

        fn close(&self, _message: &str, _cause: Option<Cause>) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn registry() -> Arc<SessionRegistry> {
        let config = SessionConfig {
            drain_recheck_interval: Duration::from_millis(20),
            ..SessionConfig::default()
        };
        SessionRegistry::new(config, Arc::new(LocalChannelProvider::new()))
    }

    #[test]
    fn test_client_session_direction() {
        let reg = registry();
        let pulling = reg.create_client_session(TestHandle::new(true, false)).unwrap();
        let pushing = reg.create_client_session(TestHandle::new(false, false)).unwrap();

        assert_eq!(pulling.direction(), Direction::Reader);
        assert_eq!(pushing.direction(), Direction::Writer);
        assert_eq!(reg.session_count(), 2);
        assert!(reg.has_had_session());
    }

    #[test]
    fn test_local_session_direction_follows_pull_mode() {
        let reg = registry();
        assert_eq!(reg.create_local_session(0).unwrap().direction(), Direction::Reader);

        let config = SessionConfig {
            pull_mode: true,
            ..SessionConfig::default()
        };
        let reg = SessionRegistry::new(config, Arc::new(LocalChannelProvider::new()));
        assert_eq!(reg.create_local_session(0).unwrap().direction(), Direction::Writer);
    }

    #[test]
    fn test_failed_attach_closes_handle() {
        let reg = registry();
        let handle = TestHandle::new(false, true);
        let result = reg.create_client_session(handle.clone());

        assert!(matches!(result, Err(Error::SessionSetup(_))));
        assert!(handle.closed.load(Ordering::SeqCst));
        assert_eq!(reg.session_count(), 0);
        assert!(!reg.has_had_session());
    }

    #[test]
    fn test_finish_removes_and_records_reason() {
        let reg = registry();
        let session = reg.create_local_session(0).unwrap();
        let id = session.id();

        assert!(reg.finish(id, "all done", None));
        assert!(reg.get(id).is_none());
        assert!(session.is_closed());
        assert!(!reg.finish(id, "again", None));

        let (msg, cause) = reg.last_shutdown_reason();
        assert_eq!(msg.as_deref(), Some("again"));
        assert!(cause.is_none());
    }

    #[test]
    fn test_route_unknown_session_is_protocol_error() {
        let reg = registry();
        let handle = TestHandle::new(false, false);
        handle.attach(SessionId::new()).unwrap();

        let err = reg
            .route_control_message(handle.as_ref(), ControlMessage::KeepAlive)
            .unwrap_err();
        assert!(err.is_protocol_violation());

        // Down notification for an unknown session is ignored
        reg.notify_session_down(handle.as_ref(), None);
    }

    #[test]
    fn test_route_abort_finishes_session() {
        let reg = registry();
        let handle = TestHandle::new(false, false);
        let session = reg.create_client_session(handle.clone()).unwrap();

        reg.route_control_message(
            handle.as_ref(),
            ControlMessage::Abort {
                reason: "peer quit".into(),
            },
        )
        .unwrap();

        assert!(reg.get(session.id()).is_none());
        assert!(handle.closed.load(Ordering::SeqCst));
        let (msg, cause) = reg.last_shutdown_reason();
        assert_eq!(msg.as_deref(), Some("peer quit"));
        assert!(matches!(cause.as_deref(), Some(Error::Aborted(_))));
    }

    #[test]
    fn test_route_file_list() {
        let reg = registry();
        let handle = TestHandle::new(false, false);
        let session = reg.create_client_session(handle.clone()).unwrap();

        reg.route_control_message(
            handle.as_ref(),
            ControlMessage::FileList(vec![FileSpec::new("/dev/null", 4096)]),
        )
        .unwrap();
        assert_eq!(session.files().len(), 1);
    }

    #[test]
    fn test_session_down_finishes_live_session() {
        let reg = registry();
        let handle = TestHandle::new(false, false);
        let session = reg.create_client_session(handle.clone()).unwrap();

        reg.notify_session_down(handle.as_ref(), Some(Arc::new(Error::control("reset"))));
        assert!(session.is_closed());
        assert_eq!(reg.session_count(), 0);
    }

    #[test]
    fn test_await_drain_blocks_until_empty() {
        let reg = registry();
        let a = reg.create_local_session(0).unwrap();
        let b = reg.create_local_session(0).unwrap();

        let waiter = {
            let reg = Arc::clone(&reg);
            thread::spawn(move || reg.await_drain())
        };

        reg.finish(a.id(), "a done", None);
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        reg.finish(b.id(), "b done", None);
        waiter.join().unwrap();
        assert_eq!(reg.last_shutdown_reason().0.as_deref(), Some("b done"));
    }

    #[test]
    fn test_await_drain_timeout() {
        let reg = registry();
        assert!(reg.await_drain_timeout(Duration::from_millis(10)));

        let _s = reg.create_local_session(0).unwrap();
        assert!(!reg.await_drain_timeout(Duration::from_millis(50)));
    }

    #[test]
    fn test_close_refuses_new_sessions() {
        let reg = registry();
        let s = reg.create_local_session(0).unwrap();
        reg.close("shutting down");

        assert!(s.is_closed());
        assert_eq!(reg.session_count(), 0);
        assert!(matches!(reg.create_local_session(0), Err(Error::RegistryClosed)));

        let handle = TestHandle::new(false, false);
        assert!(reg.create_client_session(handle.clone()).is_err());
        assert!(handle.closed.load(Ordering::SeqCst));
    }
}

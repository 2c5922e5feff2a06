// Copyright 2025 Simo Sorce
// See LICENSE.txt file for terms

//! Device session pooling
//!
//! Opening a session on a token is slow and may fail transiently, so
//! sessions are kept in a bounded FIFO pool once callers are done with
//! them. The pool also tracks every session it knows to be open (the live
//! set). Object handles and keys read from the device are only trusted
//! while at least one live session exists: when the last one is closed
//! both caches are dropped under the same lock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::cache::ObjectCache;
use crate::config::Opts;
use crate::device::{Device, SessionHandle, SlotId};
use crate::error::{Error, ErrorKind, Result};

use log::{debug, warn};

/// Where a live session currently is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting in the pool
    Idle,
    /// Handed out to a caller
    CheckedOut,
}

#[derive(Debug, Default)]
struct PoolState {
    idle: VecDeque<SessionHandle>,
    live: HashMap<SessionHandle, SessionState>,
    cache: ObjectCache,
}

/// A bounded pool of logged in sessions on one slot
///
/// The pool also owns the object caches, see [SessionPool::cache].
#[derive(Debug)]
pub struct SessionPool {
    device: Arc<dyn Device>,
    slot: SlotId,
    pin: String,
    capacity: i64,
    retries: u32,
    delay: Duration,
    state: Mutex<PoolState>,
}

impl SessionPool {
    /// Creates an empty pool, no session is opened yet
    pub fn new(device: Arc<dyn Device>, slot: SlotId, opts: &Opts) -> SessionPool {
        SessionPool {
            device: device,
            slot: slot,
            pin: opts.pin.clone(),
            capacity: opts.session_cache_size(),
            retries: opts.create_session_retries(),
            delay: opts.create_session_retry_delay(),
            state: Mutex::new(PoolState::default()),
        }
    }

    /* the state is consistent after every single mutation, so a panic
     * in another thread does not invalidate it */
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_session(&self) -> Result<SessionHandle> {
        let mut attempt = 0;
        let session = loop {
            match self.device.open_session(self.slot) {
                Ok(s) => break s,
                Err(e) => {
                    if attempt >= self.retries {
                        return Err(Error::with_origin(
                            ErrorKind::DeviceOpen,
                            "OpenSession failed".to_string(),
                            e,
                        ));
                    }
                    attempt += 1;
                    warn!(
                        "OpenSession failed, retrying [{}/{}]: {}",
                        attempt, self.retries, e
                    );
                    thread::sleep(self.delay);
                }
            }
        };
        if let Err(e) = self.device.login(session, &self.pin) {
            if let Err(ce) = self.device.close_session(session) {
                warn!("Failed closing session {:?}: {}", session, ce);
            }
            return Err(Error::with_origin(
                ErrorKind::DeviceOpen,
                "Login failed".to_string(),
                e,
            ));
        }
        debug!("Created new session {:?}", session);
        Ok(session)
    }

    /// Returns an idle session, or opens a new one
    ///
    /// Pooled sessions are handed out as they are: a session that went
    /// stale while idle fails on first use.
    pub fn acquire(&self) -> Result<SessionHandle> {
        {
            let mut state = self.lock();
            if let Some(session) = state.idle.pop_front() {
                state.live.insert(session, SessionState::CheckedOut);
                debug!("Reusing session {:?}", session);
                return Ok(session);
            }
        }
        let session = self.open_session()?;
        self.lock().live.insert(session, SessionState::CheckedOut);
        Ok(session)
    }

    /// Gives a session back to the pool, closing it if there is no room
    pub fn release(&self, session: SessionHandle) {
        if self.capacity > 0 {
            let mut state = self.lock();
            if (state.idle.len() as i64) < self.capacity {
                state.idle.push_back(session);
                if let Some(s) = state.live.get_mut(&session) {
                    *s = SessionState::Idle;
                }
                return;
            }
        }
        self.discard(session);
    }

    /* the session leaves the live set before the device may hand its
     * number out again */
    fn discard(&self, session: SessionHandle) {
        {
            let mut state = self.lock();
            state.live.remove(&session);
            if state.live.is_empty() {
                debug!("No live sessions left, purging caches");
                state.cache.purge_all();
            }
        }
        if let Err(e) = self.device.close_session(session) {
            warn!("Failed closing session {:?}: {}", session, e);
        }
    }

    /// Runs `f` with a session, which is released whatever the outcome
    pub fn with_session<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(SessionHandle) -> Result<T>,
    {
        let session = self.acquire()?;
        let ret = f(session);
        self.release(session);
        ret
    }

    /// Gives `f` access to the object caches, under the pool lock
    pub fn cache<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&mut ObjectCache) -> T,
    {
        f(&mut self.lock().cache)
    }

    /// Number of sessions waiting in the pool
    pub fn idle_len(&self) -> usize {
        self.lock().idle.len()
    }

    /// Number of sessions known to be open
    pub fn live_len(&self) -> usize {
        self.lock().live.len()
    }

    /// State of a live session, None when untracked
    pub fn session_state(&self, session: SessionHandle) -> Option<SessionState> {
        self.lock().live.get(&session).copied()
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        let idle: Vec<SessionHandle> = self.lock().idle.drain(..).collect();
        for session in idle {
            if let Err(e) = self.device.close_session(session) {
                warn!("Failed closing session {:?}: {}", session, e);
            }
        }
    }
}

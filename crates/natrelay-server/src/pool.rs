//! Idle reverse connections for one app
//!
//! Pops are served FIFO, both for idle connections and for waiting poppers.
//! A push that races a pop deadline is never lost: the timed-out popper
//! closes its channel and takes whatever was already sent.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::error::PoolError;

struct PoolState<S> {
    idle: VecDeque<S>,
    waiters: VecDeque<oneshot::Sender<S>>,
    closed: bool,
}

pub struct ReverseConnectionPool<S = TcpStream> {
    state: Mutex<PoolState<S>>,
}

impl<S> ReverseConnectionPool<S> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState<S>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand `conn` to the oldest waiting popper, or keep it idle.
    /// A closed pool gives the connection back.
    pub fn push(&self, conn: S) -> Result<(), S> {
        let mut state = self.lock();
        if state.closed {
            return Err(conn);
        }

        let mut conn = conn;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(conn) {
                Ok(()) => return Ok(()),
                // popper gave up, try the next one
                Err(returned) => conn = returned,
            }
        }
        state.idle.push_back(conn);
        Ok(())
    }

    /// Take the oldest idle connection, waiting up to `timeout` for one
    pub async fn pop(&self, timeout: Duration) -> Result<S, PoolError> {
        let mut rx = {
            let mut state = self.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            if let Some(conn) = state.idle.pop_front() {
                return Ok(conn);
            }
            // poppers that timed out leave closed senders behind
            state.waiters.retain(|waiter| !waiter.is_closed());
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(_)) => Err(PoolError::Closed),
            Err(_) => {
                rx.close();
                rx.try_recv().map_err(|_| PoolError::Timeout(timeout))
            }
        }
    }

    /// Drop every idle connection and fail every waiting popper
    pub fn close(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        state.waiters.clear();
        let dropped = state.idle.len();
        state.idle.clear();
        dropped
    }

    pub fn idle_len(&self) -> usize {
        self.lock().idle.len()
    }

    pub fn waiting_len(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl<S> fmt::Debug for ReverseConnectionPool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReverseConnectionPool")
            .field("idle", &self.idle_len())
            .field("waiting", &self.waiting_len())
            .finish()
    }
}

impl<S> Default for ReverseConnectionPool<S> {
    fn default() -> Self {
        Self::new()
    }
}

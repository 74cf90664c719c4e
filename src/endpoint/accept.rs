//! The pending-connection backlog of a listening endpoint.
//!
//! Spawned children share the listener's queue: a child reserves a slot when
//! the SYN arrives, moves into the queue when its handshake completes, and
//! is removed again if the connection dies before anyone accepted it.

use crate::errors::TcpError;
use crate::TcpEndpoint;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

struct Backlog {
    queue: VecDeque<Arc<TcpEndpoint>>,
    /// Children mid-handshake that hold a slot but are not yet acceptable.
    pending: usize,
    max_backlog: usize,
    closed: bool,
    interrupts: u64,
}

pub(crate) struct AcceptQueue {
    backlog: Mutex<Backlog>,
    condvar: Condvar,
}

impl AcceptQueue {
    pub fn new(max_backlog: usize) -> Arc<Self> {
        Arc::new(Self {
            backlog: Mutex::new(Backlog {
                queue: VecDeque::new(),
                pending: 0,
                max_backlog,
                closed: false,
                interrupts: 0,
            }),
            condvar: Condvar::new(),
        })
    }

    pub fn set_max_backlog(&self, max_backlog: usize) {
        self.backlog.lock().unwrap().max_backlog = max_backlog;
    }

    /// Claims a backlog slot for a new child. Fails when the backlog is
    /// full, in which case the SYN is dropped and the peer retries.
    pub fn try_reserve(&self) -> bool {
        let mut backlog = self.backlog.lock().unwrap();
        if backlog.closed || backlog.queue.len() + backlog.pending >= backlog.max_backlog {
            return false;
        }
        backlog.pending += 1;
        true
    }

    /// Moves an established child into the accept queue and wakes a waiter.
    pub fn deliver(&self, child: Arc<TcpEndpoint>) {
        let mut backlog = self.backlog.lock().unwrap();
        backlog.pending = backlog.pending.saturating_sub(1);
        if backlog.closed {
            return;
        }
        backlog.queue.push_back(child);
        drop(backlog);
        self.condvar.notify_one();
    }

    /// Forgets a child whose connection failed before it was accepted.
    pub fn abort(&self, child: &Arc<TcpEndpoint>) {
        let mut backlog = self.backlog.lock().unwrap();
        if let Some(index) = backlog
            .queue
            .iter()
            .position(|entry| Arc::ptr_eq(entry, child))
        {
            backlog.queue.remove(index);
        } else {
            backlog.pending = backlog.pending.saturating_sub(1);
        }
    }

    /// Takes the next established child, waiting up to `deadline`.
    /// `non_blocking` turns an empty queue into `WouldBlock` immediately.
    pub fn dequeue(
        &self,
        deadline: Option<Instant>,
        non_blocking: bool,
    ) -> Result<Arc<TcpEndpoint>, TcpError> {
        let mut backlog = self.backlog.lock().unwrap();
        loop {
            if let Some(child) = backlog.queue.pop_front() {
                return Ok(child);
            }
            if backlog.closed {
                return Err(TcpError::ConnectionAborted);
            }
            if non_blocking {
                return Err(TcpError::WouldBlock);
            }

            let interrupts = backlog.interrupts;
            backlog = match deadline {
                None => self.condvar.wait(backlog).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TcpError::TimedOut);
                    }
                    self.condvar.wait_timeout(backlog, deadline - now).unwrap().0
                }
            };
            if backlog.interrupts != interrupts {
                return Err(TcpError::Interrupted);
            }
        }
    }

    /// Closes the queue and returns any children that were waiting so the
    /// caller can abort them without holding the backlog lock.
    pub fn close(&self) -> Vec<Arc<TcpEndpoint>> {
        let mut backlog = self.backlog.lock().unwrap();
        backlog.closed = true;
        let orphans = backlog.queue.drain(..).collect();
        drop(backlog);
        self.condvar.notify_all();
        orphans
    }

    pub fn interrupt(&self) {
        let mut backlog = self.backlog.lock().unwrap();
        backlog.interrupts += 1;
        drop(backlog);
        self.condvar.notify_all();
    }

    /// Established connections ready to be accepted.
    pub fn count(&self) -> usize {
        self.backlog.lock().unwrap().queue.len()
    }
}

//! Per-origin HTTP connection pool with idle reaping.
//!
//! Idle connections live in per-origin deques behind one mutex (the strand
//! equivalent: acquire, release and reap bodies are short serialized
//! critical sections; I/O happens outside the lock). Acquire is LIFO for
//! cache warmth; release enforces the per-origin cap by dropping the
//! oldest entry and the global cap by repeatedly shrinking the largest
//! deque. A reaper task is armed lazily while idle connections exist.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use tokio_rustls::TlsConnector;

use aqueduct_io::{codes, Error, Result, IO};

use crate::config::PoolConfig;

use super::connection::Connection;
use super::origin::Origin;

#[derive(Default)]
struct PoolState {
    idle: HashMap<Origin, VecDeque<Connection>>,
    reaper: Option<tokio::task::JoinHandle<()>>,
    stopped: bool,
}

impl PoolState {
    fn total_idle(&self) -> usize {
        self.idle.values().map(VecDeque::len).sum()
    }
}

/// Pool of reusable HTTP transport connections, keyed by origin.
pub struct HttpConnectionPool {
    config: PoolConfig,
    tls: Option<TlsConnector>,
    state: Mutex<PoolState>,
    self_weak: Weak<HttpConnectionPool>,
}

impl HttpConnectionPool {
    pub fn new(config: PoolConfig, tls: Option<Arc<rustls::ClientConfig>>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            tls: tls.map(TlsConnector::from),
            state: Mutex::new(PoolState::default()),
            self_weak: weak.clone(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Idle connections across all origins.
    pub fn idle_count(&self) -> usize {
        self.state.lock().expect("pool lock").total_idle()
    }

    /// Acquire a live, non-expired connection for `origin`: most recently
    /// used idle connection first, otherwise a freshly opened one.
    pub async fn acquire(&self, origin: &Origin) -> Result<Connection> {
        let mut victims = Vec::new();
        let reused = {
            let mut state = self.state.lock().expect("pool lock");
            if state.stopped {
                return Err(Error::new(
                    codes::network::CONNECTION_REFUSED,
                    "pool is stopped",
                ));
            }
            let mut reused = None;
            if let Some(deque) = state.idle.get_mut(origin) {
                while let Some(mut conn) = deque.pop_back() {
                    if conn.alive() && !conn.is_expired(self.config.keep_alive()) {
                        conn.set_busy(true);
                        reused = Some(conn);
                        break;
                    }
                    victims.push(conn);
                }
            }
            reused
        };
        close_all(victims).await;

        match reused {
            Some(conn) => {
                tracing::trace!(conn_id = conn.id(), origin = %origin, "reusing idle connection");
                Ok(conn)
            }
            None => Connection::open(origin.clone(), self.tls.clone(), &self.config).await,
        }
    }

    /// Monadic acquire adapter.
    pub fn acquire_io(&self, origin: Origin) -> IO<Connection> {
        let weak = self.self_weak.clone();
        IO::from_thunk(move || {
            let weak = weak.clone();
            let origin = origin.clone();
            async move {
                let Some(pool) = weak.upgrade() else {
                    return Err(Error::new(
                        codes::network::CONNECTION_REFUSED,
                        "pool is gone",
                    ));
                };
                pool.acquire(&origin).await
            }
        })
    }

    /// Return a connection. Dead or non-reusable connections are closed;
    /// the per-origin and global idle caps are enforced here.
    pub async fn release(&self, mut conn: Connection, can_reuse: bool) {
        if !can_reuse || !conn.alive() {
            conn.close().await;
            return;
        }
        let mut victims = Vec::new();
        {
            let mut state = self.state.lock().expect("pool lock");
            if state.stopped {
                victims.push(conn);
            } else {
                conn.set_busy(false);
                let origin = conn.origin().clone();
                let deque = state.idle.entry(origin).or_default();
                if deque.len() >= self.config.max_idle_per_origin {
                    // drop the oldest for this origin
                    if let Some(old) = deque.pop_front() {
                        victims.push(old);
                    }
                }
                deque.push_back(conn);
                shrink_global(&mut state, self.config.max_total_idle, &mut victims);
                self.arm_reaper_locked(&mut state);
            }
        }
        close_all(victims).await;
    }

    /// Close every idle connection and stop accepting acquires. Idempotent.
    pub async fn stop(&self) {
        let (victims, reaper) = {
            let mut state = self.state.lock().expect("pool lock");
            state.stopped = true;
            let victims: Vec<Connection> = state
                .idle
                .drain()
                .flat_map(|(_, deque)| deque.into_iter())
                .collect();
            (victims, state.reaper.take())
        };
        if let Some(handle) = reaper {
            handle.abort();
        }
        close_all(victims).await;
        tracing::debug!("http connection pool stopped");
    }

    // must be called with the state lock held
    fn arm_reaper_locked(&self, state: &mut PoolState) {
        let Some(interval) = self.config.reap_interval() else {
            return; // disabled
        };
        if state.reaper.is_some() || state.total_idle() == 0 {
            return;
        }
        let weak = self.self_weak.clone();
        state.reaper = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(pool) = weak.upgrade() else {
                    return;
                };
                if !pool.reap_once().await {
                    return;
                }
            }
        }));
    }

    /// One reaper pass: prune dead and expired idle connections. Returns
    /// false when no idle connections remain and the reaper disarms.
    async fn reap_once(&self) -> bool {
        let mut victims = Vec::new();
        let keep_running = {
            let mut state = self.state.lock().expect("pool lock");
            state.idle.retain(|_, deque| {
                let mut kept = VecDeque::with_capacity(deque.len());
                for conn in deque.drain(..) {
                    if conn.alive() && !conn.is_expired(self.config.keep_alive()) {
                        kept.push_back(conn);
                    } else {
                        victims.push(conn);
                    }
                }
                *deque = kept;
                !deque.is_empty()
            });
            let remaining = state.total_idle();
            if remaining == 0 {
                state.reaper = None;
            }
            remaining > 0
        };
        if !victims.is_empty() {
            tracing::trace!(pruned = victims.len(), "reaper pruned idle connections");
        }
        close_all(victims).await;
        keep_running
    }
}

fn shrink_global(state: &mut PoolState, max_total_idle: usize, victims: &mut Vec<Connection>) {
    let mut total = state.total_idle();
    while total > max_total_idle {
        // victimize the largest deque
        let largest = state
            .idle
            .iter()
            .max_by_key(|(_, deque)| deque.len())
            .map(|(origin, _)| origin.clone());
        let Some(origin) = largest else { break };
        let Some(deque) = state.idle.get_mut(&origin) else {
            break;
        };
        if let Some(old) = deque.pop_front() {
            victims.push(old);
            total -= 1;
        }
        if deque.is_empty() {
            state.idle.remove(&origin);
        }
    }
}

async fn close_all(victims: Vec<Connection>) {
    for mut conn in victims {
        conn.close().await;
    }
}

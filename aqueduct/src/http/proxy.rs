//! Proxy rotation with failure blacklisting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::ProxySetting;

const DEFAULT_BLACKLIST: Duration = Duration::from_secs(300);

struct ProxyPoolState {
    cursor: usize,
    blacklist: HashMap<ProxySetting, Instant>,
}

/// Round-robin over the configured proxies, skipping entries that were
/// recently blacklisted. An empty pool can also mean proxying is disabled.
pub struct ProxyPool {
    proxies: Vec<ProxySetting>,
    state: Mutex<ProxyPoolState>,
}

impl ProxyPool {
    /// `proxies` should already have disabled entries filtered out
    /// (config loading does this).
    pub fn new(proxies: Vec<ProxySetting>) -> Self {
        Self {
            proxies,
            state: Mutex::new(ProxyPoolState {
                cursor: 0,
                blacklist: HashMap::new(),
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    /// The next usable proxy, or `None` when the pool is empty or every
    /// entry is currently blacklisted.
    pub fn next(&self) -> Option<ProxySetting> {
        if self.proxies.is_empty() {
            return None;
        }
        let mut state = self.state.lock().expect("proxy pool lock");
        let now = Instant::now();
        state.blacklist.retain(|proxy, expiry| {
            let keep = now < *expiry;
            if !keep {
                tracing::debug!(proxy = %proxy.authority(), "un-blacklisting proxy");
            }
            keep
        });

        for _ in 0..self.proxies.len() {
            let proxy = &self.proxies[state.cursor];
            state.cursor = (state.cursor + 1) % self.proxies.len();
            if !state.blacklist.contains_key(proxy) {
                tracing::debug!(proxy = %proxy.authority(), "returning proxy");
                return Some(proxy.clone());
            }
        }
        tracing::warn!("all proxies are currently blacklisted");
        None
    }

    /// Exclude `proxy` from rotation for `timeout` (default 300 s via
    /// [`blacklist_default`](Self::blacklist_default)).
    pub fn blacklist(&self, proxy: &ProxySetting, timeout: Duration) {
        let mut state = self.state.lock().expect("proxy pool lock");
        state.blacklist.insert(proxy.clone(), Instant::now() + timeout);
        tracing::warn!(
            proxy = %proxy.authority(),
            timeout_s = timeout.as_secs(),
            "blacklisting proxy"
        );
    }

    pub fn blacklist_default(&self, proxy: &ProxySetting) {
        self.blacklist(proxy, DEFAULT_BLACKLIST);
    }

    pub fn reset_blacklist(&self) {
        let mut state = self.state.lock().expect("proxy pool lock");
        state.blacklist.clear();
        tracing::debug!("proxy blacklist cleared");
    }
}

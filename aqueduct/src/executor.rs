//! Executor façade: a sized tokio runtime the pools run on.

use std::time::Duration;

use aqueduct_io::{codes, Error, Result};

use crate::config::HttpclientConfig;

/// Owns a multi-thread runtime. Construct at the composition root, pass
/// [`handle`](Self::handle) to whatever needs to spawn, and call
/// [`stop`](Self::stop) last, after every pool bound to it has shut down.
pub struct Executor {
    runtime: Option<tokio::runtime::Runtime>,
}

impl Executor {
    /// `threads = 0` means one worker per available core.
    pub fn new(threads: usize) -> Result<Self> {
        let workers = if threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            threads
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .enable_all()
            .build()
            .map_err(|e| {
                Error::new(
                    codes::network::CONNECTION_REFUSED,
                    format!("failed to build runtime: {e}"),
                )
            })?;
        Ok(Self {
            runtime: Some(runtime),
        })
    }

    /// Size the runtime from the HTTP client config's `threads_num`.
    pub fn from_config(config: &HttpclientConfig) -> Result<Self> {
        Self::new(config.effective_threads())
    }

    pub fn handle(&self) -> Option<tokio::runtime::Handle> {
        self.runtime.as_ref().map(|rt| rt.handle().clone())
    }

    pub fn spawn<F>(&self, future: F) -> Option<tokio::task::JoinHandle<F::Output>>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.as_ref().map(|rt| rt.spawn(future))
    }

    pub fn block_on<F: std::future::Future>(&self, future: F) -> Option<F::Output> {
        self.runtime.as_ref().map(|rt| rt.block_on(future))
    }

    /// Shut the runtime down, waiting a bounded time for in-flight work.
    /// Idempotent.
    pub fn stop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(5));
            tracing::debug!("executor stopped");
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

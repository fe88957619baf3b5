//! Deferred, single-shot asynchronous computations.
//!
//! An [`IO<T>`] wraps a re-runnable thunk producing a future that resolves
//! to [`Result<T>`](crate::Result). Combinators compose new thunks without
//! executing anything; work only happens inside [`IO::run`]. Cloning is a
//! shallow copy of the thunk, so a cloned IO re-executes the same captured
//! work, which is the property the retry combinators rely on.
//!
//! Panics raised inside user callables are caught and surfaced as errors
//! with the reserved negative codes; a chain always completes exactly once
//! per `run`.

use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{codes, Error, Result};

type Thunk<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// A deferred computation yielding `Result<T>` when run.
pub struct IO<T> {
    thunk: Thunk<T>,
}

impl<T> Clone for IO<T> {
    fn clone(&self) -> Self {
        Self {
            thunk: Arc::clone(&self.thunk),
        }
    }
}

impl<T: Send + 'static> IO<T> {
    /// Wrap an explicit thunk. The closure runs once per [`IO::run`] call.
    pub fn from_thunk<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            thunk: Arc::new(move || f().boxed()),
        }
    }

    /// Lift a value into IO. Each run yields a fresh clone of the value.
    pub fn pure(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::from_thunk(move || {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    /// Produce an IO that always fails with the given error.
    pub fn fail(error: Error) -> Self {
        Self::from_thunk(move || {
            let error = error.clone();
            async move { Err(error) }
        })
    }

    /// Synchronous lift of an already-computed result.
    pub fn from_result(result: Result<T>) -> Self
    where
        T: Clone + Sync,
    {
        Self::from_thunk(move || {
            let result = result.clone();
            async move { result }
        })
    }

    /// Execute the captured work. Every call re-executes the thunk and
    /// resolves exactly once.
    pub async fn run(&self) -> Result<T> {
        (self.thunk)().await
    }

    /// Transform the success value with a pure function.
    ///
    /// On upstream error `f` is not called. A panic inside `f` becomes
    /// `Error { code: -1 }` carrying the panic message.
    pub fn map<U, F>(self, f: F) -> IO<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        IO::from_thunk(move || {
            let prev = self.clone();
            let f = Arc::clone(&f);
            async move {
                let value = prev.run().await?;
                catch_unwind(AssertUnwindSafe(move || f(value)))
                    .map_err(|p| Error::new(codes::io::MAP_PANIC, panic_message(p)))
            }
        })
    }

    /// Flat-map: on success, run the IO produced by `f`.
    ///
    /// On upstream error `f` is not called. A panic inside `f` becomes
    /// `Error { code: -2 }`.
    pub fn then<U, F>(self, f: F) -> IO<U>
    where
        U: Send + 'static,
        F: Fn(T) -> IO<U> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        IO::from_thunk(move || {
            let prev = self.clone();
            let f = Arc::clone(&f);
            async move {
                let value = prev.run().await?;
                let next = catch_unwind(AssertUnwindSafe(move || f(value)))
                    .map_err(|p| Error::new(codes::io::THEN_PANIC, panic_message(p)))?;
                next.run().await
            }
        })
    }

    /// Recover from an error by running the IO produced by `f`.
    ///
    /// Success passes through untouched. A panic inside `f` becomes
    /// `Error { code: -3 }`.
    pub fn catch_then<F>(self, f: F) -> IO<T>
    where
        F: Fn(Error) -> IO<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        IO::from_thunk(move || {
            let prev = self.clone();
            let f = Arc::clone(&f);
            async move {
                match prev.run().await {
                    Ok(value) => Ok(value),
                    Err(error) => {
                        let recovery = catch_unwind(AssertUnwindSafe(move || f(error)))
                            .map_err(|p| Error::new(codes::io::CATCH_PANIC, panic_message(p)))?;
                        recovery.run().await
                    }
                }
            }
        })
    }

    /// Transform the error if present; success passes through.
    pub fn map_err<F>(self, f: F) -> IO<T>
    where
        F: Fn(Error) -> Error + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        IO::from_thunk(move || {
            let prev = self.clone();
            let f = Arc::clone(&f);
            async move { prev.run().await.map_err(|e| f(e)) }
        })
    }

    /// Run a side-effecting finalizer after completion, success or error.
    /// The original result is returned unchanged.
    pub fn finally<F>(self, f: F) -> IO<T>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        IO::from_thunk(move || {
            let prev = self.clone();
            let f = Arc::clone(&f);
            async move {
                let result = prev.run().await;
                f();
                result
            }
        })
    }

    /// Run a monadic finalizer after completion. The cleanup IO's outcome
    /// is ignored (a panic building it is swallowed too); the original
    /// result always passes through.
    pub fn finally_then<F>(self, f: F) -> IO<T>
    where
        F: Fn() -> IO<()> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        IO::from_thunk(move || {
            let prev = self.clone();
            let f = Arc::clone(&f);
            async move {
                let result = prev.run().await;
                if let Ok(cleanup) = catch_unwind(AssertUnwindSafe(|| f())) {
                    let _ = cleanup.run().await;
                }
                result
            }
        })
    }

    /// Run the upstream only after `duration` has elapsed.
    pub fn delay(self, duration: Duration) -> IO<T> {
        IO::from_thunk(move || {
            let prev = self.clone();
            async move {
                tokio::time::sleep(duration).await;
                prev.run().await
            }
        })
    }

    /// Fail with `Error { 2, "Operation timed out" }` unless the upstream
    /// completes within `duration`. The losing arm is dropped; resources it
    /// acquired are released by their own drop logic.
    pub fn timeout(self, duration: Duration) -> IO<T> {
        IO::from_thunk(move || {
            let prev = self.clone();
            async move {
                match tokio::time::timeout(duration, prev.run()).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::timed_out()),
                }
            }
        })
    }

    /// Conditional exponential backoff retry.
    ///
    /// Performs at most `max_attempts` runs, sleeping `initial_delay`,
    /// `2 * initial_delay`, ... between failures. Stops early when
    /// `should_retry` rejects an error. Returns the first success or the
    /// last error observed.
    pub fn retry_exponential_if<P>(
        self,
        max_attempts: u32,
        initial_delay: Duration,
        should_retry: P,
    ) -> IO<T>
    where
        P: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        let should_retry = Arc::new(should_retry);
        IO::from_thunk(move || {
            let prev = self.clone();
            let should_retry = Arc::clone(&should_retry);
            async move {
                let mut delay = initial_delay;
                let mut attempt = 0u32;
                loop {
                    attempt += 1;
                    match prev.run().await {
                        Ok(value) => return Ok(value),
                        Err(error) => {
                            if attempt >= max_attempts || !should_retry(&error) {
                                return Err(error);
                            }
                            tracing::debug!(
                                attempt,
                                code = error.code,
                                delay_ms = delay.as_millis() as u64,
                                "retrying after error"
                            );
                            tokio::time::sleep(delay).await;
                            delay *= 2;
                        }
                    }
                }
            }
        })
    }

    /// Exponential backoff retry on any error.
    pub fn retry_exponential(self, max_attempts: u32, initial_delay: Duration) -> IO<T> {
        self.retry_exponential_if(max_attempts, initial_delay, |_| true)
    }
}

/// An IO that completes with `Ok(())` after a delay.
pub fn delay_for(duration: Duration) -> IO<()> {
    IO::from_thunk(move || async move {
        tokio::time::sleep(duration).await;
        Ok(())
    })
}

/// Delay and then yield a provided value.
pub fn delay_then<T>(duration: Duration, value: T) -> IO<T>
where
    T: Clone + Send + Sync + 'static,
{
    delay_for(duration).map(move |_| value.clone())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic of unknown type".to_string()
    }
}

//! aqueduct-io - deferred async computations with a closed error taxonomy
//!
//! The building blocks the rest of the workspace composes on:
//!
//! - **`Error`**: a numeric code plus message, with documented code
//!   namespaces for SQL execution, value parsing, network transport and
//!   HTTP responses.
//! - **`Result<T>`**: plain `std::result::Result` specialized to `Error`.
//! - **`IO<T>`**: a re-runnable, single-shot deferred computation with
//!   combinators for sequencing (`then`), recovery (`catch_then`), timing
//!   (`delay`, `timeout`) and exponential-backoff retry.
//!
//! # Example
//!
//! ```ignore
//! use aqueduct_io::{codes, Error, IO};
//! use std::time::Duration;
//!
//! let fetch = IO::from_thunk(|| async { fetch_remote().await })
//!     .timeout(Duration::from_secs(5))
//!     .retry_exponential_if(3, Duration::from_millis(100), |e| {
//!         e.code == codes::network::CONNECTION_TIMEOUT
//!     });
//! let value = fetch.run().await?;
//! ```

pub mod error;
pub mod io;

pub use error::{codes, zip2, zip3, zip4, Error, Result};
pub use io::{delay_for, delay_then, IO};

//! Pooled, monadic MySQL data access.

pub mod pool;
pub mod session;
pub mod state;
pub mod types;
pub mod value;

pub use pool::MySqlPool;
pub use session::{MonadicSession, DEFAULT_QUERY_TIMEOUT};
pub use state::{FieldView, FromField, ResultSet, ResultSetView, RowView, SessionState};
pub use value::Value;

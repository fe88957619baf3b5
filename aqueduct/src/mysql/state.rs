//! Per-query session state and result-shape adaptors.
//!
//! A [`SessionState`] owns one pooled connection for the duration of a
//! single query and buffers every result set the statement produced. The
//! shape adaptors (`expect_one_row`, `expect_list_of_rows`, ...) turn the
//! raw buffers into typed outcomes with the closed error taxonomy.
//!
//! [`RowView`], [`ResultSetView`] and [`FieldView`] borrow the state's
//! buffers; their lifetimes tie them to the state, so a view cannot
//! outlive a moved or dropped state. Callers that need a value past the
//! current borrow extract primitives inside [`SessionState::visit_one_row`]
//! / [`SessionState::visit_maybe_one_row`].

use aqueduct_io::{codes, Error, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;

use super::pool::TrackedConn;
use super::value::Value;

/// One buffered result set: ordered rows of owned cells plus execution
/// metadata.
#[derive(Debug, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub affected_rows: u64,
    pub last_insert_id: Option<u64>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>, affected_rows: u64) -> Self {
        Self {
            columns,
            rows,
            affected_rows,
            last_insert_id: None,
        }
    }
}

/// Mutable carrier for one query execution. Move-only; the pooled
/// connection inside is released back to the pool when the state drops.
pub struct SessionState {
    pub(crate) conn: Option<TrackedConn>,
    pub results: Vec<ResultSet>,
    /// Last driver-level error code; zero means none.
    pub error: i32,
    /// Server-supplied diagnostic message for the last error.
    pub diagnostics: String,
    /// Opaque key/value bag for caller annotations.
    pub updates: serde_json::Map<String, serde_json::Value>,
}

impl SessionState {
    pub(crate) fn new(conn: TrackedConn) -> Self {
        Self {
            conn: Some(conn),
            results: Vec::new(),
            error: 0,
            diagnostics: String::new(),
            updates: serde_json::Map::new(),
        }
    }

    /// A state with no connection attached. Used for shape-adaptor work on
    /// pre-buffered results (and for tests).
    pub fn detached() -> Self {
        Self {
            conn: None,
            results: Vec::new(),
            error: 0,
            diagnostics: String::new(),
            updates: serde_json::Map::new(),
        }
    }

    pub fn has_error(&self) -> bool {
        self.error != 0
    }

    pub fn error_message(&self) -> String {
        if self.error == 0 {
            String::new()
        } else if self.diagnostics.is_empty() {
            format!("driver error {}", self.error)
        } else {
            format!("driver error {}: {}", self.error, self.diagnostics)
        }
    }

    pub fn diagnostics(&self) -> &str {
        &self.diagnostics
    }

    /// Record a caller annotation on the state.
    pub fn set_update(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.updates.insert(key.into(), value);
    }

    /// Release the pooled connection early instead of waiting for drop.
    pub fn release_connection(&mut self) {
        self.conn = None;
    }

    fn sql_failed(&self, msg: &str) -> Error {
        Error::new(
            codes::sql_exec::SQL_FAILED,
            format!("{msg}: {}", self.error_message()),
        )
    }

    fn result_set(&self, msg: &str, index: usize) -> Result<&ResultSet> {
        self.results.get(index).ok_or_else(|| {
            Error::new(
                codes::sql_exec::INDEX_OUT_OF_BOUNDS,
                format!(
                    "{msg}: result set index {index} out of bounds (have {})",
                    self.results.len()
                ),
            )
        })
    }

    /// Fail with `SQL_FAILED` if the driver reported an error.
    pub fn expect_no_error(&self, msg: &str) -> Result<()> {
        if self.has_error() {
            Err(self.sql_failed(msg))
        } else {
            Ok(())
        }
    }

    /// Exactly one row whose `id_column_index` cell exists and is non-null.
    ///
    /// Error mapping: driver error → `SQL_FAILED`; missing result set or
    /// column → `INDEX_OUT_OF_BOUNDS`; zero rows → `NO_ROWS`; more than one
    /// row → `MULTIPLE_RESULTS`; null id cell → `NULL_ID`.
    pub fn expect_one_row(
        &self,
        msg: &str,
        result_index: usize,
        id_column_index: usize,
    ) -> Result<RowView<'_>> {
        self.expect_no_error(msg)?;
        let set = self.result_set(msg, result_index)?;
        match set.rows.len() {
            0 => {
                return Err(Error::new(
                    codes::sql_exec::NO_ROWS,
                    format!("{msg}: expected one row, got none"),
                ))
            }
            1 => {}
            n => {
                return Err(Error::new(
                    codes::sql_exec::MULTIPLE_RESULTS,
                    format!("{msg}: expected one row, got {n}"),
                ))
            }
        }
        let row = &set.rows[0];
        let cell = row.get(id_column_index).ok_or_else(|| {
            Error::new(
                codes::sql_exec::INDEX_OUT_OF_BOUNDS,
                format!(
                    "{msg}: column index {id_column_index} out of bounds (row has {})",
                    row.len()
                ),
            )
        })?;
        if cell.is_null() {
            return Err(Error::new(
                codes::sql_exec::NULL_ID,
                format!("{msg}: column {id_column_index} is null"),
            ));
        }
        Ok(RowView {
            columns: &set.columns,
            cells: row,
        })
    }

    /// Like [`expect_one_row`](Self::expect_one_row), but an absent row or
    /// a null id cell is `Ok(None)` instead of an error. Everything else
    /// still fails.
    pub fn maybe_one_row(
        &self,
        result_index: usize,
        id_column_index: usize,
    ) -> Result<Option<RowView<'_>>> {
        match self.expect_one_row("maybe_one_row", result_index, id_column_index) {
            Ok(row) => Ok(Some(row)),
            Err(e) if e.code == codes::sql_exec::NO_ROWS || e.code == codes::sql_exec::NULL_ID => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Scan result sets in order and return the first row with strictly
    /// more than `cols` columns. `NO_ROWS` when none qualifies.
    pub fn expect_one_row_cols_gt(&self, msg: &str, cols: usize) -> Result<RowView<'_>> {
        self.expect_no_error(msg)?;
        for set in &self.results {
            for row in &set.rows {
                if row.len() > cols {
                    return Ok(RowView {
                        columns: &set.columns,
                        cells: row,
                    });
                }
            }
        }
        Err(Error::new(
            codes::sql_exec::NO_ROWS,
            format!("{msg}: no row with more than {cols} columns"),
        ))
    }

    /// The statement at `result_index` affected exactly one row.
    pub fn expect_affected_one_row(&self, msg: &str, result_index: usize) -> Result<()> {
        let affected = self.expect_affected_rows(msg, result_index)?;
        if affected != 1 {
            return Err(Error::new(
                codes::sql_exec::MULTIPLE_RESULTS,
                format!("{msg}: expected 1 affected row, got {affected}"),
            ));
        }
        Ok(())
    }

    /// Affected-row count of the statement at `result_index`.
    pub fn expect_affected_rows(&self, msg: &str, result_index: usize) -> Result<u64> {
        self.expect_no_error(msg)?;
        Ok(self.result_set(msg, result_index)?.affected_rows)
    }

    /// A list result plus its total. When `rows_index == total_index` the
    /// total is the list's own length; otherwise it is read from cell (0,0)
    /// of the result set at `total_index` (`NO_ROWS` when that set is
    /// empty).
    pub fn expect_list_of_rows(
        &self,
        msg: &str,
        rows_index: usize,
        total_index: usize,
    ) -> Result<(ResultSetView<'_>, i64)> {
        self.expect_no_error(msg)?;
        let rows_set = self.result_set(msg, rows_index)?;
        let total = if rows_index == total_index {
            rows_set.rows.len() as i64
        } else {
            let total_set = self.result_set(msg, total_index)?;
            let first = total_set.rows.first().ok_or_else(|| {
                Error::new(
                    codes::sql_exec::NO_ROWS,
                    format!("{msg}: total result set is empty"),
                )
            })?;
            let cell = first.get(0).ok_or_else(|| {
                Error::new(
                    codes::sql_exec::INDEX_OUT_OF_BOUNDS,
                    format!("{msg}: total result set has no columns"),
                )
            })?;
            FieldView { value: cell }.as_i64().map_err(|e| e.with_context(msg))?
        };
        Ok((ResultSetView { set: rows_set }, total))
    }

    /// Convenience for a list whose total is its own length.
    pub fn expect_all_list_of_rows(
        &self,
        msg: &str,
        index: usize,
    ) -> Result<(ResultSetView<'_>, i64)> {
        self.expect_list_of_rows(msg, index, index)
    }

    /// A single scalar of type `T` from the sole row of the result set at
    /// `result_index`. `T` ranges over `i64`, `u64`, `f64`, `bool` and
    /// `String`; a cell whose runtime type cannot satisfy `T` yields
    /// `BAD_VALUE_ACCESS`.
    pub fn expect_one_value<T: FromField>(
        &self,
        msg: &str,
        result_index: usize,
        column_index: usize,
    ) -> Result<T> {
        self.expect_no_error(msg)?;
        let set = self.result_set(msg, result_index)?;
        match set.rows.len() {
            0 => {
                return Err(Error::new(
                    codes::sql_exec::NO_ROWS,
                    format!("{msg}: expected one row, got none"),
                ))
            }
            1 => {}
            n => {
                return Err(Error::new(
                    codes::sql_exec::MULTIPLE_RESULTS,
                    format!("{msg}: expected one row, got {n}"),
                ))
            }
        }
        let row = &set.rows[0];
        let cell = row.get(column_index).ok_or_else(|| {
            Error::new(
                codes::sql_exec::INDEX_OUT_OF_BOUNDS,
                format!(
                    "{msg}: column index {column_index} out of bounds (row has {})",
                    row.len()
                ),
            )
        })?;
        T::from_field(FieldView { value: cell }, msg)
    }

    /// `expect_one_value::<i64>` under its common name.
    pub fn expect_count(&self, msg: &str, result_index: usize) -> Result<i64> {
        self.expect_one_value::<i64>(msg, result_index, 0)
    }

    /// Run `f` on the single expected row. The borrowed view cannot escape
    /// `f`; the closure returns an owned value.
    pub fn visit_one_row<R>(
        &self,
        msg: &str,
        result_index: usize,
        id_column_index: usize,
        f: impl FnOnce(RowView<'_>) -> R,
    ) -> Result<R> {
        let row = self.expect_one_row(msg, result_index, id_column_index)?;
        Ok(f(row))
    }

    /// Run `f` on the row when present; `Ok(None)` when the row is absent
    /// or its id cell is null.
    pub fn visit_maybe_one_row<R>(
        &self,
        result_index: usize,
        id_column_index: usize,
        f: impl FnOnce(RowView<'_>) -> R,
    ) -> Result<Option<R>> {
        Ok(self.maybe_one_row(result_index, id_column_index)?.map(f))
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("result_sets", &self.results.len())
            .field("error", &self.error)
            .field("diagnostics", &self.diagnostics)
            .field("has_conn", &self.conn.is_some())
            .finish()
    }
}

/// Borrowed view of one result set.
#[derive(Clone, Copy, Debug)]
pub struct ResultSetView<'a> {
    set: &'a ResultSet,
}

impl<'a> ResultSetView<'a> {
    pub fn row_count(&self) -> usize {
        self.set.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.rows.is_empty()
    }

    pub fn affected_rows(&self) -> u64 {
        self.set.affected_rows
    }

    pub fn columns(&self) -> &'a [String] {
        &self.set.columns
    }

    pub fn row(&self, index: usize) -> Option<RowView<'a>> {
        self.set.rows.get(index).map(|cells| RowView {
            columns: &self.set.columns,
            cells,
        })
    }

    pub fn rows(&self) -> impl Iterator<Item = RowView<'a>> + '_ {
        self.set.rows.iter().map(|cells| RowView {
            columns: &self.set.columns,
            cells,
        })
    }
}

/// Borrowed view of one row.
#[derive(Clone, Copy, Debug)]
pub struct RowView<'a> {
    columns: &'a [String],
    cells: &'a [Value],
}

impl<'a> RowView<'a> {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn at(&self, index: usize) -> Result<FieldView<'a>> {
        self.cells
            .get(index)
            .map(|value| FieldView { value })
            .ok_or_else(|| {
                Error::new(
                    codes::sql_exec::INDEX_OUT_OF_BOUNDS,
                    format!("column index {index} out of bounds (row has {})", self.len()),
                )
            })
    }

    pub fn by_name(&self, name: &str) -> Result<FieldView<'a>> {
        let index = self
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| {
                Error::new(
                    codes::sql_exec::INDEX_OUT_OF_BOUNDS,
                    format!("no column named '{name}'"),
                )
            })?;
        self.at(index)
    }
}

/// Borrowed view of one cell with typed accessors.
#[derive(Clone, Copy)]
pub struct FieldView<'a> {
    value: &'a Value,
}

impl<'a> FieldView<'a> {
    pub fn kind(&self) -> &'static str {
        self.value.type_name()
    }

    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    pub fn raw(&self) -> &'a Value {
        self.value
    }

    fn bad_access(&self, wanted: &str) -> Error {
        Error::new(
            codes::parse::BAD_VALUE_ACCESS,
            format!("cell holds {}, wanted {wanted}", self.kind()),
        )
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self.value {
            Value::I64(v) => Ok(*v),
            Value::U64(v) => i64::try_from(*v).map_err(|_| self.bad_access("i64")),
            _ => Err(self.bad_access("i64")),
        }
    }

    /// Unsigned read; a negative signed cell is rejected.
    pub fn as_u64(&self) -> Result<u64> {
        match self.value {
            Value::U64(v) => Ok(*v),
            Value::I64(v) => u64::try_from(*v).map_err(|_| self.bad_access("u64 (non-negative)")),
            _ => Err(self.bad_access("u64")),
        }
    }

    /// Float read. Access is strict per cell type: integer cells are not
    /// coerced and fail with `BAD_VALUE_ACCESS`.
    pub fn as_f64(&self) -> Result<f64> {
        use rust_decimal::prelude::ToPrimitive;
        match self.value {
            Value::F64(v) => Ok(*v),
            Value::F32(v) => Ok(f64::from(*v)),
            Value::Decimal(v) => v.to_f64().ok_or_else(|| self.bad_access("f64")),
            _ => Err(self.bad_access("f64")),
        }
    }

    /// Boolean read over the driver's TINYINT representation: an integer
    /// cell is true iff non-zero.
    pub fn as_bool(&self) -> Result<bool> {
        match self.value {
            Value::Bool(v) => Ok(*v),
            Value::I64(v) => Ok(*v != 0),
            Value::U64(v) => Ok(*v != 0),
            _ => Err(self.bad_access("bool")),
        }
    }

    pub fn as_str(&self) -> Result<&'a str> {
        match self.value {
            Value::String(v) => Ok(v.as_str()),
            _ => Err(self.bad_access("string")),
        }
    }

    pub fn as_date(&self) -> Result<NaiveDate> {
        match self.value {
            Value::Date(v) => Ok(*v),
            Value::DateTime(v) => Ok(v.date()),
            _ => Err(self.bad_access("date")),
        }
    }

    pub fn as_datetime(&self) -> Result<NaiveDateTime> {
        match self.value {
            Value::DateTime(v) => Ok(*v),
            _ => Err(self.bad_access("datetime")),
        }
    }

    pub fn as_time(&self) -> Result<NaiveTime> {
        match self.value {
            Value::Time(v) => Ok(*v),
            _ => Err(self.bad_access("time")),
        }
    }

    /// DECIMAL columns arrive as text on the wire; parse them here.
    pub fn as_decimal(&self) -> Result<Decimal> {
        match self.value {
            Value::Decimal(v) => Ok(*v),
            Value::String(v) => v.parse().map_err(|_| self.bad_access("decimal")),
            _ => Err(self.bad_access("decimal")),
        }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for i64 {}
    impl Sealed for u64 {}
    impl Sealed for f64 {}
    impl Sealed for bool {}
    impl Sealed for String {}
}

/// Scalar targets supported by [`SessionState::expect_one_value`]. The
/// trait is sealed: the supported set is i64, u64, f64, bool and String,
/// and anything else fails to compile instead of failing at runtime.
pub trait FromField: sealed::Sealed + Sized {
    fn from_field(field: FieldView<'_>, context: &str) -> Result<Self>;
}

impl FromField for i64 {
    fn from_field(field: FieldView<'_>, context: &str) -> Result<Self> {
        field.as_i64().map_err(|e| e.with_context(context))
    }
}

impl FromField for u64 {
    fn from_field(field: FieldView<'_>, context: &str) -> Result<Self> {
        field.as_u64().map_err(|e| e.with_context(context))
    }
}

impl FromField for f64 {
    fn from_field(field: FieldView<'_>, context: &str) -> Result<Self> {
        field.as_f64().map_err(|e| e.with_context(context))
    }
}

impl FromField for bool {
    fn from_field(field: FieldView<'_>, context: &str) -> Result<Self> {
        field.as_bool().map_err(|e| e.with_context(context))
    }
}

impl FromField for String {
    fn from_field(field: FieldView<'_>, context: &str) -> Result<Self> {
        field
            .as_str()
            .map(str::to_string)
            .map_err(|e| e.with_context(context))
    }
}

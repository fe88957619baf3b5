//! Conversion of driver wire values into owned cells.
//!
//! The text protocol delivers every non-null cell as bytes; typed cells are
//! recovered from the result set's column metadata, the same way the server
//! describes them. Binary-protocol values arrive pre-typed and map across
//! directly.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use mysql_async::consts::{ColumnFlags, ColumnType};
use mysql_async::{Column, Value as MySqlValue};

use aqueduct_io::{codes, Error, Result};

use super::value::Value;

fn conversion_error(expected: &str, actual: impl std::fmt::Display) -> Error {
    Error::new(
        codes::parse::BAD_VALUE_ACCESS,
        format!("cannot convert cell: expected {expected}, got {actual}"),
    )
}

/// Convert one wire value using its column's metadata.
pub fn from_wire_value(value: MySqlValue, column: &Column) -> Result<Value> {
    match value {
        MySqlValue::Bytes(bytes) => from_text_bytes(bytes, column),
        other => from_mysql_value(other),
    }
}

fn from_text_bytes(bytes: Vec<u8>, column: &Column) -> Result<Value> {
    let unsigned = column.flags().contains(ColumnFlags::UNSIGNED_FLAG);
    let text = match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => return Ok(Value::Bytes(e.into_bytes())),
    };

    match column.column_type() {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => {
            if unsigned {
                text.parse::<u64>()
                    .map(Value::U64)
                    .map_err(|_| conversion_error("unsigned integer", &text))
            } else {
                text.parse::<i64>()
                    .map(Value::I64)
                    .map_err(|_| conversion_error("integer", &text))
            }
        }
        ColumnType::MYSQL_TYPE_FLOAT => text
            .parse::<f32>()
            .map(Value::F32)
            .map_err(|_| conversion_error("float", &text)),
        ColumnType::MYSQL_TYPE_DOUBLE => text
            .parse::<f64>()
            .map(Value::F64)
            .map_err(|_| conversion_error("double", &text)),
        ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => text
            .parse::<rust_decimal::Decimal>()
            .map(Value::Decimal)
            .map_err(|_| conversion_error("decimal", &text)),
        ColumnType::MYSQL_TYPE_DATE => NaiveDate::parse_from_str(&text, "%Y-%m-%d")
            .map(Value::Date)
            // zero-dates and friends stay textual
            .or(Ok(Value::String(text))),
        ColumnType::MYSQL_TYPE_DATETIME | ColumnType::MYSQL_TYPE_TIMESTAMP => {
            NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
                .map(Value::DateTime)
                .or(Ok(Value::String(text)))
        }
        ColumnType::MYSQL_TYPE_TIME => NaiveTime::parse_from_str(&text, "%H:%M:%S%.f")
            .map(Value::Time)
            // TIME can exceed a day or be negative; keep those textual
            .or(Ok(Value::String(text))),
        ColumnType::MYSQL_TYPE_JSON => serde_json::from_str(&text)
            .map(Value::Json)
            .or(Ok(Value::String(text))),
        _ => Ok(Value::String(text)),
    }
}

/// Convert a pre-typed (binary protocol) wire value into an owned cell.
pub fn from_mysql_value(value: MySqlValue) -> Result<Value> {
    match value {
        MySqlValue::NULL => Ok(Value::Null),
        MySqlValue::Bytes(v) => match String::from_utf8(v) {
            Ok(s) => Ok(Value::String(s)),
            Err(e) => Ok(Value::Bytes(e.into_bytes())),
        },
        MySqlValue::Int(v) => Ok(Value::I64(v)),
        MySqlValue::UInt(v) => Ok(Value::U64(v)),
        MySqlValue::Float(v) => Ok(Value::F32(v)),
        MySqlValue::Double(v) => Ok(Value::F64(v)),
        MySqlValue::Date(year, month, day, hour, min, sec, micro) => {
            let date = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
                .ok_or_else(|| conversion_error("date", format_args!("{year}-{month}-{day}")))?;
            if hour == 0 && min == 0 && sec == 0 && micro == 0 {
                Ok(Value::Date(date))
            } else {
                let time =
                    NaiveTime::from_hms_micro_opt(hour as u32, min as u32, sec as u32, micro)
                        .ok_or_else(|| {
                            conversion_error("time", format_args!("{hour}:{min}:{sec}.{micro}"))
                        })?;
                Ok(Value::DateTime(NaiveDateTime::new(date, time)))
            }
        }
        MySqlValue::Time(is_neg, days, hours, mins, secs, micro) => {
            // NaiveTime covers 00:00:00..=23:59:59 only
            if is_neg || days > 0 || hours >= 24 {
                return Err(conversion_error(
                    "time of day",
                    format_args!(
                        "{}{}:{mins:02}:{secs:02}",
                        if is_neg { "-" } else { "" },
                        days * 24 + hours as u32
                    ),
                ));
            }
            let time = NaiveTime::from_hms_micro_opt(hours as u32, mins as u32, secs as u32, micro)
                .ok_or_else(|| {
                    conversion_error("time", format_args!("{hours}:{mins}:{secs}.{micro}"))
                })?;
            Ok(Value::Time(time))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_and_nulls_map_directly() {
        assert_eq!(from_mysql_value(MySqlValue::Int(-5)).unwrap(), Value::I64(-5));
        assert_eq!(from_mysql_value(MySqlValue::UInt(5)).unwrap(), Value::U64(5));
        assert_eq!(from_mysql_value(MySqlValue::NULL).unwrap(), Value::Null);
    }

    #[test]
    fn utf8_bytes_become_strings() {
        let v = from_mysql_value(MySqlValue::Bytes(b"12.50".to_vec())).unwrap();
        assert_eq!(v, Value::String("12.50".to_string()));

        let v = from_mysql_value(MySqlValue::Bytes(vec![0xff, 0xfe])).unwrap();
        assert_eq!(v, Value::Bytes(vec![0xff, 0xfe]));
    }

    #[test]
    fn midnight_date_is_a_date_not_a_datetime() {
        let v = from_mysql_value(MySqlValue::Date(2024, 6, 15, 0, 0, 0, 0)).unwrap();
        assert_eq!(
            v,
            Value::Date(NaiveDate::from_ymd_opt(2024, 6, 15).unwrap())
        );

        let v = from_mysql_value(MySqlValue::Date(2024, 6, 15, 14, 30, 0, 0)).unwrap();
        assert!(matches!(v, Value::DateTime(_)));
    }

    #[test]
    fn out_of_range_time_is_rejected() {
        let err = from_mysql_value(MySqlValue::Time(true, 0, 1, 0, 0, 0)).unwrap_err();
        assert_eq!(err.code, aqueduct_io::codes::parse::BAD_VALUE_ACCESS);
        let err = from_mysql_value(MySqlValue::Time(false, 2, 0, 0, 0, 0)).unwrap_err();
        assert_eq!(err.code, aqueduct_io::codes::parse::BAD_VALUE_ACCESS);
    }
}

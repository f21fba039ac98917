//! MySQL backend implementation for tidemark-rdbc
//!
//! Provides MySQL-specific implementations:
//! - Connection with parameter binding and typed row decoding
//! - Connection factory
//! - Server error classification (lock waits, deadlocks, lost connections)

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, DatabaseType};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Character set id MySQL reports for binary columns
const BINARY_CHARSET: u16 = 63;

/// Convert a Value to a MySQL compatible parameter
fn value_to_sql(value: &Value) -> mysql_async::Value {
    match value {
        Value::Null => mysql_async::Value::NULL,
        Value::Bool(b) => mysql_async::Value::from(*b),
        Value::Int8(n) => mysql_async::Value::from(*n),
        Value::Int16(n) => mysql_async::Value::from(*n),
        Value::Int32(n) => mysql_async::Value::from(*n),
        Value::Int64(n) => mysql_async::Value::from(*n),
        Value::UInt64(n) => mysql_async::Value::from(*n),
        Value::Float32(n) => mysql_async::Value::from(*n),
        Value::Float64(n) => mysql_async::Value::from(*n),
        Value::Decimal(d) => mysql_async::Value::from(d.to_string()),
        Value::String(s) => mysql_async::Value::from(s.clone()),
        Value::Bytes(b) => mysql_async::Value::from(b.clone()),
        Value::Date(d) => datetime_to_sql(&d.and_time(NaiveTime::MIN)),
        Value::Time(t) => mysql_async::Value::Time(
            false,
            0,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
            t.nanosecond() / 1000,
        ),
        Value::DateTime(dt) => datetime_to_sql(dt),
        Value::DateTimeTz(dt) => datetime_to_sql(&dt.naive_utc()),
        Value::Uuid(u) => mysql_async::Value::from(u.to_string()),
        Value::Json(j) => mysql_async::Value::from(j.to_string()),
        Value::Interval(micros) => interval_to_sql(*micros),
    }
}

fn datetime_to_sql(dt: &NaiveDateTime) -> mysql_async::Value {
    mysql_async::Value::Date(
        dt.year() as u16,
        dt.month() as u8,
        dt.day() as u8,
        dt.hour() as u8,
        dt.minute() as u8,
        dt.second() as u8,
        dt.nanosecond() / 1000,
    )
}

fn interval_to_sql(micros: i64) -> mysql_async::Value {
    let neg = micros < 0;
    let abs = micros.unsigned_abs();
    let total_secs = abs / 1_000_000;
    let days = (total_secs / 86_400) as u32;
    mysql_async::Value::Time(
        neg,
        days,
        ((total_secs % 86_400) / 3600) as u8,
        ((total_secs % 3600) / 60) as u8,
        (total_secs % 60) as u8,
        (abs % 1_000_000) as u32,
    )
}

/// Convert a MySQL value to a Value using the column's declared type
fn mysql_value_to_value(val: mysql_async::Value, column: &mysql_async::Column) -> Value {
    match val {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Bytes(b) => decode_bytes(b, column),
        mysql_async::Value::Int(n) => Value::Int64(n),
        mysql_async::Value::UInt(n) => Value::UInt64(n),
        mysql_async::Value::Float(f) => Value::Float32(f),
        mysql_async::Value::Double(d) => Value::Float64(d),
        mysql_async::Value::Date(year, month, day, hour, min, sec, micro) => {
            let Some(date) = NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))
            else {
                // Zero dates ('0000-00-00') have no calendar representation
                return Value::Null;
            };
            if column.column_type() == ColumnType::MYSQL_TYPE_DATE {
                return Value::Date(date);
            }
            NaiveTime::from_hms_micro_opt(u32::from(hour), u32::from(min), u32::from(sec), micro)
                .map(|time| Value::DateTime(NaiveDateTime::new(date, time)))
                .unwrap_or(Value::Null)
        }
        mysql_async::Value::Time(neg, days, hour, min, sec, micro) => {
            if !neg && days == 0 {
                if let Some(time) =
                    NaiveTime::from_hms_micro_opt(u32::from(hour), u32::from(min), u32::from(sec), micro)
                {
                    return Value::Time(time);
                }
            }
            let secs = i64::from(days) * 86_400
                + i64::from(hour) * 3600
                + i64::from(min) * 60
                + i64::from(sec);
            let micros = secs * 1_000_000 + i64::from(micro);
            Value::Interval(if neg { -micros } else { micros })
        }
    }
}

/// Text-protocol payloads carry DECIMAL, JSON, text and binary columns
fn decode_bytes(bytes: Vec<u8>, column: &mysql_async::Column) -> Value {
    match column.column_type() {
        ColumnType::MYSQL_TYPE_NEWDECIMAL | ColumnType::MYSQL_TYPE_DECIMAL => {
            match std::str::from_utf8(&bytes).ok().map(Decimal::from_str) {
                Some(Ok(d)) => Value::Decimal(d),
                _ => Value::Bytes(bytes),
            }
        }
        ColumnType::MYSQL_TYPE_JSON => match serde_json::from_slice(&bytes) {
            Ok(json) => Value::Json(json),
            Err(_) => Value::Bytes(bytes),
        },
        _ if column.character_set() == BINARY_CHARSET => Value::Bytes(bytes),
        _ => match String::from_utf8(bytes) {
            Ok(s) => Value::String(s),
            Err(e) => Value::Bytes(e.into_bytes()),
        },
    }
}

/// Map a driver error onto the shared error taxonomy
fn classify(err: mysql_async::Error, sql: &str) -> Error {
    if let mysql_async::Error::Server(server) = &err {
        let (code, message) = (server.code, server.message.clone());
        return match code {
            1205 => Error::lock_wait(message),
            1213 => Error::Deadlock,
            1044 | 1045 | 1698 => Error::authentication(message),
            1146 => Error::table_not_found(message),
            1049 | 1054 => Error::schema(message),
            // max_execution_time exceeded / query interrupted
            3024 | 1317 => Error::timeout(message),
            // too many connections, server shutdown, gone away, lost during query
            1040 | 1053 | 2006 | 2013 => Error::connection_with_source(message, err),
            _ => Error::Query {
                message,
                sql: Some(sql.to_string()),
                source: Some(Box::new(err)),
            },
        };
    }

    match err {
        mysql_async::Error::Io(_) | mysql_async::Error::Driver(_) => {
            Error::connection_with_source("MySQL connection failure", err)
        }
        mysql_async::Error::Url(_) => Error::config(err.to_string()),
        other => Error::Query {
            message: other.to_string(),
            sql: Some(sql.to_string()),
            source: Some(Box::new(other)),
        },
    }
}

/// MySQL connection implementation
pub struct MySqlConnection {
    conn: Mutex<Option<Conn>>,
    database: String,
    query_timeout: Option<Duration>,
}

impl MySqlConnection {
    /// Get the database name this connection is connected to
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Wrap an existing driver connection
    pub fn new(conn: Conn, database: String) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            database,
            query_timeout: None,
        }
    }

    /// Create a new connection from configuration
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port)
            .user(Some(config.user.clone()).filter(|u| !u.is_empty()))
            .pass(config.password.clone())
            .db_name(Some(config.database.clone()));

        let endpoint = config.redacted_url("mysql");
        let connect = Conn::new(opts);
        let conn = match config.connect_timeout_ms {
            0 => connect.await.map_err(|e| classify(e, ""))?,
            ms => tokio::time::timeout(Duration::from_millis(ms), connect)
                .await
                .map_err(|_| {
                    Error::connection(format!("timed out connecting to {endpoint} after {ms}ms"))
                })?
                .map_err(|e| classify(e, ""))?,
        };
        tracing::debug!(endpoint = %endpoint, "Connected to MySQL");

        let mut connection = Self::new(conn, config.database.clone());
        connection.query_timeout =
            Some(config.query_timeout_ms).filter(|ms| *ms > 0).map(Duration::from_millis);
        Ok(connection)
    }

    async fn take_conn(&self) -> Result<Conn> {
        self.conn
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::connection("connection not available"))
    }

    async fn put_conn(&self, conn: Conn) {
        *self.conn.lock().await = Some(conn);
    }

    async fn run(&self, conn: &mut Conn, sql: &str, params: &[Value]) -> Result<Vec<mysql_async::Row>> {
        let mysql_params: Vec<mysql_async::Value> = params.iter().map(value_to_sql).collect();
        let exec = conn.exec(sql, mysql_params);
        match self.query_timeout {
            Some(limit) => tokio::time::timeout(limit, exec)
                .await
                .map_err(|_| Error::timeout(format!("query exceeded {}ms", limit.as_millis())))?
                .map_err(|e| classify(e, sql)),
            None => exec.await.map_err(|e| classify(e, sql)),
        }
    }
}

#[async_trait]
impl Connection for MySqlConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut conn = self.take_conn().await?;

        let result = match self.run(&mut conn, sql, params).await {
            Ok(rows) => rows,
            Err(e) => {
                // A timed out or broken session is dropped rather than reused
                if !e.invalidates_connection() {
                    self.put_conn(conn).await;
                }
                return Err(e);
            }
        };
        self.put_conn(conn).await;

        let rows = result
            .into_iter()
            .map(|mut row| {
                let columns = row.columns();
                let names: Vec<String> = columns.iter().map(|c| c.name_str().to_string()).collect();
                let values: Vec<Value> = columns
                    .iter()
                    .enumerate()
                    .map(|(i, column)| {
                        let val = row.take(i).unwrap_or(mysql_async::Value::NULL);
                        mysql_value_to_value(val, column)
                    })
                    .collect();
                Row::new(names, values)
            })
            .collect();
        Ok(rows)
    }

    async fn is_valid(&self) -> bool {
        match self.conn.lock().await.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.disconnect().await.map_err(|e| classify(e, ""))?;
        }
        Ok(())
    }
}

/// MySQL connection factory
#[derive(Debug, Default)]
pub struct MySqlConnectionFactory;

impl MySqlConnectionFactory {
    /// Create a new MySQL connection factory
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionFactory for MySqlConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let conn = MySqlConnection::connect(config).await?;
        Ok(Box::new(conn))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }
}

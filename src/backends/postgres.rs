//! PostgreSQL backend implementation
//!
//! A [`PgBackend`] wraps a deadpool-postgres pool. Transactions are plain
//! `BEGIN`/`COMMIT`/`ROLLBACK` statements on a pooled connection that the
//! [`Transaction`](crate::core::Transaction) handle keeps borrowed in between.

use crate::core::{
    config::PoolConfig,
    convert::{ConverterRegistry, WireType},
    database::Database,
    error::{DatabaseError, Result},
    executor::{Backend, PoolStatus},
    value::{Column, DatabaseValue, RawResultSet},
    worker::Worker,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use deadpool_postgres::{
    Config, ManagerConfig, Object, Pool, PoolConfig as DeadpoolConfig, PoolError, RecyclingMethod,
    Runtime, TimeoutType,
};
use futures_util::{pin_mut, TryStreamExt};
use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, Kind, ToSql, Type};
use tokio_postgres::{NoTls, Row};
use tokio_util::bytes::BytesMut;
use tracing::{debug, info, warn};

/// Pool of PostgreSQL connections driven by a dedicated worker
pub type PgDatabase = Database<Worker<PgBackend>>;

/// Connection borrowed from the pool for the lifetime of a transaction
#[derive(Clone)]
pub struct PgConnection(Arc<Object>);

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection").finish_non_exhaustive()
    }
}

/// deadpool-postgres backed [`Backend`]
pub struct PgBackend {
    pool: Pool,
    operation_timeout: Duration,
    acquire_timeout: Duration,
}

impl PgBackend {
    /// Build the pool; connections are opened lazily on first use
    pub fn new(config: &PoolConfig) -> Result<Self> {
        config.validate()?;

        let mut cfg = Config::new();
        cfg.host = Some(config.hostname.clone());
        cfg.port = Some(config.port);
        cfg.dbname = Some(config.database.clone());
        cfg.user = Some(config.username.clone());
        cfg.password = config.password.clone();
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_config = DeadpoolConfig::new(config.pool_size);
        pool_config.timeouts.wait = Some(config.acquire_timeout);
        pool_config.timeouts.create = Some(config.acquire_timeout);
        pool_config.timeouts.recycle = Some(config.acquire_timeout);
        cfg.pool = Some(pool_config);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::invalid_config(e.to_string()))?;

        Ok(Self {
            pool,
            operation_timeout: config.operation_timeout,
            acquire_timeout: config.acquire_timeout,
        })
    }

    async fn acquire(&self) -> Result<Object> {
        self.pool.get().await.map_err(|e| self.pool_error(e))
    }

    fn pool_error(&self, err: PoolError) -> DatabaseError {
        match err {
            PoolError::Timeout(TimeoutType::Wait) => {
                let status = self.pool.status();
                DatabaseError::pool_exhausted(
                    status.size.saturating_sub(status.available),
                    status.max_size,
                )
            }
            // Opening or recycling a connection took too long
            PoolError::Timeout(TimeoutType::Create | TimeoutType::Recycle) => {
                DatabaseError::connection_timeout(self.acquire_timeout.as_millis() as u64)
            }
            PoolError::Closed => DatabaseError::PoolClosed,
            PoolError::Backend(e) => DatabaseError::connection(e.to_string()),
            other => DatabaseError::connection(other.to_string()),
        }
    }

    /// Bound `work` by the configured operation timeout
    async fn timed<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.operation_timeout, work)
            .await
            .map_err(|_| DatabaseError::query_timeout(self.operation_timeout.as_millis() as u64))?
    }

    /// Run `statement` and hand the connection back
    ///
    /// A connection whose transaction could not be closed cleanly is detached
    /// from the pool instead of being recycled.
    async fn finish(&self, conn: PgConnection, statement: &'static str) -> Result<()> {
        let result = self
            .timed(async { Ok(conn.0.batch_execute(statement).await?) })
            .await;
        if let Err(e) = &result {
            warn!(statement, error = %e, "discarding connection after failed transaction end");
            detach(conn);
        }
        result
    }
}

/// Remove a connection from the pool instead of recycling it
///
/// Used whenever the connection may still be inside an open transaction.
fn detach(conn: PgConnection) {
    if let Ok(object) = Arc::try_unwrap(conn.0) {
        drop(Object::take(object));
    }
}

async fn run(client: &Object, sql: &str, params: &[DatabaseValue]) -> Result<RawResultSet> {
    let statement = client.prepare_cached(sql).await?;
    let columns = statement
        .columns()
        .iter()
        .map(|c| Column::new(c.name(), WireType::from_oid(c.type_().oid())))
        .collect::<Vec<_>>();

    let stream = client.query_raw(&statement, params.iter()).await?;
    pin_mut!(stream);

    let mut rows = Vec::new();
    while let Some(row) = stream.try_next().await? {
        rows.push(row_to_values(&row)?);
    }
    let updated = stream.rows_affected().unwrap_or(0);

    Ok(RawResultSet {
        updated,
        columns,
        rows,
    })
}

fn row_to_values(row: &Row) -> Result<Vec<DatabaseValue>> {
    (0..row.len()).map(|idx| read_value(row, idx)).collect()
}

/// Convert one column of a tokio_postgres Row into a raw value
fn read_value(row: &Row, idx: usize) -> Result<DatabaseValue> {
    let ty = row.columns()[idx].type_();
    let value = match WireType::from_oid(ty.oid()) {
        WireType::Bool => row.try_get::<_, Option<bool>>(idx)?.map(DatabaseValue::Bool),
        WireType::Int2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| DatabaseValue::Int(i32::from(v))),
        WireType::Int4 => row.try_get::<_, Option<i32>>(idx)?.map(DatabaseValue::Int),
        WireType::Int8 => row.try_get::<_, Option<i64>>(idx)?.map(DatabaseValue::Long),
        WireType::Float4 => row.try_get::<_, Option<f32>>(idx)?.map(DatabaseValue::Float),
        WireType::Float8 => row.try_get::<_, Option<f64>>(idx)?.map(DatabaseValue::Double),
        WireType::Text | WireType::Varchar | WireType::Bpchar | WireType::Name => row
            .try_get::<_, Option<String>>(idx)?
            .map(DatabaseValue::String),
        WireType::Bytea => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(DatabaseValue::Bytes),
        WireType::Json | WireType::Jsonb => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(DatabaseValue::Json),
        WireType::Timestamp => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|v| DatabaseValue::Timestamp(Utc.from_utc_datetime(&v).timestamp_micros())),
        WireType::Timestamptz => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|v| DatabaseValue::Timestamp(v.timestamp_micros())),
        WireType::Date => row
            .try_get::<_, Option<NaiveDate>>(idx)?
            .map(|v| DatabaseValue::String(v.to_string())),
        WireType::Time => row
            .try_get::<_, Option<NaiveTime>>(idx)?
            .map(|v| DatabaseValue::String(v.to_string())),
        WireType::Numeric => match row.try_get::<_, Option<WireBytes>>(idx)? {
            Some(raw) => Some(
                decode_numeric(&raw.0)
                    .map(DatabaseValue::String)
                    .ok_or_else(|| DatabaseError::driver_message("malformed numeric value"))?,
            ),
            None => None,
        },
        WireType::Uuid => row
            .try_get::<_, Option<WireBytes>>(idx)?
            .map(|raw| DatabaseValue::String(format_uuid(&raw.0))),
        WireType::Other(_) => {
            let raw = row.try_get::<_, Option<WireBytes>>(idx)?;
            match ty.kind() {
                // Enum labels travel as UTF-8 text
                Kind::Enum(_) => raw.map(|raw| {
                    DatabaseValue::String(String::from_utf8_lossy(&raw.0).into_owned())
                }),
                _ => raw.map(|raw| DatabaseValue::Bytes(raw.0)),
            }
        }
    };
    Ok(value.unwrap_or(DatabaseValue::Null))
}

/// Undecoded binary column value, left for a registered reader
struct WireBytes(Vec<u8>);

impl<'a> FromSql<'a> for WireBytes {
    fn from_sql(_: &Type, raw: &'a [u8]) -> std::result::Result<Self, Box<dyn Error + Sync + Send>> {
        Ok(WireBytes(raw.to_vec()))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

/// Render a binary `numeric` as decimal text
fn decode_numeric(raw: &[u8]) -> Option<String> {
    let word = |i: usize| -> Option<u16> { Some(u16::from_be_bytes([*raw.get(i)?, *raw.get(i + 1)?])) };
    let ndigits = word(0)? as usize;
    let weight = word(2)? as i16;
    let sign = word(4)?;
    let dscale = word(6)? as usize;

    match sign {
        0xC000 => return Some("NaN".to_string()),
        0xD000 => return Some("Infinity".to_string()),
        0xF000 => return Some("-Infinity".to_string()),
        _ => {}
    }

    let digits = (0..ndigits)
        .map(|i| word(8 + 2 * i))
        .collect::<Option<Vec<_>>>()?;
    let group = |pos: i32| -> u16 {
        if pos < 0 {
            0
        } else {
            digits.get(pos as usize).copied().unwrap_or(0)
        }
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&group(0).to_string());
        for pos in 1..=i32::from(weight) {
            out.push_str(&format!("{:04}", group(pos)));
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut pos = i32::from(weight) + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", group(pos)));
            pos += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }
    Some(out)
}

fn format_uuid(raw: &[u8]) -> String {
    let hex = raw.iter().map(|b| format!("{:02x}", b)).collect::<String>();
    if hex.len() != 32 {
        return hex;
    }
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Parameter encoding, widening or narrowing integers and floats to the column type
impl ToSql for DatabaseValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            DatabaseValue::Null => Ok(IsNull::Yes),
            DatabaseValue::Bool(v) => v.to_sql_checked(ty, out),
            DatabaseValue::Int(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT8 => i64::from(*v).to_sql(ty, out),
                Type::FLOAT8 => f64::from(*v).to_sql(ty, out),
                _ => v.to_sql_checked(ty, out),
            },
            DatabaseValue::Long(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                _ => v.to_sql_checked(ty, out),
            },
            DatabaseValue::Float(v) => match *ty {
                Type::FLOAT8 => f64::from(*v).to_sql(ty, out),
                _ => v.to_sql_checked(ty, out),
            },
            DatabaseValue::Double(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                _ => v.to_sql_checked(ty, out),
            },
            DatabaseValue::String(v) => v.as_str().to_sql_checked(ty, out),
            DatabaseValue::Bytes(v) => v.as_slice().to_sql_checked(ty, out),
            DatabaseValue::Timestamp(_) => {
                let at = self
                    .as_datetime()
                    .ok_or("timestamp out of range")?;
                match *ty {
                    Type::TIMESTAMP => at.naive_utc().to_sql(ty, out),
                    _ => at.to_sql_checked(ty, out),
                }
            }
            DatabaseValue::Json(v) => v.to_sql_checked(ty, out),
            DatabaseValue::Custom(v) => {
                Err(format!("custom value of type {} reached the driver", v.type_name()).into())
            }
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

#[async_trait]
impl Backend for PgBackend {
    type Connection = PgConnection;

    async fn query(
        &self,
        conn: Option<PgConnection>,
        sql: &str,
        params: &[DatabaseValue],
    ) -> Result<RawResultSet> {
        self.timed(async {
            match conn {
                Some(conn) => run(&conn.0, sql, params).await,
                None => {
                    let client = self.acquire().await?;
                    run(&client, sql, params).await
                }
            }
        })
        .await
    }

    async fn begin(&self) -> Result<PgConnection> {
        let conn = PgConnection(Arc::new(self.timed(self.acquire()).await?));
        let started = self
            .timed(async { Ok(conn.0.batch_execute("BEGIN").await?) })
            .await;
        match started {
            Ok(()) => {
                debug!("transaction connection borrowed");
                Ok(conn)
            }
            Err(e) => {
                warn!(error = %e, "discarding connection after failed BEGIN");
                detach(conn);
                Err(e)
            }
        }
    }

    async fn commit(&self, conn: PgConnection) -> Result<()> {
        self.finish(conn, "COMMIT").await
    }

    async fn rollback(&self, conn: PgConnection) -> Result<()> {
        self.finish(conn, "ROLLBACK").await
    }

    fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            size: status.size,
            available: status.available,
            max_size: status.max_size,
        }
    }

    fn close(&self) {
        self.pool.close();
    }
}

impl Database<Worker<PgBackend>> {
    /// Open a PostgreSQL pool with its own worker thread
    pub fn open(config: &PoolConfig, registry: ConverterRegistry) -> Result<Self> {
        let backend = PgBackend::new(config)?;
        info!(
            host = %config.hostname,
            port = config.port,
            database = %config.database,
            pool_size = config.pool_size,
            "opening PostgreSQL pool"
        );
        Ok(Database::new(Worker::spawn(backend)?, registry))
    }
}

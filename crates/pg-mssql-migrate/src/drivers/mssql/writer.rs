//! SQL Server target writer.
//!
//! Each batch is written inside one explicit transaction with `XACT_ABORT`
//! on, so any failing statement rolls the whole batch back.

use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::NaiveTime;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

use crate::config::TargetConfig;
use crate::core::traits::{DdlStatement, TargetWriter, WriteTarget};
use crate::core::value::{Row, SqlNullType, SqlValue};
use crate::dialect::{Dialect, MssqlDialect};
use crate::error::{MigrateError, Result};

/// Maximum TDS packet size.
const TDS_MAX_PACKET_SIZE: u32 = 32767;

const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(1800);

type MssqlClient = Client<Compat<TcpStream>>;

/// bb8 manager for tiberius connections.
pub struct TiberiusConnectionManager {
    config: TargetConfig,
}

impl TiberiusConnectionManager {
    fn new(config: TargetConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.application_name("pg-mssql-migrate");
        config.authentication(AuthMethod::sql_server(
            &self.config.user,
            &self.config.password,
        ));

        if self.config.encrypt {
            config.encryption(EncryptionLevel::Required);
            if self.config.trust_server_cert {
                config.trust_cert();
            }
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config.packet_size(TDS_MAX_PACKET_SIZE);
        config
    }

    fn io_error(e: std::io::Error, context: &str) -> tiberius::error::Error {
        tiberius::error::Error::Io {
            kind: e.kind(),
            message: format!("{}: {}", context, e),
        }
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = MssqlClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| Self::io_error(e, "connecting"))?;
        tcp.set_nodelay(true).ok();

        // Keepalive has to be set on the raw socket before the TDS handshake.
        let std_tcp = tcp
            .into_std()
            .map_err(|e| Self::io_error(e, "configuring socket"))?;
        let socket = socket2::Socket::from(std_tcp);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(TCP_KEEPALIVE_INTERVAL)
            .with_interval(TCP_KEEPALIVE_INTERVAL);
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive on SQL Server connection: {}", e);
        }
        let std_tcp: std::net::TcpStream = socket.into();
        std_tcp.set_nonblocking(true).ok();
        let tcp = TcpStream::from_std(std_tcp).map_err(|e| Self::io_error(e, "converting socket"))?;

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Convert a row value into a bound parameter.
///
/// NULLs keep their type so `CAST(@Pn AS ...)` receives a matching TDS type.
fn to_param(value: &SqlValue) -> Box<dyn ToSql> {
    match value {
        SqlValue::Null(t) => match t {
            SqlNullType::Bool => Box::new(Option::<bool>::None),
            SqlNullType::I16 => Box::new(Option::<i16>::None),
            SqlNullType::I32 => Box::new(Option::<i32>::None),
            SqlNullType::I64 => Box::new(Option::<i64>::None),
            SqlNullType::F32 => Box::new(Option::<f32>::None),
            SqlNullType::F64 => Box::new(Option::<f64>::None),
            SqlNullType::String => Box::new(Option::<String>::None),
            SqlNullType::Bytes => Box::new(Option::<Vec<u8>>::None),
            SqlNullType::Uuid => Box::new(Option::<uuid::Uuid>::None),
            SqlNullType::Decimal => Box::new(Option::<rust_decimal::Decimal>::None),
            SqlNullType::DateTime | SqlNullType::Date => {
                Box::new(Option::<chrono::NaiveDateTime>::None)
            }
            SqlNullType::DateTimeOffset => {
                Box::new(Option::<chrono::DateTime<chrono::FixedOffset>>::None)
            }
            SqlNullType::Time => Box::new(Option::<NaiveTime>::None),
        },
        SqlValue::Bool(v) => Box::new(*v),
        SqlValue::I16(v) => Box::new(*v),
        SqlValue::I32(v) => Box::new(*v),
        SqlValue::I64(v) => Box::new(*v),
        SqlValue::F32(v) => Box::new(*v),
        SqlValue::F64(v) => Box::new(*v),
        SqlValue::Text(v) => Box::new(v.clone()),
        SqlValue::Bytes(v) => Box::new(v.clone()),
        SqlValue::Uuid(v) => Box::new(*v),
        SqlValue::Decimal(v) => Box::new(*v),
        SqlValue::DateTime(v) => Box::new(*v),
        SqlValue::DateTimeOffset(v) => Box::new(*v),
        // datetime2 binding; CAST narrows to date on the server.
        SqlValue::Date(v) => Box::new(v.and_time(NaiveTime::MIN)),
        SqlValue::Time(v) => Box::new(*v),
    }
}

/// Statement for one chunk, wrapped in `IDENTITY_INSERT` when the table has
/// an identity column.
fn chunk_statement(dialect: &MssqlDialect, target: WriteTarget<'_>, rows: usize, upsert: bool) -> String {
    let sql = if upsert {
        dialect.build_upsert(target.schema, target.table, rows)
    } else {
        dialect.build_insert(target.schema, target.table, rows)
    };
    let body = sql.trim_end().trim_end_matches(';');

    match MssqlDialect::identity_column(target.table) {
        Some(_) => {
            let qualified = dialect.qualify(target.schema, &target.table.name);
            format!(
                "SET IDENTITY_INSERT {q} ON;\n{body};\nSET IDENTITY_INSERT {q} OFF;",
                q = qualified,
                body = body
            )
        }
        None => format!("{};", body),
    }
}

/// SQL Server target writer backed by a bb8 pool.
pub struct MssqlWriter {
    pool: Pool<TiberiusConnectionManager>,
    dialect: MssqlDialect,
}

impl MssqlWriter {
    /// Create a pool and check that the target answers.
    pub async fn new(config: &TargetConfig, max_conns: usize) -> Result<Self> {
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(u32::try_from(max_conns.max(1)).unwrap_or(u32::MAX))
            .min_idle(Some(1))
            .connection_timeout(POOL_CONNECTION_TIMEOUT)
            .idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .max_lifetime(Some(POOL_MAX_LIFETIME))
            .test_on_check_out(true)
            .build(manager)
            .await
            .map_err(|e| MigrateError::pool(e, "creating SQL Server target pool"))?;

        let writer = Self {
            pool,
            dialect: MssqlDialect::new(),
        };
        writer
            .conn("testing SQL Server target connection")
            .await?
            .simple_query("SELECT 1")
            .await?
            .into_row()
            .await?;

        info!(
            "Connected to SQL Server target: {}:{}/{}",
            config.host, config.port, config.database
        );
        Ok(writer)
    }

    async fn conn(&self, context: &str) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, context))
    }

    async fn write_chunks(
        &self,
        conn: &mut MssqlClient,
        target: WriteTarget<'_>,
        rows: &[Row],
        upsert: bool,
    ) -> Result<u64> {
        let per_statement = self.dialect.rows_per_statement(target.table.columns.len());
        let mut written = 0u64;

        for chunk in rows.chunks(per_statement) {
            let sql = chunk_statement(&self.dialect, target, chunk.len(), upsert);
            let params: Vec<Box<dyn ToSql>> = chunk.iter().flatten().map(to_param).collect();
            let refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
            conn.execute(sql, &refs).await?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }

    async fn write_batch(&self, target: WriteTarget<'_>, rows: &[Row], upsert: bool) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn("writing batch").await?;
        conn.simple_query("SET XACT_ABORT ON; BEGIN TRANSACTION;")
            .await?
            .into_results()
            .await?;

        match self.write_chunks(&mut conn, target, rows, upsert).await {
            Ok(written) => {
                conn.simple_query("COMMIT TRANSACTION;")
                    .await?
                    .into_results()
                    .await?;
                debug!(
                    "{}.{}: committed {} rows",
                    target.schema, target.table.name, written
                );
                Ok(written)
            }
            Err(e) => {
                let rollback = async {
                    conn.simple_query("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION;")
                        .await?
                        .into_results()
                        .await
                };
                if let Err(rb) = rollback.await {
                    warn!(
                        "{}.{}: rollback failed: {}",
                        target.schema, target.table.name, rb
                    );
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl TargetWriter for MssqlWriter {
    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    async fn execute_ddl(&self, statement: &DdlStatement) -> Result<()> {
        let mut conn = self.conn("executing DDL").await?;
        conn.simple_query(statement.sql.as_str())
            .await?
            .into_results()
            .await?;
        debug!("{} {}: applied", statement.table, statement.object);
        Ok(())
    }

    async fn upsert_batch(&self, target: WriteTarget<'_>, rows: &[Row]) -> Result<u64> {
        self.write_batch(target, rows, true).await
    }

    async fn insert_batch(&self, target: WriteTarget<'_>, rows: &[Row]) -> Result<u64> {
        self.write_batch(target, rows, false).await
    }

    async fn truncate_table(&self, schema: &str, table: &str) -> Result<()> {
        let qualified = self.dialect.qualify(schema, table);
        let mut conn = self.conn("truncating table").await?;

        let truncated = async {
            conn.simple_query(format!("TRUNCATE TABLE {};", qualified))
                .await?
                .into_results()
                .await
        }
        .await;

        // TRUNCATE is refused while a foreign key references the table.
        if let Err(e) = truncated {
            warn!("TRUNCATE {} failed ({}), falling back to DELETE", qualified, e);
            conn.simple_query(format!("DELETE FROM {};", qualified))
                .await?
                .into_results()
                .await?;
        }
        Ok(())
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<u64> {
        let mut conn = self.conn("counting rows").await?;
        let sql = format!("SELECT COUNT_BIG(*) FROM {};", self.dialect.qualify(schema, table));
        let row = conn.simple_query(sql).await?.into_row().await?;
        let count = match row {
            Some(row) => row.try_get::<i64, _>(0)?.unwrap_or(0),
            None => 0,
        };
        Ok(count.max(0) as u64)
    }

    fn db_type(&self) -> &str {
        "mssql"
    }
}

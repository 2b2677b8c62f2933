//! PostgreSQL source reader.
//!
//! Catalog queries go through `pg_catalog` so partitions, extension members
//! and internal triggers can be filtered out. Rows are streamed per batch and
//! decoded according to the column's source type.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::{pin_mut, TryStreamExt};
use tokio_postgres::types::ToSql;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use super::query::{build_select, decode_row, qualify, Decode};
use crate::config::SourceConfig;
use crate::core::schema::{
    qualified_name, ArtifactDescriptor, ArtifactKind, ColumnDescriptor, ForeignKeyDescriptor,
    ForeignKeyTarget, IndexDescriptor, PrimaryKeyDescriptor, SourceType,
};
use crate::core::traits::{BatchRequest, SourceReader};
use crate::core::value::Row;
use crate::drivers::common::SslMode;
use crate::error::{MigrateError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const LIST_TABLES: &str = r#"
    SELECT c.relname::text
    FROM pg_catalog.pg_class c
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1
      AND c.relkind IN ('r', 'p')
      AND NOT c.relispartition
    ORDER BY c.relname
"#;

const COLUMNS: &str = r#"
    SELECT
        c.column_name::text,
        CASE WHEN t.typtype = 'e' THEN 'enum' ELSE c.udt_name::text END,
        c.character_maximum_length::int4,
        CASE
            WHEN c.udt_name = 'numeric' THEN c.numeric_precision
            WHEN c.udt_name IN ('time', 'timetz', 'timestamp', 'timestamptz', 'interval')
                THEN c.datetime_precision
        END::int4,
        CASE WHEN c.udt_name = 'numeric' THEN c.numeric_scale END::int4,
        c.is_nullable = 'YES',
        c.column_default::text,
        (a.attidentity IN ('a', 'd') OR COALESCE(c.column_default::text, '') LIKE 'nextval(%'),
        c.ordinal_position::int4
    FROM information_schema.columns c
    JOIN pg_catalog.pg_namespace n ON n.nspname = c.table_schema::text
    JOIN pg_catalog.pg_class cl ON cl.relnamespace = n.oid AND cl.relname = c.table_name::text
    JOIN pg_catalog.pg_attribute a ON a.attrelid = cl.oid AND a.attname = c.column_name::text
    JOIN pg_catalog.pg_type t ON t.oid = a.atttypid
    WHERE c.table_schema::text = $1 AND c.table_name::text = $2
    ORDER BY c.ordinal_position
"#;

const PRIMARY_KEY: &str = r#"
    SELECT
        con.conname::text,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_catalog.pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
            ORDER BY k.ord
        )
    FROM pg_catalog.pg_constraint con
    JOIN pg_catalog.pg_class cl ON cl.oid = con.conrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = cl.relnamespace
    WHERE con.contype = 'p' AND n.nspname = $1 AND cl.relname = $2
"#;

// Expression and partial indexes have no target equivalent and are skipped.
const INDEXES: &str = r#"
    SELECT
        ic.relname::text,
        i.indisunique,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_catalog.pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum
            WHERE k.ord <= i.indnkeyatts
            ORDER BY k.ord
        )
    FROM pg_catalog.pg_index i
    JOIN pg_catalog.pg_class ic ON ic.oid = i.indexrelid
    JOIN pg_catalog.pg_class cl ON cl.oid = i.indrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = cl.relnamespace
    WHERE n.nspname = $1 AND cl.relname = $2
      AND NOT i.indisprimary
      AND i.indpred IS NULL
      AND NOT (0 = ANY (i.indkey::int2[]))
    ORDER BY ic.relname
"#;

const FOREIGN_KEYS: &str = r#"
    SELECT
        con.conname::text,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_catalog.pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
            ORDER BY k.ord
        ),
        rn.nspname::text,
        rc.relname::text,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_catalog.pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
            ORDER BY k.ord
        ),
        CASE con.confdeltype
            WHEN 'c' THEN 'CASCADE' WHEN 'n' THEN 'SET_NULL' WHEN 'd' THEN 'SET_DEFAULT'
            WHEN 'r' THEN 'RESTRICT' ELSE 'NO_ACTION'
        END,
        CASE con.confupdtype
            WHEN 'c' THEN 'CASCADE' WHEN 'n' THEN 'SET_NULL' WHEN 'd' THEN 'SET_DEFAULT'
            WHEN 'r' THEN 'RESTRICT' ELSE 'NO_ACTION'
        END
    FROM pg_catalog.pg_constraint con
    JOIN pg_catalog.pg_class cl ON cl.oid = con.conrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = cl.relnamespace
    JOIN pg_catalog.pg_class rc ON rc.oid = con.confrelid
    JOIN pg_catalog.pg_namespace rn ON rn.oid = rc.relnamespace
    WHERE con.contype = 'f' AND n.nspname = $1 AND cl.relname = $2
    ORDER BY con.conname
"#;

const VIEWS: &str = r#"
    SELECT
        c.relname::text,
        c.relkind = 'm',
        pg_catalog.pg_get_viewdef(c.oid, true),
        ARRAY(
            SELECT DISTINCT dn.nspname::text || '.' || dc.relname::text
            FROM pg_catalog.pg_rewrite r
            JOIN pg_catalog.pg_depend d
                ON d.objid = r.oid AND d.classid = 'pg_catalog.pg_rewrite'::regclass
            JOIN pg_catalog.pg_class dc ON dc.oid = d.refobjid
            JOIN pg_catalog.pg_namespace dn ON dn.oid = dc.relnamespace
            WHERE r.ev_class = c.oid
              AND d.refclassid = 'pg_catalog.pg_class'::regclass
              AND d.refobjid <> c.oid
            ORDER BY 1
        )
    FROM pg_catalog.pg_class c
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1 AND c.relkind IN ('v', 'm')
    ORDER BY c.relname
"#;

const ROUTINES: &str = r#"
    SELECT
        p.proname::text,
        p.prokind = 'p',
        pg_catalog.pg_get_function_identity_arguments(p.oid),
        pg_catalog.pg_get_functiondef(p.oid)
    FROM pg_catalog.pg_proc p
    JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace
    WHERE n.nspname = $1
      AND p.prokind IN ('f', 'p')
      AND NOT EXISTS (
          SELECT 1 FROM pg_catalog.pg_depend d
          WHERE d.objid = p.oid
            AND d.classid = 'pg_catalog.pg_proc'::regclass
            AND d.deptype = 'e'
      )
    ORDER BY p.proname, 3
"#;

const TRIGGERS: &str = r#"
    SELECT t.tgname::text, c.relname::text, pg_catalog.pg_get_triggerdef(t.oid, true)
    FROM pg_catalog.pg_trigger t
    JOIN pg_catalog.pg_class c ON c.oid = t.tgrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1 AND NOT t.tgisinternal
    ORDER BY c.relname, t.tgname
"#;

/// PostgreSQL source reader backed by a deadpool connection pool.
pub struct PostgresReader {
    pool: Pool,
}

impl PostgresReader {
    /// Create a pool and check that the source answers.
    pub async fn new(config: &SourceConfig, max_conns: usize) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config
            .host(&config.host)
            .port(config.port)
            .dbname(&config.database)
            .user(&config.user)
            .password(&config.password)
            .application_name("pg-mssql-migrate")
            .connect_timeout(CONNECT_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let ssl_mode = SslMode::parse(&config.ssl_mode)?;
        let pool = match ssl_mode.connector() {
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr).max_size(max_conns.max(1)).build()
            }
            Some(tls) => {
                let mgr = Manager::from_config(pg_config, tls, mgr_config);
                Pool::builder(mgr).max_size(max_conns.max(1)).build()
            }
        }
        .map_err(|e| MigrateError::pool(e, "creating PostgreSQL source pool"))?;

        let reader = Self { pool };
        reader
            .client("testing PostgreSQL source connection")
            .await?
            .simple_query("SELECT 1")
            .await?;

        info!("Connected to PostgreSQL source: {}", config.display_target());
        Ok(reader)
    }

    async fn client(&self, context: &str) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, context))
    }

    async fn views(&self, schema: &str) -> Result<Vec<ArtifactDescriptor>> {
        let client = self.client("loading views").await?;
        let rows = client.query(VIEWS, &[&schema]).await?;

        Ok(rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let materialized: bool = row.get(1);
                let body: String = row.get(2);
                let create = if materialized {
                    "CREATE MATERIALIZED VIEW"
                } else {
                    "CREATE OR REPLACE VIEW"
                };
                ArtifactDescriptor {
                    kind: ArtifactKind::View,
                    schema: schema.to_string(),
                    definition: format!("{} {} AS\n{}", create, qualify(schema, &name), body.trim()),
                    name,
                    signature: None,
                    depends_on: row.get(3),
                }
            })
            .collect())
    }

    async fn routines(&self, schema: &str) -> Result<Vec<ArtifactDescriptor>> {
        let client = self.client("loading routines").await?;
        let rows = client.query(ROUTINES, &[&schema]).await?;

        Ok(rows
            .iter()
            .map(|row| {
                let is_procedure: bool = row.get(1);
                let args: String = row.get(2);
                ArtifactDescriptor {
                    kind: if is_procedure {
                        ArtifactKind::Procedure
                    } else {
                        ArtifactKind::Function
                    },
                    schema: schema.to_string(),
                    name: row.get(0),
                    signature: Some(format!("({})", args)),
                    definition: row.get(3),
                    depends_on: Vec::new(),
                }
            })
            .collect())
    }

    async fn triggers(&self, schema: &str) -> Result<Vec<ArtifactDescriptor>> {
        let client = self.client("loading triggers").await?;
        let rows = client.query(TRIGGERS, &[&schema]).await?;

        Ok(rows
            .iter()
            .map(|row| {
                let table: String = row.get(1);
                let definition: String = row.get(2);
                ArtifactDescriptor {
                    kind: ArtifactKind::Trigger,
                    schema: schema.to_string(),
                    name: row.get(0),
                    signature: Some(format!("({})", table)),
                    definition: format!("{};", definition),
                    depends_on: vec![qualified_name(schema, &table)],
                }
            })
            .collect())
    }
}

#[async_trait]
impl SourceReader for PostgresReader {
    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        let client = self.client("listing tables").await?;
        let rows = client.query(LIST_TABLES, &[&schema]).await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let client = self.client("loading columns").await?;
        let rows = client.query(COLUMNS, &[&schema, &table]).await?;

        let to_u32 = |v: Option<i32>| v.and_then(|n| u32::try_from(n).ok());
        Ok(rows
            .iter()
            .map(|row| {
                let source = SourceType {
                    base: row.get(1),
                    length: to_u32(row.get(2)),
                    precision: to_u32(row.get(3)),
                    scale: to_u32(row.get(4)),
                    nullable: row.get(5),
                    default: row.get(6),
                    is_identity: row.get(7),
                };
                let ordinal: i32 = row.get(8);
                ColumnDescriptor::new(row.get::<_, String>(0), ordinal.max(0) as u32, source)
            })
            .collect())
    }

    async fn primary_key(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Option<PrimaryKeyDescriptor>> {
        let client = self.client("loading primary key").await?;
        let row = client.query_opt(PRIMARY_KEY, &[&schema, &table]).await?;
        Ok(row.map(|r| PrimaryKeyDescriptor {
            name: r.get(0),
            columns: r.get(1),
        }))
    }

    async fn indexes(&self, schema: &str, table: &str) -> Result<Vec<IndexDescriptor>> {
        let client = self.client("loading indexes").await?;
        let rows = client.query(INDEXES, &[&schema, &table]).await?;
        Ok(rows
            .iter()
            .map(|r| IndexDescriptor {
                name: r.get(0),
                is_unique: r.get(1),
                columns: r.get(2),
            })
            .collect())
    }

    async fn foreign_keys(&self, schema: &str, table: &str) -> Result<Vec<ForeignKeyDescriptor>> {
        let client = self.client("loading foreign keys").await?;
        let rows = client.query(FOREIGN_KEYS, &[&schema, &table]).await?;
        Ok(rows
            .iter()
            .map(|r| ForeignKeyDescriptor {
                name: r.get(0),
                columns: r.get(1),
                ref_schema: r.get(2),
                ref_table: r.get(3),
                ref_columns: r.get(4),
                on_delete: r.get(5),
                on_update: r.get(6),
                target: ForeignKeyTarget::Internal,
            })
            .collect())
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<u64> {
        let client = self.client("counting rows").await?;
        let sql = format!("SELECT COUNT(*)::int8 FROM {}", qualify(schema, table));
        let count: i64 = client.query_one(sql.as_str(), &[]).await?.get(0);
        Ok(count.max(0) as u64)
    }

    async fn artifacts(&self, schema: &str) -> Result<Vec<ArtifactDescriptor>> {
        let mut artifacts = self.views(schema).await?;
        artifacts.extend(self.routines(schema).await?);
        artifacts.extend(self.triggers(schema).await?);
        debug!("{}: {} artifacts", schema, artifacts.len());
        Ok(artifacts)
    }

    async fn read_batch(&self, request: BatchRequest<'_>) -> Result<Vec<Row>> {
        let sql = build_select(request.table, request.after, request.limit)?;
        let plan: Vec<Decode> = request
            .table
            .columns
            .iter()
            .map(|c| Decode::for_type(&c.source))
            .collect();

        let client = self.client("reading batch").await?;
        let stream = client
            .query_raw(sql.as_str(), std::iter::empty::<&(dyn ToSql + Sync)>())
            .await?;
        pin_mut!(stream);

        let mut rows = Vec::with_capacity(request.limit);
        while let Some(row) = stream.try_next().await? {
            rows.push(decode_row(&row, &plan)?);
        }
        Ok(rows)
    }

    fn db_type(&self) -> &str {
        "postgres"
    }
}

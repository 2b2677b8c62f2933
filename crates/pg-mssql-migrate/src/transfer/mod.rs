//! Checkpointed table copy.
//!
//! A table is copied in batches read in ordering-key order. Each batch is
//! written in one target transaction and the checkpoint advances only after
//! that transaction commits, so an interrupted copy resumes from the last
//! committed boundary. Keyed tables are upserted, which makes replaying a
//! batch harmless. Keyless tables cannot be upserted and restart from an
//! empty target table instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MigrationConfig;
use crate::core::schema::{Boundary, CopyStrategy, KeyValue, TableDescriptor};
use crate::core::status::TableStatus;
use crate::core::traits::{BatchRequest, SourceReader, TargetWriter, WriteTarget};
use crate::core::value::Row;
use crate::error::{MigrateError, Result};
use crate::state::{CheckpointStore, CopyCheckpoint};

/// Exponential backoff for transient batch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            max_retries: config.get_max_retries(),
            base_delay: Duration::from_millis(config.get_retry_base_delay_ms()),
            max_delay: Duration::from_millis(config.get_retry_max_delay_ms()),
        }
    }

    /// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(20);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Copy engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct CopyConfig {
    /// Rows per batch and per target transaction.
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl CopyConfig {
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            batch_size: config.get_batch_size(),
            retry: RetryPolicy::from_config(config),
        }
    }
}

/// Terminal result of copying one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableOutcome {
    /// Qualified source table name.
    pub table: String,
    pub status: TableStatus,
    pub rows_copied: u64,
    pub batches: u64,
    pub retries: u32,
    pub expected_rows: u64,
    /// Copy continued from an earlier checkpoint.
    pub resumed: bool,
    pub elapsed: Duration,
}

/// Copies tables from the source reader to the target writer.
pub struct CopyEngine {
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: CopyConfig,
    rows_transferred: AtomicU64,
}

/// Progress of a copy in flight.
struct CopyRun {
    status: TableStatus,
    checkpoint: CopyCheckpoint,
    retries: u32,
    resumed: bool,
}

impl CopyEngine {
    pub fn new(
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetWriter>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: CopyConfig,
    ) -> Self {
        Self {
            source,
            target,
            checkpoints,
            config,
            rows_transferred: AtomicU64::new(0),
        }
    }

    /// Rows committed by this engine across all tables.
    pub fn rows_transferred(&self) -> u64 {
        self.rows_transferred.load(Ordering::Relaxed)
    }

    /// Copy one mapped table into `target_schema`. Never returns an error:
    /// failures end up in the outcome's status.
    pub async fn copy_table(
        &self,
        table: &TableDescriptor,
        target_schema: &str,
        cancel: &CancellationToken,
    ) -> TableOutcome {
        let name = table.qualified_name();
        let started = Instant::now();
        let mut run = CopyRun {
            status: TableStatus::Pending,
            checkpoint: CopyCheckpoint::new(table.row_count),
            retries: 0,
            resumed: false,
        };

        if let Err(e) = self.copy_batches(table, target_schema, cancel, &mut run).await {
            if matches!(e, MigrateError::Cancelled) {
                warn!("{}: copy cancelled after {} rows", name, run.checkpoint.rows_copied);
            } else {
                error!("{}: copy failed: {}", name, e);
            }
            // Only Pending and Copying reach here, both may fail.
            run.status = TableStatus::failed(&e, run.retries);
        }

        TableOutcome {
            table: name,
            status: run.status,
            rows_copied: run.checkpoint.rows_copied,
            batches: run.checkpoint.batches,
            retries: run.retries,
            expected_rows: table.row_count,
            resumed: run.resumed,
            elapsed: started.elapsed(),
        }
    }

    async fn copy_batches(
        &self,
        table: &TableDescriptor,
        target_schema: &str,
        cancel: &CancellationToken,
        run: &mut CopyRun,
    ) -> Result<()> {
        let name = table.qualified_name();
        let strategy = table.copy_strategy();

        match self.checkpoints.load(&name).await? {
            Some(cp) if cp.complete => {
                info!("{}: already complete ({} rows), skipping copy", name, cp.rows_copied);
                run.checkpoint = cp;
                run.resumed = true;
                let rows = run.checkpoint.rows_copied;
                return run.status.transition(&name, TableStatus::Committed { rows });
            }
            Some(cp) if strategy != CopyStrategy::Keyless => {
                info!(
                    "{}: resuming after {} rows ({} batches)",
                    name, cp.rows_copied, cp.batches
                );
                run.checkpoint = cp;
                run.checkpoint.expected_rows = table.row_count;
                run.resumed = true;
            }
            // Inserts cannot be replayed, so a keyless copy always starts
            // from an empty target table.
            previous => {
                if strategy == CopyStrategy::Keyless {
                    match previous {
                        Some(cp) => warn!(
                            "{}: no primary key, discarding {} partially copied rows and restarting",
                            name, cp.rows_copied
                        ),
                        None => debug!("{}: no primary key, clearing target table", name),
                    }
                    self.target.truncate_table(target_schema, &table.name).await?;
                }
            }
        }

        if strategy == CopyStrategy::KeyedOffset {
            warn!("{}: primary key is not comparable, using offset pagination", name);
        }
        self.checkpoints.save(&name, &run.checkpoint).await?;

        loop {
            if cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }

            let (rows, boundary) = self
                .copy_batch_with_retry(table, target_schema, strategy, cancel, run)
                .await?;

            if rows > 0 {
                if let Some(boundary) = boundary {
                    run.checkpoint.advance(boundary, rows);
                }
                self.checkpoints.save(&name, &run.checkpoint).await?;
                self.rows_transferred.fetch_add(rows, Ordering::Relaxed);

                let next = TableStatus::Copying {
                    batches: run.checkpoint.batches,
                    rows: run.checkpoint.rows_copied,
                };
                run.status.transition(&name, next)?;
                debug!(
                    "{}: batch {} committed, {} rows total",
                    name, run.checkpoint.batches, run.checkpoint.rows_copied
                );
            }

            if (rows as usize) < self.config.batch_size {
                break;
            }
        }

        run.checkpoint.mark_complete();
        self.checkpoints.save(&name, &run.checkpoint).await?;

        let copied = run.checkpoint.rows_copied;
        if copied != table.row_count {
            warn!(
                "{}: copied {} rows but {} were counted at extraction",
                name, copied, table.row_count
            );
        }
        info!("{}: committed {} rows in {} batches", name, copied, run.checkpoint.batches);
        run.status.transition(&name, TableStatus::Committed { rows: copied })
    }

    /// Read and write one batch, retrying transient failures.
    async fn copy_batch_with_retry(
        &self,
        table: &TableDescriptor,
        target_schema: &str,
        strategy: CopyStrategy,
        cancel: &CancellationToken,
        run: &mut CopyRun,
    ) -> Result<(u64, Option<Boundary>)> {
        let name = table.qualified_name();
        let policy = self.config.retry;
        let mut attempt = 0u32;

        loop {
            let result = self
                .copy_batch(table, target_schema, strategy, &run.checkpoint)
                .await;
            match result {
                Ok(done) => return Ok(done),
                Err(e) if e.is_transient() && attempt < policy.max_retries => {
                    attempt += 1;
                    run.retries += 1;
                    let delay = policy.delay(attempt);
                    warn!(
                        "{}: transient failure (attempt {}/{}), retrying in {:?}: {}",
                        name,
                        attempt,
                        policy.max_retries,
                        delay,
                        e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(MigrateError::Cancelled),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn copy_batch(
        &self,
        table: &TableDescriptor,
        target_schema: &str,
        strategy: CopyStrategy,
        checkpoint: &CopyCheckpoint,
    ) -> Result<(u64, Option<Boundary>)> {
        let rows = self
            .source
            .read_batch(BatchRequest {
                table,
                after: checkpoint.boundary.as_ref(),
                limit: self.config.batch_size,
            })
            .await?;

        let last = match rows.last() {
            Some(last) => last,
            None => return Ok((0, None)),
        };
        let boundary = next_boundary(table, strategy, checkpoint, last, rows.len())?;

        let target = WriteTarget {
            schema: target_schema,
            table,
        };
        let written = match strategy {
            CopyStrategy::Keyless => self.target.insert_batch(target, &rows).await?,
            CopyStrategy::Keyset | CopyStrategy::KeyedOffset => {
                self.target.upsert_batch(target, &rows).await?
            }
        };
        if written != rows.len() as u64 {
            return Err(MigrateError::structural(
                table.qualified_name(),
                format!("wrote {} of {} rows", written, rows.len()),
            ));
        }

        Ok((written, Some(boundary)))
    }
}

/// Boundary after a batch whose last row is `last`.
fn next_boundary(
    table: &TableDescriptor,
    strategy: CopyStrategy,
    checkpoint: &CopyCheckpoint,
    last: &Row,
    count: usize,
) -> Result<Boundary> {
    match strategy {
        CopyStrategy::Keyset => {
            let key = table
                .key_positions()
                .into_iter()
                .map(|i| last.get(i).and_then(KeyValue::from_sql_value))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| {
                    MigrateError::structural(
                        table.qualified_name(),
                        "primary key value cannot be used as a resume boundary",
                    )
                })?;
            Ok(Boundary::Key(key))
        }
        CopyStrategy::KeyedOffset | CopyStrategy::Keyless => {
            let done = match checkpoint.boundary {
                Some(Boundary::Offset(n)) => n,
                _ => 0,
            };
            Ok(Boundary::Offset(done + count as u64))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::KeyValue;
    use crate::state::{MemoryCheckpointStore, RunStatus};
    use crate::testing::{mapped, numbered_table, MemorySource, MemoryTarget};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every saved checkpoint.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryCheckpointStore,
        saved: Mutex<Vec<CopyCheckpoint>>,
    }

    #[async_trait]
    impl CheckpointStore for RecordingStore {
        async fn load(&self, table: &str) -> Result<Option<CopyCheckpoint>> {
            self.inner.load(table).await
        }
        async fn save(&self, table: &str, checkpoint: &CopyCheckpoint) -> Result<()> {
            self.saved.lock().unwrap().push(checkpoint.clone());
            self.inner.save(table, checkpoint).await
        }
        async fn clear_all(&self) -> Result<()> {
            self.inner.clear_all().await
        }
        async fn mark_run(&self, status: RunStatus) -> Result<()> {
            self.inner.mark_run(status).await
        }
        fn backend_type(&self) -> &'static str {
            "recording"
        }
    }

    fn config(batch_size: usize) -> CopyConfig {
        CopyConfig {
            batch_size,
            retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        }
    }

    struct Fixture {
        source: Arc<MemorySource>,
        target: Arc<MemoryTarget>,
        store: Arc<RecordingStore>,
        table: TableDescriptor,
    }

    impl Fixture {
        fn new(name: &str, rows: i64) -> Self {
            let (table, data) = numbered_table(name, rows);
            let table = mapped(&table, data.len());
            Self {
                source: Arc::new(MemorySource::new(vec![(table.clone(), data)])),
                target: Arc::new(MemoryTarget::new()),
                store: Arc::new(RecordingStore::default()),
                table,
            }
        }

        fn engine(&self, batch_size: usize) -> CopyEngine {
            CopyEngine::new(
                self.source.clone(),
                self.target.clone(),
                self.store.clone(),
                config(batch_size),
            )
        }
    }

    #[test]
    fn test_retry_delay_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(1600));
        assert_eq!(policy.delay(10), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_batches_and_monotonic_checkpoints() {
        let fx = Fixture::new("events", 10_050);
        let outcome = fx
            .engine(1000)
            .copy_table(&fx.table, "public", &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, TableStatus::Committed { rows: 10_050 });
        assert_eq!(outcome.batches, 11);
        assert_eq!(fx.source.reads(), 11);
        assert_eq!(fx.target.rows("public.events").len(), 10_050);

        let saved = fx.store.saved.lock().unwrap().clone();
        let copied: Vec<u64> = saved.iter().map(|c| c.rows_copied).collect();
        assert!(copied.windows(2).all(|w| w[0] <= w[1]));
        let last = saved.last().unwrap();
        assert!(last.complete);
        assert_eq!(last.rows_copied, 10_050);
        assert_eq!(last.boundary, Some(Boundary::Key(vec![KeyValue::Int(10_050)])));
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_on_empty_batch() {
        let fx = Fixture::new("events", 3000);
        let outcome = fx
            .engine(1000)
            .copy_table(&fx.table, "public", &CancellationToken::new())
            .await;
        assert_eq!(outcome.batches, 3);
        assert_eq!(fx.source.reads(), 4);
        assert!(outcome.status.is_committed());
    }

    #[tokio::test]
    async fn test_resume_after_interruption_is_idempotent() {
        let fx = Fixture::new("events", 10_050);

        // Interrupted after batch 5 committed on the target but before its
        // checkpoint was saved.
        let mut cp = CopyCheckpoint::new(10_050);
        for b in 1..=4u64 {
            cp.advance(Boundary::Key(vec![KeyValue::Int((b * 1000) as i64)]), 1000);
        }
        fx.store.inner.save("public.events", &cp).await.unwrap();
        let partial = fx.source.read_batch(BatchRequest { table: &fx.table, after: None, limit: 5000 })
            .await
            .unwrap();
        fx.target
            .upsert_batch(WriteTarget { schema: "public", table: &fx.table }, &partial)
            .await
            .unwrap();

        let outcome = fx
            .engine(1000)
            .copy_table(&fx.table, "public", &CancellationToken::new())
            .await;

        assert!(outcome.resumed);
        assert_eq!(outcome.status, TableStatus::Committed { rows: 10_050 });
        assert_eq!(outcome.batches, 11);
        // one setup read plus batches 5..=11
        assert_eq!(fx.source.reads(), 1 + 7);
        let rows = fx.target.rows("public.events");
        assert_eq!(rows.len(), 10_050);
    }

    #[tokio::test]
    async fn test_complete_checkpoint_skips_copy() {
        let fx = Fixture::new("events", 100);
        let mut cp = CopyCheckpoint::new(100);
        cp.advance(Boundary::Key(vec![KeyValue::Int(100)]), 100);
        cp.mark_complete();
        fx.store.inner.save("public.events", &cp).await.unwrap();

        let outcome = fx
            .engine(1000)
            .copy_table(&fx.table, "public", &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, TableStatus::Committed { rows: 100 });
        assert_eq!(fx.source.reads(), 0);
        assert_eq!(fx.target.writes(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let fx = Fixture::new("events", 2500);
        fx.source.fail_transient("public.events", 1);
        fx.target.fail_writes("public.events", 1);

        let outcome = fx
            .engine(1000)
            .copy_table(&fx.table, "public", &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, TableStatus::Committed { rows: 2500 });
        assert_eq!(outcome.retries, 2);
        assert_eq!(fx.target.rows("public.events").len(), 2500);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let fx = Fixture::new("events", 10);
        fx.source.fail_transient("public.events", 100);

        let outcome = fx
            .engine(1000)
            .copy_table(&fx.table, "public", &CancellationToken::new())
            .await;
        match outcome.status {
            TableStatus::Failed { kind, retries, .. } => {
                assert_eq!(kind, "copy_transient");
                assert_eq!(retries, 3);
            }
            other => panic!("unexpected status {:?}", other),
        }
        assert_eq!(fx.source.reads(), 4);
    }

    #[tokio::test]
    async fn test_structural_failure_is_not_retried() {
        let fx = Fixture::new("events", 10);
        fx.source.fail_structural("public.events");

        let outcome = fx
            .engine(1000)
            .copy_table(&fx.table, "public", &CancellationToken::new())
            .await;
        assert!(matches!(outcome.status, TableStatus::Failed { retries: 0, .. }));
        assert_eq!(fx.source.reads(), 1);
    }

    #[tokio::test]
    async fn test_keyless_restart_truncates_target() {
        let mut fx = Fixture::new("log", 2500);
        fx.table.primary_key = None;
        let (mut source_table, data) = numbered_table("log", 2500);
        source_table.primary_key = None;
        fx.source = Arc::new(MemorySource::new(vec![(source_table, data)]));

        let mut cp = CopyCheckpoint::new(2500);
        cp.advance(Boundary::Offset(1000), 1000);
        fx.store.inner.save("public.log", &cp).await.unwrap();
        let partial = fx
            .source
            .read_batch(BatchRequest { table: &fx.table, after: None, limit: 1500 })
            .await
            .unwrap();
        fx.target
            .insert_batch(WriteTarget { schema: "public", table: &fx.table }, &partial)
            .await
            .unwrap();

        let outcome = fx
            .engine(1000)
            .copy_table(&fx.table, "public", &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, TableStatus::Committed { rows: 2500 });
        assert!(!outcome.resumed);
        assert_eq!(fx.target.rows("public.log").len(), 2500);
    }

    #[tokio::test]
    async fn test_fresh_keyless_copy_replaces_earlier_rows() {
        let (mut source_table, data) = numbered_table("log", 2500);
        source_table.primary_key = None;
        let table = mapped(&source_table, data.len());
        let source = Arc::new(MemorySource::new(vec![(source_table, data)]));
        let target = Arc::new(MemoryTarget::new());

        for _ in 0..2 {
            let engine = CopyEngine::new(
                source.clone(),
                target.clone(),
                Arc::new(MemoryCheckpointStore::new()),
                config(1000),
            );
            let outcome = engine.copy_table(&table, "public", &CancellationToken::new()).await;
            assert_eq!(outcome.status, TableStatus::Committed { rows: 2500 });
            assert_eq!(target.rows("public.log").len(), 2500);
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_copy_then_resume() {
        let fx = Fixture::new("events", 5000);
        let cancel = CancellationToken::new();
        fx.target.cancel_after_writes(3, cancel.clone());

        let outcome = fx.engine(500).copy_table(&fx.table, "public", &cancel).await;
        match &outcome.status {
            TableStatus::Failed { kind, .. } => assert_eq!(kind, "cancelled"),
            other => panic!("unexpected status {:?}", other),
        }
        assert_eq!(outcome.rows_copied, 1500);
        assert_eq!(fx.source.reads(), 3);

        let cp = fx.store.inner.load("public.events").await.unwrap().unwrap();
        assert!(!cp.complete);
        assert_eq!(cp.batches, 3);
        assert_eq!(cp.rows_copied, 1500);
        assert_eq!(cp.boundary, Some(Boundary::Key(vec![KeyValue::Int(1500)])));
        assert_eq!(fx.target.rows("public.events").len(), 1500);

        let outcome = fx
            .engine(500)
            .copy_table(&fx.table, "public", &CancellationToken::new())
            .await;
        assert!(outcome.resumed);
        assert_eq!(outcome.status, TableStatus::Committed { rows: 5000 });
        assert_eq!(outcome.batches, 10);
        // batches 4..=10 plus the empty read that ends the table
        assert_eq!(fx.source.reads(), 3 + 8);
        assert_eq!(fx.target.rows("public.events").len(), 5000);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_batch() {
        let fx = Fixture::new("events", 10);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = fx.engine(1000).copy_table(&fx.table, "public", &cancel).await;
        match outcome.status {
            TableStatus::Failed { kind, .. } => assert_eq!(kind, "cancelled"),
            other => panic!("unexpected status {:?}", other),
        }
        assert_eq!(fx.source.reads(), 0);
    }
}

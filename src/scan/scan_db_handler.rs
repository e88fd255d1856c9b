use log::error;
use rusqlite::Connection;

use crate::{
    db::{self, ScanDbError, ScanDbResult, SqlitePool},
    models::{FailedScanRecord, LocalBlock, ScanCursor},
};

/// Async facade over the scanner tables; each call runs on the blocking pool.
#[derive(Clone)]
pub struct ScanDbHandler {
    pool: SqlitePool,
}

impl ScanDbHandler {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> ScanDbResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> ScanDbResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| {
            error!(operation = op, error:% = e; "DB task failed");
            ScanDbError::TaskJoin(format!("{}: {}", op, e))
        })?
    }

    pub async fn get_current_block_head(&self, symbol: &str) -> ScanDbResult<Option<ScanCursor>> {
        let symbol = symbol.to_string();
        self.with_conn("get_current_block_head", move |conn| {
            db::get_current_block_head(conn, &symbol)
        })
        .await
    }

    pub async fn save_current_block_head(&self, symbol: &str, cursor: &ScanCursor) -> ScanDbResult<()> {
        let symbol = symbol.to_string();
        let cursor = cursor.clone();
        self.with_conn("save_current_block_head", move |conn| {
            db::save_current_block_head(conn, &symbol, &cursor)
        })
        .await
    }

    pub async fn save_unscan_record(&self, record: &FailedScanRecord) -> ScanDbResult<()> {
        let record = record.clone();
        self.with_conn("save_unscan_record", move |conn| db::save_unscan_record(conn, &record))
            .await
    }

    pub async fn get_unscan_records(&self, symbol: &str) -> ScanDbResult<Vec<FailedScanRecord>> {
        let symbol = symbol.to_string();
        self.with_conn("get_unscan_records", move |conn| db::get_unscan_records(conn, &symbol))
            .await
    }

    pub async fn delete_unscan_record_by_id(&self, id: &str, symbol: &str) -> ScanDbResult<usize> {
        let id = id.to_string();
        let symbol = symbol.to_string();
        self.with_conn("delete_unscan_record_by_id", move |conn| {
            db::delete_unscan_record_by_id(conn, &id, &symbol)
        })
        .await
    }

    pub async fn delete_unscan_records_by_height(&self, height: u64, symbol: &str) -> ScanDbResult<usize> {
        let symbol = symbol.to_string();
        self.with_conn("delete_unscan_records_by_height", move |conn| {
            db::delete_unscan_records_by_height(conn, height, &symbol)
        })
        .await
    }

    pub async fn save_local_block(&self, symbol: &str, block: LocalBlock) -> ScanDbResult<()> {
        let symbol = symbol.to_string();
        self.with_conn("save_local_block", move |conn| db::save_local_block(conn, &symbol, &block))
            .await
    }

    pub async fn get_local_block(&self, symbol: &str, height: u64) -> ScanDbResult<Option<LocalBlock>> {
        let symbol = symbol.to_string();
        self.with_conn("get_local_block", move |conn| db::get_local_block(conn, &symbol, height))
            .await
    }

    pub async fn delete_local_blocks_above(&self, symbol: &str, height: u64) -> ScanDbResult<usize> {
        let symbol = symbol.to_string();
        self.with_conn("delete_local_blocks_above", move |conn| {
            db::delete_local_blocks_above(conn, &symbol, height)
        })
        .await
    }

    pub async fn prune_local_blocks_below(&self, symbol: &str, height: u64) -> ScanDbResult<usize> {
        let symbol = symbol.to_string();
        self.with_conn("prune_local_blocks_below", move |conn| {
            db::prune_local_blocks_below(conn, &symbol, height)
        })
        .await
    }
}

use std::{fs, path::Path, time::Duration};

use include_dir::{Dir, include_dir};
use log::info;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite_migration::Migrations;

mod error;
pub use error::{ScanDbError, ScanDbResult};

mod block_heads;
pub use block_heads::{get_current_block_head, save_current_block_head};

mod unscan_records;
pub use unscan_records::{
    delete_unscan_record_by_id,
    delete_unscan_records_by_height,
    get_unscan_records,
    save_unscan_record,
};

mod local_blocks;
pub use local_blocks::{delete_local_blocks_above, get_local_block, prune_local_blocks_below, save_local_block};

pub type SqlitePool = r2d2::Pool<SqliteConnectionManager>;

static MIGRATIONS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/migrations");

const POOL_MAX_SIZE: u32 = 8;
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens (creating if needed) the scanner database and brings its schema up to date.
pub fn init_db<P: AsRef<Path>>(db_path: P) -> ScanDbResult<SqlitePool> {
    let path = db_path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
    });
    let pool = r2d2::Pool::builder()
        .max_size(POOL_MAX_SIZE)
        .connection_timeout(POOL_CONNECTION_TIMEOUT)
        .build(manager)?;

    let mut conn = pool.get()?;
    let migrations = Migrations::from_directory(&MIGRATIONS_DIR)?;
    migrations.to_latest(&mut conn)?;

    info!(path:% = path.display(); "Database ready");
    Ok(pool)
}

#[cfg(test)]
pub(crate) fn test_pool() -> (tempfile::TempDir, SqlitePool) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let pool = init_db(temp_dir.path().join("scanner_test.db")).expect("Failed to init DB");
    (temp_dir, pool)
}

use rusqlite::{Connection, OptionalExtension, named_params};

use crate::db::ScanDbResult;
use crate::models::LocalBlock;

pub fn save_local_block(conn: &Connection, symbol: &str, block: &LocalBlock) -> ScanDbResult<()> {
    conn.execute(
        r#"
        INSERT INTO local_blocks (symbol, height, hash, previous_hash, timestamp)
        VALUES (:symbol, :height, :hash, :previous_hash, :timestamp)
        ON CONFLICT(symbol, height) DO UPDATE SET
            hash = excluded.hash,
            previous_hash = excluded.previous_hash,
            timestamp = excluded.timestamp
        "#,
        named_params! {
            ":symbol": symbol,
            ":height": block.height as i64,
            ":hash": block.hash,
            ":previous_hash": block.previous_hash,
            ":timestamp": block.timestamp as i64,
        },
    )?;
    Ok(())
}

pub fn get_local_block(conn: &Connection, symbol: &str, height: u64) -> ScanDbResult<Option<LocalBlock>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT height, hash, previous_hash, timestamp
        FROM local_blocks
        WHERE symbol = :symbol AND height = :height
        "#,
    )?;

    let block = stmt
        .query_row(named_params! { ":symbol": symbol, ":height": height as i64 }, |row| {
            let height: i64 = row.get(0)?;
            let timestamp: i64 = row.get(3)?;
            Ok(LocalBlock {
                height: height as u64,
                hash: row.get(1)?,
                previous_hash: row.get(2)?,
                timestamp: timestamp as u64,
            })
        })
        .optional()?;

    Ok(block)
}

/// Drops cached headers invalidated by a rewind to `height`.
pub fn delete_local_blocks_above(conn: &Connection, symbol: &str, height: u64) -> ScanDbResult<usize> {
    let count = conn.execute(
        "DELETE FROM local_blocks WHERE symbol = :symbol AND height > :height",
        named_params! { ":symbol": symbol, ":height": height as i64 },
    )?;
    Ok(count)
}

pub fn prune_local_blocks_below(conn: &Connection, symbol: &str, height: u64) -> ScanDbResult<usize> {
    let count = conn.execute(
        "DELETE FROM local_blocks WHERE symbol = :symbol AND height < :height",
        named_params! { ":symbol": symbol, ":height": height as i64 },
    )?;
    Ok(count)
}

use log::debug;
use rusqlite::{Connection, OptionalExtension, named_params};

use crate::db::ScanDbResult;
use crate::models::ScanCursor;

/// Returns the persisted cursor for `symbol`, if one was ever saved.
pub fn get_current_block_head(conn: &Connection, symbol: &str) -> ScanDbResult<Option<ScanCursor>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT height, hash
        FROM block_heads
        WHERE symbol = :symbol
        "#,
    )?;

    let cursor = stmt
        .query_row(named_params! { ":symbol": symbol }, |row| {
            let height: i64 = row.get(0)?;
            Ok(ScanCursor {
                height: height as u64,
                hash: row.get(1)?,
            })
        })
        .optional()?;

    Ok(cursor)
}

pub fn save_current_block_head(conn: &Connection, symbol: &str, cursor: &ScanCursor) -> ScanDbResult<()> {
    debug!(
        symbol = symbol,
        height = cursor.height;
        "DB: Saving block head"
    );

    conn.execute(
        r#"
        INSERT INTO block_heads (symbol, height, hash, updated_at)
        VALUES (:symbol, :height, :hash, CURRENT_TIMESTAMP)
        ON CONFLICT(symbol) DO UPDATE SET
            height = excluded.height,
            hash = excluded.hash,
            updated_at = excluded.updated_at
        "#,
        named_params! {
            ":symbol": symbol,
            ":height": cursor.height as i64,
            ":hash": cursor.hash,
        },
    )?;

    Ok(())
}

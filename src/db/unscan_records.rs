use log::debug;
use rusqlite::{Connection, named_params};
use serde_rusqlite::from_rows;

use crate::db::ScanDbResult;
use crate::models::FailedScanRecord;

/// Inserts a failed record, or refreshes the reason of an existing one with the same id.
pub fn save_unscan_record(conn: &Connection, record: &FailedScanRecord) -> ScanDbResult<()> {
    debug!(
        symbol = &*record.symbol,
        height = record.height,
        tx_id:? = record.tx_id;
        "DB: Saving unscan record"
    );

    conn.execute(
        r#"
        INSERT INTO unscan_records (id, symbol, block_height, tx_id, reason, created_at)
        VALUES (:id, :symbol, :block_height, :tx_id, :reason, CURRENT_TIMESTAMP)
        ON CONFLICT(id) DO UPDATE SET reason = excluded.reason
        "#,
        named_params! {
            ":id": record.id,
            ":symbol": record.symbol,
            ":block_height": record.height as i64,
            ":tx_id": record.tx_id,
            ":reason": record.reason,
        },
    )?;

    Ok(())
}

pub fn get_unscan_records(conn: &Connection, symbol: &str) -> ScanDbResult<Vec<FailedScanRecord>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT id, symbol, block_height, tx_id, reason
        FROM unscan_records
        WHERE symbol = :symbol
        ORDER BY block_height ASC, created_at ASC
        "#,
    )?;

    let rows = stmt.query(named_params! { ":symbol": symbol })?;
    let records = from_rows::<FailedScanRecord>(rows).collect::<Result<Vec<_>, _>>()?;

    Ok(records)
}

pub fn delete_unscan_record_by_id(conn: &Connection, id: &str, symbol: &str) -> ScanDbResult<usize> {
    let count = conn.execute(
        "DELETE FROM unscan_records WHERE id = :id AND symbol = :symbol",
        named_params! { ":id": id, ":symbol": symbol },
    )?;
    Ok(count)
}

pub fn delete_unscan_records_by_height(conn: &Connection, height: u64, symbol: &str) -> ScanDbResult<usize> {
    let count = conn.execute(
        "DELETE FROM unscan_records WHERE block_height = :height AND symbol = :symbol",
        named_params! { ":height": height as i64, ":symbol": symbol },
    )?;
    debug!(height = height, deleted = count; "DB: Deleted unscan records by height");
    Ok(count)
}

use log::{debug, info, warn};

use super::{ScanError, scanner::ScannerInner};
use crate::models::{Block, BlockHeader, ScanCursor};

impl ScannerInner {
    /// Rolls the cursor back after `fetched` turned out not to extend it.
    ///
    /// The cursor's block is the forked one. Scanning resumes one block below
    /// it (never below height 1), so the forked height itself is scanned again.
    /// Returns the new, already persisted, cursor.
    pub(super) async fn resolve_fork(&self, cursor: &ScanCursor, fetched: &Block) -> Result<ScanCursor, ScanError> {
        let symbol = self.config.symbol.as_str();
        let fork_height = cursor.height;
        warn!(
            height = fetched.height,
            forked_height = fork_height,
            local_hash = &*cursor.hash,
            chain_previous_hash = &*fetched.previous_hash;
            "Fork detected"
        );

        let forked_block = self.db.get_local_block(symbol, fork_height).await?;
        let removed = self.db.delete_unscan_records_by_height(fork_height, symbol).await?;
        if removed > 0 {
            info!(height = fork_height, removed = removed; "Dropped unscan records of forked block");
        }

        let working_height = fork_height.saturating_sub(1).max(1);
        // At the floor the cached block is the forked one itself.
        let cached = if working_height < fork_height {
            self.db.get_local_block(symbol, working_height).await?
        } else {
            None
        };
        let rewind_block = match cached {
            Some(local) => local,
            None => {
                info!(height = working_height; "Rewind block not cached, fetching from chain");
                let local = self.chain.get_block_by_height(working_height, false).await?.to_local();
                self.db.save_local_block(symbol, local.clone()).await?;
                local
            },
        };

        let new_cursor = ScanCursor {
            height: rewind_block.height,
            hash: rewind_block.hash.clone(),
        };
        self.db.save_current_block_head(symbol, &new_cursor).await?;
        self.db.delete_local_blocks_above(symbol, new_cursor.height).await?;
        self.ledger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .forget_from(new_cursor.height + 1);

        info!(height = new_cursor.height, hash = &*new_cursor.hash; "Rescanning from rewound block");

        let header = match forked_block {
            Some(local) => local.header(symbol, true),
            None => self.forked_header_from_chain(cursor).await,
        };
        self.observers.notify_block(&header);

        Ok(new_cursor)
    }

    /// Header of an uncached forked block. The node may still know the
    /// orphaned block by hash; otherwise only the cursor is known.
    async fn forked_header_from_chain(&self, cursor: &ScanCursor) -> BlockHeader {
        let symbol = self.config.symbol.as_str();
        match self.chain.get_block_by_hash(&cursor.hash).await {
            Ok(block) => block.header(symbol, true),
            Err(e) => {
                debug!(hash = &*cursor.hash, error:% = e; "Forked block unknown to the node");
                BlockHeader {
                    hash: cursor.hash.clone(),
                    previous_hash: String::new(),
                    height: cursor.height,
                    time: 0,
                    fork: true,
                    symbol: symbol.to_string(),
                }
            },
        }
    }
}

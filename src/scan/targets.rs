use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use log::debug;

use super::extractor::ScanTargetFunc;
use crate::log::mask_string;
use crate::models::ScanTarget;

/// Watched address to source key mapping, read on every extraction and
/// written rarely.
#[derive(Clone, Default)]
pub struct WatchList {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl WatchList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(addresses: HashMap<String, String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(addresses)),
        }
    }

    pub fn add_address(&self, address: &str, source_key: &str) {
        debug!(address = &*mask_string(address), source_key = source_key; "Watching address");
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.to_string(), source_key.to_string());
    }

    pub fn remove_address(&self, address: &str) -> Option<String> {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).remove(address)
    }

    pub fn get_source_key_by_address(&self, address: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Predicate for [`Scanner::set_block_scan_target_func`](super::Scanner::set_block_scan_target_func).
    /// Later changes to the list are visible to it.
    pub fn scan_target_func(&self) -> ScanTargetFunc {
        let list = self.clone();
        Arc::new(move |target: &ScanTarget| list.get_source_key_by_address(&target.address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_target_func_sees_later_updates() {
        let list = WatchList::new();
        let func = list.scan_target_func();
        let target = ScanTarget {
            address: "f1watched".to_string(),
            symbol: "FIL".to_string(),
        };
        assert_eq!(func(&target), None);

        list.add_address("f1watched", "account-7");
        assert_eq!(func(&target).as_deref(), Some("account-7"));
        assert_eq!(list.len(), 1);

        assert_eq!(list.remove_address("f1watched").as_deref(), Some("account-7"));
        assert!(list.is_empty());
        assert_eq!(func(&target), None);
    }
}

// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Durable bookkeeping for in-flight transfers. Three buckets: `retry`
//! (needs (re)submission, keyed by the serialized record itself), `check`
//! (submitted, keyed by hub tx hash, awaiting receipt confirmation) and a
//! single scalar holding the last committed hub height.

use crate::error::RelayerResult;
use std::path::Path;

const RETRY_TREE: &str = "retry";
const CHECK_TREE: &str = "check";
const HUB_HEIGHT_KEY: &[u8] = b"hub_height";

#[derive(Clone)]
pub struct RelayerStore {
    db: sled::Db,
}

impl std::fmt::Debug for RelayerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayerStore").finish()
    }
}

impl RelayerStore {
    pub fn open<P: AsRef<Path>>(path: P) -> RelayerResult<Self> {
        let db = sled::Config::new()
            .path(path)
            .mode(sled::Mode::HighThroughput)
            .open()?;
        Ok(Self { db })
    }

    pub fn put_retry(&self, record: &[u8]) -> RelayerResult<()> {
        let tree = self.db.open_tree(RETRY_TREE)?;
        tree.insert(record, vec![])?;
        self.db.flush()?;
        Ok(())
    }

    pub fn delete_retry(&self, record: &[u8]) -> RelayerResult<()> {
        let tree = self.db.open_tree(RETRY_TREE)?;
        tree.remove(record)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get_all_retry(&self) -> RelayerResult<Vec<Vec<u8>>> {
        let tree = self.db.open_tree(RETRY_TREE)?;
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (key, _) = entry?;
            out.push(key.to_vec());
        }
        Ok(out)
    }

    pub fn put_check(&self, hub_tx_hash: &str, record: &[u8]) -> RelayerResult<()> {
        let tree = self.db.open_tree(CHECK_TREE)?;
        tree.insert(hub_tx_hash.as_bytes(), record)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn delete_check(&self, hub_tx_hash: &str) -> RelayerResult<()> {
        let tree = self.db.open_tree(CHECK_TREE)?;
        tree.remove(hub_tx_hash.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get_all_check(&self) -> RelayerResult<Vec<(String, Vec<u8>)>> {
        let tree = self.db.open_tree(CHECK_TREE)?;
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (key, value) = entry?;
            out.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        Ok(out)
    }

    pub fn retry_count(&self) -> RelayerResult<usize> {
        Ok(self.db.open_tree(RETRY_TREE)?.len())
    }

    pub fn check_count(&self) -> RelayerResult<usize> {
        Ok(self.db.open_tree(CHECK_TREE)?.len())
    }

    pub fn update_hub_height(&self, height: u32) -> RelayerResult<()> {
        self.db.insert(HUB_HEIGHT_KEY, &height.to_le_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get_hub_height(&self) -> RelayerResult<u32> {
        match self.db.get(HUB_HEIGHT_KEY)? {
            Some(v) => {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&v);
                Ok(u32::from_le_bytes(bytes))
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_bucket() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RelayerStore::open(tmp.path()).unwrap();
        assert!(store.get_all_retry().unwrap().is_empty());

        store.put_retry(b"record-a").unwrap();
        store.put_retry(b"record-b").unwrap();
        // keys form a set: re-inserting is a no-op
        store.put_retry(b"record-a").unwrap();
        assert_eq!(store.retry_count().unwrap(), 2);

        store.delete_retry(b"record-a").unwrap();
        let remaining = store.get_all_retry().unwrap();
        assert_eq!(remaining, vec![b"record-b".to_vec()]);
    }

    #[test]
    fn test_check_bucket() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RelayerStore::open(tmp.path()).unwrap();

        store.put_check("0xabc", b"payload").unwrap();
        let all = store.get_all_check().unwrap();
        assert_eq!(all, vec![("0xabc".to_string(), b"payload".to_vec())]);

        store.delete_check("0xabc").unwrap();
        assert_eq!(store.check_count().unwrap(), 0);
    }

    #[test]
    fn test_hub_height_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = RelayerStore::open(tmp.path()).unwrap();
            assert_eq!(store.get_hub_height().unwrap(), 0);
            store.update_hub_height(4242).unwrap();
        }
        let store = RelayerStore::open(tmp.path()).unwrap();
        assert_eq!(store.get_hub_height().unwrap(), 4242);
    }

    #[test]
    fn test_buckets_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = RelayerStore::open(tmp.path()).unwrap();
            store.put_retry(b"r1").unwrap();
            store.put_check("0x01", b"c1").unwrap();
        }
        let store = RelayerStore::open(tmp.path()).unwrap();
        assert_eq!(store.get_all_retry().unwrap(), vec![b"r1".to_vec()]);
        assert_eq!(
            store.get_all_check().unwrap(),
            vec![("0x01".to_string(), b"c1".to_vec())]
        );
    }
}

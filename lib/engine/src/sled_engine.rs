use std::ops::Bound;
use std::path::Path;

use crate::{BatchOp, DataEngine, EngineError, MetaEngine, WriteBatch};

// `WriteBatch::ops` is private to the crate root; re-expose a visitor here so
// this module doesn't need to duplicate the enum.
impl WriteBatch {
    fn apply_to(self, batch: &mut sled::Batch) {
        for op in self.ops {
            match op {
                BatchOp::Put(k, v) => batch.insert(k, v),
                BatchOp::Delete(k) => batch.remove(k),
            }
        }
    }
}

pub struct SledMetaEngine {
    tree: sled::Db,
}

impl SledMetaEngine {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        Ok(Self {
            tree: sled::open(path)?,
        })
    }

    pub fn open_temporary() -> Result<Self, EngineError> {
        Ok(Self {
            tree: sled::Config::new().temporary(true).open()?,
        })
    }
}

impl MetaEngine for SledMetaEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), EngineError> {
        let mut sled_batch = sled::Batch::default();
        batch.apply_to(&mut sled_batch);
        self.tree.apply_batch(sled_batch)?;
        self.tree.flush()?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError> {
        let mut out = Vec::new();
        for item in self.tree.scan_prefix(prefix) {
            let (k, v) = item?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }
}

pub struct SledDataEngine {
    tree: sled::Db,
}

impl SledDataEngine {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        Ok(Self {
            tree: sled::open(path)?,
        })
    }

    pub fn open_temporary() -> Result<Self, EngineError> {
        Ok(Self {
            tree: sled::Config::new().temporary(true).open()?,
        })
    }
}

impl DataEngine for SledDataEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), EngineError> {
        self.tree.remove(key)?;
        Ok(())
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, EngineError> {
        let mut out = Vec::new();
        let range = (Bound::Included(start.to_vec()), Bound::Excluded(end.to_vec()));
        for item in self.tree.range(range) {
            let (k, v) = item?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<(), EngineError> {
        let range = (Bound::Included(start.to_vec()), Bound::Excluded(end.to_vec()));
        let keys: Vec<_> = self
            .tree
            .range(range)
            .map(|item| item.map(|(k, _)| k.to_vec()))
            .collect::<Result<_, _>>()?;
        let mut batch = sled::Batch::default();
        for key in keys {
            batch.remove(key);
        }
        self.tree.apply_batch(batch)?;
        Ok(())
    }

    fn approximate_size(&self, start: &[u8], end: &[u8]) -> Result<u64, EngineError> {
        let range = (Bound::Included(start.to_vec()), Bound::Excluded(end.to_vec()));
        let mut total = 0u64;
        for item in self.tree.range(range) {
            let (k, v) = item?;
            total += (k.len() + v.len()) as u64;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_engine_scan_and_delete_range() {
        let engine = SledDataEngine::open_temporary().unwrap();
        engine.put(b"a", b"1").unwrap();
        engine.put(b"m", b"2").unwrap();
        engine.put(b"z", b"3").unwrap();

        let scanned = engine.scan_range(b"a", b"z").unwrap();
        assert_eq!(scanned.len(), 2);

        engine.delete_range(b"a", b"z").unwrap();
        assert!(engine.get(b"a").unwrap().is_none());
        assert!(engine.get(b"m").unwrap().is_none());
        assert_eq!(engine.get(b"z").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn meta_engine_batch_write() {
        let engine = SledMetaEngine::open_temporary().unwrap();
        let mut batch = WriteBatch::new();
        batch.put(b"k1".to_vec(), b"v1".to_vec());
        batch.put(b"k2".to_vec(), b"v2".to_vec());
        engine.write(batch).unwrap();
        assert_eq!(engine.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(engine.get(b"k2").unwrap(), Some(b"v2".to_vec()));
    }
}

//! Ordered secondary index.
//!
//! A lightweight named index over a single-file `redb` database, used
//! wherever the engine's natural key order does not match the desired
//! listing order (dialogs by last activity, gifs by last access, top peers
//! by rate).  Each named index is a pair of tables: a forward table from
//! entry key to its sortable value, and an ordering table keyed by
//! `(value, key)` so range scans iterate entries in value order.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::Result;
use crate::keys;

type FwdDef<'a> = TableDefinition<'a, &'static str, &'static [u8]>;
type OrdDef<'a> = TableDefinition<'a, (&'static [u8], &'static str), ()>;

pub struct SortedIndex {
    db: Database,
}

impl SortedIndex {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        Ok(Self { db })
    }

    /// Insert or replace `key` in the named index with a new sortable
    /// value.  Replacement atomically moves the entry to its new position.
    pub fn set(&self, index: &str, key: &str, value: &[u8]) -> Result<()> {
        let fwd_name = format!("{index}#fwd");
        let ord_name = format!("{index}#ord");
        let fwd: FwdDef<'_> = TableDefinition::new(&fwd_name);
        let ord: OrdDef<'_> = TableDefinition::new(&ord_name);

        let wtx = self.db.begin_write()?;
        {
            let mut ft = wtx.open_table(fwd)?;
            let mut ot = wtx.open_table(ord)?;
            let old = ft.insert(key, value)?.map(|g| g.value().to_vec());
            if let Some(old) = old {
                ot.remove(&(old.as_slice(), key))?;
            }
            ot.insert(&(value, key), &())?;
        }
        wtx.commit()?;
        Ok(())
    }

    /// Convenience for numeric (rate-ordered) indexes.
    pub fn set_f64(&self, index: &str, key: &str, value: f64) -> Result<()> {
        self.set(index, key, &keys::f64_sortable(value))
    }

    pub fn get(&self, index: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let fwd_name = format!("{index}#fwd");
        let fwd: FwdDef<'_> = TableDefinition::new(&fwd_name);

        let rtx = self.db.begin_read()?;
        let ft = match rtx.open_table(fwd) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(ft.get(key)?.map(|g| g.value().to_vec()))
    }

    pub fn get_f64(&self, index: &str, key: &str) -> Result<Option<f64>> {
        Ok(self
            .get(index, key)?
            .and_then(|v| keys::f64_from_sortable(&v)))
    }

    pub fn delete(&self, index: &str, key: &str) -> Result<()> {
        let fwd_name = format!("{index}#fwd");
        let ord_name = format!("{index}#ord");
        let fwd: FwdDef<'_> = TableDefinition::new(&fwd_name);
        let ord: OrdDef<'_> = TableDefinition::new(&ord_name);

        let wtx = self.db.begin_write()?;
        {
            let mut ft = match wtx.open_table(fwd) {
                Ok(t) => t,
                Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let mut ot = wtx.open_table(ord)?;
            let old = ft.remove(key)?.map(|g| g.value().to_vec());
            if let Some(old) = old {
                ot.remove(&(old.as_slice(), key))?;
            }
        }
        wtx.commit()?;
        Ok(())
    }

    /// Iterate the named index in ascending value order.  The callback
    /// receives `(key, value)` and returns `false` to stop early.
    pub fn ascend<F>(&self, index: &str, f: F) -> Result<()>
    where
        F: FnMut(&str, &[u8]) -> bool,
    {
        self.iterate(index, false, f)
    }

    /// Iterate the named index in descending value order.
    pub fn descend<F>(&self, index: &str, f: F) -> Result<()>
    where
        F: FnMut(&str, &[u8]) -> bool,
    {
        self.iterate(index, true, f)
    }

    fn iterate<F>(&self, index: &str, reverse: bool, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &[u8]) -> bool,
    {
        let ord_name = format!("{index}#ord");
        let ord: OrdDef<'_> = TableDefinition::new(&ord_name);

        let rtx = self.db.begin_read()?;
        let ot = match rtx.open_table(ord) {
            Ok(t) => t,
            // An index nobody has written to yet is simply empty.
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let range = ot.range::<(&[u8], &str)>(..)?;
        if reverse {
            for item in range.rev() {
                let (k, _) = item?;
                let (value, key) = k.value();
                if !f(key, value) {
                    break;
                }
            }
        } else {
            for item in range {
                let (k, _) = item?;
                let (value, key) = k.value();
                if !f(key, value) {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Drop every entry of the named index.
    pub fn clear(&self, index: &str) -> Result<()> {
        let fwd_name = format!("{index}#fwd");
        let ord_name = format!("{index}#ord");

        let wtx = self.db.begin_write()?;
        let _ = wtx.delete_table(TableDefinition::<&str, &[u8]>::new(&fwd_name))?;
        let _ = wtx.delete_table(TableDefinition::<(&[u8], &str), ()>::new(&ord_name))?;
        wtx.commit()?;
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_index() -> (tempfile::TempDir, SortedIndex) {
        let dir = tempfile::tempdir().unwrap();
        let idx = SortedIndex::open(&dir.path().join("sorted.redb")).unwrap();
        (dir, idx)
    }

    #[test]
    fn descend_orders_by_value() {
        let (_dir, idx) = open_index();
        idx.set("d", "a", b"0001").unwrap();
        idx.set("d", "b", b"0003").unwrap();
        idx.set("d", "c", b"0002").unwrap();

        let mut order = Vec::new();
        idx.descend("d", |key, _| {
            order.push(key.to_string());
            true
        })
        .unwrap();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn replacing_a_value_moves_the_entry() {
        let (_dir, idx) = open_index();
        idx.set("d", "a", b"0001").unwrap();
        idx.set("d", "b", b"0002").unwrap();
        idx.set("d", "a", b"0009").unwrap();

        let mut order = Vec::new();
        idx.descend("d", |key, _| {
            order.push(key.to_string());
            true
        })
        .unwrap();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn early_exit_stops_iteration() {
        let (_dir, idx) = open_index();
        for (k, v) in [("a", b"1"), ("b", b"2"), ("c", b"3")] {
            idx.set("d", k, v).unwrap();
        }
        let mut seen = 0;
        idx.ascend("d", |_, _| {
            seen += 1;
            seen < 2
        })
        .unwrap();
        assert_eq!(seen, 2);
    }

    #[test]
    fn delete_removes_from_both_tables() {
        let (_dir, idx) = open_index();
        idx.set("d", "a", b"1").unwrap();
        idx.delete("d", "a").unwrap();

        assert!(idx.get("d", "a").unwrap().is_none());
        let mut seen = 0;
        idx.descend("d", |_, _| {
            seen += 1;
            true
        })
        .unwrap();
        assert_eq!(seen, 0);

        // Deleting from an index that was never written is a no-op.
        idx.delete("nope", "a").unwrap();
    }

    #[test]
    fn f64_values_order_numerically() {
        let (_dir, idx) = open_index();
        idx.set_f64("r", "low", 0.5).unwrap();
        idx.set_f64("r", "high", 12.25).unwrap();
        idx.set_f64("r", "neg", -3.0).unwrap();

        let mut order = Vec::new();
        idx.descend("r", |key, _| {
            order.push(key.to_string());
            true
        })
        .unwrap();
        assert_eq!(order, vec!["high", "low", "neg"]);
        assert_eq!(idx.get_f64("r", "high").unwrap(), Some(12.25));
    }
}

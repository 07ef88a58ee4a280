//! The overlay store: a durable, tombstoned view of `HKLM` in a single
//! SQLite file.
//!
//! Two tables (`keys`, `values_tbl`) hold live rows and tombstones; nothing
//! is ever physically removed while the store is in use. Lookup is
//! case-insensitive (`NOCASE` collation) while original spellings are
//! preserved. WAL journaling gives one writer plus concurrent readers across
//! processes; the outer mutex serializes logically-grouped statements such as
//! the key-upsert that precedes every value write.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::errors::StoreError;
use crate::keypath::{case_fold, key_prefixes};

/// A single value looked up by `(key_path, value_name)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub value_type: u32,
    pub data: Vec<u8>,
    pub is_deleted: bool,
}

/// One overlay row under a key, live or tombstoned.
#[derive(Debug, Clone)]
pub struct ValueRow {
    pub name: String,
    pub value_type: u32,
    pub data: Vec<u8>,
    pub is_deleted: bool,
}

/// An immediate child observed in the overlay.
#[derive(Debug, Clone)]
pub struct SubkeyRow {
    pub name: String,
    pub is_deleted: bool,
}

/// One row of the ordered export stream. `is_key_only` marks a synthetic row
/// emitted for a live key with no live values, so empty keys round-trip
/// through `.reg` files.
#[derive(Debug, Clone)]
pub struct ExportRow {
    pub key_path: String,
    pub value_name: String,
    pub value_type: u32,
    pub data: Vec<u8>,
    pub is_key_only: bool,
}

pub struct OverlayStore {
    conn: Mutex<Connection>,
}

fn now_unix_seconds() -> i64 {
    // Advisory ordering only; wall-clock seconds are good enough.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

const UPSERT_KEY_LIVE: &str = "INSERT INTO keys(key_path, is_deleted, updated_at) VALUES(?1, 0, ?2) \
     ON CONFLICT(key_path) DO UPDATE SET is_deleted=0, updated_at=excluded.updated_at";

const UPSERT_KEY_TOMBSTONE: &str = "INSERT INTO keys(key_path, is_deleted, updated_at) VALUES(?1, 1, ?2) \
     ON CONFLICT(key_path) DO UPDATE SET is_deleted=1, updated_at=excluded.updated_at";

impl OverlayStore {
    /// Opens (or creates) the store file and applies the schema. WAL mode
    /// with `synchronous=NORMAL` matches the concurrency model: one writer,
    /// many readers, crash-safe.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_millis(1_000))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(include_str!("schema.sql"))?;
        log::debug!("overlay store opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or un-tombstones `path`. Existing ancestor rows are
    /// un-tombstoned too (recreating a child implies its parents exist), but
    /// intermediate keys the caller never created are not materialized.
    pub fn put_key(&self, path: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        put_key_tx(&tx, path)?;
        tx.commit()?;
        Ok(())
    }

    /// Atomically tombstones the key row for `path` and every value row at
    /// `path` or anywhere below it.
    pub fn delete_key_tree(&self, path: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_unix_seconds();
        tx.execute(UPSERT_KEY_TOMBSTONE, params![path, now])?;
        tx.execute(
            "UPDATE values_tbl SET is_deleted=1, updated_at=?2 \
             WHERE key_path=?1 OR substr(key_path, 1, length(?1)+1) = (?1 || '\\') COLLATE NOCASE",
            params![path, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// True when `path` or any of its ancestors carries a tombstone.
    pub fn is_key_deleted(&self, path: &str) -> Result<bool, StoreError> {
        is_key_deleted_on(&self.conn(), path)
    }

    /// True when the overlay has live evidence of the key: a live key row or
    /// a live value stored at it.
    pub fn key_exists_locally(&self, path: &str) -> Result<bool, StoreError> {
        let conn = self.conn();
        if is_key_deleted_on(&conn, path)? {
            return Ok(false);
        }
        let key_row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM keys WHERE key_path=?1 AND is_deleted=0 LIMIT 1",
                params![path],
                |r| r.get(0),
            )
            .optional()?;
        if key_row.is_some() {
            return Ok(true);
        }
        let value_row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM values_tbl WHERE key_path=?1 AND is_deleted=0 LIMIT 1",
                params![path],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value_row.is_some())
    }

    /// Upserts a live value, ensuring the key (and its ancestors) are live
    /// first. Both statements run in one transaction.
    pub fn put_value(
        &self,
        path: &str,
        name: &str,
        value_type: u32,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        put_key_tx(&tx, path)?;
        let blob = if data.is_empty() { None } else { Some(data) };
        tx.execute(
            "INSERT INTO values_tbl(key_path, value_name, type, data, is_deleted, updated_at) \
             VALUES(?1, ?2, ?3, ?4, 0, ?5) \
             ON CONFLICT(key_path, value_name) DO UPDATE SET \
             type=excluded.type, data=excluded.data, is_deleted=0, updated_at=excluded.updated_at",
            params![path, name, value_type, blob, now_unix_seconds()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Tombstones a single value. The tombstone row shadows any real-registry
    /// value with the same name.
    pub fn delete_value(&self, path: &str, name: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        put_key_tx(&tx, path)?;
        tx.execute(
            "INSERT INTO values_tbl(key_path, value_name, type, data, is_deleted, updated_at) \
             VALUES(?1, ?2, 0, NULL, 1, ?3) \
             ON CONFLICT(key_path, value_name) DO UPDATE SET \
             is_deleted=1, updated_at=excluded.updated_at",
            params![path, name, now_unix_seconds()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Looks up one value. A tombstoned ancestor yields a synthetic deleted
    /// result so callers need no separate shadowing check.
    pub fn get_value(&self, path: &str, name: &str) -> Result<Option<StoredValue>, StoreError> {
        let conn = self.conn();
        if is_key_deleted_on(&conn, path)? {
            return Ok(Some(StoredValue {
                value_type: 0,
                data: Vec::new(),
                is_deleted: true,
            }));
        }
        let row = conn
            .query_row(
                "SELECT type, data, is_deleted FROM values_tbl \
                 WHERE key_path=?1 AND value_name=?2 LIMIT 1",
                params![path, name],
                |r| {
                    Ok(StoredValue {
                        value_type: r.get::<_, i64>(0)? as u32,
                        data: r.get::<_, Option<Vec<u8>>>(1)?.unwrap_or_default(),
                        is_deleted: r.get::<_, i64>(2)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// All overlay rows stored at `path`, live and tombstoned. Empty when the
    /// key is shadowed by an ancestor tombstone.
    pub fn list_values(&self, path: &str) -> Result<Vec<ValueRow>, StoreError> {
        let conn = self.conn();
        if is_key_deleted_on(&conn, path)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(
            "SELECT value_name, type, data, is_deleted FROM values_tbl WHERE key_path=?1",
        )?;
        let rows = stmt
            .query_map(params![path], |r| {
                Ok(ValueRow {
                    name: r.get(0)?,
                    value_type: r.get::<_, i64>(1)? as u32,
                    data: r.get::<_, Option<Vec<u8>>>(2)?.unwrap_or_default(),
                    is_deleted: r.get::<_, i64>(3)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Immediate children observed in the overlay, live and tombstoned. A
    /// child counts as tombstoned only when its own key row carries the
    /// tombstone; deeper descendants merely prove the child was observed.
    pub fn list_immediate_subkeys(&self, path: &str) -> Result<Vec<SubkeyRow>, StoreError> {
        let conn = self.conn();
        if is_key_deleted_on(&conn, path)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(
            "SELECT key_path, is_deleted FROM keys \
             WHERE substr(key_path, 1, length(?1)+1) = (?1 || '\\') COLLATE NOCASE",
        )?;
        let mut children: BTreeMap<String, SubkeyRow> = BTreeMap::new();
        let mut rows = stmt.query(params![path])?;
        while let Some(row) = rows.next()? {
            let full: String = row.get(0)?;
            let deleted: i64 = row.get(1)?;
            let Some(child) = child_segment(path.len(), &full) else {
                continue;
            };
            let is_exact = path.len() + 1 + child.len() == full.len();
            let entry = children.entry(case_fold(child)).or_insert_with(|| SubkeyRow {
                name: child.to_string(),
                is_deleted: false,
            });
            if is_exact {
                entry.name = child.to_string();
                entry.is_deleted = deleted != 0;
            }
        }
        Ok(children.into_values().collect())
    }

    /// Ordered export stream: every live key in case-insensitive path order,
    /// its live values after it, and a synthetic key-only row when a live key
    /// has no live values. Keys shadowed by an ancestor tombstone are
    /// excluded.
    pub fn export_all(&self) -> Result<Vec<ExportRow>, StoreError> {
        let conn = self.conn();

        let mut stmt = conn.prepare("SELECT key_path FROM keys WHERE is_deleted=1")?;
        let tombstones: HashSet<String> = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?
            .into_iter()
            .map(|p| case_fold(&p))
            .collect();
        let shadowed = |path: &str| {
            key_prefixes(path)
                .iter()
                .any(|p| tombstones.contains(&case_fold(p)))
        };

        struct KeyGroup {
            key_path: String,
            has_key_row: bool,
            values: Vec<(String, u32, Vec<u8>)>,
        }
        let mut groups: BTreeMap<String, KeyGroup> = BTreeMap::new();

        let mut stmt = conn.prepare("SELECT key_path FROM keys WHERE is_deleted=0")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let key_path: String = row.get(0)?;
            if shadowed(&key_path) {
                continue;
            }
            let folded = case_fold(&key_path);
            groups
                .entry(folded)
                .or_insert_with(|| KeyGroup {
                    key_path: key_path.clone(),
                    has_key_row: false,
                    values: Vec::new(),
                })
                .has_key_row = true;
        }

        let mut stmt = conn.prepare(
            "SELECT key_path, value_name, type, data FROM values_tbl \
             WHERE is_deleted=0 ORDER BY key_path, value_name",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let key_path: String = row.get(0)?;
            if shadowed(&key_path) {
                continue;
            }
            let name: String = row.get(1)?;
            let value_type = row.get::<_, i64>(2)? as u32;
            let data = row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default();
            let folded = case_fold(&key_path);
            groups
                .entry(folded)
                .or_insert_with(|| KeyGroup {
                    key_path: key_path.clone(),
                    has_key_row: false,
                    values: Vec::new(),
                })
                .values
                .push((name, value_type, data));
        }

        let mut out = Vec::new();
        for group in groups.into_values() {
            if group.has_key_row && group.values.is_empty() {
                out.push(ExportRow {
                    key_path: group.key_path.clone(),
                    value_name: String::new(),
                    value_type: 0,
                    data: Vec::new(),
                    is_key_only: true,
                });
            }
            for (name, value_type, data) in group.values {
                out.push(ExportRow {
                    key_path: group.key_path.clone(),
                    value_name: name,
                    value_type,
                    data,
                    is_key_only: false,
                });
            }
        }
        Ok(out)
    }
}

impl Drop for OverlayStore {
    fn drop(&mut self) {
        // Best-effort checkpoint on clean close so the -wal sidecar is merged
        // back and truncated.
        if let Ok(conn) = self.conn.get_mut() {
            let _ = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()));
        }
    }
}

fn put_key_tx(conn: &Connection, path: &str) -> Result<(), StoreError> {
    let now = now_unix_seconds();
    conn.execute(UPSERT_KEY_LIVE, params![path, now])?;
    // Un-tombstone existing ancestor rows; never insert them.
    for ancestor in key_prefixes(path).into_iter().skip(1) {
        conn.execute(
            "UPDATE keys SET is_deleted=0, updated_at=?2 WHERE key_path=?1 AND is_deleted=1",
            params![ancestor, now],
        )?;
    }
    Ok(())
}

fn is_key_deleted_on(conn: &Connection, path: &str) -> Result<bool, StoreError> {
    for prefix in key_prefixes(path) {
        let deleted: Option<i64> = conn
            .query_row(
                "SELECT is_deleted FROM keys WHERE key_path=?1 LIMIT 1",
                params![prefix],
                |r| r.get(0),
            )
            .optional()?;
        if deleted == Some(1) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Extracts the first path segment after `parent_len` bytes plus the
/// separator. Byte-indexed because the stored spelling may differ in case
/// from the query path.
fn child_segment(parent_len: usize, full: &str) -> Option<&str> {
    if full.len() <= parent_len + 1 {
        return None;
    }
    let rest = full.get(parent_len + 1..)?;
    let child = match rest.find('\\') {
        Some(pos) => &rest[..pos],
        None => rest,
    };
    if child.is_empty() { None } else { Some(child) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{REG_BINARY, REG_DWORD, REG_SZ};
    use crate::wide::utf16le_bytes_with_nul;

    fn open_temp_store() -> (tempfile::TempDir, OverlayStore) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = OverlayStore::open(dir.path().join("store.sqlite")).expect("open store");
        (dir, store)
    }

    #[test]
    fn value_round_trip_preserves_type_and_bytes() {
        let (_dir, store) = open_temp_store();
        let data = utf16le_bytes_with_nul("wrapped-ok");
        store
            .put_value("HKLM\\Software\\acme\\probe", "WorkflowValue", REG_SZ, &data)
            .unwrap();

        let v = store
            .get_value("HKLM\\Software\\acme\\probe", "WorkflowValue")
            .unwrap()
            .expect("value present");
        assert!(!v.is_deleted);
        assert_eq!(v.value_type, REG_SZ);
        assert_eq!(v.data, data);

        let rows = store.list_values("HKLM\\Software\\acme\\probe").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "WorkflowValue");
        assert!(!rows[0].is_deleted);
    }

    #[test]
    fn lookup_is_case_insensitive_but_preserves_spelling() {
        let (_dir, store) = open_temp_store();
        store
            .put_value("HKLM\\Software\\Acme", "Mixed", REG_DWORD, &[1, 0, 0, 0])
            .unwrap();

        let v = store
            .get_value("HKLM\\SOFTWARE\\ACME", "mixed")
            .unwrap()
            .expect("case-folded lookup hits");
        assert_eq!(v.value_type, REG_DWORD);

        let rows = store.list_values("hklm\\software\\acme").unwrap();
        assert_eq!(rows[0].name, "Mixed");
    }

    #[test]
    fn preserves_embedded_nul_in_key_and_value_names() {
        let (_dir, store) = open_temp_store();
        let key = "HKLM\\Soft\0Ware\\Case";
        let name = "Na\0me";
        let payload = [0x41u8, 0x00, 0x42, 0x00, 0x00];

        store.put_value(key, name, REG_BINARY, &payload).unwrap();

        let v = store.get_value(key, name).unwrap().expect("present");
        assert!(!v.is_deleted);
        assert_eq!(v.value_type, REG_BINARY);
        assert_eq!(v.data, payload);

        let rows = store.list_values(key).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, name);
    }

    #[test]
    fn keys_stay_distinct_and_tombstones_shadow() {
        let (_dir, store) = open_temp_store();
        store
            .put_value("HKLM\\Software\\One", "X", REG_BINARY, &[0xAA])
            .unwrap();
        store
            .put_value("HKLM\\Software\\Two", "X", REG_BINARY, &[0xBB])
            .unwrap();

        let a = store.get_value("HKLM\\Software\\One", "X").unwrap().unwrap();
        let b = store.get_value("HKLM\\Software\\Two", "X").unwrap().unwrap();
        assert_eq!(a.data, vec![0xAA]);
        assert_eq!(b.data, vec![0xBB]);

        store.delete_value("HKLM\\Software\\One", "X").unwrap();
        let a = store.get_value("HKLM\\Software\\One", "X").unwrap().unwrap();
        assert!(a.is_deleted);

        store.delete_key_tree("HKLM\\Software").unwrap();
        assert!(store.is_key_deleted("HKLM\\Software\\One").unwrap());
        assert!(store.is_key_deleted("HKLM\\Software\\Two").unwrap());
    }

    #[test]
    fn ancestor_tombstone_shadows_reads_and_listings() {
        let (_dir, store) = open_temp_store();
        store
            .put_value("HKLM\\A\\B", "x", REG_DWORD, &[1, 0, 0, 0])
            .unwrap();
        store.delete_key_tree("HKLM\\A").unwrap();

        let v = store.get_value("HKLM\\A\\B", "x").unwrap().unwrap();
        assert!(v.is_deleted);
        assert!(store.list_values("HKLM\\A\\B").unwrap().is_empty());
        assert!(store.list_immediate_subkeys("HKLM\\A").unwrap().is_empty());
        assert!(!store.key_exists_locally("HKLM\\A\\B").unwrap());
    }

    #[test]
    fn rewrite_untombstones_ancestors() {
        let (_dir, store) = open_temp_store();
        store
            .put_value("HKLM\\A\\B", "x", REG_DWORD, &[1, 0, 0, 0])
            .unwrap();
        store.delete_key_tree("HKLM\\A").unwrap();
        assert!(store.is_key_deleted("HKLM\\A\\B").unwrap());

        store.put_key("HKLM\\A\\B\\C").unwrap();
        assert!(!store.is_key_deleted("HKLM\\A").unwrap());
        assert!(!store.is_key_deleted("HKLM\\A\\B").unwrap());
        assert!(!store.is_key_deleted("HKLM\\A\\B\\C").unwrap());

        let children = store.list_immediate_subkeys("HKLM\\A").unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "B");
        assert!(!children[0].is_deleted);

        // The value deleted with the subtree stays tombstoned.
        let v = store.get_value("HKLM\\A\\B", "x").unwrap().unwrap();
        assert!(v.is_deleted);
    }

    #[test]
    fn subkey_listing_reports_tombstoned_children() {
        let (_dir, store) = open_temp_store();
        store.put_key("HKLM\\P\\Alive").unwrap();
        store.put_key("HKLM\\P\\Gone").unwrap();
        store.delete_key_tree("HKLM\\P\\Gone").unwrap();
        // Observed only through a deeper row.
        store.put_key("HKLM\\P\\Deep\\Leaf").unwrap();

        let children = store.list_immediate_subkeys("HKLM\\P").unwrap();
        let mut names: Vec<(String, bool)> = children
            .into_iter()
            .map(|c| (c.name, c.is_deleted))
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                ("Alive".to_string(), false),
                ("Deep".to_string(), false),
                ("Gone".to_string(), true),
            ]
        );
    }

    #[test]
    fn export_includes_key_only_rows_but_no_implicit_ancestors() {
        let (_dir, store) = open_temp_store();
        let base = "HKLM\\SOFTWARE\\ExampleVendor\\ExampleApp";
        store.put_key(&format!("{base}\\EmptyA")).unwrap();
        store.put_key(&format!("{base}\\EmptyB")).unwrap();
        store
            .put_value(base, "InstallDir", REG_BINARY, &[0x41, 0x42, 0x43])
            .unwrap();

        let rows = store.export_all().unwrap();
        assert!(!rows.is_empty());

        let has_key_only =
            |key: &str| rows.iter().any(|r| r.key_path == key && r.is_key_only);
        let has_value = |key: &str, name: &str| {
            rows.iter()
                .any(|r| r.key_path == key && !r.is_key_only && r.value_name == name)
        };
        let has_any = |key: &str| rows.iter().any(|r| r.key_path == key);

        assert!(has_key_only(&format!("{base}\\EmptyA")));
        assert!(has_key_only(&format!("{base}\\EmptyB")));
        assert!(has_value(base, "InstallDir"));

        // Writing under HKLM\SOFTWARE\... must not materialize the ancestors.
        assert!(!has_any("HKLM"));
        assert!(!has_any("HKLM\\SOFTWARE"));
    }

    #[test]
    fn export_skips_shadowed_subtrees() {
        let (_dir, store) = open_temp_store();
        store.put_key("HKLM\\Top\\Child").unwrap();
        store
            .put_value("HKLM\\Other", "v", REG_DWORD, &[7, 0, 0, 0])
            .unwrap();
        store.delete_key_tree("HKLM\\Top").unwrap();

        let rows = store.export_all().unwrap();
        assert!(rows.iter().all(|r| !r.key_path.starts_with("HKLM\\Top")));
        assert!(rows.iter().any(|r| r.key_path == "HKLM\\Other"));
    }
}

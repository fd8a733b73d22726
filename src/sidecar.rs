//! Sidecar relational store: extended attributes and checksums,
//! persisted in `.metadata.db` alongside the backing tree.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

/// Logical key-value store over three tables. All operations are
/// synchronous and serializable with respect to the calling thread; the
/// connection is guarded by a single mutex, released before any host
/// filesystem I/O the caller performs around it.
pub struct Sidecar {
    conn: Mutex<Connection>,
}

impl Sidecar {
    /// Open (creating if absent) the sidecar database at `db_path` and
    /// ensure its schema exists.
    pub fn open(db_path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS metadata (
                 path TEXT NOT NULL,
                 key TEXT NOT NULL,
                 value BLOB NOT NULL,
                 PRIMARY KEY (path, key)
             );
             CREATE TABLE IF NOT EXISTS checksums (
                 path TEXT PRIMARY KEY,
                 checksum TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS block_hashes (
                 path TEXT NOT NULL,
                 block_index INTEGER NOT NULL,
                 checksum TEXT NOT NULL,
                 PRIMARY KEY (path, block_index)
             );",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory sidecar, for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE metadata (path TEXT NOT NULL, key TEXT NOT NULL, value BLOB NOT NULL, PRIMARY KEY (path, key));
             CREATE TABLE checksums (path TEXT PRIMARY KEY, checksum TEXT NOT NULL);
             CREATE TABLE block_hashes (path TEXT NOT NULL, block_index INTEGER NOT NULL, checksum TEXT NOT NULL, PRIMARY KEY (path, block_index));",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn put_xattr(&self, path: &str, key: &str, value: &[u8]) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO metadata (path, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(path, key) DO UPDATE SET value = excluded.value",
            params![path, key, value],
        )?;
        Ok(())
    }

    pub fn get_xattr(&self, path: &str, key: &str) -> rusqlite::Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM metadata WHERE path = ?1 AND key = ?2",
            params![path, key],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn list_xattr(&self, path: &str) -> rusqlite::Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT key FROM metadata WHERE path = ?1")?;
        let rows = stmt.query_map(params![path], |row| row.get(0))?;
        rows.collect()
    }

    pub fn del_xattrs(&self, path: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM metadata WHERE path = ?1", params![path])?;
        Ok(())
    }

    /// Remove a single attribute, for `removexattr`.
    pub fn del_xattr_key(&self, path: &str, key: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM metadata WHERE path = ?1 AND key = ?2", params![path, key])?;
        Ok(())
    }

    pub fn put_digest(&self, path: &str, digest: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO checksums (path, checksum) VALUES (?1, ?2)
             ON CONFLICT(path) DO UPDATE SET checksum = excluded.checksum",
            params![path, digest],
        )?;
        Ok(())
    }

    pub fn get_digest(&self, path: &str) -> rusqlite::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT checksum FROM checksums WHERE path = ?1",
            params![path],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn del_digest(&self, path: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM checksums WHERE path = ?1", params![path])?;
        Ok(())
    }

    pub fn put_block(&self, path: &str, index: u64, digest: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO block_hashes (path, block_index, checksum) VALUES (?1, ?2, ?3)
             ON CONFLICT(path, block_index) DO UPDATE SET checksum = excluded.checksum",
            params![path, index as i64, digest],
        )?;
        Ok(())
    }

    pub fn get_block(&self, path: &str, index: u64) -> rusqlite::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT checksum FROM block_hashes WHERE path = ?1 AND block_index = ?2",
            params![path, index as i64],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn del_blocks_after(&self, path: &str, index: u64) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM block_hashes WHERE path = ?1 AND block_index > ?2",
            params![path, index as i64],
        )?;
        Ok(())
    }

    pub fn del_all_blocks(&self, path: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM block_hashes WHERE path = ?1", params![path])?;
        Ok(())
    }

    /// Relabel every row referring to `old` (exact match, or a
    /// descendant of it for directory renames) to refer to `new`
    /// instead, inside one transaction so observers see either the
    /// before or the after state.
    pub fn rename_path(&self, old: &str, new: &str) -> rusqlite::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for table in ["metadata", "checksums", "block_hashes"] {
            rename_in_table(&tx, table, old, new)?;
        }
        tx.commit()
    }
}

fn rename_in_table(
    tx: &rusqlite::Transaction<'_>,
    table: &str,
    old: &str,
    new: &str,
) -> rusqlite::Result<()> {
    let exact_sql = format!("UPDATE {table} SET path = ?2 WHERE path = ?1");
    tx.execute(&exact_sql, params![old, new])?;

    let prefix = format!("{old}/");
    let select_sql = format!("SELECT DISTINCT path FROM {table} WHERE path LIKE ?1");
    let like_pattern = format!("{}%", escape_like(&prefix));
    let descendants: Vec<String> = {
        let mut stmt = tx.prepare(&select_sql)?;
        let rows = stmt.query_map(params![like_pattern], |row| row.get::<_, String>(0))?;
        rows.filter_map(Result::ok).filter(|p| p.starts_with(&prefix)).collect()
    };
    let update_sql = format!("UPDATE {table} SET path = ?2 WHERE path = ?1");
    for descendant in descendants {
        let suffix = &descendant[prefix.len()..];
        let updated = format!("{new}/{suffix}");
        tx.execute(&update_sql, params![descendant, updated])?;
    }
    Ok(())
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xattr_roundtrip() {
        let s = Sidecar::open_in_memory().unwrap();
        s.put_xattr("/a.txt", "user.author", b"Soham").unwrap();
        assert_eq!(s.get_xattr("/a.txt", "user.author").unwrap(), Some(b"Soham".to_vec()));
        assert_eq!(s.list_xattr("/a.txt").unwrap(), vec!["user.author".to_string()]);
    }

    #[test]
    fn del_xattr_key_removes_one_attribute() {
        let s = Sidecar::open_in_memory().unwrap();
        s.put_xattr("/a.txt", "user.a", b"1").unwrap();
        s.put_xattr("/a.txt", "user.b", b"2").unwrap();
        s.del_xattr_key("/a.txt", "user.a").unwrap();
        assert_eq!(s.get_xattr("/a.txt", "user.a").unwrap(), None);
        assert_eq!(s.get_xattr("/a.txt", "user.b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn digest_roundtrip() {
        let s = Sidecar::open_in_memory().unwrap();
        assert_eq!(s.get_digest("/a.txt").unwrap(), None);
        s.put_digest("/a.txt", "deadbeef").unwrap();
        assert_eq!(s.get_digest("/a.txt").unwrap(), Some("deadbeef".to_string()));
        s.del_digest("/a.txt").unwrap();
        assert_eq!(s.get_digest("/a.txt").unwrap(), None);
    }

    #[test]
    fn rename_relabels_exact_and_descendants() {
        let s = Sidecar::open_in_memory().unwrap();
        s.put_digest("/dir/a.txt", "aaaa").unwrap();
        s.put_xattr("/dir/a.txt", "user.k", b"v").unwrap();
        s.put_digest("/dir/sub/b.txt", "bbbb").unwrap();
        s.rename_path("/dir", "/moved").unwrap();

        assert_eq!(s.get_digest("/dir/a.txt").unwrap(), None);
        assert_eq!(s.get_digest("/moved/a.txt").unwrap(), Some("aaaa".to_string()));
        assert_eq!(s.get_digest("/moved/sub/b.txt").unwrap(), Some("bbbb".to_string()));
        assert_eq!(s.list_xattr("/moved/a.txt").unwrap(), vec!["user.k".to_string()]);
    }

    #[test]
    fn rename_does_not_touch_sibling_with_shared_prefix() {
        let s = Sidecar::open_in_memory().unwrap();
        s.put_digest("/dir/a.txt", "aaaa").unwrap();
        s.put_digest("/dirty/b.txt", "bbbb").unwrap();
        s.rename_path("/dir", "/moved").unwrap();
        assert_eq!(s.get_digest("/dirty/b.txt").unwrap(), Some("bbbb".to_string()));
    }

    #[test]
    fn block_hash_lifecycle() {
        let s = Sidecar::open_in_memory().unwrap();
        s.put_block("/f.bin", 0, "h0").unwrap();
        s.put_block("/f.bin", 1, "h1").unwrap();
        s.put_block("/f.bin", 2, "h2").unwrap();
        s.del_blocks_after("/f.bin", 0).unwrap();
        assert_eq!(s.get_block("/f.bin", 0).unwrap(), Some("h0".to_string()));
        assert_eq!(s.get_block("/f.bin", 1).unwrap(), None);
        assert_eq!(s.get_block("/f.bin", 2).unwrap(), None);
    }
}

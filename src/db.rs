//! Low-level SQLite adapter shared by both mappers.
//!
//! Owns the rusqlite `Connection`, the transaction boundary and a couple
//! of schema introspection helpers. Writes open a deferred transaction
//! lazily; nothing is visible to other connections until [`SqliteAdapter::commit`].
//! Dropping the adapter without committing rolls the pending work back.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use rusqlite::Connection;
use tracing::debug;

use crate::error::Result;

const BUSY_TIMEOUT_MS: u64 = 1000;

thread_local! {
    // Mappers with a table prefix share one physical file; reopening it
    // through a second connection would not see the first one's
    // uncommitted rows, so prefixed opens reuse the live connection.
    static OPEN_CONNECTIONS: RefCell<HashMap<String, Weak<ConnectionHolder>>> =
        RefCell::new(HashMap::new());
}

struct ConnectionHolder {
    conn: Connection,
    in_transaction: RefCell<bool>,
}

impl Drop for ConnectionHolder {
    fn drop(&mut self) {
        if *self.in_transaction.borrow() {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

pub struct SqliteAdapter {
    holder: Rc<ConnectionHolder>,
    path: String,
}

impl SqliteAdapter {
    /// Open (or create) the database at `path`. With `reuse` a live
    /// connection to the same path on this thread is shared instead of
    /// opening a second one.
    pub fn open(path: &str, reuse: bool) -> Result<SqliteAdapter> {
        if reuse {
            let existing = OPEN_CONNECTIONS.with(|map| {
                map.borrow().get(path).and_then(Weak::upgrade)
            });
            if let Some(holder) = existing {
                debug!(path, "reusing open connection");
                return Ok(SqliteAdapter {
                    holder,
                    path: path.to_string(),
                });
            }
        }
        let conn = if path.is_empty() || path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        debug!(path, "connection opened");
        let holder = Rc::new(ConnectionHolder {
            conn,
            in_transaction: RefCell::new(false),
        });
        if reuse && !path.is_empty() && path != ":memory:" {
            OPEN_CONNECTIONS.with(|map| {
                let mut map = map.borrow_mut();
                // entries whose holder is gone never get upgraded again
                map.retain(|_, weak| weak.strong_count() > 0);
                map.insert(path.to_string(), Rc::downgrade(&holder));
            });
        }
        Ok(SqliteAdapter {
            holder,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn connection(&self) -> &Connection {
        &self.holder.conn
    }

    /// Open the deferred write transaction if none is pending.
    pub fn ensure_transaction(&self) -> Result<()> {
        let mut in_tx = self.holder.in_transaction.borrow_mut();
        if !*in_tx {
            self.holder.conn.execute_batch("BEGIN DEFERRED")?;
            *in_tx = true;
        }
        Ok(())
    }

    /// Commit pending writes. A no-op when nothing was written.
    pub fn commit(&self) -> Result<()> {
        let mut in_tx = self.holder.in_transaction.borrow_mut();
        if *in_tx {
            self.holder.conn.execute_batch("COMMIT")?;
            *in_tx = false;
        }
        Ok(())
    }

    /// Roll back pending writes explicitly.
    pub fn rollback(&self) -> Result<()> {
        let mut in_tx = self.holder.in_transaction.borrow_mut();
        if *in_tx {
            self.holder.conn.execute_batch("ROLLBACK")?;
            *in_tx = false;
        }
        Ok(())
    }

    /// Execute a statement inside the write transaction.
    pub fn execute(&self, sql: &str, params: impl rusqlite::Params) -> Result<usize> {
        self.ensure_transaction()?;
        Ok(self.holder.conn.execute(sql, params)?)
    }

    pub fn last_insert_rowid(&self) -> i64 {
        self.holder.conn.last_insert_rowid()
    }

    pub fn get_version(&self) -> Result<i64> {
        let v: i64 = self
            .holder
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(v)
    }

    pub fn set_version(&self, version: i64) -> Result<()> {
        self.ensure_transaction()?;
        self.holder
            .conn
            .pragma_update(None, "user_version", version)?;
        Ok(())
    }

    /// Names of the user tables, sorted.
    pub fn get_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self.holder.conn.prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub fn has_table(&self, name: &str) -> Result<bool> {
        let count: i64 = self.holder.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Column names of a table, in declaration order.
    pub fn get_table_columns(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .holder
            .conn
            .prepare(&format!("PRAGMA table_info({})", quoted(table)))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }
}

/// Double-quote an identifier for interpolation into SQL.
pub fn quoted(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_pragma_round_trip() {
        let db = SqliteAdapter::open(":memory:", false).unwrap();
        assert_eq!(db.get_version().unwrap(), 0);
        db.set_version(1).unwrap();
        assert_eq!(db.get_version().unwrap(), 1);
    }

    #[test]
    fn stale_connection_entries_are_swept() {
        let dir = std::env::temp_dir();
        let pid = std::process::id();
        let first = dir
            .join(format!("objmap_db_sweep_a_{}.sqlite", pid))
            .to_string_lossy()
            .into_owned();
        let second = dir
            .join(format!("objmap_db_sweep_b_{}.sqlite", pid))
            .to_string_lossy()
            .into_owned();
        let _ = std::fs::remove_file(&first);
        let _ = std::fs::remove_file(&second);

        {
            let _db = SqliteAdapter::open(&first, true).unwrap();
        }
        // the next tracked open drops the dead entry
        let _db = SqliteAdapter::open(&second, true).unwrap();
        OPEN_CONNECTIONS.with(|map| {
            let map = map.borrow();
            assert!(!map.contains_key(&first));
            assert!(map.contains_key(&second));
        });
    }

    #[test]
    fn table_introspection() {
        let db = SqliteAdapter::open(":memory:", false).unwrap();
        db.execute("CREATE TABLE Things (id INTEGER PRIMARY KEY, label TEXT)", [])
            .unwrap();
        assert!(db.has_table("Things").unwrap());
        assert!(!db.has_table("Nothing").unwrap());
        assert_eq!(db.get_tables().unwrap(), vec!["Things".to_string()]);
        assert_eq!(
            db.get_table_columns("Things").unwrap(),
            vec!["id".to_string(), "label".to_string()]
        );
    }
}

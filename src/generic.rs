//! Generic mapper: one row per object-tree node.
//!
//! Any graph of [`Object`]s persists into two wide tables, `Objects` and
//! `Relations`. Child rows carry dotted names whose components encode the
//! ancestor ids (an object's name prefix is its dotted name with the last
//! component replaced by its own id), which lets a whole subtree be
//! fetched with a single `LIKE` on the prefix.

use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::rc::Rc;

use rusqlite::params;
use seahash::SeaHasher;
use tracing::{debug, warn};

use crate::db::SqliteAdapter;
use crate::error::{MapperError, Result};
use crate::object::{Object, ObjId, SharedObject};
use crate::registry::ClassRegistry;

type IdHasher = BuildHasherDefault<SeaHasher>;

/// Placeholder stored for a pointer whose target has no id yet. Rewritten
/// by the fix-up pass at the end of the same `update_to` call.
const PENDING_VALUE: &str = "Pending update";

const SCHEMA_VERSION: i64 = 1;

/// One raw row of the `Objects` table.
#[derive(Debug, Clone)]
pub struct ObjectRow {
    pub id: ObjId,
    pub parent_id: Option<ObjId>,
    pub name: String,
    pub class_name: String,
    pub value: Option<String>,
    pub label: Option<String>,
    pub comment: Option<String>,
    pub creation: Option<String>,
}

/// One raw row of the `Relations` table.
#[derive(Debug, Clone)]
pub struct RelationRow {
    pub id: i64,
    pub name: String,
    pub creator_id: Option<ObjId>,
    pub creation: Option<String>,
    pub parent_object_id: Option<ObjId>,
    pub child_object_id: Option<ObjId>,
    pub parent_extended: Option<String>,
    pub child_extended: Option<String>,
}

const SELECT_OBJECT: &str =
    "SELECT id, parent_id, name, classname, value, label, comment, creation FROM Objects ";

const SELECT_RELATION: &str = "SELECT id, name, parent_id, creation, object_parent_id, \
     object_child_id, object_parent_extended, object_child_extended FROM Relations ";

/// SQL layer over the two generic tables.
pub struct ObjectsDb {
    db: SqliteAdapter,
}

impl ObjectsDb {
    pub fn open(path: &str) -> Result<ObjectsDb> {
        let db = SqliteAdapter::open(path, false)?;
        let objects_db = ObjectsDb { db };
        objects_db.create_tables()?;
        Ok(objects_db)
    }

    fn create_tables(&self) -> Result<()> {
        let version = self.db.get_version()?;
        let fresh = !self.db.has_table("Objects")?;
        self.db.execute(
            "CREATE TABLE IF NOT EXISTS Objects (
                 id        INTEGER PRIMARY KEY AUTOINCREMENT,
                 parent_id INTEGER REFERENCES Objects (id),
                 name      TEXT,
                 classname TEXT,
                 value     TEXT DEFAULT NULL,
                 label     TEXT DEFAULT NULL,
                 comment   TEXT DEFAULT NULL,
                 creation  DATE
             )",
            [],
        )?;
        self.db.execute(
            "CREATE TABLE IF NOT EXISTS Relations (
                 id                     INTEGER PRIMARY KEY AUTOINCREMENT,
                 parent_id              INTEGER REFERENCES Objects (id),
                 name                   TEXT,
                 classname              TEXT,
                 value                  TEXT DEFAULT NULL,
                 label                  TEXT DEFAULT NULL,
                 comment                TEXT DEFAULT NULL,
                 creation               DATE,
                 object_parent_id       INTEGER REFERENCES Objects (id),
                 object_child_id        INTEGER REFERENCES Objects (id),
                 object_parent_extended TEXT DEFAULT NULL,
                 object_child_extended  TEXT DEFAULT NULL
             )",
            [],
        )?;
        if !fresh && version < SCHEMA_VERSION {
            self.upgrade_tables()?;
        }
        self.db.set_version(SCHEMA_VERSION)?;
        Ok(())
    }

    // Version 0 files predate the extended relation endpoints.
    fn upgrade_tables(&self) -> Result<()> {
        let columns = self.db.get_table_columns("Relations")?;
        for column in ["object_parent_extended", "object_child_extended"] {
            if !columns.iter().any(|c| c == column) {
                debug!(column, "upgrading Relations table");
                self.db.execute(
                    &format!("ALTER TABLE Relations ADD COLUMN {} TEXT DEFAULT NULL", column),
                    [],
                )?;
            }
        }
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.db.commit()
    }

    pub fn version(&self) -> Result<i64> {
        self.db.get_version()
    }

    /// Insert a row, returning the id (assigned by SQLite when `id` is
    /// `None`).
    pub fn insert_object(
        &self,
        id: Option<ObjId>,
        class_name: &str,
        value: Option<String>,
        parent_id: Option<ObjId>,
        name: &str,
        label: &str,
        comment: &str,
    ) -> Result<ObjId> {
        self.db.execute(
            "INSERT INTO Objects (id, parent_id, name, classname, value, label, comment, creation) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))",
            params![id, parent_id, name, class_name, value, label, comment],
        )?;
        Ok(match id {
            Some(id) => id,
            None => self.db.last_insert_rowid(),
        })
    }

    pub fn update_object(
        &self,
        id: ObjId,
        class_name: &str,
        value: Option<String>,
        parent_id: Option<ObjId>,
        name: &str,
        label: &str,
        comment: &str,
    ) -> Result<()> {
        self.db.execute(
            "UPDATE Objects SET parent_id = ?1, name = ?2, classname = ?3, value = ?4, \
             label = ?5, comment = ?6 WHERE id = ?7",
            params![parent_id, name, class_name, value, label, comment, id],
        )?;
        Ok(())
    }

    fn row_from(row: &rusqlite::Row) -> rusqlite::Result<ObjectRow> {
        Ok(ObjectRow {
            id: row.get(0)?,
            parent_id: row.get(1)?,
            name: row.get(2)?,
            class_name: row.get(3)?,
            value: row.get(4)?,
            label: row.get(5)?,
            comment: row.get(6)?,
            creation: row.get(7)?,
        })
    }

    pub fn select_object_by_id(&self, id: ObjId) -> Result<Option<ObjectRow>> {
        let mut stmt = self
            .db
            .connection()
            .prepare(&format!("{}WHERE id = ?1", SELECT_OBJECT))?;
        let mut rows = stmt.query_map([id], Self::row_from)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// All rows below a name prefix, in id order (parents before
    /// children).
    pub fn select_objects_by_ancestor(&self, name_prefix: &str) -> Result<Vec<ObjectRow>> {
        let pattern = format!("{}.%", name_prefix);
        let mut stmt = self
            .db
            .connection()
            .prepare(&format!("{}WHERE name LIKE ?1 ORDER BY id", SELECT_OBJECT))?;
        let rows = stmt
            .query_map([pattern], Self::row_from)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn select_root_objects(&self) -> Result<Vec<ObjectRow>> {
        let mut stmt = self.db.connection().prepare(&format!(
            "{}WHERE parent_id IS NULL ORDER BY id",
            SELECT_OBJECT
        ))?;
        let rows = stmt
            .query_map([], Self::row_from)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn select_objects_by_class(&self, class_name: &str) -> Result<Vec<ObjectRow>> {
        let mut stmt = self.db.connection().prepare(&format!(
            "{}WHERE classname = ?1 ORDER BY id",
            SELECT_OBJECT
        ))?;
        let rows = stmt
            .query_map([class_name], Self::row_from)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn exists(&self, id: ObjId) -> Result<bool> {
        let count: i64 = self.db.connection().query_row(
            "SELECT COUNT(*) FROM Objects WHERE id = ?1",
            [id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn delete_object(&self, id: ObjId) -> Result<()> {
        self.db
            .execute("DELETE FROM Objects WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn delete_child_objects(&self, name_prefix: &str) -> Result<()> {
        let pattern = format!("{}.%", name_prefix);
        self.db
            .execute("DELETE FROM Objects WHERE name LIKE ?1", [pattern])?;
        Ok(())
    }

    /// Delete descendants of the prefix whose ids are not in `keep`.
    /// Used after an update to drop children removed from the tree.
    pub fn delete_missing_objects_by_ancestor(
        &self,
        name_prefix: &str,
        keep: &[ObjId],
    ) -> Result<()> {
        let id_list = keep
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let pattern = format!("{}.%", name_prefix);
        self.db.execute(
            &format!(
                "DELETE FROM Objects WHERE name LIKE ?1 AND id NOT IN ({})",
                id_list
            ),
            [pattern],
        )?;
        Ok(())
    }

    pub fn delete_all(&self) -> Result<()> {
        self.db.execute("DELETE FROM Objects", [])?;
        self.db.execute("DELETE FROM Relations", [])?;
        // reset the AUTOINCREMENT counters
        if self.db.has_table("sqlite_sequence")? {
            self.db.execute(
                "DELETE FROM sqlite_sequence WHERE name IN ('Objects', 'Relations')",
                [],
            )?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_relation(
        &self,
        name: &str,
        creator_id: ObjId,
        parent_object_id: ObjId,
        child_object_id: ObjId,
        parent_extended: Option<&str>,
        child_extended: Option<&str>,
    ) -> Result<()> {
        self.db.execute(
            "INSERT INTO Relations (parent_id, name, object_parent_id, object_child_id, \
             creation, object_parent_extended, object_child_extended) \
             VALUES (?1, ?2, ?3, ?4, datetime('now'), ?5, ?6)",
            params![
                creator_id,
                name,
                parent_object_id,
                child_object_id,
                parent_extended,
                child_extended
            ],
        )?;
        Ok(())
    }

    fn relation_from(row: &rusqlite::Row) -> rusqlite::Result<RelationRow> {
        Ok(RelationRow {
            id: row.get(0)?,
            name: row.get(1)?,
            creator_id: row.get(2)?,
            creation: row.get(3)?,
            parent_object_id: row.get(4)?,
            child_object_id: row.get(5)?,
            parent_extended: row.get(6)?,
            child_extended: row.get(7)?,
        })
    }

    fn select_relations(
        &self,
        where_clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<RelationRow>> {
        let mut stmt = self
            .db
            .connection()
            .prepare(&format!("{}{} ORDER BY id", SELECT_RELATION, where_clause))?;
        let rows = stmt
            .query_map(params, Self::relation_from)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn select_relations_by_creator(&self, creator_id: ObjId) -> Result<Vec<RelationRow>> {
        self.select_relations("WHERE parent_id = ?1", [creator_id])
    }

    pub fn select_relations_by_name(&self, name: &str) -> Result<Vec<RelationRow>> {
        self.select_relations("WHERE name = ?1", [name])
    }

    pub fn select_relation_children(
        &self,
        name: &str,
        parent_object_id: ObjId,
    ) -> Result<Vec<RelationRow>> {
        self.select_relations(
            "WHERE name = ?1 AND object_parent_id = ?2",
            params![name, parent_object_id],
        )
    }

    pub fn select_relation_parents(
        &self,
        name: &str,
        child_object_id: ObjId,
    ) -> Result<Vec<RelationRow>> {
        self.select_relations(
            "WHERE name = ?1 AND object_child_id = ?2",
            params![name, child_object_id],
        )
    }

    pub fn delete_relations_by_creator(&self, creator_id: ObjId) -> Result<()> {
        self.db
            .execute("DELETE FROM Relations WHERE parent_id = ?1", [creator_id])?;
        Ok(())
    }
}

/// The generic object mapper.
pub struct SqliteMapper {
    db: ObjectsDb,
    registry: Rc<ClassRegistry>,
    // id -> live object, shared by nested reconstruction within one
    // top-level select; cleared when a new top-level select starts.
    obj_dict: HashMap<ObjId, SharedObject, IdHasher>,
    update_dict: HashMap<ObjId, String, IdHasher>,
    pending_pointers: Vec<SharedObject>,
}

impl SqliteMapper {
    pub fn open(path: &str, registry: Rc<ClassRegistry>) -> Result<SqliteMapper> {
        Ok(SqliteMapper {
            db: ObjectsDb::open(path)?,
            registry,
            obj_dict: HashMap::default(),
            update_dict: HashMap::default(),
            pending_pointers: Vec::new(),
        })
    }

    pub fn commit(&self) -> Result<()> {
        self.db.commit()
    }

    pub fn db(&self) -> &ObjectsDb {
        &self.db
    }

    /// Insert if the object is new, update otherwise.
    pub fn store(&mut self, obj: &SharedObject) -> Result<()> {
        if obj.borrow().has_id() {
            self.update_to(obj)
        } else {
            self.insert(obj)
        }
    }

    /// The object's name prefix: its dotted name with the last component
    /// replaced by its own id (just the id for single-component names).
    fn name_prefix(obj: &Object) -> String {
        let name = obj.name();
        match name.rsplit_once('.') {
            Some((head, _)) => format!("{}.{}", head, obj.str_id()),
            None => obj.str_id(),
        }
    }

    /// Value text for a row. Pointers store the target id; a target not
    /// yet persisted gets the pending placeholder and is queued for the
    /// fix-up pass.
    fn object_value(&mut self, obj: &SharedObject) -> Option<String> {
        let inner = obj.borrow();
        if inner.is_pointer() {
            return match inner.target() {
                None => None,
                Some(target) => match target.borrow().id() {
                    Some(id) => Some(id.to_string()),
                    None => {
                        self.pending_pointers.push(obj.clone());
                        Some(PENDING_VALUE.to_string())
                    }
                },
            };
        }
        inner.stored_value().stored_text()
    }

    // ------------- insert -------------

    pub fn insert(&mut self, obj: &SharedObject) -> Result<()> {
        self.insert_node(obj)
    }

    fn insert_node(&mut self, obj: &SharedObject) -> Result<()> {
        let value = self.object_value(obj);
        let (id, name, class_name, parent_id, label, comment) = {
            let inner = obj.borrow();
            (
                inner.id(),
                inner.name().to_string(),
                inner.class_name().to_string(),
                inner.parent_id(),
                inner.label().to_string(),
                inner.comment().to_string(),
            )
        };
        let new_id = self
            .db
            .insert_object(id, &class_name, value, parent_id, &name, &label, &comment)?;
        obj.borrow_mut().set_id(Some(new_id));
        // nodes inserted during an update must survive the final cleanup
        self.update_dict.insert(new_id, name.clone());
        let prefix = Self::name_prefix(&obj.borrow());
        let children = obj.borrow().attributes_to_store();
        for (key, child) in children {
            {
                let mut c = child.borrow_mut();
                c.set_parent_id(Some(new_id));
                c.set_name(&format!("{}.{}", prefix, key));
            }
            self.insert_node(&child)?;
        }
        Ok(())
    }

    // ------------- update -------------

    /// Write the object tree over its stored rows: update existing nodes,
    /// insert new ones, resolve pending pointers, then delete stored
    /// descendants that are no longer in the tree.
    pub fn update_to(&mut self, obj: &SharedObject) -> Result<()> {
        self.update_dict.clear();
        self.pending_pointers.clear();
        self.update_node(obj)?;
        let pending = std::mem::take(&mut self.pending_pointers);
        for ptr in pending {
            let value = self.object_value(&ptr);
            let inner = ptr.borrow();
            if let Some(id) = inner.id() {
                self.db.update_object(
                    id,
                    inner.class_name(),
                    value,
                    inner.parent_id(),
                    inner.name(),
                    inner.label(),
                    inner.comment(),
                )?;
            }
        }
        let keep: Vec<ObjId> = self.update_dict.keys().copied().collect();
        let prefix = Self::name_prefix(&obj.borrow());
        self.db.delete_missing_objects_by_ancestor(&prefix, &keep)?;
        Ok(())
    }

    fn update_node(&mut self, obj: &SharedObject) -> Result<()> {
        let value = self.object_value(obj);
        {
            let inner = obj.borrow();
            let id = inner
                .id()
                .ok_or_else(|| MapperError::NotPersisted(inner.name().to_string()))?;
            self.db.update_object(
                id,
                inner.class_name(),
                value,
                inner.parent_id(),
                inner.name(),
                inner.label(),
                inner.comment(),
            )?;
            if self.update_dict.contains_key(&id) {
                return Err(MapperError::CircularReference(inner.name_id()));
            }
            self.update_dict.insert(id, inner.name().to_string());
        }
        let (obj_id, prefix) = {
            let inner = obj.borrow();
            (inner.id(), Self::name_prefix(&inner))
        };
        let children = obj.borrow().attributes_to_store();
        for (key, child) in children {
            let has_id = child.borrow().has_id();
            if has_id {
                self.update_node(&child)?;
            } else {
                {
                    let mut c = child.borrow_mut();
                    c.set_parent_id(obj_id);
                    c.set_name(&format!("{}.{}", prefix, key));
                }
                self.insert_node(&child)?;
            }
        }
        Ok(())
    }

    /// Refresh a live object from its stored rows.
    pub fn update_from(&mut self, obj: &SharedObject) -> Result<()> {
        let id = obj
            .borrow()
            .id()
            .ok_or_else(|| MapperError::NotPersisted(obj.borrow().name().to_string()))?;
        match self.db.select_object_by_id(id)? {
            Some(row) => self.fill_object(obj, &row),
            None => Err(MapperError::Persistence(format!(
                "object with id {} no longer exists",
                id
            ))),
        }
    }

    // ------------- select -------------

    /// Fetch an object (with its whole subtree) by id. Hits the in-memory
    /// cache when the id was already reconstructed by this mapper.
    pub fn select_by_id(&mut self, id: ObjId) -> Result<Option<SharedObject>> {
        if let Some(obj) = self.obj_dict.get(&id) {
            return Ok(Some(obj.clone()));
        }
        let row = match self.db.select_object_by_id(id)? {
            Some(row) => row,
            None => return Ok(None),
        };
        let obj = match self.registry.build(&row.class_name) {
            Some(obj) => obj.shared(),
            None => return Ok(None),
        };
        self.fill_object(&obj, &row)?;
        Ok(Some(obj))
    }

    /// All root objects (`parent_id IS NULL`), fully reconstructed.
    pub fn select_all(&mut self) -> Result<Vec<SharedObject>> {
        self.obj_dict.clear();
        let rows = self.db.select_root_objects()?;
        self.build_from_rows(rows)
    }

    /// All objects stored under exactly this class name. The registry is
    /// closed, so no subclass expansion happens; pass several names for
    /// polymorphic selection.
    pub fn select_by_class(&mut self, class_name: &str) -> Result<Vec<SharedObject>> {
        self.obj_dict.clear();
        let rows = self.db.select_objects_by_class(class_name)?;
        self.build_from_rows(rows)
    }

    fn build_from_rows(&mut self, rows: Vec<ObjectRow>) -> Result<Vec<SharedObject>> {
        let mut objects = Vec::with_capacity(rows.len());
        for row in rows {
            let obj = match self.registry.build(&row.class_name) {
                Some(obj) => obj.shared(),
                None => continue,
            };
            self.fill_object(&obj, &row)?;
            objects.push(obj);
        }
        Ok(objects)
    }

    pub fn exists(&self, id: ObjId) -> Result<bool> {
        self.db.exists(id)
    }

    pub fn get_parent(&mut self, obj: &SharedObject) -> Result<Option<SharedObject>> {
        let parent_id = obj.borrow().parent_id();
        match parent_id {
            Some(id) => self.select_by_id(id),
            None => Ok(None),
        }
    }

    fn fill_object(&mut self, obj: &SharedObject, row: &ObjectRow) -> Result<()> {
        self.fill_object_with_row(obj, row)?;
        let prefix = Self::name_prefix(&obj.borrow());
        let child_rows = self.db.select_objects_by_ancestor(&prefix)?;
        for child_row in child_rows {
            let parts: Vec<&str> = child_row.name.split('.').collect();
            if parts.len() < 2 {
                warn!(name = %child_row.name, "malformed child name, row skipped");
                continue;
            }
            let child_name = parts[parts.len() - 1].to_string();
            let parent_id = match parts[parts.len() - 2].parse::<ObjId>() {
                Ok(id) => id,
                Err(_) => {
                    warn!(name = %child_row.name, "child name does not encode a parent id, row skipped");
                    continue;
                }
            };
            // Parents come first in id order; a miss means the parent row
            // was skipped or the file is inconsistent.
            let parent = match self.obj_dict.get(&parent_id) {
                Some(parent) => parent.clone(),
                None => {
                    warn!(
                        name = %child_row.name,
                        parent_id,
                        "parent object not found, child row skipped"
                    );
                    continue;
                }
            };
            let existing = parent.borrow().attr(&child_name);
            let child = match existing {
                Some(child) => child,
                None => {
                    let built = match self.registry.build(&child_row.class_name) {
                        Some(obj) => obj.shared(),
                        None => continue,
                    };
                    parent
                        .borrow_mut()
                        .attach_loaded_child(&child_name, built.clone());
                    built
                }
            };
            self.fill_object_with_row(&child, &child_row)?;
        }
        Ok(())
    }

    fn fill_object_with_row(&mut self, obj: &SharedObject, row: &ObjectRow) -> Result<()> {
        {
            let mut inner = obj.borrow_mut();
            inner.set_id(Some(row.id));
            inner.set_parent_id(row.parent_id);
            inner.set_name(&row.name);
            inner.set_label(row.label.as_deref().unwrap_or(""));
            inner.set_comment(row.comment.as_deref().unwrap_or(""));
            inner.set_creation(row.creation.clone());
        }
        self.obj_dict.insert(row.id, obj.clone());
        let is_pointer = obj.borrow().is_pointer();
        if is_pointer {
            let target = match row.value.as_deref() {
                None => None,
                Some(raw) => match raw.parse::<ObjId>() {
                    Ok(target_id) => self.select_by_id(target_id)?,
                    Err(_) => {
                        warn!(id = row.id, value = raw, "unresolvable pointer value");
                        None
                    }
                },
            };
            // The extended path arrives in its own child row; keep it.
            obj.borrow_mut().set_target_raw(target, false);
        } else {
            let result = obj.borrow_mut().set_stored(row.value.as_deref());
            if let Err(e) = result {
                warn!(
                    id = row.id,
                    name = %row.name,
                    error = %e,
                    "stored value no longer fits the attribute type, default kept"
                );
            }
        }
        Ok(())
    }

    // ------------- delete -------------

    pub fn delete(&mut self, obj: &SharedObject) -> Result<()> {
        let inner = obj.borrow();
        let id = inner
            .id()
            .ok_or_else(|| MapperError::NotPersisted(inner.name().to_string()))?;
        self.db.delete_child_objects(&Self::name_prefix(&inner))?;
        self.db.delete_object(id)?;
        Ok(())
    }

    pub fn delete_children(&mut self, obj: &SharedObject) -> Result<()> {
        let inner = obj.borrow();
        if !inner.has_id() {
            return Err(MapperError::NotPersisted(inner.name().to_string()));
        }
        self.db.delete_child_objects(&Self::name_prefix(&inner))
    }

    pub fn delete_all(&mut self) -> Result<()> {
        self.obj_dict.clear();
        self.db.delete_all()
    }

    // ------------- relations -------------

    /// Record a named relation between two stored objects, attributed to
    /// a stored creator (typically the producing workflow step).
    pub fn insert_relation(
        &mut self,
        name: &str,
        creator: &SharedObject,
        parent: &SharedObject,
        child: &SharedObject,
        parent_extended: Option<&str>,
        child_extended: Option<&str>,
    ) -> Result<()> {
        let creator_id = Self::require_id(creator)?;
        let parent_id = Self::require_id(parent)?;
        let child_id = Self::require_id(child)?;
        self.db.insert_relation(
            name,
            creator_id,
            parent_id,
            child_id,
            parent_extended,
            child_extended,
        )
    }

    fn require_id(obj: &SharedObject) -> Result<ObjId> {
        obj.borrow()
            .id()
            .ok_or_else(|| MapperError::NotPersisted(obj.borrow().name().to_string()))
    }

    pub fn get_relation_children(
        &mut self,
        name: &str,
        parent: &SharedObject,
    ) -> Result<Vec<SharedObject>> {
        let parent_id = Self::require_id(parent)?;
        let rows = self.db.select_relation_children(name, parent_id)?;
        self.objects_from_relation_rows(rows, |row| row.child_object_id)
    }

    pub fn get_relation_parents(
        &mut self,
        name: &str,
        child: &SharedObject,
    ) -> Result<Vec<SharedObject>> {
        let child_id = Self::require_id(child)?;
        let rows = self.db.select_relation_parents(name, child_id)?;
        self.objects_from_relation_rows(rows, |row| row.parent_object_id)
    }

    fn objects_from_relation_rows(
        &mut self,
        rows: Vec<RelationRow>,
        endpoint: impl Fn(&RelationRow) -> Option<ObjId>,
    ) -> Result<Vec<SharedObject>> {
        let mut objects = Vec::new();
        for row in rows {
            if let Some(id) = endpoint(&row) {
                if let Some(obj) = self.select_by_id(id)? {
                    objects.push(obj);
                }
            }
        }
        Ok(objects)
    }

    pub fn get_relations_by_creator(&self, creator: &SharedObject) -> Result<Vec<RelationRow>> {
        let creator_id = Self::require_id(creator)?;
        self.db.select_relations_by_creator(creator_id)
    }

    pub fn get_relations_by_name(&self, name: &str) -> Result<Vec<RelationRow>> {
        self.db.select_relations_by_name(name)
    }

    pub fn delete_relations(&mut self, creator: &SharedObject) -> Result<()> {
        let creator_id = Self::require_id(creator)?;
        self.db.delete_relations_by_creator(creator_id)
    }
}

//! Flat mapper: one row per homogeneous item.
//!
//! Large collections of same-shaped objects (particles, micrographs,
//! coordinates) get a narrow table whose columns are inferred from the
//! first inserted item's flattened attribute dictionary. A `Classes` side
//! table records the label-to-column mapping so a reopened file can
//! rebuild the item shape without any registered template, and a
//! `Properties` side table holds the collection header key/values.

use std::collections::HashMap;
use std::rc::Rc;

use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::params_from_iter;
use rusqlite::types::Value as SqlValue;
use tracing::{debug, warn};

use crate::db::{quoted, SqliteAdapter};
use crate::error::{MapperError, Result};
use crate::object::{DictEntry, Object, ObjId, Value};
use crate::registry::ClassRegistry;

lazy_static! {
    // splits a where clause into operand and operator tokens
    static ref WHERE_SPLIT: Regex = Regex::new(r"<=|>=|=|<|>|\bAND\b|\bOR\b").unwrap();
}

/// Reserved label for the item class itself in the `Classes` table. It
/// consumes a column name but no physical column.
const SELF_LABEL: &str = "self";

// Fixed leading columns of the Objects table.
const BASIC_COLUMNS: usize = 5;

const AGGREGATES: [&str; 6] = ["COUNT", "MAX", "MIN", "AVG", "SUM", "TOTAL"];

fn sql_type_for(class_name: &str) -> &'static str {
    match class_name {
        "Integer" | "Boolean" => "INTEGER",
        "Float" => "REAL",
        _ => "TEXT",
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Empty => SqlValue::Null,
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Csv(items) => SqlValue::Text(items.join(",")),
        Value::Ref(_) => SqlValue::Null,
    }
}

fn from_sql_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Empty,
        SqlValue::Integer(i) => Value::Int(i),
        SqlValue::Real(f) => Value::Float(f),
        SqlValue::Text(s) => Value::Text(s),
        SqlValue::Blob(b) => Value::Text(String::from_utf8_lossy(&b).into_owned()),
    }
}

/// Sort direction for item queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    fn sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// Item query: ordering, filtering and limit over logical labels.
#[derive(Debug, Clone)]
pub struct Query {
    pub order_by: String,
    pub direction: Direction,
    pub where_clause: Option<String>,
    pub limit: Option<u64>,
}

impl Default for Query {
    fn default() -> Self {
        Query {
            order_by: "id".to_string(),
            direction: Direction::Asc,
            where_clause: None,
            limit: None,
        }
    }
}

impl Query {
    pub fn order_by(mut self, label: &str) -> Self {
        self.order_by = label.to_string();
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn filter(mut self, where_clause: &str) -> Self {
        self.where_clause = Some(where_clause.to_string());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One row of the `Classes` side table.
struct ClassRow {
    label: String,
    column: String,
    class_name: String,
}

pub struct FlatMapper {
    db: SqliteAdapter,
    registry: Rc<ClassRegistry>,
    prefix: String,
    indexes: Vec<String>,
    needs_tables: bool,
    loaded: bool,
    // item shape, loaded from the Classes table
    item_class: String,
    build_list: Vec<(String, String)>,
    obj_columns: Vec<(usize, String)>,
    columns_mapping: HashMap<String, String>,
    // prepared command strings; present only while appending is allowed
    insert_sql: Option<String>,
    update_sql: Option<String>,
    value_labels: Vec<String>,
}

impl FlatMapper {
    /// Open (or create) a flat-mapped collection. A non-empty `prefix`
    /// namespaces the tables so several collections share one file, and
    /// makes the open reuse a live connection to the same path.
    pub fn open(path: &str, prefix: &str, registry: Rc<ClassRegistry>) -> Result<FlatMapper> {
        FlatMapper::open_with_indexes(path, prefix, registry, &[])
    }

    pub fn open_with_indexes(
        path: &str,
        prefix: &str,
        registry: Rc<ClassRegistry>,
        indexes: &[&str],
    ) -> Result<FlatMapper> {
        let prefix = if prefix.is_empty() || prefix.ends_with('_') {
            prefix.to_string()
        } else {
            format!("{}_", prefix)
        };
        let db = SqliteAdapter::open(path, !prefix.is_empty())?;
        let mut mapper = FlatMapper {
            db,
            registry,
            prefix,
            indexes: indexes.iter().map(|s| s.to_string()).collect(),
            needs_tables: true,
            loaded: false,
            item_class: String::new(),
            build_list: Vec::new(),
            obj_columns: Vec::new(),
            columns_mapping: HashMap::new(),
            insert_sql: None,
            update_sql: None,
            value_labels: Vec::new(),
        };
        mapper.needs_tables = mapper.missing_tables()?;
        Ok(mapper)
    }

    fn objects_table(&self) -> String {
        format!("{}Objects", self.prefix)
    }

    fn classes_table(&self) -> String {
        format!("{}Classes", self.prefix)
    }

    fn missing_tables(&self) -> Result<bool> {
        Ok(!(self.db.has_table(&self.objects_table())?
            && self.db.has_table(&self.classes_table())?))
    }

    pub fn commit(&self) -> Result<()> {
        self.db.commit()
    }

    pub fn path(&self) -> &str {
        self.db.path()
    }

    /// Class name of the stored items, from the `Classes` table.
    pub fn item_class(&mut self) -> Result<&str> {
        self.ensure_loaded()?;
        Ok(&self.item_class)
    }

    // ------------- schema creation -------------

    fn create_tables(&mut self, first: &Object) -> Result<()> {
        let entries = first.obj_dict(true);
        self.db.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                     id             INTEGER PRIMARY KEY AUTOINCREMENT,
                     label_property TEXT UNIQUE,
                     column_name    TEXT UNIQUE,
                     class_name     TEXT DEFAULT NULL
                 )",
                self.classes_table()
            ),
            [],
        )?;
        let mut create = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                 id       INTEGER PRIMARY KEY,
                 enabled  INTEGER DEFAULT 1,
                 label    TEXT DEFAULT NULL,
                 comment  TEXT DEFAULT NULL,
                 creation DATE",
            self.objects_table()
        );
        // the counter includes the reserved self entry, so item columns
        // start at c01
        for (counter, entry) in entries.iter().enumerate() {
            let column = format!("c{:02}", counter);
            self.db.execute(
                &format!(
                    "INSERT INTO {} (label_property, column_name, class_name) \
                     VALUES (?1, ?2, ?3)",
                    self.classes_table()
                ),
                rusqlite::params![entry.label, column, entry.class_name],
            )?;
            if entry.label != SELF_LABEL {
                create.push_str(&format!(", {} {}", column, sql_type_for(&entry.class_name)));
            }
        }
        create.push(')');
        self.db.execute(&create, [])?;
        self.db.execute(
            "CREATE TABLE IF NOT EXISTS Properties (key TEXT UNIQUE, value TEXT)",
            [],
        )?;
        self.create_indexes(&entries)?;
        self.needs_tables = false;
        self.load_class_dict()?;
        self.prepare_commands()?;
        Ok(())
    }

    fn create_indexes(&self, entries: &[DictEntry]) -> Result<()> {
        for label in &self.indexes {
            let counter = match entries.iter().position(|e| &e.label == label) {
                Some(pos) => pos,
                None => {
                    warn!(label = %label, "index requested on unknown attribute");
                    continue;
                }
            };
            let column = format!("c{:02}", counter);
            let index_name = format!("{}index_{}", self.prefix, label.replace('.', "_"));
            self.db.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    quoted(&index_name),
                    self.objects_table(),
                    column
                ),
                [],
            )?;
        }
        Ok(())
    }

    // ------------- shape loading -------------

    fn ensure_loaded(&mut self) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        if self.needs_tables {
            return Err(MapperError::Misuse(
                "no items stored yet, the collection has no shape".to_string(),
            ));
        }
        self.load_class_dict()
    }

    fn class_rows(&self) -> Result<Vec<ClassRow>> {
        let mut stmt = self.db.connection().prepare(&format!(
            "SELECT label_property, column_name, class_name FROM {} ORDER BY id",
            self.classes_table()
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ClassRow {
                    label: row.get(0)?,
                    column: row.get(1)?,
                    class_name: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Rebuild the item shape from the `Classes` rows: the column
    /// mapping, the row-index/label pairs and the list of attributes a
    /// freshly built item may be missing.
    fn load_class_dict(&mut self) -> Result<()> {
        self.columns_mapping.clear();
        self.obj_columns.clear();
        self.build_list.clear();
        // template used only to learn which attributes the registered
        // class already carries
        let mut template: Option<Object> = None;
        let mut column_index = BASIC_COLUMNS;
        for row in self.class_rows()? {
            if row.label == SELF_LABEL {
                self.item_class = row.class_name.clone();
                template = Some(self.build_bare(&row.class_name));
                continue;
            }
            self.columns_mapping
                .insert(row.label.clone(), row.column.clone());
            self.obj_columns.push((column_index, row.label.clone()));
            column_index += 1;
            let template = template.get_or_insert_with(|| Object::compound("Object"));
            if template.get_nested(&row.label).is_none() {
                let attr = self.build_bare(&row.class_name);
                attach_at(template, &row.label, attr);
                self.build_list
                    .push((row.class_name.clone(), row.label.clone()));
            }
        }
        self.loaded = true;
        Ok(())
    }

    fn build_bare(&self, class_name: &str) -> Object {
        match self.registry.build(class_name) {
            Some(obj) => obj,
            None => {
                // already warned by the registry; a plain compound keeps
                // the rest of the row usable
                let mut obj = Object::compound(class_name);
                obj.set_class_name(class_name);
                obj
            }
        }
    }

    fn build_item(&self) -> Object {
        let mut obj = self.build_bare(&self.item_class);
        for (class_name, label) in &self.build_list {
            if obj.get_nested(label).is_none() {
                let attr = self.build_bare(class_name);
                attach_at(&mut obj, label, attr);
            }
        }
        obj
    }

    // ------------- command preparation -------------

    fn prepare_commands(&mut self) -> Result<()> {
        let rows = self.class_rows()?;
        let mut columns = Vec::new();
        self.value_labels.clear();
        for row in rows {
            if row.label == SELF_LABEL {
                continue;
            }
            columns.push(row.column);
            self.value_labels.push(row.label);
        }
        let mut insert_cols = "id, enabled, label, comment, creation".to_string();
        let mut insert_vals = "?, ?, ?, ?, datetime('now')".to_string();
        let mut update_sets = "enabled = ?, label = ?, comment = ?".to_string();
        for column in &columns {
            insert_cols.push_str(&format!(", {}", column));
            insert_vals.push_str(", ?");
            update_sets.push_str(&format!(", {} = ?", column));
        }
        self.insert_sql = Some(format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.objects_table(),
            insert_cols,
            insert_vals
        ));
        self.update_sql = Some(format!(
            "UPDATE {} SET {} WHERE id = ?",
            self.objects_table(),
            update_sets
        ));
        Ok(())
    }

    /// Allow inserts and updates on a reopened collection. Freshly
    /// created collections can append right away; reopened ones are
    /// read-only until this is called.
    pub fn enable_append(&mut self) -> Result<()> {
        if self.needs_tables {
            return Ok(());
        }
        self.ensure_loaded()?;
        self.prepare_commands()
    }

    // ------------- writes -------------

    fn row_values(&self, obj: &Object) -> Vec<SqlValue> {
        self.value_labels
            .iter()
            .map(|label| match obj.get_nested(label) {
                Some(attr) => to_sql_value(&attr.borrow().stored_value()),
                None => SqlValue::Null,
            })
            .collect()
    }

    /// Insert one item. The first insert ever infers the schema from
    /// this object's attribute dictionary. An absent id lets SQLite
    /// assign the next rowid.
    pub fn insert(&mut self, obj: &Object) -> Result<()> {
        if self.needs_tables {
            self.create_tables(obj)?;
        }
        let sql = self.insert_sql.clone().ok_or_else(|| {
            MapperError::Misuse(
                "collection opened read-only, call enable_append first".to_string(),
            )
        })?;
        let mut values: Vec<SqlValue> = vec![
            match obj.id() {
                Some(id) => SqlValue::Integer(id),
                None => SqlValue::Null,
            },
            SqlValue::Integer(obj.is_enabled() as i64),
            SqlValue::Text(obj.label().to_string()),
            SqlValue::Text(obj.comment().to_string()),
        ];
        values.extend(self.row_values(obj));
        self.db.ensure_transaction()?;
        self.db
            .connection()
            .execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    /// Rewrite the row of an already stored item.
    pub fn update(&mut self, obj: &Object) -> Result<()> {
        let id = obj
            .id()
            .ok_or_else(|| MapperError::NotPersisted(obj.name().to_string()))?;
        let sql = self.update_sql.clone().ok_or_else(|| {
            MapperError::Misuse(
                "collection opened read-only, call enable_append first".to_string(),
            )
        })?;
        let mut values: Vec<SqlValue> = vec![
            SqlValue::Integer(obj.is_enabled() as i64),
            SqlValue::Text(obj.label().to_string()),
            SqlValue::Text(obj.comment().to_string()),
        ];
        values.extend(self.row_values(obj));
        values.push(SqlValue::Integer(id));
        self.db.ensure_transaction()?;
        self.db
            .connection()
            .execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    pub fn delete(&mut self, id: ObjId) -> Result<()> {
        if self.needs_tables {
            return Ok(());
        }
        self.db.execute(
            &format!("DELETE FROM {} WHERE id = ?1", self.objects_table()),
            [id],
        )?;
        Ok(())
    }

    /// Drop all three tables. The next insert starts from scratch.
    pub fn clear(&mut self) -> Result<()> {
        for table in [self.objects_table(), self.classes_table(), "Properties".to_string()] {
            self.db
                .execute(&format!("DROP TABLE IF EXISTS {}", table), [])?;
        }
        self.needs_tables = true;
        self.loaded = false;
        self.insert_sql = None;
        self.update_sql = None;
        Ok(())
    }

    // ------------- reads -------------

    /// Number of stored items; 0 before the first insert.
    pub fn count(&self) -> Result<i64> {
        if self.needs_tables {
            return Ok(0);
        }
        let n: i64 = self.db.connection().query_row(
            &format!("SELECT COUNT(*) FROM {}", self.objects_table()),
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Highest stored id; 0 before the first insert.
    pub fn max_id(&self) -> Result<i64> {
        if self.needs_tables {
            return Ok(0);
        }
        let n: Option<i64> = self.db.connection().query_row(
            &format!("SELECT MAX(id) FROM {}", self.objects_table()),
            [],
            |row| row.get(0),
        )?;
        Ok(n.unwrap_or(0))
    }

    /// Translate a logical label into the physical column. Row columns
    /// and `RANDOM()` pass through.
    fn real_col(&self, label: &str) -> Option<String> {
        match label {
            "id" | "_objId" => Some("id".to_string()),
            "enabled" | "label" | "comment" | "creation" | "RANDOM()" => Some(label.to_string()),
            _ => self.columns_mapping.get(label).cloned(),
        }
    }

    fn real_col_required(&self, label: &str) -> Result<String> {
        self.real_col(label)
            .ok_or_else(|| MapperError::Query(format!("unknown attribute '{}'", label)))
    }

    /// Rewrite a where clause expressed over logical labels into the
    /// physical columns. Operand tokens that are not known labels are
    /// kept as literals.
    fn translate_where(&self, where_clause: &str) -> String {
        let mut out = String::new();
        let mut last = 0;
        let push_term = |out: &mut String, term: &str| {
            let trimmed = term.trim();
            match self.real_col(trimmed) {
                Some(col) if !trimmed.is_empty() => {
                    out.push_str(&term.replacen(trimmed, &col, 1))
                }
                _ => out.push_str(term),
            }
        };
        for m in WHERE_SPLIT.find_iter(where_clause) {
            push_term(&mut out, &where_clause[last..m.start()]);
            out.push_str(m.as_str());
            last = m.end();
        }
        push_term(&mut out, &where_clause[last..]);
        out
    }

    fn select_sql(&mut self, query: &Query) -> Result<String> {
        self.ensure_loaded()?;
        let order_col = self.real_col_required(&query.order_by)?;
        let mut sql = format!("SELECT * FROM {}", self.objects_table());
        if let Some(where_clause) = &query.where_clause {
            sql.push_str(&format!(" WHERE {}", self.translate_where(where_clause)));
        }
        sql.push_str(&format!(" ORDER BY {} {}", order_col, query.direction.sql()));
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        Ok(sql)
    }

    fn item_from_row(&self, row: &rusqlite::Row) -> rusqlite::Result<Object> {
        let mut obj = self.build_item();
        obj.set_id(row.get(0)?);
        let enabled: i64 = row.get(1)?;
        obj.set_enabled(enabled != 0);
        let label: Option<String> = row.get(2)?;
        obj.set_label(label.as_deref().unwrap_or(""));
        let comment: Option<String> = row.get(3)?;
        obj.set_comment(comment.as_deref().unwrap_or(""));
        obj.set_creation(row.get(4)?);
        for (index, label) in &self.obj_columns {
            let raw: SqlValue = row.get(*index)?;
            obj.set_attribute_value(label, from_sql_value(raw));
        }
        Ok(obj)
    }

    /// All items matching the query, as freshly built owned objects.
    pub fn select_all(&mut self, query: &Query) -> Result<Vec<Object>> {
        if self.needs_tables {
            return Ok(Vec::new());
        }
        let sql = self.select_sql(query)?;
        let mut stmt = self.db.connection().prepare(&sql)?;
        let items = stmt
            .query_map([], |row| self.item_from_row(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    /// Stream items through a callback without materializing the whole
    /// result set.
    pub fn scan<F>(&mut self, query: &Query, mut visit: F) -> Result<()>
    where
        F: FnMut(Object) -> Result<()>,
    {
        if self.needs_tables {
            return Ok(());
        }
        let sql = self.select_sql(query)?;
        let mut stmt = self.db.connection().prepare(&sql)?;
        let rows = stmt.query_map([], |row| self.item_from_row(row))?;
        for item in rows {
            visit(item?)?;
        }
        Ok(())
    }

    /// All items whose attribute equals `value`.
    pub fn select_by(&mut self, label: &str, value: &Value) -> Result<Vec<Object>> {
        if self.needs_tables {
            return Ok(Vec::new());
        }
        self.ensure_loaded()?;
        let col = self.real_col_required(label)?;
        let condition = match value {
            Value::Empty => format!("{} IS NULL", col),
            Value::Bool(b) => format!("{} = {}", col, *b as i64),
            Value::Int(i) => format!("{} = {}", col, i),
            Value::Float(f) => format!("{} = {}", col, f),
            Value::Text(s) => format!("{} = '{}'", col, s.replace('\'', "''")),
            Value::Csv(items) => {
                format!("{} = '{}'", col, items.join(",").replace('\'', "''"))
            }
            Value::Ref(_) => {
                return Err(MapperError::Query(
                    "cannot filter a flat collection by object reference".to_string(),
                ))
            }
        };
        self.select_all(&Query::default().filter(&condition))
    }

    pub fn select_first(&mut self, query: &Query) -> Result<Option<Object>> {
        let mut limited = query.clone();
        limited.limit = Some(1);
        Ok(self.select_all(&limited)?.into_iter().next())
    }

    pub fn select_by_id(&mut self, id: ObjId) -> Result<Option<Object>> {
        if self.needs_tables {
            return Ok(None);
        }
        self.ensure_loaded()?;
        let sql = format!("SELECT * FROM {} WHERE id = ?1", self.objects_table());
        let mut stmt = self.db.connection().prepare(&sql)?;
        let mut rows = stmt.query_map([id], |row| self.item_from_row(row))?;
        match rows.next() {
            Some(item) => Ok(Some(item?)),
            None => Ok(None),
        }
    }

    pub fn exists(&self, id: ObjId) -> Result<bool> {
        if self.needs_tables {
            return Ok(false);
        }
        let count: i64 = self.db.connection().query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE id = ?1", self.objects_table()),
            [id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Distinct values per label, optionally filtered.
    pub fn unique(
        &mut self,
        labels: &[&str],
        where_clause: Option<&str>,
    ) -> Result<HashMap<String, Vec<Value>>> {
        if self.needs_tables {
            return Ok(HashMap::new());
        }
        self.ensure_loaded()?;
        let cols = labels
            .iter()
            .map(|label| {
                self.real_col_required(label)
                    .map(|col| format!("{} AS {}", col, quoted(label)))
            })
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let mut sql = format!("SELECT DISTINCT {} FROM {}", cols, self.objects_table());
        if let Some(where_clause) = where_clause {
            sql.push_str(&format!(" WHERE {}", self.translate_where(where_clause)));
        }
        let mut stmt = self.db.connection().prepare(&sql)?;
        let mut result: HashMap<String, Vec<Value>> = labels
            .iter()
            .map(|label| (label.to_string(), Vec::new()))
            .collect();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            for (i, label) in labels.iter().enumerate() {
                let raw: SqlValue = row.get(i)?;
                if let Some(values) = result.get_mut(*label) {
                    values.push(from_sql_value(raw));
                }
            }
        }
        Ok(result)
    }

    /// Run aggregate operations over one or more labels, optionally
    /// grouped. The first label's aggregates are keyed by the bare
    /// operation name; further labels append the label to the key.
    pub fn aggregate(
        &mut self,
        operations: &[&str],
        labels: &[&str],
        group_by: &[&str],
    ) -> Result<Vec<HashMap<String, Value>>> {
        if self.needs_tables {
            return Ok(Vec::new());
        }
        self.ensure_loaded()?;
        let mut select_parts = Vec::new();
        let mut keys = Vec::new();
        for operation in operations {
            let upper = operation.to_uppercase();
            if !AGGREGATES.contains(&upper.as_str()) {
                return Err(MapperError::Query(format!(
                    "unsupported aggregate operation '{}'",
                    operation
                )));
            }
            for (i, label) in labels.iter().enumerate() {
                let col = self.real_col_required(label)?;
                let alias = if i == 0 {
                    upper.clone()
                } else {
                    format!("{}{}", upper, label)
                };
                select_parts.push(format!("{}({}) AS {}", upper, col, quoted(&alias)));
                keys.push(alias);
            }
        }
        let mut group_cols = Vec::new();
        for label in group_by {
            let col = self.real_col_required(label)?;
            select_parts.push(format!("{} AS {}", col, quoted(label)));
            keys.push(label.to_string());
            group_cols.push(col);
        }
        let mut sql = format!(
            "SELECT {} FROM {}",
            select_parts.join(", "),
            self.objects_table()
        );
        if !group_cols.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", group_cols.join(", ")));
        }
        let mut stmt = self.db.connection().prepare(&sql)?;
        let mut result = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut entry = HashMap::new();
            for (i, key) in keys.iter().enumerate() {
                let raw: SqlValue = row.get(i)?;
                entry.insert(key.clone(), from_sql_value(raw));
            }
            result.push(entry);
        }
        Ok(result)
    }

    // ------------- properties -------------

    fn has_properties_table(&self) -> Result<bool> {
        self.db.has_table("Properties")
    }

    pub fn has_property(&self, key: &str) -> Result<bool> {
        if !self.has_properties_table()? {
            return Ok(false);
        }
        let count: i64 = self.db.connection().query_row(
            "SELECT COUNT(*) FROM Properties WHERE key = ?1",
            [key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Value of a header property, or `None` (a file without the table
    /// simply has no properties).
    pub fn get_property(&self, key: &str) -> Result<Option<String>> {
        if !self.has_properties_table()? {
            return Ok(None);
        }
        let mut stmt = self
            .db
            .connection()
            .prepare("SELECT value FROM Properties WHERE key = ?1")?;
        let mut rows = stmt.query_map([key], |row| row.get::<_, Option<String>>(0))?;
        match rows.next() {
            Some(value) => Ok(value?),
            None => Ok(None),
        }
    }

    /// Set a header property. On a collection that was never written to
    /// this is a no-op.
    pub fn set_property(&mut self, key: &str, value: Option<&str>) -> Result<()> {
        if !self.has_properties_table()? {
            debug!(key, "no Properties table yet, value not stored");
            return Ok(());
        }
        if self.has_property(key)? {
            self.db.execute(
                "UPDATE Properties SET value = ?1 WHERE key = ?2",
                rusqlite::params![value, key],
            )?;
        } else {
            self.db.execute(
                "INSERT INTO Properties (key, value) VALUES (?1, ?2)",
                rusqlite::params![key, value],
            )?;
        }
        Ok(())
    }

    pub fn delete_property(&mut self, key: &str) -> Result<()> {
        if !self.has_properties_table()? {
            return Ok(());
        }
        self.db
            .execute("DELETE FROM Properties WHERE key = ?1", [key])?;
        Ok(())
    }

    pub fn property_keys(&self) -> Result<Vec<String>> {
        if !self.has_properties_table()? {
            return Ok(Vec::new());
        }
        let mut stmt = self
            .db
            .connection()
            .prepare("SELECT key FROM Properties ORDER BY rowid")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }
}

/// Format a timestamp the way the creation column stores it.
pub fn fmt_date(dt: &chrono::NaiveDateTime) -> String {
    dt.format(crate::object::DATETIME_FORMAT).to_string()
}

/// Attach `child` at a dotted path, assuming all parent components exist.
fn attach_at(obj: &mut Object, dotted: &str, child: Object) {
    match dotted.rsplit_once('.') {
        None => {
            obj.set_attr(dotted, child);
        }
        Some((parent_path, last)) => match obj.get_nested(parent_path) {
            Some(parent) => {
                parent.borrow_mut().set_attr(last, child);
            }
            None => {
                warn!(attribute = dotted, "parent attribute missing, column ignored");
            }
        },
    }
}

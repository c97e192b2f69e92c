//! Out-of-line homogeneous collections.
//!
//! A `Set` keeps its items in a separate SQLite file through a
//! [`FlatMapper`] and is itself storable by the generic mapper through a
//! small header object (cached size, stream state, path to the backing
//! file). Acquisition pipelines append to an open set over time, so the
//! stream state distinguishes a set still growing from a finished one.

use std::fs;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{MapperError, Result};
use crate::flat::{FlatMapper, Query};
use crate::object::{Object, ObjId, Value};
use crate::registry::ClassRegistry;

const SIZE_ATTRIBUTE: &str = "_size";
const STREAM_ATTRIBUTE: &str = "_streamState";
const MAPPER_PATH_ATTRIBUTE: &str = "_mapperPath";
const REPRESENTATIVE_ATTRIBUTE: &str = "_representative";

/// Whether the set is still receiving items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Closed,
}

impl StreamState {
    pub fn as_i64(self) -> i64 {
        match self {
            StreamState::Open => 1,
            StreamState::Closed => 2,
        }
    }

    pub fn from_i64(raw: i64) -> StreamState {
        if raw == 1 {
            StreamState::Open
        } else {
            StreamState::Closed
        }
    }
}

pub struct Set {
    class_name: String,
    item_class: String,
    file_name: String,
    prefix: String,
    registry: Rc<ClassRegistry>,
    indexes: Vec<String>,
    mapper: Option<FlatMapper>,
    id_count: i64,
    size: i64,
    stream_state: StreamState,
    representative: Option<Object>,
}

impl Set {
    /// Bind a set to its backing file. Nothing is opened until the first
    /// access; a file that was never written reads back as empty.
    pub fn new(
        file_name: &str,
        prefix: &str,
        class_name: &str,
        item_class: &str,
        registry: Rc<ClassRegistry>,
    ) -> Set {
        Set {
            class_name: class_name.to_string(),
            item_class: item_class.to_string(),
            file_name: file_name.to_string(),
            prefix: prefix.to_string(),
            registry,
            indexes: Vec::new(),
            mapper: None,
            id_count: 0,
            size: 0,
            stream_state: StreamState::Closed,
            representative: None,
        }
    }

    /// Declare attribute indexes to create with the item table. Only
    /// effective before the first append.
    pub fn with_indexes(mut self, indexes: &[&str]) -> Set {
        self.indexes = indexes.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Open the set and read its stored header back.
    pub fn open(
        file_name: &str,
        prefix: &str,
        class_name: &str,
        item_class: &str,
        registry: Rc<ClassRegistry>,
    ) -> Result<Set> {
        let mut set = Set::new(file_name, prefix, class_name, item_class, registry);
        set.load()?;
        Ok(set)
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn item_class(&self) -> &str {
        &self.item_class
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    fn mapper(&mut self) -> Result<&mut FlatMapper> {
        if self.mapper.is_none() {
            let index_refs: Vec<&str> = self.indexes.iter().map(String::as_str).collect();
            let mapper = FlatMapper::open_with_indexes(
                &self.file_name,
                &self.prefix,
                self.registry.clone(),
                &index_refs,
            )?;
            self.id_count = mapper.max_id()?;
            debug!(file = %self.file_name, id_count = self.id_count, "set mapper opened");
            self.mapper = Some(mapper);
        }
        self.mapper
            .as_mut()
            .ok_or_else(|| MapperError::Misuse("backing mapper unavailable".to_string()))
    }

    // ------------- items -------------

    /// Append an item. An item without id gets the next counter value;
    /// an explicit id pushes the counter up so later automatic ids never
    /// collide.
    pub fn append(&mut self, item: &mut Object) -> Result<()> {
        let new_id = match item.id() {
            None => {
                let id = self.id_count + 1;
                item.set_id(Some(id));
                id
            }
            Some(id) => id,
        };
        self.mapper()?.insert(item)?;
        self.id_count = self.id_count.max(new_id);
        self.size += 1;
        Ok(())
    }

    /// Rewrite an already appended item.
    pub fn update(&mut self, item: &Object) -> Result<()> {
        self.mapper()?.update(item)
    }

    pub fn items(&mut self, query: &Query) -> Result<Vec<Object>> {
        self.mapper()?.select_all(query)
    }

    /// Stream items through a callback.
    pub fn for_each<F>(&mut self, query: &Query, visit: F) -> Result<()>
    where
        F: FnMut(Object) -> Result<()>,
    {
        self.mapper()?.scan(query, visit)
    }

    pub fn first_item(&mut self) -> Result<Option<Object>> {
        self.mapper()?.select_first(&Query::default())
    }

    pub fn get_by_id(&mut self, id: ObjId) -> Result<Option<Object>> {
        self.mapper()?.select_by_id(id)
    }

    pub fn contains(&mut self, id: ObjId) -> Result<bool> {
        self.mapper()?.exists(id)
    }

    /// The first `n` items.
    pub fn take(&mut self, n: u64) -> Result<Vec<Object>> {
        let query = Query::default().limit(n);
        self.items(&query)
    }

    pub fn unique(
        &mut self,
        labels: &[&str],
        where_clause: Option<&str>,
    ) -> Result<std::collections::HashMap<String, Vec<Value>>> {
        self.mapper()?.unique(labels, where_clause)
    }

    pub fn aggregate(
        &mut self,
        operations: &[&str],
        labels: &[&str],
        group_by: &[&str],
    ) -> Result<Vec<std::collections::HashMap<String, Value>>> {
        self.mapper()?.aggregate(operations, labels, group_by)
    }

    pub fn len(&self) -> i64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn id_count(&self) -> i64 {
        self.id_count
    }

    /// Allow appending to a reopened set.
    pub fn enable_append(&mut self) -> Result<()> {
        self.mapper()?.enable_append()
    }

    // ------------- stream state -------------

    pub fn stream_state(&self) -> StreamState {
        self.stream_state
    }

    pub fn set_stream_state(&mut self, state: StreamState) {
        self.stream_state = state;
    }

    pub fn is_stream_open(&self) -> bool {
        self.stream_state == StreamState::Open
    }

    // ------------- representative -------------

    pub fn representative(&self) -> Option<&Object> {
        self.representative.as_ref()
    }

    pub fn set_representative(&mut self, representative: Option<Object>) {
        self.representative = representative;
    }

    // ------------- header persistence -------------

    /// The storable head of this set: its cached size, stream state and
    /// backing-file location, shaped for the generic mapper.
    pub fn header_object(&self) -> Object {
        let mut header = Object::compound(&self.class_name);
        header.set_attr(SIZE_ATTRIBUTE, Object::integer(self.size));
        header.set_attr(
            STREAM_ATTRIBUTE,
            Object::integer(self.stream_state.as_i64()),
        );
        let mut path = Object::csv_list();
        path.push_csv(&self.file_name);
        path.push_csv(&self.prefix);
        header.set_attr(MAPPER_PATH_ATTRIBUTE, path);
        if let Some(rep) = &self.representative {
            header.set_attr(REPRESENTATIVE_ATTRIBUTE, rep.clone_object());
        }
        header
    }

    /// Adopt the state carried by a stored header object.
    pub fn apply_header(&mut self, header: &Object) {
        if let Value::Int(size) = header.get_nested_value(SIZE_ATTRIBUTE) {
            self.size = size;
        }
        if let Value::Int(state) = header.get_nested_value(STREAM_ATTRIBUTE) {
            self.stream_state = StreamState::from_i64(state);
        }
        if let Some(path) = header.get_nested(MAPPER_PATH_ATTRIBUTE) {
            let parts = path.borrow().csv_items();
            if let Some(file) = parts.first() {
                self.file_name = file.trim().to_string();
            }
            if let Some(prefix) = parts.get(1) {
                self.prefix = prefix.trim().to_string();
            }
        }
        if let Some(rep) = header.get_nested(REPRESENTATIVE_ATTRIBUTE) {
            self.representative = Some(rep.borrow().clone_object());
        }
        self.class_name = header.class_name().to_string();
    }

    /// Open a set from a stored header object.
    pub fn from_header(
        header: &Object,
        item_class: &str,
        registry: Rc<ClassRegistry>,
    ) -> Result<Set> {
        let mut set = Set::new("", "", header.class_name(), item_class, registry);
        set.apply_header(header);
        set.reload_counters()?;
        Ok(set)
    }

    fn reload_counters(&mut self) -> Result<()> {
        let mapper = self.mapper()?;
        let count = mapper.count()?;
        let max_id = mapper.max_id()?;
        self.id_count = max_id;
        if self.size == 0 {
            self.size = count;
        }
        Ok(())
    }

    /// Write the header properties (`self` plus the flattened header
    /// attributes) into the backing file and commit. On a set that never
    /// received an item the properties are silently skipped.
    pub fn write(&mut self, properties: bool) -> Result<()> {
        if properties {
            let header = self.header_object();
            let class_name = self.class_name.clone();
            let mapper = self.mapper()?;
            mapper.set_property("self", Some(&class_name))?;
            for entry in header.obj_dict(false) {
                // the representative slot stores its class name, like `self`
                let value = if entry.label == REPRESENTATIVE_ATTRIBUTE {
                    Some(entry.class_name.clone())
                } else {
                    entry.value.stored_text()
                };
                mapper.set_property(&entry.label, value.as_deref())?;
            }
        }
        self.mapper()?.commit()
    }

    /// Read the stored header properties back, refreshing size, stream
    /// state and id counter.
    pub fn load(&mut self) -> Result<()> {
        let keys = self.mapper()?.property_keys()?;
        let mut header = self.header_object();
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let value = self.mapper()?.get_property(&key)?;
            entries.push((key, value));
        }
        // the class-carrying entries first, so the representative exists
        // before its flattened attributes arrive
        for (key, value) in &entries {
            match key.as_str() {
                "self" => {
                    if let Some(stored) = value {
                        self.class_name = stored.clone();
                    }
                }
                REPRESENTATIVE_ATTRIBUTE => {
                    let class = value.as_deref().unwrap_or("Object");
                    let rep = self
                        .registry
                        .build(class)
                        .unwrap_or_else(|| Object::compound(class));
                    header.set_attr(REPRESENTATIVE_ATTRIBUTE, rep);
                }
                _ => {}
            }
        }
        for (key, value) in entries {
            if key == "self" || key == REPRESENTATIVE_ATTRIBUTE {
                continue;
            }
            let raw = value.map(Value::Text).unwrap_or(Value::Empty);
            header.set_attribute_value(&key, raw);
        }
        header.set_class_name(&self.class_name.clone());
        self.apply_header(&header);
        self.reload_counters()
    }

    pub fn load_all_properties(&mut self) -> Result<()> {
        self.load()
    }

    /// Whether the backing file changed after `since` (by modification
    /// time). A missing file counts as unchanged.
    pub fn has_changed_since(&self, since: DateTime<Utc>) -> Result<bool> {
        let modified = match fs::metadata(&self.file_name).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                warn!(file = %self.file_name, error = %e, "cannot stat backing file");
                return Ok(false);
            }
        };
        let modified: DateTime<Utc> = modified.into();
        Ok(modified > since)
    }

    /// Drop all items and the schema; the set becomes empty and the next
    /// append re-infers the columns.
    pub fn clear(&mut self) -> Result<()> {
        self.mapper()?.clear()?;
        self.size = 0;
        self.id_count = 0;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.mapper()?.commit()
    }

    /// Commit and release the backing connection.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mapper) = &self.mapper {
            mapper.commit()?;
        }
        self.mapper = None;
        Ok(())
    }
}

impl Drop for Set {
    fn drop(&mut self) {
        if let Some(mapper) = &self.mapper {
            if let Err(e) = mapper.commit() {
                warn!(file = %self.file_name, error = %e, "commit on close failed");
            }
        }
    }
}

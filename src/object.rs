//! The value model: typed, dynamically-attributed object trees.
//!
//! Every persistable node is an [`Object`]: identity (id, parent id, dotted
//! name), metadata (label, comment, creation, enabled), a `do_store` flag,
//! a typed [`Value`] slot and an ordered collection of named child
//! attributes. Scalars, pointers and the list flavors are all `Object`s
//! distinguished by their [`Kind`] tag, so the mappers can walk any graph
//! through a single self-description protocol
//! ([`Object::attributes_to_store`]).

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use chrono::NaiveDateTime;
use tracing::warn;

use crate::error::{MapperError, Result};

/// Identity assigned by a mapper once the object is persisted.
pub type ObjId = i64;

/// Shared handle to an object node. The mapper is single-threaded by
/// contract, so plain reference counting is enough.
pub type SharedObject = Rc<RefCell<Object>>;

/// Child attribute name prefix used by lists for their elements.
pub const ITEM_PREFIX: &str = "item_";

/// Name of the child attribute holding a pointer's extended path.
pub const EXTENDED_ATTRIBUTE: &str = "_extended";

/// Name of the child attribute holding a scalar's pointer override.
pub const POINTER_ATTRIBUTE: &str = "_pointer";

/// Precision used when comparing float attributes for equality.
pub const FLOAT_EQUAL_PRECISION: f64 = 0.001;

/// Timestamp format used for the creation column.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// Legacy markers that older files used inside extended paths.
const LEGACY_EXTENDED_ATTR: &str = "__attribute__";
const LEGACY_EXTENDED_ITEMID: &str = "__itemid__";

/// Closed set of type tags. Domain classes register a factory under their
/// own class-name string but always resolve to one of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Compound,
    Integer,
    Float,
    Boolean,
    Text,
    Csv,
    Pointer,
    List,
    PointerList,
}

impl Kind {
    /// Default class name for the built-in kinds.
    pub fn class_name(self) -> &'static str {
        match self {
            Kind::Compound => "Object",
            Kind::Integer => "Integer",
            Kind::Float => "Float",
            Kind::Boolean => "Boolean",
            Kind::Text => "String",
            Kind::Csv => "CsvList",
            Kind::Pointer => "Pointer",
            Kind::List => "List",
            Kind::PointerList => "PointerList",
        }
    }

    /// Scalars carry their value in the row itself; everything else
    /// spreads over child rows (or is skipped, for pointers).
    pub fn is_scalar(self) -> bool {
        matches!(
            self,
            Kind::Integer | Kind::Float | Kind::Boolean | Kind::Text | Kind::Csv
        )
    }

    pub fn is_list(self) -> bool {
        matches!(self, Kind::List | Kind::PointerList)
    }
}

/// A typed value slot.
#[derive(Debug, Clone)]
pub enum Value {
    Empty,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Csv(Vec<String>),
    Ref(SharedObject),
}

impl Value {
    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_ref_object(&self) -> Option<SharedObject> {
        match self {
            Value::Ref(o) => Some(o.clone()),
            _ => None,
        }
    }

    /// Text representation used for the generic mapper's value column.
    pub fn stored_text(&self) -> Option<String> {
        match self {
            Value::Empty => None,
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Bool(b) => Some(if *b { "True" } else { "False" }.to_string()),
            Value::Text(s) => Some(s.clone()),
            Value::Csv(items) => Some(items.join(",")),
            Value::Ref(o) => o.borrow().id().map(|id| id.to_string()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Empty, Value::Empty) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Csv(a), Value::Csv(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Empty => write!(f, "None"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Value::Text(s) => write!(f, "{}", s),
            Value::Csv(items) => write!(f, "{}", items.join(",")),
            Value::Ref(o) => {
                let o = o.borrow();
                write!(f, "-> {} ({})", o.class_name(), o.str_id())
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// One entry of a flattened attribute dictionary (dotted label, class
/// name, stored value). Used by the flat mapper for schema inference.
#[derive(Debug, Clone)]
pub struct DictEntry {
    pub label: String,
    pub class_name: String,
    pub value: Value,
}

/// The universal persistable node.
#[derive(Debug, Clone)]
pub struct Object {
    class_name: String,
    kind: Kind,
    id: Option<ObjId>,
    parent_id: Option<ObjId>,
    name: String,
    label: String,
    comment: String,
    creation: Option<String>,
    enabled: bool,
    do_store: bool,
    value: Value,
    attributes: Vec<(String, SharedObject)>,
}

impl Object {
    pub fn new(kind: Kind) -> Object {
        Object::with_class(kind, kind.class_name())
    }

    pub fn with_class(kind: Kind, class_name: &str) -> Object {
        let mut obj = Object {
            class_name: class_name.to_string(),
            kind,
            id: None,
            parent_id: None,
            name: String::new(),
            label: String::new(),
            comment: String::new(),
            creation: None,
            enabled: true,
            do_store: true,
            value: Value::Empty,
            attributes: Vec::new(),
        };
        // Pointers always carry an extended sub-path attribute, even when
        // empty, so it round-trips through storage like any other child.
        if kind == Kind::Pointer {
            obj.attributes.push((
                EXTENDED_ATTRIBUTE.to_string(),
                Object::new(Kind::Text).shared(),
            ));
        }
        obj
    }

    pub fn integer(v: i64) -> Object {
        let mut o = Object::new(Kind::Integer);
        o.value = Value::Int(v);
        o
    }

    pub fn float(v: f64) -> Object {
        let mut o = Object::new(Kind::Float);
        o.value = Value::Float(v);
        o
    }

    pub fn boolean(v: bool) -> Object {
        let mut o = Object::new(Kind::Boolean);
        o.value = Value::Bool(v);
        o
    }

    pub fn text(v: &str) -> Object {
        let mut o = Object::new(Kind::Text);
        o.value = Value::Text(v.to_string());
        o
    }

    pub fn compound(class_name: &str) -> Object {
        Object::with_class(Kind::Compound, class_name)
    }

    pub fn list() -> Object {
        Object::new(Kind::List)
    }

    pub fn pointer_list() -> Object {
        Object::new(Kind::PointerList)
    }

    pub fn csv_list() -> Object {
        let mut o = Object::new(Kind::Csv);
        o.value = Value::Csv(Vec::new());
        o
    }

    pub fn pointer_to(target: &SharedObject) -> Object {
        let mut o = Object::new(Kind::Pointer);
        o.value = Value::Ref(target.clone());
        o
    }

    pub fn pointer_with_extended(target: &SharedObject, extended: &str) -> Object {
        let mut o = Object::pointer_to(target);
        o.set_extended(extended);
        o
    }

    /// Wrap into a shared handle.
    pub fn shared(self) -> SharedObject {
        Rc::new(RefCell::new(self))
    }

    // ------------- identity and metadata -------------

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn set_class_name(&mut self, name: &str) {
        self.class_name = name.to_string();
    }

    pub fn id(&self) -> Option<ObjId> {
        self.id
    }

    pub fn set_id(&mut self, id: Option<ObjId>) {
        self.id = id;
    }

    pub fn has_id(&self) -> bool {
        self.id.is_some()
    }

    /// String representation of the id, for dotted-name building.
    pub fn str_id(&self) -> String {
        match self.id {
            Some(id) => id.to_string(),
            None => "None".to_string(),
        }
    }

    /// Reset this object's id and the ids of all stored children.
    /// Used when re-storing a graph retrieved from another mapper.
    pub fn clean_id(&mut self) {
        self.id = None;
        for (_, attr) in self.attributes_to_store() {
            attr.borrow_mut().clean_id();
        }
    }

    pub fn parent_id(&self) -> Option<ObjId> {
        self.parent_id
    }

    pub fn set_parent_id(&mut self, id: Option<ObjId>) {
        self.parent_id = id;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    /// The attribute name inside the parent (last dotted component).
    pub fn last_name(&self) -> &str {
        match self.name.rsplit_once('.') {
            Some((_, last)) => last,
            None => &self.name,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_label(&mut self, label: &str) {
        self.label = label.to_string();
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn set_comment(&mut self, comment: &str) {
        self.comment = comment.to_string();
    }

    pub fn creation(&self) -> Option<&str> {
        self.creation.as_deref()
    }

    pub fn set_creation(&mut self, creation: Option<String>) {
        self.creation = creation;
    }

    /// Creation timestamp parsed as a datetime, when present.
    pub fn creation_as_datetime(&self) -> Option<NaiveDateTime> {
        let raw = self.creation.as_deref()?;
        NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT).ok()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn do_store(&self) -> bool {
        self.do_store
    }

    pub fn set_do_store(&mut self, do_store: bool) {
        self.do_store = do_store;
    }

    pub fn is_pointer(&self) -> bool {
        self.kind == Kind::Pointer
    }

    pub fn is_scalar(&self) -> bool {
        self.kind.is_scalar()
    }

    /// A readable id: label if set, else name.id.
    pub fn name_id(&self) -> String {
        if !self.label.is_empty() {
            self.label.clone()
        } else if self.has_id() {
            format!("{}.{}", self.name, self.str_id())
        } else {
            String::new()
        }
    }

    /// A fresh, empty object of the same kind and class.
    pub fn new_of_same_class(&self) -> Object {
        Object::with_class(self.kind, &self.class_name)
    }

    // ------------- attributes -------------

    /// Set (replace or append) a named child attribute, returning the
    /// shared handle to it.
    pub fn set_attr(&mut self, name: &str, obj: Object) -> SharedObject {
        let shared = obj.shared();
        self.set_attr_shared(name, shared.clone());
        shared
    }

    pub fn set_attr_shared(&mut self, name: &str, obj: SharedObject) {
        for (key, slot) in self.attributes.iter_mut() {
            if key == name {
                *slot = obj;
                return;
            }
        }
        self.attributes.push((name.to_string(), obj));
    }

    pub fn attr(&self, name: &str) -> Option<SharedObject> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, obj)| obj.clone())
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attributes.iter().any(|(key, _)| key == name)
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<SharedObject> {
        let pos = self.attributes.iter().position(|(key, _)| key == name)?;
        let (_, obj) = self.attributes.remove(pos);
        // Lists keep their item names dense.
        if self.kind.is_list() && name.starts_with(ITEM_PREFIX) {
            self.renumber_items();
        }
        Some(obj)
    }

    /// All named children in insertion order.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &SharedObject)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Children that the mappers should persist.
    pub fn attributes_to_store(&self) -> Vec<(String, SharedObject)> {
        self.attributes
            .iter()
            .filter(|(_, obj)| obj.borrow().do_store)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Walk a dotted attribute path. Integer components index into lists.
    pub fn get_nested(&self, dotted: &str) -> Option<SharedObject> {
        let mut parts = dotted.split('.');
        let first = parts.next()?;
        let mut current = self.resolve_part(first)?;
        for part in parts {
            let next = current.borrow().resolve_part(part);
            current = next?;
        }
        Some(current)
    }

    pub fn get_nested_value(&self, dotted: &str) -> Value {
        match self.get_nested(dotted) {
            Some(obj) => obj.borrow().get(),
            None => Value::Empty,
        }
    }

    /// Resolve one path component against this object: an integer picks a
    /// list item (0-based), anything else is an attribute name.
    pub fn resolve_part(&self, part: &str) -> Option<SharedObject> {
        if self.kind.is_list() && !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()) {
            return self.item(part.parse::<usize>().ok()?);
        }
        self.attr(part)
    }

    /// Set the value of a nested attribute, tolerating both missing paths
    /// and type drift: the stored default survives, a warning is logged.
    pub fn set_attribute_value(&mut self, dotted: &str, value: Value) {
        let target = match self.get_nested(dotted) {
            Some(obj) => obj,
            None => {
                warn!(attribute = dotted, "attribute not found, value ignored");
                return;
            }
        };
        let result = target.borrow_mut().set(value);
        if let Err(e) = result {
            warn!(
                attribute = dotted,
                error = %e,
                "can't set attribute, maybe its type has changed; keeping previous value"
            );
        }
    }

    // ------------- value slot -------------

    /// Set the value, coercing it to this object's scalar kind. A failed
    /// coercion reports `TypeDrift` and leaves the previous value alone.
    pub fn set(&mut self, value: Value) -> Result<()> {
        if value.is_empty() {
            self.value = Value::Empty;
            if self.kind == Kind::Pointer {
                self.clear_extended();
            }
            return Ok(());
        }
        let converted = convert_value(self.kind, &self.class_name, value)?;
        self.value = converted;
        if self.kind == Kind::Pointer {
            self.clear_extended();
        }
        Ok(())
    }

    /// Raw value slot, without pointer indirection.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// The value as read by clients: resolves a scalar's pointer override
    /// when one is attached. Csv lists read back as their joined text.
    pub fn get(&self) -> Value {
        self.get_or(Value::Empty)
    }

    /// Like [`Object::get`] but substituting `default` when unset or when
    /// an attached pointer resolves to nothing.
    pub fn get_or(&self, default: Value) -> Value {
        if self.is_scalar() {
            if let Some(ptr) = self.attr(POINTER_ATTRIBUTE) {
                return match ptr.borrow().follow() {
                    Some(pointed) => pointed.borrow().get_or(default),
                    None => default,
                };
            }
        }
        match &self.value {
            Value::Empty => default,
            Value::Csv(items) => Value::Text(items.join(",")),
            other => other.clone(),
        }
    }

    pub fn has_value(&self) -> bool {
        if self.is_scalar() || self.is_pointer() {
            !self.value.is_empty()
        } else {
            true
        }
    }

    /// Value to be stored in a row. Compound nodes and lists store
    /// nothing; pointers are handled by the mapper (they store an id).
    pub fn stored_value(&self) -> Value {
        match &self.value {
            Value::Csv(items) => Value::Text(items.join(",")),
            other if self.is_scalar() => other.clone(),
            _ => Value::Empty,
        }
    }

    /// Populate the value slot from a raw stored text, coercing by kind.
    pub fn set_stored(&mut self, raw: Option<&str>) -> Result<()> {
        match raw {
            None => self.set(Value::Empty),
            Some(s) => self.set(Value::Text(s.to_string())),
        }
    }

    /// Add one to an integer value (list item counters and sizes).
    pub fn increment(&mut self) {
        if let Value::Int(i) = self.value {
            self.value = Value::Int(i + 1);
        } else if self.value.is_empty() {
            self.value = Value::Int(1);
        }
    }

    // ------------- scalar pointer override -------------

    /// Attach a pointer from which `get()` will read the value instead of
    /// the own slot. Pass `None` to detach.
    pub fn set_pointer(&mut self, pointer: Option<Object>) {
        match pointer {
            Some(p) => {
                self.set_attr(POINTER_ATTRIBUTE, p);
            }
            None => {
                self.remove_attr(POINTER_ATTRIBUTE);
            }
        }
    }

    pub fn has_pointer(&self) -> bool {
        self.has_attr(POINTER_ATTRIBUTE)
    }

    pub fn pointer(&self) -> Option<SharedObject> {
        self.attr(POINTER_ATTRIBUTE)
    }

    // ------------- pointer behavior -------------

    /// Direct target of a pointer, ignoring the extended path.
    pub fn target(&self) -> Option<SharedObject> {
        self.value.as_ref_object()
    }

    /// Point at a target, cleaning the extended path (the usual `set`).
    pub fn set_target(&mut self, target: Option<SharedObject>) {
        self.set_target_raw(target, true);
    }

    /// Point at a target, optionally keeping the extended path. The load
    /// path must keep it: the `_extended` child arrives in its own row.
    pub fn set_target_raw(&mut self, target: Option<SharedObject>, clean_extended: bool) {
        self.value = match target {
            Some(t) => Value::Ref(t),
            None => Value::Empty,
        };
        if clean_extended {
            self.clear_extended();
        }
    }

    /// The extended path, cleaned of legacy markers.
    pub fn extended(&self) -> String {
        let raw = match self.attr(EXTENDED_ATTRIBUTE) {
            Some(ext) => match ext.borrow().value() {
                Value::Text(s) => s.clone(),
                _ => String::new(),
            },
            None => String::new(),
        };
        raw.replace(LEGACY_EXTENDED_ATTR, "")
            .replace(LEGACY_EXTENDED_ITEMID, "")
    }

    pub fn has_extended(&self) -> bool {
        !self.extended().is_empty()
    }

    pub fn set_extended(&mut self, extended: &str) {
        match self.attr(EXTENDED_ATTRIBUTE) {
            Some(ext) => {
                ext.borrow_mut().value = Value::Text(extended.to_string());
            }
            None => {
                self.set_attr(EXTENDED_ATTRIBUTE, Object::text(extended));
            }
        }
    }

    pub fn clear_extended(&mut self) {
        if let Some(ext) = self.attr(EXTENDED_ATTRIBUTE) {
            ext.borrow_mut().value = Value::Empty;
        }
    }

    pub fn extended_parts(&self) -> Vec<String> {
        let ext = self.extended();
        if ext.is_empty() {
            Vec::new()
        } else {
            ext.split('.').map(str::to_string).collect()
        }
    }

    pub fn set_extended_parts(&mut self, parts: &[String]) {
        self.set_extended(&parts.join("."));
    }

    /// Concatenate one more component to the extended path.
    pub fn add_extended(&mut self, attribute: &str) {
        if self.has_extended() {
            let ext = format!("{}.{}", self.extended(), attribute);
            self.set_extended(&ext);
        } else {
            self.set_extended(attribute);
        }
    }

    /// Drop the last component of the extended path.
    pub fn remove_extended(&mut self) {
        if self.has_extended() {
            let mut parts = self.extended_parts();
            parts.pop();
            self.set_extended_parts(&parts);
        }
    }

    /// Resolve the pointer: follow the target, then drill through the
    /// extended path (attribute names and list indices). Items inside a
    /// backing-store Set are resolved by `Set` itself.
    pub fn follow(&self) -> Option<SharedObject> {
        let target = self.target()?;
        let ext = self.extended();
        if ext.is_empty() {
            return Some(target);
        }
        let mut current = target;
        for part in ext.split('.') {
            let next = current.borrow().resolve_part(part);
            match next {
                Some(n) => current = n,
                None => return None,
            }
        }
        Some(current)
    }

    pub fn points_none(&self) -> bool {
        self.follow().is_none()
    }

    /// Target id plus extended path, e.g. `"2.outputParticles"`.
    pub fn unique_id(&self) -> Option<String> {
        let target = self.target()?;
        let mut unique = target.borrow().str_id();
        if self.has_extended() {
            unique.push('.');
            unique.push_str(&self.extended());
        }
        Some(unique)
    }

    // ------------- list behavior -------------

    fn item_name(index: usize) -> String {
        format!("{}{:06}", ITEM_PREFIX, index + 1)
    }

    /// Append an element. Pointer lists coerce non-pointer objects into
    /// pointers at them.
    pub fn push(&mut self, obj: Object) -> SharedObject {
        let obj = if self.kind == Kind::PointerList && obj.kind != Kind::Pointer {
            let target = obj.shared();
            Object::pointer_to(&target)
        } else {
            obj
        };
        let name = Object::item_name(self.list_len());
        self.set_attr(&name, obj)
    }

    pub fn push_shared(&mut self, obj: SharedObject) {
        let coerced = if self.kind == Kind::PointerList && obj.borrow().kind != Kind::Pointer {
            Object::pointer_to(&obj).shared()
        } else {
            obj
        };
        let name = Object::item_name(self.list_len());
        self.set_attr_shared(&name, coerced);
    }

    pub fn list_len(&self) -> usize {
        self.attributes
            .iter()
            .filter(|(k, _)| k.starts_with(ITEM_PREFIX))
            .count()
    }

    pub fn list_is_empty(&self) -> bool {
        self.list_len() == 0
    }

    /// Element at `index` (0-based).
    pub fn item(&self, index: usize) -> Option<SharedObject> {
        self.attr(&Object::item_name(index))
    }

    pub fn items(&self) -> Vec<SharedObject> {
        self.attributes
            .iter()
            .filter(|(k, _)| k.starts_with(ITEM_PREFIX))
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Remove the element at `index`, keeping item names dense.
    pub fn remove_item(&mut self, index: usize) -> Option<SharedObject> {
        self.remove_attr(&Object::item_name(index))
    }

    pub fn clear_items(&mut self) {
        self.attributes.retain(|(k, _)| !k.starts_with(ITEM_PREFIX));
    }

    fn renumber_items(&mut self) {
        let mut index = 0;
        for (key, _) in self.attributes.iter_mut() {
            if key.starts_with(ITEM_PREFIX) {
                *key = Object::item_name(index);
                index += 1;
            }
        }
    }

    /// Attach a child loaded from storage. List items append in id order
    /// instead of landing on their (possibly stale) stored name.
    pub fn attach_loaded_child(&mut self, name: &str, child: SharedObject) {
        if self.kind.is_list() && name.starts_with(ITEM_PREFIX) {
            self.push_shared(child);
        } else {
            self.set_attr_shared(name, child);
        }
    }

    // ------------- csv behavior -------------

    pub fn csv_items(&self) -> Vec<String> {
        match &self.value {
            Value::Csv(items) => items.clone(),
            _ => Vec::new(),
        }
    }

    pub fn push_csv(&mut self, item: &str) {
        match &mut self.value {
            Value::Csv(items) => items.push(item.to_string()),
            _ => self.value = Value::Csv(vec![item.to_string()]),
        }
    }

    pub fn csv_len(&self) -> usize {
        match &self.value {
            Value::Csv(items) => items.len(),
            _ => 0,
        }
    }

    // ------------- comparison -------------

    /// Structural equality: scalars by value (floats within an epsilon),
    /// pointers by target id and extended path, compound nodes and lists
    /// attribute by attribute.
    pub fn equal_attributes(&self, other: &Object, ignore: &[&str]) -> bool {
        match self.kind {
            Kind::Float => {
                match (self.value.as_float(), other.value.as_float()) {
                    (Some(a), Some(b)) => (a - b).abs() < FLOAT_EQUAL_PRECISION,
                    (None, None) => true,
                    _ => false,
                }
            }
            Kind::Integer | Kind::Boolean | Kind::Text | Kind::Csv => self.value == other.value,
            Kind::Pointer => {
                let self_id = self.target().and_then(|t| t.borrow().id());
                let other_id = other.target().and_then(|t| t.borrow().id());
                self_id == other_id && self.extended() == other.extended()
            }
            _ => {
                for (key, mine) in self.attributes() {
                    if ignore.contains(&key) {
                        continue;
                    }
                    let theirs = match other.attr(key) {
                        Some(a) => a,
                        None => return false,
                    };
                    if !mine.borrow().equal_attributes(&theirs.borrow(), ignore) {
                        return false;
                    }
                }
                true
            }
        }
    }

    // ------------- copy / clone -------------

    /// Copy all attribute values from `other`, creating missing children,
    /// then rewrite pointers that referenced objects inside the copied
    /// subtree so they target the new counterparts. Pointers to objects
    /// outside the subtree are left as they are.
    pub fn copy_from(&mut self, other: &Object, copy_id: bool) {
        self.copy_from_ext(other, copy_id, &[], false);
    }

    pub fn copy_from_ext(
        &mut self,
        other: &Object,
        copy_id: bool,
        ignore: &[&str],
        copy_enable: bool,
    ) {
        let mut ctx = CopyContext::default();
        self.copy_rec(other, &mut ctx, copy_id, ignore, copy_enable);
        for ptr in ctx.internal_pointers {
            let pointed_id = ptr
                .borrow()
                .target()
                .and_then(|t| t.borrow().id());
            if let Some(pointed_id) = pointed_id {
                if let Some(replacement) = ctx.id_map.get(&pointed_id) {
                    ptr.borrow_mut().set_target(Some(replacement.clone()));
                }
            }
        }
    }

    fn copy_rec(
        &mut self,
        other: &Object,
        ctx: &mut CopyContext,
        copy_id: bool,
        ignore: &[&str],
        copy_enable: bool,
    ) {
        if copy_id {
            self.id = other.id;
        }
        self.value = other.value.clone();
        self.label = other.label.clone();
        self.comment = other.comment.clone();
        if copy_enable {
            self.enabled = other.enabled;
        }
        for (name, attr) in other.attributes() {
            if ignore.contains(&name) {
                continue;
            }
            let mine = match self.attr(name) {
                Some(m) => m,
                None => self.set_attr(name, attr.borrow().new_of_same_class()),
            };
            mine.borrow_mut()
                .copy_rec(&attr.borrow(), ctx, copy_id, &[], copy_enable);
            if let Some(attr_id) = attr.borrow().id() {
                ctx.id_map.insert(attr_id, mine.clone());
            }
            let is_internal_pointer = {
                let m = mine.borrow();
                m.is_pointer() && m.target().is_some()
            };
            if is_internal_pointer {
                ctx.internal_pointers.push(mine.clone());
            }
        }
    }

    /// Deep clone with ids copied, as a fresh owned object.
    pub fn clone_object(&self) -> Object {
        let mut cloned = self.new_of_same_class();
        cloned.copy_from(self, true);
        cloned
    }

    // ------------- flattened attribute dictionaries -------------

    /// Flatten the stored, non-pointer attributes into dotted labels, in
    /// declaration order. With `include_class` the reserved `self` entry
    /// (this object's class) comes first; the flat mapper infers its
    /// schema from this dictionary.
    pub fn obj_dict(&self, include_class: bool) -> Vec<DictEntry> {
        let mut entries = Vec::new();
        if include_class {
            entries.push(DictEntry {
                label: "self".to_string(),
                class_name: self.class_name.clone(),
                value: Value::Empty,
            });
        }
        self.fill_dict("", &mut entries);
        entries
    }

    fn fill_dict(&self, prefix: &str, entries: &mut Vec<DictEntry>) {
        for (key, attr) in self.attributes_to_store() {
            let attr = attr.borrow();
            if attr.is_pointer() {
                continue;
            }
            let label = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", prefix, key)
            };
            entries.push(DictEntry {
                label: label.clone(),
                class_name: attr.class_name.clone(),
                value: attr.stored_value(),
            });
            if !attr.is_scalar() {
                attr.fill_dict(&label, entries);
            }
        }
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_scalar() || self.is_pointer() {
            write!(f, "{}", self.value)
        } else {
            write!(f, "{} ({} attributes)", self.class_name, self.attributes.len())
        }
    }
}

#[derive(Default)]
struct CopyContext {
    id_map: HashMap<ObjId, SharedObject>,
    internal_pointers: Vec<SharedObject>,
}

fn convert_value(kind: Kind, class_name: &str, value: Value) -> Result<Value> {
    let drift = |value: &Value| MapperError::TypeDrift {
        message: format!("can't convert {} into a {}", value, class_name),
    };
    match kind {
        Kind::Integer => match &value {
            Value::Int(_) => Ok(value),
            Value::Float(f) => Ok(Value::Int(*f as i64)),
            Value::Bool(b) => Ok(Value::Int(*b as i64)),
            Value::Text(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| drift(&value)),
            _ => Err(drift(&value)),
        },
        Kind::Float => match &value {
            Value::Float(_) => Ok(value),
            Value::Int(i) => Ok(Value::Float(*i as f64)),
            Value::Text(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| drift(&value)),
            _ => Err(drift(&value)),
        },
        Kind::Boolean => match &value {
            Value::Bool(_) => Ok(value),
            Value::Int(i) => Ok(Value::Bool(*i != 0)),
            Value::Float(f) => Ok(Value::Bool(*f != 0.0)),
            Value::Text(s) => {
                let v = s.trim().to_lowercase();
                Ok(Value::Bool(v == "true" || v == "1"))
            }
            _ => Err(drift(&value)),
        },
        Kind::Text => match &value {
            Value::Text(_) => Ok(value),
            Value::Ref(_) => Err(drift(&value)),
            other => Ok(Value::Text(other.to_string())),
        },
        Kind::Csv => match value {
            Value::Csv(_) => Ok(value),
            Value::Text(s) => {
                if s.is_empty() {
                    Ok(Value::Csv(Vec::new()))
                } else {
                    Ok(Value::Csv(s.split(',').map(str::to_string).collect()))
                }
            }
            other => Err(drift(&other)),
        },
        Kind::Pointer => match value {
            Value::Ref(_) => Ok(value),
            other => Err(drift(&other)),
        },
        Kind::Compound | Kind::List | Kind::PointerList => Err(MapperError::TypeDrift {
            message: format!("{} does not hold a scalar value", class_name),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_coercion_from_text() {
        let mut i = Object::new(Kind::Integer);
        i.set(Value::Text(" 42 ".to_string())).unwrap();
        assert_eq!(i.get(), Value::Int(42));
        assert!(i.set(Value::Text("not a number".to_string())).is_err());
        // failed coercion keeps the previous value
        assert_eq!(i.get(), Value::Int(42));
    }

    #[test]
    fn boolean_permissive_parse() {
        let mut b = Object::new(Kind::Boolean);
        b.set(Value::Text("True".to_string())).unwrap();
        assert_eq!(b.get(), Value::Bool(true));
        b.set(Value::Text("0".to_string())).unwrap();
        assert_eq!(b.get(), Value::Bool(false));
        b.set(Value::Text("1".to_string())).unwrap();
        assert_eq!(b.get(), Value::Bool(true));
    }

    #[test]
    fn list_items_keep_dense_names() {
        let mut list = Object::list();
        list.push(Object::integer(1));
        list.push(Object::integer(2));
        list.push(Object::integer(3));
        list.remove_item(1);
        assert_eq!(list.list_len(), 2);
        assert_eq!(list.item(0).unwrap().borrow().get(), Value::Int(1));
        assert_eq!(list.item(1).unwrap().borrow().get(), Value::Int(3));
    }

    #[test]
    fn extended_path_legacy_markers_are_stripped() {
        let target = Object::compound("Thing").shared();
        let mut p = Object::pointer_to(&target);
        p.set_extended("__attribute__real");
        assert_eq!(p.extended(), "real");
    }
}

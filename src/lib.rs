//! Objmap – object-graph persistence over SQLite for scientific-workflow data.
//!
//! Objmap stores trees of typed, dynamically-attributed objects (the kind a
//! processing workflow passes between its steps: acquisition settings,
//! micrographs, particle sets) in SQLite files, with two complementary
//! strategies:
//! * The **generic mapper** ([`generic::SqliteMapper`]) writes one row per
//!   tree node into a wide `Objects` table, plus a `Relations` table for
//!   named links between stored objects. It handles arbitrary heterogeneous
//!   graphs, pointers between them included.
//! * The **flat mapper** ([`flat::FlatMapper`]) writes one row per item of a
//!   large homogeneous collection, inferring a narrow column-per-attribute
//!   schema from the first inserted item and recording it in a `Classes`
//!   side table so the file is self-describing.
//!
//! ## Modules
//! * [`object`] – The value model: [`object::Object`] nodes with a typed
//!   [`object::Value`] slot, scalar kinds with coercion, pointers with
//!   extended paths, list flavors, deep copy with pointer fix-up.
//! * [`registry`] – [`registry::ClassRegistry`], mapping stored class-name
//!   strings to object factories. Unknown names are skipped on load, so old
//!   files with retired classes still open.
//! * [`generic`] – The generic one-row-per-node mapper.
//! * [`flat`] – The flat one-row-per-item mapper, with queries, `unique`
//!   and aggregate support over logical attribute labels.
//! * [`set`] – [`set::Set`], an out-of-line collection backed by its own
//!   flat-mapped file, with stream state and header properties.
//! * [`db`] – The low-level connection/transaction/introspection adapter.
//! * [`error`] – [`error::MapperError`] and the crate [`error::Result`].
//!
//! ## Quick Start
//! ```
//! use std::rc::Rc;
//! use objmap::{ClassRegistry, Object, SqliteMapper, Value};
//!
//! let registry = Rc::new(ClassRegistry::with_basic());
//! let mut mapper = SqliteMapper::open(":memory:", registry).unwrap();
//! let mut acquisition = Object::compound("Object");
//! acquisition.set_attr("_magnification", Object::float(50000.0));
//! let acquisition = acquisition.shared();
//! mapper.insert(&acquisition).unwrap();
//! mapper.commit().unwrap();
//! let id = acquisition.borrow().id().unwrap();
//! let loaded = mapper.select_by_id(id).unwrap().unwrap();
//! assert_eq!(
//!     loaded.borrow().get_nested_value("_magnification"),
//!     Value::Float(50000.0)
//! );
//! ```
//!
//! ## Durability
//! Writes stay invisible to other connections until `commit()`; dropping a
//! mapper without committing rolls the pending work back.

pub mod db;
pub mod error;
pub mod flat;
pub mod generic;
pub mod object;
pub mod registry;
pub mod set;

pub use error::{MapperError, Result};
pub use flat::{Direction, FlatMapper, Query};
pub use generic::{ObjectRow, RelationRow, SqliteMapper};
pub use object::{Kind, ObjId, Object, SharedObject, Value};
pub use registry::ClassRegistry;
pub use set::{Set, StreamState};

//! Class registry: class-name strings mapped to object factories.
//!
//! Storage records class names as text. Reconstruction looks the name up
//! here and calls the factory; an unregistered name is not an error, the
//! mappers log it and skip the node so old files with retired classes
//! still load.

use std::collections::HashMap;
use std::hash::BuildHasherDefault;

use seahash::SeaHasher;
use tracing::warn;

use crate::object::{Kind, Object};

type ClassHasher = BuildHasherDefault<SeaHasher>;

type Factory = Box<dyn Fn() -> Object>;

pub struct ClassRegistry {
    factories: HashMap<String, Factory, ClassHasher>,
}

impl ClassRegistry {
    /// An empty registry. Most callers want [`ClassRegistry::with_basic`].
    pub fn new() -> ClassRegistry {
        ClassRegistry {
            factories: HashMap::default(),
        }
    }

    /// A registry with the built-in classes pre-registered.
    pub fn with_basic() -> ClassRegistry {
        let mut registry = ClassRegistry::new();
        registry.register("Object", || Object::new(Kind::Compound));
        registry.register("Integer", || Object::new(Kind::Integer));
        registry.register("Float", || Object::new(Kind::Float));
        registry.register("Boolean", || Object::new(Kind::Boolean));
        registry.register("String", || Object::new(Kind::Text));
        registry.register("CsvList", Object::csv_list);
        registry.register("Pointer", || Object::new(Kind::Pointer));
        registry.register("List", Object::list);
        registry.register("PointerList", Object::pointer_list);
        registry
    }

    /// Register a domain class under its stored name. Replaces any
    /// previous factory for the same name.
    pub fn register<F>(&mut self, class_name: &str, factory: F)
    where
        F: Fn() -> Object + 'static,
    {
        self.factories
            .insert(class_name.to_string(), Box::new(factory));
    }

    /// Register a compound domain class with no special construction.
    pub fn register_compound(&mut self, class_name: &str) {
        let name = class_name.to_string();
        self.register(class_name, move || Object::compound(&name));
    }

    pub fn is_registered(&self, class_name: &str) -> bool {
        self.factories.contains_key(class_name)
    }

    /// Build a fresh instance of `class_name`, or `None` (with a warning)
    /// when the name is unknown.
    pub fn build(&self, class_name: &str) -> Option<Object> {
        match self.factories.get(class_name) {
            Some(factory) => {
                let mut obj = factory();
                obj.set_class_name(class_name);
                Some(obj)
            }
            None => {
                warn!(class = class_name, "class not registered, object skipped");
                None
            }
        }
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        ClassRegistry::with_basic()
    }
}

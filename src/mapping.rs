//! Per type storage metadata: collection names, id properties and field aliases.
//!
//! [`MetadataProvider`] is the read side used by the rest of the client.
//! [`MappingRegistry`] is an in-process implementation configured in code:
//!
//! ```ignore
//! let registry = MappingRegistry::new();
//! registry.configure::<Order>(|m| {
//!     m.collection("orders")
//!         .properties(["Code", "Total"])
//!         .id_property("Code")
//!         .alias("Total", "t")
//! });
//! assert_eq!(registry.property_alias(TypeKey::of::<Order>(), "Code"), "_id");
//! ```
//!
//! Inheritance is modelled with an explicit base type (`discriminated_by`). Lookups
//! that find nothing on a type continue on its base.
use std::{
    any::{TypeId, type_name},
    collections::{HashMap, HashSet},
    fmt,
    hash::{Hash, Hasher},
    sync::{PoisonError, RwLock},
};

use log::debug;

/// Field name the server uses for document identity.
pub const ID_FIELD: &str = "_id";

/// Property names treated as the id when none is configured, in order.
const ID_CONVENTIONS: [&str; 4] = ["_id", "Id", "id", "ID"];

/// Identity of a Rust type plus its name for display and defaults.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type name without module path or generic arguments.
    pub fn scrubbed_name(&self) -> String {
        let base = self.name.split('<').next().unwrap_or(self.name);
        base.rsplit("::").next().unwrap_or(base).to_string()
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

pub trait MetadataProvider: Send + Sync {
    /// Name of the property holding the document id, if the type has one.
    fn id_property(&self, key: TypeKey) -> Option<String>;

    /// Field name `property` is stored under.
    fn property_alias(&self, key: TypeKey, property: &str) -> String;

    fn collection_name(&self, key: TypeKey) -> String;

    fn connection_string(&self, key: TypeKey) -> Option<String>;
}

/// Configuration for one type, built inside [`MappingRegistry::configure`].
#[derive(Debug, Clone, Default)]
pub struct TypeMapping {
    collection: Option<String>,
    connection_string: Option<String>,
    id_property: Option<String>,
    aliases: HashMap<String, String>,
    properties: Vec<String>,
    base: Option<TypeKey>,
    reference: bool,
}

impl TypeMapping {
    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collection = Some(name.into());
        self
    }

    pub fn connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    pub fn id_property(mut self, property: impl Into<String>) -> Self {
        self.id_property = Some(property.into());
        self
    }

    pub fn alias(mut self, property: impl Into<String>, alias: impl Into<String>) -> Self {
        self.aliases.insert(property.into(), alias.into());
        self
    }

    /// Declares the type's properties; used to find a conventional id.
    pub fn properties<I, P>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.properties.extend(properties.into_iter().map(Into::into));
        self
    }

    /// Stores the type as a variant of `B`; unresolved lookups fall through to `B`.
    pub fn discriminated_by<B: ?Sized + 'static>(mut self) -> Self {
        self.base = Some(TypeKey::of::<B>());
        self
    }

    /// Marks a reference to a document in another collection. Its id property
    /// keeps its own name instead of becoming `_id`.
    pub fn reference(mut self) -> Self {
        self.reference = true;
        self
    }
}

#[derive(Default)]
pub struct MappingRegistry {
    types: RwLock<HashMap<TypeKey, TypeMapping>>,
    ids: RwLock<HashMap<TypeKey, Option<String>>>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or extends the mapping of `T`.
    pub fn configure<T: ?Sized + 'static>(
        &self,
        configure: impl FnOnce(TypeMapping) -> TypeMapping,
    ) {
        let key = TypeKey::of::<T>();
        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        let mapping = configure(types.remove(&key).unwrap_or_default());
        types.insert(key, mapping);

        // derived types may have resolved through this one
        self.ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        debug!("configured mapping for {key:?}");
    }

    /// Drops the mapping of `T`. Returns whether one existed.
    pub fn remove<T: ?Sized + 'static>(&self) -> bool {
        let key = TypeKey::of::<T>();
        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        let removed = types.remove(&key).is_some();
        self.ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        removed
    }

    pub fn is_configured<T: ?Sized + 'static>(&self) -> bool {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&TypeKey::of::<T>())
    }

    // Callers hold the `types` read lock, which keeps a concurrent
    // `configure` from clearing the memo between resolve and insert.
    fn memoized_id(
        &self,
        types: &HashMap<TypeKey, TypeMapping>,
        key: TypeKey,
    ) -> Option<String> {
        let ids = self.ids.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = ids.get(&key) {
            return id.clone();
        }
        drop(ids);

        let id = resolve_id(types, key);
        self.ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert(id)
            .clone()
    }
}

fn resolve_id(types: &HashMap<TypeKey, TypeMapping>, key: TypeKey) -> Option<String> {
    let mut seen = HashSet::new();
    let mut current = key;
    while seen.insert(current) {
        let mapping = types.get(&current)?;
        if let Some(id) = &mapping.id_property {
            return Some(id.clone());
        }

        let conventional = ID_CONVENTIONS
            .iter()
            .find(|name| mapping.properties.iter().any(|p| p.as_str() == **name));
        if let Some(name) = conventional {
            return Some(name.to_string());
        }
        current = mapping.base?;
    }
    None
}

impl MetadataProvider for MappingRegistry {
    fn id_property(&self, key: TypeKey) -> Option<String> {
        let types = self.types.read().unwrap_or_else(PoisonError::into_inner);
        self.memoized_id(&types, key)
    }

    fn property_alias(&self, key: TypeKey, property: &str) -> String {
        let types = self.types.read().unwrap_or_else(PoisonError::into_inner);
        let mut seen = HashSet::new();
        let mut current = key;

        while seen.insert(current) {
            let mapping = types.get(&current);
            let reference = mapping.is_some_and(|m| m.reference);
            if !reference && self.memoized_id(&types, current).as_deref() == Some(property) {
                return ID_FIELD.to_string();
            }

            let Some(mapping) = mapping else { break };
            if let Some(alias) = mapping.aliases.get(property) {
                return alias.clone();
            }
            match mapping.base {
                Some(base) => current = base,
                None => break,
            }
        }
        property.to_string()
    }

    fn collection_name(&self, key: TypeKey) -> String {
        let types = self.types.read().unwrap_or_else(PoisonError::into_inner);
        types
            .get(&key)
            .and_then(|m| m.collection.clone())
            .unwrap_or_else(|| key.scrubbed_name())
    }

    fn connection_string(&self, key: TypeKey) -> Option<String> {
        let types = self.types.read().unwrap_or_else(PoisonError::into_inner);
        types.get(&key).and_then(|m| m.connection_string.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    struct Product;
    struct Book;
    struct Order;
    struct Reference;
    struct Wrapper<T>(T);

    fn key<T: 'static>() -> TypeKey {
        TypeKey::of::<T>()
    }

    fn catalog() -> MappingRegistry {
        let registry = MappingRegistry::new();
        registry.configure::<Product>(|m| {
            m.collection("products")
                .properties(["Id", "Name", "Price"])
                .alias("Price", "p")
                .alias("Id", "ignored")
        });
        registry.configure::<Book>(|m| {
            m.properties(["Title", "Isbn"])
                .alias("Title", "t")
                .discriminated_by::<Product>()
        });
        registry
    }

    #[test]
    fn scrubbed_names_drop_paths_and_generics() {
        assert_eq!(key::<Product>().scrubbed_name(), "Product");
        assert_eq!(key::<Wrapper<Product>>().scrubbed_name(), "Wrapper");
        assert_eq!(key::<Vec<String>>().scrubbed_name(), "Vec");
        assert_eq!(key::<u64>().scrubbed_name(), "u64");
        assert_ne!(key::<Wrapper<Product>>(), key::<Wrapper<Book>>());
    }

    #[test]
    fn collection_and_connection_string() {
        let registry = catalog();
        registry.configure::<Order>(|m| m.connection_string("mongodb://orders:27017/shop"));

        assert_eq!(registry.collection_name(key::<Product>()), "products");
        assert_eq!(registry.collection_name(key::<Order>()), "Order");
        assert_eq!(
            registry.connection_string(key::<Order>()).as_deref(),
            Some("mongodb://orders:27017/shop")
        );
        assert_eq!(registry.connection_string(key::<Product>()), None);
    }

    #[test]
    fn id_property_resolution() {
        let registry = catalog();
        registry.configure::<Order>(|m| m.properties(["Code", "id"]).id_property("Code"));

        assert_eq!(registry.id_property(key::<Order>()).as_deref(), Some("Code"));
        assert_eq!(registry.id_property(key::<Product>()).as_deref(), Some("Id"));
        assert_eq!(registry.id_property(key::<Book>()).as_deref(), Some("Id"));
        assert_eq!(registry.id_property(key::<Reference>()), None);
    }

    #[test]
    fn alias_precedence() {
        let registry = catalog();
        let product = key::<Product>();
        let book = key::<Book>();

        assert_eq!(registry.property_alias(product, "Id"), "_id");
        assert_eq!(registry.property_alias(product, "Price"), "p");
        assert_eq!(registry.property_alias(product, "Name"), "Name");

        assert_eq!(registry.property_alias(book, "Title"), "t");
        assert_eq!(registry.property_alias(book, "Price"), "p");
        assert_eq!(registry.property_alias(book, "Id"), "_id");
        assert_eq!(registry.property_alias(book, "Isbn"), "Isbn");

        assert_eq!(registry.property_alias(key::<Order>(), "Total"), "Total");
    }

    #[test]
    fn reference_types_keep_their_id_name() {
        let registry = MappingRegistry::new();
        registry.configure::<Reference>(|m| {
            m.properties(["id", "ref"])
                .alias("ref", "$ref")
                .reference()
        });

        assert_eq!(registry.id_property(key::<Reference>()).as_deref(), Some("id"));
        assert_eq!(registry.property_alias(key::<Reference>(), "id"), "id");
        assert_eq!(registry.property_alias(key::<Reference>(), "ref"), "$ref");
    }

    #[test]
    fn cyclic_bases_terminate() {
        let registry = MappingRegistry::new();
        registry.configure::<Product>(|m| m.discriminated_by::<Book>());
        registry.configure::<Book>(|m| m.discriminated_by::<Product>());

        assert_eq!(registry.property_alias(key::<Product>(), "Name"), "Name");
        assert_eq!(registry.id_property(key::<Book>()), None);
    }

    #[test]
    fn reconfiguring_invalidates_memo() {
        let registry = catalog();
        assert_eq!(registry.id_property(key::<Book>()).as_deref(), Some("Id"));

        registry.configure::<Product>(|m| m.id_property("Sku"));
        assert_eq!(registry.id_property(key::<Book>()).as_deref(), Some("Sku"));
        assert_eq!(registry.property_alias(key::<Product>(), "Sku"), "_id");
        // the existing configuration was extended, not replaced
        assert_eq!(registry.collection_name(key::<Product>()), "products");

        assert!(registry.remove::<Product>());
        assert!(!registry.remove::<Product>());
        assert!(!registry.is_configured::<Product>());
        assert_eq!(registry.id_property(key::<Book>()), None);
        assert_eq!(registry.property_alias(key::<Book>(), "Price"), "Price");
    }

    #[test]
    fn concurrent_first_lookups_agree() {
        let registry = Arc::new(catalog());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    (0..100)
                        .map(|_| registry.id_property(key::<Book>()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        for handle in handles {
            for id in handle.join().unwrap() {
                assert_eq!(id.as_deref(), Some("Id"));
            }
        }
    }
}

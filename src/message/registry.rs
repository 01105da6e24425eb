//! Process type registry: names, tags and the resolved message hierarchy.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::{MessageType, TypeDescriptor};
use crate::sync::{read, write};

/// Small integer assigned to a message type when it is registered.
///
/// Tags are dense indices in registration order, so lookups are O(1).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeTag(u32);

impl TypeTag {
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("message type name `{name}` is already registered by a different type")]
    DuplicateName { name: &'static str },
}

struct TypeEntry {
    name: &'static str,
    parents: Vec<TypeTag>,
    /// Every transitive parent, nearest first.
    ancestors: Vec<TypeTag>,
    /// Every registered type that lists this one among its ancestors.
    descendants: Vec<TypeTag>,
}

#[derive(Default)]
struct RegistryInner {
    entries: Vec<TypeEntry>,
    by_type: HashMap<TypeId, TypeTag>,
    by_name: HashMap<&'static str, TypeTag>,
}

/// Maps message types to tags and precomputes ancestry.
///
/// Registration is explicit and idempotent: [`register`](Self::register)
/// assigns tags deterministically in call order, registering declared
/// parents first. Types published without prior registration are
/// registered on first use.
#[derive(Default)]
pub struct MessageRegistry {
    inner: RwLock<RegistryInner>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry shared by every bus created with `Bus::new`.
    pub fn global() -> Arc<MessageRegistry> {
        static GLOBAL: OnceLock<Arc<MessageRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(MessageRegistry::new())))
    }

    pub fn register<T: MessageType>(&self) -> Result<TypeTag, RegistryError> {
        self.ensure(T::descriptor())
    }

    /// Register the described type if needed and return its tag.
    pub fn ensure(&self, descriptor: TypeDescriptor) -> Result<TypeTag, RegistryError> {
        if let Some(tag) = read(&self.inner).by_type.get(&descriptor.type_id()) {
            return Ok(*tag);
        }

        // Parents take their own locks, so resolve them before taking ours.
        let parents = descriptor
            .parents()
            .into_iter()
            .map(|parent| self.ensure(parent))
            .collect::<Result<Vec<_>, _>>()?;

        let mut inner = write(&self.inner);
        if let Some(tag) = inner.by_type.get(&descriptor.type_id()) {
            return Ok(*tag);
        }
        if inner.by_name.contains_key(descriptor.name()) {
            return Err(RegistryError::DuplicateName {
                name: descriptor.name(),
            });
        }

        let mut ancestors: Vec<TypeTag> = Vec::new();
        for parent in &parents {
            if !ancestors.contains(parent) {
                ancestors.push(*parent);
            }
        }
        for parent in &parents {
            for ancestor in &inner.entries[parent.0 as usize].ancestors {
                if !ancestors.contains(ancestor) {
                    ancestors.push(*ancestor);
                }
            }
        }

        let tag = TypeTag(inner.entries.len() as u32);
        for ancestor in &ancestors {
            inner.entries[ancestor.0 as usize].descendants.push(tag);
        }
        inner.entries.push(TypeEntry {
            name: descriptor.name(),
            parents,
            ancestors,
            descendants: Vec::new(),
        });
        inner.by_type.insert(descriptor.type_id(), tag);
        inner.by_name.insert(descriptor.name(), tag);

        debug!(message_type = descriptor.name(), %tag, "registered message type");
        Ok(tag)
    }

    pub fn tag_of<T: MessageType>(&self) -> Option<TypeTag> {
        read(&self.inner).by_type.get(&TypeId::of::<T>()).copied()
    }

    pub fn tag_by_name(&self, name: &str) -> Option<TypeTag> {
        read(&self.inner).by_name.get(name).copied()
    }

    pub fn name_of(&self, tag: TypeTag) -> Option<&'static str> {
        read(&self.inner)
            .entries
            .get(tag.0 as usize)
            .map(|entry| entry.name)
    }

    pub fn parents(&self, tag: TypeTag) -> Vec<TypeTag> {
        self.with_entry(tag, |entry| entry.parents.clone())
    }

    /// Transitive parents, nearest first. Excludes `tag` itself.
    pub fn ancestors(&self, tag: TypeTag) -> Vec<TypeTag> {
        self.with_entry(tag, |entry| entry.ancestors.clone())
    }

    /// Registered types below `tag`. Excludes `tag` itself.
    pub fn descendants(&self, tag: TypeTag) -> Vec<TypeTag> {
        self.with_entry(tag, |entry| entry.descendants.clone())
    }

    /// Names of `tag` and all of its ancestors.
    pub fn lineage_names(&self, tag: TypeTag) -> Vec<&'static str> {
        let inner = read(&self.inner);
        let Some(entry) = inner.entries.get(tag.0 as usize) else {
            return Vec::new();
        };
        std::iter::once(entry.name)
            .chain(
                entry
                    .ancestors
                    .iter()
                    .map(|a| inner.entries[a.0 as usize].name),
            )
            .collect()
    }

    pub fn is_a(&self, tag: TypeTag, ancestor: TypeTag) -> bool {
        tag == ancestor || self.with_entry(tag, |entry| entry.ancestors.contains(&ancestor))
    }

    pub fn len(&self) -> usize {
        read(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_entry<R: Default>(&self, tag: TypeTag, f: impl FnOnce(&TypeEntry) -> R) -> R {
        read(&self.inner)
            .entries
            .get(tag.0 as usize)
            .map(f)
            .unwrap_or_default()
    }
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = read(&self.inner);
        f.debug_struct("MessageRegistry")
            .field(
                "types",
                &inner.entries.iter().map(|e| e.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AnyCommand, AnyMessage, MessageHeader};

    #[derive(Debug, courier::Message)]
    #[message(name = "registry.Base", command)]
    struct Base {
        header: MessageHeader,
    }

    #[derive(Debug, courier::Message)]
    #[message(name = "registry.Derived", command, parent = Base)]
    struct Derived {
        header: MessageHeader,
    }

    #[derive(Debug, courier::Message)]
    #[message(name = "registry.Base")]
    struct Impostor {
        header: MessageHeader,
    }

    #[test]
    fn registers_parents_first_in_order() {
        let registry = MessageRegistry::new();
        let derived = registry.register::<Derived>().unwrap();

        let message = registry.tag_of::<AnyMessage>().unwrap();
        let command = registry.tag_of::<AnyCommand>().unwrap();
        let base = registry.tag_of::<Base>().unwrap();

        assert_eq!(message.index(), 0);
        assert_eq!(command.index(), 1);
        assert_eq!(base.index(), 2);
        assert_eq!(derived.index(), 3);
        assert_eq!(registry.ancestors(derived), vec![command, base, message]);
    }

    #[test]
    fn registration_is_idempotent() {
        let registry = MessageRegistry::new();
        let first = registry.register::<Base>().unwrap();
        let second = registry.register::<Base>().unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn descendants_are_tracked() {
        let registry = MessageRegistry::new();
        let base = registry.register::<Base>().unwrap();
        let derived = registry.register::<Derived>().unwrap();
        let command = registry.tag_of::<AnyCommand>().unwrap();

        assert_eq!(registry.descendants(base), vec![derived]);
        assert!(registry.descendants(command).contains(&derived));
        assert!(registry.is_a(derived, command));
        assert!(!registry.is_a(base, derived));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let registry = MessageRegistry::new();
        registry.register::<Base>().unwrap();
        let err = registry.register::<Impostor>().unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateName {
                name: "registry.Base"
            }
        );
    }

    #[test]
    fn lineage_names_include_self_and_ancestors() {
        let registry = MessageRegistry::new();
        let derived = registry.register::<Derived>().unwrap();
        assert_eq!(
            registry.lineage_names(derived),
            vec![
                "registry.Derived",
                "courier.Command",
                "registry.Base",
                "courier.Message"
            ]
        );
        assert_eq!(registry.tag_by_name("registry.Base"), registry.tag_of::<Base>());
    }
}

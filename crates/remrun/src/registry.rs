//! # Interface Registry
//!
//! Assigns stable wire ids to remoted interfaces and their methods.
//!
//! An interface is declared once as an [`InterfaceDefinition`]: a full name,
//! its methods and the base interfaces it inherits. Registration turns a
//! definition into an immutable [`InterfaceDescriptor`] and stores it in a
//! concurrent table keyed by id and by name.
//!
//! ## Invariants
//!
//! - **Determinism**: ids are derived from names (or pinned explicitly), so
//!   registering the same definition twice, in any process, yields the same ids.
//! - **First writer wins**: a registered descriptor is never replaced; a later
//!   registration of the same name returns the cached descriptor.
//! - **No silent overwrite**: two distinct interfaces whose ids collide are a
//!   fatal configuration error. A name is bound to its id together with the
//!   descriptor, under the name's entry lock.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use remwire::InterfaceId;
use remwire::MethodId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Two distinct interfaces computed the same id.
    IdCollision { id: InterfaceId, existing: String, incoming: String },
    /// Two methods of one interface share an id.
    MethodIdCollision { interface: String, id: MethodId, first: String, second: String },
    /// An interface name was registered earlier under a different id.
    ConflictingId { interface: String, registered: InterfaceId, requested: InterfaceId },
    InterfaceNotFound(InterfaceId),
    InterfaceNameNotFound(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IdCollision { id, existing, incoming } => write!(
                f,
                "Interface id collision on {}: '{}' is already registered, cannot register '{}'",
                id, existing, incoming
            ),
            Self::MethodIdCollision { interface, id, first, second } => write!(
                f,
                "Method id collision in '{}' on {}: '{}' and '{}'",
                interface, id, first, second
            ),
            Self::ConflictingId { interface, registered, requested } => write!(
                f,
                "Interface '{}' is registered as {}, cannot re-register as {}",
                interface, registered, requested
            ),
            Self::InterfaceNotFound(id) => write!(f, "Interface not found: {}", id),
            Self::InterfaceNameNotFound(name) => write!(f, "Interface not found: '{}'", name),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Name of a parameter or return type, used to build known-type sets.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct TypeRef(String);

impl TypeRef {
    pub fn of<T: ?Sized>() -> Self {
        Self(std::any::type_name::<T>().to_string())
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

/// Declaration of one remoted method.
#[derive(Clone, Debug)]
pub struct MethodDefinition {
    pub name: String,
    pub id: Option<MethodId>,
    pub parameters: Vec<TypeRef>,
    pub returns: Option<TypeRef>,
    pub cancellable: bool,
}

impl MethodDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            parameters: Vec::new(),
            returns: None,
            cancellable: false,
        }
    }

    /// Pins the wire id instead of deriving it from the name.
    pub fn with_id(mut self, id: i32) -> Self {
        self.id = Some(MethodId(id));
        self
    }

    pub fn param<T: ?Sized>(mut self) -> Self {
        self.parameters.push(TypeRef::of::<T>());
        self
    }

    pub fn returns<T: ?Sized>(mut self) -> Self {
        self.returns = Some(TypeRef::of::<T>());
        self
    }

    /// Declares that the method takes a cancellation token.
    pub fn cancellable(mut self) -> Self {
        self.cancellable = true;
        self
    }

    fn resolved_id(&self) -> MethodId {
        self.id.unwrap_or_else(|| MethodId::from_name(&self.name))
    }
}

/// Declaration of a remoted interface.
#[derive(Clone, Debug)]
pub struct InterfaceDefinition {
    pub full_name: String,
    pub id: Option<InterfaceId>,
    pub methods: Vec<MethodDefinition>,
    pub bases: Vec<InterfaceDefinition>,
}

impl InterfaceDefinition {
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            id: None,
            methods: Vec::new(),
            bases: Vec::new(),
        }
    }

    /// Pins the wire id instead of deriving it from the full name.
    pub fn with_id(mut self, id: i32) -> Self {
        self.id = Some(InterfaceId(id));
        self
    }

    pub fn method(mut self, method: MethodDefinition) -> Self {
        self.methods.push(method);
        self
    }

    pub fn extends(mut self, base: InterfaceDefinition) -> Self {
        self.bases.push(base);
        self
    }

    fn resolved_id(&self) -> InterfaceId {
        self.id.unwrap_or_else(|| InterfaceId::from_name(&self.full_name))
    }
}

/// Implemented by types that stand for a remoted interface.
pub trait RemotedInterface {
    fn definition() -> InterfaceDefinition;
}

/// Registered shape of one method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub id: MethodId,
    pub name: String,
    pub has_cancellation_token: bool,
    pub parameter_types: Vec<TypeRef>,
    pub return_type: Option<TypeRef>,
}

impl MethodDescriptor {
    pub fn returns_value(&self) -> bool {
        self.return_type.is_some()
    }
}

/// Registered shape of one interface.
#[derive(Debug)]
pub struct InterfaceDescriptor {
    pub id: InterfaceId,
    pub full_name: String,
    pub methods: Vec<MethodDescriptor>,
    /// Direct base interfaces.
    pub base_ids: Vec<InterfaceId>,
    by_id: HashMap<MethodId, usize>,
    known_types: BTreeSet<TypeRef>,
}

impl InterfaceDescriptor {
    fn from_definition(def: &InterfaceDefinition) -> Result<Self> {
        let mut methods = Vec::with_capacity(def.methods.len());
        let mut by_id = HashMap::new();
        let mut known_types = BTreeSet::new();

        for method in &def.methods {
            let id = method.resolved_id();
            if let Some(&existing) = by_id.get(&id) {
                let first: &MethodDescriptor = &methods[existing];
                return Err(Error::MethodIdCollision {
                    interface: def.full_name.clone(),
                    id,
                    first: first.name.clone(),
                    second: method.name.clone(),
                });
            }
            known_types.extend(method.parameters.iter().cloned());
            known_types.extend(method.returns.iter().cloned());
            by_id.insert(id, methods.len());
            methods.push(MethodDescriptor {
                id,
                name: method.name.clone(),
                has_cancellation_token: method.cancellable,
                parameter_types: method.parameters.clone(),
                return_type: method.returns.clone(),
            });
        }

        Ok(Self {
            id: def.resolved_id(),
            full_name: def.full_name.clone(),
            methods,
            base_ids: def.bases.iter().map(InterfaceDefinition::resolved_id).collect(),
            by_id,
            known_types,
        })
    }

    pub fn method(&self, id: MethodId) -> Option<&MethodDescriptor> {
        self.by_id.get(&id).map(|&i| &self.methods[i])
    }

    pub fn method_by_name(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Parameter and return types of every method, computed once at registration.
    pub fn known_types(&self) -> &BTreeSet<TypeRef> {
        &self.known_types
    }
}

/// Concurrent table of registered interfaces.
#[derive(Default)]
pub struct InterfaceRegistry {
    by_id: DashMap<InterfaceId, Arc<InterfaceDescriptor>>,
    by_name: DashMap<String, InterfaceId>,
}

static GLOBAL: Lazy<InterfaceRegistry> = Lazy::new(InterfaceRegistry::new);

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static InterfaceRegistry {
        &GLOBAL
    }

    /// Registers `I` and every base it inherits.
    pub fn register<I: RemotedInterface + ?Sized>(&self) -> Result<Arc<InterfaceDescriptor>> {
        self.register_definition(&I::definition())
    }

    /// Registers a definition and, independently, each of its bases.
    ///
    /// Returns the descriptor of `def` itself. Idempotent.
    pub fn register_definition(&self, def: &InterfaceDefinition) -> Result<Arc<InterfaceDescriptor>> {
        for base in &def.bases {
            self.register_definition(base)?;
        }

        let id = def.resolved_id();

        // The name slot stays locked until the id is committed, so two
        // registrations of one name cannot both claim it.
        let name_slot = match self.by_name.entry(def.full_name.clone()) {
            Entry::Occupied(entry) => {
                let registered = *entry.get();
                drop(entry);
                if registered != id {
                    return Err(Error::ConflictingId {
                        interface: def.full_name.clone(),
                        registered,
                        requested: id,
                    });
                }
                return self.resolve(id);
            }
            Entry::Vacant(slot) => slot,
        };

        match self.by_id.entry(id) {
            Entry::Occupied(entry) => {
                let existing = entry.get();
                tracing::error!(%id, existing = %existing.full_name, incoming = %def.full_name, "interface id collision");
                Err(Error::IdCollision {
                    id,
                    existing: existing.full_name.clone(),
                    incoming: def.full_name.clone(),
                })
            }
            Entry::Vacant(entry) => {
                let descriptor = Arc::new(InterfaceDescriptor::from_definition(def)?);
                entry.insert(descriptor.clone());
                name_slot.insert(id);
                tracing::debug!(%id, name = %def.full_name, methods = descriptor.methods.len(), "registered interface");
                Ok(descriptor)
            }
        }
    }

    pub fn resolve(&self, id: InterfaceId) -> Result<Arc<InterfaceDescriptor>> {
        self.by_id
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(Error::InterfaceNotFound(id))
    }

    pub fn resolve_name(&self, full_name: &str) -> Result<Arc<InterfaceDescriptor>> {
        let id = self
            .by_name
            .get(full_name)
            .map(|entry| *entry.value())
            .ok_or_else(|| Error::InterfaceNameNotFound(full_name.to_string()))?;
        self.resolve(id)
    }

    /// Returns `root` followed by every interface it inherits, each once.
    pub fn closure(&self, root: &Arc<InterfaceDescriptor>) -> Result<Vec<Arc<InterfaceDescriptor>>> {
        let mut out = vec![root.clone()];
        let mut seen = BTreeSet::from([root.id]);
        let mut i = 0;
        while i < out.len() {
            let bases = out[i].base_ids.clone();
            for base in bases {
                if seen.insert(base) {
                    out.push(self.resolve(base)?);
                }
            }
            i += 1;
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

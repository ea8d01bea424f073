//! # Stable Identifiers
//!
//! Interface and method ids substitute for fully-qualified names on the wire.
//! They are CRC-32 digests of the name, so two builds of the same interface
//! compute the same ids independently.

use serde::Deserialize;
use serde::Serialize;

/// Computes the stable 32-bit id of a name.
pub fn compute_id(name: &str) -> i32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(name.as_bytes());
    hasher.finalize() as i32
}

/// Wire id of a remoted interface.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterfaceId(pub i32);

impl InterfaceId {
    /// Derives the id from the interface's fully-qualified name.
    pub fn from_name(full_name: &str) -> Self {
        Self(compute_id(full_name))
    }
}

impl std::fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "interface-{}", self.0)
    }
}

/// Wire id of a method, unique within its interface.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId(pub i32);

impl MethodId {
    /// Derives the id from the method name.
    pub fn from_name(name: &str) -> Self {
        Self(compute_id(name))
    }
}

impl std::fmt::Display for MethodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "method-{}", self.0)
    }
}

/// Correlation key joining a cancellable request to its cancel message.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InvocationId(pub String);

impl InvocationId {
    /// Allocates a fresh, globally unique invocation id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InvocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

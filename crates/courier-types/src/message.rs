//! Message traits and type descriptors.
//!
//! Every request and notification type carries a logical identity made of a
//! namespace, a name and (for generic messages) the descriptors of its type
//! arguments. That identity, not the Rust type path, is what configuration keys
//! and wire names are derived from.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a message expects a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Exactly one handler, one reply.
    Request,
    /// Zero or more handlers, no reply.
    Notification,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Request => write!(f, "request"),
            MessageKind::Notification => write!(f, "notification"),
        }
    }
}

/// Logical identity of a message type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeDescriptor {
    /// Dotted namespace, e.g. `Orders.Events`.
    pub namespace: String,
    /// Simple type name, e.g. `OrderCreated`.
    pub name: String,
    /// Descriptors of the generic type arguments, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generic_args: Vec<TypeDescriptor>,
}

impl TypeDescriptor {
    /// Create a descriptor for a non-generic type.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            generic_args: Vec::new(),
        }
    }

    /// Attach generic argument descriptors.
    pub fn with_args(mut self, args: Vec<TypeDescriptor>) -> Self {
        self.generic_args = args;
        self
    }

    /// `Namespace.Name` without generic arguments.
    pub fn qualified_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    /// Full name used as the key of every per-type configuration map,
    /// e.g. `Foo.Box<Foo.Item>`.
    pub fn full_name(&self) -> String {
        let base = self.qualified_name();
        if self.generic_args.is_empty() {
            return base;
        }
        let args: Vec<String> = self.generic_args.iter().map(|a| a.full_name()).collect();
        format!("{}<{}>", base, args.join(", "))
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

/// A message that can travel through the dispatch fabric.
pub trait Message: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Dotted namespace of the message type.
    const NAMESPACE: &'static str;
    /// Simple name of the message type.
    const NAME: &'static str;

    /// Descriptors of the generic arguments. Non-generic messages keep the default.
    fn generic_args() -> Vec<TypeDescriptor> {
        Vec::new()
    }

    /// Logical identity of this message type.
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::new(Self::NAMESPACE, Self::NAME).with_args(Self::generic_args())
    }
}

/// A message handled by exactly one handler that produces a response.
///
/// Requests that only need an acknowledgment use `Response = ()`.
pub trait Request: Message {
    /// The reply type.
    type Response: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
}

/// A message delivered to zero or more handlers.
pub trait Notification: Message {}

/// A request that may also be published: the caller hands it off and does
/// not wait for the response. Remote handlers still serve it as a request.
pub trait NonBlockingRequest: Request {}

/// A message answered by a stream of items from a single local handler.
pub trait StreamRequest: Message {
    /// Element type of the stream.
    type Item: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
}

//! Type-erased message plumbing.
//!
//! Pipelines, routers and listeners handle messages whose concrete type is
//! only known at the edges. [`ErasedMessage`] lets them clone, serialize and
//! downcast such values; [`MessageInfo`] carries the monomorphised decode
//! functions a listener needs to turn wire bytes back into a typed message.

use courier_types::error::{CourierError, CourierResult};
use courier_types::message::{Message, MessageKind, Notification, Request, TypeDescriptor};
use serde::Serialize;
use std::any::{Any, TypeId};
use std::fmt;

/// A message or response whose concrete type has been erased.
pub trait ErasedMessage: Any + Send + Sync {
    fn to_json(&self) -> CourierResult<serde_json::Value>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
    fn clone_boxed(&self) -> DynMessage;
    fn rust_type_name(&self) -> &'static str;
}

impl<T> ErasedMessage for T
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    fn to_json(&self) -> CourierResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }

    fn clone_boxed(&self) -> DynMessage {
        Box::new(self.clone())
    }

    fn rust_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Boxed erased message.
pub type DynMessage = Box<dyn ErasedMessage>;

/// Recover the concrete value of an erased message.
pub fn downcast<T: 'static>(message: DynMessage) -> CourierResult<T> {
    let found = message.rust_type_name();
    message
        .into_any()
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| {
            CourierError::InvalidArgument(format!(
                "expected {}, got {found}",
                std::any::type_name::<T>()
            ))
        })
}

/// Borrow the concrete value of an erased message.
pub fn downcast_ref<T: 'static>(message: &dyn ErasedMessage) -> CourierResult<&T> {
    message.as_any().downcast_ref::<T>().ok_or_else(|| {
        CourierError::InvalidArgument(format!(
            "expected {}, got {}",
            std::any::type_name::<T>(),
            message.rust_type_name()
        ))
    })
}

type DecodeBytes = fn(&[u8]) -> CourierResult<DynMessage>;
type DecodeValue = fn(serde_json::Value) -> CourierResult<DynMessage>;

fn decode_bytes<T: Message>(bytes: &[u8]) -> CourierResult<DynMessage> {
    let value: T = serde_json::from_slice(bytes)?;
    Ok(Box::new(value))
}

fn decode_value<T>(value: serde_json::Value) -> CourierResult<DynMessage>
where
    T: serde::de::DeserializeOwned + Serialize + Clone + Send + Sync + 'static,
{
    let value: T = serde_json::from_value(value)?;
    Ok(Box::new(value))
}

fn no_response(_: serde_json::Value) -> CourierResult<DynMessage> {
    Err(CourierError::Internal(
        "notifications do not carry a response".to_string(),
    ))
}

/// Static description of one message type.
pub struct MessageInfo {
    descriptor: TypeDescriptor,
    full_name: String,
    type_id: TypeId,
    rust_type: &'static str,
    kind: MessageKind,
    decode_message: DecodeBytes,
    decode_response: DecodeValue,
}

impl MessageInfo {
    pub fn request<R: Request>() -> Self {
        let descriptor = R::descriptor();
        Self {
            full_name: descriptor.full_name(),
            descriptor,
            type_id: TypeId::of::<R>(),
            rust_type: std::any::type_name::<R>(),
            kind: MessageKind::Request,
            decode_message: decode_bytes::<R>,
            decode_response: decode_value::<R::Response>,
        }
    }

    pub fn notification<N: Notification>() -> Self {
        let descriptor = N::descriptor();
        Self {
            full_name: descriptor.full_name(),
            descriptor,
            type_id: TypeId::of::<N>(),
            rust_type: std::any::type_name::<N>(),
            kind: MessageKind::Notification,
            decode_message: decode_bytes::<N>,
            decode_response: no_response,
        }
    }

    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    /// Key of every per-type configuration map.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn rust_type(&self) -> &'static str {
        self.rust_type
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn is_notification(&self) -> bool {
        self.kind == MessageKind::Notification
    }

    /// Decode a message of this type from its JSON bytes.
    pub fn decode(&self, bytes: &[u8]) -> CourierResult<DynMessage> {
        (self.decode_message)(bytes)
    }

    /// Decode this request's response from envelope content.
    pub fn decode_response(&self, content: serde_json::Value) -> CourierResult<DynMessage> {
        (self.decode_response)(content)
    }
}

impl fmt::Debug for MessageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageInfo")
            .field("full_name", &self.full_name)
            .field("rust_type", &self.rust_type)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Add {
        a: i32,
        b: i32,
    }

    impl Message for Add {
        const NAMESPACE: &'static str = "Math";
        const NAME: &'static str = "Add";
    }

    impl Request for Add {
        type Response = i32;
    }

    #[test]
    fn test_decode_via_info() {
        let info = MessageInfo::request::<Add>();
        assert_eq!(info.full_name(), "Math.Add");
        let decoded = info.decode(br#"{"a":1,"b":2}"#).unwrap();
        assert_eq!(downcast::<Add>(decoded).unwrap(), Add { a: 1, b: 2 });

        let response = info.decode_response(serde_json::json!(3)).unwrap();
        assert_eq!(downcast::<i32>(response).unwrap(), 3);
    }

    #[test]
    fn test_downcast_mismatch_is_invalid_argument() {
        let erased: DynMessage = Box::new(Add { a: 1, b: 1 });
        let err = downcast::<String>(erased).unwrap_err();
        assert!(matches!(err, CourierError::InvalidArgument(_)));
    }

    #[test]
    fn test_clone_boxed_preserves_value() {
        let erased: DynMessage = Box::new(Add { a: 4, b: 5 });
        let copy = erased.clone_boxed();
        assert_eq!(downcast_ref::<Add>(&*copy).unwrap(), &Add { a: 4, b: 5 });
        assert_eq!(erased.to_json().unwrap(), serde_json::json!({"a": 4, "b": 5}));
    }
}

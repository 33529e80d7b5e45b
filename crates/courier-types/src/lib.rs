//! Core types for the Courier request/notification dispatch fabric.
//!
//! This crate defines the shared data structures used by the kernel (dispatch
//! engine, router) and by the transports: message traits and type descriptors,
//! canonical wire naming, router options, the response envelope, configuration
//! and the error taxonomy. It contains no business logic.

pub mod config;
pub mod envelope;
pub mod error;
pub mod message;
pub mod naming;
pub mod options;

pub use envelope::{RemoteException, ResponseEnvelope, ResponseStatus};
pub use error::{CourierError, CourierResult};
pub use message::{
    Message, MessageKind, NonBlockingRequest, Notification, Request, StreamRequest, TypeDescriptor,
};
pub use options::{BehaviourMode, NameOverride, RouterOptions};

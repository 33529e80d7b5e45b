//! Log transport over a Kafka-style broker.
//!
//! Each type has a topic named by its canonical name. Requests carry a
//! correlation id and the caller's private reply topic; replies come back as
//! [`LogReply`] records.

pub mod broker;
pub mod dispatcher;
pub mod envelope;
pub mod listener;
pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use broker::{LogBroker, LogRecord};
pub use dispatcher::LogDispatcher;
pub use envelope::{LogReply, LogRequest};
pub use listener::LogListener;
pub use memory::MemoryLogBroker;

#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;

//! Queue transport over an AMQP-style broker.
//!
//! Every message is published to one topic exchange with its canonical name as
//! routing key. Each served type has its own queue bound with that key;
//! requests carry a correlation id and the caller's private reply queue.

pub mod broker;
pub mod dispatcher;
pub mod listener;
pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use broker::{Delivery, MessageProperties, PublishOutcome, QueueChannel, QueueConnector, QueueOptions};
pub use dispatcher::QueueDispatcher;
pub use listener::QueueListener;
pub use memory::MemoryQueueBroker;

#[cfg(feature = "amqp")]
pub use amqp::LapinConnector;

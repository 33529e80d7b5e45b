//! Courier transports.
//!
//! Each transport has an outbound dispatcher implementing
//! [`MessageDispatcher`](courier_kernel::MessageDispatcher) and an inbound
//! listener feeding the [`Mediator`](courier_kernel::Mediator):
//!
//! - [`queue`]: AMQP-style topic exchange with per-type queues and a private
//!   reply queue per process.
//! - [`log`]: Kafka-style topics with consumer groups and a private reply topic.
//! - [`rpc`]: length-prefixed JSON frames over TCP, one unary call per message.
//!
//! Broker clients sit behind traits. In-memory brokers are always available;
//! real drivers are enabled with the `amqp` and `kafka` features.

pub mod inbound;
pub mod log;
pub mod queue;
pub mod rpc;

pub use inbound::LocalRoute;

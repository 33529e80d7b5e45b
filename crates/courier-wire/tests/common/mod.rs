//! Shared fixtures for the transport integration tests: message types, a
//! serving mediator with counting handlers and a client mediator that routes
//! everything through one dispatcher.

#![allow(dead_code)]

use courier_kernel::{notification_fn, request_fn, HandlerRegistry, Mediator, MessageDispatcher, Router};
use courier_types::{BehaviourMode, CourierError, Message, NonBlockingRequest, Notification, Request, RouterOptions};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const PREFIX: &str = "svc";

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingRequest {
    pub seq: u32,
}

impl Message for PingRequest {
    const NAMESPACE: &'static str = "Diag";
    const NAME: &'static str = "PingRequest";
}

impl Request for PingRequest {
    type Response = Pong;
}

impl NonBlockingRequest for PingRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub seq: u32,
}

/// Always fails with "boom".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Explode {}

impl Message for Explode {
    const NAMESPACE: &'static str = "Diag";
    const NAME: &'static str = "Explode";
}

impl Request for Explode {
    type Response = ();
}

/// Replies with `id` after `delay_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowEcho {
    pub id: u32,
    pub delay_ms: u64,
}

impl Message for SlowEcho {
    const NAMESPACE: &'static str = "Diag";
    const NAME: &'static str = "SlowEcho";
}

impl Request for SlowEcho {
    type Response = u32;
}

/// Served by nobody.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unserved {}

impl Message for Unserved {
    const NAMESPACE: &'static str = "Diag";
    const NAME: &'static str = "Unserved";
}

impl Request for Unserved {
    type Response = ();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: u64,
}

impl Message for OrderCreated {
    const NAMESPACE: &'static str = "Shop";
    const NAME: &'static str = "OrderCreated";
}

impl Notification for OrderCreated {}

// ---------------------------------------------------------------------------
// Mediators
// ---------------------------------------------------------------------------

/// A serving process and the counters of its handlers.
pub struct Server {
    pub mediator: Arc<Mediator>,
    pub pings: Arc<AtomicUsize>,
    pub orders: Arc<AtomicUsize>,
}

impl Server {
    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn orders(&self) -> usize {
        self.orders.load(Ordering::SeqCst)
    }
}

/// Serves every fixture type except [`Unserved`].
pub fn server_options() -> RouterOptions {
    let mut options = RouterOptions::new(BehaviourMode::ImplicitLocal, PREFIX);
    options
        .set_as_local::<PingRequest>()
        .set_as_local::<Explode>()
        .set_as_local::<SlowEcho>()
        .listen_for::<OrderCreated>();
    options
}

pub fn server(options: RouterOptions, dispatchers: Vec<Arc<dyn MessageDispatcher>>) -> Server {
    let pings = Arc::new(AtomicUsize::new(0));
    let orders = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();

    let counter = Arc::clone(&pings);
    registry
        .register_request::<PingRequest, _>(request_fn(move |req: PingRequest| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Pong { seq: req.seq })
            }
        }))
        .unwrap();
    registry
        .register_request::<Explode, _>(request_fn(|_: Explode| async {
            Err::<(), _>(CourierError::handler("boom"))
        }))
        .unwrap();
    registry
        .register_request::<SlowEcho, _>(request_fn(|req: SlowEcho| async move {
            tokio::time::sleep(Duration::from_millis(req.delay_ms)).await;
            Ok(req.id)
        }))
        .unwrap();

    let counter = Arc::clone(&orders);
    registry
        .register_notification::<OrderCreated, _>(notification_fn(move |_: OrderCreated| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
        .unwrap();

    let mut router = Router::new(options);
    for dispatcher in dispatchers {
        router = router.with_dispatcher(dispatcher);
    }
    Server {
        mediator: Arc::new(Mediator::builder(registry).router(Arc::new(router)).build()),
        pings,
        orders,
    }
}

/// A process without handlers that sends everything through `dispatcher`.
pub fn client(dispatcher: Arc<dyn MessageDispatcher>) -> Mediator {
    let router = Router::new(RouterOptions::new(BehaviourMode::ImplicitRemote, PREFIX)).with_dispatcher(dispatcher);
    Mediator::builder(HandlerRegistry::new())
        .router(Arc::new(router))
        .build()
}

/// Poll `condition` for up to two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

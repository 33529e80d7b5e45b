//! Inbound plumbing shared by every listener: resolving served types and
//! handing decoded messages to the mediator.

use courier_kernel::{CallContext, DedupCache, Mediator, MessageInfo};
use courier_types::envelope::ResponseEnvelope;
use courier_types::error::{CourierError, CourierResult};
use courier_types::options::RouterOptions;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// One type served by a listener.
#[derive(Debug, Clone)]
pub struct LocalRoute {
    pub info: Arc<MessageInfo>,
    /// Canonical wire name: topic, RPC type name, default queue name.
    pub canonical_name: String,
    /// Physical queue names (queue transport only).
    pub queue_names: Vec<String>,
}

/// Router options of the mediator's router.
pub fn router_options(mediator: &Mediator) -> CourierResult<Arc<RouterOptions>> {
    mediator
        .router()
        .map(|router| router.options().clone())
        .ok_or_else(|| CourierError::Config("listeners require a mediator built with a router".to_string()))
}

/// Resolve `names` (full type names) against the mediator's registry. A name
/// that was never registered or declared is a fatal configuration error.
pub fn resolve_routes<'a>(
    mediator: &Mediator,
    options: &RouterOptions,
    names: impl IntoIterator<Item = &'a String>,
) -> CourierResult<Vec<LocalRoute>> {
    names
        .into_iter()
        .map(|name| {
            let info = mediator.registry().info_by_full_name(name).ok_or_else(|| {
                CourierError::Config(format!(
                    "type {name} is served locally but was never registered"
                ))
            })?;
            Ok(LocalRoute {
                canonical_name: options.canonical_name(info.descriptor()),
                queue_names: options.queue_names(info.descriptor()),
                info,
            })
        })
        .collect()
}

/// Local types of the router, or `accept` when non-empty.
pub fn served_types(options: &RouterOptions, accept: &BTreeSet<String>) -> BTreeSet<String> {
    if accept.is_empty() {
        options.local_types.clone()
    } else {
        accept.clone()
    }
}

/// Decode and run an inbound request. Every outcome becomes an envelope.
pub async fn serve_request(mediator: &Mediator, info: &Arc<MessageInfo>, body: &[u8]) -> ResponseEnvelope {
    let request = match info.decode(body) {
        Ok(request) => request,
        Err(e) => {
            warn!(type_name = %info.full_name(), error = %e, "Undecodable inbound request");
            return ResponseEnvelope::from_error(&e);
        }
    };

    let result = mediator
        .send_dyn(info, request, CallContext::inbound())
        .await
        .and_then(|response| response.to_json());

    match result {
        Ok(content) => ResponseEnvelope::ok(content),
        Err(e) => {
            error!(type_name = %info.full_name(), error = %e, "Inbound request failed");
            ResponseEnvelope::from_error(&e)
        }
    }
}

/// Decode and publish an inbound notification to local handlers only.
/// Returns `false` when the payload was dropped as a duplicate.
pub async fn serve_notification(
    mediator: &Mediator,
    info: &Arc<MessageInfo>,
    body: &[u8],
    dedup: Option<&DedupCache>,
) -> CourierResult<bool> {
    if let Some(cache) = dedup {
        if cache.check_and_remember(body) {
            debug!(type_name = %info.full_name(), "Dropping duplicate notification");
            return Ok(false);
        }
    }
    let notification = info.decode(body)?;
    mediator
        .publish_dyn(info, notification, CallContext::inbound())
        .await?;
    Ok(true)
}

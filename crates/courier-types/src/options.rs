//! Router options: placement mode, local/remote type sets and naming overrides.
//!
//! All per-type maps are keyed by [`TypeDescriptor::full_name`], so the same
//! options can be written by hand in TOML or built in code with the typed
//! helpers. Options are frozen behind an `Arc` once the router is built.

use crate::message::{Message, TypeDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// How the router classifies types that are in neither set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviourMode {
    /// Everything is local unless declared remote.
    #[default]
    ImplicitLocal,
    /// Everything is remote unless declared local.
    ImplicitRemote,
    /// A type must be declared local or remote; anything else is not found.
    Explicit,
}

/// Explicit wire name for one message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameOverride {
    /// Replacement name.
    pub name: String,
    /// When true the name is used verbatim; otherwise it replaces only the
    /// simple type name and is still qualified by the namespace.
    #[serde(default)]
    pub absolute: bool,
}

/// Router configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterOptions {
    /// Placement mode.
    pub behaviour: BehaviourMode,
    /// Prefix applied to every canonical name without a per-type prefix.
    pub default_prefix: String,
    /// Types served by this process.
    pub local_types: BTreeSet<String>,
    /// Types served by remote processes.
    pub remote_types: BTreeSet<String>,
    /// Per-type prefix overriding `default_prefix`.
    pub type_prefixes: BTreeMap<String, String>,
    /// Per-type name overrides.
    pub name_overrides: BTreeMap<String, NameOverride>,
    /// Explicit physical queue names; one type may map to several queues.
    pub queue_names: BTreeMap<String, BTreeSet<String>>,
    /// Per-type consumer timeout in milliseconds (queue argument `x-consumer-timeout`).
    pub consumer_timeouts: BTreeMap<String, u64>,
}

impl RouterOptions {
    /// Options with the given placement mode and default prefix.
    pub fn new(behaviour: BehaviourMode, default_prefix: impl Into<String>) -> Self {
        Self {
            behaviour,
            default_prefix: default_prefix.into(),
            ..Default::default()
        }
    }

    /// Serve `T` in this process.
    pub fn set_as_local<T: Message>(&mut self) -> &mut Self {
        self.local_types.insert(T::descriptor().full_name());
        self
    }

    /// Serve `T` in this process under a specific prefix.
    pub fn set_as_local_with_prefix<T: Message>(&mut self, prefix: impl Into<String>) -> &mut Self {
        let key = T::descriptor().full_name();
        self.type_prefixes.insert(key.clone(), prefix.into());
        self.local_types.insert(key);
        self
    }

    /// Serve `T` on a remote process.
    pub fn set_as_remote<T: Message>(&mut self) -> &mut Self {
        self.remote_types.insert(T::descriptor().full_name());
        self
    }

    /// Send `T` to a remote process under a specific prefix.
    pub fn set_as_remote_with_prefix<T: Message>(&mut self, prefix: impl Into<String>) -> &mut Self {
        let key = T::descriptor().full_name();
        self.type_prefixes.insert(key.clone(), prefix.into());
        self.remote_types.insert(key);
        self
    }

    /// Subscribe this process to notification `N`.
    pub fn listen_for<N: Message>(&mut self) -> &mut Self {
        self.set_as_local::<N>()
    }

    /// Subscribe this process to notification `N` under a specific prefix.
    pub fn listen_for_with_prefix<N: Message>(&mut self, prefix: impl Into<String>) -> &mut Self {
        self.set_as_local_with_prefix::<N>(prefix)
    }

    /// Add a physical queue name for `T`.
    pub fn set_queue_name<T: Message>(&mut self, queue: impl Into<String>) -> &mut Self {
        self.queue_names
            .entry(T::descriptor().full_name())
            .or_default()
            .insert(queue.into());
        self
    }

    /// Override the canonical name of `T`.
    pub fn set_name_override<T: Message>(&mut self, name: impl Into<String>, absolute: bool) -> &mut Self {
        self.name_overrides.insert(
            T::descriptor().full_name(),
            NameOverride {
                name: name.into(),
                absolute,
            },
        );
        self
    }

    /// Set the consumer timeout (ms) applied to the queues of `T`.
    pub fn set_consumer_timeout<T: Message>(&mut self, timeout_ms: u64) -> &mut Self {
        self.consumer_timeouts
            .insert(T::descriptor().full_name(), timeout_ms);
        self
    }

    /// Whether `descriptor` is in the local set.
    pub fn is_local(&self, descriptor: &TypeDescriptor) -> bool {
        self.local_types.contains(&descriptor.full_name())
    }

    /// Whether `descriptor` is in the remote set.
    pub fn is_remote(&self, descriptor: &TypeDescriptor) -> bool {
        self.remote_types.contains(&descriptor.full_name())
    }

    /// Whether `descriptor` has explicit physical queue names.
    pub fn has_explicit_queue_names(&self, descriptor: &TypeDescriptor) -> bool {
        self.queue_names
            .get(&descriptor.full_name())
            .is_some_and(|names| !names.is_empty())
    }

    /// Consumer timeout configured for `descriptor`.
    pub fn consumer_timeout(&self, descriptor: &TypeDescriptor) -> Option<u64> {
        self.consumer_timeouts.get(&descriptor.full_name()).copied()
    }
}

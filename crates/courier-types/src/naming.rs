//! Canonical wire names.
//!
//! The canonical name is the deterministic string a type is known by on every
//! transport: queue routing key, log topic and RPC type name. Both ends compute
//! it from the same [`RouterOptions`], so they agree without exchanging metadata.

use crate::message::TypeDescriptor;
use crate::options::RouterOptions;

/// Separator between a physical queue name and an instance-specific suffix.
/// Everything after it is ignored when binding the queue.
pub const QUEUE_SUFFIX_SEPARATOR: char = '$';

impl RouterOptions {
    /// Canonical wire name of `descriptor`.
    ///
    /// `svc` prefix, `Foo.Bar` ⇒ `svc.Foo_Bar`;
    /// `Foo.Box<Foo.Item>` ⇒ `svc.Foo_Box[svc.Foo_Item]`.
    pub fn canonical_name(&self, descriptor: &TypeDescriptor) -> String {
        let mut out = String::new();
        self.write_canonical_name(descriptor, &mut out);
        out
    }

    fn write_canonical_name(&self, descriptor: &TypeDescriptor, out: &mut String) {
        let key = descriptor.full_name();

        if let Some(name_override) = self.name_overrides.get(&key) {
            if name_override.absolute {
                out.push_str(&name_override.name);
            } else {
                let relative = if descriptor.namespace.is_empty() {
                    name_override.name.clone()
                } else {
                    format!("{}.{}", descriptor.namespace, name_override.name)
                };
                out.push_str(&relative.replace('.', "_"));
            }
            return;
        }

        let prefix = self
            .type_prefixes
            .get(&key)
            .map(String::as_str)
            .unwrap_or(&self.default_prefix);
        if !prefix.trim().is_empty() {
            out.push_str(prefix);
            out.push('.');
        }
        out.push_str(&descriptor.qualified_name().replace('.', "_"));

        if !descriptor.generic_args.is_empty() {
            out.push('[');
            for (i, arg) in descriptor.generic_args.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                self.write_canonical_name(arg, out);
            }
            out.push(']');
        }
    }

    /// Physical queue names for `descriptor`: the explicit names when configured,
    /// otherwise the canonical name alone.
    pub fn queue_names(&self, descriptor: &TypeDescriptor) -> Vec<String> {
        match self.queue_names.get(&descriptor.full_name()) {
            Some(names) if !names.is_empty() => names.iter().cloned().collect(),
            _ => vec![self.canonical_name(descriptor)],
        }
    }
}

/// Routing key a queue is bound with: the queue name up to the first `$`.
pub fn binding_key(queue_name: &str) -> &str {
    queue_name
        .split(QUEUE_SUFFIX_SEPARATOR)
        .next()
        .unwrap_or(queue_name)
}

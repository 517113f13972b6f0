use std::any::Any;
use std::collections::HashMap;

/// Closed set of keys a step chain can stash typed values under. Kept as
/// a concrete enum rather than stringly-typed entries, matching the
/// corpus's preference for concrete structs over `serde_json::Value`
/// wherever the shape of a value is known ahead of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKey {
    Deleting,
    ExplicitRecheck,
    Interrupt,
    IntrospectorConfigMapName,
    IntrospectVersion,
    ServerStartupInfo,
    ValidationFailure,
    /// Set by the make-right decision when a Model-in-Image online
    /// update is in flight but the spec delta carries more than
    /// `introspectVersion` + `onlineUpdate`; forces the plan to treat
    /// this run as a regular (non-online) update.
    ForceOnlineUpdateDisabled,
    /// Human-readable failure text, set by a step that fails the
    /// introspection or validation stage, read back by the retry
    /// controller when it patches `status.message`.
    FailureMessage,
}

/// The mutable context threaded through every step of one Fiber.
///
/// A Packet is created once per Fiber and never shared between
/// concurrently-running Fibers; the FiberGate's single-flight guarantee
/// is what makes that safe.
pub struct Packet {
    pub namespace: String,
    pub domain_uid: String,
    values: HashMap<PacketKey, Box<dyn Any + Send>>,
}

impl Packet {
    pub fn new(namespace: impl Into<String>, domain_uid: impl Into<String>) -> Self {
        Packet {
            namespace: namespace.into(),
            domain_uid: domain_uid.into(),
            values: HashMap::new(),
        }
    }

    pub fn put<T: Send + 'static>(&mut self, key: PacketKey, value: T) {
        self.values.insert(key, Box::new(value));
    }

    pub fn get<T: Send + 'static>(&self, key: PacketKey) -> Option<&T> {
        self.values.get(&key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn remove<T: Send + 'static>(&mut self, key: PacketKey) -> Option<T> {
        self.values
            .remove(&key)
            .and_then(|v| v.downcast::<T>().ok())
            .map(|b| *b)
    }

    pub fn contains(&self, key: PacketKey) -> bool {
        self.values.contains_key(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_get_round_trips_a_typed_value() {
        let mut packet = Packet::new("ns", "domain1");
        packet.put(PacketKey::Deleting, true);
        assert_eq!(packet.get::<bool>(PacketKey::Deleting), Some(&true));
        assert!(packet.get::<bool>(PacketKey::Interrupt).is_none());
    }

    #[test]
    fn remove_takes_ownership_and_clears_the_slot() {
        let mut packet = Packet::new("ns", "domain1");
        packet.put(PacketKey::IntrospectVersion, "v2".to_string());
        let taken = packet.remove::<String>(PacketKey::IntrospectVersion);
        assert_eq!(taken.as_deref(), Some("v2"));
        assert!(!packet.contains(PacketKey::IntrospectVersion));
    }
}

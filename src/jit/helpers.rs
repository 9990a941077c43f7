//! Runtime helper registry: stable, non-inlined entry points that native
//! code calls indirectly for anything outside the pure-integer fast path
//! (mixed-type arithmetic, string concatenation, container access).
//! Entries are keyed by a stable numeric id assigned at registration, the
//! same scheme `Function` identity uses, per the resolved open question
//! that this table is never looked up by name.

use dashmap::DashMap;

use crate::class::next_function_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperKind {
    ArithMixed,
    StringConcat,
    ArrayGet,
    ArraySet,
    MapGet,
    MapSet,
}

/// A registered helper: its stable id and the address native code would
/// indirect-call through. The address is opaque to the registry; callers
/// supply real function pointers cast to `usize` at registration time.
struct HelperEntry {
    kind: HelperKind,
    address: usize,
}

pub struct HelperRegistry {
    entries: DashMap<u64, HelperEntry>,
    by_kind: DashMap<HelperKind, u64>,
}

impl HelperRegistry {
    pub fn new() -> Self {
        HelperRegistry { entries: DashMap::new(), by_kind: DashMap::new() }
    }

    /// Registers `address` under a freshly assigned id, reusing an
    /// existing id if this `kind` was already registered.
    pub fn register(&self, kind: HelperKind, address: usize) -> u64 {
        if let Some(existing) = self.by_kind.get(&kind) {
            return *existing;
        }
        let id = next_function_id();
        self.entries.insert(id, HelperEntry { kind, address });
        self.by_kind.insert(kind, id);
        id
    }

    pub fn address(&self, id: u64) -> Option<usize> {
        self.entries.get(&id).map(|e| e.address)
    }

    pub fn id_for(&self, kind: HelperKind) -> Option<u64> {
        self.by_kind.get(&kind).map(|id| *id)
    }
}

impl Default for HelperRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registering_same_kind_twice_returns_same_id() {
        let reg = HelperRegistry::new();
        let a = reg.register(HelperKind::StringConcat, 0x1000);
        let b = reg.register(HelperKind::StringConcat, 0x2000);
        assert_eq!(a, b);
        assert_eq!(reg.address(a), Some(0x1000));
    }

    #[test]
    fn distinct_kinds_get_distinct_ids() {
        let reg = HelperRegistry::new();
        let a = reg.register(HelperKind::ArithMixed, 0x10);
        let b = reg.register(HelperKind::ArrayGet, 0x20);
        assert_ne!(a, b);
    }
}

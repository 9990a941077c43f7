//! Per-call-site and per-access-site inline caches.
//!
//! Three cache kinds, all following the same state machine:
//! `Uninit -> Monomorphic -> Polymorphic(<=4 entries) -> Megamorphic`.
//! A site never regresses out of Megamorphic short of an explicit reset
//! (`invalidate_class`), which happens when a class is redefined.

use std::collections::HashMap;
use std::sync::Arc;

use crate::class::Method;

pub const MAX_POLYMORPHIC_ENTRIES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcState {
    Uninit,
    Monomorphic,
    Polymorphic,
    Megamorphic,
}

#[derive(Debug, Clone, Default)]
pub struct IcStats {
    pub hits: u64,
    pub misses: u64,
}

impl IcStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// One call site's cache: `receiver class identity -> resolved Method`.
struct MethodCallSite {
    state: IcState,
    entries: Vec<(u64, Arc<Method>)>,
    stats: IcStats,
    last_access: u64,
}

impl MethodCallSite {
    fn new() -> Self {
        MethodCallSite {
            state: IcState::Uninit,
            entries: Vec::new(),
            stats: IcStats::default(),
            last_access: 0,
        }
    }

    fn lookup(&mut self, class_id: u64, clock: u64) -> Option<Arc<Method>> {
        self.last_access = clock;
        match self.state {
            IcState::Megamorphic => {
                self.stats.misses += 1;
                None
            }
            _ => {
                if let Some((_, method)) = self.entries.iter().find(|(id, _)| *id == class_id) {
                    self.stats.hits += 1;
                    Some(method.clone())
                } else {
                    self.stats.misses += 1;
                    None
                }
            }
        }
    }

    fn update(&mut self, class_id: u64, method: Arc<Method>) {
        if self.entries.iter().any(|(id, _)| *id == class_id) {
            return;
        }
        match self.state {
            IcState::Uninit => {
                self.entries.push((class_id, method));
                self.state = IcState::Monomorphic;
            }
            IcState::Monomorphic => {
                self.entries.push((class_id, method));
                self.state = IcState::Polymorphic;
            }
            IcState::Polymorphic => {
                if self.entries.len() < MAX_POLYMORPHIC_ENTRIES {
                    self.entries.push((class_id, method));
                } else {
                    self.entries.clear();
                    self.state = IcState::Megamorphic;
                }
            }
            IcState::Megamorphic => {}
        }
    }
}

/// One property access site's cache: a single `(class identity, field name)`
/// pair. Any differing class observed at the same site elevates it straight
/// to Megamorphic, disabling the fast path entirely (no polymorphic tier for
/// property access, per spec).
struct PropertySite {
    state: IcState,
    cached: Option<(u64, Arc<str>)>,
    stats: IcStats,
    last_access: u64,
}

impl PropertySite {
    fn new() -> Self {
        PropertySite {
            state: IcState::Uninit,
            cached: None,
            stats: IcStats::default(),
            last_access: 0,
        }
    }

    fn check(&mut self, class_id: u64, field: &str, clock: u64) -> bool {
        self.last_access = clock;
        match &self.cached {
            Some((id, name)) if *id == class_id && name.as_ref() == field => {
                self.stats.hits += 1;
                true
            }
            _ => {
                self.stats.misses += 1;
                false
            }
        }
    }

    fn update(&mut self, class_id: u64, field: Arc<str>) {
        match &self.cached {
            Some((id, name)) if *id == class_id && name.as_ref() == field.as_ref() => {}
            Some(_) => {
                self.state = IcState::Megamorphic;
                self.cached = None;
            }
            None => {
                self.cached = Some((class_id, field));
                self.state = IcState::Monomorphic;
            }
        }
    }
}

type CallSiteKey = (u64, usize);

/// Owns every call-site and property-site cache in the program, keyed by
/// `(function identity, instruction offset)`. Both tables are bounded; an
/// insert past capacity evicts the least-recently-accessed 25% first.
pub struct InlineCacheManager {
    call_sites: HashMap<CallSiteKey, MethodCallSite>,
    property_sites: HashMap<CallSiteKey, PropertySite>,
    max_call_sites: usize,
    max_property_sites: usize,
    clock: u64,
}

impl InlineCacheManager {
    pub fn new(max_call_sites: usize, max_property_sites: usize) -> Self {
        InlineCacheManager {
            call_sites: HashMap::new(),
            property_sites: HashMap::new(),
            max_call_sites,
            max_property_sites,
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn lookup_method(&mut self, site: CallSiteKey, class_id: u64) -> Option<Arc<Method>> {
        let clock = self.tick();
        self.call_sites.get_mut(&site)?.lookup(class_id, clock)
    }

    pub fn update_method(&mut self, site: CallSiteKey, class_id: u64, method: Arc<Method>) {
        if !self.call_sites.contains_key(&site) && self.call_sites.len() >= self.max_call_sites {
            evict_lru(&mut self.call_sites, self.max_call_sites);
        }
        let clock = self.tick();
        let entry = self.call_sites.entry(site).or_insert_with(MethodCallSite::new);
        entry.last_access = clock;
        entry.update(class_id, method);
    }

    pub fn check_property(&mut self, site: CallSiteKey, class_id: u64, field: &str) -> bool {
        let clock = self.tick();
        match self.property_sites.get_mut(&site) {
            Some(cache) => cache.check(class_id, field, clock),
            None => false,
        }
    }

    pub fn update_property(&mut self, site: CallSiteKey, class_id: u64, field: Arc<str>) {
        if !self.property_sites.contains_key(&site) && self.property_sites.len() >= self.max_property_sites {
            evict_lru(&mut self.property_sites, self.max_property_sites);
        }
        let clock = self.tick();
        let entry = self.property_sites.entry(site).or_insert_with(PropertySite::new);
        entry.last_access = clock;
        entry.update(class_id, field);
    }

    /// Called when a class is redefined: drops every cache entry naming it,
    /// since cached methods/fields may no longer resolve the same way.
    /// Redefinition itself is disallowed after a class table freeze, so this
    /// only fires in single-threaded, pre-freeze programs.
    pub fn invalidate_class(&mut self, class_id: u64) {
        for cache in self.call_sites.values_mut() {
            cache.entries.retain(|(id, _)| *id != class_id);
            if cache.entries.is_empty() && cache.state != IcState::Megamorphic {
                cache.state = IcState::Uninit;
            }
        }
        for cache in self.property_sites.values_mut() {
            if matches!(&cache.cached, Some((id, _)) if *id == class_id) {
                cache.cached = None;
                cache.state = IcState::Uninit;
            }
        }
    }

    pub fn method_site_state(&self, site: CallSiteKey) -> Option<IcState> {
        self.call_sites.get(&site).map(|c| c.state)
    }

    pub fn property_site_state(&self, site: CallSiteKey) -> Option<IcState> {
        self.property_sites.get(&site).map(|c| c.state)
    }

    pub fn aggregate_stats(&self) -> IcStats {
        let mut total = IcStats::default();
        for cache in self.call_sites.values() {
            total.hits += cache.stats.hits;
            total.misses += cache.stats.misses;
        }
        for cache in self.property_sites.values() {
            total.hits += cache.stats.hits;
            total.misses += cache.stats.misses;
        }
        total
    }
}

trait Aged {
    fn last_access(&self) -> u64;
}

impl Aged for MethodCallSite {
    fn last_access(&self) -> u64 {
        self.last_access
    }
}

impl Aged for PropertySite {
    fn last_access(&self) -> u64 {
        self.last_access
    }
}

/// Evicts the least-recently-accessed 25% of `table`'s entries.
fn evict_lru<V: Aged>(table: &mut HashMap<CallSiteKey, V>, capacity: usize) {
    let evict_count = (capacity / 4).max(1);
    let mut keys: Vec<CallSiteKey> = table.keys().copied().collect();
    keys.sort_by_key(|k| table[k].last_access());
    for key in keys.into_iter().take(evict_count) {
        table.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::Visibility;

    fn method(name: &str) -> Arc<Method> {
        Arc::new(Method::new(name.to_string(), "C".to_string(), 0, 0, vec![], None, 0, Visibility::Public))
    }

    #[test]
    fn call_site_goes_monomorphic_then_polymorphic_then_megamorphic() {
        let mut mgr = InlineCacheManager::new(64, 64);
        let site = (1, 10);

        mgr.update_method(site, 100, method("m"));
        assert_eq!(mgr.method_site_state(site), Some(IcState::Monomorphic));

        mgr.update_method(site, 200, method("m"));
        assert_eq!(mgr.method_site_state(site), Some(IcState::Polymorphic));

        mgr.update_method(site, 300, method("m"));
        mgr.update_method(site, 400, method("m"));
        assert_eq!(mgr.method_site_state(site), Some(IcState::Polymorphic));

        mgr.update_method(site, 500, method("m"));
        assert_eq!(mgr.method_site_state(site), Some(IcState::Megamorphic));
    }

    #[test]
    fn monomorphic_hit_increments_stats() {
        let mut mgr = InlineCacheManager::new(64, 64);
        let site = (1, 10);
        mgr.update_method(site, 100, method("m"));
        assert!(mgr.lookup_method(site, 100).is_some());
        assert!(mgr.lookup_method(site, 999).is_none());
        let stats = mgr.aggregate_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn property_site_elevates_to_megamorphic_on_second_class() {
        let mut mgr = InlineCacheManager::new(64, 64);
        let site = (1, 20);
        mgr.update_property(site, 100, Arc::from("x"));
        assert_eq!(mgr.property_site_state(site), Some(IcState::Monomorphic));
        mgr.update_property(site, 200, Arc::from("x"));
        assert_eq!(mgr.property_site_state(site), Some(IcState::Megamorphic));
    }

    #[test]
    fn overflow_evicts_least_recently_used_quarter() {
        let mut mgr = InlineCacheManager::new(4, 64);
        for i in 0..4u64 {
            mgr.update_method((1, i as usize), i, method("m"));
        }
        // Access site 3 to keep it warm, then force an eviction by adding a 5th.
        mgr.lookup_method((1, 3), 3);
        mgr.update_method((1, 4), 4, method("m"));
        assert_eq!(mgr.call_sites.len(), 4);
        assert!(mgr.call_sites.contains_key(&(1, 3)));
    }

    #[test]
    fn invalidate_class_clears_matching_entries_only() {
        let mut mgr = InlineCacheManager::new(64, 64);
        let site = (1, 10);
        mgr.update_method(site, 100, method("m"));
        mgr.update_method(site, 200, method("m"));
        mgr.invalidate_class(100);
        assert!(mgr.lookup_method(site, 100).is_none());
        assert!(mgr.lookup_method(site, 200).is_some());
    }
}

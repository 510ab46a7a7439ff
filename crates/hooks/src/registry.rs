//! The hook registry: a base mapping from event name to matchers, plus a
//! set of named scoped mappings merged in at dispatch time.
//!
//! `fire` (see `dispatcher.rs`) takes the read lock; registration takes the
//! write lock. Writers are rare (startup registration, scope creation for a
//! new subagent/teammate) so one read/write lock over the whole registry is
//! the same trade the teacher makes for `ApprovalStore` and `SessionLockMap`.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::matcher::Matcher;

/// Event name -> matchers, in registration order.
pub type HookMap = HashMap<String, Vec<Matcher>>;

pub struct HookRegistry {
    base: RwLock<HookMap>,
    /// Scoped registries in insertion order. A `HashMap<String, HookMap>`
    /// cannot preserve this order, which the merge invariant depends on, so
    /// this is an ordered association list behind the same lock.
    scoped: RwLock<Vec<(String, HookMap)>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            base: RwLock::new(HashMap::new()),
            scoped: RwLock::new(Vec::new()),
        }
    }

    /// Register one matcher for `event` in the base registry.
    pub fn register(&self, event: impl Into<String>, matcher: Matcher) {
        self.base
            .write()
            .entry(event.into())
            .or_default()
            .push(matcher);
    }

    /// Add a whole scoped mapping, keyed by `scope_id`. If the scope already
    /// exists its mapping is replaced in place, preserving its original
    /// position in the insertion order.
    pub fn register_scoped(&self, scope_id: impl Into<String>, map: HookMap) {
        let scope_id = scope_id.into();
        let mut scoped = self.scoped.write();
        if let Some(entry) = scoped.iter_mut().find(|(id, _)| *id == scope_id) {
            entry.1 = map;
        } else {
            scoped.push((scope_id, map));
        }
    }

    /// Remove a whole scoped mapping. Safe to call during a concurrent
    /// `fire`: the read lock it holds prevents this write from observing a
    /// torn state, not the other way around, but readers never see a
    /// half-removed scope either way since the removal is one write.
    pub fn unregister_scoped(&self, scope_id: &str) {
        self.scoped.write().retain(|(id, _)| id != scope_id);
    }

    /// Merge the base matchers for `event` with every scope's matchers for
    /// the same event, in insertion order: base first, then each scope in
    /// the order it was registered.
    pub fn merged_matchers(&self, event: &str) -> Vec<Matcher> {
        let mut out = Vec::new();
        if let Some(base_matchers) = self.base.read().get(event) {
            out.extend(base_matchers.iter().cloned());
        }
        for (_, map) in self.scoped.read().iter() {
            if let Some(matchers) = map.get(event) {
                out.extend(matchers.iter().cloned());
            }
        }
        out
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_matchers_come_before_scoped() {
        let registry = HookRegistry::new();
        registry.register("pre_tool_use", Matcher::new("Bash"));

        let mut scoped_map = HookMap::new();
        scoped_map.insert("pre_tool_use".into(), vec![Matcher::new("Read")]);
        registry.register_scoped("subagent-1", scoped_map);

        let merged = registry.merged_matchers("pre_tool_use");
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].pattern, "Bash");
        assert_eq!(merged[1].pattern, "Read");
    }

    #[test]
    fn scopes_merge_in_insertion_order() {
        let registry = HookRegistry::new();
        for (scope, pattern) in [("a", "One"), ("b", "Two"), ("c", "Three")] {
            let mut map = HookMap::new();
            map.insert("stop".into(), vec![Matcher::new(pattern)]);
            registry.register_scoped(scope, map);
        }
        let merged = registry.merged_matchers("stop");
        let patterns: Vec<_> = merged.iter().map(|m| m.pattern.as_str()).collect();
        assert_eq!(patterns, vec!["One", "Two", "Three"]);
    }

    #[test]
    fn unregister_scoped_removes_only_that_scope() {
        let registry = HookRegistry::new();
        let mut map_a = HookMap::new();
        map_a.insert("stop".into(), vec![Matcher::new("A")]);
        registry.register_scoped("a", map_a);
        let mut map_b = HookMap::new();
        map_b.insert("stop".into(), vec![Matcher::new("B")]);
        registry.register_scoped("b", map_b);

        registry.unregister_scoped("a");

        let merged = registry.merged_matchers("stop");
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].pattern, "B");
    }

    #[test]
    fn unmatched_event_returns_empty() {
        let registry = HookRegistry::new();
        assert!(registry.merged_matchers("nope").is_empty());
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The anchor namespace.
//!
//! Anchors give policy a hierarchy without the engine modeling a
//! tree: the collection is flat and name-sorted, and nesting is
//! expressed by composite names ("ftp-proxy/203.0.113.7"). An anchor
//! exists exactly as long as it owns at least one ruleset that is in
//! use; garbage collection is lazy and runs after every commit and
//! rule removal, so the namespace needs no explicit delete operation.

use crate::ruleset::RuleSet;
use std::collections::BTreeMap;

/// The name of the implicit top-level anchor and its ruleset. It is
/// created with the store and exempt from garbage collection.
pub const MAIN_NAME: &str = "";

#[derive(Debug)]
pub struct Anchor {
    name: String,
    rulesets: BTreeMap<String, RuleSet>,
}

impl Anchor {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), rulesets: BTreeMap::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ruleset(&self, name: &str) -> Option<&RuleSet> {
        self.rulesets.get(name)
    }

    pub fn ruleset_mut(&mut self, name: &str) -> Option<&mut RuleSet> {
        self.rulesets.get_mut(name)
    }

    /// Find the named ruleset, creating it (in sorted position) on
    /// first reference.
    pub fn find_or_create_ruleset(&mut self, name: &str) -> &mut RuleSet {
        self.rulesets
            .entry(name.to_string())
            .or_insert_with(|| RuleSet::new(name))
    }

    /// Remove the named ruleset if nothing uses it anymore. A no-op
    /// for unknown names or rulesets still in use; the main ruleset
    /// is never collected.
    pub fn remove_ruleset_if_unused(&mut self, name: &str) {
        if self.name == MAIN_NAME && name == MAIN_NAME {
            return;
        }

        if let Some(rs) = self.rulesets.get(name) {
            if rs.is_unused() {
                self.rulesets.remove(name);
            }
        }
    }

    pub fn ruleset_names(&self) -> impl Iterator<Item = &str> {
        self.rulesets.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.rulesets.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rulesets_stay_sorted() {
        let mut anchor = Anchor::new("scrub");
        anchor.find_or_create_ruleset("zig");
        anchor.find_or_create_ruleset("alpha");
        anchor.find_or_create_ruleset("m");

        let names: Vec<&str> = anchor.ruleset_names().collect();
        assert_eq!(names, vec!["alpha", "m", "zig"]);
    }

    #[test]
    fn gc_is_idempotent() {
        let mut anchor = Anchor::new("ftp-proxy");
        anchor.find_or_create_ruleset("client-a");
        anchor.remove_ruleset_if_unused("client-a");
        assert!(anchor.is_empty());

        // Removing again, or removing something never created, is a
        // no-op.
        anchor.remove_ruleset_if_unused("client-a");
        anchor.remove_ruleset_if_unused("no-such");
        assert!(anchor.is_empty());
    }

    #[test]
    fn main_ruleset_exempt() {
        let mut anchor = Anchor::new(MAIN_NAME);
        anchor.find_or_create_ruleset(MAIN_NAME);
        anchor.remove_ruleset_if_unused(MAIN_NAME);
        assert!(anchor.ruleset(MAIN_NAME).is_some());
    }
}

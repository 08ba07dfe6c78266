// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Ordered rule queues.
//!
//! A queue owns the evaluation order of its rules; the rules
//! themselves live in the arena. After any mutation the queue
//! renumbers its contents so every linked rule carries a dense
//! position, which is what the dump surface and the evaluator's skip
//! data are expressed against.

use crate::rule::RuleArena;
use crate::rule::SKIP_AF;
use crate::rule::SKIP_COUNT;
use crate::rule::SKIP_DST_ADDR;
use crate::rule::SKIP_DST_PORT;
use crate::rule::SKIP_PROTO;
use crate::rule::SKIP_SRC_ADDR;
use crate::rule::SKIP_SRC_PORT;
use pfe_api::MatchSpec;
use pfe_api::RuleId;

#[derive(Debug, Default)]
pub struct RuleQueue {
    ids: Vec<RuleId>,
}

impl RuleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> &[RuleId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Append a rule and renumber.
    pub fn push(&mut self, id: RuleId, arena: &mut RuleArena) {
        self.ids.push(id);
        self.renumber(arena);
    }

    /// Insert a rule at `idx` and renumber.
    pub fn insert_at(&mut self, idx: usize, id: RuleId, arena: &mut RuleArena) {
        self.ids.insert(idx, id);
        self.renumber(arena);
    }

    /// Remove and return the rule at `idx`, renumbering the rest.
    /// The removed rule's link state is the caller's to settle.
    pub fn remove_at(&mut self, idx: usize, arena: &mut RuleArena) -> RuleId {
        let id = self.ids.remove(idx);
        self.renumber(arena);
        id
    }

    /// Empty the queue, returning the ids that were in it. The
    /// returned rules are still marked linked; the caller unlinks
    /// them.
    pub fn drain(&mut self) -> Vec<RuleId> {
        core::mem::take(&mut self.ids)
    }

    /// Rewrite every member's position so `nr` is a dense `0..N-1`
    /// over the current contents.
    pub fn renumber(&self, arena: &mut RuleArena) {
        for (nr, id) in self.ids.iter().enumerate() {
            arena.link(*id, nr as u32);
        }
    }
}

fn selector_ne(a: &MatchSpec, b: &MatchSpec, field: usize) -> bool {
    match field {
        SKIP_AF => a.af != b.af,
        SKIP_PROTO => a.proto != b.proto,
        SKIP_SRC_ADDR => a.src_addr != b.src_addr,
        SKIP_SRC_PORT => a.src_ports != b.src_ports,
        SKIP_DST_ADDR => a.dst_addr != b.dst_addr,
        SKIP_DST_PORT => a.dst_ports != b.dst_ports,
        _ => unreachable!("unknown skip field"),
    }
}

/// Recompute the per-rule skip data for `queue`.
///
/// For each selector field, a rule's skip value is the position of
/// the next rule whose selector differs. The evaluator uses this to
/// leap over a run of rules it already knows cannot match, without
/// this engine ever interpreting the selectors itself: only equality
/// between neighboring rules matters here.
pub fn calc_skip_steps(arena: &mut RuleArena, queue: &RuleQueue) {
    let specs: Vec<MatchSpec> = queue
        .ids()
        .iter()
        .filter_map(|id| arena.get(*id).map(|r| r.match_spec().clone()))
        .collect();
    debug_assert_eq!(specs.len(), queue.len());

    let n = specs.len();
    let mut skip = vec![[0u32; SKIP_COUNT]; n];
    let mut head = [0usize; SKIP_COUNT];

    for i in 1..=n {
        for (field, run_start) in head.iter_mut().enumerate() {
            if i < n && !selector_ne(&specs[*run_start], &specs[i], field) {
                continue;
            }

            // The run ends at `i`: every member may skip straight to
            // it when the field fails to match.
            for row in skip.iter_mut().take(i).skip(*run_start) {
                row[field] = i as u32;
            }
            *run_start = i;
        }
    }

    for (idx, id) in queue.ids().iter().enumerate() {
        if let Some(rule) = arena.get_mut(*id) {
            rule.set_skip(skip[idx]);
        }
    }
}

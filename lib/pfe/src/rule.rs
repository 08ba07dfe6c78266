// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Rules and the arena that owns them.
//!
//! A rule's lifetime is longer than its place in a queue: a tracked
//! connection holds a reference to the rule that admitted it, and the
//! rule must stay queryable for as long as any such connection lives,
//! even after a commit has thrown its queue away. The arena makes
//! that explicit. Queues and connections hold [`RuleId`] handles; the
//! arena entry records whether the rule is still linked and how many
//! connections reference it, and reclaims the rule only when it is
//! detached with no references left.

use crate::pool::AddressPool;
use crate::tag::TagId;
use crate::tag::TagTable;
use pfe_api::Direction;
use pfe_api::MatchSpec;
use pfe_api::PfeError;
use pfe_api::RuleAction;
use pfe_api::RuleDump;
use pfe_api::RuleFlags;
use pfe_api::RuleId;
use pfe_api::RuleSpec;
use std::collections::BTreeMap;

/// The number of selector fields skip data is derived over.
pub const SKIP_COUNT: usize = 6;

pub const SKIP_AF: usize = 0;
pub const SKIP_PROTO: usize = 1;
pub const SKIP_SRC_ADDR: usize = 2;
pub const SKIP_SRC_PORT: usize = 3;
pub const SKIP_DST_ADDR: usize = 4;
pub const SKIP_DST_PORT: usize = 5;

/// A single policy entry.
#[derive(Debug)]
pub struct Rule {
    id: RuleId,
    action: RuleAction,
    match_spec: MatchSpec,
    flags: RuleFlags,
    label: Option<String>,
    pool: AddressPool,
    tag: Option<TagId>,
    match_tag: Option<TagId>,
    /// For each selector field, the queue position of the next rule
    /// whose selector differs. Derived on commit; meaningful only
    /// while the rule is linked into an active queue.
    skip: [u32; SKIP_COUNT],
    states_total: u64,
    packets: [u64; 2],
    bytes: [u64; 2],
}

impl Rule {
    pub fn from_parts(
        spec: RuleSpec,
        tag: Option<TagId>,
        match_tag: Option<TagId>,
        pool: AddressPool,
    ) -> Self {
        Self {
            id: 0,
            action: spec.action,
            match_spec: spec.match_spec,
            flags: spec.flags,
            label: spec.label,
            pool,
            tag,
            match_tag,
            skip: [0; SKIP_COUNT],
            states_total: 0,
            packets: [0; 2],
            bytes: [0; 2],
        }
    }

    pub fn id(&self) -> RuleId {
        self.id
    }

    pub fn action(&self) -> RuleAction {
        self.action
    }

    pub fn match_spec(&self) -> &MatchSpec {
        &self.match_spec
    }

    pub fn flags(&self) -> RuleFlags {
        self.flags
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut AddressPool {
        &mut self.pool
    }

    pub fn tag(&self) -> Option<TagId> {
        self.tag
    }

    pub fn match_tag(&self) -> Option<TagId> {
        self.match_tag
    }

    pub fn skip(&self) -> &[u32; SKIP_COUNT] {
        &self.skip
    }

    pub(crate) fn set_skip(&mut self, skip: [u32; SKIP_COUNT]) {
        self.skip = skip;
    }

    /// Fold one packet's worth of traffic into the rule's aggregate
    /// counters.
    pub fn account(&mut self, dir: Direction, packets: u64, bytes: u64) {
        let idx = match dir {
            Direction::In => 0,
            Direction::Out => 1,
        };
        self.packets[idx] += packets;
        self.bytes[idx] += bytes;
    }
}

/// Whether a rule currently sits in a queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkState {
    /// Linked at position `nr` of its owning queue. Positions are a
    /// dense `0..N-1` renumbering, maintained by the queue.
    Linked { nr: u32 },
    /// Unlinked, alive only because connections still reference it.
    Detached,
}

#[derive(Debug)]
pub struct RuleEntry {
    rule: Rule,
    /// The number of live connections created from this rule.
    refs: u32,
    link: LinkState,
    /// Pinned entries (the per-category default rules) are never
    /// reclaimed or removable.
    pinned: bool,
}

impl RuleEntry {
    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    pub fn refs(&self) -> u32 {
        self.refs
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn dump(&self, tags: &TagTable) -> RuleDump {
        let nr = match self.link {
            LinkState::Linked { nr } => Some(nr),
            LinkState::Detached => None,
        };
        let tag_name = |id: Option<TagId>| {
            id.and_then(|id| tags.name(id)).map(str::to_string)
        };

        RuleDump {
            id: self.rule.id,
            nr,
            action: self.rule.action,
            match_spec: self.rule.match_spec.clone(),
            flags: self.rule.flags,
            label: self.rule.label.clone(),
            tag: tag_name(self.rule.tag),
            match_tag: tag_name(self.rule.match_tag),
            pool: self
                .rule
                .pool
                .entries()
                .iter()
                .map(|e| e.to_string())
                .collect(),
            states: self.refs,
            states_total: self.rule.states_total,
            packets: self.rule.packets,
            bytes: self.rule.bytes,
        }
    }
}

/// The arena owning every rule in the store.
#[derive(Debug, Default)]
pub struct RuleArena {
    entries: BTreeMap<RuleId, RuleEntry>,
    next_id: RuleId,
}

impl RuleArena {
    pub fn new() -> Self {
        // Handle 0 is never issued so it can serve as an impossible
        // reference in dumps and tests.
        Self { entries: BTreeMap::new(), next_id: 1 }
    }

    fn insert_entry(&mut self, mut rule: Rule, pinned: bool) -> RuleId {
        let id = self.next_id;
        self.next_id += 1;
        rule.id = id;
        let entry =
            RuleEntry { rule, refs: 0, link: LinkState::Detached, pinned };
        self.entries.insert(id, entry);
        id
    }

    /// Add a rule, returning its handle. The rule starts detached;
    /// linking is the queue's job.
    pub fn insert(&mut self, rule: Rule) -> RuleId {
        self.insert_entry(rule, false)
    }

    /// Add a pinned rule: one that always exists and is never
    /// removable, like the per-category default rules.
    pub fn insert_pinned(&mut self, rule: Rule) -> RuleId {
        self.insert_entry(rule, true)
    }

    pub fn contains(&self, id: RuleId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn entry(&self, id: RuleId) -> Option<&RuleEntry> {
        self.entries.get(&id)
    }

    pub fn get(&self, id: RuleId) -> Option<&Rule> {
        self.entries.get(&id).map(|e| &e.rule)
    }

    pub fn get_mut(&mut self, id: RuleId) -> Option<&mut Rule> {
        self.entries.get_mut(&id).map(|e| &mut e.rule)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record the rule's position in its owning queue.
    pub fn link(&mut self, id: RuleId, nr: u32) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.link = LinkState::Linked { nr };
        }
    }

    /// Take a connection reference on `id`.
    pub fn add_ref(&mut self, id: RuleId) -> Result<(), PfeError> {
        let entry =
            self.entries.get_mut(&id).ok_or(PfeError::RuleNotFound(id))?;
        entry.refs += 1;
        entry.rule.states_total += 1;
        Ok(())
    }

    /// Drop a connection reference on `id`, reclaiming the rule if it
    /// is detached and this was the last reference.
    pub fn release_ref(&mut self, id: RuleId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };

        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0
            && entry.link == LinkState::Detached
            && !entry.pinned
        {
            self.entries.remove(&id);
        }
    }

    /// Unlink `id` from its queue.
    ///
    /// The rule's pool entries and tag references are released here,
    /// at unlink time; the entry itself is reclaimed now if nothing
    /// references it, or later by [`Self::release_ref`] once the last
    /// referencing connection dies.
    ///
    /// # Errors
    ///
    /// `ProtectedRule` if `id` is pinned.
    pub fn unlink(
        &mut self,
        id: RuleId,
        tags: &mut TagTable,
    ) -> Result<(), PfeError> {
        let Some(entry) = self.entries.get_mut(&id) else {
            return Ok(());
        };

        if entry.pinned {
            return Err(PfeError::ProtectedRule);
        }

        entry.link = LinkState::Detached;
        entry.rule.pool.flush();

        if let Some(tag) = entry.rule.tag.take() {
            tags.release(tag);
        }
        if let Some(match_tag) = entry.rule.match_tag.take() {
            tags.release(match_tag);
        }

        if entry.refs == 0 {
            self.entries.remove(&id);
        }

        Ok(())
    }
}

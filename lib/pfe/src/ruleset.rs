// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Rulesets: the double-buffered queues behind the transaction
//! protocol.
//!
//! Each ruleset holds, per policy category, an active queue (the only
//! one the evaluator ever sees) and an inactive queue that a
//! transaction builds into. Tickets are optimistic concurrency
//! control: at most one writer holds a valid ticket for a category at
//! a time, but nothing blocks a second writer from starting over —
//! its `begin` simply strands the first writer, whose next call fails
//! with `StaleTicket`.

use crate::queue::RuleQueue;
use crate::queue::calc_skip_steps;
use crate::rule::RuleArena;
use crate::tag::TagTable;
use pfe_api::PfeError;
use pfe_api::RULE_CATEGORY_COUNT;
use pfe_api::RuleCategory;
use pfe_api::Ticket;

/// One category's queues and tickets.
#[derive(Debug, Default)]
pub struct CategoryRules {
    pub(crate) active: RuleQueue,
    pub(crate) active_ticket: Ticket,
    pub(crate) inactive: RuleQueue,
    pub(crate) inactive_ticket: Ticket,
    pub(crate) open: bool,
}

impl CategoryRules {
    /// Empty in every respect: nothing staged, nothing active, no
    /// transaction open. This is the garbage-collection criterion.
    pub fn is_unused(&self) -> bool {
        self.active.is_empty() && self.inactive.is_empty() && !self.open
    }

    pub fn active(&self) -> &RuleQueue {
        &self.active
    }

    pub fn active_ticket(&self) -> Ticket {
        self.active_ticket
    }

    pub(crate) fn check_inactive_ticket(
        &self,
        ticket: Ticket,
    ) -> Result<(), PfeError> {
        if !self.open || ticket != self.inactive_ticket {
            return Err(PfeError::StaleTicket);
        }
        Ok(())
    }

    fn check_active_ticket(&self, ticket: Ticket) -> Result<(), PfeError> {
        if ticket != self.active_ticket {
            return Err(PfeError::StaleTicket);
        }
        Ok(())
    }

    /// Unlink everything in `queue`, freeing rules nothing references.
    fn flush(
        queue: &mut RuleQueue,
        arena: &mut RuleArena,
        tags: &mut TagTable,
    ) {
        for id in queue.drain() {
            // Queue members are never pinned, so unlink cannot fail.
            let _ = arena.unlink(id, tags);
        }
    }

    /// Open a transaction: discard whatever an earlier, uncommitted
    /// transaction staged, and issue a fresh ticket.
    pub fn begin(
        &mut self,
        ticket: Ticket,
        arena: &mut RuleArena,
        tags: &mut TagTable,
    ) -> Ticket {
        Self::flush(&mut self.inactive, arena, tags);
        self.inactive_ticket = ticket;
        self.open = true;
        ticket
    }

    /// Append `rule_id` to the inactive queue.
    pub fn stage_rule(
        &mut self,
        ticket: Ticket,
        rule_id: pfe_api::RuleId,
        arena: &mut RuleArena,
    ) -> Result<(), PfeError> {
        self.check_inactive_ticket(ticket)?;
        self.inactive.push(rule_id, arena);
        Ok(())
    }

    /// Atomically activate the staged queue.
    ///
    /// The caller holds the policy write guard, which is what makes
    /// the swap indivisible for concurrent readers. The previous
    /// active rules are unlinked here; any of them kept alive by
    /// connections stay in the arena, detached.
    pub fn commit(
        &mut self,
        ticket: Ticket,
        arena: &mut RuleArena,
        tags: &mut TagTable,
    ) -> Result<(), PfeError> {
        self.check_inactive_ticket(ticket)?;

        core::mem::swap(&mut self.active, &mut self.inactive);
        self.active_ticket = ticket;
        self.open = false;

        Self::flush(&mut self.inactive, arena, tags);
        self.active.renumber(arena);
        calc_skip_steps(arena, &self.active);
        Ok(())
    }

    /// Validate `ticket` against the active queue, for the in-place
    /// edit path.
    pub fn check_edit_ticket(&self, ticket: Ticket) -> Result<(), PfeError> {
        self.check_active_ticket(ticket)
    }
}

/// A named collection of per-category queue pairs within an anchor.
#[derive(Debug)]
pub struct RuleSet {
    name: String,
    categories: [CategoryRules; RULE_CATEGORY_COUNT],
}

impl RuleSet {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), categories: Default::default() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self, cat: RuleCategory) -> &CategoryRules {
        &self.categories[cat.index()]
    }

    pub fn category_mut(&mut self, cat: RuleCategory) -> &mut CategoryRules {
        &mut self.categories[cat.index()]
    }

    /// True when every category is unused; such a ruleset is garbage.
    pub fn is_unused(&self) -> bool {
        self.categories.iter().all(CategoryRules::is_unused)
    }
}

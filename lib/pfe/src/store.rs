// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The policy store: the single value everything hangs off.
//!
//! The store guards three regions independently: the policy data
//! (anchors, the rule arena, the pool staging area) behind a rwlock
//! whose read side belongs to the packet path, the connection table
//! behind its own rwlock, and the tag table behind a mutex. An
//! operation that needs more than one region acquires them in a fixed
//! order — policy, tags, states, stats — so the engine cannot
//! deadlock against itself. No operation performs I/O while holding
//! a guard.

use crate::ExecCtx;
use crate::LogLevel;
use crate::anchor::Anchor;
use crate::anchor::MAIN_NAME;
use crate::pool::AddressPool;
use crate::pool::NetworkView;
use crate::pool::PoolStaging;
use crate::queue::RuleQueue;
use crate::queue::calc_skip_steps;
use crate::rule::Rule;
use crate::rule::RuleArena;
use crate::ruleset::RuleSet;
use crate::state::State;
use crate::state::StateTable;
use crate::sync::KMutex;
use crate::sync::KRwLock;
use crate::tag::TagTable;
use crate::time::Moment;
use pfe_api::AddRuleReq;
use pfe_api::ChangeOp;
use pfe_api::ChangeRuleReq;
use pfe_api::Direction;
use pfe_api::FlowKey;
use pfe_api::PfeError;
use pfe_api::PoolAddressSpec;
use pfe_api::RULE_CATEGORY_COUNT;
use pfe_api::RuleCategory;
use pfe_api::RuleDump;
use pfe_api::RuleId;
use pfe_api::RuleSpec;
use pfe_api::StateDump;
use pfe_api::StatePredicate;
use pfe_api::StateSpec;
use pfe_api::Ticket;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;

type Result<T> = core::result::Result<T, PfeError>;

/// Cumulative control-plane counters.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct StoreStats {
    /// The number of transactions opened.
    pub begins: u64,
    /// The number of transactions committed.
    pub commits: u64,
    /// The number of rules added, by transaction or in-place edit.
    pub rules_added: u64,
    /// The number of rules removed by in-place edit.
    pub rules_removed: u64,
    /// The number of connections inserted.
    pub states_added: u64,
    /// The number of connections removed by explicit purge.
    pub states_cleared: u64,
    /// The number of connections removed by the expiry sweep.
    pub states_expired: u64,
}

struct PolicyData {
    anchors: BTreeMap<String, Anchor>,
    arena: RuleArena,
    staging: PoolStaging,
    ticket_gen: Ticket,
    default_rules: [RuleId; RULE_CATEGORY_COUNT],
}

impl PolicyData {
    fn next_ticket(&mut self) -> Ticket {
        self.ticket_gen += 1;
        self.ticket_gen
    }
}

fn find_ruleset<'a>(
    anchors: &'a BTreeMap<String, Anchor>,
    anchor: &str,
    ruleset: &str,
) -> Result<&'a RuleSet> {
    let a = anchors
        .get(anchor)
        .ok_or_else(|| PfeError::AnchorNotFound(anchor.to_string()))?;
    a.ruleset(ruleset)
        .ok_or_else(|| PfeError::RuleSetNotFound(ruleset.to_string()))
}

fn find_ruleset_mut<'a>(
    anchors: &'a mut BTreeMap<String, Anchor>,
    anchor: &str,
    ruleset: &str,
) -> Result<&'a mut RuleSet> {
    let a = anchors
        .get_mut(anchor)
        .ok_or_else(|| PfeError::AnchorNotFound(anchor.to_string()))?;
    a.ruleset_mut(ruleset)
        .ok_or_else(|| PfeError::RuleSetNotFound(ruleset.to_string()))
}

/// Collect a ruleset that fell out of use, then its anchor. Idempotent:
/// unknown names and still-used rulesets are left alone, as is the
/// implicit top-level ruleset.
fn remove_if_empty(
    anchors: &mut BTreeMap<String, Anchor>,
    anchor: &str,
    ruleset: &str,
) {
    let Some(a) = anchors.get_mut(anchor) else {
        return;
    };

    a.remove_ruleset_if_unused(ruleset);
    if a.is_empty() && anchor != MAIN_NAME {
        anchors.remove(anchor);
    }
}

fn pred_matches(pred: &StatePredicate, state: &State) -> bool {
    let spec = state.spec();

    if let Some(proto) = pred.proto {
        if spec.proto != proto {
            return false;
        }
    }

    if let Some(af) = pred.af {
        if spec.af != af {
            return false;
        }
    }

    if let Some(addr) = pred.addr {
        let held = [spec.lan.addr, spec.gwy.addr, spec.ext.addr];
        if !held.contains(&addr) {
            return false;
        }
    }

    if let Some(rule) = pred.rule {
        if spec.rule != rule && spec.nat_rule != Some(rule) {
            return false;
        }
    }

    true
}

/// Turn a rule spec into an arena entry: intern its tags, consume the
/// staged pool if the action calls for one.
///
/// All the fallible steps run before anything observable happens; a
/// failed tag intern rolls back the one before it, and the pool is
/// consumed last, only once nothing else can fail.
fn build_rule(
    data: &mut PolicyData,
    tags: &mut TagTable,
    spec: &RuleSpec,
    pool_ticket: Option<Ticket>,
) -> Result<RuleId> {
    if let Some(pt) = pool_ticket {
        data.staging.staged_len(pt)?;
    }

    let translation = spec.action.is_translation();
    if translation {
        let pt = pool_ticket.ok_or(PfeError::StalePool)?;
        if data.staging.staged_len(pt)? == 0 {
            return Err(PfeError::InvalidRule(
                "translation rule requires a staged address pool".to_string(),
            ));
        }
    }

    let tag = match &spec.tag {
        Some(name) => Some(tags.intern(name)?),
        None => None,
    };

    let match_tag = match &spec.match_tag {
        Some(name) => match tags.intern(name) {
            Ok(id) => Some(id),
            Err(e) => {
                if let Some(t) = tag {
                    tags.release(t);
                }
                return Err(e);
            }
        },
        None => None,
    };

    let pool = if translation {
        // The ticket was validated above; take() cannot fail here.
        match data.staging.take(pool_ticket.unwrap_or_default()) {
            Ok(pool) => pool,
            Err(e) => {
                if let Some(t) = tag {
                    tags.release(t);
                }
                if let Some(t) = match_tag {
                    tags.release(t);
                }
                return Err(e);
            }
        }
    } else {
        AddressPool::new()
    };

    Ok(data.arena.insert(Rule::from_parts(spec.clone(), tag, match_tag, pool)))
}

/// A read-only view of one category's active queue, for the
/// packet-classification evaluator. The evaluator never sees the
/// inactive queue or anything mid-transaction.
pub struct ActiveRules<'a> {
    queue: &'a RuleQueue,
    arena: &'a RuleArena,
    default_rule: RuleId,
}

impl ActiveRules<'_> {
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// The rules in evaluation order.
    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.queue.ids().iter().filter_map(|id| self.arena.get(*id))
    }

    /// The always-present fallback rule for this category.
    pub fn default_rule(&self) -> &Rule {
        self.arena.get(self.default_rule).expect("default rules are pinned")
    }
}

/// The control plane of the packet filter.
pub struct PolicyStore {
    ectx: Arc<ExecCtx>,
    net: Box<dyn NetworkView>,
    policy: KRwLock<PolicyData>,
    tags: KMutex<TagTable>,
    states: KRwLock<StateTable>,
    stats: KMutex<StoreStats>,
}

impl PolicyStore {
    pub fn new(
        ectx: ExecCtx,
        net: Box<dyn NetworkView>,
        state_limit: NonZeroU32,
    ) -> Self {
        let mut arena = RuleArena::new();
        let default_rules = RuleCategory::ALL.map(|cat| {
            let mut spec =
                RuleSpec::new(pfe_api::RuleAction::Pass, Default::default());
            spec.label = Some(format!("default:{cat}"));
            arena.insert_pinned(Rule::from_parts(
                spec,
                None,
                None,
                AddressPool::new(),
            ))
        });

        let mut anchors = BTreeMap::new();
        let mut main = Anchor::new(MAIN_NAME);
        main.find_or_create_ruleset(MAIN_NAME);
        anchors.insert(MAIN_NAME.to_string(), main);

        Self {
            ectx: Arc::new(ectx),
            net,
            policy: KRwLock::new(PolicyData {
                anchors,
                arena,
                staging: PoolStaging::new(),
                ticket_gen: 0,
                default_rules,
            }),
            tags: KMutex::new(TagTable::new()),
            states: KRwLock::new(StateTable::new(state_limit)),
            stats: KMutex::new(StoreStats::default()),
        }
    }

    // ================================================================
    // Rule transactions
    // ================================================================

    /// Open a transaction on `(anchor, ruleset, category)`, creating
    /// the namespace node on first reference.
    ///
    /// Any rules a previous, uncommitted transaction staged for this
    /// category are discarded; their writer's next call will fail
    /// with `StaleTicket`.
    pub fn begin_rules(
        &self,
        anchor: &str,
        ruleset: &str,
        category: RuleCategory,
    ) -> Result<Ticket> {
        let mut guard = self.policy.write();
        let data = &mut *guard;
        let mut tags = self.tags.lock();

        let ticket = {
            data.ticket_gen += 1;
            data.ticket_gen
        };

        let a = data
            .anchors
            .entry(anchor.to_string())
            .or_insert_with(|| Anchor::new(anchor));
        let cat = a.find_or_create_ruleset(ruleset).category_mut(category);
        cat.begin(ticket, &mut data.arena, &mut tags);

        self.stats.lock().begins += 1;
        Ok(ticket)
    }

    /// Stage one rule under an open transaction.
    pub fn add_rule(&self, req: &AddRuleReq) -> Result<()> {
        let mut guard = self.policy.write();
        let data = &mut *guard;
        let mut tags = self.tags.lock();

        // Validate the transaction ticket before touching anything.
        find_ruleset(&data.anchors, &req.anchor, &req.ruleset)?
            .category(req.category)
            .check_inactive_ticket(req.ticket)?;

        let id =
            build_rule(data, &mut tags, &req.rule, Some(req.pool_ticket))?;

        let cat = find_ruleset_mut(&mut data.anchors, &req.anchor, &req.ruleset)?
            .category_mut(req.category);
        cat.stage_rule(req.ticket, id, &mut data.arena)?;

        self.stats.lock().rules_added += 1;
        Ok(())
    }

    /// Atomically activate the staged queue for a category.
    ///
    /// Concurrent readers of the active queue observe either the full
    /// previous queue or the full new one; the swap happens entirely
    /// under the policy write guard.
    pub fn commit_rules(
        &self,
        anchor: &str,
        ruleset: &str,
        category: RuleCategory,
        ticket: Ticket,
    ) -> Result<()> {
        let mut guard = self.policy.write();
        let data = &mut *guard;
        let mut tags = self.tags.lock();

        let cat = find_ruleset_mut(&mut data.anchors, anchor, ruleset)?
            .category_mut(category);
        cat.commit(ticket, &mut data.arena, &mut tags)?;

        remove_if_empty(&mut data.anchors, anchor, ruleset);
        self.stats.lock().commits += 1;
        Ok(())
    }

    /// The active queue's commit ticket and rule count.
    pub fn get_rule_count(
        &self,
        anchor: &str,
        ruleset: &str,
        category: RuleCategory,
    ) -> Result<(Ticket, u32)> {
        let data = self.policy.read();
        let cat =
            find_ruleset(&data.anchors, anchor, ruleset)?.category(category);
        Ok((cat.active_ticket(), cat.active().len() as u32))
    }

    /// Dump the active rule at `index`.
    pub fn get_rule(
        &self,
        anchor: &str,
        ruleset: &str,
        category: RuleCategory,
        index: u32,
    ) -> Result<RuleDump> {
        let data = self.policy.read();
        let cat =
            find_ruleset(&data.anchors, anchor, ruleset)?.category(category);
        let id = cat
            .active()
            .ids()
            .get(index as usize)
            .ok_or(PfeError::RuleIndexNotFound(index))?;
        let entry =
            data.arena.entry(*id).ok_or(PfeError::RuleNotFound(*id))?;
        let tags = self.tags.lock();
        Ok(entry.dump(&tags))
    }

    /// Dump a rule by handle.
    ///
    /// Works for unlinked rules too: a connection's owner stays
    /// queryable for as long as the connection lives.
    pub fn rule(&self, id: RuleId) -> Result<RuleDump> {
        let data = self.policy.read();
        let entry = data.arena.entry(id).ok_or(PfeError::RuleNotFound(id))?;
        let tags = self.tags.lock();
        Ok(entry.dump(&tags))
    }

    /// Dump a category's whole active queue, in evaluation order.
    pub fn dump_rules(
        &self,
        anchor: &str,
        ruleset: &str,
        category: RuleCategory,
    ) -> Result<Vec<RuleDump>> {
        let data = self.policy.read();
        let cat =
            find_ruleset(&data.anchors, anchor, ruleset)?.category(category);
        let tags = self.tags.lock();
        Ok(cat
            .active()
            .ids()
            .iter()
            .filter_map(|id| data.arena.entry(*id))
            .map(|entry| entry.dump(&tags))
            .collect())
    }

    /// Edit the active queue in place.
    ///
    /// The ticket must be the active queue's current one (as returned
    /// by [`Self::get_rule_count`]); success issues a fresh active
    /// ticket, so two concurrent editors serialize optimistically the
    /// same way transactions do.
    pub fn change_rule(&self, req: &ChangeRuleReq) -> Result<()> {
        let mut guard = self.policy.write();
        let data = &mut *guard;
        let mut tags = self.tags.lock();

        let len = {
            let cat = find_ruleset(&data.anchors, &req.anchor, &req.ruleset)?
                .category(req.category);
            cat.check_edit_ticket(req.ticket)?;
            cat.active().len()
        };

        match req.op {
            ChangeOp::Remove => {
                let index = req.index.ok_or_else(|| {
                    PfeError::InvalidRule("remove requires an index".to_string())
                })?;
                if index as usize >= len {
                    return Err(PfeError::RuleIndexNotFound(index));
                }

                let cat = find_ruleset_mut(
                    &mut data.anchors,
                    &req.anchor,
                    &req.ruleset,
                )?
                .category_mut(req.category);
                let id = cat.active.remove_at(index as usize, &mut data.arena);
                data.arena.unlink(id, &mut tags)?;

                cat.active_ticket = {
                    data.ticket_gen += 1;
                    data.ticket_gen
                };
                calc_skip_steps(&mut data.arena, &cat.active);
                self.stats.lock().rules_removed += 1;
            }

            op => {
                let spec = req.rule.as_ref().ok_or_else(|| {
                    PfeError::InvalidRule(
                        "change requires a rule".to_string(),
                    )
                })?;

                let at = match op {
                    ChangeOp::AddHead => 0,
                    ChangeOp::AddTail => len,
                    ChangeOp::AddBefore | ChangeOp::AddAfter => {
                        let i = req.index.ok_or_else(|| {
                            PfeError::InvalidRule(
                                "relative add requires an index".to_string(),
                            )
                        })?;
                        if i as usize >= len {
                            return Err(PfeError::RuleIndexNotFound(i));
                        }
                        match op {
                            ChangeOp::AddBefore => i as usize,
                            _ => i as usize + 1,
                        }
                    }
                    // Remove is handled by the outer arm.
                    ChangeOp::Remove => unreachable!(),
                };

                let id = build_rule(data, &mut tags, spec, req.pool_ticket)?;

                let cat = find_ruleset_mut(
                    &mut data.anchors,
                    &req.anchor,
                    &req.ruleset,
                )?
                .category_mut(req.category);
                cat.active.insert_at(at, id, &mut data.arena);

                cat.active_ticket = {
                    data.ticket_gen += 1;
                    data.ticket_gen
                };
                calc_skip_steps(&mut data.arena, &cat.active);
                self.stats.lock().rules_added += 1;
            }
        }

        remove_if_empty(&mut data.anchors, &req.anchor, &req.ruleset);
        Ok(())
    }

    // ================================================================
    // Address-pool staging
    // ================================================================

    /// Open a pool staging transaction, discarding anything staged
    /// but not consumed under the previous ticket.
    pub fn begin_staging(&self) -> Ticket {
        let mut data = self.policy.write();
        let ticket = data.next_ticket();
        data.staging.begin(ticket)
    }

    /// Stage one pool address.
    pub fn stage_address(
        &self,
        pool_ticket: Ticket,
        entry: PoolAddressSpec,
    ) -> Result<()> {
        let mut data = self.policy.write();
        data.staging.stage(pool_ticket, entry, &*self.net)
    }

    // ================================================================
    // Namespace enumeration
    // ================================================================

    pub fn list_anchors(&self) -> Vec<String> {
        let data = self.policy.read();
        data.anchors.keys().cloned().collect()
    }

    pub fn list_rulesets(&self, anchor: &str) -> Result<Vec<String>> {
        let data = self.policy.read();
        let a = data
            .anchors
            .get(anchor)
            .ok_or_else(|| PfeError::AnchorNotFound(anchor.to_string()))?;
        Ok(a.ruleset_names().map(str::to_string).collect())
    }

    // ================================================================
    // Connection tracking
    // ================================================================

    /// Track a new connection, taking a reference on every rule it
    /// names.
    ///
    /// The rule references and the two index insertions happen under
    /// one pass through the guards; if the insert fails the
    /// references are rolled back, so a failed call leaves nothing
    /// half-linked.
    pub fn add_state(&self, spec: StateSpec) -> Result<()> {
        self.add_state_at(spec, Moment::now())
    }

    pub fn add_state_at(&self, spec: StateSpec, now: Moment) -> Result<()> {
        let mut policy = self.policy.write();
        let data = &mut *policy;

        data.arena.add_ref(spec.rule)?;
        if let Some(nat_rule) = spec.nat_rule {
            if let Err(e) = data.arena.add_ref(nat_rule) {
                data.arena.release_ref(spec.rule);
                return Err(e);
            }
        }

        let mut states = self.states.write();
        if let Err(e) = states.insert(State::new(spec), now) {
            data.arena.release_ref(spec.rule);
            if let Some(nat_rule) = spec.nat_rule {
                data.arena.release_ref(nat_rule);
            }
            if matches!(e, PfeError::MaxCapacity(_)) {
                self.ectx.log.log(
                    LogLevel::Warn,
                    &format!(
                        "state table full ({} entries)",
                        states.num_states()
                    ),
                );
            }
            return Err(e);
        }

        self.stats.lock().states_added += 1;
        Ok(())
    }

    /// Look up a connection from either key perspective.
    pub fn get_state(&self, key: &FlowKey) -> Result<StateDump> {
        let states = self.states.read();
        states
            .get(key)
            .map(|entry| entry.dump(Moment::now()))
            .ok_or(PfeError::StateNotFound)
    }

    pub fn list_states(&self) -> Vec<StateDump> {
        let states = self.states.read();
        states.dump(Moment::now())
    }

    /// The number of tracked connections.
    pub fn num_states(&self) -> u32 {
        self.states.read().num_states()
    }

    /// Purge every connection matching `pred`, releasing rule
    /// references as each one dies.
    pub fn clear_states(&self, pred: &StatePredicate) -> u64 {
        let mut policy = self.policy.write();
        let mut states = self.states.write();

        let removed = states.purge(|s| pred_matches(pred, s));
        for state in &removed {
            policy.arena.release_ref(state.rule());
            if let Some(nat_rule) = state.nat_rule() {
                policy.arena.release_ref(nat_rule);
            }
        }

        let n = removed.len() as u64;
        self.stats.lock().states_cleared += n;
        n
    }

    /// The periodic expiry sweep: purge every connection idle past
    /// its timeout class.
    pub fn expire_states(&self) -> u64 {
        self.expire_states_at(Moment::now())
    }

    pub fn expire_states_at(&self, now: Moment) -> u64 {
        let mut policy = self.policy.write();
        let mut states = self.states.write();

        let removed = states.expire(now);
        for state in &removed {
            policy.arena.release_ref(state.rule());
            if let Some(nat_rule) = state.nat_rule() {
                policy.arena.release_ref(nat_rule);
            }
        }

        let n = removed.len() as u64;
        if n > 0 {
            self.ectx
                .log
                .log(LogLevel::Note, &format!("expired {n} states"));
        }
        self.stats.lock().states_expired += n;
        n
    }

    /// Record traffic against a connection and reflect it into the
    /// owning rules' aggregate counters.
    pub fn account(
        &self,
        dir: Direction,
        key: &FlowKey,
        packets: u64,
        bytes: u64,
    ) -> Result<()> {
        let mut policy = self.policy.write();
        let mut states = self.states.write();

        let (rule, nat_rule) = states
            .account(dir, key, packets, bytes, Moment::now())
            .ok_or(PfeError::StateNotFound)?;

        if let Some(rule) = policy.arena.get_mut(rule) {
            rule.account(dir, packets, bytes);
        }
        if let Some(id) = nat_rule {
            if let Some(rule) = policy.arena.get_mut(id) {
                rule.account(dir, packets, bytes);
            }
        }
        Ok(())
    }

    /// Translate `key` across the NAT boundary via the connection
    /// table.
    pub fn nat_lookup(&self, dir: Direction, key: &FlowKey) -> Result<FlowKey> {
        let states = self.states.read();
        states.translate(dir, key).ok_or(PfeError::StateNotFound)
    }

    // ================================================================
    // The evaluator's read side
    // ================================================================

    /// Run `f` over a category's active queue under the read guard.
    ///
    /// This is the packet path's window into policy: it sees a fully
    /// committed queue or the previous one, never a mixture, and it
    /// never sees the inactive queue at all.
    pub fn with_active_rules<F, R>(
        &self,
        anchor: &str,
        ruleset: &str,
        category: RuleCategory,
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(ActiveRules<'_>) -> R,
    {
        let data = self.policy.read();
        let cat =
            find_ruleset(&data.anchors, anchor, ruleset)?.category(category);
        Ok(f(ActiveRules {
            queue: cat.active(),
            arena: &data.arena,
            default_rule: data.default_rules[category.index()],
        }))
    }

    /// The handle of a category's pinned default rule.
    pub fn default_rule_id(&self, category: RuleCategory) -> RuleId {
        self.policy.read().default_rules[category.index()]
    }

    pub fn stats_snap(&self) -> StoreStats {
        *self.stats.lock()
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The connection-tracking table.
//!
//! Every tracked connection is reachable from two keys built over
//! complementary views of the same traffic: the stack-side key
//! `(lan, ext)` — the connection as the protected host sees it — and
//! the wire-side key `(ext, gwy)` — the connection as the outside
//! world sees it after translation. The table stores the connection
//! once, under the stack-side key; the wire-side index maps back to
//! it. Entries are added and removed strictly as a pair, so a lookup
//! from either perspective finds the connection or neither does.

use crate::time::Moment;
use crate::time::Ttl;
use pfe_api::Direction;
use pfe_api::FlowKey;
use pfe_api::PfeError;
use pfe_api::RuleId;
use pfe_api::StateDump;
use pfe_api::StateSpec;
use pfe_api::TimeoutClass;
use std::collections::BTreeMap;
use std::num::NonZeroU32;

pub const STATE_TABLE_DEF_MAX_ENTRIES: u32 = 10_000;

/// The idle timeout a connection in `class` ages under.
pub const fn class_ttl(class: TimeoutClass) -> Ttl {
    let seconds = match class {
        TimeoutClass::TcpFirstPacket => 120,
        TimeoutClass::TcpOpening => 30,
        TimeoutClass::TcpEstablished => 86_400,
        TimeoutClass::TcpClosing => 900,
        TimeoutClass::TcpFinWait => 45,
        TimeoutClass::TcpClosed => 90,
        TimeoutClass::UdpFirstPacket => 60,
        TimeoutClass::UdpSingle => 30,
        TimeoutClass::UdpMultiple => 60,
        TimeoutClass::IcmpFirstPacket => 20,
        TimeoutClass::IcmpError => 10,
        TimeoutClass::OtherFirstPacket => 60,
        TimeoutClass::OtherSingle => 30,
        TimeoutClass::OtherMultiple => 60,
    };
    Ttl::new_seconds(seconds)
}

/// A tracked connection.
#[derive(Clone, Debug)]
pub struct State {
    spec: StateSpec,
    packets: [u64; 2],
    bytes: [u64; 2],
}

impl State {
    pub fn new(spec: StateSpec) -> Self {
        Self { spec, packets: [0; 2], bytes: [0; 2] }
    }

    pub fn spec(&self) -> &StateSpec {
        &self.spec
    }

    pub fn rule(&self) -> RuleId {
        self.spec.rule
    }

    pub fn nat_rule(&self) -> Option<RuleId> {
        self.spec.nat_rule
    }

    pub fn timeout(&self) -> TimeoutClass {
        self.spec.timeout
    }

    pub fn set_timeout(&mut self, class: TimeoutClass) {
        self.spec.timeout = class;
    }

    /// The connection as the protected host sees it.
    pub fn stack_key(&self) -> FlowKey {
        FlowKey {
            proto: self.spec.proto,
            af: self.spec.af,
            src: self.spec.lan,
            dst: self.spec.ext,
        }
    }

    /// The connection as the wire sees it, post-translation.
    pub fn wire_key(&self) -> FlowKey {
        FlowKey {
            proto: self.spec.proto,
            af: self.spec.af,
            src: self.spec.ext,
            dst: self.spec.gwy,
        }
    }

    fn account(&mut self, dir: Direction, packets: u64, bytes: u64) {
        let idx = match dir {
            Direction::In => 0,
            Direction::Out => 1,
        };
        self.packets[idx] += packets;
        self.bytes[idx] += bytes;
    }
}

/// A table entry: the connection plus its bookkeeping.
#[derive(Clone, Debug)]
pub struct StateEntry {
    state: State,
    hits: u64,
    created: Moment,
    last_hit: Moment,
}

impl StateEntry {
    fn new(state: State, now: Moment) -> Self {
        Self { state, hits: 0, created: now, last_hit: now }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn last_hit(&self) -> Moment {
        self.last_hit
    }

    fn hit(&mut self, now: Moment) {
        self.hits += 1;
        self.last_hit = now;
    }

    fn is_expired(&self, now: Moment) -> bool {
        class_ttl(self.state.timeout()).is_expired(self.last_hit, now)
    }

    pub fn dump(&self, now: Moment) -> StateDump {
        let spec = self.state.spec;
        StateDump {
            proto: spec.proto,
            af: spec.af,
            lan: spec.lan,
            gwy: spec.gwy,
            ext: spec.ext,
            direction: spec.direction,
            rule: spec.rule,
            nat_rule: spec.nat_rule,
            timeout: spec.timeout.to_string(),
            age_secs: now.delta_as_millis(self.created) / 1_000,
            packets: self.state.packets,
            bytes: self.state.bytes,
        }
    }
}

#[derive(Debug)]
pub struct StateTable {
    limit: NonZeroU32,
    /// Stack-side index, owning the entries.
    stack: BTreeMap<FlowKey, StateEntry>,
    /// Wire-side index, pointing at the owning key.
    wire: BTreeMap<FlowKey, FlowKey>,
}

impl StateTable {
    pub fn new(limit: NonZeroU32) -> Self {
        Self { limit, stack: BTreeMap::new(), wire: BTreeMap::new() }
    }

    pub fn num_states(&self) -> u32 {
        self.stack.len() as u32
    }

    pub fn get_limit(&self) -> NonZeroU32 {
        self.limit
    }

    /// Track a new connection.
    ///
    /// The connection becomes visible in both indices or in neither:
    /// all checks happen before either map is touched.
    ///
    /// # Errors
    ///
    /// `MaxCapacity` at the table limit; `StateExists` if either key
    /// already tracks a connection.
    pub fn insert(
        &mut self,
        state: State,
        now: Moment,
    ) -> Result<(), PfeError> {
        if self.stack.len() == self.limit.get() as usize {
            return Err(PfeError::MaxCapacity(self.limit.get() as u64));
        }

        let stack_key = state.stack_key();
        let wire_key = state.wire_key();

        if self.stack.contains_key(&stack_key) {
            return Err(PfeError::StateExists(stack_key.to_string()));
        }
        if self.wire.contains_key(&wire_key) {
            return Err(PfeError::StateExists(wire_key.to_string()));
        }

        self.stack.insert(stack_key, StateEntry::new(state, now));
        self.wire.insert(wire_key, stack_key);
        Ok(())
    }

    /// Find the connection for a packet seen in `dir`.
    ///
    /// Outbound packets carry the stack-side key, inbound packets the
    /// wire-side key.
    pub fn lookup(&self, dir: Direction, key: &FlowKey) -> Option<&StateEntry> {
        match dir {
            Direction::Out => self.stack.get(key),
            Direction::In => {
                self.wire.get(key).and_then(|owner| self.stack.get(owner))
            }
        }
    }

    /// Find a connection from either perspective.
    pub fn get(&self, key: &FlowKey) -> Option<&StateEntry> {
        self.lookup(Direction::Out, key)
            .or_else(|| self.lookup(Direction::In, key))
    }

    /// Record traffic on a connection, returning the rules it
    /// references so the caller can reflect the counters into them.
    pub fn account(
        &mut self,
        dir: Direction,
        key: &FlowKey,
        packets: u64,
        bytes: u64,
        now: Moment,
    ) -> Option<(RuleId, Option<RuleId>)> {
        let owner = match dir {
            Direction::Out => *key,
            Direction::In => *self.wire.get(key)?,
        };

        let entry = self.stack.get_mut(&owner)?;
        entry.hit(now);
        entry.state.account(dir, packets, bytes);
        Some((entry.state.rule(), entry.state.nat_rule()))
    }

    /// Translate `key` across the NAT boundary.
    ///
    /// Outbound: the source endpoint is rewritten to the gateway.
    /// Inbound: the destination endpoint is rewritten to the lan
    /// host. Returns `None` for untracked connections.
    pub fn translate(&self, dir: Direction, key: &FlowKey) -> Option<FlowKey> {
        let entry = self.lookup(dir, key)?;
        let spec = entry.state.spec();

        let translated = match dir {
            Direction::Out => {
                FlowKey { src: spec.gwy, dst: spec.ext, ..*key }
            }
            Direction::In => FlowKey { src: spec.ext, dst: spec.lan, ..*key },
        };
        Some(translated)
    }

    /// Remove the connection owning `stack_key` from both indices.
    pub fn remove(&mut self, stack_key: &FlowKey) -> Option<State> {
        let entry = self.stack.remove(stack_key)?;
        self.wire.remove(&entry.state.wire_key());
        Some(entry.state)
    }

    /// Remove every connection matching `pred`, returning the removed
    /// connections so the caller can release their rule references.
    pub fn purge<F>(&mut self, pred: F) -> Vec<State>
    where
        F: Fn(&State) -> bool,
    {
        let doomed: Vec<FlowKey> = self
            .stack
            .iter()
            .filter(|(_, entry)| pred(&entry.state))
            .map(|(key, _)| *key)
            .collect();

        let mut removed = Vec::with_capacity(doomed.len());
        for key in &doomed {
            if let Some(state) = self.remove(key) {
                removed.push(state);
            }
        }
        removed
    }

    /// Remove every connection idle past its class TTL.
    pub fn expire(&mut self, now: Moment) -> Vec<State> {
        let doomed: Vec<FlowKey> = self
            .stack
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| *key)
            .collect();

        let mut removed = Vec::with_capacity(doomed.len());
        for key in &doomed {
            if let Some(state) = self.remove(key) {
                removed.push(state);
            }
        }
        removed
    }

    pub fn dump(&self, now: Moment) -> Vec<StateDump> {
        self.stack.values().map(|entry| entry.dump(now)).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::time::Duration;
    use pfe_api::AddressFamily;
    use pfe_api::Endpoint;
    use pfe_api::Protocol;

    pub const ST_SIZE: Option<NonZeroU32> = NonZeroU32::new(16);

    fn ep(addr: &str, port: u16) -> Endpoint {
        Endpoint::new(addr.parse().unwrap(), port)
    }

    fn natted_state() -> State {
        State::new(StateSpec {
            proto: Protocol::TCP,
            af: AddressFamily::Inet,
            lan: ep("192.168.2.10", 37890),
            gwy: ep("203.0.113.1", 61000),
            ext: ep("76.76.21.21", 443),
            direction: Direction::Out,
            rule: 1,
            nat_rule: Some(2),
            timeout: TimeoutClass::TcpEstablished,
        })
    }

    #[test]
    fn dual_index_lookup() {
        let mut table = StateTable::new(ST_SIZE.unwrap());
        let state = natted_state();
        let stack_key = state.stack_key();
        let wire_key = state.wire_key();
        table.insert(state, Moment::now()).unwrap();

        let from_stack = table.lookup(Direction::Out, &stack_key).unwrap();
        let from_wire = table.lookup(Direction::In, &wire_key).unwrap();
        assert_eq!(from_stack.state().rule(), from_wire.state().rule());
        assert_eq!(
            from_stack.state().stack_key(),
            from_wire.state().stack_key()
        );

        // The keys don't cross: the wire key resolves nothing
        // outbound and vice versa.
        assert!(table.lookup(Direction::Out, &wire_key).is_none());
        assert!(table.lookup(Direction::In, &stack_key).is_none());
    }

    #[test]
    fn duplicate_insert_conflicts() {
        let mut table = StateTable::new(ST_SIZE.unwrap());
        let now = Moment::now();
        table.insert(natted_state(), now).unwrap();

        let err = table.insert(natted_state(), now);
        assert!(matches!(err, Err(PfeError::StateExists(_))));
        assert_eq!(table.num_states(), 1);

        // A different stack side but colliding wire side conflicts
        // too, and leaves both indices untouched.
        let mut other = natted_state();
        other.spec.lan = ep("192.168.2.11", 40000);
        let err = table.insert(other, now);
        assert!(matches!(err, Err(PfeError::StateExists(_))));
        assert_eq!(table.num_states(), 1);
    }

    #[test]
    fn purge_removes_both_sides() {
        let mut table = StateTable::new(ST_SIZE.unwrap());
        let state = natted_state();
        let stack_key = state.stack_key();
        let wire_key = state.wire_key();
        table.insert(state, Moment::now()).unwrap();

        let removed = table.purge(|s| s.rule() == 1);
        assert_eq!(removed.len(), 1);
        assert!(table.lookup(Direction::Out, &stack_key).is_none());
        assert!(table.lookup(Direction::In, &wire_key).is_none());
        assert_eq!(table.num_states(), 0);
    }

    #[test]
    fn expire_honors_class_ttl() {
        let mut table = StateTable::new(ST_SIZE.unwrap());
        let now = Moment::now();

        let established = natted_state();
        let mut transient = natted_state();
        transient.spec.lan = ep("192.168.2.12", 50000);
        transient.spec.gwy = ep("203.0.113.1", 61002);
        transient.set_timeout(TimeoutClass::TcpFirstPacket);

        table.insert(established, now).unwrap();
        table.insert(transient, now).unwrap();

        // Two minutes in, only the first-packet state has aged out.
        let later = now + Duration::from_secs(120);
        let removed = table.expire(later);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].timeout(), TimeoutClass::TcpFirstPacket);
        assert_eq!(table.num_states(), 1);
    }

    #[test]
    fn translate_both_directions() {
        let mut table = StateTable::new(ST_SIZE.unwrap());
        let state = natted_state();
        let stack_key = state.stack_key();
        let wire_key = state.wire_key();
        table.insert(state, Moment::now()).unwrap();

        // Outbound: source becomes the gateway endpoint.
        let out = table.translate(Direction::Out, &stack_key).unwrap();
        assert_eq!(out.src, ep("203.0.113.1", 61000));
        assert_eq!(out.dst, ep("76.76.21.21", 443));

        // Inbound: destination becomes the lan endpoint.
        let inb = table.translate(Direction::In, &wire_key).unwrap();
        assert_eq!(inb.src, ep("76.76.21.21", 443));
        assert_eq!(inb.dst, ep("192.168.2.10", 37890));
    }

    #[test]
    fn capacity_is_enforced() {
        let mut table = StateTable::new(NonZeroU32::new(1).unwrap());
        let now = Moment::now();
        table.insert(natted_state(), now).unwrap();

        let mut second = natted_state();
        second.spec.lan = ep("192.168.2.13", 50001);
        second.spec.gwy = ep("203.0.113.1", 61003);
        assert_eq!(
            table.insert(second, now),
            Err(PfeError::MaxCapacity(1))
        );
    }

    #[test]
    fn account_updates_direction_counters() {
        let mut table = StateTable::new(ST_SIZE.unwrap());
        let state = natted_state();
        let stack_key = state.stack_key();
        let wire_key = state.wire_key();
        let now = Moment::now();
        table.insert(state, now).unwrap();

        let rules =
            table.account(Direction::Out, &stack_key, 2, 3000, now).unwrap();
        assert_eq!(rules, (1, Some(2)));
        table.account(Direction::In, &wire_key, 1, 500, now).unwrap();

        let entry = table.get(&stack_key).unwrap();
        assert_eq!(entry.hits(), 2);
        assert_eq!(entry.state().packets, [1, 2]);
        assert_eq!(entry.state().bytes, [500, 3000]);
    }
}

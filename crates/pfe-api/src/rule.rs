// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Rule wire types.
//!
//! These types describe a rule as it travels across the request
//! boundary. The engine turns a [`RuleSpec`] into its internal rule
//! representation at add time and renders one back as a [`RuleDump`].

use super::ip::AddressFamily;
use super::ip::IpCidr;
use super::ip::Protocol;
use super::RuleId;
use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// A policy category.
///
/// Each category has its own independent active/inactive queue pair
/// in every ruleset, and its own transaction tickets.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum RuleCategory {
    Filter,
    Nat,
    Redirect,
    BiNat,
    Scrub,
}

pub const RULE_CATEGORY_COUNT: usize = 5;

impl RuleCategory {
    pub const ALL: [Self; RULE_CATEGORY_COUNT] =
        [Self::Filter, Self::Nat, Self::Redirect, Self::BiNat, Self::Scrub];

    pub const fn index(self) -> usize {
        match self {
            Self::Filter => 0,
            Self::Nat => 1,
            Self::Redirect => 2,
            Self::BiNat => 3,
            Self::Scrub => 4,
        }
    }
}

impl Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Filter => write!(f, "filter"),
            Self::Nat => write!(f, "nat"),
            Self::Redirect => write!(f, "rdr"),
            Self::BiNat => write!(f, "binat"),
            Self::Scrub => write!(f, "scrub"),
        }
    }
}

/// What a rule does to a matching packet.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum RuleAction {
    Pass,
    Block,
    Nat,
    Redirect,
    BiNat,
    Scrub,
}

impl RuleAction {
    /// Does this action rewrite addresses, and therefore require a
    /// non-empty address pool?
    pub const fn is_translation(self) -> bool {
        matches!(self, Self::Nat | Self::Redirect | Self::BiNat)
    }
}

impl Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Block => write!(f, "block"),
            Self::Nat => write!(f, "nat"),
            Self::Redirect => write!(f, "rdr"),
            Self::BiNat => write!(f, "binat"),
            Self::Scrub => write!(f, "scrub"),
        }
    }
}

bitflags! {
    #[derive(
        Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
    )]
    pub struct RuleFlags: u8 {
        /// Stop evaluation on match; the evaluator takes this rule's
        /// action without consulting later rules.
        const QUICK = 0x01;
        /// Log matching packets.
        const LOG = 0x02;
    }
}

/// An inclusive transport port range.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self { start: port, end: port }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }
}

impl Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

/// The selectors a rule matches on.
///
/// The policy engine never evaluates these against traffic; it only
/// compares them for equality when deriving the skip data handed to
/// the packet-classification evaluator. A `None` selector matches
/// anything (from the evaluator's point of view) and compares equal
/// only to another `None`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct MatchSpec {
    pub af: Option<AddressFamily>,
    pub proto: Option<Protocol>,
    pub src_addr: Option<IpCidr>,
    pub src_ports: Option<PortRange>,
    pub dst_addr: Option<IpCidr>,
    pub dst_ports: Option<PortRange>,
}

impl Display for MatchSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn sel<T: Display>(
            f: &mut fmt::Formatter,
            name: &str,
            v: &Option<T>,
        ) -> fmt::Result {
            match v {
                Some(v) => write!(f, " {name}={v}"),
                None => Ok(()),
            }
        }

        write!(f, "match")?;
        sel(f, "af", &self.af)?;
        sel(f, "proto", &self.proto)?;
        sel(f, "src", &self.src_addr)?;
        sel(f, "sport", &self.src_ports)?;
        sel(f, "dst", &self.dst_addr)?;
        sel(f, "dport", &self.dst_ports)
    }
}

/// One candidate translation address for a NAT/redirect pool.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum PoolAddressSpec {
    /// A fixed address and mask.
    Cidr(IpCidr),
    /// The dynamic address of a named interface.
    Interface(String),
    /// A reference to a named external address table.
    Table(String),
}

impl Display for PoolAddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Cidr(cidr) => write!(f, "{cidr}"),
            Self::Interface(name) => write!(f, "({name})"),
            Self::Table(name) => write!(f, "<{name}>"),
        }
    }
}

/// A rule as submitted by an administrator.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RuleSpec {
    pub action: RuleAction,
    pub match_spec: MatchSpec,
    pub flags: RuleFlags,
    /// Free-form label for statistics reporting.
    pub label: Option<String>,
    /// Tag applied to packets admitted by this rule.
    pub tag: Option<String>,
    /// Tag a packet must already carry for this rule to match.
    pub match_tag: Option<String>,
}

impl RuleSpec {
    pub fn new(action: RuleAction, match_spec: MatchSpec) -> Self {
        Self {
            action,
            match_spec,
            flags: RuleFlags::default(),
            label: None,
            tag: None,
            match_tag: None,
        }
    }
}

/// A rule as reported back by the engine.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RuleDump {
    pub id: RuleId,
    /// Position in the owning queue; `None` once the rule has been
    /// unlinked but is kept alive by live states.
    pub nr: Option<u32>,
    pub action: RuleAction,
    pub match_spec: MatchSpec,
    pub flags: RuleFlags,
    pub label: Option<String>,
    pub tag: Option<String>,
    pub match_tag: Option<String>,
    pub pool: Vec<String>,
    /// Number of live states created from this rule.
    pub states: u32,
    /// Total number of states ever created from this rule.
    pub states_total: u64,
    /// Packets attributed to this rule, `[in, out]`.
    pub packets: [u64; 2],
    /// Bytes attributed to this rule, `[in, out]`.
    pub bytes: [u64; 2],
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The synchronous request/response surface of the policy engine.
//!
//! Every control operation is a request type paired with a response
//! type; both sides are serde types serialized with postcard across
//! the transport. The transport itself (how request bytes reach the
//! engine) is not defined here.

use super::Direction;
use super::RuleId;
use super::Ticket;
use super::ip::FlowKey;
use super::rule::PoolAddressSpec;
use super::rule::RuleCategory;
use super::rule::RuleDump;
use super::rule::RuleSpec;
use super::state::StateDump;
use super::state::StatePredicate;
use super::state::StateSpec;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Debug;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub enum PfeCmd {
    BeginRules = 1,    // open a rule transaction
    AddRule = 2,       // stage a rule under an open transaction
    CommitRules = 3,   // atomically activate the staged queue
    GetRuleCount = 4,  // active ticket + rule count
    GetRule = 5,       // dump one active rule
    ChangeRule = 6,    // in-place edit of the active queue
    BeginStaging = 10, // open a pool staging transaction
    StageAddress = 11, // stage one pool address
    ListAnchors = 20,  // enumerate anchors
    ListRuleSets = 21, // enumerate rulesets within an anchor
    AddState = 30,     // insert a tracked connection
    GetState = 31,     // look up one tracked connection
    ListStates = 32,   // dump all tracked connections
    ClearStates = 33,  // purge tracked connections by predicate
    NatLookup = 34,    // reverse-translate a flow key
}

impl TryFrom<u32> for PfeCmd {
    type Error = ();

    fn try_from(num: u32) -> Result<Self, Self::Error> {
        match num {
            1 => Ok(Self::BeginRules),
            2 => Ok(Self::AddRule),
            3 => Ok(Self::CommitRules),
            4 => Ok(Self::GetRuleCount),
            5 => Ok(Self::GetRule),
            6 => Ok(Self::ChangeRule),
            10 => Ok(Self::BeginStaging),
            11 => Ok(Self::StageAddress),
            20 => Ok(Self::ListAnchors),
            21 => Ok(Self::ListRuleSets),
            30 => Ok(Self::AddState),
            31 => Ok(Self::GetState),
            32 => Ok(Self::ListStates),
            33 => Ok(Self::ClearStates),
            34 => Ok(Self::NatLookup),
            _ => Err(()),
        }
    }
}

/// The errors a request can fail with.
///
/// None of these corrupt shared state: a failed request leaves the
/// active and inactive queues, the staged pool, and both state-table
/// indices exactly as they were.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum PfeError {
    /// The presented ticket is not the current generation for the
    /// addressed queue; the caller must restart its edit.
    StaleTicket,

    /// The presented pool ticket is not the current staging
    /// generation.
    StalePool,

    /// The bounded tag id space is full.
    TagSpaceExhausted,

    /// A connection with an equal key already exists in one of the
    /// state-table indices.
    StateExists(String),

    AnchorNotFound(String),
    RuleSetNotFound(String),
    RuleNotFound(RuleId),
    RuleIndexNotFound(u32),
    StateNotFound,

    /// The rule is malformed: a translation action with an empty
    /// pool, an unknown interface or table reference, or an empty
    /// tag name.
    InvalidRule(String),

    /// The addressed rule is a pinned default rule and may not be
    /// removed.
    ProtectedRule,

    BadName,
    MaxCapacity(u64),

    DeserCmdReq(String),
    SerCmdResp(String),
}

/// A marker trait indicating a success response type that is returned
/// from a command and may be passed across the request boundary.
pub trait CmdOk: Debug + Serialize {}

impl CmdOk for () {}

/// Indicates no meaningful response value on success.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct NoResp {
    pub unused: u64,
}

impl CmdOk for NoResp {}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BeginRulesReq {
    pub anchor: String,
    pub ruleset: String,
    pub category: RuleCategory,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BeginRulesResp {
    pub ticket: Ticket,
}

impl CmdOk for BeginRulesResp {}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AddRuleReq {
    pub anchor: String,
    pub ruleset: String,
    pub category: RuleCategory,
    pub ticket: Ticket,
    pub pool_ticket: Ticket,
    pub rule: RuleSpec,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CommitRulesReq {
    pub anchor: String,
    pub ruleset: String,
    pub category: RuleCategory,
    pub ticket: Ticket,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GetRuleCountReq {
    pub anchor: String,
    pub ruleset: String,
    pub category: RuleCategory,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GetRuleCountResp {
    /// The ticket of the most recent successful commit.
    pub ticket: Ticket,
    pub count: u32,
}

impl CmdOk for GetRuleCountResp {}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GetRuleReq {
    pub anchor: String,
    pub ruleset: String,
    pub category: RuleCategory,
    /// Position in the active queue.
    pub index: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GetRuleResp {
    pub rule: RuleDump,
}

impl CmdOk for GetRuleResp {}

/// How [`ChangeRuleReq`] edits the active queue.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ChangeOp {
    AddHead,
    AddTail,
    AddBefore,
    AddAfter,
    Remove,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChangeRuleReq {
    pub anchor: String,
    pub ruleset: String,
    pub category: RuleCategory,
    /// Must match the active queue's current ticket.
    pub ticket: Ticket,
    /// Required when `rule` carries a translation action.
    pub pool_ticket: Option<Ticket>,
    pub op: ChangeOp,
    /// Anchor position for `AddBefore`/`AddAfter`/`Remove`.
    pub index: Option<u32>,
    /// The new rule for the `Add*` operations.
    pub rule: Option<RuleSpec>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BeginStagingResp {
    pub pool_ticket: Ticket,
}

impl CmdOk for BeginStagingResp {}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StageAddressReq {
    pub pool_ticket: Ticket,
    pub entry: PoolAddressSpec,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ListAnchorsResp {
    pub anchors: Vec<String>,
}

impl CmdOk for ListAnchorsResp {}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ListRuleSetsReq {
    pub anchor: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ListRuleSetsResp {
    pub rulesets: Vec<String>,
}

impl CmdOk for ListRuleSetsResp {}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AddStateReq {
    pub state: StateSpec,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GetStateReq {
    pub key: FlowKey,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GetStateResp {
    pub state: StateDump,
}

impl CmdOk for GetStateResp {}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ListStatesResp {
    pub states: Vec<StateDump>,
}

impl CmdOk for ListStatesResp {}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ClearStatesReq {
    pub predicate: StatePredicate,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ClearStatesResp {
    pub cleared: u64,
}

impl CmdOk for ClearStatesResp {}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NatLookupReq {
    pub direction: Direction,
    pub key: FlowKey,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NatLookupResp {
    /// The same connection expressed from the other side of the
    /// translation.
    pub translated: FlowKey,
}

impl CmdOk for NatLookupResp {}

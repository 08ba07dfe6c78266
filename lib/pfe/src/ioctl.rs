// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The request interface.
//!
//! Each handler pairs one request type with one response type; the
//! [`dispatch`] entry point is the analogue of a device ioctl: it
//! decodes a postcard-encoded request, runs the handler, and encodes
//! the response. Whatever transport carries the bytes — a device
//! node, a socket, a test harness — is someone else's concern.

use crate::store::PolicyStore;
use pfe_api::AddRuleReq;
use pfe_api::AddStateReq;
use pfe_api::BeginRulesReq;
use pfe_api::BeginRulesResp;
use pfe_api::BeginStagingResp;
use pfe_api::ChangeRuleReq;
use pfe_api::ClearStatesReq;
use pfe_api::ClearStatesResp;
use pfe_api::CmdOk;
use pfe_api::CommitRulesReq;
use pfe_api::GetRuleCountReq;
use pfe_api::GetRuleCountResp;
use pfe_api::GetRuleReq;
use pfe_api::GetRuleResp;
use pfe_api::GetStateReq;
use pfe_api::GetStateResp;
use pfe_api::ListAnchorsResp;
use pfe_api::ListRuleSetsReq;
use pfe_api::ListRuleSetsResp;
use pfe_api::ListStatesResp;
use pfe_api::NatLookupReq;
use pfe_api::NatLookupResp;
use pfe_api::NoResp;
use pfe_api::PfeCmd;
use pfe_api::PfeError;
use pfe_api::StageAddressReq;
use serde::de::DeserializeOwned;

type Result<T> = core::result::Result<T, PfeError>;

pub fn begin_rules(
    store: &PolicyStore,
    req: &BeginRulesReq,
) -> Result<BeginRulesResp> {
    let ticket =
        store.begin_rules(&req.anchor, &req.ruleset, req.category)?;
    Ok(BeginRulesResp { ticket })
}

pub fn add_rule(store: &PolicyStore, req: &AddRuleReq) -> Result<NoResp> {
    store.add_rule(req)?;
    Ok(NoResp::default())
}

pub fn commit_rules(
    store: &PolicyStore,
    req: &CommitRulesReq,
) -> Result<NoResp> {
    store.commit_rules(&req.anchor, &req.ruleset, req.category, req.ticket)?;
    Ok(NoResp::default())
}

pub fn get_rule_count(
    store: &PolicyStore,
    req: &GetRuleCountReq,
) -> Result<GetRuleCountResp> {
    let (ticket, count) =
        store.get_rule_count(&req.anchor, &req.ruleset, req.category)?;
    Ok(GetRuleCountResp { ticket, count })
}

pub fn get_rule(store: &PolicyStore, req: &GetRuleReq) -> Result<GetRuleResp> {
    let rule =
        store.get_rule(&req.anchor, &req.ruleset, req.category, req.index)?;
    Ok(GetRuleResp { rule })
}

pub fn change_rule(store: &PolicyStore, req: &ChangeRuleReq) -> Result<NoResp> {
    store.change_rule(req)?;
    Ok(NoResp::default())
}

pub fn begin_staging(store: &PolicyStore) -> BeginStagingResp {
    BeginStagingResp { pool_ticket: store.begin_staging() }
}

pub fn stage_address(
    store: &PolicyStore,
    req: &StageAddressReq,
) -> Result<NoResp> {
    store.stage_address(req.pool_ticket, req.entry.clone())?;
    Ok(NoResp::default())
}

pub fn list_anchors(store: &PolicyStore) -> ListAnchorsResp {
    ListAnchorsResp { anchors: store.list_anchors() }
}

pub fn list_rulesets(
    store: &PolicyStore,
    req: &ListRuleSetsReq,
) -> Result<ListRuleSetsResp> {
    let rulesets = store.list_rulesets(&req.anchor)?;
    Ok(ListRuleSetsResp { rulesets })
}

pub fn add_state(store: &PolicyStore, req: &AddStateReq) -> Result<NoResp> {
    store.add_state(req.state)?;
    Ok(NoResp::default())
}

pub fn get_state(store: &PolicyStore, req: &GetStateReq) -> Result<GetStateResp> {
    let state = store.get_state(&req.key)?;
    Ok(GetStateResp { state })
}

pub fn list_states(store: &PolicyStore) -> ListStatesResp {
    ListStatesResp { states: store.list_states() }
}

pub fn clear_states(
    store: &PolicyStore,
    req: &ClearStatesReq,
) -> Result<ClearStatesResp> {
    Ok(ClearStatesResp { cleared: store.clear_states(&req.predicate) })
}

pub fn nat_lookup(
    store: &PolicyStore,
    req: &NatLookupReq,
) -> Result<NatLookupResp> {
    let translated = store.nat_lookup(req.direction, &req.key)?;
    Ok(NatLookupResp { translated })
}

fn envelope<Req, Resp, F>(bytes: &[u8], f: F) -> Result<Vec<u8>>
where
    Req: DeserializeOwned,
    Resp: CmdOk,
    F: FnOnce(Req) -> Result<Resp>,
{
    let req: Req = postcard::from_bytes(bytes)
        .map_err(|e| PfeError::DeserCmdReq(e.to_string()))?;
    let resp = f(req)?;
    postcard::to_allocvec(&resp)
        .map_err(|e| PfeError::SerCmdResp(e.to_string()))
}

/// Decode `req_bytes` as the request type of `cmd`, run the handler,
/// and encode its response.
///
/// Commands with no request body take an empty byte slice.
pub fn dispatch(
    store: &PolicyStore,
    cmd: PfeCmd,
    req_bytes: &[u8],
) -> Result<Vec<u8>> {
    match cmd {
        PfeCmd::BeginRules => {
            envelope(req_bytes, |req: BeginRulesReq| begin_rules(store, &req))
        }
        PfeCmd::AddRule => {
            envelope(req_bytes, |req: AddRuleReq| add_rule(store, &req))
        }
        PfeCmd::CommitRules => {
            envelope(req_bytes, |req: CommitRulesReq| commit_rules(store, &req))
        }
        PfeCmd::GetRuleCount => envelope(req_bytes, |req: GetRuleCountReq| {
            get_rule_count(store, &req)
        }),
        PfeCmd::GetRule => {
            envelope(req_bytes, |req: GetRuleReq| get_rule(store, &req))
        }
        PfeCmd::ChangeRule => {
            envelope(req_bytes, |req: ChangeRuleReq| change_rule(store, &req))
        }
        PfeCmd::BeginStaging => {
            envelope(req_bytes, |_: ()| Ok(begin_staging(store)))
        }
        PfeCmd::StageAddress => {
            envelope(req_bytes, |req: StageAddressReq| {
                stage_address(store, &req)
            })
        }
        PfeCmd::ListAnchors => {
            envelope(req_bytes, |_: ()| Ok(list_anchors(store)))
        }
        PfeCmd::ListRuleSets => {
            envelope(req_bytes, |req: ListRuleSetsReq| {
                list_rulesets(store, &req)
            })
        }
        PfeCmd::AddState => {
            envelope(req_bytes, |req: AddStateReq| add_state(store, &req))
        }
        PfeCmd::GetState => {
            envelope(req_bytes, |req: GetStateReq| get_state(store, &req))
        }
        PfeCmd::ListStates => {
            envelope(req_bytes, |_: ()| Ok(list_states(store)))
        }
        PfeCmd::ClearStates => {
            envelope(req_bytes, |req: ClearStatesReq| clear_states(store, &req))
        }
        PfeCmd::NatLookup => {
            envelope(req_bytes, |req: NatLookupReq| nat_lookup(store, &req))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ExecCtx;
    use crate::PrintlnLog;
    use crate::pool::OpenNetworkView;
    use crate::state::STATE_TABLE_DEF_MAX_ENTRIES;
    use pfe_api::MatchSpec;
    use pfe_api::RuleAction;
    use pfe_api::RuleCategory;
    use pfe_api::RuleSpec;
    use std::num::NonZeroU32;

    fn test_store() -> PolicyStore {
        PolicyStore::new(
            ExecCtx { log: Box::new(PrintlnLog {}) },
            Box::new(OpenNetworkView {}),
            NonZeroU32::new(STATE_TABLE_DEF_MAX_ENTRIES).unwrap(),
        )
    }

    #[test]
    fn dispatch_round_trip() {
        let store = test_store();

        let begin = BeginRulesReq {
            anchor: "".to_string(),
            ruleset: "".to_string(),
            category: RuleCategory::Filter,
        };
        let resp_bytes = dispatch(
            &store,
            PfeCmd::BeginRules,
            &postcard::to_allocvec(&begin).unwrap(),
        )
        .unwrap();
        let resp: BeginRulesResp = postcard::from_bytes(&resp_bytes).unwrap();

        let pool = dispatch(&store, PfeCmd::BeginStaging, &[]).unwrap();
        let pool: BeginStagingResp = postcard::from_bytes(&pool).unwrap();

        let add = AddRuleReq {
            anchor: "".to_string(),
            ruleset: "".to_string(),
            category: RuleCategory::Filter,
            ticket: resp.ticket,
            pool_ticket: pool.pool_ticket,
            rule: RuleSpec::new(RuleAction::Pass, MatchSpec::default()),
        };
        dispatch(&store, PfeCmd::AddRule, &postcard::to_allocvec(&add).unwrap())
            .unwrap();

        let commit = CommitRulesReq {
            anchor: "".to_string(),
            ruleset: "".to_string(),
            category: RuleCategory::Filter,
            ticket: resp.ticket,
        };
        dispatch(
            &store,
            PfeCmd::CommitRules,
            &postcard::to_allocvec(&commit).unwrap(),
        )
        .unwrap();

        let count = GetRuleCountReq {
            anchor: "".to_string(),
            ruleset: "".to_string(),
            category: RuleCategory::Filter,
        };
        let resp_bytes = dispatch(
            &store,
            PfeCmd::GetRuleCount,
            &postcard::to_allocvec(&count).unwrap(),
        )
        .unwrap();
        let count: GetRuleCountResp = postcard::from_bytes(&resp_bytes).unwrap();
        assert_eq!(count.count, 1);
    }

    #[test]
    fn dispatch_rejects_garbage() {
        let store = test_store();
        let err = dispatch(&store, PfeCmd::GetRuleCount, &[0xFF, 0xFF]);
        assert!(matches!(err, Err(PfeError::DeserCmdReq(_))));
    }
}

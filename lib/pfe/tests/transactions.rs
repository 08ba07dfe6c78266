// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Integration tests driving the policy store through its request
//! surface, the way a config session and a dataplane would together.

use pfe::ExecCtx;
use pfe::PrintlnLog;
use pfe::pool::OpenNetworkView;
use pfe::store::PolicyStore;
use pfe_api::AddRuleReq;
use pfe_api::AddressFamily;
use pfe_api::ChangeOp;
use pfe_api::ChangeRuleReq;
use pfe_api::Direction;
use pfe_api::Endpoint;
use pfe_api::FlowKey;
use pfe_api::MatchSpec;
use pfe_api::PfeError;
use pfe_api::PoolAddressSpec;
use pfe_api::Protocol;
use pfe_api::RuleAction;
use pfe_api::RuleCategory;
use pfe_api::RuleSpec;
use pfe_api::StatePredicate;
use pfe_api::StateSpec;
use pfe_api::Ticket;
use pfe_api::TimeoutClass;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::thread;

const MAIN: &str = "";

fn test_store() -> PolicyStore {
    PolicyStore::new(
        ExecCtx { log: Box::new(PrintlnLog {}) },
        Box::new(OpenNetworkView {}),
        NonZeroU32::new(1024).unwrap(),
    )
}

fn pass_rule() -> RuleSpec {
    RuleSpec::new(RuleAction::Pass, MatchSpec::default())
}

fn add_req(ticket: Ticket, pool_ticket: Ticket, rule: RuleSpec) -> AddRuleReq {
    AddRuleReq {
        anchor: MAIN.to_string(),
        ruleset: MAIN.to_string(),
        category: RuleCategory::Filter,
        ticket,
        pool_ticket,
        rule,
    }
}

fn ep(addr: &str, port: u16) -> Endpoint {
    Endpoint::new(addr.parse().unwrap(), port)
}

fn natted_spec(store: &PolicyStore, rule: u64) -> StateSpec {
    StateSpec {
        proto: Protocol::TCP,
        af: AddressFamily::Inet,
        lan: ep("192.168.2.10", 37890),
        gwy: ep("203.0.113.1", 61000),
        ext: ep("76.76.21.21", 443),
        direction: Direction::Out,
        rule,
        nat_rule: Some(store.default_rule_id(RuleCategory::Nat)),
        timeout: TimeoutClass::TcpEstablished,
    }
}

// Commit a single-rule filter generation and return the id of the
// committed rule.
fn commit_one_pass_rule(store: &PolicyStore) -> u64 {
    let t = store.begin_rules(MAIN, MAIN, RuleCategory::Filter).unwrap();
    let pt = store.begin_staging();
    store.add_rule(&add_req(t, pt, pass_rule())).unwrap();
    store.commit_rules(MAIN, MAIN, RuleCategory::Filter, t).unwrap();
    store.get_rule(MAIN, MAIN, RuleCategory::Filter, 0).unwrap().id
}

#[test]
fn transaction_scenario() {
    let store = test_store();

    let t1 = store.begin_rules(MAIN, MAIN, RuleCategory::Filter).unwrap();
    let pt = store.begin_staging();
    store.add_rule(&add_req(t1, pt, pass_rule())).unwrap();

    // A ticket from nowhere is rejected and stages nothing.
    let pt2 = store.begin_staging();
    assert_eq!(
        store.add_rule(&add_req(t1 + 1, pt2, pass_rule())),
        Err(PfeError::StaleTicket)
    );

    store.commit_rules(MAIN, MAIN, RuleCategory::Filter, t1).unwrap();

    let (ticket, count) =
        store.get_rule_count(MAIN, MAIN, RuleCategory::Filter).unwrap();
    assert_eq!(ticket, t1);
    assert_eq!(count, 1);
}

#[test]
fn staged_pool_consumed_exactly_once() {
    let store = test_store();

    let t1 = store.begin_rules(MAIN, MAIN, RuleCategory::Nat).unwrap();
    let p1 = store.begin_staging();
    store
        .stage_address(
            p1,
            PoolAddressSpec::Cidr("203.0.113.0/28".parse().unwrap()),
        )
        .unwrap();

    let mut nat = RuleSpec::new(RuleAction::Nat, MatchSpec::default());
    nat.label = Some("outbound-nat".to_string());
    let mut req = add_req(t1, p1, nat.clone());
    req.category = RuleCategory::Nat;
    store.add_rule(&req).unwrap();

    // The pool moved into rule C; a second rule under the same pool
    // ticket must fail until a fresh staging transaction begins.
    let mut req = add_req(t1, p1, nat);
    req.category = RuleCategory::Nat;
    assert_eq!(store.add_rule(&req), Err(PfeError::StalePool));

    store.commit_rules(MAIN, MAIN, RuleCategory::Nat, t1).unwrap();
    let dump = store.get_rule(MAIN, MAIN, RuleCategory::Nat, 0).unwrap();
    assert_eq!(dump.pool, vec!["203.0.113.0/28".to_string()]);
}

#[test]
fn translation_rule_requires_pool() {
    let store = test_store();

    let t = store.begin_rules(MAIN, MAIN, RuleCategory::Redirect).unwrap();
    let pt = store.begin_staging();

    let mut req =
        add_req(t, pt, RuleSpec::new(RuleAction::Redirect, MatchSpec::default()));
    req.category = RuleCategory::Redirect;
    assert!(matches!(store.add_rule(&req), Err(PfeError::InvalidRule(_))));

    // The failure left the transaction intact.
    store.commit_rules(MAIN, MAIN, RuleCategory::Redirect, t).unwrap();
}

#[test]
fn commit_replaces_whole_generation() {
    let store = test_store();

    let first = commit_one_pass_rule(&store);

    // Build a two-rule generation; until commit the active queue is
    // still the old one.
    let t2 = store.begin_rules(MAIN, MAIN, RuleCategory::Filter).unwrap();
    let pt = store.begin_staging();
    store.add_rule(&add_req(t2, pt, pass_rule())).unwrap();
    let pt = store.begin_staging();
    store.add_rule(&add_req(t2, pt, pass_rule())).unwrap();

    let (_, count) =
        store.get_rule_count(MAIN, MAIN, RuleCategory::Filter).unwrap();
    assert_eq!(count, 1);

    store.commit_rules(MAIN, MAIN, RuleCategory::Filter, t2).unwrap();
    let (ticket, count) =
        store.get_rule_count(MAIN, MAIN, RuleCategory::Filter).unwrap();
    assert_eq!(ticket, t2);
    assert_eq!(count, 2);

    // The replaced rule had no states, so it is gone.
    assert_eq!(store.rule(first), Err(PfeError::RuleNotFound(first)));
}

#[test]
fn atomic_visibility_under_concurrent_reads() {
    let store = Arc::new(test_store());

    // Establish the first generation so readers never see an empty
    // queue.
    let t = store.begin_rules(MAIN, MAIN, RuleCategory::Filter).unwrap();
    let pt = store.begin_staging();
    store.add_rule(&add_req(t, pt, pass_rule())).unwrap();
    store.commit_rules(MAIN, MAIN, RuleCategory::Filter, t).unwrap();

    let reader_store = Arc::clone(&store);
    let reader = thread::spawn(move || {
        for _ in 0..2000 {
            let len = reader_store
                .with_active_rules(MAIN, MAIN, RuleCategory::Filter, |rules| {
                    rules.iter().count()
                })
                .unwrap();
            // Generations are 1 or 3 rules; a torn queue would show
            // up as any other length.
            assert!(len == 1 || len == 3, "partial queue visible: {len}");
        }
    });

    for i in 0..200 {
        let n = if i % 2 == 0 { 3 } else { 1 };
        let t = store.begin_rules(MAIN, MAIN, RuleCategory::Filter).unwrap();
        for _ in 0..n {
            let pt = store.begin_staging();
            store.add_rule(&add_req(t, pt, pass_rule())).unwrap();
        }
        store.commit_rules(MAIN, MAIN, RuleCategory::Filter, t).unwrap();
    }

    reader.join().unwrap();
}

#[test]
fn second_begin_cancels_first_writer() {
    let store = test_store();

    let t1 = store.begin_rules(MAIN, MAIN, RuleCategory::Filter).unwrap();
    let pt = store.begin_staging();
    store.add_rule(&add_req(t1, pt, pass_rule())).unwrap();

    let t2 = store.begin_rules(MAIN, MAIN, RuleCategory::Filter).unwrap();
    assert!(t2 > t1);

    // The first writer's edits are gone and its ticket is dead.
    assert_eq!(
        store.commit_rules(MAIN, MAIN, RuleCategory::Filter, t1),
        Err(PfeError::StaleTicket)
    );
    store.commit_rules(MAIN, MAIN, RuleCategory::Filter, t2).unwrap();
    let (_, count) =
        store.get_rule_count(MAIN, MAIN, RuleCategory::Filter).unwrap();
    assert_eq!(count, 0);
}

#[test]
fn change_rule_edits_active_queue() {
    let store = test_store();
    commit_one_pass_rule(&store);

    let (ticket, _) =
        store.get_rule_count(MAIN, MAIN, RuleCategory::Filter).unwrap();

    let mut head = pass_rule();
    head.label = Some("head".to_string());
    store
        .change_rule(&ChangeRuleReq {
            anchor: MAIN.to_string(),
            ruleset: MAIN.to_string(),
            category: RuleCategory::Filter,
            ticket,
            pool_ticket: None,
            op: ChangeOp::AddHead,
            index: None,
            rule: Some(head),
        })
        .unwrap();

    // The edit re-ticketed the queue: the old ticket is now stale.
    let stale = store.change_rule(&ChangeRuleReq {
        anchor: MAIN.to_string(),
        ruleset: MAIN.to_string(),
        category: RuleCategory::Filter,
        ticket,
        pool_ticket: None,
        op: ChangeOp::Remove,
        index: Some(0),
        rule: None,
    });
    assert_eq!(stale, Err(PfeError::StaleTicket));

    let (ticket, count) =
        store.get_rule_count(MAIN, MAIN, RuleCategory::Filter).unwrap();
    assert_eq!(count, 2);
    let first = store.get_rule(MAIN, MAIN, RuleCategory::Filter, 0).unwrap();
    assert_eq!(first.label.as_deref(), Some("head"));
    assert_eq!(first.nr, Some(0));

    store
        .change_rule(&ChangeRuleReq {
            anchor: MAIN.to_string(),
            ruleset: MAIN.to_string(),
            category: RuleCategory::Filter,
            ticket,
            pool_ticket: None,
            op: ChangeOp::Remove,
            index: Some(0),
            rule: None,
        })
        .unwrap();

    let (_, count) =
        store.get_rule_count(MAIN, MAIN, RuleCategory::Filter).unwrap();
    assert_eq!(count, 1);
    // Renumbering closed the gap.
    let first = store.get_rule(MAIN, MAIN, RuleCategory::Filter, 0).unwrap();
    assert_eq!(first.nr, Some(0));
    assert_eq!(first.label, None);
}

#[test]
fn rule_survives_while_states_reference_it() {
    let store = test_store();
    let rule_id = commit_one_pass_rule(&store);

    store.add_state(natted_spec(&store, rule_id)).unwrap();

    // Replace the generation; the old rule is unlinked but must stay
    // queryable because a live state references it.
    let t = store.begin_rules(MAIN, MAIN, RuleCategory::Filter).unwrap();
    store.commit_rules(MAIN, MAIN, RuleCategory::Filter, t).unwrap();

    let dump = store.rule(rule_id).unwrap();
    assert_eq!(dump.nr, None);
    assert_eq!(dump.states, 1);

    // Purging the state drops the last reference and the rule dies.
    let cleared = store.clear_states(&StatePredicate {
        rule: Some(rule_id),
        ..Default::default()
    });
    assert_eq!(cleared, 1);
    assert_eq!(store.rule(rule_id), Err(PfeError::RuleNotFound(rule_id)));
}

#[test]
fn state_dual_lookup_and_nat() {
    let store = test_store();
    let rule_id = commit_one_pass_rule(&store);
    store.add_state(natted_spec(&store, rule_id)).unwrap();

    let stack_key = FlowKey {
        proto: Protocol::TCP,
        af: AddressFamily::Inet,
        src: ep("192.168.2.10", 37890),
        dst: ep("76.76.21.21", 443),
    };
    let wire_key = FlowKey {
        proto: Protocol::TCP,
        af: AddressFamily::Inet,
        src: ep("76.76.21.21", 443),
        dst: ep("203.0.113.1", 61000),
    };

    // Both perspectives resolve to the same connection.
    let a = store.get_state(&stack_key).unwrap();
    let b = store.get_state(&wire_key).unwrap();
    assert_eq!(a.rule, b.rule);
    assert_eq!(a.lan, b.lan);

    // Outbound NAT rewrites the source; inbound rewrites the
    // destination back to the lan host.
    let out = store.nat_lookup(Direction::Out, &stack_key).unwrap();
    assert_eq!(out.src, ep("203.0.113.1", 61000));
    let inb = store.nat_lookup(Direction::In, &wire_key).unwrap();
    assert_eq!(inb.dst, ep("192.168.2.10", 37890));

    // Purge; both lookups now miss.
    store.clear_states(&StatePredicate::default());
    assert_eq!(store.get_state(&stack_key), Err(PfeError::StateNotFound));
    assert_eq!(store.get_state(&wire_key), Err(PfeError::StateNotFound));
    assert_eq!(
        store.nat_lookup(Direction::Out, &stack_key),
        Err(PfeError::StateNotFound)
    );
}

#[test]
fn duplicate_state_conflicts() {
    let store = test_store();
    let rule_id = commit_one_pass_rule(&store);

    store.add_state(natted_spec(&store, rule_id)).unwrap();
    let err = store.add_state(natted_spec(&store, rule_id));
    assert!(matches!(err, Err(PfeError::StateExists(_))));

    // The failed insert took no extra rule reference.
    assert_eq!(store.rule(rule_id).unwrap().states, 1);
}

#[test]
fn anchors_are_garbage_collected() {
    let store = test_store();

    let t = store
        .begin_rules("ftp-proxy", "client-a", RuleCategory::Filter)
        .unwrap();
    let pt = store.begin_staging();
    store
        .add_rule(&AddRuleReq {
            anchor: "ftp-proxy".to_string(),
            ruleset: "client-a".to_string(),
            category: RuleCategory::Filter,
            ticket: t,
            pool_ticket: pt,
            rule: pass_rule(),
        })
        .unwrap();
    store
        .commit_rules("ftp-proxy", "client-a", RuleCategory::Filter, t)
        .unwrap();
    assert!(store.list_anchors().contains(&"ftp-proxy".to_string()));

    // Committing an empty generation empties the ruleset, and the
    // lazy GC removes ruleset and anchor both.
    let t = store
        .begin_rules("ftp-proxy", "client-a", RuleCategory::Filter)
        .unwrap();
    store
        .commit_rules("ftp-proxy", "client-a", RuleCategory::Filter, t)
        .unwrap();
    assert!(!store.list_anchors().contains(&"ftp-proxy".to_string()));
    assert_eq!(
        store.list_rulesets("ftp-proxy"),
        Err(PfeError::AnchorNotFound("ftp-proxy".to_string()))
    );

    // The implicit top-level ruleset is exempt.
    let t = store.begin_rules(MAIN, MAIN, RuleCategory::Filter).unwrap();
    store.commit_rules(MAIN, MAIN, RuleCategory::Filter, t).unwrap();
    assert!(store.list_anchors().contains(&MAIN.to_string()));
}

#[test]
fn expiry_releases_rule_refs() {
    let store = test_store();
    let rule_id = commit_one_pass_rule(&store);

    let mut spec = natted_spec(&store, rule_id);
    spec.timeout = TimeoutClass::IcmpFirstPacket;
    store.add_state(spec).unwrap();
    assert_eq!(store.rule(rule_id).unwrap().states, 1);

    // Nothing is due yet.
    assert_eq!(store.expire_states(), 0);

    // Drive the clock past the icmp.first TTL.
    let later = pfe::time::Moment::now()
        + core::time::Duration::from_secs(21);
    assert_eq!(store.expire_states_at(later), 1);
    assert_eq!(store.rule(rule_id).unwrap().states, 0);
    assert_eq!(store.num_states(), 0);
}

#[test]
fn accounting_reflects_into_rules() {
    let store = test_store();
    let rule_id = commit_one_pass_rule(&store);
    store.add_state(natted_spec(&store, rule_id)).unwrap();

    let stack_key = FlowKey {
        proto: Protocol::TCP,
        af: AddressFamily::Inet,
        src: ep("192.168.2.10", 37890),
        dst: ep("76.76.21.21", 443),
    };
    store.account(Direction::Out, &stack_key, 3, 4500).unwrap();

    let dump = store.rule(rule_id).unwrap();
    assert_eq!(dump.packets, [0, 3]);
    assert_eq!(dump.bytes, [0, 4500]);

    let state = store.get_state(&stack_key).unwrap();
    assert_eq!(state.packets, [0, 3]);
    assert_eq!(state.bytes, [0, 4500]);
}

#[test]
fn evaluator_sees_default_rule() {
    let store = test_store();

    store
        .with_active_rules(MAIN, MAIN, RuleCategory::Filter, |rules| {
            assert!(rules.is_empty());
            assert_eq!(rules.default_rule().action(), RuleAction::Pass);
        })
        .unwrap();
}

#[test]
fn tags_flow_through_rules() {
    let store = test_store();

    let t = store.begin_rules(MAIN, MAIN, RuleCategory::Filter).unwrap();
    let pt = store.begin_staging();
    let mut rule = pass_rule();
    rule.tag = Some("staging-net".to_string());
    store.add_rule(&add_req(t, pt, rule)).unwrap();
    store.commit_rules(MAIN, MAIN, RuleCategory::Filter, t).unwrap();

    let dump = store.get_rule(MAIN, MAIN, RuleCategory::Filter, 0).unwrap();
    assert_eq!(dump.tag.as_deref(), Some("staging-net"));

    // Replacing the generation releases the tag reference.
    let t = store.begin_rules(MAIN, MAIN, RuleCategory::Filter).unwrap();
    store.commit_rules(MAIN, MAIN, RuleCategory::Filter, t).unwrap();
    let (_, count) =
        store.get_rule_count(MAIN, MAIN, RuleCategory::Filter).unwrap();
    assert_eq!(count, 0);
}

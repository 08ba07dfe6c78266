// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print command responses in a human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both an admin front-end and integration tests.

use itertools::Itertools;
use pfe_api::ListAnchorsResp;
use pfe_api::ListStatesResp;
use pfe_api::RuleDump;
use pfe_api::StateDump;
use std::io::Write;
use tabwriter::TabWriter;

/// Print a list of rules in evaluation order.
pub fn print_rules(rules: &[RuleDump]) -> std::io::Result<()> {
    print_rules_into(&mut std::io::stdout(), rules)
}

/// Print a list of rules in evaluation order.
pub fn print_rules_into(
    writer: &mut impl Write,
    rules: &[RuleDump],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(
        t,
        "NR\tID\tACTION\tMATCH\tTAG\tPOOL\tSTATES\tPKTS IN/OUT\tBYTES IN/OUT"
    )?;
    for rule in rules {
        print_rule(&mut t, rule)?;
    }
    t.flush()
}

fn print_rule(
    t: &mut TabWriter<&mut impl Write>,
    rule: &RuleDump,
) -> std::io::Result<()> {
    let nr = match rule.nr {
        Some(nr) => nr.to_string(),
        None => "-".to_string(),
    };

    writeln!(
        t,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}/{}\t{}/{}",
        nr,
        rule.id,
        rule.action,
        rule.match_spec,
        rule.tag.as_deref().unwrap_or("-"),
        if rule.pool.is_empty() {
            "-".to_string()
        } else {
            rule.pool.iter().join(",")
        },
        rule.states,
        rule.packets[0],
        rule.packets[1],
        rule.bytes[0],
        rule.bytes[1],
    )
}

/// Print the tracked connections.
pub fn print_states(resp: &ListStatesResp) -> std::io::Result<()> {
    print_states_into(&mut std::io::stdout(), resp)
}

/// Print the tracked connections.
pub fn print_states_into(
    writer: &mut impl Write,
    resp: &ListStatesResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "PROTO\tLAN\tGWY\tEXT\tDIR\tAGE\tTIMEOUT\tRULE")?;
    for state in &resp.states {
        print_state(&mut t, state)?;
    }
    t.flush()
}

fn print_state(
    t: &mut TabWriter<&mut impl Write>,
    state: &StateDump,
) -> std::io::Result<()> {
    writeln!(
        t,
        "{}\t{}\t{}\t{}\t{}\t{}s\t{}\t{}",
        state.proto,
        state.lan,
        state.gwy,
        state.ext,
        state.direction,
        state.age_secs,
        state.timeout,
        state.rule,
    )
}

/// Print the anchor namespace.
pub fn print_anchors(resp: &ListAnchorsResp) -> std::io::Result<()> {
    print_anchors_into(&mut std::io::stdout(), resp)
}

/// Print the anchor namespace.
pub fn print_anchors_into(
    writer: &mut impl Write,
    resp: &ListAnchorsResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "ANCHOR")?;
    for anchor in &resp.anchors {
        // The implicit top-level anchor has the empty name; render
        // it the way an administrator refers to it.
        let name = if anchor.is_empty() { "*" } else { anchor };
        writeln!(t, "{}", name)?;
    }
    t.flush()
}

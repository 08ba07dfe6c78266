// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The policy engine: the control plane of a stateful packet
//! filter/NAT dataplane.
//!
//! The engine owns everything the dataplane's classification path
//! reads but never writes: the anchor/ruleset namespace, the
//! double-buffered rule queues and their transaction tickets, the
//! staged NAT address pools, the interned tag namespace, and the
//! dual-keyed connection table. All of it hangs off a single
//! [`store::PolicyStore`] value which is passed by reference into
//! every operation; there is no ambient global state.
//!
//! The request surface (the types in `pfe-api` plus the handlers in
//! [`ioctl`]) is synchronous and non-reentrant: one request runs to
//! completion inside short critical sections, while the packet path
//! concurrently takes read guards on the active queues and the
//! connection table.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

use core::fmt;
use core::fmt::Display;

pub use pfe_api as api;

pub mod anchor;
pub mod ioctl;
pub mod pool;
pub mod print;
pub mod queue;
pub mod rule;
pub mod ruleset;
pub mod state;
pub mod store;
pub mod sync;
pub mod tag;
pub mod time;

/// A logging provider provides the means to log messages to some
/// destination based on the context in which the engine is running.
/// For example, in a unit test this could map to `println!`, while a
/// production host would hand the message to its logging pipeline.
///
/// Logging levels are provided by [`LogLevel`]. These levels will map
/// to the underlying provider with varying degrees of success.
pub trait LogProvider: Send + Sync {
    /// Log a message at the specified level.
    fn log(&self, level: LogLevel, msg: &str);
}

#[derive(Clone, Copy, Debug)]
pub enum LogLevel {
    Note,
    Warn,
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let level_s = match self {
            Self::Note => "[NOTE]",
            Self::Warn => "[WARN]",
            Self::Error => "[ERROR]",
        };
        write!(f, "{}", level_s)
    }
}

#[derive(Clone, Copy)]
pub struct PrintlnLog {}

impl LogProvider for PrintlnLog {
    fn log(&self, level: LogLevel, msg: &str) {
        println!("{} {}", level, msg);
    }
}

/// The execution context of the engine: the features whose
/// implementation depends on the host the engine is embedded in.
pub struct ExecCtx {
    pub log: Box<dyn LogProvider>,
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! NAT/redirect address pools and their staging protocol.
//!
//! Pool entries are staged one by one under a pool ticket and then
//! moved, as a whole, into the rule that consumes them. The staged
//! list is consumed at most once: a successful move invalidates the
//! ticket, so a second rule cannot silently reuse addresses it was
//! never given.

use pfe_api::PfeError;
use pfe_api::PoolAddressSpec;
use pfe_api::Ticket;

/// What the engine needs to know about the network it polices.
///
/// Pool entries may name interfaces and external address tables; the
/// engine validates the names exist but never resolves or evaluates
/// them. That is the dataplane's business.
pub trait NetworkView: Send + Sync {
    fn has_interface(&self, name: &str) -> bool;
    fn has_table(&self, name: &str) -> bool;
}

/// A view that accepts every name. Useful for tests and for hosts
/// that defer name resolution entirely to the dataplane.
pub struct OpenNetworkView {}

impl NetworkView for OpenNetworkView {
    fn has_interface(&self, _name: &str) -> bool {
        true
    }

    fn has_table(&self, _name: &str) -> bool {
        true
    }
}

/// An ordered list of candidate translation addresses.
///
/// The order is the order the administrator staged them in; the
/// selection policy (round-robin, hash, random) lives in the
/// dataplane and operates over that order via the cursor.
#[derive(Debug, Default, PartialEq)]
pub struct AddressPool {
    entries: Vec<PoolAddressSpec>,
    cursor: usize,
}

impl AddressPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: PoolAddressSpec) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[PoolAddressSpec] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Advance the cursor one entry, wrapping, and return the entry
    /// it pointed at.
    pub fn advance(&mut self) -> Option<&PoolAddressSpec> {
        if self.entries.is_empty() {
            return None;
        }

        let idx = self.cursor;
        self.cursor = (self.cursor + 1) % self.entries.len();
        Some(&self.entries[idx])
    }

    /// Move the entries out, leaving this pool empty.
    pub fn take(&mut self) -> AddressPool {
        core::mem::take(self)
    }

    /// Release all entries, e.g. when the owning rule is unlinked.
    pub fn flush(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }
}

/// The staging area addresses pass through on their way into a rule.
#[derive(Debug, Default)]
pub struct PoolStaging {
    ticket: Ticket,
    pool: AddressPool,
}

impl PoolStaging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a fresh staging transaction under `ticket`, discarding
    /// anything a previous transaction staged but never consumed.
    pub fn begin(&mut self, ticket: Ticket) -> Ticket {
        self.pool = AddressPool::new();
        self.ticket = ticket;
        ticket
    }

    /// Append one entry to the staged list.
    ///
    /// # Errors
    ///
    /// `StalePool` if `ticket` is not the current staging generation;
    /// `InvalidRule` if the entry names an interface or table the
    /// network has never heard of.
    pub fn stage(
        &mut self,
        ticket: Ticket,
        entry: PoolAddressSpec,
        net: &dyn NetworkView,
    ) -> Result<(), PfeError> {
        if ticket != self.ticket {
            return Err(PfeError::StalePool);
        }

        match &entry {
            PoolAddressSpec::Interface(name) => {
                if !net.has_interface(name) {
                    return Err(PfeError::InvalidRule(format!(
                        "unknown interface: {name}"
                    )));
                }
            }

            PoolAddressSpec::Table(name) => {
                if !net.has_table(name) {
                    return Err(PfeError::InvalidRule(format!(
                        "unknown table: {name}"
                    )));
                }
            }

            PoolAddressSpec::Cidr(_) => (),
        }

        self.pool.push(entry);
        Ok(())
    }

    /// The number of entries currently staged under `ticket`, without
    /// consuming them.
    pub fn staged_len(&self, ticket: Ticket) -> Result<usize, PfeError> {
        if ticket != self.ticket {
            return Err(PfeError::StalePool);
        }
        Ok(self.pool.len())
    }

    /// Consume the staged list, invalidating the ticket.
    ///
    /// Ticket 0 is never issued, so resetting to it guarantees the
    /// next `take` or `stage` fails until a new `begin`.
    pub fn take(&mut self, ticket: Ticket) -> Result<AddressPool, PfeError> {
        if ticket != self.ticket {
            return Err(PfeError::StalePool);
        }

        self.ticket = 0;
        Ok(self.pool.take())
    }
}

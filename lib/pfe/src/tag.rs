// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The interned tag namespace.
//!
//! Administrators label rules and packets with free-form strings; the
//! dataplane only ever carries the small integer a string interns to.
//! Ids live in a bounded space, so allocation always picks the lowest
//! free id rather than counting monotonically; releasing the last
//! reference to a tag returns its id for reuse.

use pfe_api::PfeError;
use std::collections::BTreeMap;

/// The highest id the namespace will allocate. Id 0 is reserved to
/// mean "untagged" and is never allocated.
pub const TAG_ID_MAX: u16 = 50_000;

pub type TagId = u16;

#[derive(Debug)]
struct TagEntry {
    name: String,
    refs: u32,
}

#[derive(Debug)]
pub struct TagTable {
    entries: BTreeMap<TagId, TagEntry>,
    max: TagId,
}

impl TagTable {
    pub fn new() -> Self {
        Self::with_max(TAG_ID_MAX)
    }

    /// A table with a smaller id space, for exercising exhaustion.
    pub fn with_max(max: TagId) -> Self {
        Self { entries: BTreeMap::new(), max }
    }

    /// Intern `name`, returning its id.
    ///
    /// An existing tag gains a reference; a new tag takes the lowest
    /// free id.
    ///
    /// # Errors
    ///
    /// `BadName` for the empty string, `TagSpaceExhausted` when every
    /// id in `1..=max` is taken.
    pub fn intern(&mut self, name: &str) -> Result<TagId, PfeError> {
        if name.is_empty() {
            return Err(PfeError::BadName);
        }

        let existing = self
            .entries
            .iter()
            .find(|(_, entry)| entry.name == name)
            .map(|(id, _)| *id);

        if let Some(id) = existing {
            let entry = self.entries.get_mut(&id).unwrap();
            entry.refs += 1;
            return Ok(id);
        }

        // The keys iterate in ascending order, so the first key that
        // doesn't match the running candidate marks a gap.
        let mut id: TagId = 1;
        for existing in self.entries.keys() {
            if *existing == id {
                id += 1;
            } else {
                break;
            }
        }

        if id > self.max {
            return Err(PfeError::TagSpaceExhausted);
        }

        self.entries.insert(id, TagEntry { name: name.to_string(), refs: 1 });
        Ok(id)
    }

    /// Drop one reference to `id`, destroying the tag at zero.
    ///
    /// Releasing an unknown id is a no-op; the caller may be tearing
    /// down a rule whose tags were already flushed.
    pub fn release(&mut self, id: TagId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.refs -= 1;
            if entry.refs == 0 {
                self.entries.remove(&id);
            }
        }
    }

    /// The name interned under `id`, if any.
    pub fn name(&self, id: TagId) -> Option<&str> {
        self.entries.get(&id).map(|e| e.name.as_str())
    }

    /// The id `name` is interned under, without taking a reference.
    pub fn id(&self, name: &str) -> Option<TagId> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.name == name)
            .map(|(id, _)| *id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TagTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn intern_is_refcounted() {
        let mut tags = TagTable::new();
        let id = tags.intern("dmz").unwrap();
        assert_eq!(tags.intern("dmz").unwrap(), id);
        assert_eq!(tags.len(), 1);

        tags.release(id);
        assert_eq!(tags.name(id), Some("dmz"));
        tags.release(id);
        assert_eq!(tags.name(id), None);
        assert!(tags.is_empty());
    }

    #[test]
    fn lowest_free_id_wins() {
        let mut tags = TagTable::new();
        let a = tags.intern("a").unwrap();
        let b = tags.intern("b").unwrap();
        let c = tags.intern("c").unwrap();
        assert_eq!((a, b, c), (1, 2, 3));

        // Freeing `b` makes id 2 the lowest gap; a new name must take
        // it before any higher id is used.
        tags.release(b);
        assert_eq!(tags.intern("d").unwrap(), 2);
        assert_eq!(tags.intern("e").unwrap(), 4);
    }

    #[test]
    fn bounded_space() {
        let mut tags = TagTable::with_max(2);
        tags.intern("a").unwrap();
        tags.intern("b").unwrap();
        assert_eq!(tags.intern("c"), Err(PfeError::TagSpaceExhausted));

        // An existing name still interns fine when full.
        assert_eq!(tags.intern("a").unwrap(), 1);
    }

    #[test]
    fn empty_name_rejected() {
        let mut tags = TagTable::new();
        assert_eq!(tags.intern(""), Err(PfeError::BadName));
    }

    #[test]
    fn zero_never_allocated() {
        let mut tags = TagTable::new();
        assert_eq!(tags.intern("first").unwrap(), 1);
    }
}

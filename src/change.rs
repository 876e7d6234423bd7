//! Change detection between the previous build and the current corpus scan.
//!
//! A document's state is summarised by its [`Fingerprint`] (size and mtime).
//! Fingerprints are compared for exact equality: any difference, including
//! an mtime that moved backwards, counts as a change. Contents are never
//! read here.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{DocumentFile, Fingerprint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Unchanged,
    Changed,
    New,
    Removed,
}

/// Per-key classification, ordered by document key.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub entries: BTreeMap<String, ChangeKind>,
}

impl ChangeSet {
    pub fn keys_of(&self, kind: ChangeKind) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(move |(_, k)| **k == kind)
            .map(|(key, _)| key.as_str())
    }

    pub fn count(&self, kind: ChangeKind) -> usize {
        self.entries.values().filter(|k| **k == kind).count()
    }

    pub fn kind_of(&self, key: &str) -> Option<ChangeKind> {
        self.entries.get(key).copied()
    }

    /// Keep a recorded document that the scan could not see (unreadable
    /// path) instead of removing it. Returns whether `key` was held.
    pub fn hold(&mut self, key: &str) -> bool {
        match self.entries.get_mut(key) {
            Some(kind @ ChangeKind::Removed) => {
                *kind = ChangeKind::Unchanged;
                true
            }
            _ => false,
        }
    }

    /// True when nothing was added, changed or removed.
    pub fn is_noop(&self) -> bool {
        self.entries.values().all(|k| *k == ChangeKind::Unchanged)
    }
}

/// Classify every key that is either recorded in `previous` or present in
/// `current`.
pub fn classify(previous: &BTreeMap<String, Fingerprint>, current: &[DocumentFile]) -> ChangeSet {
    let mut entries = BTreeMap::new();
    let mut seen = BTreeSet::new();

    for doc in current {
        seen.insert(doc.key.as_str());
        let kind = match previous.get(&doc.key) {
            None => ChangeKind::New,
            Some(fp) if *fp == doc.fingerprint => ChangeKind::Unchanged,
            Some(_) => ChangeKind::Changed,
        };
        entries.insert(doc.key.clone(), kind);
    }

    for key in previous.keys() {
        if !seen.contains(key.as_str()) {
            entries.insert(key.clone(), ChangeKind::Removed);
        }
    }

    ChangeSet { entries }
}

//! Name-merge algebra shared by value and subkey enumeration.
//!
//! Local overlay names are added first (their relative order is preserved),
//! tombstoned names build a shadow set, and real-registry names are accepted
//! only when they collide with neither. The final view is sorted
//! case-insensitively; the sort is stable, so overlay rows keep their order
//! among case-equal names.

use std::collections::HashSet;

use crate::keypath::case_fold;

#[derive(Default)]
pub struct NameMerge {
    names: Vec<String>,
    seen: HashSet<String>,
    deleted: HashSet<String>,
}

impl NameMerge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an overlay row. Tombstoned names are never emitted but
    /// shadow any real entry with the same folded name.
    pub fn add_local(&mut self, name: &str, is_deleted: bool) {
        let folded = case_fold(name);
        if is_deleted {
            self.deleted.insert(folded.clone());
            self.seen.insert(folded);
            return;
        }
        if self.seen.insert(folded) {
            self.names.push(name.to_string());
        }
    }

    /// Offers a real-registry name. Suppressed when a local row (live or
    /// tombstoned) already claimed the folded name. Returns whether the name
    /// was accepted.
    pub fn add_real(&mut self, name: &str) -> bool {
        let folded = case_fold(name);
        if self.deleted.contains(&folded) || !self.seen.insert(folded) {
            return false;
        }
        self.names.push(name.to_string());
        true
    }

    /// The merged view, sorted case-insensitively ascending.
    pub fn into_sorted(mut self) -> Vec<String> {
        self.names.sort_by_key(|n| case_fold(n));
        self.names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_tombstones_shadow_real_names() {
        let mut merge = NameMerge::new();
        merge.add_local("Gone", true);
        merge.add_local("Kept", false);
        assert!(!merge.add_real("gone"));
        assert!(merge.add_real("RealOnly"));
        assert_eq!(merge.into_sorted(), vec!["Kept", "RealOnly"]);
    }

    #[test]
    fn case_folded_names_appear_exactly_once_with_local_spelling() {
        let mut merge = NameMerge::new();
        merge.add_local("V", false);
        assert!(!merge.add_real("v"));
        assert_eq!(merge.into_sorted(), vec!["V"]);
    }

    #[test]
    fn result_is_sorted_case_insensitively() {
        let mut merge = NameMerge::new();
        merge.add_local("beta", false);
        merge.add_local("Alpha", false);
        merge.add_real("CHARLIE");
        assert_eq!(merge.into_sorted(), vec!["Alpha", "beta", "CHARLIE"]);
    }

    #[test]
    fn duplicate_local_names_collapse() {
        let mut merge = NameMerge::new();
        merge.add_local("Name", false);
        merge.add_local("NAME", false);
        assert_eq!(merge.into_sorted(), vec!["Name"]);
    }
}

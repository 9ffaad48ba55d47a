//! Relationship collection diffing.
//!
//! Sub-collections such as policy assignments have no identity the client
//! knows at plan time. [`diff`] pairs desired records with observed ones by
//! server id when the desired side has one, and by a caller-supplied key
//! otherwise, then emits the minimal create/update/delete plan. It never
//! talks to the remote system and cannot fail.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

use serde::Serialize;

/// Records that may carry a server-assigned identity.
pub trait Identified {
    fn id(&self) -> Option<&str>;
}

/// A relationship record with its own matching key and payload equality.
pub trait Relationship: Identified {
    type Key: Eq + Hash + Clone;

    /// Key used to pair records that lack a known identity.
    fn key(&self) -> Self::Key;

    /// Whether two records already agree, ignoring identity.
    fn same_payload(&self, other: &Self) -> bool;
}

/// Ids that look like an identity but are not one: blank strings and the
/// nil UUID.
pub fn is_placeholder_id(id: &str) -> bool {
    let id = id.trim();
    id.is_empty() || uuid::Uuid::parse_str(id).is_ok_and(|u| u.is_nil())
}

/// The record's identity, unless it is missing or a placeholder.
pub fn known_id<R: Identified + ?Sized>(record: &R) -> Option<&str> {
    record.id().filter(|id| !is_placeholder_id(id))
}

/// A desired record paired with the observed record it replaces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedUpdate<R> {
    pub desired: R,
    pub observed: R,
}

impl<R: Identified> PlannedUpdate<R> {
    /// Server id the update must be addressed to.
    pub fn id(&self) -> Option<&str> {
        known_id(&self.observed)
    }
}

/// Operations that bring the observed collection to the desired one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationPlan<R, K> {
    pub to_create: Vec<R>,
    pub to_update: Vec<PlannedUpdate<R>>,
    pub to_delete: Vec<R>,
    /// Desired records already matched by an equal observed record.
    pub unchanged: usize,
    /// Keys that occur on more than one desired record. They are planned
    /// as-is; the caller decides whether that is an authoring mistake.
    pub duplicate_keys: Vec<K>,
}

impl<R, K> OperationPlan<R, K> {
    /// No remote operation is needed.
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    pub fn operation_count(&self) -> usize {
        self.to_create.len() + self.to_update.len() + self.to_delete.len()
    }
}

impl<R, K> Default for OperationPlan<R, K> {
    fn default() -> Self {
        Self {
            to_create: Vec::new(),
            to_update: Vec::new(),
            to_delete: Vec::new(),
            unchanged: 0,
            duplicate_keys: Vec::new(),
        }
    }
}

/// Diff `desired` against `observed`.
///
/// Matching runs in two passes. Desired records with a known id claim the
/// observed record with the same id first. The rest claim observed records
/// by `key`, in observed order, so duplicate keys pair up positionally.
/// A matched pair becomes an update when `equals` says they differ.
/// Observed records nobody claimed are deleted.
pub fn diff<R, K, KF, EF>(
    desired: Vec<R>,
    observed: Vec<R>,
    key: KF,
    equals: EF,
) -> OperationPlan<R, K>
where
    R: Identified,
    K: Eq + Hash + Clone,
    KF: Fn(&R) -> K,
    EF: Fn(&R, &R) -> bool,
{
    let duplicate_keys = duplicates(desired.iter().map(&key));

    let mut by_id: HashMap<String, usize> = HashMap::new();
    let mut by_key: HashMap<K, VecDeque<usize>> = HashMap::new();
    for (idx, record) in observed.iter().enumerate() {
        if let Some(id) = known_id(record) {
            by_id.entry(id.to_string()).or_insert(idx);
        }
        by_key.entry(key(record)).or_default().push_back(idx);
    }
    let mut slots: Vec<Option<R>> = observed.into_iter().map(Some).collect();

    // Pass one: identity matches.
    let mut matched: Vec<Option<usize>> = desired
        .iter()
        .map(|d| by_id.get(known_id(d)?).copied())
        .collect();
    let mut claimed: HashSet<usize> = matched.iter().flatten().copied().collect();
    // Two desired records naming the same id: only the first keeps it.
    let mut seen = HashSet::new();
    for m in matched.iter_mut() {
        if let Some(idx) = *m {
            if !seen.insert(idx) {
                *m = None;
            }
        }
    }

    // Pass two: key matches for the rest. Two known ids that differ name
    // different records, so such a pair never matches by key.
    for (d, m) in desired.iter().zip(matched.iter_mut()) {
        if m.is_some() {
            continue;
        }
        let Some(queue) = by_key.get_mut(&key(d)) else {
            continue;
        };
        let wanted = known_id(d);
        queue.retain(|idx| !claimed.contains(idx));
        let pos = queue.iter().position(|&idx| {
            let have = slots[idx].as_ref().and_then(|o| known_id(o));
            wanted.is_none() || have.is_none() || wanted == have
        });
        if let Some(idx) = pos.and_then(|p| queue.remove(p)) {
            claimed.insert(idx);
            *m = Some(idx);
        }
    }

    let mut plan = OperationPlan {
        duplicate_keys,
        ..OperationPlan::default()
    };
    for (d, m) in desired.into_iter().zip(matched) {
        match m.and_then(|idx| slots[idx].take()) {
            None => plan.to_create.push(d),
            Some(o) if equals(&d, &o) => plan.unchanged += 1,
            Some(o) => plan.to_update.push(PlannedUpdate {
                desired: d,
                observed: o,
            }),
        }
    }
    plan.to_delete = slots.into_iter().flatten().collect();
    plan
}

/// [`diff`] using the record's own [`Relationship`] key and equality.
pub fn diff_relationships<R: Relationship>(
    desired: Vec<R>,
    observed: Vec<R>,
) -> OperationPlan<R, R::Key> {
    diff(desired, observed, R::key, R::same_payload)
}

fn duplicates<K: Eq + Hash + Clone>(keys: impl Iterator<Item = K>) -> Vec<K> {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    let mut out = Vec::new();
    for k in keys {
        if !seen.insert(k.clone()) && reported.insert(k.clone()) {
            out.push(k);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Rec {
        id: Option<String>,
        target: String,
        mode: u8,
    }

    impl Identified for Rec {
        fn id(&self) -> Option<&str> {
            self.id.as_deref()
        }
    }

    impl Relationship for Rec {
        type Key = String;

        fn key(&self) -> String {
            self.target.clone()
        }

        fn same_payload(&self, other: &Self) -> bool {
            self.target == other.target && self.mode == other.mode
        }
    }

    fn want(target: &str) -> Rec {
        Rec {
            id: None,
            target: target.into(),
            mode: 0,
        }
    }

    fn have(id: &str, target: &str) -> Rec {
        Rec {
            id: Some(id.into()),
            target: target.into(),
            mode: 0,
        }
    }

    #[test]
    fn test_unmatched_observed_is_deleted() {
        let plan = diff_relationships(vec![want("A")], vec![have("1", "A"), have("2", "B")]);
        assert!(plan.to_create.is_empty());
        assert!(plan.to_update.is_empty());
        assert_eq!(plan.to_delete, vec![have("2", "B")]);
        assert_eq!(plan.unchanged, 1);
    }

    #[test]
    fn test_changed_payload_is_update_with_observed_id() {
        let mut desired = want("A");
        desired.mode = 1;
        let plan = diff_relationships(vec![desired.clone()], vec![have("1", "A")]);
        assert_eq!(plan.to_update.len(), 1);
        assert_eq!(plan.to_update[0].id(), Some("1"));
        assert_eq!(plan.to_update[0].desired, desired);
    }

    #[test]
    fn test_identity_match_wins_over_key() {
        // Desired record 2 moved from B to A; record 1 still targets A.
        let mut moved = have("2", "A");
        moved.mode = 1;
        let plan = diff_relationships(
            vec![want("A"), moved.clone()],
            vec![have("1", "A"), have("2", "B")],
        );
        assert_eq!(plan.unchanged, 1);
        assert_eq!(plan.to_update.len(), 1);
        assert_eq!(plan.to_update[0].id(), Some("2"));
        assert!(plan.to_delete.is_empty());
        assert!(plan.to_create.is_empty());
    }

    #[test]
    fn test_different_known_ids_never_match_by_key() {
        let plan = diff_relationships(vec![have("1", "A")], vec![have("2", "A")]);
        assert_eq!(plan.unchanged, 0);
        assert!(plan.to_update.is_empty());
        assert_eq!(plan.to_create, vec![have("1", "A")]);
        assert_eq!(plan.to_delete, vec![have("2", "A")]);
    }

    #[test]
    fn test_known_id_skips_to_compatible_observed() {
        // The first "A" belongs to someone else; the anonymous one is free.
        let anonymous = Rec { id: None, ..want("A") };
        let plan = diff_relationships(
            vec![have("1", "A"), want("A")],
            vec![have("2", "A"), anonymous],
        );
        assert_eq!(plan.unchanged, 2);
        assert!(plan.to_create.is_empty());
        assert!(plan.to_delete.is_empty());
    }

    #[test]
    fn test_duplicate_keys_are_reported_not_collapsed() {
        let plan = diff_relationships(vec![want("A"), want("A"), want("B")], vec![have("1", "A")]);
        assert_eq!(plan.duplicate_keys, vec!["A".to_string()]);
        assert_eq!(plan.unchanged, 1);
        assert_eq!(plan.to_create, vec![want("A"), want("B")]);
    }

    #[test]
    fn test_placeholder_ids() {
        assert!(is_placeholder_id(""));
        assert!(is_placeholder_id("  "));
        assert!(is_placeholder_id("00000000-0000-0000-0000-000000000000"));
        assert!(!is_placeholder_id("3f2b8c1e-9a4d-4e7b-8f21-0c6d5a9e1b47"));
        assert!(!is_placeholder_id("1"));

        let nil = have("00000000-0000-0000-0000-000000000000", "A");
        assert_eq!(known_id(&nil), None);
    }

    #[test]
    fn test_placeholder_id_falls_back_to_key() {
        let desired = Rec {
            id: Some(String::new()),
            ..want("A")
        };
        let plan = diff_relationships(vec![desired], vec![have("7", "A")]);
        assert_eq!(plan.unchanged, 1);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_empty_inputs() {
        let plan = diff_relationships(Vec::<Rec>::new(), Vec::new());
        assert!(plan.is_empty());
        assert_eq!(plan.operation_count(), 0);
    }

    fn targets() -> impl Strategy<Value = Vec<(u8, u8)>> {
        proptest::collection::vec((0u8..12, 0u8..3), 0..10)
    }

    fn as_desired(raw: &[(u8, u8)]) -> Vec<Rec> {
        raw.iter()
            .map(|(t, m)| Rec {
                id: None,
                target: format!("g{t}"),
                mode: *m,
            })
            .collect()
    }

    fn as_observed(raw: &[(u8, u8)]) -> Vec<Rec> {
        raw.iter()
            .enumerate()
            .map(|(i, (t, m))| Rec {
                id: Some(format!("id-{i}")),
                target: format!("g{t}"),
                mode: *m,
            })
            .collect()
    }

    /// Desired records, some carrying ids that may or may not exist remotely.
    fn identified() -> impl Strategy<Value = Vec<(u8, u8, Option<u8>)>> {
        proptest::collection::vec((0u8..12, 0u8..3, proptest::option::of(0u8..12)), 0..10)
    }

    fn as_identified(raw: &[(u8, u8, Option<u8>)]) -> Vec<Rec> {
        raw.iter()
            .map(|(t, m, id)| Rec {
                id: id.map(|i| format!("id-{i}")),
                target: format!("g{t}"),
                mode: *m,
            })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_every_desired_record_lands_once(
            d in identified(),
            o in targets(),
        ) {
            let desired = as_identified(&d);
            let observed = as_observed(&o);
            let plan = diff_relationships(desired.clone(), observed.clone());

            prop_assert_eq!(
                plan.to_create.len() + plan.to_update.len() + plan.unchanged,
                desired.len()
            );
            let matched = plan.to_update.len() + plan.unchanged;
            prop_assert_eq!(plan.to_delete.len(), observed.len() - matched);

            for update in &plan.to_update {
                if let Some(id) = known_id(&update.desired) {
                    prop_assert_eq!(update.id(), Some(id));
                }
            }
        }

        #[test]
        fn prop_unique_keys_match_by_target(
            d in proptest::collection::btree_map(0u8..12, 0u8..3, 0..10),
            o in proptest::collection::btree_map(0u8..12, 0u8..3, 0..10),
        ) {
            let d: Vec<_> = d.into_iter().collect();
            let o: Vec<_> = o.into_iter().collect();
            let plan = diff_relationships(as_desired(&d), as_observed(&o));

            let desired_targets: HashSet<u8> = d.iter().map(|(t, _)| *t).collect();
            let observed_targets: HashSet<u8> = o.iter().map(|(t, _)| *t).collect();
            let expected_deletes = o.iter().filter(|(t, _)| !desired_targets.contains(t)).count();
            let expected_creates = d.iter().filter(|(t, _)| !observed_targets.contains(t)).count();

            prop_assert_eq!(plan.to_delete.len(), expected_deletes);
            prop_assert_eq!(plan.to_create.len(), expected_creates);
            prop_assert!(plan.duplicate_keys.is_empty());
        }

        #[test]
        fn prop_diff_against_itself_is_empty(o in targets()) {
            let observed = as_observed(&o);
            let plan = diff_relationships(observed.clone(), observed.clone());
            prop_assert!(plan.is_empty());

            let anonymous = as_desired(&o);
            let plan = diff_relationships(anonymous, observed);
            prop_assert!(plan.is_empty());
        }
    }
}

//! Explicit membership reconciliation.
//!
//! Replacing the members of a collection (e.g. the assignees of an issue, the
//! labels of a pull request) is expressed as a diff against the desired set:
//! removals are applied first, then additions, and a single
//! [`MembershipReplaced`] notification describes the outcome. Callers never
//! observe an intermediate "cleared" state.

use std::collections::BTreeSet;

/// Receives the individual membership changes computed by [`reconcile_members`].
pub trait MembershipSink<T> {
    type Error;

    fn remove(&mut self, member: &T) -> Result<(), Self::Error>;

    fn add(&mut self, member: &T) -> Result<(), Self::Error>;
}

/// Notification emitted once per reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipReplaced<T: Ord> {
    pub removed: BTreeSet<T>,
    pub added: BTreeSet<T>,
    /// Final member set, equal to the desired set.
    pub members: BTreeSet<T>,
}

impl<T: Ord> MembershipReplaced<T> {
    /// True when the reconciliation did not change anything.
    pub fn is_noop(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Bring `current` to `desired` through `sink`.
///
/// `to_remove = current - desired` is applied before `to_add = desired - current`.
/// The first sink error aborts the reconciliation and is returned as-is.
pub fn reconcile_members<T, S>(
    current: &BTreeSet<T>,
    desired: &BTreeSet<T>,
    sink: &mut S,
) -> Result<MembershipReplaced<T>, S::Error>
where
    T: Ord + Clone,
    S: MembershipSink<T>,
{
    let removed: BTreeSet<T> = current.difference(desired).cloned().collect();
    let added: BTreeSet<T> = desired.difference(current).cloned().collect();

    for member in &removed {
        sink.remove(member)?;
    }
    for member in &added {
        sink.add(member)?;
    }

    Ok(MembershipReplaced {
        removed,
        added,
        members: desired.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        ops: Vec<String>,
        fail_on: Option<&'static str>,
    }

    impl MembershipSink<&'static str> for Recorder {
        type Error = String;

        fn remove(&mut self, member: &&'static str) -> Result<(), String> {
            self.ops.push(format!("-{member}"));
            Ok(())
        }

        fn add(&mut self, member: &&'static str) -> Result<(), String> {
            if self.fail_on == Some(*member) {
                return Err(format!("cannot add {member}"));
            }
            self.ops.push(format!("+{member}"));
            Ok(())
        }
    }

    fn set(items: &[&'static str]) -> BTreeSet<&'static str> {
        items.iter().copied().collect()
    }

    #[test]
    fn removals_are_applied_before_additions() {
        let mut sink = Recorder::default();
        let replaced =
            reconcile_members(&set(&["alice", "bob"]), &set(&["bob", "carol"]), &mut sink)
                .unwrap();

        assert_eq!(sink.ops, vec!["-alice", "+carol"]);
        assert_eq!(replaced.removed, set(&["alice"]));
        assert_eq!(replaced.added, set(&["carol"]));
        assert_eq!(replaced.members, set(&["bob", "carol"]));
    }

    #[test]
    fn identical_sets_touch_nothing() {
        let mut sink = Recorder::default();
        let replaced = reconcile_members(&set(&["a", "b"]), &set(&["a", "b"]), &mut sink).unwrap();

        assert!(sink.ops.is_empty());
        assert!(replaced.is_noop());
        assert_eq!(replaced.members, set(&["a", "b"]));
    }

    #[test]
    fn sink_error_is_propagated() {
        let mut sink = Recorder {
            fail_on: Some("b"),
            ..Default::default()
        };
        let err = reconcile_members(&set(&[]), &set(&["a", "b"]), &mut sink).unwrap_err();
        assert_eq!(err, "cannot add b");
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        struct Apply(BTreeSet<u8>);

        impl MembershipSink<u8> for Apply {
            type Error = ();

            fn remove(&mut self, member: &u8) -> Result<(), ()> {
                self.0.remove(member);
                Ok(())
            }

            fn add(&mut self, member: &u8) -> Result<(), ()> {
                self.0.insert(*member);
                Ok(())
            }
        }

        proptest! {
            /// Property: applying the diff to `current` yields exactly `desired`.
            #[test]
            fn applying_diff_reaches_desired(
                current in proptest::collection::btree_set(any::<u8>(), 0..32),
                desired in proptest::collection::btree_set(any::<u8>(), 0..32),
            ) {
                let mut sink = Apply(current.clone());
                let replaced = reconcile_members(&current, &desired, &mut sink).unwrap();
                prop_assert_eq!(&sink.0, &desired);
                prop_assert_eq!(&replaced.members, &desired);
                prop_assert!(replaced.removed.is_disjoint(&replaced.added));
            }
        }
    }
}

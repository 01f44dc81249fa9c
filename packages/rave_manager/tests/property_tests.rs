use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use proptest::prelude::*;
use rave_manager::agent::{membership_delta, parse_command};
use rave_manager::supervisor::plan_reconcile;
use rave_manager::{FailureKind, RetryPolicy, SessionSummary};

fn failure_kind() -> impl Strategy<Value = Option<FailureKind>> {
    prop_oneof![
        Just(None),
        Just(Some(FailureKind::NameResolution)),
        Just(Some(FailureKind::Timeout)),
        Just(Some(FailureKind::Connection)),
        Just(Some(FailureKind::Protocol)),
    ]
}

proptest! {
    #[test]
    fn backoff_is_monotone_and_capped(
        base_ms in 1u64..5_000,
        extra_ms in 0u64..120_000,
        attempt in 0u32..200,
        failure in failure_kind(),
    ) {
        let policy = RetryPolicy::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(base_ms + extra_ms),
            10,
        );
        let scale = RetryPolicy::multiplier(failure);
        let cap = policy.cap.as_secs_f64() * scale;

        let now = policy.delay(attempt, failure);
        let next = policy.delay(attempt + 1, failure);
        prop_assert!(next >= now);
        prop_assert!(now.as_secs_f64() <= cap + 1e-6);
        prop_assert!(now.as_secs_f64() + 1e-6 >= (policy.base.as_secs_f64() * scale).min(cap));
    }

    #[test]
    fn network_faults_never_back_off_less(attempt in 0u32..40) {
        let policy = RetryPolicy::supervisor();
        let plain = policy.delay(attempt, None);
        for kind in [FailureKind::Timeout, FailureKind::Connection, FailureKind::NameResolution] {
            prop_assert!(policy.delay(attempt, Some(kind)) >= plain);
        }
    }

    #[test]
    fn membership_delta_partitions_the_change(
        before in prop::collection::btree_set(0u64..64, 0..20),
        after in prop::collection::btree_set(0u64..64, 0..20),
    ) {
        let delta = membership_delta(&before, &after);

        let joined: BTreeSet<u64> = delta.joined.iter().copied().collect();
        let left: BTreeSet<u64> = delta.left.iter().copied().collect();
        let expected_joined: BTreeSet<u64> = after.difference(&before).copied().collect();
        let expected_left: BTreeSet<u64> = before.difference(&after).copied().collect();
        prop_assert_eq!(&joined, &expected_joined);
        prop_assert_eq!(&left, &expected_left);
        prop_assert!(joined.is_disjoint(&left));
        prop_assert_eq!(joined.len(), delta.joined.len());
        prop_assert!(delta.joined.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(delta.left.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn commands_are_lowercased_and_split_on_whitespace(
        name in "[A-Za-z][A-Za-z0-9_]{0,12}",
        args in prop::collection::vec("[a-z0-9]{1,8}", 0..5),
    ) {
        let prefixes = vec!["!".to_string()];
        let text = format!("!{} {}", name, args.join("  "));

        let (command, parsed) = parse_command(&text, &prefixes).expect("prefixed text is a command");
        prop_assert_eq!(command, name.to_lowercase());
        prop_assert_eq!(parsed, args);
    }

    #[test]
    fn unprefixed_text_is_never_a_command(text in "[a-zA-Z0-9 ]{0,40}") {
        let prefixes = vec!["!".to_string(), "/".to_string()];
        prop_assert_eq!(parse_command(&text, &prefixes), None);
    }

    #[test]
    fn reconcile_plan_is_consistent(
        registered in prop::collection::hash_set("[a-f]", 0..6),
        kicked in prop::collection::hash_set("[a-f]", 0..3),
        desired in prop::collection::vec("[a-h]", 0..10),
    ) {
        let summaries: Vec<SessionSummary> = desired.iter().map(SessionSummary::new).collect();
        let plan = plan_reconcile(registered.iter(), &kicked, &summaries);

        let start: Vec<&str> = plan.start.iter().map(|s| s.session_id.as_str()).collect();
        let unique: HashSet<&str> = start.iter().copied().collect();
        prop_assert_eq!(unique.len(), start.len());

        for id in &start {
            prop_assert!(!registered.contains(*id));
            prop_assert!(!kicked.contains(*id));
            prop_assert!(desired.iter().any(|d| d == id));
        }
        for id in &plan.stop {
            prop_assert!(registered.contains(id));
            prop_assert!(!desired.contains(id));
        }
        for id in &plan.keep {
            prop_assert!(registered.contains(id));
            prop_assert!(desired.contains(id));
        }
        prop_assert_eq!(plan.stop.len() + plan.keep.len(), registered.len());
    }
}

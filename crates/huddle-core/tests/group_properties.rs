//! Property-based tests for Group membership and lifecycle

mod common;

use std::collections::{BTreeSet, HashSet};

use common::{Behavior, MockSession};
use huddle_core::{Group, GroupError, PushError, Session};
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap()
}

fn distinct_ids() -> impl Strategy<Value = BTreeSet<u64>> {
    prop::collection::btree_set(0u64..10_000, 0..40)
}

/// Property: Adding distinct sessions yields a matching count and member set
#[test]
fn prop_add_distinct_sessions() {
    proptest!(|(ids in distinct_ids())| {
        runtime().block_on(async {
            let group = Group::new("prop");
            for id in &ids {
                group.add(MockSession::new(*id)).await.unwrap();
            }

            prop_assert_eq!(group.count().await, ids.len());

            let members: HashSet<u64> = group.members().await.into_iter().collect();
            let expected: HashSet<u64> = ids.iter().map(|id| id + 1000).collect();
            prop_assert_eq!(members, expected);
            Ok::<(), TestCaseError>(())
        })?;
    });
}

/// Property: Re-adding any member fails and leaves the count unchanged
#[test]
fn prop_duplicate_add_never_mutates() {
    proptest!(|(ids in distinct_ids(), pick in any::<prop::sample::Index>())| {
        prop_assume!(!ids.is_empty());
        runtime().block_on(async {
            let group = Group::new("prop");
            for id in &ids {
                group.add(MockSession::new(*id)).await.unwrap();
            }

            let ids: Vec<u64> = ids.into_iter().collect();
            let duplicate = ids[pick.index(ids.len())];
            let result = group.add(MockSession::unbound(duplicate)).await;

            prop_assert_eq!(result, Err(GroupError::DuplicateSession(duplicate)));
            prop_assert_eq!(group.count().await, ids.len());
            prop_assert!(group.member_by_id(duplicate).await.unwrap().uid().is_some());
            Ok::<(), TestCaseError>(())
        })?;
    });
}

/// Property: Leaving removes exactly the sessions that left
#[test]
fn prop_leave_removes_only_leavers() {
    proptest!(|(ids in distinct_ids(), leavers in prop::collection::btree_set(0u64..10_000, 0..20))| {
        runtime().block_on(async {
            let group = Group::new("prop");
            for id in &ids {
                group.add(MockSession::new(*id)).await.unwrap();
            }
            // Includes ids that were never added
            for id in &leavers {
                group.leave(&MockSession::new(*id)).await.unwrap();
            }

            let remaining = ids.difference(&leavers).count();
            prop_assert_eq!(group.count().await, remaining);
            for id in &leavers {
                prop_assert!(group.member_by_id(*id).await.is_err());
            }

            group.leave_all().await.unwrap();
            prop_assert_eq!(group.count().await, 0);
            Ok::<(), TestCaseError>(())
        })?;
    });
}

/// Property: Once closed, every mutation fails with ClosedGroup
#[test]
fn prop_closed_group_rejects_mutations() {
    proptest!(|(ids in distinct_ids(), probe in any::<u64>())| {
        runtime().block_on(async {
            let group = Group::new("prop");
            for id in &ids {
                group.add(MockSession::new(*id)).await.unwrap();
            }
            group.close().await.unwrap();

            let session = MockSession::new(probe);
            prop_assert_eq!(group.count().await, 0);
            prop_assert_eq!(group.add(session.clone()).await, Err(GroupError::ClosedGroup));
            prop_assert_eq!(group.leave(&session).await, Err(GroupError::ClosedGroup));
            prop_assert_eq!(group.leave_all().await, Err(GroupError::ClosedGroup));
            prop_assert_eq!(group.multicast("r", &probe, |_| true).await, Err(GroupError::ClosedGroup));
            prop_assert_eq!(group.broadcast("r", &probe).await, Err(GroupError::ClosedGroup));
            prop_assert_eq!(group.close().await, Err(GroupError::AlreadyClosed));
            prop_assert_eq!(session.received_count(), 0);
            Ok::<(), TestCaseError>(())
        })?;
    });
}

/// Property: Multicast delivers exactly once to accepted members and never to the rest
#[test]
fn prop_multicast_matches_filter() {
    proptest!(|(ids in distinct_ids(), modulus in 1u64..5)| {
        runtime().block_on(async {
            let group = Group::new("prop");
            let sessions: Vec<_> = ids.iter().map(|id| MockSession::new(*id)).collect();
            for session in &sessions {
                group.add(session.clone()).await.unwrap();
            }

            group.multicast("onMessage", &"payload", |s| s.id() % modulus == 0).await.unwrap();

            for session in &sessions {
                let expected = usize::from(session.id() % modulus == 0);
                prop_assert_eq!(session.received_count(), expected);
            }
            Ok::<(), TestCaseError>(())
        })?;
    });
}

/// Property: One failing member never stops delivery to the others
#[test]
fn prop_broadcast_survives_failures() {
    proptest!(|(ids in distinct_ids(), failing in prop::collection::btree_set(10_000u64..10_100, 1..5))| {
        runtime().block_on(async {
            let group = Group::new("prop");
            let healthy: Vec<_> = ids.iter().map(|id| MockSession::new(*id)).collect();
            for session in &healthy {
                group.add(session.clone()).await.unwrap();
            }
            for id in &failing {
                group.add(MockSession::with_behavior(*id, Behavior::Fail(PushError::Backpressure))).await.unwrap();
            }

            let result = group.broadcast("onMessage", &"payload").await;
            let is_push_failure = matches!(
                result,
                Err(GroupError::Push { session_id, source: PushError::Backpressure }) if failing.contains(&session_id)
            );
            prop_assert!(is_push_failure);

            for session in &healthy {
                prop_assert_eq!(session.received_count(), 1);
            }

            let report = group.multicast_report("onMessage", &"payload", |_| true).await.unwrap();
            prop_assert_eq!(report.delivered, healthy.len());
            prop_assert_eq!(report.failures.len(), failing.len());
            Ok::<(), TestCaseError>(())
        })?;
    });
}

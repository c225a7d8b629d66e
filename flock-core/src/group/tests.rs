//! Group behavior tests
//!
//! Exercised against the in-memory coordination service.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use crate::error::FlockError;
use crate::zk::testing::TestServer;

use super::{member_path, parse_sequence, Group, GroupConfig, Membership};

async fn eventually<F: Future>(future: F) -> F::Output {
    timeout(Duration::from_secs(60), future)
        .await
        .expect("operation timed out")
}

fn new_group(server: &TestServer) -> Group {
    Group::new(server.client(), GroupConfig::default())
}

/// Watches until the group has exactly `count` members.
async fn members(group: &Group, count: usize) -> BTreeSet<Membership> {
    let mut snapshot = eventually(group.watch(None)).await.unwrap();
    while snapshot.len() != count {
        snapshot = eventually(group.watch(Some(snapshot))).await.unwrap();
    }
    snapshot
}

#[test]
fn member_names_round_trip() {
    assert_eq!(member_path("/flock", 7), "/flock/m_0000000007");
    assert_eq!(parse_sequence("/flock/m_0000000007"), Some(7));
    assert_eq!(parse_sequence("m_0000000123"), Some(123));
    assert_eq!(parse_sequence("m_"), None);
    assert_eq!(parse_sequence("m_12abc"), None);
    assert_eq!(parse_sequence("unrelated"), None);
}

#[tokio::test]
async fn join_then_data_returns_the_joined_bytes() {
    let server = TestServer::new();
    let group = new_group(&server);

    let membership = eventually(group.join("10.0.0.1:5050")).await.unwrap();
    let data = eventually(group.data(&membership)).await.unwrap();
    assert_eq!(data, Bytes::from("10.0.0.1:5050"));

    // The group node was created on demand.
    assert!(server.has_node("/flock"));
}

#[tokio::test]
async fn joins_get_increasing_sequences() {
    let server = TestServer::new();
    let group = new_group(&server);

    let first = eventually(group.join("a")).await.unwrap();
    let second = eventually(group.join("b")).await.unwrap();
    assert!(first.id() < second.id());
    assert!(first < second);

    let snapshot = members(&group, 2).await;
    assert_eq!(snapshot.iter().next(), Some(&first));
}

#[tokio::test]
async fn watch_without_expectation_resolves_on_an_empty_group() {
    let server = TestServer::new();
    let group = new_group(&server);

    let snapshot = eventually(group.watch(None)).await.unwrap();
    assert!(snapshot.is_empty());
}

#[tokio::test]
async fn watch_resolves_when_members_change() {
    let server = TestServer::new();
    let group = new_group(&server);
    let empty = eventually(group.watch(None)).await.unwrap();

    // Two concurrent watches with the same expectation resolve
    // independently.
    let first = tokio::spawn({
        let group = group.clone();
        let empty = empty.clone();
        async move { group.watch(Some(empty)).await }
    });
    let second = tokio::spawn({
        let group = group.clone();
        let empty = empty.clone();
        async move { group.watch(Some(empty)).await }
    });

    let membership = eventually(group.join("a")).await.unwrap();

    let first = eventually(first).await.unwrap().unwrap();
    let second = eventually(second).await.unwrap().unwrap();
    assert!(first.contains(&membership));
    assert!(second.contains(&membership));
}

#[tokio::test]
async fn watch_matching_the_current_members_stays_pending() {
    let server = TestServer::new();
    let group = new_group(&server);
    let membership = eventually(group.join("a")).await.unwrap();
    let snapshot = members(&group, 1).await;

    let mut watch = Box::pin(group.watch(Some(snapshot)));
    assert!(timeout(Duration::from_millis(100), watch.as_mut())
        .await
        .is_err());

    // Divergent expectations resolve immediately.
    let diverged = eventually(group.watch(Some(BTreeSet::new()))).await.unwrap();
    assert!(diverged.contains(&membership));
}

#[tokio::test]
async fn cancel_succeeds_once_then_reports_not_owned() {
    let server = TestServer::new();
    let group = new_group(&server);
    let membership = eventually(group.join("a")).await.unwrap();

    assert_eq!(eventually(group.cancel(&membership)).await, Ok(true));
    // The cancellation signal carries `true` for the owner who asked.
    assert!(eventually(membership.cancelled()).await);

    assert_eq!(
        eventually(group.cancel(&membership)).await,
        Err(FlockError::NotOwned {
            sequence: membership.id()
        })
    );
}

#[tokio::test]
async fn cancel_requires_ownership() {
    let server = TestServer::new();
    let owner = new_group(&server);
    let observer = new_group(&server);

    let membership = eventually(owner.join("a")).await.unwrap();
    let seen = members(&observer, 1).await;
    let observed = seen.iter().next().unwrap().clone();
    assert_eq!(observed, membership);

    assert_eq!(
        eventually(observer.cancel(&observed)).await,
        Err(FlockError::NotOwned {
            sequence: membership.id()
        })
    );
}

#[tokio::test]
async fn cancellation_signal_distinguishes_owner_from_observer() {
    let server = TestServer::new();
    let owner = new_group(&server);
    let observer = new_group(&server);

    let membership = eventually(owner.join("a")).await.unwrap();
    let seen = members(&observer, 1).await;
    let observed = seen.iter().next().unwrap().clone();

    assert_eq!(eventually(owner.cancel(&membership)).await, Ok(true));
    assert!(eventually(membership.cancelled()).await);
    // The observer did not initiate the removal.
    assert!(!eventually(observed.cancelled()).await);
}

#[tokio::test]
async fn session_expiry_cancels_members_and_fails_pending_operations() {
    let server = TestServer::new();
    let group = new_group(&server);
    let observer = new_group(&server);

    let membership = eventually(group.join("a")).await.unwrap();
    let seen = members(&observer, 1).await;
    let observed = seen.iter().next().unwrap().clone();

    let snapshot = members(&group, 1).await;
    let mut watch = Box::pin(group.watch(Some(snapshot)));
    assert!(timeout(Duration::from_millis(100), watch.as_mut())
        .await
        .is_err());

    let session = eventually(group.session()).await.unwrap().expect("session id");
    server.expire_session(session);

    assert_eq!(eventually(watch).await, Err(FlockError::SessionExpired));
    assert!(!eventually(membership.cancelled()).await);
    // The observer's session is intact; it sees the ephemeral node go.
    assert!(!eventually(observed.cancelled()).await);
    assert!(members(&observer, 0).await.is_empty());
}

#[tokio::test]
async fn terminal_error_is_sticky() {
    let server = TestServer::new();
    let group = new_group(&server);

    let session = eventually(group.session()).await.unwrap().expect("session id");
    server.expire_session(session);

    assert_eq!(
        eventually(group.join("a")).await,
        Err(FlockError::SessionExpired)
    );
    assert_eq!(
        eventually(group.watch(None)).await,
        Err(FlockError::SessionExpired)
    );
    assert_eq!(
        eventually(group.session()).await,
        Err(FlockError::SessionExpired)
    );
}

#[tokio::test]
async fn data_of_a_removed_member_fails_gently() {
    let server = TestServer::new();
    let owner = new_group(&server);
    let observer = new_group(&server);

    let membership = eventually(owner.join("a")).await.unwrap();
    let seen = members(&observer, 1).await;
    let observed = seen.iter().next().unwrap().clone();

    assert_eq!(eventually(owner.cancel(&membership)).await, Ok(true));

    assert_eq!(
        eventually(observer.data(&observed)).await,
        Err(FlockError::MemberGone {
            sequence: observed.id()
        })
    );
}

#[tokio::test]
async fn session_id_is_reported_while_connected() {
    let server = TestServer::new();
    let group = new_group(&server);

    // Join first so the session is certainly established.
    eventually(group.join("a")).await.unwrap();
    let session = eventually(group.session()).await.unwrap();
    assert!(session.is_some());
}

#[tokio::test]
async fn memberships_from_different_groups_compare_by_sequence() {
    let server = TestServer::new();
    let owner = new_group(&server);
    let observer = new_group(&server);

    let membership = eventually(owner.join("a")).await.unwrap();
    let seen = members(&observer, 1).await;
    assert!(seen.contains(&membership));
}

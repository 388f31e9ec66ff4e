//! Leader failure and recovery.


use std::time::Duration;
use test_harness::{assert_eventually, put, TestCluster};

/// A crashed leader is replaced by a node in a higher term
#[tokio::test]
async fn test_new_leader_election_after_shutdown() {
    let mut cluster = TestCluster::new(3).await;

    let old_leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");
    let old_term = cluster.get_node(&old_leader).current_term().await;

    cluster.shutdown_node(&old_leader).await;

    let new_leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Remaining nodes should elect a new leader");

    assert_ne!(new_leader, old_leader);
    assert!(cluster.get_node(&new_leader).current_term().await > old_term);

    cluster.shutdown().await;
}

/// Entries committed before a failover survive it
#[tokio::test]
async fn test_committed_entries_survive_failover() {
    let mut cluster = TestCluster::new(3).await;

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");

    for seq in 1..=3u64 {
        let resp = cluster
            .submit(put("c1", seq, &format!("k{}", seq), "before"))
            .await
            .unwrap();
        assert!(resp.success);
    }
    assert!(
        cluster
            .wait_for_applied_on_all(3, Duration::from_secs(3))
            .await
    );

    let old_leader = cluster.get_leader_id().await.unwrap();
    cluster.shutdown_node(&old_leader).await;

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("New leader should be elected");

    let resp = cluster.submit(put("c1", 4, "k4", "after")).await.unwrap();
    assert!(resp.success);

    assert!(
        cluster
            .wait_for_applied_on_all(4, Duration::from_secs(3))
            .await,
        "Survivors should apply the post-failover entry"
    );
    for node in cluster.nodes.values() {
        assert_eq!(node.store.get("k1").await.as_deref(), Some("before"));
        assert_eq!(node.store.get("k4").await.as_deref(), Some("after"));
    }
    assert!(cluster.verify_log_consistency().await);

    cluster.shutdown().await;
}

/// Sequential leader crashes in a five-node cluster
#[tokio::test]
async fn test_multiple_sequential_leader_failures() {
    let mut cluster = TestCluster::new(5).await;

    for seq in 1..=2u64 {
        let leader = cluster
            .wait_for_leader(Duration::from_secs(5))
            .await
            .expect("A leader should be elected");
        let resp = cluster.submit(put("c1", seq, "last", &leader)).await.unwrap();
        assert!(resp.success);
        cluster.shutdown_node(&leader).await;
    }

    // Three of five remain: still a majority
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Three survivors should still elect a leader");
    assert_eq!(cluster.count_leaders().await, 1);

    // A current-term entry commits everything before it
    let resp = cluster.submit(put("c1", 3, "last", &leader)).await.unwrap();
    assert!(resp.success);
    assert!(
        cluster
            .wait_for_applied_on_all(3, Duration::from_secs(3))
            .await,
        "Survivors should apply all three entries"
    );
    assert_eventually(
        || async { cluster.verify_log_consistency().await },
        Duration::from_secs(3),
        "Survivors should converge on one log",
    )
    .await;

    cluster.shutdown().await;
}

/// With a majority gone, the survivor keeps its log but commits nothing new
#[tokio::test]
async fn test_quorum_loss_prevents_commits() {
    let mut cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    let resp = cluster.submit(put("c1", 1, "k", "v")).await.unwrap();
    assert!(resp.success);
    assert!(
        cluster
            .wait_for_applied_on_all(1, Duration::from_secs(2))
            .await
    );

    let survivor = cluster
        .node_ids()
        .into_iter()
        .find(|id| *id != leader_id)
        .unwrap();
    for id in cluster.node_ids() {
        if id != survivor {
            cluster.shutdown_node(&id).await;
        }
    }

    // Let the survivor churn through a few failed elections
    tokio::time::sleep(Duration::from_millis(600)).await;

    let node = cluster.get_node(&survivor);
    assert!(!node.is_leader().await, "A lone node of three cannot lead");
    assert_eq!(node.log_len().await, 1);
    assert_eq!(node.commit_index().await, 1);
    assert_eq!(node.store.get("k").await.as_deref(), Some("v"));

    let resp = cluster.submit_to(&survivor, put("c1", 2, "k", "w")).await.unwrap();
    assert!(!resp.success);

    cluster.shutdown().await;
}

/// Losing a follower leaves a working majority
#[tokio::test]
async fn test_follower_loss_keeps_leader() {
    let mut cluster = TestCluster::new(3).await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    let follower = cluster
        .node_ids()
        .into_iter()
        .find(|id| *id != leader)
        .unwrap();
    cluster.shutdown_node(&follower).await;

    let resp = cluster.submit(put("c1", 1, "k", "v")).await.unwrap();
    assert!(resp.success, "Two of three is still a majority");
    assert_eq!(cluster.count_leaders().await, 1);

    cluster.shutdown().await;
}

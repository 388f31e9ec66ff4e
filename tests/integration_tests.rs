//! End-to-end behaviour of a running cluster: election, replication,
//! application and client redirects.


use std::time::Duration;
use test_harness::{assert_eventually, put, wait_for, TestCluster};

use raft_consensus::raft::RaftRole;

#[tokio::test]
async fn test_three_node_cluster_elects_leader() {
    let mut cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("A leader should be elected");

    let leader = cluster.get_node(&leader_id);
    assert!(leader.current_term().await >= 1);
    // A leader's vote in its own term is itself
    assert_eq!(leader.leader_id().await.as_deref(), Some(leader_id.as_str()));

    // Followers learn who leads
    let term = leader.current_term().await;
    assert_eventually(
        || async {
            for node in cluster.nodes.values() {
                if node.current_term().await != term
                    || node.leader_id().await.as_deref() != Some(leader_id.as_str())
                {
                    return false;
                }
            }
            true
        },
        Duration::from_secs(2),
        "All nodes should agree on the leader",
    )
    .await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_single_node_cluster_leads_and_commits() {
    let mut cluster = TestCluster::new(1).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(2))
        .await
        .expect("Single node should elect itself");

    let resp = cluster
        .submit(put("c1", 1, "k", "v"))
        .await
        .expect("submit should not error");
    assert!(resp.success);

    let node = cluster.get_node(&leader_id);
    assert_eq!(node.commit_index().await, 1);
    assert_eq!(node.store.get("k").await.as_deref(), Some("v"));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_submission_is_applied_everywhere() {
    let mut cluster = TestCluster::new(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("A leader should be elected");

    for seq in 1..=5u64 {
        let resp = cluster
            .submit(put("c1", seq, &format!("k{}", seq), &seq.to_string()))
            .await
            .expect("submit should not error");
        assert!(resp.success, "submission {} should succeed", seq);
    }

    assert!(
        cluster
            .wait_for_applied_on_all(5, Duration::from_secs(3))
            .await,
        "All nodes should apply five entries"
    );
    assert!(cluster.verify_log_consistency().await);

    for node in cluster.nodes.values() {
        assert_eq!(node.store.len().await, 5);
        assert_eq!(node.store.get("k3").await.as_deref(), Some("3"));
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_follower_redirects_to_leader() {
    let mut cluster = TestCluster::new(3).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("A leader should be elected");

    let follower_id = cluster
        .node_ids()
        .into_iter()
        .find(|id| *id != leader_id)
        .unwrap();

    // Wait until the follower has heard from the leader
    let follower = cluster.get_node(&follower_id);
    assert_eventually(
        || async { follower.leader_id().await.as_deref() == Some(leader_id.as_str()) },
        Duration::from_secs(2),
        "Follower should learn the leader",
    )
    .await;

    let resp = cluster
        .submit_to(&follower_id, put("c1", 1, "k", "v"))
        .await
        .expect("submit should not error");
    assert!(!resp.success);
    assert_eq!(resp.leader_hint.as_deref(), Some(leader_id.as_str()));
    assert_eq!(follower.log_len().await, 0, "Followers never append client commands");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_submissions() {
    let mut cluster = TestCluster::new(3).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("A leader should be elected");

    let leader = cluster.get_node(&leader_id).raft_node.clone();
    let mut handles = Vec::new();
    for client in 0..4 {
        for seq in 1..=5u64 {
            let leader = leader.clone();
            let command = put(&format!("c{}", client), seq, &format!("c{}-{}", client, seq), "x");
            handles.push(tokio::spawn(async move { leader.submit(command).await }));
        }
    }

    for handle in handles {
        let resp = handle.await.unwrap().unwrap();
        assert!(resp.success);
    }

    assert!(
        cluster
            .wait_for_applied_on_all(20, Duration::from_secs(3))
            .await
    );
    assert!(cluster.verify_log_consistency().await);
    assert_eq!(cluster.get_node(&leader_id).store.len().await, 20);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_at_most_one_leader_per_term() {
    let mut cluster = TestCluster::new(5).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("A leader should be elected");

    // Sample repeatedly while the cluster churns through a few elections.
    let mut seen: std::collections::HashMap<u64, String> = std::collections::HashMap::new();
    for round in 0..30 {
        if round % 10 == 5 {
            if let Some(leader) = cluster.get_leader_id().await {
                cluster.isolate_node(&leader).await;
            }
        }
        if round % 10 == 9 {
            cluster.heal().await;
        }

        for node in cluster.nodes.values() {
            let state = node.raft_node.state.read().await;
            if state.role == RaftRole::Leader {
                let term = state.current_term();
                if let Some(previous) = seen.insert(term, node.node_id.clone()) {
                    assert_eq!(previous, node.node_id, "Two leaders in term {}", term);
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_retransmitted_command_is_logged_once() {
    let mut cluster = TestCluster::new(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("A leader should be elected");

    let command = put("retry-client", 7, "k", "v");
    let first = cluster.submit(command.clone()).await.unwrap();
    assert!(first.success);
    let second = cluster.submit(command).await.unwrap();
    assert!(second.success, "Retransmission should report the original outcome");

    let leader_id = cluster.get_leader_id().await.unwrap();
    assert_eq!(cluster.get_node(&leader_id).log_len().await, 1);

    let synced = wait_for(
        || async { cluster.verify_log_consistency().await },
        Duration::from_secs(2),
        Duration::from_millis(20),
    )
    .await;
    assert!(synced);

    cluster.shutdown().await;
}

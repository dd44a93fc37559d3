mod fixtures;

use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use pretty_assertions::assert_eq;

use chatraft::error::ClientWriteError;
use chatraft::RaftStorage;
use fixtures::RaftRouter;
use sqlstore::ChatCommand;

fn create(username: &str) -> ChatCommand {
    ChatCommand::CreateAccount {
        username: username.into(),
        password_hash: format!("hash-{}", username),
    }
}

fn send(sender: &str, recipient: &str, content: &str, timestamp: i64) -> ChatCommand {
    ChatCommand::SendMessage {
        sender: sender.into(),
        recipient: recipient.into(),
        content: content.into(),
        timestamp,
    }
}

/// A committed write lands in every node's users table, and both indices
/// advance everywhere.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_replicates_to_all_nodes() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new(fixtures::test_config());
    let members = btreeset![0, 1, 2];
    router.new_cluster(members.clone()).await?;
    let leader = router.wait_for_leader(Duration::from_secs(2), "initial election").await?;

    let res = router.client_write(leader, create("alice")).await.expect("write to leader must commit");
    assert!(res.data.success);
    assert_eq!(res.index, 1);

    router.wait_for_log(&members, 1, Some(Duration::from_secs(2)), "all nodes applied").await?;
    for id in members.iter() {
        let store = router.get_storage_handle(id).await?;
        assert!(store.user_exists("alice")?, "node {} must hold alice", id);
        let metrics = router
            .wait_for_metrics(id, |m| m.commit_index == 1 && m.last_applied == 1, Some(Duration::from_secs(2)), "indices")
            .await?;
        assert_eq!(metrics.last_log_index, 1);
    }
    Ok(())
}

/// A write submitted to a follower is refused with a typed signal carrying
/// the leader's identity for client-side redirection.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_rejects_write_with_leader_hint() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new(fixtures::test_config());
    let members = btreeset![0, 1, 2];
    router.new_cluster(members.clone()).await?;
    let leader = router.wait_for_leader(Duration::from_secs(2), "initial election").await?;
    let follower = members.iter().copied().find(|id| *id != leader).expect("a follower");

    // Wait until the follower has learned who leads.
    router
        .wait_for_metrics(
            &follower,
            |m| m.current_leader == Some(leader),
            Some(Duration::from_secs(2)),
            "follower knows leader",
        )
        .await?;

    let res = router.client_write(follower, create("alice")).await;
    match res {
        Err(ClientWriteError::ForwardToLeader(command, Some(hint))) => {
            assert_eq!(hint, leader);
            assert_eq!(command, create("alice"));
        }
        other => panic!("expected ForwardToLeader with hint, got {:?}", other.map(|r| r.index)),
    }
    Ok(())
}

/// Scenario: partition a follower away, commit on the majority side, heal.
/// The partitioned node ends up with the same entry at the same index, and
/// the same message in its tables.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partition_heals_and_repairs_log() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new(fixtures::test_config());
    let members = btreeset![0, 1, 2];
    router.new_cluster(members.clone()).await?;
    let leader = router.wait_for_leader(Duration::from_secs(2), "initial election").await?;

    router.client_write(leader, create("alice")).await.expect("create alice");
    router.client_write(leader, create("bob")).await.expect("create bob");
    router.wait_for_log(&members, 2, Some(Duration::from_secs(2)), "users replicated").await?;

    let partitioned = members.iter().copied().find(|id| *id != leader).expect("a follower");
    router.isolate_node(partitioned).await;

    let res = router.client_write(leader, send("alice", "bob", "m1", 1_700_000_000)).await.expect("majority commit");
    let index = res.index;
    assert_eq!(index, 3);

    router.restore_node(partitioned).await;
    router.wait_for_log(&btreeset![partitioned], index, Some(Duration::from_secs(3)), "partitioned node repaired").await?;

    // Log Matching: the same entry sits at the same index everywhere.
    let mut entries = Vec::new();
    for id in members.iter() {
        let store = router.get_storage_handle(id).await?;
        let entry = store.try_get_log_entry(index).await?.expect("entry present");
        entries.push(entry);
    }
    assert_eq!(entries[0], entries[1]);
    assert_eq!(entries[1], entries[2]);

    let store = router.get_storage_handle(&partitioned).await?;
    let messages = store.get_messages("bob", true)?;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "m1");
    Ok(())
}

/// Scenario: kill the leader; the surviving majority elects a new one at a
/// higher term, and writes keep working.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_failover() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new(fixtures::test_config());
    let members = btreeset![0, 1, 2];
    router.new_cluster(members.clone()).await?;
    let leader = router.wait_for_leader(Duration::from_secs(2), "initial election").await?;

    router.client_write(leader, create("alice")).await.expect("create alice");
    router.wait_for_log(&members, 1, Some(Duration::from_secs(2)), "alice replicated").await?;

    let (old_raft, _old_store) = router.remove_node(leader).await.expect("leader running");
    old_raft.shutdown().await?;

    let survivors: std::collections::BTreeSet<u64> = members.iter().copied().filter(|id| *id != leader).collect();
    let new_leader = router.wait_for_leader(Duration::from_secs(5), "failover election").await?;
    assert!(survivors.contains(&new_leader));

    let metrics = router.latest_metrics().await;
    let new_leader_metrics = metrics.iter().find(|m| m.id == new_leader).expect("leader metrics");
    assert!(new_leader_metrics.current_term >= 2);

    router.client_write(new_leader, create("bob")).await.expect("create bob on new leader");
    router.wait_for_log(&survivors, 2, Some(Duration::from_secs(2)), "bob replicated").await?;
    for id in survivors.iter() {
        let store = router.get_storage_handle(id).await?;
        assert!(store.user_exists("alice")?);
        assert!(store.user_exists("bob")?);
    }
    Ok(())
}

/// Scenario: restart every node. State machine contents and terms survive,
/// and the cluster re-elects.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_rejoins_with_persistent_state() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new(fixtures::test_config());
    let members = btreeset![0, 1, 2];
    router.new_cluster(members.clone()).await?;
    let leader = router.wait_for_leader(Duration::from_secs(2), "initial election").await?;

    router.client_write(leader, create("alice")).await.expect("create alice");
    router.client_write(leader, create("bob")).await.expect("create bob");
    router.wait_for_log(&members, 2, Some(Duration::from_secs(2)), "users replicated").await?;

    let pre_restart_terms: std::collections::BTreeMap<u64, u64> =
        router.latest_metrics().await.into_iter().map(|m| (m.id, m.current_term)).collect();

    for id in members.iter() {
        router.restart_node(*id, &members).await?;
    }

    router.wait_for_leader(Duration::from_secs(5), "post-restart election").await?;
    router.wait_for_log(&members, 2, Some(Duration::from_secs(5)), "state machine caught up").await?;

    for id in members.iter() {
        let store = router.get_storage_handle(id).await?;
        assert!(store.user_exists("alice")?, "node {} lost alice across restart", id);
        assert!(store.user_exists("bob")?, "node {} lost bob across restart", id);
        let metrics = router.wait_for_metrics(id, |_| true, None, "metrics").await?;
        let before = pre_restart_terms.get(id).copied().unwrap_or(0);
        assert!(
            metrics.current_term >= before,
            "term on node {} regressed across restart: {} < {}",
            id,
            metrics.current_term,
            before
        );
    }
    Ok(())
}

/// Scenario: the leader's timestamp travels inside the command, so every
/// node stores the identical message row.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn send_message_is_deterministic_across_replicas() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new(fixtures::test_config());
    let members = btreeset![0, 1, 2];
    router.new_cluster(members.clone()).await?;
    let leader = router.wait_for_leader(Duration::from_secs(2), "initial election").await?;

    router.client_write(leader, create("alice")).await.expect("create alice");
    router.client_write(leader, create("bob")).await.expect("create bob");
    let res = router.client_write(leader, send("alice", "bob", "hello", 1_700_000_000)).await.expect("send");
    assert!(res.data.success);
    let message_id = res.data.message_id.expect("message id");

    router.wait_for_log(&members, 3, Some(Duration::from_secs(2)), "message applied everywhere").await?;
    for id in members.iter() {
        let store = router.get_storage_handle(id).await?;
        let messages = store.get_messages("bob", true)?;
        assert_eq!(messages.len(), 1, "node {} inbox", id);
        let m = &messages[0];
        assert_eq!(m.id, message_id);
        assert_eq!(m.sender, "alice");
        assert_eq!(m.content, "hello");
        assert_eq!(m.timestamp, 1_700_000_000);
        assert!(!m.is_read);
    }
    Ok(())
}

/// A leader which cannot reach a majority answers within the commit wait
/// with an explicit commit-uncertain error rather than a false success.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_majority_yields_commit_uncertain() -> Result<()> {
    fixtures::init_tracing();
    let router = RaftRouter::new(fixtures::test_config());
    let members = btreeset![0, 1, 2];
    router.new_cluster(members.clone()).await?;
    let leader = router.wait_for_leader(Duration::from_secs(2), "initial election").await?;

    for id in members.iter().filter(|id| **id != leader) {
        router.isolate_node(*id).await;
    }

    let res = router.client_write(leader, create("alice")).await;
    match res {
        Err(ClientWriteError::CommitUncertain) => {}
        other => panic!("expected CommitUncertain, got {:?}", other.map(|r| r.index)),
    }
    Ok(())
}

//! Replication, read-index, and snapshot scenarios on the simulator

use tickraft::core::raft_core::ProposeError;
use tickraft::testing::Cluster;

#[test]
fn test_basic_agreement() {
    let mut cluster = Cluster::new(3);
    cluster.check_one_leader();

    let mut last = 0;
    for k in 0..3 {
        let data = format!("cmd{}", k).into_bytes();
        let index = cluster.one(data, 3);
        assert!(index > last, "agreement indices must increase");
        last = index;
    }

    // Everyone converged on the same commit point.
    let commit = cluster.commit_index(1);
    assert_eq!(cluster.commit_index(2), commit);
    assert_eq!(cluster.commit_index(3), commit);
}

#[test]
fn test_proposal_through_follower_is_refused() {
    let mut cluster = Cluster::new(3);
    let leader = cluster.check_one_leader();
    let follower = (1..=3).find(|&id| id != leader).unwrap();

    let err = cluster.propose(follower, b"nope".to_vec()).unwrap_err();
    match err {
        ProposeError::NotLeader { leader: hint, .. } => {
            assert_eq!(hint, Some(leader), "follower should point at the leader");
        }
    }
}

#[test]
fn test_follower_catches_up_after_partition() {
    let mut cluster = Cluster::new(3);
    let leader = cluster.check_one_leader();
    cluster.one(b"before".to_vec(), 3);

    let lagger = (1..=3).find(|&id| id != leader).unwrap();
    cluster.disconnect(lagger);

    let mut indices = Vec::new();
    for k in 0..3 {
        indices.push(cluster.one(format!("during{}", k).into_bytes(), 2));
    }

    cluster.connect(lagger);
    cluster.tick_n(2 * cluster.election_ticks());

    for &index in &indices {
        let (count, _) = cluster.committed_number(index);
        assert_eq!(count, 3, "index {} missing on the rejoined follower", index);
    }
    assert_eq!(cluster.applied(lagger), cluster.applied(leader));
}

#[test]
fn test_orphan_entries_of_crashed_leader_are_discarded() {
    let mut cluster = Cluster::new(3);
    let old_leader = cluster.check_one_leader();
    cluster.one(b"committed".to_vec(), 3);

    // The leader accepts proposals it can no longer replicate.
    cluster.disconnect(old_leader);
    let (orphan_index, orphan_term) = cluster.propose(old_leader, b"orphan".to_vec()).unwrap();

    // The rest of the cluster moves on and commits at that index.
    let new_leader = cluster.check_one_leader();
    assert_ne!(new_leader, old_leader);
    cluster.one(b"winner".to_vec(), 2);

    // On rejoin the old leader's log is repaired.
    cluster.connect(old_leader);
    cluster.tick_n(2 * cluster.election_ticks());

    let applied = cluster.applied(old_leader);
    let at_orphan = applied.iter().find(|e| e.index == orphan_index);
    if let Some(entry) = at_orphan {
        assert_ne!(
            (entry.term, entry.data.clone()),
            (orphan_term, b"orphan".to_vec()),
            "uncommitted entry of a deposed leader survived"
        );
    }
    assert_eq!(cluster.applied(old_leader), cluster.applied(new_leader));
}

#[test]
fn test_read_index_linearizes_at_commit_point() {
    let mut cluster = Cluster::new(3);
    let leader = cluster.check_one_leader();
    let index = cluster.one(b"data".to_vec(), 3);

    cluster.read_index(leader, b"q-local".to_vec()).unwrap();
    let states = cluster.read_states(leader);
    assert_eq!(states.len(), 1);
    assert!(states[0].index >= index, "read point below a committed entry");
    assert_eq!(states[0].request_ctx, b"q-local".to_vec());
}

#[test]
fn test_read_index_forwarded_from_follower() {
    let mut cluster = Cluster::new(3);
    let leader = cluster.check_one_leader();
    let index = cluster.one(b"data".to_vec(), 3);
    let follower = (1..=3).find(|&id| id != leader).unwrap();

    cluster.read_index(follower, b"q-remote".to_vec()).unwrap();
    let states = cluster.read_states(follower);
    assert_eq!(states.len(), 1);
    assert!(states[0].index >= index);
    assert_eq!(states[0].request_ctx, b"q-remote".to_vec());

    // The leader answered remotely, not via its own read states.
    assert!(cluster.read_states(leader).is_empty());
}

#[test]
fn test_read_index_fails_without_a_leader() {
    let mut cluster = Cluster::new(3);
    let leader = cluster.check_one_leader();

    let lonely = (1..=3).find(|&id| id != leader).unwrap();
    for id in 1..=3 {
        if id != lonely {
            cluster.disconnect(id);
        }
    }
    cluster.tick_n(3 * cluster.election_ticks());

    let err = cluster.read_index(lonely, b"q".to_vec()).unwrap_err();
    assert!(matches!(err, ProposeError::NotLeader { .. }));
}

#[test]
fn test_snapshot_brings_lagging_follower_up_to_date() {
    let mut cluster = Cluster::new(3);
    let leader = cluster.check_one_leader();
    cluster.one(b"a".to_vec(), 3);
    cluster.one(b"b".to_vec(), 3);

    let lagger = (1..=3).find(|&id| id != leader).unwrap();
    cluster.disconnect(lagger);

    for k in 0..3 {
        cluster.one(format!("late{}", k).into_bytes(), 2);
    }

    // Compact the leader past everything the lagger has.
    cluster.take_snapshot(leader);
    assert!(
        cluster.first_log_index(leader) > cluster.commit_index(lagger) + 1,
        "compaction did not pass the lagger's log"
    );

    cluster.connect(lagger);
    cluster.tick_n(2 * cluster.election_ticks());

    assert_eq!(cluster.applied(lagger), cluster.applied(leader));
    assert_eq!(cluster.commit_index(lagger), cluster.commit_index(leader));
}

//! Election scenarios on the deterministic simulator
//!
//! These mirror the classic partition dramas: first election, brief
//! partitions, leader crashes, quorum loss, and leader stickiness.

use tickraft::core::raft_core::Role;
use tickraft::testing::Cluster;

/// The next node ID in a 3-node ring.
fn next(id: u64) -> u64 {
    id % 3 + 1
}

#[test]
fn test_initial_election() {
    let mut cluster = Cluster::new(3);

    let leader = cluster.check_one_leader();

    // Leader and term stay the same while nothing fails.
    let term1 = cluster.check_terms();
    cluster.tick_n(3 * cluster.election_ticks());
    let term2 = cluster.check_terms();
    assert_eq!(term1, term2, "term changed even though there were no failures");
    assert_eq!(cluster.check_one_leader(), leader);
}

#[test]
fn test_pre_vote_rejected_after_brief_partition() {
    let mut cluster = Cluster::new(3);

    let leader1 = cluster.check_one_leader();
    let term1 = cluster.check_terms();

    // Cut off one follower long enough for it to start campaigning.
    let bystander = next(leader1);
    cluster.disconnect(bystander);
    cluster.tick_n(2 * cluster.election_ticks());

    // Pre-voting must not have moved its term.
    let (term, is_leader) = cluster.state(bystander);
    assert_eq!(term, term1, "pre-vote campaigns must not bump the term");
    assert!(!is_leader);

    // On rejoin its pre-votes are rejected (the others still hear the
    // leader) and nothing changes.
    cluster.connect(bystander);
    cluster.tick_n(2 * cluster.election_ticks());

    assert_eq!(cluster.check_one_leader(), leader1, "healthy leader was disturbed");
    assert_eq!(cluster.check_terms(), term1, "term changed despite a healthy quorum");
    assert_eq!(cluster.role(bystander), Role::Follower);
}

#[test]
fn test_re_election_after_leader_failure() {
    let mut cluster = Cluster::new(3);

    let leader1 = cluster.check_one_leader();

    // If the leader disconnects, a new one appears.
    cluster.disconnect(leader1);
    let leader2 = cluster.check_one_leader();
    assert_ne!(leader1, leader2);

    // The old leader rejoining does not disturb the new one, and it
    // observes that it lost leadership.
    cluster.connect(leader1);
    cluster.tick_n(3);
    assert_eq!(cluster.check_one_leader(), leader2);
    let (_, is_leader) = cluster.state(leader1);
    assert!(!is_leader, "expired leader still claims leadership");

    // Without a quorum, nobody wins.
    cluster.disconnect(leader2);
    cluster.disconnect(next(leader2));
    cluster.tick_n(3 * cluster.election_ticks());
    cluster.check_no_leader();

    // A restored quorum elects again.
    cluster.connect(next(leader2));
    cluster.check_one_leader();

    // The last rejoin does not unseat anyone.
    cluster.connect(leader2);
    cluster.check_one_leader();
}

#[test]
fn test_loss_of_quorum_never_elects_and_never_inflates_term() {
    let mut cluster = Cluster::new(3);

    let leader = cluster.check_one_leader();
    let term_before = cluster.check_terms();

    // Leave a single node connected.
    let lonely = next(next(leader));
    cluster.disconnect(leader);
    cluster.disconnect(next(leader));

    cluster.tick_n(3 * cluster.election_ticks());
    cluster.check_no_leader();

    // It keeps campaigning tentatively and goes nowhere.
    assert_eq!(cluster.role(lonely), Role::PreCandidate);
    let (term, _) = cluster.state(lonely);
    assert_eq!(term, term_before, "a quorum-less node must not inflate its term");

    // Restoring one peer gives it a quorum again.
    cluster.connect(next(leader));
    cluster.check_one_leader();
}

#[test]
fn test_leader_stickiness_across_churn() {
    let mut cluster = Cluster::new(3);

    // Two leadership changes, each old leader coming back.
    let leader1 = cluster.check_one_leader();
    cluster.disconnect(leader1);

    let leader2 = cluster.check_one_leader();
    cluster.disconnect(leader2);

    cluster.connect(leader1);
    let leader3 = cluster.check_one_leader();

    cluster.connect(leader2);
    cluster.tick_n(2 * cluster.election_ticks());

    assert_eq!(cluster.check_one_leader(), leader3, "leadership flipped on rejoin");
}

//! §8 scenario 2: a write against a non-leader is rejected and the log is
//! left unchanged.

mod fixtures;

use raftlog::{Error, Node, RaftConfig, Role};

use fixtures::{temp_dir, NullTransport, TestStateMachine};

#[tokio::test]
async fn apply_on_a_follower_is_rejected_and_log_is_unchanged() {
    let dir = temp_dir("reject-write");
    let config = RaftConfig::build("reject-write-test").validate().unwrap();
    let node = Node::open(&dir, config, NullTransport, TestStateMachine::default()).await.unwrap();

    assert_eq!(node.state().await, Role::Follower);

    let err = node.apply(b"x".to_vec()).await.unwrap_err();
    assert!(matches!(err, Error::NotLeader(None)));

    // Rejected at the role check, before any segment append: the metrics
    // snapshot published at node-open time still reads index 0.
    assert_eq!(node.metrics().borrow().current_index, 0);

    // Rejecting twice is still just a rejection, not a panic or a changed role.
    let err = node.apply(b"y".to_vec()).await.unwrap_err();
    assert!(matches!(err, Error::NotLeader(None)));
    assert_eq!(node.state().await, Role::Follower);
}

//! Convergence of peers around one sequencer.

use canop_sync::{
    Hub, MemoryNetwork, Path, PeerConfig, PeerEvent, PeerHandle, PeerState, SequencerConfig,
    SignalData,
};
use futures::future::join_all;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::time::Duration;

const A: usize = 0;
const B: usize = 1;

fn network(value: &str) -> MemoryNetwork {
    let config = SequencerConfig::builder().initial_value(value).build();
    let mut network = MemoryNetwork::new(config, 2).unwrap();
    network.pump().unwrap();
    network
}

fn root() -> Path {
    Path::root()
}

fn assert_converged(network: &MemoryNetwork, expected: &str) {
    assert_eq!(network.sequencer.value(), expected);
    for peer in &network.peers {
        assert_eq!(peer.value(), expected);
        assert_eq!(peer.canon_value(), expected);
    }
    assert!(network.converged());
}

// ============================================================================
// Two-peer scenarios
// ============================================================================

fn concurrent_inserts(first: usize, second: usize) -> MemoryNetwork {
    let mut network = network("bc");
    network.peers[A].add(&root(), 2, "d").unwrap();
    network.peers[B].add(&root(), 0, "a").unwrap();
    network.peers[A].add(&root(), 3, "e").unwrap();
    assert_eq!(network.peers[A].value(), "bcde");
    assert_eq!(network.peers[B].value(), "abc");

    network.deliver_to_server(first).unwrap();
    network.deliver_to_server(second).unwrap();
    network.pump().unwrap();
    network
}

#[test]
fn inserts_commit_a_then_b() {
    let network = concurrent_inserts(A, B);
    assert_converged(&network, "abcde");
}

#[test]
fn inserts_commit_b_then_a() {
    let network = concurrent_inserts(B, A);
    assert_converged(&network, "abcde");
}

#[test]
fn delete_and_insert() {
    for first in [A, B] {
        let mut network = network("bcz");
        network.peers[A].remove(&root(), 2, "z").unwrap();
        network.peers[B].add(&root(), 0, "a").unwrap();

        network.deliver_to_server(first).unwrap();
        network.deliver_to_server(1 - first).unwrap();
        network.pump().unwrap();
        assert_converged(&network, "abc");
    }
}

#[test]
fn deletes_at_both_ends() {
    for first in [A, B] {
        let mut network = network("xaby");
        network.peers[A].remove(&root(), 0, "x").unwrap();
        network.peers[B].remove(&root(), 3, "y").unwrap();

        network.deliver_to_server(first).unwrap();
        network.deliver_to_server(1 - first).unwrap();
        network.pump().unwrap();
        assert_converged(&network, "ab");
    }
}

#[test]
fn insert_inside_concurrent_deletion_survives() {
    let mut network = network("abxyze");
    network.peers[A].remove(&root(), 2, "xyz").unwrap();
    network.peers[B].add(&root(), 4, "cd").unwrap();

    network.deliver_to_server(A).unwrap();
    network.deliver_to_server(B).unwrap();
    network.pump().unwrap();
    assert_converged(&network, "abcde");
}

#[test]
fn later_commit_lands_before_at_same_offset() {
    let mut network = network("xy");
    network.peers[A].add(&root(), 1, "a").unwrap();
    network.peers[B].add(&root(), 1, "b").unwrap();
    network.deliver_to_server(A).unwrap();
    network.deliver_to_server(B).unwrap();
    network.pump().unwrap();
    assert_converged(&network, "xbay");

    let mut network = self::network("xy");
    network.peers[A].add(&root(), 1, "a").unwrap();
    network.peers[B].add(&root(), 1, "b").unwrap();
    network.deliver_to_server(B).unwrap();
    network.deliver_to_server(A).unwrap();
    network.pump().unwrap();
    assert_converged(&network, "xaby");
}

#[test]
fn set_replaces_value_everywhere() {
    let mut network = network("draft");
    network.peers[A]
        .set(&root(), "final", Some("draft".into()))
        .unwrap();
    network.pump().unwrap();
    assert_converged(&network, "final");
}

#[test]
fn remote_change_remaps_caret() {
    let mut network = network("bc");
    let mut events = network.peers[B].subscribe();

    network.peers[A].add(&root(), 0, "a").unwrap();
    network.pump().unwrap();

    match events.try_recv().unwrap() {
        PeerEvent::Change(change) => {
            assert_eq!(change.changes.len(), 1);
            assert_eq!(change.remap(1), 2);
            assert_eq!(change.remap(0), 0);
        }
        other => panic!("expected a change, got {:?}", other),
    }
    assert!(matches!(events.try_recv().unwrap(), PeerEvent::Synced));
}

// ============================================================================
// Recovery
// ============================================================================

#[test]
fn lost_ack_is_recovered_without_duplicates() {
    let mut network = network("");
    network.peers[A].add(&root(), 0, "q").unwrap();
    network.deliver_to_server(A).unwrap();
    assert_eq!(network.sequencer.canon().len(), 1);

    // The broadcast carrying the acknowledgement is lost with the link.
    network.disconnect(A);
    assert_eq!(network.peers[A].state(), PeerState::Unsyncable);
    assert_eq!(network.peers[A].sent().len(), 1);

    network.reconnect(A).unwrap();
    network.pump().unwrap();

    assert_eq!(network.peers[A].peer_id(), 1);
    assert_eq!(network.sequencer.canon().len(), 1);
    assert_converged(&network, "q");
}

#[test]
fn lost_batch_is_resent() {
    let mut network = network("");
    network.peers[A].add(&root(), 0, "q").unwrap();
    assert_eq!(network.lose_outgoing(A), 1);

    network.disconnect(A);
    network.reconnect(A).unwrap();
    network.pump().unwrap();

    assert_eq!(network.sequencer.canon().len(), 1);
    assert_converged(&network, "q");
}

#[test]
fn edits_while_offline_are_sent_on_reconnect() {
    let mut network = network("bc");
    network.disconnect(A);
    network.peers[A].add(&root(), 2, "d").unwrap();
    network.peers[B].add(&root(), 0, "a").unwrap();
    network.pump().unwrap();
    assert_eq!(network.peers[A].local().len(), 1);

    network.reconnect(A).unwrap();
    network.pump().unwrap();
    assert_converged(&network, "abcd");
}

#[test]
fn pruned_base_falls_back_to_snapshot() {
    let mut network = network("bc");
    network.disconnect(A);

    network.peers[B].add(&root(), 0, "a").unwrap();
    network.pump().unwrap();
    network.peers[B].add(&root(), 3, "d").unwrap();
    network.pump().unwrap();
    assert!(network.sequencer.operations_since(1).is_none());

    network.peers[A].add(&root(), 2, "!").unwrap();
    network.reconnect(A).unwrap();
    network.pump().unwrap();

    // The snapshot replaces the old canon; offline edits replay on top of it.
    assert_eq!(network.peers[A].state(), PeerState::Ready);
    assert_converged(&network, "ab!cd");
}

#[test]
fn history_is_pruned_once_everyone_has_it() {
    let mut network = network("");
    for i in 0..10 {
        network.peers[i % 2].add(&root(), 0, "x").unwrap();
        network.pump().unwrap();
    }
    assert_converged(&network, "xxxxxxxxxx");
    assert!(network.sequencer.canon().len() < 10);
    let floor = network.sequencer.canon().first().map(|op| op.mark.base);
    assert!(floor.is_some());
}

// ============================================================================
// Signals
// ============================================================================

#[test]
fn signals_reach_other_peers() {
    let mut network = network("");
    assert_eq!(network.peers[A].connected(), 2);
    assert_eq!(network.peers[B].connected(), 2);

    let mut data = SignalData::new();
    data.insert("caret".into(), json!(1));
    data.insert("name".into(), json!("ada"));
    network.peers[A].signal(data).unwrap();
    network.pump().unwrap();

    let seen = &network.peers[B].signals()[&1];
    assert_eq!(seen["caret"], 1);
    assert_eq!(seen["name"], "ada");

    network.disconnect(A);
    network.pump().unwrap();
    assert_eq!(network.peers[B].connected(), 1);
}

// ============================================================================
// Arbitrary interleavings
// ============================================================================

#[derive(Clone, Debug)]
enum Step {
    Insert { peer: usize, at: usize, text: String },
    Delete { peer: usize, at: usize, len: usize },
    ToServer(usize),
    ToPeer(usize),
}

fn step(peers: usize) -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..peers, any::<usize>(), "[a-z]{1,3}")
            .prop_map(|(peer, at, text)| Step::Insert { peer, at, text }),
        (0..peers, any::<usize>(), 1..3usize).prop_map(|(peer, at, len)| Step::Delete { peer, at, len }),
        (0..peers).prop_map(Step::ToServer),
        (0..peers).prop_map(Step::ToPeer),
    ]
}

fn run(network: &mut MemoryNetwork, step: Step) {
    match step {
        Step::Insert { peer, at, text } => {
            let len = network.peers[peer].value().chars().count();
            network.peers[peer].add(&root(), at % (len + 1), text).unwrap();
        }
        Step::Delete { peer, at, len } => {
            let value: Vec<char> = network.peers[peer].value().chars().collect();
            if value.is_empty() {
                return;
            }
            let at = at % value.len();
            let end = (at + len).min(value.len());
            let text: String = value[at..end].iter().collect();
            network.peers[peer].remove(&root(), at, text).unwrap();
        }
        Step::ToServer(peer) => {
            network.deliver_to_server(peer).unwrap();
        }
        Step::ToPeer(peer) => {
            network.deliver_to_peer(peer).unwrap();
        }
    }
}

proptest! {
    #[test]
    fn any_interleaving_converges(
        initial in "[a-z]{0,8}",
        steps in prop::collection::vec(step(3), 1..60),
    ) {
        let config = SequencerConfig::builder().initial_value(initial).build();
        let mut network = MemoryNetwork::new(config, 3).unwrap();
        network.pump().unwrap();

        for step in steps {
            run(&mut network, step);
        }
        network.pump().unwrap();

        prop_assert!(network.converged());
        let expected = network.sequencer.value().to_string();
        for peer in &network.peers {
            prop_assert_eq!(peer.value(), expected.as_str());
        }
    }
}

// ============================================================================
// Hub
// ============================================================================

async fn wait_for_convergence(hub: &Hub, peers: &[PeerHandle]) -> String {
    for _ in 0..400 {
        let snapshot = hub.snapshot().await.unwrap();
        if peers
            .iter()
            .all(|peer| peer.is_idle() && peer.value() == snapshot.value)
        {
            return snapshot.value;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("peers did not converge");
}

#[tokio::test]
async fn hub_peers_converge_under_concurrent_edits() {
    let hub = Hub::spawn(SequencerConfig::builder().initial_value("seed").build());
    let mut peers = Vec::new();
    for _ in 0..4 {
        peers.push(PeerHandle::join(&hub, PeerConfig::default()).await.unwrap());
    }
    wait_for_convergence(&hub, &peers).await;

    let edits = peers.iter().enumerate().map(|(index, peer)| async move {
        let mut rng = StdRng::seed_from_u64(index as u64);
        for i in 0..25 {
            peer.with(|peer| {
                let len = peer.value().chars().count();
                let at = rng.gen_range(0..=len);
                peer.add(&root(), at, format!("{}", index)).unwrap();
                if i % 5 == 4 && len > 0 {
                    let at = rng.gen_range(0..len);
                    let text: String = peer.value().chars().skip(at).take(1).collect();
                    peer.remove(&root(), at, text).unwrap();
                }
            });
            tokio::task::yield_now().await;
        }
    });
    join_all(edits).await;

    let value = wait_for_convergence(&hub, &peers).await;
    for peer in &peers {
        assert_eq!(peer.value(), value);
    }
    let sequencer = hub.shutdown().await.unwrap();
    assert_eq!(sequencer.value(), value);
}

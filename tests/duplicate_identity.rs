//! Startup duplicate-identity probe: a newly starting node whose chosen id
//! already answers on the mesh must abort before it ever opens its own
//! listener.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use quorumvote::config::NodeConfig;
use quorumvote::error::Error;
use quorumvote::node::Node;
use quorumvote::startup;

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// A probing `alice` never sees itself in a direct target's peer list (a
/// node never gossips its own identity); the startup probe instead catches
/// the case where a seed peer already knows of a live node with our name.
/// Here `bob` is connected to the real `alice`, so a second process trying
/// to start as `alice` and probing `bob` learns of the collision.
#[tokio::test(flavor = "multi_thread")]
async fn duplicate_node_id_is_rejected_before_listening() {
    let alice_port = 34201;
    let bob_port = 34202;

    let alice_config = NodeConfig {
        node_id: "alice".to_string(),
        port: alice_port,
        seeds: vec![],
        no_gui: true,
        gui_only: false,
    };
    let (alice_node, alice_handle) = Node::new(alice_config);
    tokio::spawn(alice_node.run());

    let bob_config = NodeConfig {
        node_id: "bob".to_string(),
        port: bob_port,
        seeds: vec![loopback(alice_port)],
        no_gui: true,
        gui_only: false,
    };
    let (bob_node, bob_handle) = Node::new(bob_config);
    tokio::spawn(bob_node.run());

    tokio::time::sleep(Duration::from_millis(500)).await;

    let result = startup::run("alice", &[loopback(bob_port)]).await;
    assert!(matches!(result, Err(Error::DuplicateIdentity(_))));

    alice_handle.shutdown();
    bob_handle.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_seed_is_not_treated_as_duplicate() {
    let result = startup::run("someone", &[loopback(34299)]).await;
    assert!(result.is_ok());
}

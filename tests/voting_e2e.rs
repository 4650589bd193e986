//! Three-node end-to-end voting scenario over real loopback sockets:
//! alice starts a round with finite choices, all three nodes vote, and
//! every node converges on the same tally.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use quorumvote::cli::Command;
use quorumvote::config::NodeConfig;
use quorumvote::node::{Node, NodeHandle};

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn spawn_node(node_id: &str, port: u16, seeds: Vec<SocketAddr>) -> NodeHandle {
    let config = NodeConfig {
        node_id: node_id.to_string(),
        port,
        seeds,
        no_gui: true,
        gui_only: false,
    };
    let (node, handle) = Node::new(config);
    tokio::spawn(node.run());
    handle
}

async fn wait_for<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn three_nodes_converge_on_identical_tally() {
    let alice_port = 34101;
    let bob_port = 34102;
    let carol_port = 34103;

    let alice = spawn_node("alice", alice_port, vec![]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let bob = spawn_node("bob", bob_port, vec![loopback(alice_port)]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let carol = spawn_node("carol", carol_port, vec![loopback(bob_port)]);

    // Let the mesh fully connect (bob <-> alice, carol <-> bob, and carol
    // gossip-discovering alice through bob's handshake ack).
    tokio::time::sleep(Duration::from_secs(2)).await;

    let network = alice.command(Command::Network).await.unwrap();
    assert!(network.contains("active_peers=2"), "alice's mesh view: {network}");

    let start_reply = alice
        .command(Command::Start {
            topic: "Deploy?".to_string(),
            allowed_choices: Some(vec!["yes".to_string(), "no".to_string()]),
            voting_time_seconds: Some(30),
        })
        .await
        .unwrap();
    assert!(start_reply.starts_with("started round"), "{start_reply}");

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(alice
        .command(Command::Vote { choice: "yes".to_string() })
        .await
        .unwrap()
        .contains("cast"));
    assert!(bob
        .command(Command::Vote { choice: "no".to_string() })
        .await
        .unwrap()
        .contains("cast"));
    assert!(carol
        .command(Command::Vote { choice: "yes".to_string() })
        .await
        .unwrap()
        .contains("cast"));

    // CONSENSUS fires at 0.8 * 30s = 24s, FINISH backstop at 30s.
    for node in [&alice, &bob, &carol] {
        let reached = wait_for(Duration::from_secs(40), || {
            let node = node.clone();
            Box::pin(async move {
                let status = node.command(Command::Status).await.unwrap();
                status.contains("FINISHED")
            })
        })
        .await;
        assert!(reached, "node did not reach FINISHED in time");
    }

    for node in [&alice, &bob, &carol] {
        let results = node.command(Command::Results).await.unwrap();
        assert!(results.contains("yes: 2"), "unexpected tally: {results}");
        assert!(results.contains("no: 1"), "unexpected tally: {results}");
    }

    alice.shutdown();
    bob.shutdown();
    carol.shutdown();
}

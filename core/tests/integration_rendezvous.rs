//! Rendezvous Integration Tests
//!
//! Drive a real RelayServer end to end: introductions over the introduction
//! endpoint, then reciprocal connection requests paired by the broker.
//!
//! Run with: cargo test --test integration_rendezvous

use peerlink_core::{
    Codec, Connector, ControlMessage, Endpoint, Frame, JsonCodec, Link, LocalConnector,
    RelayServer, ServerEvent,
};
use std::sync::Arc;
use std::time::Duration;

async fn recv_control(link: &mut Link) -> ControlMessage {
    let frame = tokio::time::timeout(Duration::from_secs(1), link.recv())
        .await
        .expect("timed out waiting for a control message")
        .expect("introduction link closed")
        .expect("transport error");
    JsonCodec.decode(&frame).expect("relay sent an undecodable frame")
}

async fn join(link: &mut Link, topics: &[&str]) {
    let message = ControlMessage::Join {
        topics: topics.iter().map(|t| t.to_string()).collect(),
    };
    link.send(JsonCodec.encode(&message).unwrap()).await.unwrap();
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_alice_and_bob_share_doc_1() {
    let server = RelayServer::new();
    let connector = LocalConnector::new(Arc::clone(&server));

    let mut alice = connector.dial(&Endpoint::introduction("alice")).await.unwrap();
    let mut bob = connector.dial(&Endpoint::introduction("bob")).await.unwrap();

    join(&mut alice, &["doc-1"]).await;
    wait_for(|| server.topics_of("alice") == vec!["doc-1".to_string()]).await;
    join(&mut bob, &["doc-1"]).await;

    let expected_for_alice = ControlMessage::Introduction {
        peer_id: "bob".to_string(),
        topics: vec!["doc-1".to_string()],
    };
    let expected_for_bob = ControlMessage::Introduction {
        peer_id: "alice".to_string(),
        topics: vec!["doc-1".to_string()],
    };
    assert_eq!(recv_control(&mut alice).await, expected_for_alice);
    assert_eq!(recv_control(&mut bob).await, expected_for_bob);

    // Alice dials first and talks before Bob's request exists
    let mut alice_pipe = connector
        .dial(&Endpoint::connection("alice", "bob", "doc-1"))
        .await
        .unwrap();
    alice_pipe.send(Frame::text("DUDE!!")).await.unwrap();
    wait_for(|| server.get_stats().pending_rendezvous == 1).await;

    let mut bob_pipe = connector
        .dial(&Endpoint::connection("bob", "alice", "doc-1"))
        .await
        .unwrap();
    assert_eq!(bob_pipe.recv().await, Some(Ok(Frame::text("DUDE!!"))));

    bob_pipe.send(Frame::text("sup")).await.unwrap();
    assert_eq!(alice_pipe.recv().await, Some(Ok(Frame::text("sup"))));

    let stats = server.get_stats();
    assert_eq!(stats.pairs_formed, 1);
    assert_eq!(stats.pending_rendezvous, 0);
    assert_eq!(stats.introductions_sent, 2);
}

#[tokio::test]
async fn test_buffered_frames_precede_live_traffic() {
    let server = RelayServer::new();
    let connector = LocalConnector::new(Arc::clone(&server));

    let mut a = connector.dial(&Endpoint::connection("a", "b", "t")).await.unwrap();
    a.send(Frame::text("m1")).await.unwrap();
    a.send(Frame::binary(vec![2])).await.unwrap();
    wait_for(|| server.get_stats().pending_rendezvous == 1).await;

    let mut b = connector.dial(&Endpoint::connection("b", "a", "t")).await.unwrap();
    a.send(Frame::text("m3")).await.unwrap();

    assert_eq!(b.recv().await, Some(Ok(Frame::text("m1"))));
    assert_eq!(b.recv().await, Some(Ok(Frame::Binary(vec![2]))));
    assert_eq!(b.recv().await, Some(Ok(Frame::text("m3"))));
}

#[tokio::test]
async fn test_abandoned_request_never_pairs() {
    let server = RelayServer::new();
    let mut events = server.subscribe();
    let connector = LocalConnector::new(Arc::clone(&server));

    let mut early = connector.dial(&Endpoint::connection("a", "b", "t")).await.unwrap();
    early.send(Frame::text("lost")).await.unwrap();
    wait_for(|| server.get_stats().pending_rendezvous == 1).await;
    drop(early);
    wait_for(|| server.get_stats().pending_rendezvous == 0).await;

    // B arrives late and is left holding instead of pairing with the dead request
    let mut late = connector.dial(&Endpoint::connection("b", "a", "t")).await.unwrap();
    wait_for(|| server.get_stats().pending_rendezvous == 1).await;
    let nothing = tokio::time::timeout(Duration::from_millis(50), late.recv()).await;
    assert!(nothing.is_err());

    let stats = server.get_stats();
    assert_eq!(stats.pairs_formed, 0);
    assert_eq!(stats.abandoned, 1);

    let mut saw_abandoned = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ServerEvent::Abandoned { .. }) {
            saw_abandoned = true;
        }
    }
    assert!(saw_abandoned);
}

#[tokio::test]
async fn test_closing_one_side_closes_the_pipe() {
    let server = RelayServer::new();
    let connector = LocalConnector::new(Arc::clone(&server));

    let a = connector.dial(&Endpoint::connection("a", "b", "t")).await.unwrap();
    let mut b = connector.dial(&Endpoint::connection("b", "a", "t")).await.unwrap();
    wait_for(|| server.get_stats().pairs_formed == 1).await;

    drop(a);
    let closed = tokio::time::timeout(Duration::from_secs(1), b.recv()).await.unwrap();
    assert!(closed.is_none());
}

#[tokio::test]
async fn test_n_way_introductions() {
    let server = RelayServer::new();
    let connector = LocalConnector::new(Arc::clone(&server));
    let n = 5;

    let mut links = Vec::new();
    for i in 0..n {
        let name = format!("peer-{i}");
        let mut link = connector.dial(&Endpoint::introduction(name.clone())).await.unwrap();
        join(&mut link, &["shared"]).await;
        wait_for(|| server.topics_of(&name) == vec!["shared".to_string()]).await;
        links.push((name, link));
    }

    assert_eq!(server.get_stats().introductions_sent as usize, n * (n - 1));
    for (name, link) in links.iter_mut() {
        let mut introduced = Vec::new();
        for _ in 0..n - 1 {
            match recv_control(link).await {
                ControlMessage::Introduction { peer_id, topics } => {
                    assert_eq!(topics, vec!["shared".to_string()]);
                    introduced.push(peer_id);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        introduced.sort();
        introduced.dedup();
        assert_eq!(introduced.len(), n - 1);
        assert!(!introduced.contains(name));
    }
}

#[tokio::test]
async fn test_n_way_introductions_survive_a_mid_sequence_disconnect() {
    let server = RelayServer::new();
    let connector = LocalConnector::new(Arc::clone(&server));
    let n = 5;

    let mut links = Vec::new();
    for i in 0..n {
        let name = format!("peer-{i}");
        let link = connector.dial(&Endpoint::introduction(name.clone())).await.unwrap();
        links.push((name, link));
    }
    wait_for(|| server.get_stats().peers_connected == n).await;

    // peer-0 joins, two more follow, then peer-0 goes away mid-sequence
    for (name, link) in links.iter_mut().take(3) {
        join(link, &["shared"]).await;
        let name = name.clone();
        wait_for(|| server.topics_of(&name) == vec!["shared".to_string()]).await;
    }
    let (_, departed) = links.remove(0);
    drop(departed);
    wait_for(|| !server.is_peer_connected("peer-0")).await;

    for (name, link) in links.iter_mut().skip(2) {
        join(link, &["shared"]).await;
        let name = name.clone();
        wait_for(|| server.topics_of(&name) == vec!["shared".to_string()]).await;
    }

    let mut among_survivors = 0;
    for (index, (name, link)) in links.iter_mut().enumerate() {
        let expected = if index < 2 { n - 1 } else { n - 2 };
        for _ in 0..expected {
            match recv_control(link).await {
                ControlMessage::Introduction { peer_id, .. } if peer_id == "peer-0" => {
                    assert!(index < 2, "{} heard about peer-0 after it left", name);
                }
                ControlMessage::Introduction { peer_id, .. } => {
                    assert_ne!(peer_id.as_str(), name.as_str());
                    among_survivors += 1;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }
    assert_eq!(among_survivors, (n - 1) * (n - 2));
}

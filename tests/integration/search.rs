use std::collections::BTreeSet;

use crate::*;

#[tokio::test]
async fn test_triangle_search_visits_each_peer_once() {
    let mesh = Mesh::build(&[1, 2, 3], &[], &[(1, 2), (2, 3), (3, 1)])
        .await
        .unwrap();

    let summary = tokio::time::timeout(WAIT, mesh.node(1).start_search().unwrap().finished())
        .await
        .expect("search should finish")
        .expect("search started");

    // 1 asks 2 and 3 in one go; both already know the other is visited.
    assert_eq!(summary.forwarded, 2);
    assert_eq!(summary.answered, 2);
    assert!(!summary.timed_out);
    assert_eq!(summary.visited.len(), 3);

    for node in mesh.nodes.values() {
        assert!(node.coordinator().active_sessions().is_empty());
    }

    let map = mesh.node(1).current_map();
    assert_eq!(map.entries.len(), 3);
    let two = &map.entries[&peer(2)];
    assert!(two.direct && two.relay_capable);
    assert!(two.neighbors.contains(&peer(3)));

    let tree = mesh.node(1).tree();
    let peers = tree.peers();
    let unique: BTreeSet<_> = peers.iter().copied().collect();
    assert_eq!(peers.len(), unique.len());
    assert_eq!(unique.len(), 3);

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_line_search_reaches_peers_beyond_range() {
    // 1 - 2 - 3 - 4 - 5, where 5 is a plain device with a service.
    let mesh = Mesh::build(&[1, 2, 3, 4], &[5], &[(1, 2), (2, 3), (3, 4), (4, 5)])
        .await
        .unwrap();
    host_echo(&mesh.link(5), "echo").await.unwrap();

    let summary = tokio::time::timeout(WAIT, mesh.node(1).start_search().unwrap().finished())
        .await
        .expect("search should finish")
        .unwrap();
    assert_eq!(summary.forwarded, 1);
    assert!(!summary.timed_out);

    let map = mesh.node(1).current_map();
    for n in 2..=5 {
        assert!(map.entries.contains_key(&peer(n)), "missing {}", peer(n));
    }
    assert!(map.entries[&peer(2)].direct);
    assert!(!map.entries[&peer(4)].direct);
    assert!(!map.entries[&peer(5)].relay_capable);
    assert_eq!(map.services[&peer(5)][0].name, "echo");

    let tree = mesh.node(1).tree();
    let mut chain = Vec::new();
    let mut at = &tree;
    while let Some(child) = at.children.first() {
        assert_eq!(at.children.len(), 1);
        chain.push(child.peer);
        at = child;
    }
    assert_eq!(chain, vec![peer(2), peer(3), peer(4), peer(5)]);

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_repeat_search_is_stable() {
    let mesh = Mesh::build(&[1, 2, 3], &[], &[(1, 2), (2, 3)])
        .await
        .unwrap();
    let node = mesh.node(1);

    node.start_search().unwrap().finished().await.unwrap();
    let first = node.current_map();
    let again = node.start_search().unwrap().finished().await.unwrap();
    assert!(!again.timed_out);
    assert_eq!(node.current_map(), first);

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_waiting_search() {
    let mesh = Mesh::build(&[1], &[2], &[(1, 2)]).await.unwrap();

    // 2 advertises a control port that accepts but never answers.
    let silent = mesh.link(2);
    let acceptor = silent
        .listen(ProtocolKind::ConnectionOriented, 0)
        .await
        .unwrap();
    silent
        .advertise(&ServiceDescriptor {
            kind: ProtocolKind::ConnectionOriented,
            port: acceptor.local_port(),
            name: "btroute-control".into(),
            service_uuid: btroute_core::wire::CONTROL_SERVICE_UUID,
            service_classes: Default::default(),
        })
        .await
        .unwrap();

    let trigger = mesh.node(1).start_search().unwrap();
    tokio::time::timeout(WAIT, async {
        while mesh.node(1).coordinator().active_sessions().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session should start waiting");

    mesh.node(1).shutdown().await;
    let summary = tokio::time::timeout(Duration::from_secs(2), trigger.finished())
        .await
        .expect("shutdown should end the wait")
        .unwrap();
    assert!(summary.cancelled);
    assert!(matches!(
        mesh.node(1).start_search(),
        Err(btroute_services::NodeError::Unavailable)
    ));
    drop(acceptor);
}

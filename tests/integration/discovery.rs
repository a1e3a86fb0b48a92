use crate::*;

#[tokio::test]
async fn test_discovery_stops_after_one_relay() {
    // 1 - 2 - 3 - 4
    let mesh = Mesh::build(&[1, 2, 3, 4], &[], &[(1, 2), (2, 3), (3, 4)])
        .await
        .unwrap();

    let summary = tokio::time::timeout(WAIT, mesh.node(1).start_discovery().unwrap().finished())
        .await
        .expect("discovery should finish")
        .unwrap();
    assert_eq!(summary.forwarded, 1);
    assert_eq!(summary.answered, 1);

    let map = mesh.node(1).current_map();
    assert!(map.entries[&peer(2)].direct);
    // 2 reports what its own scan saw, nothing further.
    assert!(map.entries.contains_key(&peer(3)));
    assert!(!map.entries.contains_key(&peer(4)));

    // 2 never asked 3 anything.
    assert!(!mesh.node(3).current_map().entries.contains_key(&peer(1)));

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_local_scan_filters_unresponsive_devices() {
    let mesh = Mesh::build(&[1], &[2, 3], &[(1, 2), (1, 3)]).await.unwrap();
    mesh.air.set_responsive(peer(3), false);

    let found = mesh
        .node(1)
        .start_local_scan()
        .unwrap()
        .finished()
        .await
        .unwrap();
    assert_eq!(found, [peer(2)].into_iter().collect());

    let map = mesh.node(1).current_map();
    assert!(map.entries.contains_key(&peer(2)));
    assert!(!map.entries.contains_key(&peer(3)));
    assert_eq!(map.entries[&peer(2)].display_name, "dev-2");

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_diamond_search_answers_both_branches() {
    //   2
    //  / \
    // 1   4 - 5
    //  \ /
    //   3
    // 2 and 3 both forward to 4 under their own sessions.
    let mesh = Mesh::build(
        &[1, 2, 3, 4],
        &[5],
        &[(1, 2), (1, 3), (2, 4), (3, 4), (4, 5)],
    )
    .await
    .unwrap();

    let summary = tokio::time::timeout(WAIT, mesh.node(1).start_search().unwrap().finished())
        .await
        .expect("search should finish")
        .unwrap();
    assert_eq!(summary.answered, 2);
    assert!(!summary.timed_out);

    let map = mesh.node(1).current_map();
    let four = &map.entries[&peer(4)];
    assert!(four.relay_capable);
    assert!(!four.direct);
    assert_eq!(
        four.neighbors,
        [peer(2), peer(3), peer(5)].into_iter().collect()
    );
    assert!(map.entries[&peer(2)].neighbors.contains(&peer(4)));
    assert!(map.entries[&peer(3)].neighbors.contains(&peer(4)));
    assert!(map.entries.contains_key(&peer(5)));

    for node in mesh.nodes.values() {
        assert!(node.coordinator().active_sessions().is_empty());
    }
    mesh.shutdown().await;
}

use crate::*;

#[tokio::test]
async fn test_tunnel_bridges_out_of_range_service() {
    // 1 - 2 - 3, where 3 is a plain device with an echo service.
    let mesh = Mesh::build(&[1, 2], &[3], &[(1, 2), (2, 3)]).await.unwrap();
    let echo = host_echo(&mesh.link(3), "echo").await.unwrap();
    let client = mesh.link(1);
    assert!(exchange(&client, peer(3), echo.port, b"x").await.is_err());

    // 1 learns about 3's service through 2.
    mesh.node(1).start_search().unwrap().finished().await.unwrap();
    let services = mesh.node(1).current_map().services[&peer(3)].clone();
    assert_eq!(services, vec![echo.clone()]);

    // 2 relays it.
    mesh.node(2).start_local_scan().unwrap().finished().await.unwrap();
    let tunnel = mesh.node(2).start_tunnel(peer(3), 0).await.unwrap();
    let offered = client.find_services(peer(2)).await.unwrap();
    let relayed = offered
        .iter()
        .find(|s| s.name == format!("echo via {}", peer(2)))
        .expect("relayed service advertised");
    assert_eq!(relayed.port, tunnel.local_port());
    assert_eq!(relayed.service_uuid, echo.service_uuid);

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i * 7 % 256) as u8).collect();
    let back = exchange(&client, peer(2), tunnel.local_port(), &payload)
        .await
        .unwrap();
    assert_eq!(back, payload);

    // The relay is back to accepting once the first client is gone.
    let back = exchange(&client, peer(2), tunnel.local_port(), b"second client")
        .await
        .unwrap();
    assert_eq!(back, b"second client");

    tunnel.close();
    let served = tokio::time::timeout(WAIT, tunnel.join())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(served, 2);
    assert!(client
        .find_services(peer(2))
        .await
        .unwrap()
        .iter()
        .all(|s| !s.name.starts_with("echo via")));

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_node_shutdown_closes_tunnels() {
    let mesh = Mesh::build(&[1], &[2], &[(1, 2)]).await.unwrap();
    host_echo(&mesh.link(2), "echo").await.unwrap();
    mesh.node(1).start_local_scan().unwrap().finished().await.unwrap();

    let tunnel = mesh.node(1).start_tunnel(peer(2), 0).await.unwrap();
    mesh.node(1).shutdown().await;
    tokio::time::timeout(WAIT, tunnel.join())
        .await
        .expect("tunnel should stop with its node")
        .unwrap();
}

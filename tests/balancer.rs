mod common;

use std::time::Duration;

use common::{connect, dead_addr, eventually, next_json, next_of_type, spawn_balancer, spawn_server};
use maze_fleet::balancer::{BreakerState, PoolSettings};
use maze_fleet::config::{BalancerConfig, ServerConfig};

fn balancer_config(backends: Vec<String>) -> BalancerConfig {
    BalancerConfig {
        backends,
        connect_timeout: Duration::from_secs(2),
        ..BalancerConfig::default()
    }
}

#[tokio::test]
async fn proxies_frames_from_backend() {
    let (backend, rooms) = spawn_server(ServerConfig::default()).await;
    let (lb, state) = spawn_balancer(balancer_config(vec![format!("ws://{backend}")])).await;

    let mut client = connect(lb, "room=ABCDEF").await;
    let assignment = next_json(&mut client).await.unwrap();
    assert_eq!(assignment["type"], "room_assignment");
    assert_eq!(assignment["room_id"], "ABCDEF");

    let snapshot = next_of_type(&mut client, "state").await;
    assert_eq!(snapshot["room_id"], "ABCDEF");
    assert_eq!(state.pool.total_active(), 1);
    assert_eq!(rooms.rooms.stats().players, 1);

    drop(client);
    assert!(eventually(|| state.pool.total_active() == 0).await);
    assert!(eventually(|| rooms.rooms.stats().players == 0).await);
}

#[tokio::test]
async fn same_token_lands_on_same_backend() {
    let (first, rooms_a) = spawn_server(ServerConfig::default()).await;
    let (second, rooms_b) = spawn_server(ServerConfig::default()).await;
    let (lb, _state) = spawn_balancer(balancer_config(vec![
        format!("ws://{first}"),
        format!("ws://{second}"),
    ]))
    .await;

    let mut a = connect(lb, "action=create&room=ABCDEF").await;
    assert_eq!(next_json(&mut a).await.unwrap()["room_id"], "ABCDEF");
    let mut b = connect(lb, "action=join&room=ABCDEF").await;
    assert_eq!(next_json(&mut b).await.unwrap()["room_id"], "ABCDEF");

    let seated = rooms_a.rooms.stats().players + rooms_b.rooms.stats().players;
    assert_eq!(seated, 2);
    assert_eq!(rooms_a.rooms.stats().rooms + rooms_b.rooms.stats().rooms, 1);
}

#[tokio::test]
async fn created_room_is_reachable_by_its_token() {
    let (first, rooms_a) = spawn_server(ServerConfig::default()).await;
    let (second, rooms_b) = spawn_server(ServerConfig::default()).await;
    let (lb, _state) = spawn_balancer(balancer_config(vec![
        format!("ws://{first}"),
        format!("ws://{second}"),
    ]))
    .await;

    // Enough rounds that least-connections and token hashing would disagree
    let mut sessions = Vec::new();
    for _ in 0..8 {
        let mut host = connect(lb, "action=create").await;
        let assignment = next_json(&mut host).await.unwrap();
        assert_eq!(assignment["type"], "room_assignment");
        let token = assignment["room_id"].as_str().unwrap().to_string();

        let mut friend = connect(lb, &format!("action=join&room={token}")).await;
        let joined = next_json(&mut friend).await.unwrap();
        assert_eq!(joined["type"], "room_assignment", "friend of {token} got {joined}");
        assert_eq!(joined["room_id"], token.as_str());
        sessions.push((host, friend));
    }

    let seated = rooms_a.rooms.stats().players + rooms_b.rooms.stats().players;
    assert_eq!(seated, 16);
    assert_eq!(rooms_a.rooms.stats().rooms + rooms_b.rooms.stats().rooms, 8);
}

#[tokio::test]
async fn dead_backend_reports_unavailable_and_opens_breaker() {
    let (lb, state) = spawn_balancer(balancer_config(vec![format!("ws://{}", dead_addr())])).await;

    let mut client = connect(lb, "").await;
    let frame = next_json(&mut client).await.unwrap();
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["code"], "backend_unavailable");
    assert!(next_json(&mut client).await.is_none());

    let status = state.pool.status();
    assert_eq!(status[0].state, BreakerState::Open);
    assert_eq!(status[0].active, 0);

    // Cooling down: nothing eligible
    let mut client = connect(lb, "").await;
    assert_eq!(next_json(&mut client).await.unwrap()["code"], "no_backend");
}

#[tokio::test]
async fn retries_on_another_backend() {
    let (live, _rooms) = spawn_server(ServerConfig::default()).await;
    let (lb, state) = spawn_balancer(balancer_config(vec![
        format!("ws://{}", dead_addr()),
        format!("ws://{live}"),
    ]))
    .await;

    let mut client = connect(lb, "").await;
    assert_eq!(next_json(&mut client).await.unwrap()["type"], "room_assignment");

    let status = state.pool.status();
    assert_eq!(status[0].state, BreakerState::Open);
    assert_eq!(status[1].state, BreakerState::Closed);
    assert_eq!(status[1].active, 1);
}

#[tokio::test]
async fn full_pool_reports_busy() {
    let (backend, _rooms) = spawn_server(ServerConfig::default()).await;
    let (lb, _state) = spawn_balancer(BalancerConfig {
        pool: PoolSettings {
            capacity: 1,
            ..PoolSettings::default()
        },
        ..balancer_config(vec![format!("ws://{backend}")])
    })
    .await;

    let mut seated = connect(lb, "").await;
    next_of_type(&mut seated, "room_assignment").await;

    let mut turned_away = connect(lb, "").await;
    assert_eq!(next_json(&mut turned_away).await.unwrap()["code"], "servers_busy");
}

#[tokio::test]
async fn removing_backend_cuts_its_sessions() {
    let (backend, _rooms) = spawn_server(ServerConfig::default()).await;
    let url = format!("ws://{backend}");
    let (lb, state) = spawn_balancer(balancer_config(vec![url.clone()])).await;

    let mut client = connect(lb, "").await;
    next_of_type(&mut client, "room_assignment").await;

    assert!(state.pool.remove_backend(&url));
    // Drains to close once the relay stops
    while next_json(&mut client).await.is_some() {}
    assert_eq!(state.pool.total_active(), 0);
}

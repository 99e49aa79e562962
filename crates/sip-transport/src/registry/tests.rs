use std::net::SocketAddr;
use std::time::Duration;

use proptest::prelude::*;

use super::*;
use crate::connection::{ConnectionState, StreamConnection};
use crate::test_support::{eventually, listener, MockConnection};

fn registry(max_connections: usize) -> Arc<ConnectionRegistry> {
    ConnectionRegistry::new(&TransportConfig {
        max_connections,
        ..TransportConfig::default()
    })
    .unwrap()
}

fn conn(transport: TransportType, remote_port: u16) -> (Arc<MockConnection>, Arc<dyn Connection>) {
    let mock = MockConnection::new(transport, remote_port, 60);
    let shared: Arc<dyn Connection> = mock.clone();
    (mock, shared)
}

#[tokio::test]
async fn test_ceiling_toggles_stream_listeners_only() {
    let registry = registry(2);
    let (tcp_listener, _) = listener(TransportType::Tcp, 16060);
    let (udp_listener, _) = listener(TransportType::Udp, 16060);
    registry.add_listener(tcp_listener.clone()).unwrap();
    registry.add_listener(udp_listener.clone()).unwrap();
    registry.set_listeners_active(true).unwrap();
    assert!(tcp_listener.is_active());
    assert!(udp_listener.is_active());

    let (_, c1) = conn(TransportType::Tcp, 40001);
    let (_, c2) = conn(TransportType::Tls, 40002);
    registry.put(c1.clone());
    assert!(tcp_listener.is_active());
    assert_eq!(registry.stream_connection_count(), 1);

    registry.put(c2);
    assert_eq!(registry.stream_connection_count(), 2);
    assert!(!tcp_listener.is_active());
    assert!(udp_listener.is_active());

    assert!(registry.remove(&c1, false).await);
    assert_eq!(registry.stream_connection_count(), 1);
    assert!(tcp_listener.is_active());

    registry.stop().await;
    assert!(!tcp_listener.is_active());
    assert!(!udp_listener.is_active());
    assert_eq!(registry.connection_count(), 0);
}

#[tokio::test]
async fn test_added_stream_listener_follows_admission_state() {
    let registry = registry(1);
    let (_, c1) = conn(TransportType::Tcp, 40001);
    registry.put(c1.clone());

    let (tls_listener, point) = listener(TransportType::Tls, 16061);
    registry.add_listener(tls_listener.clone()).unwrap();
    assert!(!tls_listener.is_active());
    assert_eq!(point.creates.load(std::sync::atomic::Ordering::SeqCst), 0);

    registry.remove(&c1, true).await;
    assert!(tls_listener.is_active());
    registry.stop().await;
}

#[tokio::test]
async fn test_set_max_connections_converges_immediately() {
    let registry = registry(3);
    let (tcp_listener, _) = listener(TransportType::Tcp, 16062);
    registry.add_listener(tcp_listener.clone()).unwrap();
    registry.put(conn(TransportType::Tcp, 40001).1);
    registry.put(conn(TransportType::Tcp, 40002).1);
    assert!(tcp_listener.is_active());

    registry.set_max_connections(2);
    assert_eq!(registry.max_connections(), 2);
    assert!(!tcp_listener.is_active());

    registry.set_max_connections(5);
    assert!(tcp_listener.is_active());
    registry.stop().await;
}

#[tokio::test]
async fn test_datagram_traffic_never_touches_stream_admission() {
    let registry = registry(1);
    let (tcp_listener, _) = listener(TransportType::Tcp, 16063);
    registry.add_listener(tcp_listener.clone()).unwrap();

    let udp: Vec<Arc<dyn Connection>> = (0..3).map(|i| conn(TransportType::Udp, 41000 + i).1).collect();
    for connection in &udp {
        registry.put(connection.clone());
    }
    registry.put(conn(TransportType::Multicast, 5060).1);
    assert!(tcp_listener.is_active());
    assert_eq!(registry.stream_connection_count(), 0);
    assert_eq!(registry.counts().udp, 3);
    assert_eq!(registry.counts().multicast, 1);

    for connection in &udp {
        assert!(registry.remove(connection, false).await);
    }
    assert_eq!(registry.counts().udp, 0);
    assert!(tcp_listener.is_active());
    registry.stop().await;
}

#[tokio::test]
async fn test_get_honours_shutdown_flag() {
    let registry = registry(10);
    let (mock, connection) = conn(TransportType::Tcp, 40001);
    let key = connection.binding_info();
    registry.put(connection);
    assert!(registry.get(&key).is_some());

    mock.state().mark_shutting_down();
    assert!(registry.get(&key).is_none());
    assert!(registry.get_with(&key, true).is_none());
    assert!(registry.get_with(&key, false).is_some());
    assert!(registry.get_active_or_connecting(&key).is_none());
}

#[tokio::test]
async fn test_connecting_entry_lookup_and_removal() {
    let registry = registry(10);
    let remote = "10.0.0.9:5060".parse().unwrap();
    let key = BindingInfo::remote(remote, TransportType::Tcp);
    let pending = Arc::new(StreamConnection::connecting(key, remote, TransportType::Tcp, 60));
    let connection: Arc<dyn Connection> = pending.clone();

    assert!(registry.put_if_absent(connection.clone()).is_none());
    assert!(registry.get(&key).is_none());
    assert!(registry.get_active_or_connecting(&key).is_some());
    assert_eq!(registry.summary().tcp.connecting, 1);
    assert!(registry.put_if_absent(connection.clone()).is_some());

    assert!(registry.remove(&connection, false).await);
    assert_eq!(registry.stream_connection_count(), 0);
    assert!(!pending.state().is_closed());
    assert!(registry.get_active_or_connecting(&key).is_none());
}

#[tokio::test]
async fn test_remove_then_get_is_empty() {
    let registry = registry(10);
    let (mock, connection) = conn(TransportType::Tls, 40001);
    let key = connection.binding_info();
    registry.put(connection.clone());

    assert!(registry.remove(&connection, false).await);
    assert!(registry.get(&key).is_none());
    assert_eq!(mock.close_count(), 1);
    assert!(!registry.remove(&connection, false).await);
}

#[tokio::test]
async fn test_remove_skip_close_leaves_socket_open() {
    let registry = registry(10);
    let (mock, connection) = conn(TransportType::Tcp, 40001);
    registry.put(connection.clone());
    assert!(registry.remove(&connection, true).await);
    assert_eq!(mock.close_count(), 0);
}

#[tokio::test]
async fn test_remove_by_key_evicts_replacement() {
    let registry = registry(10);
    let (old_mock, old) = conn(TransportType::Tcp, 40001);
    let (new_mock, new) = conn(TransportType::Tcp, 40001);
    assert_eq!(old.binding_info(), new.binding_info());

    registry.put(old.clone());
    let replaced = registry.put(new.clone()).unwrap();
    assert!(same_connection(&replaced, &old));
    assert_eq!(registry.stream_connection_count(), 1);

    assert!(registry.remove(&old, false).await);
    assert!(registry.get(&old.binding_info()).is_none());
    assert_eq!(old_mock.close_count(), 1);
    assert_eq!(new_mock.close_count(), 0);
    assert_eq!(registry.stream_connection_count(), 0);
}

#[tokio::test]
async fn test_remove_if_same_keeps_replacement() {
    let registry = registry(10);
    let (old_mock, old) = conn(TransportType::Tcp, 40001);
    let (new_mock, new) = conn(TransportType::Tcp, 40001);
    registry.put(old.clone());
    registry.put(new.clone());

    assert!(!registry.remove_if_same(&old, false).await);
    assert_eq!(old_mock.close_count(), 1);
    assert_eq!(new_mock.close_count(), 0);
    let current = registry.get(&new.binding_info()).unwrap();
    assert!(same_connection(&current, &new));
    assert_eq!(registry.stream_connection_count(), 1);

    assert!(registry.remove_if_same(&new, false).await);
    assert!(registry.get(&new.binding_info()).is_none());
}

/// Stream connection whose peer never reads, with a send stuck on it
async fn stalled_connection(remote_port: u16) -> (Arc<StreamConnection>, tokio::task::JoinHandle<Result<()>>) {
    let (client, server) = tokio::io::duplex(16);
    let connection = Arc::new(StreamConnection::accepted(
        "127.0.0.1:5060".parse().unwrap(),
        SocketAddr::from(([10, 0, 0, 1], remote_port)),
        TransportType::Tcp,
        Box::new(client),
        0,
    ));
    let send = {
        let connection = connection.clone();
        tokio::spawn(async move {
            let _server = server;
            connection.send(&[0u8; 4096]).await
        })
    };
    let queued = {
        let connection = connection.clone();
        move || connection.queued_send_count() == 1
    };
    assert!(eventually(queued).await);
    (connection, send)
}

#[tokio::test]
async fn test_sweep_is_not_held_up_by_stalled_send() {
    let registry = registry(10);
    let (stalled, send) = stalled_connection(40001).await;
    let (idle_mock, idle) = conn(TransportType::Tcp, 40002);
    idle.set_timeout(0);
    registry.put(stalled.clone());
    registry.put(idle);

    let now = crate::connection::now_millis() + 1_000;
    let evicted = tokio::time::timeout(Duration::from_secs(2), registry.sweep(now))
        .await
        .expect("sweep blocked on a stalled connection");
    assert_eq!(evicted, 2);
    assert_eq!(idle_mock.close_count(), 1);
    assert!(stalled.state().is_closed());
    assert_eq!(registry.connection_count(), 0);

    let sent = send.await.unwrap();
    assert!(matches!(sent, Err(Error::ConnectionClosed(_))));
}

#[tokio::test]
async fn test_remove_is_not_held_up_by_stalled_send() {
    let registry = registry(10);
    let (stalled, send) = stalled_connection(40003).await;
    let connection: Arc<dyn Connection> = stalled.clone();
    registry.put(connection.clone());

    let removed = tokio::time::timeout(Duration::from_secs(2), registry.remove(&connection, false))
        .await
        .expect("remove blocked on a stalled connection");
    assert!(removed);
    assert!(send.await.unwrap().is_err());
    assert_eq!(stalled.queued_send_count(), 0);
}

#[tokio::test]
async fn test_stop_keeps_stream_listeners_down() {
    let registry = registry(1);
    let (tcp_listener, point) = listener(TransportType::Tcp, 16064);
    registry.add_listener(tcp_listener.clone()).unwrap();
    registry.put(conn(TransportType::Tcp, 40001).1);
    assert!(!tcp_listener.is_active());
    assert_eq!(point.creates.load(std::sync::atomic::Ordering::SeqCst), 1);

    registry.stop().await;
    assert!(!tcp_listener.is_active());
    assert_eq!(point.creates.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(registry.connection_count(), 0);
}

#[tokio::test]
async fn test_sweep_evicts_exactly_at_timeout() {
    let registry = registry(10);
    let (mock, connection) = conn(TransportType::Tcp, 40001);
    connection.set_timeout(10);
    registry.put(connection.clone());
    let stamp = connection.state().timestamp();

    assert_eq!(registry.sweep(stamp + 10_000).await, 0);
    assert_eq!(registry.stream_connection_count(), 1);

    assert_eq!(registry.sweep(stamp + 10_001).await, 1);
    assert_eq!(registry.stream_connection_count(), 0);
    assert_eq!(mock.close_count(), 1);
    assert!(registry.get(&connection.binding_info()).is_none());
}

#[tokio::test]
async fn test_sweep_spares_referenced_connections() {
    let registry = registry(1);
    let (tcp_listener, _) = listener(TransportType::Tcp, 16064);
    registry.add_listener(tcp_listener.clone()).unwrap();

    let (_, held) = conn(TransportType::Tcp, 40001);
    let (_, idle) = conn(TransportType::Udp, 40002);
    registry.put(held.clone());
    registry.put(idle.clone());
    assert!(!tcp_listener.is_active());

    let lease = crate::connection::ConnectionLease::new(held.clone());
    assert_eq!(registry.sweep(u64::MAX).await, 1);
    assert!(registry.get(&held.binding_info()).is_some());
    assert!(!tcp_listener.is_active());

    drop(lease);
    assert_eq!(registry.sweep(u64::MAX).await, 1);
    assert!(tcp_listener.is_active());
    registry.stop().await;
}

#[tokio::test]
async fn test_summary_and_details() {
    let registry = registry(10);
    let (_, active) = conn(TransportType::Tcp, 40001);
    let (closing_mock, closing) = conn(TransportType::Tcp, 40002);
    let (_, udp) = conn(TransportType::Udp, 40003);
    let remote = "10.0.0.9:5061".parse().unwrap();
    let pending: Arc<dyn Connection> = MockConnection::with_state(ConnectionState::connecting(
        BindingInfo::remote(remote, TransportType::Tls),
        TransportType::Tls,
        60,
    ));
    closing_mock.state().mark_shutting_down();
    for connection in [active, closing, udp, pending] {
        registry.put(connection);
    }

    let summary = registry.summary();
    assert_eq!(summary.tcp.total, 2);
    assert_eq!(summary.tcp.active, 1);
    assert_eq!(summary.tcp.shutting_down, 1);
    assert_eq!(summary.tls.connecting, 1);
    assert_eq!(summary.get(TransportType::Udp).active, 1);
    assert_eq!(summary.multicast, TransportSummary::default());

    let details = registry.details();
    assert_eq!(details.len(), 4);
    let row = details.iter().find(|d| d.remote_port == 40003).unwrap();
    assert_eq!(row.transport, TransportType::Udp);
    assert_eq!(row.state, crate::connection::ConnectionStatus::Active);

    let json = serde_json::to_value(row).unwrap();
    assert_eq!(json["remotePort"], 40003);
    assert_eq!(json["state"], "active");
    assert_eq!(json["transport"], "UDP");
    assert_eq!(json["queuedSends"], 0);

    let outbound = details.iter().find(|d| d.transport == TransportType::Tls).unwrap();
    assert_eq!(outbound.local_ip, None);
    assert_eq!(outbound.local_port, 0);

    assert!(registry.dump().contains("40003"));
}

#[tokio::test]
async fn test_listener_map_queries() {
    let registry = registry(10);
    let (udp_a, _) = listener(TransportType::Udp, 16070);
    let (udp_b, _) = listener(TransportType::Udp, 16071);
    let (tls, _) = listener(TransportType::Tls, 16072);
    for l in [&udp_a, &udp_b, &tls] {
        registry.add_listener(l.clone()).unwrap();
    }

    let transports = registry.listening_transports();
    assert!(transports.contains(&TransportType::Udp));
    assert!(transports.contains(&TransportType::Tls));
    assert!(!transports.contains(&TransportType::Tcp));
    assert_eq!(registry.listen_key_for_transport(TransportType::Tls), Some(tls.key()));
    assert_eq!(registry.listen_key_for_transport(TransportType::Tcp), None);

    let first = registry.select_udp_listen_point().unwrap();
    let second = registry.select_udp_listen_point().unwrap();
    assert_ne!(first, second);
    assert_eq!(registry.select_udp_listen_point(), Some(first));

    assert!(registry.remove_listener(&tls.key()).is_some());
    assert!(registry.listener(&tls.key()).is_none());
    assert_eq!(registry.listeners().len(), 2);
    tls.set_active(false).unwrap();
}

#[tokio::test]
async fn test_maintenance_sweeps_and_stops() {
    let registry = ConnectionRegistry::new(&TransportConfig {
        cleanup_interval_secs: 1,
        ..TransportConfig::default()
    })
    .unwrap();
    let (mock, connection) = conn(TransportType::Tcp, 40001);
    connection.set_timeout(0);
    registry.put(connection);

    registry.start().unwrap();
    assert!(registry.is_maintenance_running());
    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert!(eventually(|| mock.close_count() == 1).await);
    assert_eq!(registry.connection_count(), 0);

    registry.stop().await;
    assert!(!registry.is_maintenance_running());
}

#[tokio::test]
async fn test_cleanup_interval_validation() {
    let registry = registry(10);
    assert!(registry.set_cleanup_interval(Duration::ZERO).is_err());
    registry.start_maintenance();
    registry.set_cleanup_interval(Duration::from_secs(5)).unwrap();
    assert_eq!(registry.cleanup_interval(), Duration::from_secs(5));
    assert!(registry.is_maintenance_running());
    registry.stop_maintenance().await;
    assert!(!registry.is_maintenance_running());
}

#[tokio::test]
async fn test_sampler_records_peaks() {
    let registry = ConnectionRegistry::new(&TransportConfig {
        sampling_interval_secs: 1,
        notification_interval: 1,
        ..TransportConfig::default()
    })
    .unwrap();
    registry.put(conn(TransportType::Tcp, 40001).1);
    registry.put(conn(TransportType::Udp, 40002).1);
    registry.start_maintenance();
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(eventually(|| registry.peak_counts().tcp == 1).await);
    assert_eq!(registry.peak_counts().udp, 1);
    registry.stop_maintenance().await;
}

#[derive(Debug, Clone)]
enum Op {
    Put(TransportType, u16),
    Remove(u16),
    SetMax(usize),
    Sweep,
}

fn op() -> impl Strategy<Value = Op> {
    let transport = prop_oneof![
        Just(TransportType::Udp),
        Just(TransportType::Tcp),
        Just(TransportType::Tls),
        Just(TransportType::Multicast),
    ];
    prop_oneof![
        4 => (transport, 0u16..8).prop_map(|(t, p)| Op::Put(t, p)),
        3 => (0u16..8).prop_map(Op::Remove),
        1 => (0usize..6).prop_map(Op::SetMax),
        1 => Just(Op::Sweep),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_stream_listeners_track_ceiling(max in 0usize..6, ops in proptest::collection::vec(op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async move {
            let registry = registry(max);
            let (tcp_listener, _) = listener(TransportType::Tcp, 17060);
            let (udp_listener, _) = listener(TransportType::Udp, 17060);
            registry.add_listener(tcp_listener.clone()).unwrap();
            registry.add_listener(udp_listener.clone()).unwrap();
            udp_listener.set_active(true).unwrap();

            let mut live: Vec<Arc<dyn Connection>> = Vec::new();
            for op in ops {
                match op {
                    Op::Put(transport, port) => {
                        let (_, connection) = conn(transport, 42000 + port);
                        registry.put(connection.clone());
                        live.retain(|c| c.binding_info() != connection.binding_info());
                        live.push(connection);
                    }
                    Op::Remove(port) => {
                        if let Some(index) = live.iter().position(|c| c.binding_info().remote_port() == 42000 + port) {
                            let connection = live.remove(index);
                            assert!(registry.remove(&connection, false).await);
                        }
                    }
                    Op::SetMax(max) => registry.set_max_connections(max),
                    Op::Sweep => {
                        assert_eq!(registry.sweep(0).await, 0);
                    }
                }

                let streams = live.iter().filter(|c| c.transport().is_stream()).count();
                assert_eq!(registry.stream_connection_count(), streams);
                assert_eq!(registry.connection_count(), live.len());
                assert_eq!(tcp_listener.is_active(), streams < registry.max_connections());
                assert!(udp_listener.is_active());
            }
            registry.stop().await;
        });
    }
}

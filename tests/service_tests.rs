//! Service channel polling against a stand-in instance listening on its
//! service socket

mod common;

use common::*;
use module_supervisor::config::store::MemoryConfigStore;
use module_supervisor::config::tree::SupervisorTree;
use module_supervisor::module::{Inventory, Lifecycle, ModuleLoader};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;

const STATS: &str = r#"{
    "in_cnt": 1, "out_cnt": 1,
    "in": [{"messages": 10, "buffers": 2, "ifc_type": 116, "ifc_state": 1, "ifc_id": "8000"}],
    "out": [{"sent-messages": 7, "dropped-messages": 1, "buffers": 3, "autoflushes": 0,
             "num_clients": 1, "type": 117, "ifc_id": "s-out"}]
}"#;

fn service_tree(has_service: bool) -> SupervisorTree {
    serde_json::from_value(serde_json::json!({
        "modules": [{
            "name": "svc",
            "path": "/usr/bin/svc",
            "has-service": has_service,
            "instances": [{
                "name": "s",
                "interfaces": [
                    {"name": "in", "direction": "IN", "type": "TCP", "port": 8000},
                    {"name": "out", "direction": "OUT", "type": "UNIXSOCKET", "socket-name": "s-out"}
                ]
            }]
        }]
    }))
    .expect("valid tree")
}

async fn started(tree: SupervisorTree, dir: &std::path::Path) -> (Lifecycle, Inventory, u32) {
    let spawner = Arc::new(FakeSpawner::new());
    let config = Arc::new(test_config(dir));
    let store = Arc::new(MemoryConfigStore::new(tree.clone()));
    let loader = ModuleLoader::new(spawner.clone(), store, 3);
    let mut inv = Inventory::new();
    loader.load_all(&mut inv, &tree).await.unwrap();

    let lifecycle = Lifecycle::new(spawner, config);
    lifecycle.start_eligible(&mut inv, Instant::now());
    let pid = inv.instance_by_name("s").unwrap().pid.unwrap();
    std::fs::create_dir_all(&lifecycle.config().socket_dir).unwrap();
    (lifecycle, inv, pid)
}

/// Answer one GET with `reply`
fn serve_once(listener: UnixListener, reply: &'static str) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut header = [0u8; 8];
        stream.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[0..4], &10u32.to_ne_bytes());
        assert_eq!(&header[4..8], &0u32.to_ne_bytes());

        let mut frame = Vec::new();
        frame.extend_from_slice(&12u32.to_ne_bytes());
        frame.extend_from_slice(&(reply.len() as u32).to_ne_bytes());
        frame.extend_from_slice(reply.as_bytes());
        stream.write_all(&frame).await.unwrap();
        // Keep the connection open until the client is done reading
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
    })
}

#[tokio::test]
async fn test_stats_are_pulled_and_applied() {
    let dir = temp_dir();
    let (lifecycle, mut inv, pid) = started(service_tree(true), dir.path()).await;
    let listener = UnixListener::bind(lifecycle.config().service_socket_path(pid)).unwrap();
    let server = serve_once(listener, STATS);

    lifecycle.poll_services(&mut inv).await;

    let inst = inv.instance_by_name("s").unwrap();
    assert!(inst.service.is_some());
    assert_eq!(inst.inputs[0].stats.messages, 10);
    assert_eq!(inst.inputs[0].stats.reported_id.as_deref(), Some("8000"));
    assert_eq!(inst.outputs[0].stats.messages, 7);
    assert_eq!(inst.outputs[0].stats.dropped_messages, 1);

    inv.instance_by_name_mut("s").unwrap().disconnect_service();
    server.await.unwrap();
}

#[tokio::test]
async fn test_interface_count_mismatch_disconnects() {
    let dir = temp_dir();
    let (lifecycle, mut inv, pid) = started(service_tree(true), dir.path()).await;
    let listener = UnixListener::bind(lifecycle.config().service_socket_path(pid)).unwrap();
    let server = serve_once(listener, r#"{"in_cnt": 0, "out_cnt": 1}"#);

    lifecycle.poll_services(&mut inv).await;

    let inst = inv.instance_by_name("s").unwrap();
    assert!(inst.service.is_none());
    assert_eq!(inst.inputs[0].stats.messages, 0);
    server.await.unwrap();
}

#[tokio::test]
async fn test_unreachable_service_is_retried_later() {
    let dir = temp_dir();
    let (lifecycle, mut inv, _pid) = started(service_tree(true), dir.path()).await;

    lifecycle.poll_services(&mut inv).await;
    let inst = inv.instance_by_name("s").unwrap();
    assert!(inst.service.is_none());
    assert_eq!(inst.service_conn_timer, 1);

    // No attempt until the connection period has passed
    lifecycle.poll_services(&mut inv).await;
    assert_eq!(inv.instance_by_name("s").unwrap().service_conn_timer, 2);
}

#[tokio::test]
async fn test_module_without_service_is_not_polled() {
    let dir = temp_dir();
    let (lifecycle, mut inv, pid) = started(service_tree(false), dir.path()).await;
    let listener = UnixListener::bind(lifecycle.config().service_socket_path(pid)).unwrap();

    lifecycle.poll_services(&mut inv).await;

    let inst = inv.instance_by_name("s").unwrap();
    assert!(inst.service.is_none());
    assert_eq!(inst.service_conn_timer, 0);
    let accepted = tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
    assert!(accepted.is_err());
}

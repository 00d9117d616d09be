//! Lifecycle controller tests
//!
//! Restart policy, stop/kill escalation, reaping and cascading removal,
//! driven against the fake process table.

mod common;

use common::*;
use module_supervisor::config::store::MemoryConfigStore;
use module_supervisor::config::tree::SupervisorTree;
use module_supervisor::module::{
    InstanceState, Inventory, Lifecycle, ModuleLoader, StopSignal,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct Fixture {
    spawner: Arc<FakeSpawner>,
    lifecycle: Lifecycle,
    inv: Inventory,
    dir: TempDir,
}

async fn fixture(tree: SupervisorTree) -> Fixture {
    let dir = temp_dir();
    let spawner = Arc::new(FakeSpawner::new());
    let config = Arc::new(test_config(dir.path()));
    let store = Arc::new(MemoryConfigStore::new(tree.clone()));
    let loader = ModuleLoader::new(spawner.clone(), store, config.default_max_restarts_per_minute);
    let mut inv = Inventory::new();
    loader.load_all(&mut inv, &tree).await.unwrap();
    Fixture {
        lifecycle: Lifecycle::new(spawner.clone(), config),
        spawner,
        inv,
        dir,
    }
}

fn pid_of(inv: &Inventory, name: &str) -> u32 {
    inv.instance_by_name(name).unwrap().pid.expect("instance has a pid")
}

fn with_max_restarts(max: u32) -> SupervisorTree {
    let mut tree = single_instance_tree();
    tree.instance_mut("i").unwrap().max_restarts_per_minute = Some(max);
    tree
}

#[tokio::test]
async fn test_start_builds_argument_vector() {
    let mut f = fixture(single_instance_tree()).await;
    assert_eq!(f.lifecycle.start_eligible(&mut f.inv, Instant::now()), 1);

    let args = f.spawner.last_spawn_args("i").unwrap();
    assert_eq!(args, vec!["i", "-v", "-i", "u:i-out"]);
    let inst = f.inv.instance_by_name("i").unwrap();
    assert!(inst.running);
    assert!(inst.is_my_child);
    assert_eq!(f.inv.instance_state(inst.id()), Some(InstanceState::Running));
}

#[tokio::test]
async fn test_running_instance_is_not_started_twice() {
    let mut f = fixture(single_instance_tree()).await;
    let now = Instant::now();
    f.lifecycle.start_eligible(&mut f.inv, now);
    f.lifecycle.refresh_running(&mut f.inv);
    assert_eq!(f.lifecycle.start_eligible(&mut f.inv, now + Duration::from_secs(1)), 0);
    assert_eq!(f.spawner.spawn_count("i"), 1);
}

#[tokio::test]
async fn test_restart_limit_allows_exactly_max_attempts() {
    let mut f = fixture(with_max_restarts(3)).await;
    let t0 = Instant::now();

    for second in 0..6 {
        f.lifecycle
            .start_eligible(&mut f.inv, t0 + Duration::from_secs(second));
        if let Some(pid) = f.inv.instance_by_name("i").unwrap().pid {
            f.spawner.crash(pid);
        }
        f.lifecycle.reap_children(&mut f.inv);
    }

    assert_eq!(f.spawner.spawn_count("i"), 3);
    let inst = f.inv.instance_by_name("i").unwrap();
    assert!(!inst.enabled);
    assert_eq!(f.inv.instance_state(inst.id()), Some(InstanceState::Disabled));
}

#[tokio::test]
async fn test_restart_window_resets_after_a_minute() {
    let mut f = fixture(with_max_restarts(2)).await;
    let t0 = Instant::now();

    for at in [0, 1, 61, 62] {
        f.lifecycle
            .start_eligible(&mut f.inv, t0 + Duration::from_secs(at));
        let pid = pid_of(&f.inv, "i");
        f.spawner.crash(pid);
        f.lifecycle.reap_children(&mut f.inv);
    }

    assert_eq!(f.spawner.spawn_count("i"), 4);
    assert!(f.inv.instance_by_name("i").unwrap().enabled);
}

#[tokio::test]
async fn test_spawn_failure_leaves_instance_stopped() {
    let mut f = fixture(single_instance_tree()).await;
    f.spawner.set_fail_spawn(true);
    assert_eq!(f.lifecycle.start_eligible(&mut f.inv, Instant::now()), 0);

    let inst = f.inv.instance_by_name("i").unwrap();
    assert!(!inst.running);
    assert_eq!(inst.pid, None);
    assert_eq!(f.inv.instance_state(inst.id()), Some(InstanceState::Stopped));
}

#[tokio::test]
async fn test_cooperative_instance_gets_only_sigint() {
    let mut f = fixture(single_instance_tree()).await;
    f.lifecycle.start_eligible(&mut f.inv, Instant::now());
    let pid = pid_of(&f.inv, "i");

    f.inv.instance_by_name_mut("i").unwrap().enabled = false;
    f.lifecycle.escalate_stops(&mut f.inv).await;

    assert_eq!(f.spawner.signals(pid), vec![StopSignal::Interrupt]);
    let inst = f.inv.instance_by_name("i").unwrap();
    assert!(!inst.running);
    assert_eq!(inst.pid, None);
    assert_eq!(f.inv.instance_state(inst.id()), Some(InstanceState::Disabled));
}

#[tokio::test]
async fn test_stubborn_instance_is_killed_after_grace() {
    let mut f = fixture(single_instance_tree()).await;
    f.lifecycle.start_eligible(&mut f.inv, Instant::now());
    let pid = pid_of(&f.inv, "i");
    f.spawner.ignore_sigint(pid);

    f.inv.instance_by_name_mut("i").unwrap().enabled = false;
    let started = Instant::now();
    f.lifecycle.escalate_stops(&mut f.inv).await;

    assert!(started.elapsed() >= Duration::from_millis(10));
    assert_eq!(
        f.spawner.signals(pid),
        vec![StopSignal::Interrupt, StopSignal::Kill]
    );
    assert!(f
        .spawner
        .events()
        .contains(&Event::Reaped { pid }));
    assert!(!f.inv.instance_by_name("i").unwrap().running);
}

#[tokio::test]
async fn test_disabled_group_stops_its_instances() {
    let mut f = fixture(single_instance_tree()).await;
    f.lifecycle.start_eligible(&mut f.inv, Instant::now());
    let pid = pid_of(&f.inv, "i");

    f.inv.group_mut("g").unwrap().enabled = false;
    f.lifecycle.escalate_stops(&mut f.inv).await;

    assert_eq!(f.spawner.signals(pid), vec![StopSignal::Interrupt]);
    let inst = f.inv.instance_by_name("i").unwrap();
    // The group flag cascades without touching the instance flag
    assert!(inst.enabled);
    assert_eq!(f.inv.instance_state(inst.id()), Some(InstanceState::Disabled));
    assert_eq!(f.lifecycle.start_eligible(&mut f.inv, Instant::now()), 0);
}

#[tokio::test]
async fn test_foreign_owned_process_is_never_signalled() {
    let mut tree = single_instance_tree();
    tree.instance_mut("i").unwrap().last_pid = Some(4242);
    let dir = temp_dir();
    let spawner = Arc::new(FakeSpawner::new());
    spawner.add_foreign(4242, "/usr/bin/m", true);
    let config = Arc::new(test_config(dir.path()));
    let store = Arc::new(MemoryConfigStore::new(tree.clone()));
    let loader = ModuleLoader::new(spawner.clone(), store, 3);
    let lifecycle = Lifecycle::new(spawner.clone(), config);
    let mut inv = Inventory::new();
    loader.load_all(&mut inv, &tree).await.unwrap();

    assert_eq!(lifecycle.refresh_running(&mut inv), 1);
    let inst = inv.instance_by_name("i").unwrap();
    assert!(inst.root_perm_needed);
    assert!(!inst.is_my_child);

    inv.instance_by_name_mut("i").unwrap().enabled = false;
    lifecycle.escalate_stops(&mut inv).await;
    assert!(spawner.signals(4242).is_empty());
    assert!(inv.instance_by_name("i").unwrap().running);
}

#[tokio::test]
async fn test_reaping_removes_output_sockets() {
    let mut f = fixture(single_instance_tree()).await;
    f.lifecycle.start_eligible(&mut f.inv, Instant::now());
    let pid = pid_of(&f.inv, "i");

    let socket = f.lifecycle.config().socket_path("i-out");
    std::fs::create_dir_all(socket.parent().unwrap()).unwrap();
    std::fs::write(&socket, b"").unwrap();

    f.spawner.crash(pid);
    assert_eq!(f.lifecycle.reap_children(&mut f.inv), 1);
    assert!(!socket.exists());
    assert!(f.dir.path().join("sockets").exists());
}

#[tokio::test]
async fn test_failed_probe_reaps_exited_child() {
    let mut f = fixture(single_instance_tree()).await;
    f.lifecycle.start_eligible(&mut f.inv, Instant::now());
    let pid = pid_of(&f.inv, "i");

    f.spawner.crash(pid);
    f.spawner.fail_probes(pid);
    assert_eq!(f.lifecycle.refresh_running(&mut f.inv), 0);

    assert!(f.spawner.events().contains(&Event::Reaped { pid }));
    assert_eq!(f.inv.instance_by_name("i").unwrap().pid, None);
}

#[tokio::test]
async fn test_failed_probe_keeps_live_child() {
    let mut f = fixture(single_instance_tree()).await;
    f.lifecycle.start_eligible(&mut f.inv, Instant::now());
    let pid = pid_of(&f.inv, "i");

    f.spawner.fail_probes(pid);
    assert_eq!(f.lifecycle.refresh_running(&mut f.inv), 1);
    assert_eq!(f.inv.instance_by_name("i").unwrap().pid, Some(pid));
    assert_eq!(f.lifecycle.start_eligible(&mut f.inv, Instant::now()), 0);
}

#[tokio::test]
async fn test_file_interface_from_tree_reaches_arguments() {
    let tree: SupervisorTree = serde_json::from_value(serde_json::json!({
        "modules": [{
            "name": "logger",
            "path": "/usr/bin/logger",
            "instances": [{
                "name": "log1",
                "interfaces": [
                    {"name": "in", "direction": "IN", "type": "TCP", "port": 7000},
                    {"name": "dump", "direction": "OUT", "type": "FILE",
                     "path": "/path", "mode": "w", "size": 100, "time": 60}
                ]
            }]
        }]
    }))
    .expect("valid tree");
    let mut f = fixture(tree).await;

    assert_eq!(f.lifecycle.start_eligible(&mut f.inv, Instant::now()), 1);
    let args = f.spawner.last_spawn_args("log1").unwrap();
    assert_eq!(args, vec!["log1", "-i", "t:7000,f:/path:w:100:60"]);
}

#[tokio::test]
async fn test_stop_and_remove_module_cascades() {
    let mut f = fixture(pipeline_tree()).await;
    f.lifecycle.start_eligible(&mut f.inv, Instant::now());
    let sink1 = pid_of(&f.inv, "sink1");
    let sink2 = pid_of(&f.inv, "sink2");
    f.spawner.ignore_sigint(sink2);

    assert!(f.lifecycle.stop_and_remove_module(&mut f.inv, "sink").await);

    assert_eq!(f.spawner.signals(sink1), vec![StopSignal::Interrupt]);
    assert_eq!(
        f.spawner.signals(sink2),
        vec![StopSignal::Interrupt, StopSignal::Kill]
    );
    assert!(!f.spawner.is_alive(sink2));
    assert!(f.inv.module("sink").is_none());
    assert!(f.inv.instance_by_name("sink1").is_none());
    assert!(f.inv.instance_by_name("sink2").is_none());
    assert!(f.inv.instance_by_name("src").is_some());
}

#[tokio::test]
async fn test_stop_and_remove_group_cascades() {
    let mut f = fixture(single_instance_tree()).await;
    f.lifecycle.start_eligible(&mut f.inv, Instant::now());

    assert!(f.lifecycle.stop_and_remove_group(&mut f.inv, "g").await);
    assert_eq!(f.inv.group_count(), 0);
    assert_eq!(f.inv.module_count(), 0);
    assert_eq!(f.inv.instance_count(), 0);
    assert!(!f.lifecycle.stop_and_remove_group(&mut f.inv, "g").await);
}

#[tokio::test]
async fn test_terminate_all_keeps_inventory() {
    let mut f = fixture(pipeline_tree()).await;
    f.lifecycle.start_eligible(&mut f.inv, Instant::now());

    f.lifecycle.terminate_all(&mut f.inv).await;
    assert_eq!(f.inv.instance_count(), 3);
    assert!(f.inv.instances().all(|i| !i.running && i.pid.is_none()));
}

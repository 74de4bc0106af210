use chute_core::ChuteState;
use chute_pipeline::uci::ConfigKind;
use chute_pipeline::UpdateState;
use serde_json::json;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Chute lifecycle
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_create_installs_running_chute() {
    let node = Node::start();

    let outcome = node.submit(create_chute("seccam", 1)).await.unwrap();
    assert!(outcome.success, "create failed: {}", outcome.message);
    assert_eq!(outcome.state, UpdateState::Succeeded);

    let chute = node.chute("seccam").expect("seccam should be stored");
    assert_eq!(chute.state, ChuteState::Running);
    assert_eq!(chute.version, 1);
    assert!(node.runtime.is_running("seccam"));

    let network = node.os_file(ConfigKind::Network).expect("network file written");
    assert!(network.contains("seccam"), "network file lacks chute sections:\n{network}");
    assert!(node.os_file(ConfigKind::Dhcp).is_some());
    // Only seccam's own sections changed, so only those are reloaded.
    assert!(node.confd.calls().contains(&"reload seccam".to_string()));
    assert_eq!(node.confd.count("reload_all"), 0);
    assert_eq!(node.services.targets(), vec!["seccam"]);
}

#[tokio::test]
async fn test_stop_start_delete_round() {
    let node = Node::start();
    assert!(node.submit(create_chute("cam", 1)).await.unwrap().success);

    let stopped = node.submit(chute_op("stop", "cam")).await.unwrap();
    assert!(stopped.success, "stop failed: {}", stopped.message);
    assert!(!node.runtime.is_running("cam"));
    assert_eq!(node.chute("cam").unwrap().state, ChuteState::Stopped);

    let again = node.submit(chute_op("stop", "cam")).await.unwrap();
    assert_eq!(again.state, UpdateState::Aborted);
    assert_eq!(again.message, "Chute cam is already stopped");

    let started = node.submit(chute_op("start", "cam")).await.unwrap();
    assert!(started.success, "start failed: {}", started.message);
    assert!(node.runtime.is_running("cam"));
    assert_eq!(node.chute("cam").unwrap().state, ChuteState::Running);

    let deleted = node.submit(chute_op("delete", "cam")).await.unwrap();
    assert!(deleted.success, "delete failed: {}", deleted.message);
    assert!(node.chute("cam").is_none());
    assert!(node.runtime.container("cam").is_none());
    let network = node.os_file(ConfigKind::Network).unwrap_or_default();
    assert!(!network.contains("# cam"), "stale sections left:\n{network}");
}

#[tokio::test]
async fn test_stop_of_missing_chute_aborts_without_side_effects() {
    let node = Node::start();

    let outcome = node.submit(chute_op("stop", "ghost")).await.unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.state, UpdateState::Aborted);
    assert_eq!(outcome.message, "No chute found with id: ghost");

    assert!(node.runtime.calls().is_empty());
    assert!(node.confd.calls().is_empty());
    assert!(node.os_file(ConfigKind::Network).is_none());
}

#[tokio::test]
async fn test_duplicate_create_and_stale_update_abort() {
    let node = Node::start();
    assert!(node.submit(create_chute("cam", 2)).await.unwrap().success);

    let dup = node.submit(create_chute("cam", 3)).await.unwrap();
    assert_eq!(dup.state, UpdateState::Aborted);
    assert_eq!(dup.message, "Chute cam already exists");

    let mut stale = create_chute("cam", 2);
    stale["type"] = json!("update");
    let outcome = node.submit(stale).await.unwrap();
    assert_eq!(outcome.state, UpdateState::Aborted);
    assert_eq!(node.chute("cam").unwrap().version, 2);
}

#[tokio::test]
async fn test_update_replaces_containers() {
    let node = Node::start();
    assert!(node.submit(create_chute("cam", 1)).await.unwrap().success);

    let mut newer = create_chute("cam", 2);
    newer["type"] = json!("update");
    let outcome = node.submit(newer).await.unwrap();
    assert!(outcome.success, "update failed: {}", outcome.message);
    assert_eq!(node.chute("cam").unwrap().version, 2);
    assert!(node.runtime.is_running("cam"));
    assert!(node.runtime.images().iter().any(|t| t == "cam:2"));
}

#[tokio::test]
async fn test_progress_reaches_controller() {
    let node = Node::start();
    let mut descriptor = create_chute("seccam", 1);
    descriptor["update_id"] = json!("42");

    let outcome = node.submit(descriptor).await.unwrap();
    assert!(outcome.success);

    wait_for(5_000, || {
        node.controller
            .completions()
            .contains(&("42".to_string(), true))
    })
    .await
    .unwrap();
    assert!(node.controller.messages().iter().all(|(id, _)| id == "42"));
    assert!(!node.controller.messages().is_empty());
    assert!(!node.reporter.recent(100).is_empty());

    let summary = node.manager.log().get(outcome.id).unwrap();
    assert_eq!(summary.state, UpdateState::Succeeded);
    assert_eq!(summary.success, Some(true));
}

use chute_pipeline::uci::ConfigKind;
use chute_pipeline::{SectionStatus, UpdateState};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Failure and rollback
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_start_failure_rolls_back_create() {
    let node = Node::start();
    node.runtime.fail_on("start", "seccam");

    let outcome = node.submit(create_chute("seccam", 1)).await.unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.state, UpdateState::Failed);
    assert!(
        outcome.message.contains("injected failure"),
        "unexpected message: {}",
        outcome.message
    );
    assert!(outcome.progress.iter().any(|p| p == "Rolled back"));

    // Nothing written this update survives.
    assert!(node.chute("seccam").is_none());
    assert!(node.runtime.container("seccam").is_none());
    assert!(node.os_file(ConfigKind::Network).is_none());
    assert!(node.os_file(ConfigKind::Dhcp).is_none());
    assert!(node.os_file(ConfigKind::Firewall).is_none());
    // The network undo reloads the reverted files.
    assert!(node.confd.count("reload_all") >= 1);
}

#[tokio::test]
async fn test_failed_update_restores_previous_files() {
    let node = Node::start();
    assert!(node.submit(create_chute("cam", 1)).await.unwrap().success);
    let network_before = node.os_file(ConfigKind::Network).unwrap();
    let dhcp_before = node.os_file(ConfigKind::Dhcp).unwrap();

    assert!(node.submit(create_chute("other", 1)).await.unwrap().success);
    let network_with_other = node.os_file(ConfigKind::Network).unwrap();
    assert_ne!(network_before, network_with_other);

    node.runtime.fail_on("create", "third");
    let outcome = node.submit(create_chute("third", 1)).await.unwrap();
    assert_eq!(outcome.state, UpdateState::Failed);
    assert_eq!(node.os_file(ConfigKind::Network).unwrap(), network_with_other);
    assert!(node.os_file(ConfigKind::Dhcp).unwrap().contains("cam"));
    assert!(dhcp_before.contains("cam"));
    assert!(node.chute("third").is_none());
    assert!(node.chute("cam").is_some());
    assert!(node.runtime.is_running("cam"));
}

#[tokio::test]
async fn test_fatal_reload_status_fails_update() {
    let node = Node::start();
    node.confd.set_statuses(vec![SectionStatus {
        kind: "interface".into(),
        name: "seccam_lan".into(),
        comment: Some("seccam".into()),
        success: false,
        age: 0,
    }]);

    let outcome = node.submit(create_chute("seccam", 1)).await.unwrap();
    assert_eq!(outcome.state, UpdateState::Failed);
    assert!(outcome.message.starts_with("config reload failed"));
    assert!(node.chute("seccam").is_none());
    assert!(node.runtime.container("seccam").is_none());
}

#[tokio::test]
async fn test_foreign_reload_failure_is_a_warning() {
    let node = Node::start();
    node.confd.set_statuses(vec![SectionStatus {
        kind: "interface".into(),
        name: "other_lan".into(),
        comment: Some("other".into()),
        success: false,
        age: 0,
    }]);

    let outcome = node.submit(create_chute("seccam", 1)).await.unwrap();
    assert!(outcome.success, "create failed: {}", outcome.message);
    assert!(outcome.progress.iter().any(|p| p.starts_with("Warning: ")));
}

fn two_service_chute(name: &str) -> serde_json::Value {
    serde_json::json!({
        "class": "chute",
        "type": "create",
        "name": name,
        "new": {
            "services": {
                "api": {"image": "python2", "command": "python -u api.py"},
                "web": {"image": "python2", "command": "python -u web.py"}
            }
        }
    })
}

#[tokio::test]
async fn test_failed_start_leaves_every_service_stopped() {
    let node = Node::start();
    assert!(node.submit(two_service_chute("duo")).await.unwrap().success);
    assert!(node.submit(chute_op("stop", "duo")).await.unwrap().success);

    node.runtime.fail_on("start", "duo-web");
    let outcome = node.submit(chute_op("start", "duo")).await.unwrap();
    assert_eq!(outcome.state, UpdateState::Failed);
    assert!(!node.runtime.is_running("duo-api"));
    assert!(!node.runtime.is_running("duo-web"));
    assert!(!node.chute("duo").unwrap().is_running());
}

#[tokio::test]
async fn test_failed_stop_leaves_every_service_running() {
    let node = Node::start();
    assert!(node.submit(two_service_chute("duo")).await.unwrap().success);

    node.runtime.fail_on("stop", "duo-web");
    let outcome = node.submit(chute_op("stop", "duo")).await.unwrap();
    assert_eq!(outcome.state, UpdateState::Failed);
    assert!(node.runtime.is_running("duo-api"));
    assert!(node.runtime.is_running("duo-web"));
    assert!(node.chute("duo").unwrap().is_running());
}

#[tokio::test]
async fn test_failed_update_recreates_previous_container() {
    let node = Node::start();
    assert!(node.submit(create_chute("cam", 1)).await.unwrap().success);
    let before = node.runtime.container("cam").unwrap().spec;
    assert_eq!(before.attachments.len(), 1);

    node.confd.fail_on("wait_system_up");
    let mut update = create_chute("cam", 2);
    update["type"] = serde_json::json!("update");
    let outcome = node.submit(update).await.unwrap();
    assert_eq!(outcome.state, UpdateState::Failed);

    let after = node.runtime.container("cam").unwrap();
    assert!(after.running);
    assert_eq!(after.spec.attachments, before.attachments);
    assert_eq!(after.spec.env["CHUTE_API_TOKEN"], before.env["CHUTE_API_TOKEN"]);
    assert_eq!(after.spec, before);
    assert_eq!(node.chute("cam").unwrap().version, 1);
}

#[tokio::test]
async fn test_failed_delete_recreates_previous_container() {
    let node = Node::start();
    assert!(node.submit(create_chute("cam", 1)).await.unwrap().success);
    let before = node.runtime.container("cam").unwrap().spec;

    node.runtime.fail_on("remove_image", "cam:1");
    let outcome = node.submit(chute_op("delete", "cam")).await.unwrap();
    assert_eq!(outcome.state, UpdateState::Failed);

    let after = node.runtime.container("cam").unwrap();
    assert!(after.running);
    assert_eq!(after.spec, before);
    assert!(node.chute("cam").is_some());
}

use chute_pipeline::uci::ConfigKind;
use chute_pipeline::UpdateState;
use serde_json::json;

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Host configuration and router updates
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_empty_patch_writes_generated_host_config() {
    let node = Node::start();
    assert!(node.host_config().is_none());

    let outcome = node
        .submit(json!({"class": "host-config", "type": "patchhostconfig", "patch": []}))
        .await
        .unwrap();
    assert!(outcome.success, "patch failed: {}", outcome.message);

    let host = node.host_config().expect("host config written");
    assert_eq!(host.wan.interface, "eth0");
    assert_eq!(host.lan.interfaces, vec!["eth1"]);
    assert!(host.wifi.iter().any(|d| d.id == "wlan0"));
    let network = node.os_file(ConfigKind::Network).unwrap();
    assert!(network.contains("config interface 'lan'"));
    assert!(node.os_file(ConfigKind::Wireless).is_some());
}

#[tokio::test]
async fn test_zerotier_patch_reaches_side_services() {
    let node = Node::start();
    let outcome = node
        .submit(json!({"class": "host-config", "type": "patchhostconfig", "patch": [
            {"op": "replace", "path": "/zerotier/enabled", "value": true},
            {"op": "replace", "path": "/zerotier/networks", "value": ["8056c2e21c000001"]}
        ]}))
        .await
        .unwrap();
    assert!(outcome.success, "patch failed: {}", outcome.message);

    let applied = node.services.zerotier().expect("zerotier configured");
    assert!(applied.enabled);
    assert_eq!(applied.networks, vec!["8056c2e21c000001"]);
    assert!(node.host_config().unwrap().zerotier.enabled);
}

#[tokio::test]
async fn test_bad_patch_aborts_and_leaves_host_config() {
    let node = Node::start();
    let outcome = node
        .submit(json!({"class": "host-config", "type": "patchhostconfig", "patch": [
            {"op": "remove", "path": "/no/such/path"}
        ]}))
        .await
        .unwrap();
    assert_eq!(outcome.state, UpdateState::Aborted);
    assert!(node.host_config().is_none());
    assert!(node.services.calls().is_empty());
}

#[tokio::test]
async fn test_failed_host_patch_restores_previous_config() {
    let node = Node::start();
    assert!(node
        .submit(json!({"class": "host-config", "type": "patchhostconfig", "patch": []}))
        .await
        .unwrap()
        .success);
    let before = node.host_config().unwrap();

    node.services.fail_zerotier(true);
    let outcome = node
        .submit(json!({"class": "host-config", "type": "patchhostconfig", "patch": [
            {"op": "replace", "path": "/zerotier/enabled", "value": true}
        ]}))
        .await
        .unwrap();
    assert_eq!(outcome.state, UpdateState::Failed);
    assert_eq!(node.host_config().unwrap(), before);
}

#[tokio::test]
async fn test_factory_reset_clears_chutes() {
    let node = Node::start();
    assert!(node.submit(create_chute("a", 1)).await.unwrap().success);
    assert!(node.submit(create_chute("b", 1)).await.unwrap().success);

    let outcome = node
        .submit(json!({"class": "router", "type": "factoryreset"}))
        .await
        .unwrap();
    assert!(outcome.success, "reset failed: {}", outcome.message);
    let calls = node.confd.calls();
    let unload = calls.iter().rposition(|c| c == "unload_all").unwrap();
    let reload = calls.iter().rposition(|c| c == "reload_all").unwrap();
    assert!(unload < reload, "unexpected confd calls: {calls:?}");

    assert!(node.store.is_empty());
    assert!(node.runtime.container_names().is_empty());
    let network = node.os_file(ConfigKind::Network).unwrap();
    assert!(!network.contains("# a\n") && !network.contains("# b\n"));
    assert!(network.contains("config interface 'lan'"));
    assert!(node.host_config().is_some());
}

#[tokio::test]
async fn test_snap_install_rejects_downgrade() {
    let node = Node::start();
    node.installer.set_installed("chuted", "1.2.0");

    let outcome = node
        .submit(json!({"class": "snap", "type": "install", "sources": [
            {"name": "chuted", "version": "1.1.0", "path": "/tmp/chuted_1.1.0.snap"}
        ]}))
        .await
        .unwrap();
    assert_eq!(outcome.state, UpdateState::Aborted);
    assert!(node.installer.delivered().is_empty());

    let outcome = node
        .submit(json!({"class": "snap", "type": "install", "sources": [
            {"name": "chuted", "version": "1.3.0", "path": "/tmp/chuted_1.3.0.snap"}
        ]}))
        .await
        .unwrap();
    assert!(outcome.success, "install failed: {}", outcome.message);
    assert_eq!(node.installer.delivered().len(), 1);
}

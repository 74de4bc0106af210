use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use chute_pipeline::{SubmitError, UpdateDescriptor, UpdateOutcome};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Queue ordering
// ══════════════════════════════════════════════════════════════════════════════

fn descriptor(value: serde_json::Value) -> UpdateDescriptor {
    serde_json::from_value(value).unwrap()
}

/// Updates finish in submission order, and each one sees the effects of
/// the ones before it.
#[tokio::test]
async fn test_updates_run_in_fifo_order() {
    let node = Node::start();
    let order = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = oneshot::channel();
    let done_tx = Mutex::new(Some(done_tx));

    let batch = [
        create_chute("a", 1),
        create_chute("b", 1),
        chute_op("stop", "a"),
        chute_op("delete", "b"),
    ];
    let last = batch.len() - 1;
    let mut ids = Vec::new();
    for (i, value) in batch.into_iter().enumerate() {
        let order = order.clone();
        let done = (i == last).then(|| done_tx.lock().take()).flatten();
        let ticket = node
            .manager
            .add(
                descriptor(value),
                Some(Box::new(move |outcome: &UpdateOutcome| {
                    order.lock().push((outcome.id, outcome.success));
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                })),
            )
            .unwrap();
        ids.push(ticket.id);
    }

    tokio::time::timeout(Duration::from_secs(20), done_rx)
        .await
        .unwrap()
        .unwrap();
    let order = order.lock().clone();
    assert_eq!(order.iter().map(|(id, _)| *id).collect::<Vec<_>>(), ids);
    assert!(order.iter().all(|(_, ok)| *ok), "an update failed: {order:?}");

    assert!(!node.runtime.is_running("a"));
    assert!(node.chute("b").is_none());
}

#[tokio::test]
async fn test_tok_is_assigned_and_must_increase() {
    let node = Node::start();

    let first = node.manager.add(descriptor(chute_op("stop", "x")), None).unwrap();
    let second = node.manager.add(descriptor(chute_op("stop", "y")), None).unwrap();
    assert!(second.tok > first.tok);
    assert!(second.id > first.id);

    let mut stale = chute_op("stop", "z");
    stale["tok"] = serde_json::json!(first.tok);
    assert!(matches!(
        node.manager.add(descriptor(stale), None),
        Err(SubmitError::Rejected(_))
    ));

    let mut ahead = chute_op("stop", "z");
    ahead["tok"] = serde_json::json!(100);
    assert_eq!(node.manager.add(descriptor(ahead), None).unwrap().tok, 100);

    assert!(!first.wait().await.unwrap().success);
    assert!(!second.wait().await.unwrap().success);
}

#[tokio::test]
async fn test_malformed_descriptor_never_reaches_the_queue() {
    let node = Node::start();
    let before = node.manager.log().len();
    let create_without_payload = chute_op("create", "cam");
    assert!(matches!(
        node.manager.add(descriptor(create_without_payload), None),
        Err(SubmitError::Rejected(_))
    ));
    assert_eq!(node.manager.log().len(), before);
}

/// Chute a runtime call concerns: `create bravo`, `prepare_image bravo:1`.
fn call_target<'a>(call: &'a str, names: &[&str]) -> Option<&'a str> {
    let target = call.split_whitespace().nth(1)?;
    let chute = target.split([':', '-']).next()?;
    names.iter().any(|n| *n == chute).then_some(chute)
}

/// Three threads submit at once; ids follow queue order and the updates run
/// one after another.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_submissions_are_serialized() {
    let node = Node::start();
    let names = ["alpha", "bravo", "charlie"];
    let barrier = Arc::new(std::sync::Barrier::new(names.len()));
    let completed = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = names
        .into_iter()
        .map(|name| {
            let manager = node.manager.clone();
            let barrier = barrier.clone();
            let completed = completed.clone();
            std::thread::spawn(move || {
                barrier.wait();
                manager
                    .add(
                        descriptor(create_chute(name, 1)),
                        Some(Box::new(move |outcome: &UpdateOutcome| {
                            completed.lock().push(outcome.id)
                        })),
                    )
                    .map(|ticket| (name, ticket))
            })
        })
        .collect();
    let mut tickets: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();
    tickets.sort_by_key(|(_, t)| t.id);

    let toks: Vec<u64> = tickets.iter().map(|(_, t)| t.tok).collect();
    assert!(toks.windows(2).all(|w| w[0] < w[1]), "toks out of order: {toks:?}");
    let ids: Vec<u64> = tickets.iter().map(|(_, t)| t.id).collect();
    let submitted: Vec<&str> = tickets.iter().map(|(name, _)| *name).collect();

    for (name, ticket) in tickets {
        let outcome = tokio::time::timeout(Duration::from_secs(20), ticket.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.success, "{name}: {}", outcome.message);
    }
    wait_for(5_000, || completed.lock().len() == ids.len())
        .await
        .unwrap();
    assert_eq!(*completed.lock(), ids);

    // Each chute's runtime calls form one contiguous run, in queue order.
    let mut runs: Vec<&str> = Vec::new();
    let calls = node.runtime.calls();
    for chute in calls.iter().filter_map(|c| call_target(c, &names)) {
        if runs.last() != Some(&chute) {
            runs.push(chute);
        }
    }
    assert_eq!(runs, submitted, "interleaved calls: {calls:?}");
}

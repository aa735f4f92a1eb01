//! End-to-end replication over real sockets.
//!
//! These start real repos, bind real listeners, and drive the full
//! pipeline: create → replicate → writer feeds → FEEDS_SHARED → causal
//! loading → readiness.

use hypermerge::repo::{Repo, RepoConfig, RepoEvent};
use hypermerge::{DocId, Document};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

async fn ready_repo(config: RepoConfig) -> (Repo, mpsc::Receiver<RepoEvent>) {
    let mut repo = Repo::new(config).unwrap();
    let mut rx = repo.take_event_rx().unwrap();
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(RepoEvent::Ready) = rx.recv().await {
                break;
            }
        }
    })
    .await
    .expect("repo never became ready");
    (repo, rx)
}

async fn in_memory_repo() -> (Repo, mpsc::Receiver<RepoEvent>) {
    ready_repo(RepoConfig::default()).await
}

async fn wait_doc_ready(rx: &mut mpsc::Receiver<RepoEvent>, doc_id: DocId) -> Document {
    timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await.expect("event channel closed") {
                RepoEvent::DocumentReady { doc_id: d, doc } if d == doc_id => return doc,
                _ => {}
            }
        }
    })
    .await
    .expect("document never became ready")
}

async fn wait_updated_until<F>(rx: &mut mpsc::Receiver<RepoEvent>, doc_id: DocId, pred: F) -> Document
where
    F: Fn(&Document) -> bool,
{
    timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await.expect("event channel closed") {
                RepoEvent::DocumentUpdated { doc_id: d, doc } if d == doc_id && pred(&doc) => {
                    return doc
                }
                RepoEvent::DocumentReady { doc_id: d, doc } if d == doc_id && pred(&doc) => {
                    return doc
                }
                _ => {}
            }
        }
    })
    .await
    .expect("document never reached expected state")
}

#[tokio::test]
async fn one_way_sync_over_swarm() {
    let (a, mut a_rx) = in_memory_repo().await;
    let (b, mut b_rx) = in_memory_repo().await;

    let doc_id = a.create(serde_json::Map::new()).await.unwrap();
    wait_doc_ready(&mut a_rx, doc_id).await;
    a.change(doc_id, None, |t| {
        t.set("x0y0", "w");
        t.set("x0y1", "w");
        t.set("x1y0", "w");
        t.set("x1y1", "w");
    })
    .await
    .unwrap();
    a.change(doc_id, None, |t| t.set("x0y0", "r")).await.unwrap();

    let addr = a.listen("127.0.0.1:0").await.unwrap();
    b.connect(&format!("ws://{addr}")).await.unwrap();
    assert!(b.open(doc_id).await.unwrap().is_none());

    let doc = wait_doc_ready(&mut b_rx, doc_id).await;
    assert_eq!(doc.get("x0y0"), Some(&json!("r")));
    assert_eq!(doc.get("x0y1"), Some(&json!("w")));
    assert_eq!(doc.get("x1y0"), Some(&json!("w")));
    assert_eq!(doc.get("x1y1"), Some(&json!("w")));
    assert!(doc.conflicts().is_empty());
}

/// Ready always precedes the first update for a given doc.
#[tokio::test]
async fn ready_precedes_updated() {
    let (a, mut a_rx) = in_memory_repo().await;
    let (b, mut b_rx) = in_memory_repo().await;

    let doc_id = a.create(serde_json::Map::new()).await.unwrap();
    wait_doc_ready(&mut a_rx, doc_id).await;
    a.change(doc_id, None, |t| t.set("k", "1")).await.unwrap();

    let addr = a.listen("127.0.0.1:0").await.unwrap();
    b.connect(&format!("ws://{addr}")).await.unwrap();
    b.open(doc_id).await.unwrap();

    // Keep changing on A while B is syncing
    for i in 2..5 {
        a.change(doc_id, None, |t| t.set("k", format!("{i}")))
            .await
            .unwrap();
    }

    // The first document event B sees for this doc must be Ready
    let first = timeout(Duration::from_secs(10), async {
        loop {
            match b_rx.recv().await.expect("event channel closed") {
                RepoEvent::DocumentReady { doc_id: d, .. } if d == doc_id => return "ready",
                RepoEvent::DocumentUpdated { doc_id: d, .. } if d == doc_id => return "updated",
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(first, "ready");
}

/// Reverse sync: the opener becomes a writer through its own feed, and
/// the original author picks the change up via FEEDS_SHARED.
#[tokio::test]
async fn reverse_sync_through_writer_feed() {
    let (a, mut a_rx) = in_memory_repo().await;
    let (b, mut b_rx) = in_memory_repo().await;

    let doc_id = a.create(serde_json::Map::new()).await.unwrap();
    wait_doc_ready(&mut a_rx, doc_id).await;
    a.change(doc_id, None, |t| {
        t.set("x0y0", "r");
        t.set("x1y1", "w");
    })
    .await
    .unwrap();

    let addr = a.listen("127.0.0.1:0").await.unwrap();
    b.connect(&format!("ws://{addr}")).await.unwrap();
    b.open(doc_id).await.unwrap();
    wait_doc_ready(&mut b_rx, doc_id).await;

    // B edits someone else's document
    let doc = b
        .change(doc_id, None, |t| t.set("x1y1", "b"))
        .await
        .unwrap();
    assert_eq!(doc.get("x1y1"), Some(&json!("b")));

    // A converges on B's change
    let doc = wait_updated_until(&mut a_rx, doc_id, |d| d.get("x1y1") == Some(&json!("b"))).await;
    assert_eq!(doc.get("x0y0"), Some(&json!("r")));
    assert!(doc.conflicts().is_empty());
}

/// Missing-dep pull: C hears about a writer it never met through
/// FEEDS_SHARED, opens the feed, fetches its blocks through A, and
/// reaches document readiness.
#[tokio::test]
async fn third_peer_pulls_unknown_writer() {
    let (a, mut a_rx) = in_memory_repo().await;
    let (b, mut b_rx) = in_memory_repo().await;
    let (c, mut c_rx) = in_memory_repo().await;

    let doc_id = a.create(serde_json::Map::new()).await.unwrap();
    wait_doc_ready(&mut a_rx, doc_id).await;
    a.change(doc_id, None, |t| t.set("from_a", "1")).await.unwrap();

    let addr = a.listen("127.0.0.1:0").await.unwrap();

    // B becomes a second writer
    b.connect(&format!("ws://{addr}")).await.unwrap();
    b.open(doc_id).await.unwrap();
    wait_doc_ready(&mut b_rx, doc_id).await;
    b.change(doc_id, None, |t| t.set("from_b", "2")).await.unwrap();

    // A holds B's writer feed
    wait_updated_until(&mut a_rx, doc_id, |d| d.get("from_b") == Some(&json!("2"))).await;

    // C talks only to A, yet must materialize B's change too
    c.connect(&format!("ws://{addr}")).await.unwrap();
    c.open(doc_id).await.unwrap();
    let doc = wait_updated_until(&mut c_rx, doc_id, |d| {
        d.get("from_a") == Some(&json!("1")) && d.get("from_b") == Some(&json!("2"))
    })
    .await;
    assert!(doc.conflicts().is_empty());
}

/// Fork propagation over the swarm: a peer opening only the fork learns
/// the parent feeds through the shared group and materializes all of the
/// parent's fields.
#[tokio::test]
async fn fork_propagates_over_swarm() {
    let (a, mut a_rx) = in_memory_repo().await;
    let (b, mut b_rx) = in_memory_repo().await;

    let parent = a.create(serde_json::Map::new()).await.unwrap();
    wait_doc_ready(&mut a_rx, parent).await;
    a.change(parent, None, |t| {
        t.set("a", "1");
        t.set("b", "2");
    })
    .await
    .unwrap();

    let fork = a.fork(parent).await.unwrap();
    assert_ne!(fork, parent);
    wait_doc_ready(&mut a_rx, fork).await;

    let addr = a.listen("127.0.0.1:0").await.unwrap();
    b.connect(&format!("ws://{addr}")).await.unwrap();
    b.open(fork).await.unwrap();

    let doc = wait_doc_ready(&mut b_rx, fork).await;
    assert_eq!(doc.get("a"), Some(&json!("1")));
    assert_eq!(doc.get("b"), Some(&json!("2")));

    // The fork names the parent's group
    let meta = b.metadata(fork.actor()).unwrap();
    assert_eq!(meta.group_id, parent.actor());
    assert_eq!(meta.parent_id, Some(parent));
}

/// A peer attaching to a document's root feed is announced.
#[tokio::test]
async fn peer_joined_emitted_on_root_attach() {
    let (a, mut a_rx) = in_memory_repo().await;
    let (b, _b_rx) = in_memory_repo().await;

    let doc_id = a.create(serde_json::Map::new()).await.unwrap();
    wait_doc_ready(&mut a_rx, doc_id).await;

    let addr = a.listen("127.0.0.1:0").await.unwrap();
    b.connect(&format!("ws://{addr}")).await.unwrap();
    b.open(doc_id).await.unwrap();

    let actor = timeout(Duration::from_secs(10), async {
        loop {
            match a_rx.recv().await.expect("event channel closed") {
                RepoEvent::PeerJoined { actor, .. } => return actor,
                _ => {}
            }
        }
    })
    .await
    .expect("no PeerJoined event");
    assert_eq!(actor, doc_id.actor());
}

/// Documents survive a restart: the archive re-registers feeds and the
/// loader rebuilds state from disk.
#[tokio::test]
async fn restart_restores_documents() {
    let dir = tempfile::tempdir().unwrap();
    let config = RepoConfig {
        storage_path: Some(dir.path().join("repo")),
        ..RepoConfig::default()
    };

    let doc_id = {
        let (repo, mut rx) = ready_repo(config.clone()).await;
        let doc_id = repo.create(serde_json::Map::new()).await.unwrap();
        wait_doc_ready(&mut rx, doc_id).await;
        repo.change(doc_id, None, |t| t.set("persisted", "yes"))
            .await
            .unwrap();
        repo.close();
        doc_id
    };
    // Let the engine release the archive before reopening
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (repo, mut rx) = ready_repo(config).await;
    let doc = wait_doc_ready(&mut rx, doc_id).await;
    assert_eq!(doc.get("persisted"), Some(&json!("yes")));
    assert!(repo.is_document_ready(doc_id));
}

/// Opening an id nobody has produces an empty feed and no document until
/// replication delivers one.
#[tokio::test]
async fn open_unknown_doc_is_empty_not_an_error() {
    let (repo, _rx) = in_memory_repo().await;
    let unknown = DocId(hypermerge::Keypair::generate().actor_id());

    let doc = repo.open(unknown).await.unwrap();
    assert!(doc.is_none());
    assert!(!repo.is_document_ready(unknown));
}

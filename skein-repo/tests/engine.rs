use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use skein_repo::blockstore::BlockStore;
use skein_repo::{
    signing, Commit, CommitHook, CommitResult, MemRepoStorage, OpAction, RepoError, RepoManager,
    RepoStorage,
};

const DID: &str = "did:plc:w4fu6du3vfcvcyjhbmt3qwlm";
const COLLECTION: &str = "app.bsky.feed.post";

fn post(text: &str) -> serde_json::Value {
    json!({
        "$type": COLLECTION,
        "text": text,
        "createdAt": "2026-02-08T00:00:00Z",
    })
}

async fn new_repo() -> (RepoManager, MemRepoStorage, String) {
    let manager = RepoManager::new();
    let storage = MemRepoStorage::new();
    let key = signing::generate_key();
    manager.init_repo(&storage, DID, &key).await.unwrap();
    (manager, storage, key)
}

#[tokio::test]
async fn create_then_read_round_trips() {
    let (manager, storage, key) = new_repo().await;

    let record = post("hi");
    let (uri, result) = manager
        .create_record(&storage, DID, &key, COLLECTION, &record)
        .await
        .unwrap();

    let rkey = uri.rsplit('/').next().unwrap().to_string();
    assert_eq!(uri, format!("at://{DID}/{COLLECTION}/{rkey}"));
    assert_eq!(result.ops.len(), 1);
    assert_eq!(result.ops[0].action, OpAction::Create);

    let (cid, value) = manager
        .get_record(&storage, DID, COLLECTION, &rkey)
        .await
        .unwrap();
    assert_eq!(Some(cid), result.ops[0].cid);
    assert_eq!(value, record);
}

#[tokio::test]
async fn tree_root_is_insertion_order_independent() {
    let records: Vec<(String, serde_json::Value)> = (0..20)
        .map(|i| (format!("rkey{i:02}"), post(&format!("post {i}"))))
        .collect();

    async fn data_cid_after(records: &[(String, serde_json::Value)]) -> cid::Cid {
        let manager = RepoManager::new();
        let storage = MemRepoStorage::new();
        let key = signing::generate_key();
        manager.init_repo(&storage, DID, &key).await.unwrap();
        for (rkey, record) in records {
            manager
                .put_record(&storage, DID, &key, COLLECTION, rkey, record)
                .await
                .unwrap();
        }
        let (commit_cid, _) = manager.get_root(&storage, DID).await.unwrap();
        let blocks = storage.load_blocks(DID).await.unwrap();
        Commit::load(&blocks, commit_cid).unwrap().data
    }

    let forward = data_cid_after(&records).await;
    let mut shuffled = records.clone();
    shuffled.reverse();
    let backward = data_cid_after(&shuffled).await;

    assert_eq!(forward, backward);
}

#[tokio::test]
async fn commit_signature_verifies() {
    let (manager, storage, key) = new_repo().await;
    manager
        .put_record(&storage, DID, &key, COLLECTION, "3kabc", &post("signed"))
        .await
        .unwrap();

    let (commit_cid, _) = manager.get_root(&storage, DID).await.unwrap();
    let blocks = storage.load_blocks(DID).await.unwrap();
    let commit = Commit::load(&blocks, commit_cid).unwrap();

    let signing_key = signing::parse_key(&key).unwrap();
    assert!(commit.verify(signing_key.verifying_key()).unwrap());

    let other = signing::parse_key(&signing::generate_key()).unwrap();
    assert!(!commit.verify(other.verifying_key()).unwrap());
}

#[tokio::test]
async fn revisions_increase_per_commit() {
    let (manager, storage, key) = new_repo().await;

    let (_, rev0) = manager.get_root(&storage, DID).await.unwrap();
    let mut prev = rev0;
    for i in 0..5 {
        let (_, result) = manager
            .put_record(
                &storage,
                DID,
                &key,
                COLLECTION,
                &format!("rkey{i}"),
                &post("r"),
            )
            .await
            .unwrap();
        assert!(result.rev > prev, "{} should sort after {prev}", result.rev);
        assert_eq!(result.prev_rev.as_deref(), Some(prev.as_str()));
        prev = result.rev;
    }
}

#[tokio::test]
async fn diff_archive_is_exactly_the_new_blocks() {
    let (manager, storage, key) = new_repo().await;
    for i in 0..10 {
        manager
            .put_record(
                &storage,
                DID,
                &key,
                COLLECTION,
                &format!("seed{i:02}"),
                &post("seed"),
            )
            .await
            .unwrap();
    }

    let before: HashSet<_> = storage.block_cids(DID).into_iter().collect();
    let (_, result) = manager
        .put_record(&storage, DID, &key, COLLECTION, "fresh", &post("fresh"))
        .await
        .unwrap();
    let after: HashSet<_> = storage.block_cids(DID).into_iter().collect();

    let mut reader = iroh_car::CarReader::new(std::io::Cursor::new(result.diff_car.to_vec()))
        .await
        .unwrap();
    assert_eq!(reader.header().roots(), vec![result.commit_cid]);

    let mut car_cids = HashSet::new();
    let mut first = None;
    while let Some((cid, _)) = reader.next_block().await.unwrap() {
        if first.is_none() {
            first = Some(cid);
        }
        car_cids.insert(cid);
    }

    assert_eq!(first, Some(result.commit_cid));
    let expected: HashSet<_> = after.difference(&before).copied().collect();
    assert_eq!(car_cids, expected);
}

#[tokio::test]
async fn concurrent_writes_to_one_did_form_a_chain() {
    let manager = Arc::new(RepoManager::new());
    let storage = MemRepoStorage::new();
    let key = signing::generate_key();
    manager.init_repo(&storage, DID, &key).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let manager = Arc::clone(&manager);
        let storage = storage.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            manager
                .put_record(
                    &storage,
                    DID,
                    &key,
                    COLLECTION,
                    &format!("race{i:02}"),
                    &post("race"),
                )
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Walk the chain from the head back to the init commit.
    let (mut head, _) = manager.get_root(&storage, DID).await.unwrap();
    let blocks = storage.load_blocks(DID).await.unwrap();
    let mut hops = 0;
    loop {
        let commit = Commit::load(&blocks, head).unwrap();
        match commit.prev {
            Some(prev) => {
                head = prev;
                hops += 1;
            }
            None => break,
        }
    }
    assert_eq!(hops, 16);
}

#[tokio::test]
async fn delete_missing_record_leaves_repo_untouched() {
    let (manager, storage, key) = new_repo().await;
    let (root_before, _) = manager.get_root(&storage, DID).await.unwrap();

    let err = manager
        .delete_record(&storage, DID, &key, COLLECTION, "nonexistent")
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::RecordNotFound(_)));

    let (root_after, _) = manager.get_root(&storage, DID).await.unwrap();
    assert_eq!(root_before, root_after);
}

#[tokio::test]
async fn put_at_existing_rkey_is_an_update() {
    let (manager, storage, key) = new_repo().await;

    let (_, first) = manager
        .put_record(&storage, DID, &key, COLLECTION, "3kabc", &post("one"))
        .await
        .unwrap();
    let (_, second) = manager
        .put_record(&storage, DID, &key, COLLECTION, "3kabc", &post("two"))
        .await
        .unwrap();

    assert_eq!(second.ops[0].action, OpAction::Update);
    assert_eq!(second.ops[0].prev, first.ops[0].cid);

    let result = manager
        .delete_record(&storage, DID, &key, COLLECTION, "3kabc")
        .await
        .unwrap();
    assert_eq!(result.ops[0].action, OpAction::Delete);
    assert_eq!(result.ops[0].cid, None);
    assert_eq!(result.ops[0].prev, second.ops[0].cid);
}

#[tokio::test]
async fn pagination_covers_the_full_collection() {
    let (manager, storage, key) = new_repo().await;
    for i in 0..23 {
        manager
            .put_record(
                &storage,
                DID,
                &key,
                COLLECTION,
                &format!("page{i:02}"),
                &post("p"),
            )
            .await
            .unwrap();
    }

    let (all, none) = manager
        .list_records(&storage, DID, COLLECTION, Some(100), None, false)
        .await
        .unwrap();
    assert_eq!(all.len(), 23);
    assert!(none.is_none());

    let mut paged = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let (page, next) = manager
            .list_records(&storage, DID, COLLECTION, Some(5), cursor.as_deref(), false)
            .await
            .unwrap();
        paged.extend(page.into_iter().map(|r| r.uri));
        match next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    let full: Vec<_> = all.into_iter().map(|r| r.uri).collect();
    assert_eq!(paged, full);
}

#[tokio::test]
async fn list_reverse_flips_order_and_out_of_range_limit_is_coerced() {
    let (manager, storage, key) = new_repo().await;
    for i in 0..3 {
        manager
            .put_record(
                &storage,
                DID,
                &key,
                COLLECTION,
                &format!("rk{i}"),
                &post("p"),
            )
            .await
            .unwrap();
    }

    let (forward, _) = manager
        .list_records(&storage, DID, COLLECTION, Some(500), None, false)
        .await
        .unwrap();
    let (reversed, _) = manager
        .list_records(&storage, DID, COLLECTION, None, None, true)
        .await
        .unwrap();

    assert_eq!(forward.len(), 3);
    let mut flipped: Vec<_> = reversed.into_iter().map(|r| r.uri).collect();
    flipped.reverse();
    assert_eq!(flipped, forward.into_iter().map(|r| r.uri).collect::<Vec<_>>());
}

#[tokio::test]
async fn init_repo_is_idempotent() {
    let (manager, storage, key) = new_repo().await;
    let (root_before, rev_before) = manager.get_root(&storage, DID).await.unwrap();

    manager.init_repo(&storage, DID, &key).await.unwrap();

    let (root_after, rev_after) = manager.get_root(&storage, DID).await.unwrap();
    assert_eq!(root_before, root_after);
    assert_eq!(rev_before, rev_after);
}

#[tokio::test]
async fn describe_repo_lists_distinct_collections() {
    let (manager, storage, key) = new_repo().await;
    for collection in ["app.bsky.feed.post", "app.bsky.actor.profile", "app.bsky.feed.post"] {
        manager
            .create_record(&storage, DID, &key, collection, &post("x"))
            .await
            .unwrap();
    }

    let collections = manager.describe_repo(&storage, DID).await.unwrap();
    assert_eq!(
        collections,
        vec!["app.bsky.actor.profile".to_string(), "app.bsky.feed.post".to_string()]
    );
}

#[tokio::test]
async fn export_contains_the_full_block_closure() {
    let (manager, storage, key) = new_repo().await;
    for i in 0..5 {
        manager
            .put_record(
                &storage,
                DID,
                &key,
                COLLECTION,
                &format!("exp{i}"),
                &post("e"),
            )
            .await
            .unwrap();
    }

    let mut car = Vec::new();
    manager.export_repo(&storage, DID, &mut car).await.unwrap();

    let (commit_cid, _) = manager.get_root(&storage, DID).await.unwrap();
    let mut reader = iroh_car::CarReader::new(std::io::Cursor::new(car)).await.unwrap();
    assert_eq!(reader.header().roots(), vec![commit_cid]);

    let mut exported = skein_repo::MemBlockstore::new();
    let mut first = None;
    while let Some((cid, data)) = reader.next_block().await.unwrap() {
        if first.is_none() {
            first = Some(cid);
        }
        exported.put(cid, data.into());
    }
    assert_eq!(first, Some(commit_cid));

    // The commit, every tree node, and every record must be reachable.
    let commit = Commit::load(&exported, commit_cid).unwrap();
    let tree = skein_repo::mst::Tree::load(&exported, commit.data).unwrap();
    assert_eq!(tree.len(), 5);
    for (_, record_cid) in tree.iter() {
        assert!(exported.has(&record_cid));
    }
}

#[tokio::test]
async fn unknown_repo_and_bad_input_are_rejected() {
    let manager = RepoManager::new();
    let storage = MemRepoStorage::new();
    let key = signing::generate_key();

    let err = manager.get_root(&storage, "did:plc:missing").await.unwrap_err();
    assert!(matches!(err, RepoError::RepoNotFound(_)));

    manager.init_repo(&storage, DID, &key).await.unwrap();
    let err = manager
        .put_record(&storage, DID, &key, "not-a-collection", "rk", &post("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::InvalidRecord(_)));

    let err = manager
        .put_record(&storage, DID, &key, COLLECTION, "bad/rkey", &post("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::InvalidRecord(_)));
}

#[derive(Default)]
struct RecordingHook {
    seen: Mutex<Vec<(String, String)>>,
    fail: bool,
}

#[async_trait]
impl CommitHook for RecordingHook {
    async fn on_commit(&self, did: &str, result: &CommitResult) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("sink unavailable");
        }
        self.seen.lock().push((did.to_string(), result.rev.clone()));
        Ok(())
    }
}

#[tokio::test]
async fn commit_hook_runs_for_every_write() {
    let hook = Arc::new(RecordingHook::default());
    let manager = RepoManager::with_hook(hook.clone());
    let storage = MemRepoStorage::new();
    let key = signing::generate_key();
    manager.init_repo(&storage, DID, &key).await.unwrap();

    let (_, result) = manager
        .put_record(&storage, DID, &key, COLLECTION, "hooked", &post("h"))
        .await
        .unwrap();

    let seen = hook.seen.lock();
    assert_eq!(seen.as_slice(), &[(DID.to_string(), result.rev.clone())]);
}

#[tokio::test]
async fn hook_failure_surfaces_but_commit_stands() {
    let hook = Arc::new(RecordingHook {
        seen: Mutex::new(Vec::new()),
        fail: true,
    });
    let manager = RepoManager::with_hook(hook);
    let storage = MemRepoStorage::new();
    let key = signing::generate_key();
    manager.init_repo(&storage, DID, &key).await.unwrap();

    let (root_before, _) = manager.get_root(&storage, DID).await.unwrap();
    let err = manager
        .put_record(&storage, DID, &key, COLLECTION, "doomed", &post("d"))
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::EventEmission(_)));

    // The commit is durable despite the emission failure.
    let (root_after, _) = manager.get_root(&storage, DID).await.unwrap();
    assert_ne!(root_before, root_after);
    let (_, value) = manager
        .get_record(&storage, DID, COLLECTION, "doomed")
        .await
        .unwrap();
    assert_eq!(value, post("d"));
}

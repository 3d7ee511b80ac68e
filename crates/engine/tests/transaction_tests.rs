//! End-to-end transaction lifecycle tests: add/commit round trips,
//! rollback, unique-key enforcement, node splitting and cache hygiene.

mod common;

use common::{small_store, Env};
use serde::{Deserialize, Serialize};
use sop_core::{format_lock_key, Cache, Error, StoreOptions, StoreRepository};
use sop_engine::{new_btree, open_btree, TransactionMode};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct PersonKey {
    lastname: String,
    firstname: String,
}

impl PersonKey {
    fn new(first: &str, last: &str) -> Self {
        PersonKey {
            lastname: last.to_string(),
            firstname: first.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Person {
    gender: String,
    email: String,
    phone: String,
    ssn: String,
}

impl Person {
    fn new(gender: &str, email: &str, phone: &str, ssn: &str) -> Self {
        Person {
            gender: gender.to_string(),
            email: email.to_string(),
            phone: phone.to_string(),
            ssn: ssn.to_string(),
        }
    }
}

#[test]
fn test_add_commit_and_read_back() {
    let env = Env::new();

    // Values live in their own blob segment for this store.
    let txn = env.transaction(TransactionMode::ForWriting);
    let tree = new_btree::<PersonKey, Person>(
        StoreOptions::new("persondb", 500, false, false),
        &txn,
    )
    .unwrap();
    let key = PersonKey::new("joe", "krueger");
    let value = Person::new("male", "email", "phone", "1234");
    assert!(tree.add(key.clone(), value.clone()).unwrap());

    // The uncommitted item is visible to its own transaction.
    assert!(tree.find(&key).unwrap());
    assert_eq!(tree.get_current_value().unwrap().unwrap().phone, "phone");

    txn.commit().unwrap();

    // A later reader resolves it through the backends.
    let reader = env.transaction(TransactionMode::ForReading);
    let tree = open_btree::<PersonKey, Person>("persondb", &reader).unwrap();
    assert!(tree.find(&key).unwrap());
    assert_eq!(tree.get_current_value().unwrap(), Some(value));
    assert_eq!(tree.count(), 1);
    reader.commit().unwrap();
}

#[test]
fn test_rollback_restores_value() {
    let env = Env::new();
    let key = PersonKey::new("joe", "shroeger");

    let txn = env.transaction(TransactionMode::ForWriting);
    let tree =
        new_btree::<PersonKey, Person>(StoreOptions::new("persondb", 100, false, true), &txn)
            .unwrap();
    tree.add(key.clone(), Person::new("male", "email", "", ""))
        .unwrap();
    txn.commit().unwrap();

    // Update, then change our mind.
    let txn = env.transaction(TransactionMode::ForWriting);
    let tree = open_btree::<PersonKey, Person>("persondb", &txn).unwrap();
    assert!(tree
        .update(&key, Person::new("male", "email2", "phone2", ""))
        .unwrap());
    txn.rollback(None).unwrap();

    let reader = env.transaction(TransactionMode::ForReading);
    let tree = open_btree::<PersonKey, Person>("persondb", &reader).unwrap();
    assert!(tree.find(&key).unwrap());
    assert_eq!(tree.get_current_value().unwrap().unwrap().email, "email");
    reader.commit().unwrap();
}

#[test]
fn test_unique_key_conflict_across_transactions() {
    let env = Env::new();

    let t1 = env.transaction(TransactionMode::ForWriting);
    let tree1 =
        new_btree::<i32, String>(StoreOptions::new("uniq", 10, true, true), &t1).unwrap();

    // T2 binds before T1 commits, so it stages against the same empty
    // tree.
    let t2 = env.transaction(TransactionMode::ForWriting);
    let tree2 = open_btree::<i32, String>("uniq", &t2).unwrap();

    assert!(tree1.add(1, "hello world".to_string()).unwrap());
    t1.commit().unwrap();

    assert!(tree2.add(1, "hello world".to_string()).unwrap());
    let err = t2.commit().unwrap_err();
    assert!(err.is_conflict(), "duplicate add surfaces as conflict: {err}");
}

#[test]
fn test_same_transaction_duplicate_add_returns_false() {
    let env = Env::new();
    let txn = env.transaction(TransactionMode::ForWriting);
    let tree = new_btree::<i32, String>(StoreOptions::new("uniq2", 10, true, true), &txn).unwrap();
    assert!(tree.add(1, "a".to_string()).unwrap());
    assert!(!tree.add(1, "b".to_string()).unwrap());
    txn.commit().unwrap();
}

#[test]
fn test_many_adds_split_nodes_and_stay_ordered() {
    let env = Env::new();

    let txn = env.transaction(TransactionMode::ForWriting);
    let tree = new_btree::<i32, String>(small_store("splits"), &txn).unwrap();
    // Slot length four: enough inserts to force several splits and a
    // new root.
    for i in (0..40).rev() {
        assert!(tree.add(i, format!("v{}", i)).unwrap());
    }
    assert_eq!(tree.count(), 40);
    txn.commit().unwrap();

    let reader = env.transaction(TransactionMode::ForReading);
    let tree = open_btree::<i32, String>("splits", &reader).unwrap();
    for i in 0..40 {
        assert!(tree.find(&i).unwrap(), "key {} resolvable after commit", i);
        assert_eq!(tree.get_current_value().unwrap(), Some(format!("v{}", i)));
    }
    // Full in-order traversal.
    let mut seen = Vec::new();
    let mut more = tree.first().unwrap();
    while more {
        seen.push(tree.get_current_key().unwrap().unwrap());
        more = tree.next().unwrap();
    }
    assert_eq!(seen, (0..40).collect::<Vec<_>>());
    reader.commit().unwrap();
}

#[test]
fn test_remove_then_commit() {
    let env = Env::new();

    let txn = env.transaction(TransactionMode::ForWriting);
    let tree = new_btree::<i32, String>(small_store("removals"), &txn).unwrap();
    for i in 0..6 {
        tree.add(i, format!("v{}", i)).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.transaction(TransactionMode::ForWriting);
    let tree = open_btree::<i32, String>("removals", &txn).unwrap();
    assert!(tree.remove(&3).unwrap());
    assert!(!tree.remove(&99).unwrap());
    txn.commit().unwrap();

    let reader = env.transaction(TransactionMode::ForReading);
    let tree = open_btree::<i32, String>("removals", &reader).unwrap();
    assert!(!tree.find(&3).unwrap());
    assert!(tree.find(&2).unwrap());
    assert!(tree.find(&4).unwrap());
    assert_eq!(tree.count(), 5);
    reader.commit().unwrap();
}

#[test]
fn test_committed_update_bumps_handle_version_by_one() {
    let env = Env::new();

    let txn = env.transaction(TransactionMode::ForWriting);
    let tree = new_btree::<i32, String>(small_store("versions"), &txn).unwrap();
    tree.add(1, "one".to_string()).unwrap();
    txn.commit().unwrap();

    let root_id = env
        .store_repository
        .get(&["versions".to_string()])
        .unwrap()[0]
        .root_node_id;
    let before = env
        .registry
        .get_handle("versions_r", root_id)
        .expect("root handle");
    assert_eq!(before.version, 1);

    let txn = env.transaction(TransactionMode::ForWriting);
    let tree = open_btree::<i32, String>("versions", &txn).unwrap();
    tree.update(&1, "uno".to_string()).unwrap();
    txn.commit().unwrap();

    let after = env.registry.get_handle("versions_r", root_id).unwrap();
    assert_eq!(after.version, before.version + 1);
    // The publish flipped the active slot; the old blob is gone.
    assert_ne!(after.get_active_id(), before.get_active_id());
    assert!(!env
        .blob_store
        .contains("versions_b", before.get_active_id()));
    assert!(env.blob_store.contains("versions_b", after.get_active_id()));
}

#[test]
fn test_no_lock_keys_survive_commit() {
    let env = Env::new();

    let txn = env.transaction(TransactionMode::ForWriting);
    let tree = new_btree::<i32, String>(small_store("locks"), &txn).unwrap();
    tree.add(1, "one".to_string()).unwrap();
    txn.commit().unwrap();

    let txn = env.transaction(TransactionMode::ForWriting);
    let tree = open_btree::<i32, String>("locks", &txn).unwrap();
    tree.update(&1, "uno".to_string()).unwrap();
    let item_id = tree.get_current_item().unwrap().unwrap().id;
    txn.commit().unwrap();

    let root_id = env.store_repository.get(&["locks".to_string()]).unwrap()[0].root_node_id;
    for id in [root_id, item_id] {
        let key = format_lock_key(&id.to_string());
        assert!(
            !env.l2().is_locked_by_others(&[key]).unwrap(),
            "lock key for {} still held after commit",
            id
        );
    }
}

#[test]
fn test_globally_cached_values_hit_the_shared_cache() {
    let env = Env::new();

    let mut options = StoreOptions::new("cached_values", 10, false, false);
    options.is_value_data_globally_cached = true;

    let txn = env.transaction(TransactionMode::ForWriting);
    let tree = new_btree::<i32, String>(options, &txn).unwrap();
    tree.add(7, "cached".to_string()).unwrap();
    txn.commit().unwrap();

    let reader = env.transaction(TransactionMode::ForReading);
    let tree = open_btree::<i32, String>("cached_values", &reader).unwrap();
    assert!(tree.find(&7).unwrap());
    let item_id = tree.get_current_item().unwrap().unwrap().id;
    assert_eq!(tree.get_current_value().unwrap(), Some("cached".to_string()));
    reader.commit().unwrap();

    // The value blob is mirrored under its "V" key.
    assert!(env
        .cache
        .get(&sop_core::format_item_key(item_id))
        .unwrap()
        .is_some());
}

#[test]
fn test_actively_persisted_values_commit_and_roll_back() {
    let env = Env::new();

    let mut options = StoreOptions::new("eager", 10, false, false);
    options.is_value_data_actively_persisted = true;

    // Adds write their value blobs immediately, guarded by a
    // pre-commit log record under the transaction's original ID.
    let txn = env.transaction(TransactionMode::ForWriting);
    let original_tid = txn.id();
    let tree = new_btree::<i32, String>(options.clone(), &txn).unwrap();
    tree.add(1, "eager-one".to_string()).unwrap();
    assert!(tree.find(&1).unwrap());
    let item_id = tree.get_current_item().unwrap().unwrap().id;
    assert!(env.blob_store.contains("eager_b", item_id));

    txn.commit().unwrap();
    // The commit ran under a rotated ID; both logs are collected.
    assert_ne!(txn.id(), original_tid);
    assert!(env.log.is_empty());

    let reader = env.transaction(TransactionMode::ForReading);
    let tree = open_btree::<i32, String>("eager", &reader).unwrap();
    assert!(tree.find(&1).unwrap());
    assert_eq!(tree.get_current_value().unwrap(), Some("eager-one".to_string()));
    reader.commit().unwrap();

    // A rolled-back add reclaims its eagerly written blob.
    let txn = env.transaction(TransactionMode::ForWriting);
    let tree = open_btree::<i32, String>("eager", &txn).unwrap();
    tree.add(2, "eager-two".to_string()).unwrap();
    assert!(tree.find(&2).unwrap());
    let dangling_id = tree.get_current_item().unwrap().unwrap().id;
    assert!(env.blob_store.contains("eager_b", dangling_id));
    txn.rollback(None).unwrap();
    assert!(!env.blob_store.contains("eager_b", dangling_id));
    assert!(env.log.is_empty());
}

#[test]
fn test_open_missing_store_fails() {
    let env = Env::new();
    let txn = env.transaction(TransactionMode::ForWriting);
    let err = open_btree::<i32, String>("nope", &txn).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    txn.close().unwrap();
}

#[test]
fn test_incompatible_store_options_rejected() {
    let env = Env::new();
    let txn = env.transaction(TransactionMode::ForWriting);
    new_btree::<i32, String>(StoreOptions::new("strict", 10, true, true), &txn).unwrap();
    txn.commit().unwrap();

    let txn = env.transaction(TransactionMode::ForWriting);
    let err = new_btree::<i32, String>(StoreOptions::new("strict", 10, false, true), &txn)
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    txn.close().unwrap();
}

#[test]
fn test_btree_requires_begun_transaction() {
    let env = Env::new();
    let txn = env.transaction(TransactionMode::ForWriting);
    let tree = new_btree::<i32, String>(small_store("inactive"), &txn).unwrap();
    txn.commit().unwrap();
    // The transaction ended; the tree is unusable.
    assert!(tree.add(1, "late".to_string()).is_err());
}

#[test]
fn test_transaction_log_is_clean_after_commit_and_rollback() {
    let env = Env::new();

    let txn = env.transaction(TransactionMode::ForWriting);
    let tree = new_btree::<i32, String>(small_store("logclean"), &txn).unwrap();
    tree.add(1, "one".to_string()).unwrap();
    txn.commit().unwrap();
    assert!(env.log.is_empty(), "commit removes its log");

    let txn = env.transaction(TransactionMode::ForWriting);
    let tree = open_btree::<i32, String>("logclean", &txn).unwrap();
    tree.update(&1, "uno".to_string()).unwrap();
    txn.phase_1_commit().unwrap();
    txn.rollback(None).unwrap();
    assert!(env.log.is_empty(), "rollback removes its log");

    // And the staged inactive slot was cleared.
    let root_id = env.store_repository.get(&["logclean".to_string()]).unwrap()[0].root_node_id;
    let handle = env.registry.get_handle("logclean_r", root_id).unwrap();
    assert!(handle.get_inactive_id().is_nil());
    assert_eq!(handle.work_in_progress_timestamp, 0);
}

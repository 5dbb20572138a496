//! Integration tests for the async database wrapper.
//!
//! Runs against a private in-process memory server per test.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use common::{check_optional_callback, client_for, fresh_client};
use futures::FutureExt;
use tideway::bson::{doc, Bson};
use tideway::driver::MemoryServer;
use tideway::{AutoReference, Collection, Database, NamespaceInjector, PoolConfig, TidewayError};

const AUTHENTICATION_FAILED: i32 = 18;
const UNAUTHORIZED: i32 = 13;

#[tokio::test]
async fn test_database() {
    let (_server, client) = fresh_client();
    let db = Database::new(&client, "test");
    assert_eq!(db.name(), "test");
    assert_eq!(db, client.database("test"));
    assert_eq!(db.delegate().name(), "test");

    // A collection named after a wrapper method is still reachable
    let delegate = db.collection("delegate");
    assert_eq!(delegate.name(), "delegate");
    assert_eq!(delegate.full_name(), "test.delegate");
}

#[tokio::test]
async fn test_callbacks() {
    let (_server, client) = fresh_client();
    let db = client.database("test");
    db.collection("seed").insert(doc! { "x": 1 }).await.unwrap();

    check_optional_callback(|| db.collection_names(), true).await;
    check_optional_callback(|| db.command(doc! { "buildinfo": 1 }), true).await;
    check_optional_callback(|| db.validate_collection("seed"), true).await;

    let counter = AtomicUsize::new(0);
    let created: Collection = check_optional_callback(
        || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            db.create_collection(&format!("callback_{}", n), doc! {})
        },
        true,
    )
    .await;
    assert_eq!(created.name(), "callback_1");

    check_optional_callback(|| db.drop_collection("callback_0"), false).await;
    check_optional_callback(|| db.add_user("mike", "password", false), false).await;
    check_optional_callback(|| db.authenticate("mike", "password"), true).await;
    check_optional_callback(|| db.logout(), false).await;
    check_optional_callback(|| db.remove_user("mike"), false).await;
}

#[tokio::test]
async fn test_command() {
    let (_server, client) = fresh_client();
    let db = client.database("admin");
    let info = db.command(doc! { "buildinfo": 1 }).await.unwrap();
    assert!(matches!(info.get("bits"), Some(Bson::Int32(64))));

    let err = db.command(doc! { "notacommand": 1 }).await.unwrap_err();
    assert!(matches!(err, TidewayError::OperationFailure { .. }));
}

#[tokio::test]
async fn test_create_collection() {
    let (_server, client) = fresh_client();
    let db = client.database("test");

    let test = db.create_collection("test", doc! {}).await.unwrap();
    assert_eq!(test.name(), "test");
    assert!(db.collection_names().await.unwrap().contains(&"test".to_string()));

    let err = db.create_collection("test", doc! {}).await.unwrap_err();
    assert!(matches!(err, TidewayError::CollectionInvalid(_)));

    let capped = db
        .create_collection("capped", doc! { "capped": true, "size": 1000 })
        .await
        .unwrap();
    assert_eq!(capped.options().await.unwrap(), doc! { "capped": true, "size": 1000 });

    let sub = db.collection("test").child("foo");
    db.create_collection(sub.name(), doc! {}).await.unwrap();
    assert!(db.collection_names().await.unwrap().contains(&"test.foo".to_string()));
}

#[tokio::test]
async fn test_create_collection_rejects_bad_name_before_io() {
    let (server, client) = fresh_client();
    let db = client.database("test");

    let op = db.create_collection("", doc! {});
    assert!(op.is_ready());
    assert!(op.now_or_never().unwrap().unwrap_err().is_argument_error());
    assert_eq!(server.connections_opened(), 0);
    assert_eq!(client.pool_stats().created, 0);
}

#[tokio::test]
async fn test_drop_collection() {
    let (_server, client) = fresh_client();
    let db = client.database("test");

    for name in ["by_name", "by_wrapper", "by_bson"] {
        db.collection(name).insert(doc! { "x": 1 }).await.unwrap();
    }

    db.drop_collection("by_name").await.unwrap();
    db.drop_collection(&db.collection("by_wrapper")).await.unwrap();
    db.drop_collection(Bson::String("by_bson".to_string())).await.unwrap();
    assert!(db.collection_names().await.unwrap().is_empty());

    // Missing collections are fine
    db.drop_collection("never_existed").await.unwrap();

    let op = db.drop_collection(Bson::Int32(5));
    assert!(op.is_ready());
    assert!(op.await.unwrap_err().is_argument_error());
}

#[tokio::test]
async fn test_validate_collection() {
    let (_server, client) = fresh_client();
    let db = client.database("test");

    let op = db.validate_collection(Bson::Int32(5));
    assert!(op.is_ready());
    assert!(op.await.unwrap_err().is_argument_error());

    let op = db.validate_collection(None::<&str>);
    assert!(op.await.unwrap_err().is_argument_error());

    let err = db.validate_collection("test.doesnotexist").await.unwrap_err();
    assert!(matches!(err, TidewayError::OperationFailure { .. }));

    db.collection("test").insert(doc! { "dummy": "object" }).await.unwrap();
    assert!(!db.validate_collection("test").await.unwrap().is_empty());
    assert!(!db.validate_collection(&db.collection("test")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_auto_ref_and_deref() {
    let (_server, client) = fresh_client();
    let db = client.database("test");
    db.add_son_manipulator(AutoReference::new(&db));
    db.add_son_manipulator(NamespaceInjector);

    let test = db.collection("test");
    let a = test.child("a").save(doc! { "hello": "world" }).await.unwrap();
    let b = test.child("b").save(doc! { "test": a.clone() }).await.unwrap();
    let c = test
        .child("c")
        .save(doc! { "another test": b.clone() })
        .await
        .unwrap();
    assert_eq!(a.get_str("_ns").unwrap(), "test.a");

    let mut a = a;
    a.insert("hello", "mike");
    let a = test.child("a").save(a).await.unwrap();

    assert_eq!(test.child("a").find_one(doc! {}).await.unwrap().unwrap(), a);

    let found_b = test.child("b").find_one(doc! {}).await.unwrap().unwrap();
    assert_eq!(found_b.get_document("test").unwrap(), &a);

    let found_c = test.child("c").find_one(doc! {}).await.unwrap().unwrap();
    assert_eq!(
        found_c
            .get_document("another test")
            .unwrap()
            .get_document("test")
            .unwrap(),
        &a
    );

    // References always show the current state of their target
    let mut expected_b = b;
    expected_b.insert("test", a.clone());
    assert_eq!(found_b, expected_b);

    let mut expected_c = c;
    expected_c.insert("another test", expected_b);
    assert_eq!(found_c, expected_c);
}

#[tokio::test]
async fn test_auto_ref_stores_references() {
    let (_server, client) = fresh_client();
    let db = client.database("test");
    db.add_son_manipulator(AutoReference::new(&db));
    db.add_son_manipulator(NamespaceInjector);

    let target = db.collection("people").save(doc! { "name": "ada" }).await.unwrap();
    db.collection("teams").save(doc! { "lead": target.clone() }).await.unwrap();

    // A fresh blocking handle has no AutoReference, so it sees the stored
    // form: a reference, not a copy
    let raw = client.delegate().database("test");
    let stored = tokio::task::spawn_blocking(move || {
        let mut cursor = raw.collection("teams").find(doc! {});
        cursor.next_document()
    })
    .await
    .unwrap()
    .unwrap()
    .unwrap();
    assert_eq!(
        stored.get_document("lead").unwrap(),
        &doc! { "$ref": "people", "$id": target.get("_id").unwrap().clone() }
    );
}

#[tokio::test]
async fn test_auto_ref_from_temporary_database() {
    let (_server, client) = fresh_client();
    let db = client.database("test");
    db.add_son_manipulator(AutoReference::new(&client.database("test")));
    db.add_son_manipulator(NamespaceInjector);

    let a = db.collection("a").save(doc! { "x": 1 }).await.unwrap();
    db.collection("b").save(doc! { "a": a.clone() }).await.unwrap();

    let found = db.collection("b").find_one(doc! {}).await.unwrap().unwrap();
    assert_eq!(found.get_document("a").unwrap(), &a);
}

#[tokio::test]
async fn test_authenticate() {
    let (_server, client) = fresh_client();
    let db = client.database("test");
    db.add_user("mike", "password", false).await.unwrap();
    assert!(user_names(&db).await.contains(&"mike".to_string()));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for _ in 0..100 {
        let tx = tx.clone();
        db.authenticate("mike", "password").with_callback(move |result| {
            let _ = tx.send(result);
        });
    }
    drop(tx);

    let mut completed = 0;
    while let Some(result) = rx.recv().await {
        assert!(result.unwrap());
        completed += 1;
    }
    assert_eq!(completed, 100);

    db.remove_user("mike").await.unwrap();
    assert!(!user_names(&db).await.contains(&"mike".to_string()));
    db.logout().await.unwrap();
}

async fn user_names(db: &Database) -> Vec<String> {
    db.collection("system")
        .child("users")
        .find(doc! {})
        .to_list(Some(10))
        .await
        .unwrap()
        .iter()
        .map(|user| user.get_str("user").unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_authenticate_failure() {
    let (_server, client) = fresh_client();
    let db = client.database("test");
    db.add_user("mike", "password", false).await.unwrap();

    let err = db.authenticate("mike", "wrong").await.unwrap_err();
    assert_eq!(err.code(), Some(AUTHENTICATION_FAILED));
    let err = db.authenticate("nobody", "password").await.unwrap_err();
    assert_eq!(err.code(), Some(AUTHENTICATION_FAILED));
}

#[tokio::test]
async fn test_authentication_gates_access() {
    let server = MemoryServer::new();
    server.set_require_auth(true);
    let client = client_for(&server, PoolConfig::default());
    let db = client.database("test");

    // No users yet, so anything goes
    db.add_user("mike", "password", false).await.unwrap();

    let err = db.collection_names().await.unwrap_err();
    assert_eq!(err.code(), Some(UNAUTHORIZED));

    assert!(db.authenticate("mike", "password").await.unwrap());
    // Credentials follow every pooled connection
    for _ in 0..5 {
        db.collection_names().await.unwrap();
    }

    db.logout().await.unwrap();
    let err = db.collection_names().await.unwrap_err();
    assert_eq!(err.code(), Some(UNAUTHORIZED));
}

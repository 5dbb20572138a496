//! Integration tests for async collections and cursors.

mod common;

use common::{check_optional_callback, fresh_client};
use futures::{FutureExt, StreamExt};
use tideway::bson::{doc, Bson};
use tideway::TidewayError;

#[tokio::test]
async fn test_save_and_find_one() {
    let (_server, client) = fresh_client();
    let people = client.database("test").collection("people");

    let saved = people.save(doc! { "name": "ada" }).await.unwrap();
    assert!(matches!(saved.get("_id"), Some(Bson::ObjectId(_))));
    assert_eq!(
        people.find_one(doc! { "name": "ada" }).await.unwrap(),
        Some(saved.clone())
    );

    let mut renamed = saved.clone();
    renamed.insert("name", "grace");
    people.save(renamed.clone()).await.unwrap();
    assert_eq!(people.count(doc! {}).await.unwrap(), 1);
    assert_eq!(people.find_one(doc! {}).await.unwrap(), Some(renamed));
}

#[tokio::test]
async fn test_insert_and_remove() {
    let (_server, client) = fresh_client();
    let things = client.database("test").collection("things");

    let id = things.insert(doc! { "_id": 1, "n": 1 }).await.unwrap();
    assert_eq!(id, Bson::Int32(1));
    let ids = things
        .insert_many(vec![doc! { "n": 2 }, doc! { "n": 3 }])
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);

    let err = things.insert(doc! { "_id": 1 }).await.unwrap_err();
    assert_eq!(err.code(), Some(11000));

    assert_eq!(things.remove(doc! { "n": { "$gte": 2 } }).await.unwrap(), 2);
    assert_eq!(things.remove(doc! {}).await.unwrap(), 1);
    assert_eq!(things.count(doc! {}).await.unwrap(), 0);
}

#[tokio::test]
async fn test_argument_errors_resolve_immediately() {
    let (server, client) = fresh_client();
    let things = client.database("test").collection("things");

    let op = things.insert_many(vec![]);
    assert!(op.now_or_never().unwrap().unwrap_err().is_argument_error());

    let op = things.update(doc! {}, doc! {}, false, false);
    assert!(op.now_or_never().unwrap().unwrap_err().is_argument_error());

    let op = things.create_index(doc! {}, false);
    assert!(op.now_or_never().unwrap().unwrap_err().is_argument_error());

    assert_eq!(server.connections_opened(), 0);
}

#[tokio::test]
async fn test_update() {
    let (_server, client) = fresh_client();
    let counters = client.database("test").collection("counters");
    counters
        .insert_many(vec![doc! { "_id": "a", "n": 1 }, doc! { "_id": "b", "n": 1 }])
        .await
        .unwrap();

    let n = counters
        .update(doc! {}, doc! { "$inc": { "n": 1 } }, false, true)
        .await
        .unwrap();
    assert_eq!(n, 2);

    let n = counters
        .update(doc! { "_id": "c" }, doc! { "$set": { "n": 10 } }, true, false)
        .await
        .unwrap();
    assert_eq!(n, 1);

    let c = counters.find_one(doc! { "_id": "c" }).await.unwrap().unwrap();
    assert_eq!(c, doc! { "_id": "c", "n": 10 });
    assert_eq!(counters.count(doc! { "n": 2 }).await.unwrap(), 2);
}

#[tokio::test]
async fn test_cursor_to_list_and_stream() {
    let (_server, client) = fresh_client();
    let numbers = client.database("test").collection("numbers");
    numbers
        .insert_many((0..25).map(|i| doc! { "_id": i, "even": i % 2 == 0 }).collect())
        .await
        .unwrap();

    let cursor = numbers.find(doc! { "even": true }).sort(doc! { "_id": -1 }).batch_size(4);
    let first = cursor.to_list(Some(3)).await.unwrap();
    let ids: Vec<i32> = first.iter().map(|d| d.get_i32("_id").unwrap()).collect();
    assert_eq!(ids, vec![24, 22, 20]);

    let rest: Vec<_> = cursor.clone().into_stream().collect().await;
    assert_eq!(rest.len(), 10);
    assert!(rest.iter().all(|r| r.is_ok()));
    assert!(!cursor.alive());
    assert_eq!(cursor.next().await.unwrap(), None);
}

#[tokio::test]
async fn test_cursor_close() {
    let (_server, client) = fresh_client();
    let numbers = client.database("test").collection("numbers");
    numbers
        .insert_many((0..5).map(|i| doc! { "_id": i }).collect())
        .await
        .unwrap();

    let cursor = numbers.find(doc! {}).skip(1).limit(3);
    assert_eq!(
        cursor.next().await.unwrap().unwrap().get_i32("_id").unwrap(),
        1
    );
    cursor.close().await.unwrap();
    assert!(!cursor.alive());
    assert!(cursor.to_list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_options_and_drop() {
    let (_server, client) = fresh_client();
    let db = client.database("test");
    let capped = db
        .create_collection("capped", doc! { "capped": true, "size": 1000, "max": 2 })
        .await
        .unwrap();
    check_optional_callback(|| capped.options(), true).await;

    for i in 0..3 {
        capped.insert(doc! { "_id": i }).await.unwrap();
    }
    assert_eq!(capped.count(doc! {}).await.unwrap(), 2);

    capped.drop().await.unwrap();
    assert!(db.collection_names().await.unwrap().is_empty());
    assert_eq!(capped.options().await.unwrap(), doc! {});
}

#[tokio::test]
async fn test_indexes() {
    let (_server, client) = fresh_client();
    let users = client.database("test").collection("users");

    let name = users.create_index(doc! { "email": 1 }, true).await.unwrap();
    assert_eq!(name, "email_1");

    users.insert(doc! { "email": "a@example.com" }).await.unwrap();
    let err = users.insert(doc! { "email": "a@example.com" }).await.unwrap_err();
    assert_eq!(err.code(), Some(11000));

    let info = users.index_information().await.unwrap();
    assert_eq!(info.keys().count(), 2);
    assert_eq!(
        info.get_document("email_1").unwrap().get_document("key").unwrap(),
        &doc! { "email": 1 }
    );

    users.drop_index("email_1").await.unwrap();
    let err = users.drop_index("email_1").await.unwrap_err();
    assert!(matches!(err, TidewayError::OperationFailure { code: Some(27), .. }));
}

#[tokio::test]
async fn test_child_collections() {
    let (_server, client) = fresh_client();
    let db = client.database("test");
    let users = db.collection("system").child("users");
    assert_eq!(users.name(), "system.users");
    assert_eq!(users.full_name(), "test.system.users");
    assert_eq!(users.database(), &db);
}

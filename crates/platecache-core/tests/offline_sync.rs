//! End-to-end offline scenarios against a file-backed store and a scripted network.

use std::sync::Arc;

use serde_json::json;

use platecache_core::api::{Method, MockTransport};
use platecache_core::cache::{CacheReader, ResourceKey, ALL_RESTAURANTS_KEY};
use platecache_core::models::NewReview;
use platecache_core::store::{Key, Store, RESTAURANTS};
use platecache_core::sync::{DrainOutcome, SyncEngine};
use platecache_core::{Config, Context, Directory};

fn open(dir: &std::path::Path, transport: Arc<MockTransport>) -> Context {
    let store = Store::open_dir(dir.to_path_buf()).unwrap();
    Context::new(store, transport, Config::default())
}

fn two_restaurants() -> serde_json::Value {
    json!([
        {"id": 1, "name": "Mission Chinese Food", "neighborhood": "Manhattan", "cuisine_type": "Asian", "is_favorite": false},
        {"id": 2, "name": "Emily", "neighborhood": "Brooklyn", "cuisine_type": "Pizza", "is_favorite": "false"}
    ])
}

#[tokio::test]
async fn test_collection_read_is_served_offline_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new());
    transport.respond(Method::Get, "/restaurants", 200, two_restaurants());

    let ctx = open(dir.path(), transport.clone());
    let reader = CacheReader::new(&ctx);
    let first = reader.read(ResourceKey::AllRestaurants).await.unwrap();
    assert_eq!(first.as_array().unwrap().len(), 2);
    let cached = ctx
        .store
        .get(RESTAURANTS, &Key::from(ALL_RESTAURANTS_KEY))
        .await
        .unwrap();
    assert!(cached.is_some());
    drop(reader);
    drop(ctx);

    // New process, no network
    let offline = Arc::new(MockTransport::new());
    offline.set_online(false);
    let ctx = open(dir.path(), offline.clone());
    let directory = Directory::new(&ctx);
    let restaurants = directory.restaurants().await.unwrap();
    assert_eq!(restaurants.len(), 2);
    assert_eq!(restaurants[1].name, "Emily");
    assert_eq!(offline.request_count(), 0);
}

#[tokio::test]
async fn test_review_queued_offline_is_delivered_once_online() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new());
    transport.set_online(false);

    let ctx = open(dir.path(), transport.clone());
    let directory = Directory::new(&ctx);
    directory
        .submit_review(NewReview {
            restaurant_id: 1,
            name: "Grace".to_string(),
            rating: 4,
            comments: "Lovely noodles".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(directory.queue().len().await.unwrap(), 1);

    // Still down: stays queued
    let report = directory.sync().await.unwrap();
    assert!(matches!(report.outcome, DrainOutcome::Blocked { .. }));
    assert_eq!(directory.queue().len().await.unwrap(), 1);
    drop(directory);
    drop(ctx);

    // Queue survives a restart and drains when the network is back
    transport.set_online(true);
    transport.respond(Method::Post, "/reviews", 201, json!({"id": 99}));
    transport.clear_requests();
    let ctx = open(dir.path(), transport.clone());
    let engine = SyncEngine::new(&ctx);
    let report = engine.drain_now().await.unwrap();
    assert_eq!(report.delivered.len(), 1);
    assert!(report.is_complete());
    assert!(engine.queue().is_empty().await.unwrap());

    let sent = transport.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, Method::Post);
    assert_eq!(sent[0].url, "/reviews");
    assert_eq!(sent[0].body.as_ref().unwrap()["comments"], json!("Lovely noodles"));
}

#[tokio::test]
async fn test_favorites_replay_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MockTransport::new());
    transport.respond(Method::Get, "/restaurants", 200, two_restaurants());
    let ctx = open(dir.path(), transport.clone());
    let directory = Directory::new(&ctx);
    directory.restaurants().await.unwrap();

    transport.set_online(false);
    directory.toggle_favorite(2, true).await.unwrap();
    directory.toggle_favorite(2, false).await.unwrap();
    directory.toggle_favorite(1, true).await.unwrap();

    let restaurants = directory.restaurants().await.unwrap();
    assert!(restaurants[0].is_favorite);
    assert!(!restaurants[1].is_favorite);

    transport.set_online(true);
    for url in [
        "/restaurants/2/?is_favorite=true",
        "/restaurants/2/?is_favorite=false",
        "/restaurants/1/?is_favorite=true",
    ] {
        transport.respond(Method::Put, url, 200, json!({}));
    }
    transport.clear_requests();

    let report = directory.sync().await.unwrap();
    assert_eq!(report.delivered.len(), 3);
    let urls: Vec<String> = transport.requests().into_iter().map(|r| r.url).collect();
    assert_eq!(
        urls,
        vec![
            "/restaurants/2/?is_favorite=true",
            "/restaurants/2/?is_favorite=false",
            "/restaurants/1/?is_favorite=true",
        ]
    );
}

#[tokio::test]
async fn test_background_worker_drains_after_mutation() {
    let transport = Arc::new(MockTransport::new());
    transport.respond(Method::Put, "/restaurants/3/?is_favorite=true", 200, json!({}));
    let ctx = Context::in_memory(transport.clone()).unwrap();
    let directory = Directory::with_worker(&ctx);

    let update = directory.toggle_favorite(3, true).await.unwrap();
    assert!(!update.cached);

    let mut drained = false;
    for _ in 0..200 {
        if directory.queue().is_empty().await.unwrap() {
            drained = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(drained);
    assert_eq!(transport.request_count(), 1);
    directory.shutdown().await;
}

use fixture_sync::pipeline::{
    ContentStore, HttpContentStore, InMemoryStore, StageTracker, StoreError, StoreProgressSink,
    SyncStage, UpsertOutcome, upsert_once,
};
use mockito::{Matcher, Server};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_fetch_by_natural_key_filters_and_authorizes() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/api/competitions")
        .match_query(Matcher::UrlEncoded(
            "filters[key][$eq]".into(),
            "u12-div-1".into(),
        ))
        .match_header("authorization", "Bearer secret")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":[{"id":3,"attributes":{"key":"u12-div-1","name":"U12 Div 1"}}]}"#)
        .expect(1)
        .create_async()
        .await;

    let store = HttpContentStore::new(&server.url(), Some("secret".into())).unwrap();
    let record = store
        .fetch_by_natural_key("competitions", "u12-div-1")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(record["id"], 3);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_fetch_missing_record_is_none() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/teams")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":[]}"#)
        .create_async()
        .await;

    let store = HttpContentStore::new(&server.url(), None).unwrap();
    assert!(store.fetch_by_natural_key("teams", "blues").await.unwrap().is_none());
}

#[tokio::test]
async fn test_upsert_posts_new_record_with_key_field() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/games")
        .match_query(Matcher::UrlEncoded("filters[gameId][$eq]".into(), "g-77".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":[]}"#)
        .create_async()
        .await;
    let post = server
        .mock("POST", "/api/games")
        .match_body(Matcher::PartialJson(json!({
            "data": {"gameId": "g-77", "round": 4}
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":{"id":12,"attributes":{"gameId":"g-77","round":4}}}"#)
        .expect(1)
        .create_async()
        .await;

    let store = HttpContentStore::new(&server.url(), None)
        .unwrap()
        .with_key_field("games", "gameId");
    let outcome = upsert_once(&store, "games", "g-77", json!({"round": 4}))
        .await
        .unwrap();

    assert_eq!(outcome, UpsertOutcome::Created);
    post.assert_async().await;
}

#[tokio::test]
async fn test_upsert_puts_existing_record() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/teams")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":[{"id":5,"attributes":{"key":"blues","name":"Blues"}}]}"#)
        .create_async()
        .await;
    let put = server
        .mock("PUT", "/api/teams/5")
        .match_body(Matcher::PartialJson(json!({"data": {"name": "Blues FC"}})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":{"id":5,"attributes":{"key":"blues","name":"Blues FC"}}}"#)
        .expect(1)
        .create_async()
        .await;

    let store = HttpContentStore::new(&server.url(), None).unwrap();
    let outcome = upsert_once(&store, "teams", "blues", json!({"name": "Blues FC"}))
        .await
        .unwrap();

    assert_eq!(outcome, UpsertOutcome::Updated);
    put.assert_async().await;
}

#[tokio::test]
async fn test_unchanged_record_is_not_written() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/teams")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":[{"id":5,"attributes":{"key":"blues","name":"Blues"}}]}"#)
        .create_async()
        .await;
    let put = server
        .mock("PUT", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let store = HttpContentStore::new(&server.url(), None).unwrap();
    let outcome = upsert_once(&store, "teams", "blues", json!({"name": "Blues"}))
        .await
        .unwrap();

    assert_eq!(outcome, UpsertOutcome::Unchanged);
    put.assert_async().await;
}

#[tokio::test]
async fn test_base_url_path_is_kept() {
    let mut server = Server::new_async().await;
    let lookup = server
        .mock("GET", "/cms/api/teams")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":[{"id":9,"attributes":{"key":"reds","name":"Reds"}}]}"#)
        .expect(3)
        .create_async()
        .await;
    let put = server
        .mock("PUT", "/cms/api/teams/9")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":{"id":9,"attributes":{"key":"reds","name":"Reds FC"}}}"#)
        .expect(1)
        .create_async()
        .await;

    let store = HttpContentStore::new(&format!("{}/cms", server.url()), None).unwrap();
    assert!(store.fetch_by_natural_key("teams", "reds").await.unwrap().is_some());

    // Trailing slash on the base resolves to the same endpoints
    let store = HttpContentStore::new(&format!("{}/cms/", server.url()), None).unwrap();
    let outcome = upsert_once(&store, "teams", "reds", json!({"name": "Reds FC"}))
        .await
        .unwrap();

    assert_eq!(outcome, UpsertOutcome::Updated);
    lookup.assert_async().await;
    put.assert_async().await;
}

#[test]
fn test_cannot_be_a_base_url_is_rejected() {
    assert!(matches!(
        HttpContentStore::new("mailto:cms@example.com", None),
        Err(StoreError::Url(_))
    ));
}

#[tokio::test]
async fn test_error_status_is_reported() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/teams")
        .match_query(Matcher::Any)
        .with_status(503)
        .with_body("maintenance")
        .create_async()
        .await;

    let store = HttpContentStore::new(&server.url(), None).unwrap();
    let err = store.fetch_by_natural_key("teams", "blues").await.unwrap_err();
    match err {
        StoreError::Status { status, body } => {
            assert_eq!(status, 503);
            assert_eq!(body, "maintenance");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_progress_is_persisted_after_each_change() {
    let store = Arc::new(InMemoryStore::new());
    let tracker = StageTracker::new(Arc::new(StoreProgressSink::new(store.clone())));
    let run_id = tracker.run_id().await.to_string();

    tracker.start_stage(SyncStage::Competitions).await.unwrap();
    let stored = store.get("sync-progress", &run_id).unwrap();
    assert_eq!(stored["currentStage"], "competitions");

    tracker.add_found(SyncStage::Competitions, 2).await.unwrap();
    tracker.complete_stage(SyncStage::Competitions).await.unwrap();
    tracker.finish().await;

    let stored = store.get("sync-progress", &run_id).unwrap();
    assert_eq!(stored["completedStages"], json!(["competitions"]));
    assert_eq!(stored["stages"][0]["itemsFound"], 2);
    assert!(stored["finishedAt"].is_string());
    assert_eq!(store.writes(), 4);
}

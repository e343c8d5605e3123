#![cfg(feature = "inmem-store")]

use std::sync::Arc;

use actix_web::test;
use rsd::identity::{Role, StubIdentity, User};
use rsd::repo::inmem::InMemRepo;
use rsd::repo::Repo;
use rsd::routes::AppState;
use serial_test::serial;

// Unique temp data dir per test so snapshots never leak between runs.
fn setup_env() {
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("RSD_DATA_DIR", tmp.path().to_str().unwrap());
}

fn user(username: &str) -> User {
    User {
        user_id: 2,
        username: username.into(),
        email: format!("{username}@example.com"),
        role: Role::User,
    }
}

fn state(repo: Arc<dyn Repo>, caller: User) -> AppState {
    AppState {
        repo,
        identity: Arc::new(StubIdentity::new(caller)),
    }
}

macro_rules! test_app {
    ($state:expr) => {
        actix_web::test::init_service(
            actix_web::App::new()
                .app_data(actix_web::web::Data::new($state))
                .app_data(
                    actix_web::web::JsonConfig::default()
                        .error_handler(rsd::error::json_error_handler),
                )
                .app_data(
                    actix_web::web::QueryConfig::default()
                        .error_handler(rsd::error::query_error_handler),
                )
                .app_data(
                    actix_web::web::PathConfig::default()
                        .error_handler(rsd::error::path_error_handler),
                )
                .configure(rsd::routes::config),
        )
        .await
    };
}

#[actix_web::test]
#[serial]
async fn end_to_end_challenge_conversation_post_flow() {
    setup_env();
    let repo: Arc<dyn Repo> = Arc::new(InMemRepo::new());
    let app = test_app!(state(repo, user("newbie_quantum")));

    // empty envelope
    let req = test::TestRequest::get().uri("/challenges").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(v["items"].as_array().unwrap().len(), 0);
    assert_eq!(v["total"], 0);
    assert_eq!(v["offset"], 0);
    assert_eq!(v["limit"], 20);

    // create challenge
    let req = test::TestRequest::post()
        .uri("/challenges")
        .set_json(&serde_json::json!({
            "challenge_id": "C1",
            "title": "T",
            "description": "D",
            "category": "basics",
            "difficulty": "Beginner"
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let challenge: serde_json::Value =
        serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let internal_id = challenge["id"].as_i64().unwrap();
    assert_eq!(challenge["points"], 0);

    // duplicate external id → clean 409
    let req = test::TestRequest::post()
        .uri("/challenges")
        .set_json(&serde_json::json!({
            "challenge_id": "C1",
            "title": "T2",
            "description": "D",
            "category": "basics",
            "difficulty": "Beginner"
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);

    // create conversation; creator comes from the identity, not the payload
    let req = test::TestRequest::post()
        .uri("/conversations")
        .set_json(&serde_json::json!({
            "identifier": "V1",
            "challenge_id": internal_id,
            "topic": "help",
            "category": "bug",
            "user": "spoofed"
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let conversation: serde_json::Value =
        serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let conversation_id = conversation["id"].as_i64().unwrap();
    assert_eq!(conversation["user"], "newbie_quantum");
    assert_eq!(conversation["status"], "OPEN");
    let created_at = conversation["created_at"].as_str().unwrap().to_string();

    // append a post
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let req = test::TestRequest::post()
        .uri(&format!("/conversations/{conversation_id}/posts"))
        .set_json(&serde_json::json!({"content": "first post"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let post: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(post["user"], "newbie_quantum");

    // read conversation back with posts; updated_at advanced past created_at
    let req = test::TestRequest::get()
        .uri(&format!("/conversations/{conversation_id}"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let detail: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let posts = detail["posts"].as_array().unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0]["content"], "first post");
    let created: chrono::DateTime<chrono::Utc> = created_at.parse().unwrap();
    let updated: chrono::DateTime<chrono::Utc> =
        detail["updated_at"].as_str().unwrap().parse().unwrap();
    assert!(updated > created);

    // conversations of the challenge
    let req = test::TestRequest::get()
        .uri("/challenges/C1/conversations")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let listed: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(listed["total"], 1);
    assert_eq!(listed["items"][0]["identifier"], "V1");

    // deleting the challenge is blocked while the conversation references it
    let req = test::TestRequest::delete().uri("/challenges/C1").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 409);

    // list posts envelope, ascending
    let req = test::TestRequest::get()
        .uri(&format!("/conversations/{conversation_id}/posts"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let posts: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(posts["total"], 1);
    assert_eq!(posts["items"][0]["content"], "first post");
}

#[actix_web::test]
#[serial]
async fn partial_patch_keeps_other_fields() {
    setup_env();
    let repo: Arc<dyn Repo> = Arc::new(InMemRepo::new());
    let app = test_app!(state(repo, user("newbie_quantum")));

    let req = test::TestRequest::post()
        .uri("/challenges")
        .set_json(&serde_json::json!({
            "challenge_id": "C1",
            "title": "T",
            "description": "D",
            "category": "basics",
            "difficulty": "Beginner",
            "points": 25,
            "tags": ["a", "b"]
        }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 201);

    let req = test::TestRequest::patch()
        .uri("/challenges/C1")
        .set_json(&serde_json::json!({"difficulty": "Advanced"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let req = test::TestRequest::get().uri("/challenges/C1").to_request();
    let resp = test::call_service(&app, req).await;
    let ch: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(ch["difficulty"], "Advanced");
    assert_eq!(ch["title"], "T");
    assert_eq!(ch["points"], 25);
    assert_eq!(ch["tags"], serde_json::json!(["a", "b"]));
}

#[actix_web::test]
#[serial]
async fn validation_and_not_found_statuses() {
    setup_env();
    let repo: Arc<dyn Repo> = Arc::new(InMemRepo::new());
    let app = test_app!(state(repo, user("newbie_quantum")));

    // unknown patch field → 422
    let req = test::TestRequest::patch()
        .uri("/challenges/C1")
        .set_json(&serde_json::json!({"no_such_field": 1}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 422);

    // invalid enum in payload → 422
    let req = test::TestRequest::post()
        .uri("/challenges")
        .set_json(&serde_json::json!({
            "challenge_id": "C1",
            "title": "T",
            "description": "D",
            "category": "basics",
            "difficulty": "Impossible"
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 422);

    // invalid enum in query → 422
    let req = test::TestRequest::get()
        .uri("/conversations?status=NOT_A_STATUS")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 422);

    // missing resources → 404 with a detail string
    for uri in [
        "/challenges/missing",
        "/conversations/999",
        "/conversations/999/posts",
        "/conversations/999/posts/1",
    ] {
        let req = test::TestRequest::get().uri(uri).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404, "{uri}");
        let body: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }
}

#[actix_web::test]
#[serial]
async fn list_limit_is_clamped() {
    setup_env();
    let repo: Arc<dyn Repo> = Arc::new(InMemRepo::new());
    let app = test_app!(state(repo, user("newbie_quantum")));

    let req = test::TestRequest::get()
        .uri("/challenges?limit=500&offset=-3")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(v["limit"], 100);
    assert_eq!(v["offset"], 0);
}

#[actix_web::test]
#[serial]
async fn current_user_and_health() {
    setup_env();
    let repo: Arc<dyn Repo> = Arc::new(InMemRepo::new());
    let app = test_app!(state(repo, user("newbie_quantum")));

    let req = test::TestRequest::get().uri("/user").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let me: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(me["username"], "newbie_quantum");
    assert_eq!(me["role"], "user");

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let health: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["database"], "connected");
}

#[actix_web::test]
#[serial]
async fn user_conversations_listing_uses_identity() {
    setup_env();
    let repo: Arc<dyn Repo> = Arc::new(InMemRepo::new());
    let alice_app = test_app!(state(repo.clone(), user("alice")));
    let bob_app = test_app!(state(repo.clone(), user("bob")));

    let req = test::TestRequest::post()
        .uri("/challenges")
        .set_json(&serde_json::json!({
            "challenge_id": "C1",
            "title": "T",
            "description": "D",
            "category": "basics",
            "difficulty": "Beginner"
        }))
        .to_request();
    let resp = test::call_service(&alice_app, req).await;
    let challenge: serde_json::Value =
        serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let internal_id = challenge["id"].as_i64().unwrap();

    for (app, identifier) in [(&alice_app, "V1"), (&bob_app, "V2")] {
        let req = test::TestRequest::post()
            .uri("/conversations")
            .set_json(&serde_json::json!({
                "identifier": identifier,
                "challenge_id": internal_id,
                "topic": "help",
                "category": "bug"
            }))
            .to_request();
        assert_eq!(test::call_service(app, req).await.status(), 201);
    }

    let req = test::TestRequest::get().uri("/conversations/user").to_request();
    let resp = test::call_service(&alice_app, req).await;
    let mine: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(mine["total"], 1);
    assert_eq!(mine["items"][0]["identifier"], "V1");
    assert_eq!(mine["items"][0]["user"], "alice");
}

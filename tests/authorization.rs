#![cfg(feature = "inmem-store")]

use std::sync::Arc;

use actix_web::test;
use rsd::identity::{Role, StubIdentity, User};
use rsd::repo::inmem::InMemRepo;
use rsd::repo::Repo;
use rsd::routes::AppState;
use serial_test::serial;

fn setup_env() {
    let tmp = tempfile::tempdir().unwrap();
    std::env::set_var("RSD_DATA_DIR", tmp.path().to_str().unwrap());
}

fn regular(username: &str) -> User {
    User {
        user_id: 2,
        username: username.into(),
        email: format!("{username}@example.com"),
        role: Role::User,
    }
}

fn support() -> User {
    User {
        user_id: 1,
        username: "support_sam".into(),
        email: "support_sam@example.com".into(),
        role: Role::Support,
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
                .configure(rsd::routes::config),
        )
        .await
    };
}

/// Creates a challenge plus one conversation through the given app,
/// yielding the conversation's internal id.
macro_rules! seed_conversation {
    ($app:expr) => {{
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
        let resp = test::call_service($app, req).await;
        assert_eq!(resp.status(), 201);
        let challenge: serde_json::Value =
            serde_json::from_slice(&test::read_body(resp).await).unwrap();

        let req = test::TestRequest::post()
            .uri("/conversations")
            .set_json(&serde_json::json!({
                "identifier": "V1",
                "challenge_id": challenge["id"].as_i64().unwrap(),
                "topic": "help",
                "category": "bug"
            }))
            .to_request();
        let resp = test::call_service($app, req).await;
        assert_eq!(resp.status(), 201);
        let conversation: serde_json::Value =
            serde_json::from_slice(&test::read_body(resp).await).unwrap();
        conversation["id"].as_i64().unwrap()
    }};
}

#[actix_web::test]
#[serial]
async fn only_support_may_patch_conversations() {
    setup_env();
    let repo: Arc<dyn Repo> = Arc::new(InMemRepo::new());
    let user_app = test_app!(state(repo.clone(), regular("alice")));
    let support_app = test_app!(state(repo.clone(), support()));

    let id = seed_conversation!(&user_app);

    // a regular user is refused
    let req = test::TestRequest::patch()
        .uri(&format!("/conversations/{id}"))
        .set_json(&serde_json::json!({"status": "RESOLVED"}))
        .to_request();
    let resp = test::call_service(&user_app, req).await;
    assert_eq!(resp.status(), 403);

    // and the conversation is unchanged
    let req = test::TestRequest::get()
        .uri(&format!("/conversations/{id}"))
        .to_request();
    let resp = test::call_service(&user_app, req).await;
    let detail: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(detail["status"], "OPEN");
    assert!(detail["assignee"].is_null());

    // support may set any enumerated status plus the assignee
    let req = test::TestRequest::patch()
        .uri(&format!("/conversations/{id}"))
        .set_json(&serde_json::json!({"status": "RESOLVED", "assignee": "support_sam"}))
        .to_request();
    let resp = test::call_service(&support_app, req).await;
    assert!(resp.status().is_success());
    let updated: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(updated["status"], "RESOLVED");
    assert_eq!(updated["assignee"], "support_sam");
}

#[actix_web::test]
#[serial]
async fn only_the_creator_may_delete_a_conversation() {
    setup_env();
    let repo: Arc<dyn Repo> = Arc::new(InMemRepo::new());
    let alice_app = test_app!(state(repo.clone(), regular("alice")));
    let bob_app = test_app!(state(repo.clone(), regular("bob")));

    let id = seed_conversation!(&alice_app);

    let req = test::TestRequest::delete()
        .uri(&format!("/conversations/{id}"))
        .to_request();
    let resp = test::call_service(&bob_app, req).await;
    assert_eq!(resp.status(), 403);

    // still there
    let req = test::TestRequest::get()
        .uri(&format!("/conversations/{id}"))
        .to_request();
    assert!(test::call_service(&alice_app, req).await.status().is_success());

    let req = test::TestRequest::delete()
        .uri(&format!("/conversations/{id}"))
        .to_request();
    let resp = test::call_service(&alice_app, req).await;
    assert_eq!(resp.status(), 204);

    let req = test::TestRequest::get()
        .uri(&format!("/conversations/{id}"))
        .to_request();
    assert_eq!(test::call_service(&alice_app, req).await.status(), 404);
}

#[actix_web::test]
#[serial]
async fn only_the_author_may_delete_a_post() {
    setup_env();
    let repo: Arc<dyn Repo> = Arc::new(InMemRepo::new());
    let alice_app = test_app!(state(repo.clone(), regular("alice")));
    let bob_app = test_app!(state(repo.clone(), regular("bob")));

    let id = seed_conversation!(&alice_app);

    let req = test::TestRequest::post()
        .uri(&format!("/conversations/{id}/posts"))
        .set_json(&serde_json::json!({"content": "mine"}))
        .to_request();
    let resp = test::call_service(&alice_app, req).await;
    assert_eq!(resp.status(), 201);
    let post: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let post_id = post["id"].as_i64().unwrap();

    let req = test::TestRequest::delete()
        .uri(&format!("/conversations/{id}/posts/{post_id}"))
        .to_request();
    let resp = test::call_service(&bob_app, req).await;
    assert_eq!(resp.status(), 403);

    // the post survives the refused delete
    let req = test::TestRequest::get()
        .uri(&format!("/conversations/{id}/posts/{post_id}"))
        .to_request();
    assert!(test::call_service(&alice_app, req).await.status().is_success());

    let req = test::TestRequest::delete()
        .uri(&format!("/conversations/{id}/posts/{post_id}"))
        .to_request();
    let resp = test::call_service(&alice_app, req).await;
    assert_eq!(resp.status(), 204);

    let req = test::TestRequest::get()
        .uri(&format!("/conversations/{id}/posts/{post_id}"))
        .to_request();
    assert_eq!(test::call_service(&alice_app, req).await.status(), 404);
}

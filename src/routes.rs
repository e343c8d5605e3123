use std::sync::Arc;

use actix_web::{web, HttpResponse};
use serde::Deserialize;

use crate::error::ApiError;
use crate::identity::{Identity, IdentityProvider, Role};
use crate::models::*;
use crate::repo::{Repo, RepoError};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/challenges")
            .service(
                web::resource("")
                    .route(web::get().to(list_challenges))
                    .route(web::post().to(create_challenge)),
            )
            .service(
                web::resource("/{challenge_id}/conversations")
                    .route(web::get().to(list_challenge_conversations)),
            )
            .service(
                web::resource("/{challenge_id}")
                    .route(web::get().to(read_challenge))
                    .route(web::patch().to(update_challenge))
                    .route(web::delete().to(delete_challenge)),
            ),
    )
    .service(
        web::scope("/conversations")
            .service(
                web::resource("")
                    .route(web::get().to(list_conversations))
                    .route(web::post().to(create_conversation)),
            )
            // registered before the {id} matcher
            .service(web::resource("/user").route(web::get().to(list_user_conversations)))
            .service(
                web::resource("/{id}/posts/{post_id}")
                    .route(web::get().to(read_post))
                    .route(web::delete().to(delete_post)),
            )
            .service(
                web::resource("/{id}/posts")
                    .route(web::get().to(list_posts))
                    .route(web::post().to(create_post)),
            )
            .service(
                web::resource("/{id}")
                    .route(web::get().to(read_conversation))
                    .route(web::patch().to(update_conversation))
                    .route(web::delete().to(delete_conversation)),
            ),
    )
    .service(web::resource("/user").route(web::get().to(current_user)))
    .route("/health", web::get().to(health));
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub identity: Arc<dyn IdentityProvider>,
}

// ---------------- Challenges ----------------

#[derive(Debug, Deserialize)]
pub struct ChallengeListQuery {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
    pub difficulty: Option<Difficulty>,
    pub category: Option<String>,
}

pub async fn list_challenges(
    data: web::Data<AppState>,
    query: web::Query<ChallengeListQuery>,
) -> Result<HttpResponse, ApiError> {
    let q = query.into_inner();
    let page = PageParams::new(q.offset, q.limit);
    let filter = ChallengeFilter {
        difficulty: q.difficulty,
        category: q.category,
    };
    let page = data.repo.list_challenges(filter, page).await?;
    Ok(HttpResponse::Ok().json(page))
}

pub async fn create_challenge(
    data: web::Data<AppState>,
    payload: web::Json<NewChallenge>,
) -> Result<HttpResponse, ApiError> {
    let challenge = data
        .repo
        .create_challenge(payload.into_inner())
        .await
        .map_err(|e| match e {
            RepoError::Conflict => ApiError::Conflict("Challenge id already exists".into()),
            other => other.into(),
        })?;
    Ok(HttpResponse::Created().json(challenge))
}

pub async fn read_challenge(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let challenge = data
        .repo
        .get_challenge(&path.into_inner())
        .await
        .map_err(|_| ApiError::NotFound("Challenge not found".into()))?;
    Ok(HttpResponse::Ok().json(challenge))
}

pub async fn update_challenge(
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateChallenge>,
) -> Result<HttpResponse, ApiError> {
    let challenge = data
        .repo
        .update_challenge(&path.into_inner(), payload.into_inner())
        .await
        .map_err(|e| match e {
            RepoError::NotFound => ApiError::NotFound("Challenge not found".into()),
            RepoError::Conflict => ApiError::Conflict("Challenge id already exists".into()),
            other => other.into(),
        })?;
    Ok(HttpResponse::Ok().json(challenge))
}

pub async fn delete_challenge(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    data.repo
        .delete_challenge(&path.into_inner())
        .await
        .map_err(|e| match e {
            RepoError::NotFound => ApiError::NotFound("Challenge not found".into()),
            RepoError::Conflict => {
                ApiError::Conflict("Challenge still has conversations".into())
            }
            other => other.into(),
        })?;
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn list_challenge_conversations(
    data: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, ApiError> {
    let challenge = data
        .repo
        .get_challenge(&path.into_inner())
        .await
        .map_err(|_| ApiError::NotFound("Challenge not found".into()))?;
    let page = PageParams::new(query.offset, query.limit);
    let page = data
        .repo
        .list_challenge_conversations(challenge.id, page)
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

// ---------------- Conversations ----------------

#[derive(Debug, Deserialize)]
pub struct ConversationListQuery {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
    pub status: Option<ConversationStatus>,
    pub category: Option<String>,
    /// External challenge id.
    pub challenge_id: Option<String>,
}

pub async fn list_conversations(
    data: web::Data<AppState>,
    query: web::Query<ConversationListQuery>,
) -> Result<HttpResponse, ApiError> {
    let q = query.into_inner();
    let page = PageParams::new(q.offset, q.limit);
    let filter = ConversationFilter {
        status: q.status,
        category: q.category,
        challenge_id: q.challenge_id,
    };
    let page = data.repo.list_conversations(filter, page).await?;
    Ok(HttpResponse::Ok().json(page))
}

pub async fn list_user_conversations(
    identity: Identity,
    data: web::Data<AppState>,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, ApiError> {
    let page = PageParams::new(query.offset, query.limit);
    let page = data
        .repo
        .list_user_conversations(&identity.0.username, page)
        .await?;
    Ok(HttpResponse::Ok().json(page))
}

pub async fn create_conversation(
    identity: Identity,
    data: web::Data<AppState>,
    payload: web::Json<NewConversation>,
) -> Result<HttpResponse, ApiError> {
    let conversation = data
        .repo
        .create_conversation(payload.into_inner(), &identity.0.username)
        .await
        .map_err(|e| match e {
            RepoError::NotFound => ApiError::NotFound("Challenge not found".into()),
            RepoError::Conflict => {
                ApiError::Conflict("Conversation identifier already exists".into())
            }
            other => other.into(),
        })?;
    Ok(HttpResponse::Created().json(conversation))
}

pub async fn read_conversation(
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let detail = data
        .repo
        .get_conversation(path.into_inner())
        .await
        .map_err(|_| ApiError::NotFound("Conversation not found".into()))?;
    Ok(HttpResponse::Ok().json(detail))
}

pub async fn update_conversation(
    identity: Identity,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<UpdateConversation>,
) -> Result<HttpResponse, ApiError> {
    if identity.0.role != Role::Support {
        return Err(ApiError::Forbidden(
            "User is not authorized to update this conversation".into(),
        ));
    }
    let conversation = data
        .repo
        .update_conversation(path.into_inner(), payload.into_inner())
        .await
        .map_err(|e| match e {
            RepoError::NotFound => ApiError::NotFound("Conversation not found".into()),
            other => other.into(),
        })?;
    Ok(HttpResponse::Ok().json(conversation))
}

pub async fn delete_conversation(
    identity: Identity,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let detail = data
        .repo
        .get_conversation(id)
        .await
        .map_err(|_| ApiError::NotFound("Conversation not found".into()))?;
    if identity.0.username != detail.conversation.user {
        return Err(ApiError::Forbidden(
            "User is not authorized to delete this conversation".into(),
        ));
    }
    data.repo.delete_conversation(id).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- Posts ----------------

pub async fn create_post(
    identity: Identity,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<NewPost>,
) -> Result<HttpResponse, ApiError> {
    let post = data
        .repo
        .create_post(path.into_inner(), payload.into_inner(), &identity.0.username)
        .await
        .map_err(|e| match e {
            RepoError::NotFound => ApiError::NotFound("Conversation not found".into()),
            other => other.into(),
        })?;
    Ok(HttpResponse::Created().json(post))
}

pub async fn list_posts(
    data: web::Data<AppState>,
    path: web::Path<Id>,
    query: web::Query<PageQuery>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    data.repo
        .get_conversation(id)
        .await
        .map_err(|_| ApiError::NotFound("Conversation not found".into()))?;
    let page = PageParams::new(query.offset, query.limit);
    let page = data.repo.list_posts(id, page).await?;
    Ok(HttpResponse::Ok().json(page))
}

pub async fn read_post(
    data: web::Data<AppState>,
    path: web::Path<(Id, Id)>,
) -> Result<HttpResponse, ApiError> {
    let (conversation_id, post_id) = path.into_inner();
    data.repo
        .get_conversation(conversation_id)
        .await
        .map_err(|_| ApiError::NotFound("Conversation not found".into()))?;
    let post = data
        .repo
        .get_post(conversation_id, post_id)
        .await
        .map_err(|_| ApiError::NotFound("Post not found".into()))?;
    Ok(HttpResponse::Ok().json(post))
}

pub async fn delete_post(
    identity: Identity,
    data: web::Data<AppState>,
    path: web::Path<(Id, Id)>,
) -> Result<HttpResponse, ApiError> {
    let (conversation_id, post_id) = path.into_inner();
    data.repo
        .get_conversation(conversation_id)
        .await
        .map_err(|_| ApiError::NotFound("Conversation not found".into()))?;
    let post = data
        .repo
        .get_post(conversation_id, post_id)
        .await
        .map_err(|_| ApiError::NotFound("Post not found".into()))?;
    if identity.0.username != post.user {
        return Err(ApiError::Forbidden(
            "User is not authorized to delete this post".into(),
        ));
    }
    data.repo.delete_post(conversation_id, post_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- User / health ----------------

pub async fn current_user(identity: Identity) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(identity.0))
}

pub async fn health(data: web::Data<AppState>) -> HttpResponse {
    match data.repo.ping().await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({
            "status": "healthy",
            "database": "connected",
        })),
        Err(e) => {
            log::error!("health check failed: {e}");
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "status": "unhealthy",
                "database": "disconnected",
                "error": e.to_string(),
            }))
        }
    }
}

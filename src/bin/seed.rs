//! Bulk import: loads challenges and conversations (with their posts) from
//! JSON files into the configured store.
//!
//! Usage: seed <challenges.json> [conversations.json]
//!
//! Conversations reference challenges by external id; the creating user is
//! the author of the conversation's first post.

use serde::Deserialize;
use tracing::{error, info, warn};

use rsd::models::{ConversationStatus, NewChallenge, NewConversation, NewPost};
use rsd::repo::{build_repo, ChallengeRepo, ConversationRepo, PostRepo, RepoError};

#[derive(Debug, Deserialize)]
struct SeedPost {
    user: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct SeedConversation {
    identifier: String,
    /// External challenge id.
    challenge_id: String,
    topic: String,
    category: String,
    #[serde(default)]
    status: ConversationStatus,
    #[serde(default)]
    assignee: Option<String>,
    #[serde(default)]
    posts: Vec<SeedPost>,
}

fn load_json<T: serde::de::DeserializeOwned>(path: &str) -> std::io::Result<T> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }
    tracing_subscriber::fmt().init();

    let mut args = std::env::args().skip(1);
    let challenges_path = match args.next() {
        Some(p) => p,
        None => {
            eprintln!("usage: seed <challenges.json> [conversations.json]");
            std::process::exit(2);
        }
    };
    let conversations_path = args.next();

    let repo = build_repo().await;

    let challenges: Vec<NewChallenge> = load_json(&challenges_path)?;
    let mut created = 0usize;
    for new in challenges {
        let ext = new.challenge_id.clone();
        match repo.create_challenge(new).await {
            Ok(_) => created += 1,
            Err(RepoError::Conflict) => warn!("challenge '{ext}' already exists, skipping"),
            Err(e) => {
                error!("failed to create challenge '{ext}': {e}");
                std::process::exit(1);
            }
        }
    }
    info!("imported {created} challenges");

    let Some(conversations_path) = conversations_path else {
        return Ok(());
    };

    let conversations: Vec<SeedConversation> = load_json(&conversations_path)?;
    let mut created = 0usize;
    for conv in conversations {
        let Some(first) = conv.posts.first() else {
            warn!("conversation '{}' has no posts, skipping", conv.identifier);
            continue;
        };
        let creator = first.user.clone();
        let challenge = match repo.get_challenge(&conv.challenge_id).await {
            Ok(c) => c,
            Err(_) => {
                warn!(
                    "conversation '{}' references unknown challenge '{}', skipping",
                    conv.identifier, conv.challenge_id
                );
                continue;
            }
        };
        let new = NewConversation {
            identifier: conv.identifier.clone(),
            challenge_id: challenge.id,
            topic: conv.topic,
            category: conv.category,
            status: conv.status,
            assignee: conv.assignee,
        };
        let db_conv = match repo.create_conversation(new, &creator).await {
            Ok(c) => c,
            Err(RepoError::Conflict) => {
                warn!("conversation '{}' already exists, skipping", conv.identifier);
                continue;
            }
            Err(e) => {
                error!("failed to create conversation '{}': {e}", conv.identifier);
                std::process::exit(1);
            }
        };
        for post in conv.posts {
            if let Err(e) = repo
                .create_post(
                    db_conv.id,
                    NewPost {
                        content: post.content,
                    },
                    &post.user,
                )
                .await
            {
                error!("failed to create post in '{}': {e}", conv.identifier);
                std::process::exit(1);
            }
        }
        created += 1;
    }
    info!("imported {created} conversations");

    Ok(())
}

use std::sync::Arc;

use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("store error: {0}")]
    Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

use async_trait::async_trait;

#[async_trait]
pub trait ChallengeRepo: Send + Sync {
    async fn list_challenges(
        &self,
        filter: ChallengeFilter,
        page: PageParams,
    ) -> RepoResult<Page<Challenge>>;
    async fn create_challenge(&self, new: NewChallenge) -> RepoResult<Challenge>;
    /// Lookup by external `challenge_id`.
    async fn get_challenge(&self, challenge_id: &str) -> RepoResult<Challenge>;
    async fn update_challenge(
        &self,
        challenge_id: &str,
        upd: UpdateChallenge,
    ) -> RepoResult<Challenge>;
    /// Fails with `Conflict` while conversations still reference the challenge.
    async fn delete_challenge(&self, challenge_id: &str) -> RepoResult<()>;
}

#[async_trait]
pub trait ConversationRepo: Send + Sync {
    async fn list_conversations(
        &self,
        filter: ConversationFilter,
        page: PageParams,
    ) -> RepoResult<Page<Conversation>>;
    /// Conversations of one challenge (internal id), newest first.
    async fn list_challenge_conversations(
        &self,
        challenge_id: Id,
        page: PageParams,
    ) -> RepoResult<Page<Conversation>>;
    async fn list_user_conversations(
        &self,
        username: &str,
        page: PageParams,
    ) -> RepoResult<Page<Conversation>>;
    async fn create_conversation(
        &self,
        new: NewConversation,
        username: &str,
    ) -> RepoResult<Conversation>;
    /// Fetch with all posts eagerly loaded, ordered by creation time.
    async fn get_conversation(&self, id: Id) -> RepoResult<ConversationDetail>;
    async fn update_conversation(
        &self,
        id: Id,
        upd: UpdateConversation,
    ) -> RepoResult<Conversation>;
    /// Cascades to all posts of the conversation.
    async fn delete_conversation(&self, id: Id) -> RepoResult<()>;
}

#[async_trait]
pub trait PostRepo: Send + Sync {
    /// Appends a post and bumps the parent conversation's `updated_at`.
    async fn create_post(
        &self,
        conversation_id: Id,
        new: NewPost,
        username: &str,
    ) -> RepoResult<Post>;
    async fn list_posts(&self, conversation_id: Id, page: PageParams) -> RepoResult<Page<Post>>;
    async fn get_post(&self, conversation_id: Id, post_id: Id) -> RepoResult<Post>;
    async fn delete_post(&self, conversation_id: Id, post_id: Id) -> RepoResult<()>;
}

#[async_trait]
pub trait StoreHealth: Send + Sync {
    /// Trivial round trip against the store, for the health endpoint.
    async fn ping(&self) -> RepoResult<()>;
}

pub trait Repo: ChallengeRepo + ConversationRepo + PostRepo + StoreHealth {}

impl<T> Repo for T where T: ChallengeRepo + ConversationRepo + PostRepo + StoreHealth {}

/// Builds the repository backend selected at compile time. Used by both the
/// server and the seed binary.
#[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
pub async fn build_repo() -> Arc<dyn Repo> {
    Arc::new(inmem::InMemRepo::new())
}

#[cfg(feature = "postgres-store")]
pub async fn build_repo() -> Arc<dyn Repo> {
    Arc::new(pg::PgRepo::from_env().await)
}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::RwLock;

    const SNAPSHOT_PATH: &str = "data/state.json";

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        challenges: HashMap<Id, Challenge>,
        conversations: HashMap<Id, Conversation>,
        posts: HashMap<Id, Post>,
        next_id: Id,
    }

    /// File-backed in-memory store for local development: full state is
    /// snapshotted to JSON after every mutation.
    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Arc<PathBuf>,
    }

    impl InMemRepo {
        fn snapshot_path() -> PathBuf {
            if let Ok(dir) = std::env::var("RSD_DATA_DIR") {
                let mut p = PathBuf::from(dir);
                p.push("state.json");
                p
            } else {
                PathBuf::from(SNAPSHOT_PATH)
            }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        tracing::info!("loaded snapshot '{}'", path.display());
                        s
                    }
                    Err(e) => {
                        tracing::warn!(
                            "failed to parse snapshot '{}': {e}; starting empty",
                            path.display()
                        );
                        State::default()
                    }
                },
                Err(_) => State::default(),
            }
        }

        fn persist(&self) {
            let path = self.snapshot_path.clone();
            if let Ok(s) = serde_json::to_vec_pretty(&*self.state.read().unwrap()) {
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                if let Err(e) = std::fs::write(&*path, s) {
                    tracing::warn!("failed to write snapshot '{}': {e}", path.display());
                }
            }
        }

        pub fn new() -> Self {
            let snapshot_path = Self::snapshot_path();
            let state = Self::load_state_from(&snapshot_path);
            Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Arc::new(snapshot_path),
            }
        }

        fn next_id(state: &mut State) -> Id {
            state.next_id += 1;
            state.next_id
        }

        fn paginate<T>(items: Vec<T>, page: PageParams) -> Page<T> {
            let total = items.len() as i64;
            let items = items
                .into_iter()
                .skip(page.offset.max(0) as usize)
                .take(page.limit.max(0) as usize)
                .collect();
            Page {
                items,
                total,
                offset: page.offset,
                limit: page.limit,
            }
        }
    }

    impl Default for InMemRepo {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ChallengeRepo for InMemRepo {
        async fn list_challenges(
            &self,
            filter: ChallengeFilter,
            page: PageParams,
        ) -> RepoResult<Page<Challenge>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .challenges
                .values()
                .filter(|c| filter.difficulty.map_or(true, |d| c.difficulty == d))
                .filter(|c| filter.category.as_deref().map_or(true, |cat| c.category == cat))
                .cloned()
                .collect();
            v.sort_by_key(|c| c.id);
            Ok(Self::paginate(v, page))
        }

        async fn create_challenge(&self, new: NewChallenge) -> RepoResult<Challenge> {
            let mut s = self.state.write().unwrap();
            if s.challenges.values().any(|c| c.challenge_id == new.challenge_id) {
                return Err(RepoError::Conflict);
            }
            let now = Utc::now();
            let id = Self::next_id(&mut s);
            let challenge = Challenge {
                id,
                challenge_id: new.challenge_id,
                title: new.title,
                description: new.description,
                category: new.category,
                difficulty: new.difficulty,
                points: new.points,
                tags: new.tags,
                learning_objectives: new.learning_objectives,
                hints: new.hints,
                created_at: now,
                updated_at: now,
            };
            s.challenges.insert(id, challenge.clone());
            drop(s);
            self.persist();
            Ok(challenge)
        }

        async fn get_challenge(&self, challenge_id: &str) -> RepoResult<Challenge> {
            let s = self.state.read().unwrap();
            s.challenges
                .values()
                .find(|c| c.challenge_id == challenge_id)
                .cloned()
                .ok_or(RepoError::NotFound)
        }

        async fn update_challenge(
            &self,
            challenge_id: &str,
            upd: UpdateChallenge,
        ) -> RepoResult<Challenge> {
            let mut s = self.state.write().unwrap();
            // uniqueness check before taking the mutable borrow
            if let Some(ref new_ext) = upd.challenge_id {
                if s.challenges
                    .values()
                    .any(|c| c.challenge_id == *new_ext && c.challenge_id != challenge_id)
                {
                    return Err(RepoError::Conflict);
                }
            }
            let challenge = s
                .challenges
                .values_mut()
                .find(|c| c.challenge_id == challenge_id)
                .ok_or(RepoError::NotFound)?;
            challenge.apply(upd);
            let updated = challenge.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }

        async fn delete_challenge(&self, challenge_id: &str) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            let id = s
                .challenges
                .values()
                .find(|c| c.challenge_id == challenge_id)
                .map(|c| c.id)
                .ok_or(RepoError::NotFound)?;
            if s.conversations.values().any(|v| v.challenge_id == id) {
                return Err(RepoError::Conflict);
            }
            s.challenges.remove(&id);
            drop(s);
            self.persist();
            Ok(())
        }
    }

    #[async_trait]
    impl ConversationRepo for InMemRepo {
        async fn list_conversations(
            &self,
            filter: ConversationFilter,
            page: PageParams,
        ) -> RepoResult<Page<Conversation>> {
            let s = self.state.read().unwrap();
            // external challenge id resolves through the owning challenge
            let challenge_internal = match filter.challenge_id.as_deref() {
                Some(ext) => Some(
                    s.challenges
                        .values()
                        .find(|c| c.challenge_id == ext)
                        .map(|c| c.id)
                        .unwrap_or(-1),
                ),
                None => None,
            };
            let mut v: Vec<_> = s
                .conversations
                .values()
                .filter(|c| filter.status.map_or(true, |st| c.status == st))
                .filter(|c| filter.category.as_deref().map_or(true, |cat| c.category == cat))
                .filter(|c| challenge_internal.map_or(true, |id| c.challenge_id == id))
                .cloned()
                .collect();
            v.sort_by_key(|c| c.id);
            Ok(Self::paginate(v, page))
        }

        async fn list_challenge_conversations(
            &self,
            challenge_id: Id,
            page: PageParams,
        ) -> RepoResult<Page<Conversation>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .conversations
                .values()
                .filter(|c| c.challenge_id == challenge_id)
                .cloned()
                .collect();
            // newest first
            v.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            Ok(Self::paginate(v, page))
        }

        async fn list_user_conversations(
            &self,
            username: &str,
            page: PageParams,
        ) -> RepoResult<Page<Conversation>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .conversations
                .values()
                .filter(|c| c.user == username)
                .cloned()
                .collect();
            v.sort_by_key(|c| c.id);
            Ok(Self::paginate(v, page))
        }

        async fn create_conversation(
            &self,
            new: NewConversation,
            username: &str,
        ) -> RepoResult<Conversation> {
            let mut s = self.state.write().unwrap();
            if !s.challenges.contains_key(&new.challenge_id) {
                return Err(RepoError::NotFound);
            }
            if s.conversations.values().any(|c| c.identifier == new.identifier) {
                return Err(RepoError::Conflict);
            }
            let now = Utc::now();
            let id = Self::next_id(&mut s);
            let conversation = Conversation {
                id,
                identifier: new.identifier,
                challenge_id: new.challenge_id,
                topic: new.topic,
                category: new.category,
                status: new.status,
                assignee: new.assignee,
                user: username.to_string(),
                created_at: now,
                updated_at: now,
            };
            s.conversations.insert(id, conversation.clone());
            drop(s);
            self.persist();
            Ok(conversation)
        }

        async fn get_conversation(&self, id: Id) -> RepoResult<ConversationDetail> {
            let s = self.state.read().unwrap();
            let conversation = s.conversations.get(&id).cloned().ok_or(RepoError::NotFound)?;
            let mut posts: Vec<_> = s
                .posts
                .values()
                .filter(|p| p.conversation_id == id)
                .cloned()
                .collect();
            posts.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
            Ok(ConversationDetail { conversation, posts })
        }

        async fn update_conversation(
            &self,
            id: Id,
            upd: UpdateConversation,
        ) -> RepoResult<Conversation> {
            let mut s = self.state.write().unwrap();
            let conversation = s.conversations.get_mut(&id).ok_or(RepoError::NotFound)?;
            conversation.apply(upd);
            let updated = conversation.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }

        async fn delete_conversation(&self, id: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            s.conversations.remove(&id).ok_or(RepoError::NotFound)?;
            s.posts.retain(|_, p| p.conversation_id != id);
            drop(s);
            self.persist();
            Ok(())
        }
    }

    #[async_trait]
    impl PostRepo for InMemRepo {
        async fn create_post(
            &self,
            conversation_id: Id,
            new: NewPost,
            username: &str,
        ) -> RepoResult<Post> {
            let mut s = self.state.write().unwrap();
            if !s.conversations.contains_key(&conversation_id) {
                return Err(RepoError::NotFound);
            }
            let now = Utc::now();
            let id = Self::next_id(&mut s);
            let post = Post {
                id,
                conversation_id,
                user: username.to_string(),
                content: new.content,
                timestamp: now,
            };
            s.posts.insert(id, post.clone());
            if let Some(c) = s.conversations.get_mut(&conversation_id) {
                c.updated_at = now;
            }
            drop(s);
            self.persist();
            Ok(post)
        }

        async fn list_posts(
            &self,
            conversation_id: Id,
            page: PageParams,
        ) -> RepoResult<Page<Post>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .posts
                .values()
                .filter(|p| p.conversation_id == conversation_id)
                .cloned()
                .collect();
            v.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
            Ok(Self::paginate(v, page))
        }

        async fn get_post(&self, conversation_id: Id, post_id: Id) -> RepoResult<Post> {
            let s = self.state.read().unwrap();
            s.posts
                .get(&post_id)
                .filter(|p| p.conversation_id == conversation_id)
                .cloned()
                .ok_or(RepoError::NotFound)
        }

        async fn delete_post(&self, conversation_id: Id, post_id: Id) -> RepoResult<()> {
            let mut s = self.state.write().unwrap();
            match s.posts.get(&post_id) {
                Some(p) if p.conversation_id == conversation_id => {}
                _ => return Err(RepoError::NotFound),
            }
            s.posts.remove(&post_id);
            drop(s);
            self.persist();
            Ok(())
        }
    }

    #[async_trait]
    impl StoreHealth for InMemRepo {
        async fn ping(&self) -> RepoResult<()> {
            // lock round trip stands in for a store query
            drop(self.state.read().unwrap());
            Ok(())
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use chrono::{DateTime, Utc};
    use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
    use sqlx::{ConnectOptions, Pool, Postgres};
    use std::str::FromStr;

    const SCHEMA: &[&str] = &[
        r#"CREATE TABLE IF NOT EXISTS challenges (
            id BIGSERIAL PRIMARY KEY,
            challenge_id TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            category TEXT NOT NULL,
            difficulty TEXT NOT NULL,
            points BIGINT NOT NULL DEFAULT 0,
            tags TEXT[] NOT NULL DEFAULT '{}',
            learning_objectives TEXT[] NOT NULL DEFAULT '{}',
            hints TEXT[] NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )"#,
        r#"CREATE TABLE IF NOT EXISTS conversations (
            id BIGSERIAL PRIMARY KEY,
            identifier TEXT NOT NULL UNIQUE,
            challenge_id BIGINT NOT NULL REFERENCES challenges(id) ON DELETE RESTRICT,
            topic TEXT NOT NULL,
            category TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'OPEN',
            assignee TEXT,
            username TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )"#,
        r#"CREATE TABLE IF NOT EXISTS posts (
            id BIGSERIAL PRIMARY KEY,
            conversation_id BIGINT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            username TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )"#,
    ];

    #[derive(sqlx::FromRow)]
    struct ChallengeRow {
        id: i64,
        challenge_id: String,
        title: String,
        description: String,
        category: String,
        difficulty: String,
        points: i64,
        tags: Vec<String>,
        learning_objectives: Vec<String>,
        hints: Vec<String>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    }

    impl TryFrom<ChallengeRow> for Challenge {
        type Error = RepoError;
        fn try_from(r: ChallengeRow) -> Result<Self, RepoError> {
            Ok(Challenge {
                id: r.id,
                challenge_id: r.challenge_id,
                title: r.title,
                description: r.description,
                category: r.category,
                difficulty: Difficulty::from_str(&r.difficulty)
                    .map_err(|e| RepoError::Internal(e.to_string()))?,
                points: r.points,
                tags: r.tags,
                learning_objectives: r.learning_objectives,
                hints: r.hints,
                created_at: r.created_at,
                updated_at: r.updated_at,
            })
        }
    }

    #[derive(sqlx::FromRow)]
    struct ConversationRow {
        id: i64,
        identifier: String,
        challenge_id: i64,
        topic: String,
        category: String,
        status: String,
        assignee: Option<String>,
        username: String,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    }

    impl TryFrom<ConversationRow> for Conversation {
        type Error = RepoError;
        fn try_from(r: ConversationRow) -> Result<Self, RepoError> {
            Ok(Conversation {
                id: r.id,
                identifier: r.identifier,
                challenge_id: r.challenge_id,
                topic: r.topic,
                category: r.category,
                status: ConversationStatus::from_str(&r.status)
                    .map_err(|e| RepoError::Internal(e.to_string()))?,
                assignee: r.assignee,
                user: r.username,
                created_at: r.created_at,
                updated_at: r.updated_at,
            })
        }
    }

    #[derive(sqlx::FromRow)]
    struct PostRow {
        id: i64,
        conversation_id: i64,
        username: String,
        content: String,
        created_at: DateTime<Utc>,
    }

    impl From<PostRow> for Post {
        fn from(r: PostRow) -> Self {
            Post {
                id: r.id,
                conversation_id: r.conversation_id,
                user: r.username,
                content: r.content,
                timestamp: r.created_at,
            }
        }
    }

    const CHALLENGE_COLS: &str = "id, challenge_id, title, description, category, difficulty, \
                                  points, tags, learning_objectives, hints, created_at, updated_at";
    const CONVERSATION_COLS: &str = "id, identifier, challenge_id, topic, category, status, \
                                     assignee, username, created_at, updated_at";
    const POST_COLS: &str = "id, conversation_id, username, content, created_at";

    fn map_err(e: sqlx::Error) -> RepoError {
        match &e {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                RepoError::Conflict
            }
            // foreign key violation: referenced row missing or still referenced
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23503") => {
                RepoError::Conflict
            }
            _ => RepoError::Internal(e.to_string()),
        }
    }

    #[derive(Clone)]
    pub struct PgRepo {
        pool: Pool<Postgres>,
    }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self {
            Self { pool }
        }

        /// Pool from DATABASE_URL or the discrete DB_* variables; SQL_ECHO=true
        /// echoes executed statements. Schema init failure is non-fatal — the
        /// health endpoint reports the store as unreachable.
        pub async fn from_env() -> Self {
            let url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
                let user = std::env::var("DB_USER").unwrap_or_else(|_| "postgres".into());
                let password = std::env::var("DB_PASSWORD").unwrap_or_else(|_| "postgres".into());
                let host = std::env::var("DB_HOST").unwrap_or_else(|_| "localhost".into());
                let port = std::env::var("DB_PORT").unwrap_or_else(|_| "5432".into());
                let name = std::env::var("DB_NAME").unwrap_or_else(|_| "rsd_support".into());
                format!("postgres://{user}:{password}@{host}:{port}/{name}")
            });
            let mut opts =
                PgConnectOptions::from_str(&url).expect("invalid database connection string");
            if std::env::var("SQL_ECHO").map(|v| v.eq_ignore_ascii_case("true")) == Ok(true) {
                opts = opts.log_statements(log::LevelFilter::Info);
            }
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect_lazy_with(opts);
            let repo = Self::new(pool);
            if let Err(e) = repo.init_schema().await {
                tracing::warn!("schema init failed: {e}");
            }
            repo
        }

        async fn init_schema(&self) -> Result<(), sqlx::Error> {
            for stmt in SCHEMA {
                sqlx::query(stmt).execute(&self.pool).await?;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ChallengeRepo for PgRepo {
        async fn list_challenges(
            &self,
            filter: ChallengeFilter,
            page: PageParams,
        ) -> RepoResult<Page<Challenge>> {
            let difficulty = filter.difficulty.map(|d| d.to_string());
            let total: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM challenges \
                 WHERE ($1::text IS NULL OR difficulty = $1) \
                   AND ($2::text IS NULL OR category = $2)",
            )
            .bind(difficulty.as_deref())
            .bind(filter.category.as_deref())
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
            let rows = sqlx::query_as::<_, ChallengeRow>(&format!(
                "SELECT {CHALLENGE_COLS} FROM challenges \
                 WHERE ($1::text IS NULL OR difficulty = $1) \
                   AND ($2::text IS NULL OR category = $2) \
                 ORDER BY id LIMIT $3 OFFSET $4"
            ))
            .bind(difficulty.as_deref())
            .bind(filter.category.as_deref())
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
            let items = rows
                .into_iter()
                .map(Challenge::try_from)
                .collect::<Result<_, _>>()?;
            Ok(Page {
                items,
                total,
                offset: page.offset,
                limit: page.limit,
            })
        }

        async fn create_challenge(&self, new: NewChallenge) -> RepoResult<Challenge> {
            let row = sqlx::query_as::<_, ChallengeRow>(&format!(
                "INSERT INTO challenges \
                 (challenge_id, title, description, category, difficulty, points, tags, learning_objectives, hints) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9) RETURNING {CHALLENGE_COLS}"
            ))
            .bind(&new.challenge_id)
            .bind(&new.title)
            .bind(&new.description)
            .bind(&new.category)
            .bind(new.difficulty.to_string())
            .bind(new.points)
            .bind(&new.tags)
            .bind(&new.learning_objectives)
            .bind(&new.hints)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
            row.try_into()
        }

        async fn get_challenge(&self, challenge_id: &str) -> RepoResult<Challenge> {
            let row = sqlx::query_as::<_, ChallengeRow>(&format!(
                "SELECT {CHALLENGE_COLS} FROM challenges WHERE challenge_id = $1"
            ))
            .bind(challenge_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .ok_or(RepoError::NotFound)?;
            row.try_into()
        }

        async fn update_challenge(
            &self,
            challenge_id: &str,
            upd: UpdateChallenge,
        ) -> RepoResult<Challenge> {
            let row = sqlx::query_as::<_, ChallengeRow>(&format!(
                "UPDATE challenges SET \
                   challenge_id = COALESCE($2, challenge_id), \
                   title = COALESCE($3, title), \
                   description = COALESCE($4, description), \
                   category = COALESCE($5, category), \
                   difficulty = COALESCE($6, difficulty), \
                   points = COALESCE($7, points), \
                   tags = COALESCE($8, tags), \
                   learning_objectives = COALESCE($9, learning_objectives), \
                   hints = COALESCE($10, hints), \
                   updated_at = now() \
                 WHERE challenge_id = $1 RETURNING {CHALLENGE_COLS}"
            ))
            .bind(challenge_id)
            .bind(upd.challenge_id.as_deref())
            .bind(upd.title.as_deref())
            .bind(upd.description.as_deref())
            .bind(upd.category.as_deref())
            .bind(upd.difficulty.map(|d| d.to_string()))
            .bind(upd.points)
            .bind(upd.tags.as_deref())
            .bind(upd.learning_objectives.as_deref())
            .bind(upd.hints.as_deref())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .ok_or(RepoError::NotFound)?;
            row.try_into()
        }

        async fn delete_challenge(&self, challenge_id: &str) -> RepoResult<()> {
            let mut tx = self.pool.begin().await.map_err(map_err)?;
            let id: i64 = sqlx::query_scalar("SELECT id FROM challenges WHERE challenge_id = $1")
                .bind(challenge_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_err)?
                .ok_or(RepoError::NotFound)?;
            let referenced: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM conversations WHERE challenge_id = $1")
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(map_err)?;
            if referenced > 0 {
                return Err(RepoError::Conflict);
            }
            sqlx::query("DELETE FROM challenges WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(map_err)?;
            tx.commit().await.map_err(map_err)?;
            Ok(())
        }
    }

    #[async_trait]
    impl ConversationRepo for PgRepo {
        async fn list_conversations(
            &self,
            filter: ConversationFilter,
            page: PageParams,
        ) -> RepoResult<Page<Conversation>> {
            let status = filter.status.map(|s| s.to_string());
            let predicate = "($1::text IS NULL OR v.status = $1) \
                 AND ($2::text IS NULL OR v.category = $2) \
                 AND ($3::text IS NULL OR EXISTS ( \
                     SELECT 1 FROM challenges c \
                     WHERE c.id = v.challenge_id AND c.challenge_id = $3))";
            let total: i64 = sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM conversations v WHERE {predicate}"
            ))
            .bind(status.as_deref())
            .bind(filter.category.as_deref())
            .bind(filter.challenge_id.as_deref())
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
            let rows = sqlx::query_as::<_, ConversationRow>(&format!(
                "SELECT v.* FROM conversations v WHERE {predicate} \
                 ORDER BY v.id LIMIT $4 OFFSET $5"
            ))
            .bind(status.as_deref())
            .bind(filter.category.as_deref())
            .bind(filter.challenge_id.as_deref())
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
            let items = rows
                .into_iter()
                .map(Conversation::try_from)
                .collect::<Result<_, _>>()?;
            Ok(Page {
                items,
                total,
                offset: page.offset,
                limit: page.limit,
            })
        }

        async fn list_challenge_conversations(
            &self,
            challenge_id: Id,
            page: PageParams,
        ) -> RepoResult<Page<Conversation>> {
            let total: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM conversations WHERE challenge_id = $1")
                    .bind(challenge_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(map_err)?;
            let rows = sqlx::query_as::<_, ConversationRow>(&format!(
                "SELECT {CONVERSATION_COLS} FROM conversations WHERE challenge_id = $1 \
                 ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
            ))
            .bind(challenge_id)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
            let items = rows
                .into_iter()
                .map(Conversation::try_from)
                .collect::<Result<_, _>>()?;
            Ok(Page {
                items,
                total,
                offset: page.offset,
                limit: page.limit,
            })
        }

        async fn list_user_conversations(
            &self,
            username: &str,
            page: PageParams,
        ) -> RepoResult<Page<Conversation>> {
            let total: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM conversations WHERE username = $1")
                    .bind(username)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(map_err)?;
            let rows = sqlx::query_as::<_, ConversationRow>(&format!(
                "SELECT {CONVERSATION_COLS} FROM conversations WHERE username = $1 \
                 ORDER BY id LIMIT $2 OFFSET $3"
            ))
            .bind(username)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
            let items = rows
                .into_iter()
                .map(Conversation::try_from)
                .collect::<Result<_, _>>()?;
            Ok(Page {
                items,
                total,
                offset: page.offset,
                limit: page.limit,
            })
        }

        async fn create_conversation(
            &self,
            new: NewConversation,
            username: &str,
        ) -> RepoResult<Conversation> {
            let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM challenges WHERE id = $1")
                .bind(new.challenge_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_err)?;
            if exists.is_none() {
                return Err(RepoError::NotFound);
            }
            let row = sqlx::query_as::<_, ConversationRow>(&format!(
                "INSERT INTO conversations \
                 (identifier, challenge_id, topic, category, status, assignee, username) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7) RETURNING {CONVERSATION_COLS}"
            ))
            .bind(&new.identifier)
            .bind(new.challenge_id)
            .bind(&new.topic)
            .bind(&new.category)
            .bind(new.status.to_string())
            .bind(new.assignee.as_deref())
            .bind(username)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
            row.try_into()
        }

        async fn get_conversation(&self, id: Id) -> RepoResult<ConversationDetail> {
            let row = sqlx::query_as::<_, ConversationRow>(&format!(
                "SELECT {CONVERSATION_COLS} FROM conversations WHERE id = $1"
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .ok_or(RepoError::NotFound)?;
            let posts = sqlx::query_as::<_, PostRow>(&format!(
                "SELECT {POST_COLS} FROM posts WHERE conversation_id = $1 \
                 ORDER BY created_at, id"
            ))
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
            Ok(ConversationDetail {
                conversation: row.try_into()?,
                posts: posts.into_iter().map(Post::from).collect(),
            })
        }

        async fn update_conversation(
            &self,
            id: Id,
            upd: UpdateConversation,
        ) -> RepoResult<Conversation> {
            let row = sqlx::query_as::<_, ConversationRow>(&format!(
                "UPDATE conversations SET \
                   assignee = COALESCE($2, assignee), \
                   status = COALESCE($3, status), \
                   updated_at = now() \
                 WHERE id = $1 RETURNING {CONVERSATION_COLS}"
            ))
            .bind(id)
            .bind(upd.assignee.as_deref())
            .bind(upd.status.map(|s| s.to_string()))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .ok_or(RepoError::NotFound)?;
            row.try_into()
        }

        async fn delete_conversation(&self, id: Id) -> RepoResult<()> {
            // posts cascade through the FK
            let res = sqlx::query("DELETE FROM conversations WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(map_err)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PostRepo for PgRepo {
        async fn create_post(
            &self,
            conversation_id: Id,
            new: NewPost,
            username: &str,
        ) -> RepoResult<Post> {
            let mut tx = self.pool.begin().await.map_err(map_err)?;
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT id FROM conversations WHERE id = $1")
                    .bind(conversation_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(map_err)?;
            if exists.is_none() {
                return Err(RepoError::NotFound);
            }
            let row = sqlx::query_as::<_, PostRow>(&format!(
                "INSERT INTO posts (conversation_id, username, content) \
                 VALUES ($1,$2,$3) RETURNING {POST_COLS}"
            ))
            .bind(conversation_id)
            .bind(username)
            .bind(&new.content)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_err)?;
            sqlx::query("UPDATE conversations SET updated_at = now() WHERE id = $1")
                .bind(conversation_id)
                .execute(&mut *tx)
                .await
                .map_err(map_err)?;
            tx.commit().await.map_err(map_err)?;
            Ok(row.into())
        }

        async fn list_posts(
            &self,
            conversation_id: Id,
            page: PageParams,
        ) -> RepoResult<Page<Post>> {
            let total: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM posts WHERE conversation_id = $1")
                    .bind(conversation_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(map_err)?;
            let rows = sqlx::query_as::<_, PostRow>(&format!(
                "SELECT {POST_COLS} FROM posts WHERE conversation_id = $1 \
                 ORDER BY created_at, id LIMIT $2 OFFSET $3"
            ))
            .bind(conversation_id)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
            Ok(Page {
                items: rows.into_iter().map(Post::from).collect(),
                total,
                offset: page.offset,
                limit: page.limit,
            })
        }

        async fn get_post(&self, conversation_id: Id, post_id: Id) -> RepoResult<Post> {
            let row = sqlx::query_as::<_, PostRow>(&format!(
                "SELECT {POST_COLS} FROM posts WHERE id = $1 AND conversation_id = $2"
            ))
            .bind(post_id)
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .ok_or(RepoError::NotFound)?;
            Ok(row.into())
        }

        async fn delete_post(&self, conversation_id: Id, post_id: Id) -> RepoResult<()> {
            let res = sqlx::query("DELETE FROM posts WHERE id = $1 AND conversation_id = $2")
                .bind(post_id)
                .bind(conversation_id)
                .execute(&self.pool)
                .await
                .map_err(map_err)?;
            if res.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl StoreHealth for PgRepo {
        async fn ping(&self) -> RepoResult<()> {
            sqlx::query_scalar::<_, i32>("SELECT 1")
                .fetch_one(&self.pool)
                .await
                .map_err(map_err)?;
            Ok(())
        }
    }
}

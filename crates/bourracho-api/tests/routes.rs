use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tower::ServiceExt;

use bourracho_api::{AppStateInner, router};
use bourracho_db::media::MediaStorage;
use bourracho_db::{EntityStore, MemoryStore};
use bourracho_gateway::Dispatcher;
use bourracho_sync::analysis::LocalAnalysisGenerator;
use bourracho_sync::{Engine, EngineConfig};
use bourracho_types::api::Claims;
use bourracho_types::models::{
    AnalysisState, Conversation, MediaAttachment, Membership, Message,
};

const SECRET: &str = "test-secret";

struct Harness {
    app: Router,
    media_dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    harness_with(Arc::new(MemoryStore::new())).await
}

async fn harness_with(store: Arc<dyn EntityStore>) -> Harness {
    let media_dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(
        store,
        Dispatcher::default(),
        Arc::new(LocalAnalysisGenerator),
        EngineConfig::default(),
    );
    let state = Arc::new(AppStateInner {
        engine: Arc::new(engine),
        media: MediaStorage::new(media_dir.path().to_path_buf()).await.unwrap(),
        jwt_secret: SECRET.into(),
    });
    Harness {
        app: router(state),
        media_dir,
    }
}

fn token(user: &str) -> String {
    let claims = Claims {
        sub: user.into(),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

impl Harness {
    async fn send(&self, method: Method, uri: &str, user: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token(user)));
        let body = match body {
            Some(v) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        self.call(req.body(body).unwrap()).await
    }

    async fn call(&self, req: Request<Body>) -> (StatusCode, Value) {
        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    /// Conversation owned by u1, joined by u2.
    async fn party(&self) -> String {
        let (status, conv) = self
            .send(Method::POST, "/chat", "u1", Some(json!({ "name": "Friday" })))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = conv["id"].as_str().unwrap().to_string();
        let (status, _) = self.send(Method::POST, &format!("/chat/{id}/join"), "u2", None).await;
        assert_eq!(status, StatusCode::CREATED);
        id
    }
}

#[tokio::test]
async fn missing_or_bad_token_is_unauthorized() {
    let h = harness().await;
    let req = Request::builder().uri("/chat").body(Body::empty()).unwrap();
    assert_eq!(h.call(req).await.0, StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .uri("/chat")
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .unwrap();
    assert_eq!(h.call(req).await.0, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_defaults_and_listing() {
    let h = harness().await;
    let (status, conv) = h.send(Method::POST, "/chat", "u1", Some(json!({}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(conv["name"], "Name me 😘");
    assert_eq!(conv["owner_id"], "u1");
    assert_eq!(conv["is_locked"], false);
    assert_eq!(conv["is_visible"], false);

    let (_, listed) = h.send(Method::GET, "/chat", "u1", None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    let (_, other) = h.send(Method::GET, "/chat", "u2", None).await;
    assert!(other.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_fields_are_rejected() {
    let h = harness().await;
    let (status, _) = h
        .send(Method::POST, "/chat", "u1", Some(json!({ "owner": "me" })))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn rejoin_returns_ok_not_created() {
    let h = harness().await;
    let id = h.party().await;
    let (status, body) = h.send(Method::POST, &format!("/chat/{id}/join"), "u2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["newly_joined"], false);
    assert_eq!(body["conversation"]["member_ids"], json!(["u1", "u2"]));
}

#[tokio::test]
async fn owner_only_patch_and_error_body() {
    let h = harness().await;
    let id = h.party().await;

    let (status, body) = h
        .send(Method::PATCH, &format!("/chat/{id}"), "u2", Some(json!({ "is_visible": true })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");
    assert!(body["error"].as_str().unwrap().contains("u2"));

    let (status, body) = h
        .send(
            Method::PATCH,
            &format!("/chat/{id}"),
            "u1",
            Some(json!({ "name": " Saturday ", "is_visible": true })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Saturday");
    assert_eq!(body["is_visible"], true);
}

#[tokio::test]
async fn message_react_vote_flow() {
    let h = harness().await;
    let id = h.party().await;

    let (status, msg) = h
        .send(Method::POST, &format!("/chat/{id}/messages"), "u1", Some(json!({ "content": "santé" })))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let mid = msg["id"].as_str().unwrap().to_string();

    let reacts = format!("/chat/{id}/messages/{mid}/reacts");
    let (_, m) = h.send(Method::POST, &reacts, "u2", Some(json!({ "emoji": "👍" }))).await;
    assert_eq!(m["reacts"], json!([{ "emoji": "👍", "issuer_id": "u2" }]));
    let (_, m) = h.send(Method::POST, &reacts, "u2", Some(json!({ "emoji": "👍" }))).await;
    assert_eq!(m["reacts"], json!([]));

    let vote = format!("/chat/{id}/messages/{mid}/vote");
    let (status, body) = h.send(Method::PUT, &vote, "u2", Some(json!({ "votee_id": "u1" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "not_locked");

    h.send(Method::PATCH, &format!("/chat/{id}"), "u1", Some(json!({ "is_locked": true })))
        .await;

    let (status, body) = h.send(Method::POST, &reacts, "u2", Some(json!({ "emoji": "😂" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "locked");

    h.send(Method::PUT, &vote, "u2", Some(json!({ "votee_id": "u1" }))).await;
    let (status, m) = h.send(Method::PUT, &vote, "u2", Some(json!({ "votee_id": "u2" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(m["votes"], json!({ "u2": "u2" }));

    let (status, body) = h.send(Method::PUT, &vote, "u2", Some(json!({ "votee_id": "ghost" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn snapshot_requires_membership() {
    let h = harness().await;
    let id = h.party().await;
    let (status, _) = h.send(Method::GET, &format!("/chat/{id}/snapshot"), "stranger", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, snap) = h.send(Method::GET, &format!("/chat/{id}/snapshot"), "u2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snap["memberships"].as_array().unwrap().len(), 2);
    assert_eq!(snap["messages"], json!([]));
}

#[tokio::test]
async fn membership_patch_is_self_only() {
    let h = harness().await;
    let id = h.party().await;
    let (status, _) = h
        .send(Method::PATCH, &format!("/chat/{id}/members/u2"), "u1", Some(json!({ "pseudo": "x" })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, m) = h
        .send(
            Method::PATCH,
            &format!("/chat/{id}/members/u2"),
            "u2",
            Some(json!({ "pseudo": "Bibi", "smiley": "🐸" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(m["pseudo"], "Bibi");

    let (_, m) = h
        .send(Method::PATCH, &format!("/chat/{id}/members/u2"), "u2", Some(json!({ "smiley": "" })))
        .await;
    assert_eq!(m["pseudo"], "Bibi");
    assert!(m["smiley"].is_null());
}

#[tokio::test]
async fn analysis_is_null_until_locked() {
    let h = harness().await;
    let id = h.party().await;
    let uri = format!("/chat/{id}/analysis");

    let (status, body) = h.send(Method::GET, &uri, "u1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_null());

    h.send(Method::PATCH, &format!("/chat/{id}"), "u1", Some(json!({ "is_locked": true })))
        .await;
    let mut last = Value::Null;
    for _ in 0..100 {
        let (_, body) = h.send(Method::GET, &uri, "u2", None).await;
        if body["status"] == "ready" {
            last = body;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(last["status"], "ready");
    assert!(last["analysis"]["per_user"]["u1"]["emoji"].is_string());
}

#[tokio::test]
async fn leave_transfers_ownership() {
    let h = harness().await;
    let id = h.party().await;
    let (status, conv) = h.send(Method::DELETE, &format!("/chat/{id}/leave"), "u1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(conv["owner_id"], "u2");
    assert_eq!(conv["member_ids"], json!(["u2"]));
}

#[tokio::test]
async fn media_upload_attach_and_download() {
    let h = harness().await;
    let id = h.party().await;
    let payload = b"\x89PNG fake image".to_vec();

    let upload = |user: &str, content_type: &str| {
        Request::builder()
            .method(Method::POST)
            .uri(format!("/chat/{id}/medias"))
            .header(header::AUTHORIZATION, format!("Bearer {}", token(user)))
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(payload.clone()))
            .unwrap()
    };

    let (status, body) = h.call(upload("u1", "application/pdf")).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "invalid");

    let (status, _) = h.call(upload("stranger", "image/png")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, media) = h.call(upload("u1", "image/png")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(media["kind"], "image");
    assert_eq!(media["size"], payload.len());
    let media_id = media["id"].as_str().unwrap().to_string();
    assert_eq!(media["url"], format!("/media/{media_id}"));

    let (status, msg) = h
        .send(
            Method::POST,
            &format!("/chat/{id}/messages"),
            "u1",
            Some(json!({ "media_ids": [media_id] })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(msg["medias"][0]["id"], media_id.as_str());

    let req = Request::builder()
        .uri(format!("/media/{media_id}"))
        .header(header::AUTHORIZATION, format!("Bearer {}", token("u2")))
        .body(Body::empty())
        .unwrap();
    let resp = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.as_ref(), payload.as_slice());

    let req = Request::builder()
        .uri(format!("/media/{media_id}"))
        .header(header::AUTHORIZATION, format!("Bearer {}", token("stranger")))
        .body(Body::empty())
        .unwrap();
    assert_eq!(h.call(req).await.0, StatusCode::FORBIDDEN);
}

/// Memory store that refuses to record media metadata.
struct NoMediaStore(MemoryStore);

impl EntityStore for NoMediaStore {
    fn insert_conversation(&self, c: &Conversation, owner: &Membership) -> anyhow::Result<()> {
        self.0.insert_conversation(c, owner)
    }
    fn get_conversation(&self, id: &str) -> anyhow::Result<Option<Conversation>> {
        self.0.get_conversation(id)
    }
    fn list_conversations_for_user(&self, user_id: &str) -> anyhow::Result<Vec<Conversation>> {
        self.0.list_conversations_for_user(user_id)
    }
    fn update_conversation(&self, c: &Conversation) -> anyhow::Result<()> {
        self.0.update_conversation(c)
    }
    fn update_conversation_and_analysis(
        &self,
        c: &Conversation,
        a: &AnalysisState,
    ) -> anyhow::Result<()> {
        self.0.update_conversation_and_analysis(c, a)
    }
    fn insert_membership(&self, m: &Membership) -> anyhow::Result<()> {
        self.0.insert_membership(m)
    }
    fn update_membership(&self, m: &Membership) -> anyhow::Result<()> {
        self.0.update_membership(m)
    }
    fn remove_member(&self, c: &Conversation, user_id: &str) -> anyhow::Result<()> {
        self.0.remove_member(c, user_id)
    }
    fn get_membership(&self, cid: &str, user_id: &str) -> anyhow::Result<Option<Membership>> {
        self.0.get_membership(cid, user_id)
    }
    fn list_memberships(&self, cid: &str) -> anyhow::Result<Vec<Membership>> {
        self.0.list_memberships(cid)
    }
    fn insert_message(&self, m: &Message) -> anyhow::Result<()> {
        self.0.insert_message(m)
    }
    fn get_message(&self, id: &str) -> anyhow::Result<Option<Message>> {
        self.0.get_message(id)
    }
    fn update_message(&self, m: &Message) -> anyhow::Result<()> {
        self.0.update_message(m)
    }
    fn list_messages(&self, cid: &str) -> anyhow::Result<Vec<Message>> {
        self.0.list_messages(cid)
    }
    fn insert_media(&self, _media: &MediaAttachment) -> anyhow::Result<()> {
        anyhow::bail!("disk full")
    }
    fn get_media(&self, id: &str) -> anyhow::Result<Option<MediaAttachment>> {
        self.0.get_media(id)
    }
    fn is_media_attached(&self, id: &str) -> anyhow::Result<bool> {
        self.0.is_media_attached(id)
    }
    fn save_analysis(&self, cid: &str, state: &AnalysisState) -> anyhow::Result<()> {
        self.0.save_analysis(cid, state)
    }
    fn get_analysis(&self, cid: &str) -> anyhow::Result<Option<AnalysisState>> {
        self.0.get_analysis(cid)
    }
    fn ping(&self) -> anyhow::Result<()> {
        self.0.ping()
    }
}

#[tokio::test]
async fn failed_media_record_leaves_no_blob() {
    let h = harness_with(Arc::new(NoMediaStore(MemoryStore::new()))).await;
    let id = h.party().await;

    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("/chat/{id}/medias"))
        .header(header::AUTHORIZATION, format!("Bearer {}", token("u1")))
        .header(header::CONTENT_TYPE, "image/png")
        .body(Body::from(vec![7u8; 64]))
        .unwrap();
    let (status, body) = h.call(req).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "storage");

    let leftovers = std::fs::read_dir(h.media_dir.path().join(&id))
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0, "orphaned blob left on disk");
}

use std::collections::BTreeMap;

use chrono::{Duration, Utc};

use bourracho_db::{Database, EntityStore, MemoryStore};
use bourracho_types::models::{
    Analysis, AnalysisState, Conversation, MediaAttachment, MediaKind, Membership, Message, React,
};

fn conversation(id: &str, owner: &str) -> (Conversation, Membership) {
    let now = Utc::now();
    let conversation = Conversation {
        id: id.to_string(),
        name: "Apéro".to_string(),
        owner_id: owner.to_string(),
        member_ids: vec![owner.to_string()],
        is_locked: false,
        is_visible: false,
        created_at: now,
    };
    (conversation, Membership::new(id, owner, now))
}

fn message(id: &str, conversation_id: &str, issuer: &str, offset_ms: i64) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        issuer_id: issuer.to_string(),
        content: format!("message {id}"),
        medias: vec![],
        reacts: vec![],
        votes: BTreeMap::new(),
        timestamp: Utc::now() + Duration::milliseconds(offset_ms),
    }
}

fn exercise_conversations(store: &dyn EntityStore) {
    let (conv, owner) = conversation("ABC123", "alice");
    store.insert_conversation(&conv, &owner).unwrap();

    store
        .insert_membership(&Membership::new("ABC123", "bob", Utc::now()))
        .unwrap();
    store
        .insert_membership(&Membership::new("ABC123", "carol", Utc::now()))
        .unwrap();
    assert!(
        store
            .insert_membership(&Membership::new("ABC123", "bob", Utc::now()))
            .is_err(),
        "duplicate membership must be refused"
    );

    let stored = store.get_conversation("ABC123").unwrap().unwrap();
    assert_eq!(stored.member_ids, vec!["alice", "bob", "carol"]);
    assert_eq!(stored.owner_id, "alice");

    let mut renamed = stored.clone();
    renamed.name = "After".into();
    renamed.is_locked = true;
    renamed.owner_id = "bob".into();
    store.update_conversation(&renamed).unwrap();
    let stored = store.get_conversation("ABC123").unwrap().unwrap();
    assert_eq!(stored.name, "After");
    assert!(stored.is_locked);
    assert_eq!(stored.owner_id, "bob");

    let mut handed_over = stored.clone();
    handed_over.owner_id = "carol".into();
    store.remove_member(&handed_over, "alice").unwrap();
    let stored = store.get_conversation("ABC123").unwrap().unwrap();
    assert_eq!(stored.member_ids, vec!["bob", "carol"]);
    assert_eq!(stored.owner_id, "carol");

    // Removing a non-member changes nothing, owner included.
    let mut bogus = stored.clone();
    bogus.owner_id = "bob".into();
    assert!(store.remove_member(&bogus, "alice").is_err());
    let stored = store.get_conversation("ABC123").unwrap().unwrap();
    assert_eq!(stored.owner_id, "carol");
    assert_eq!(stored.member_ids, vec!["bob", "carol"]);

    let mut carol = store.get_membership("ABC123", "carol").unwrap().unwrap();
    carol.pseudo = Some("Caro".into());
    carol.smiley = Some("🦊".into());
    store.update_membership(&carol).unwrap();
    let memberships = store.list_memberships("ABC123").unwrap();
    assert_eq!(memberships.len(), 2);
    assert_eq!(memberships[1].pseudo.as_deref(), Some("Caro"));

    assert_eq!(store.list_conversations_for_user("carol").unwrap().len(), 1);
    assert!(store.list_conversations_for_user("alice").unwrap().is_empty());
    assert!(store.get_conversation("NOPE00").unwrap().is_none());
}

fn exercise_messages(store: &dyn EntityStore) {
    let (conv, owner) = conversation("MSG001", "alice");
    store.insert_conversation(&conv, &owner).unwrap();

    let media = MediaAttachment {
        id: "media-1".into(),
        conversation_id: "MSG001".into(),
        issuer_id: "alice".into(),
        kind: MediaKind::Image,
        key: "MSG001/media-1.png".into(),
        size: 42,
        sha256: "00".repeat(32),
        url: "/media/media-1".into(),
        timestamp: Utc::now(),
    };
    store.insert_media(&media).unwrap();
    assert!(!store.is_media_attached("media-1").unwrap());

    let mut later = message("m2", "MSG001", "alice", 10);
    later.medias.push(media.clone());
    store.insert_message(&later).unwrap();
    store.insert_message(&message("m1", "MSG001", "alice", 0)).unwrap();
    assert!(store.is_media_attached("media-1").unwrap());
    assert_eq!(store.get_media("media-1").unwrap().unwrap(), media);

    let listed = store.list_messages("MSG001").unwrap();
    let ids: Vec<_> = listed.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2"]);
    assert_eq!(listed[1], later);

    let mut updated = later.clone();
    updated.reacts.push(React {
        emoji: "👍".into(),
        issuer_id: "alice".into(),
    });
    updated.votes.insert("alice".into(), "bob".into());
    updated.content = "ignored".into();
    store.update_message(&updated).unwrap();

    let stored = store.get_message("m2").unwrap().unwrap();
    assert_eq!(stored.reacts, updated.reacts);
    assert_eq!(stored.votes, updated.votes);
    assert_eq!(stored.content, later.content, "content is immutable");
    assert!(store.get_message("missing").unwrap().is_none());
}

fn exercise_analyses(store: &dyn EntityStore) {
    let (conv, owner) = conversation("ANA001", "alice");
    store.insert_conversation(&conv, &owner).unwrap();
    assert!(store.get_analysis("ANA001").unwrap().is_none());

    let mut locked = conv.clone();
    locked.is_locked = true;
    let pending = AnalysisState::Pending {
        requested_at: Utc::now(),
        previous: None,
    };
    store
        .update_conversation_and_analysis(&locked, &pending)
        .unwrap();
    assert!(store.get_conversation("ANA001").unwrap().unwrap().is_locked);
    assert_eq!(store.get_analysis("ANA001").unwrap(), Some(pending));

    let ready = AnalysisState::Ready {
        analysis: Analysis {
            summary: "Une belle soirée".into(),
            per_user: BTreeMap::new(),
        },
        generated_at: Utc::now(),
    };
    store.save_analysis("ANA001", &ready).unwrap();
    assert_eq!(store.get_analysis("ANA001").unwrap(), Some(ready.clone()));

    let AnalysisState::Ready { analysis, .. } = ready else {
        unreachable!()
    };
    let relock = AnalysisState::Pending {
        requested_at: Utc::now(),
        previous: Some(analysis),
    };
    store.save_analysis("ANA001", &relock).unwrap();
    assert_eq!(store.get_analysis("ANA001").unwrap(), Some(relock));
    store.ping().unwrap();
}

#[test]
fn sqlite_store_honours_contract() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(&dir.path().join("bourracho.db")).unwrap();
    exercise_conversations(&db);
    exercise_messages(&db);
    exercise_analyses(&db);
}

#[test]
fn memory_store_honours_contract() {
    let store = MemoryStore::new();
    exercise_conversations(&store);
    exercise_messages(&store);
    exercise_analyses(&store);
}

#[test]
fn sqlite_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bourracho.db");
    {
        let db = Database::open(&path).unwrap();
        let (conv, owner) = conversation("KEEP01", "alice");
        db.insert_conversation(&conv, &owner).unwrap();
    }
    let db = Database::open(&path).unwrap();
    assert_eq!(
        db.get_conversation("KEEP01").unwrap().unwrap().member_ids,
        vec!["alice"]
    );
}

//! End-of-night analysis generators.
//!
//! Invoked once per Unlocked -> Locked transition with the snapshot taken at
//! lock time. The result is stored and fetched separately; it never travels
//! through the event stream.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use bourracho_types::models::{Analysis, ConversationSnapshot, UserAnalysis};

#[async_trait]
pub trait AnalysisGenerator: Send + Sync {
    async fn generate(&self, snapshot: &ConversationSnapshot) -> Result<Analysis>;
}

/// Deterministic analysis from message, reaction and vote counts.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalAnalysisGenerator;

#[derive(Default)]
struct Tally {
    messages: usize,
    medias: usize,
    reacts_given: usize,
    reacts_received: usize,
    votes_received: usize,
}

#[async_trait]
impl AnalysisGenerator for LocalAnalysisGenerator {
    async fn generate(&self, snapshot: &ConversationSnapshot) -> Result<Analysis> {
        Ok(local_analysis(snapshot))
    }
}

fn local_analysis(snapshot: &ConversationSnapshot) -> Analysis {
    let mut tallies: HashMap<&str, Tally> = snapshot
        .conversation
        .member_ids
        .iter()
        .map(|id| (id.as_str(), Tally::default()))
        .collect();

    for message in &snapshot.messages {
        let issuer = tallies.entry(message.issuer_id.as_str()).or_default();
        issuer.messages += 1;
        issuer.medias += message.medias.len();
        issuer.reacts_received += message.reacts.len();
        for react in &message.reacts {
            tallies.entry(react.issuer_id.as_str()).or_default().reacts_given += 1;
        }
        for votee in message.votes.values() {
            tallies.entry(votee.as_str()).or_default().votes_received += 1;
        }
    }

    let display: HashMap<&str, &str> = snapshot
        .memberships
        .iter()
        .filter_map(|m| m.pseudo.as_deref().map(|p| (m.user_id.as_str(), p)))
        .collect();
    let name_of = |id: &str| display.get(id).copied().unwrap_or(id).to_string();

    // Ties go to the earliest member so the output is stable.
    let leader = |score: fn(&Tally) -> usize| {
        snapshot
            .conversation
            .member_ids
            .iter()
            .filter_map(|id| tallies.get(id.as_str()).map(|t| (id.as_str(), score(t))))
            .filter(|(_, s)| *s > 0)
            .fold(None, |best: Option<(&str, usize)>, (id, s)| match best {
                Some((_, top)) if top >= s => best,
                _ => Some((id, s)),
            })
            .map(|(id, _)| id)
    };
    let king = leader(|t| t.votes_received);
    let talker = leader(|t| t.messages);

    let mut per_user = BTreeMap::new();
    for id in &snapshot.conversation.member_ids {
        let Some(t) = tallies.get(id.as_str()) else {
            continue;
        };
        let emoji = if Some(id.as_str()) == king {
            "👑"
        } else if Some(id.as_str()) == talker {
            "🗣️"
        } else if t.medias > 0 {
            "📸"
        } else if t.messages == 0 {
            "👻"
        } else {
            "🍻"
        };
        let summary = format!(
            "{} posted {} message(s) and {} media, gave {} reaction(s), received {} reaction(s) and {} vote(s).",
            name_of(id),
            t.messages,
            t.medias,
            t.reacts_given,
            t.reacts_received,
            t.votes_received
        );
        per_user.insert(
            id.clone(),
            UserAnalysis {
                summary,
                emoji: emoji.to_string(),
            },
        );
    }

    let mut summary = format!(
        "{}: {} message(s) from {} member(s).",
        snapshot.conversation.name,
        snapshot.messages.len(),
        snapshot.conversation.member_ids.len()
    );
    if let Some(king) = king {
        summary.push_str(&format!(" {} was voted star of the night.", name_of(king)));
    }

    Analysis { summary, per_user }
}

/// Delegates to a remote service: POSTs the snapshot as JSON and expects an
/// [`Analysis`] back.
pub struct HttpAnalysisGenerator {
    http: Client,
    url: String,
}

impl HttpAnalysisGenerator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build analysis HTTP client")?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AnalysisGenerator for HttpAnalysisGenerator {
    async fn generate(&self, snapshot: &ConversationSnapshot) -> Result<Analysis> {
        debug!(
            "Requesting analysis for {} from {}",
            snapshot.conversation.id, self.url
        );
        let analysis = self
            .http
            .post(&self.url)
            .json(snapshot)
            .send()
            .await
            .context("analysis request failed")?
            .error_for_status()
            .context("analysis service returned an error")?
            .json::<Analysis>()
            .await
            .context("analysis response was not valid")?;
        Ok(analysis)
    }
}

use crate::feedback::Mode;
use crate::stratz::{FullMatch, PlayerSlot};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

const GIST_API: &str = "https://api.github.com/gists";
pub const STATE_FILE_NAME: &str = "state.json";

/// Cross-run state, persisted once at the end of every pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassState {
    /// Account id -> last fully published match id.
    #[serde(default)]
    pub last_posted: HashMap<String, i64>,
    /// Match id -> provisional message awaiting upgrade or expiry.
    #[serde(default)]
    pub pending: BTreeMap<String, PendingEntry>,
    /// Match id -> account id of provisional messages that expired. These
    /// matches are never announced again; an entry is dropped once the
    /// player's `lastPosted` or a newer expiry moves past it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub expired: BTreeMap<String, i64>,
}

impl PassState {
    pub fn last_posted_for(&self, account_id: i64) -> Option<i64> {
        self.last_posted.get(&account_id.to_string()).copied()
    }

    /// Records a published match. `lastPosted` only ever moves forward, so an
    /// upgrade of an older pending match never rewinds it.
    pub fn mark_posted(&mut self, account_id: i64, match_id: i64) {
        self.pending.remove(&match_id.to_string());
        let last = self
            .last_posted
            .entry(account_id.to_string())
            .or_insert(match_id);
        if match_id > *last {
            *last = match_id;
        }
        let last = *last;
        self.prune_expired(account_id, last);
    }

    /// Moves a pending match to the expired region.
    pub fn mark_expired(&mut self, account_id: i64, match_id: i64) {
        self.pending.remove(&match_id.to_string());
        self.prune_expired(account_id, match_id);
        self.expired.insert(match_id.to_string(), account_id);
    }

    pub fn is_expired(&self, match_id: i64) -> bool {
        self.expired.contains_key(&match_id.to_string())
    }

    fn prune_expired(&mut self, account_id: i64, up_to: i64) {
        self.expired.retain(|key, owner| {
            *owner != account_id || key.parse::<i64>().map_or(true, |id| id > up_to)
        });
    }

    /// Pending match ids, oldest post first.
    pub fn pending_in_order(&self) -> Vec<String> {
        let mut keys: Vec<(&String, i64)> = self
            .pending
            .iter()
            .map(|(k, e)| (k, e.posted_at))
            .collect();
        keys.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        keys.into_iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn from_json(text: &str) -> Self {
        match serde_json::from_str(text) {
            Ok(state) => state,
            Err(e) => {
                warn!("State document is corrupt, starting empty: {}", e);
                Self::default()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    pub player_account_id: i64,
    #[serde(default)]
    pub message_id: Option<String>,
    /// Epoch seconds of the provisional post.
    pub posted_at: i64,
    /// Destination the provisional message went to, without query string.
    pub webhook_base: String,
    pub snapshot: Snapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_after_sec: Option<i64>,
}

/// Enough of a match to redraw the provisional and expired forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub player_name: String,
    pub hero_name: String,
    #[serde(default)]
    pub hero_icon: Option<String>,
    pub match_id: i64,
    pub is_victory: bool,
    pub kills: i32,
    pub deaths: i32,
    pub assists: i32,
    pub duration_seconds: i64,
    pub mode: String,
    #[serde(default)]
    pub start_time: Option<i64>,
}

impl Snapshot {
    pub fn capture(player_name: &str, full: &FullMatch, slot: &PlayerSlot) -> Self {
        Self {
            player_name: player_name.to_string(),
            hero_name: slot.hero_name(),
            hero_icon: slot.hero.as_ref().and_then(|h| h.icon_url()),
            match_id: full.id,
            is_victory: slot.is_victory,
            kills: slot.kills,
            deaths: slot.deaths,
            assists: slot.assists,
            duration_seconds: full.duration_seconds,
            mode: Mode::of(full).label().to_string(),
            start_time: full.start_date_time,
        }
    }
}

/// Best-effort persistence: neither operation fails the pass.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> PassState;
    async fn save(&self, state: &PassState);
}

/// State kept as `state.json` inside a GitHub gist.
#[derive(Debug, Clone)]
pub struct GistStore {
    client: Client,
    gist_id: String,
    token: String,
}

impl GistStore {
    pub fn new(gist_id: String, token: String) -> Result<Self> {
        let user_agent = format!("dota_notifier/{}", env!("CARGO_PKG_VERSION"));
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .user_agent(user_agent)
            .build()
            .context("Failed to build gist HTTP client")?;
        Ok(Self {
            client,
            gist_id,
            token,
        })
    }

    fn url(&self) -> String {
        format!("{GIST_API}/{}", self.gist_id)
    }

    async fn fetch(&self) -> Result<PassState> {
        #[derive(Deserialize)]
        struct Gist {
            files: HashMap<String, GistFile>,
        }
        #[derive(Deserialize)]
        struct GistFile {
            content: Option<String>,
        }

        let res = self
            .client
            .get(self.url())
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .context("gist request failed")?;
        let status = res.status();
        let text = res.text().await.context("reading gist body failed")?;
        if !status.is_success() {
            return Err(anyhow!("gist GET returned {}: {}", status, text));
        }
        let gist: Gist = serde_json::from_str(&text).context("gist JSON parse failed")?;
        let content = gist
            .files
            .get(STATE_FILE_NAME)
            .and_then(|f| f.content.as_deref())
            .unwrap_or("");
        if content.trim().is_empty() {
            return Ok(PassState::default());
        }
        Ok(PassState::from_json(content))
    }

    async fn store(&self, state: &PassState) -> Result<()> {
        let content = serde_json::to_string_pretty(state).context("state serialize failed")?;
        let body = json!({ "files": { STATE_FILE_NAME: { "content": content } } });
        let res = self
            .client
            .patch(self.url())
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await
            .context("gist update failed")?;
        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(anyhow!("gist PATCH returned {}: {}", status, text));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for GistStore {
    async fn load(&self) -> PassState {
        match self.fetch().await {
            Ok(state) => {
                info!(
                    "Loaded state: {} posted, {} pending",
                    state.last_posted.len(),
                    state.pending.len()
                );
                state
            }
            Err(e) => {
                warn!("Failed to load state from gist, starting empty: {:#}", e);
                PassState::default()
            }
        }
    }

    async fn save(&self, state: &PassState) {
        match self.store(state).await {
            Ok(()) => info!("State saved to gist"),
            Err(e) => warn!("Failed to save state to gist: {:#}", e),
        }
    }
}

/// Local fallback used when no gist is configured.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn load(&self) -> PassState {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => PassState::from_json(&text),
            Err(e) => {
                warn!("No state at {:?} ({}), starting empty", self.path, e);
                PassState::default()
            }
        }
    }

    async fn save(&self, state: &PassState) {
        let text = match serde_json::to_string_pretty(state) {
            Ok(t) => t,
            Err(e) => {
                warn!("Failed to serialize state: {}", e);
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&self.path, text).await {
            warn!("Failed to write state to {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(match_id: i64) -> Snapshot {
        Snapshot {
            player_name: "Alice".to_string(),
            hero_name: "Lina".to_string(),
            hero_icon: None,
            match_id,
            is_victory: true,
            kills: 1,
            deaths: 2,
            assists: 3,
            duration_seconds: 1500,
            mode: "Turbo".to_string(),
            start_time: None,
        }
    }

    fn entry(match_id: i64, posted_at: i64) -> PendingEntry {
        PendingEntry {
            player_account_id: 1,
            message_id: Some(format!("msg-{match_id}")),
            posted_at,
            webhook_base: "https://discord.example/api/webhooks/1/abc".to_string(),
            snapshot: snapshot(match_id),
            expires_after_sec: None,
        }
    }

    #[test]
    fn serializes_with_camel_case_regions() {
        let mut state = PassState::default();
        state.last_posted.insert("1".to_string(), 100);
        state.pending.insert("101".to_string(), entry(101, 5));
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["lastPosted"]["1"], 100);
        assert_eq!(value["pending"]["101"]["messageId"], "msg-101");
        assert_eq!(value["pending"]["101"]["playerAccountId"], 1);
        assert!(value["pending"]["101"].get("expiresAfterSec").is_none());

        let back: PassState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn corrupt_or_partial_documents_load_as_empty_regions() {
        assert_eq!(PassState::from_json("not json"), PassState::default());
        let partial = PassState::from_json(r#"{"lastPosted":{"7":42}}"#);
        assert_eq!(partial.last_posted_for(7), Some(42));
        assert!(partial.pending.is_empty());
    }

    #[test]
    fn mark_posted_clears_pending_for_that_match() {
        let mut state = PassState::default();
        state.pending.insert("101".to_string(), entry(101, 5));
        state.mark_posted(1, 101);
        assert_eq!(state.last_posted_for(1), Some(101));
        assert!(state.pending.is_empty());
    }

    #[test]
    fn mark_posted_never_rewinds_last_posted() {
        let mut state = PassState::default();
        state.last_posted.insert("1".to_string(), 102);
        state.pending.insert("101".to_string(), entry(101, 5));
        state.mark_posted(1, 101);
        assert_eq!(state.last_posted_for(1), Some(102));
        assert!(state.pending.is_empty());

        state.mark_posted(1, 103);
        assert_eq!(state.last_posted_for(1), Some(103));
    }

    #[test]
    fn expired_matches_are_remembered_until_superseded() {
        let mut state = PassState::default();
        state.pending.insert("101".to_string(), entry(101, 5));
        state.mark_expired(1, 101);
        assert!(state.pending.is_empty());
        assert!(state.is_expired(101));

        // Another player's expiry does not touch player 1's record.
        state.mark_expired(2, 150);
        state.mark_expired(1, 120);
        assert!(!state.is_expired(101));
        assert!(state.is_expired(120));
        assert!(state.is_expired(150));

        state.mark_posted(1, 130);
        assert!(!state.is_expired(120));
        assert!(state.is_expired(150));

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["expired"]["150"], 2);
        assert_eq!(PassState::from_json(&value.to_string()), state);
    }

    #[test]
    fn pending_order_follows_post_time() {
        let mut state = PassState::default();
        state.pending.insert("900".to_string(), entry(900, 10));
        state.pending.insert("300".to_string(), entry(300, 30));
        state.pending.insert("500".to_string(), entry(500, 10));
        assert_eq!(state.pending_in_order(), vec!["500", "900", "300"]);
    }

    #[tokio::test]
    async fn file_store_round_trips_and_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("state.json"));
        assert_eq!(store.load().await, PassState::default());

        let mut state = PassState::default();
        state.pending.insert("101".to_string(), entry(101, 5));
        store.save(&state).await;
        assert_eq!(store.load().await, state);
    }
}

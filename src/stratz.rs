use crate::rate_limit::Limiters;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const STRATZ_ENDPOINT: &str = "https://api.stratz.com/graphql";

/// What the feed found for one lookup.
#[derive(Debug, Clone)]
pub enum Feed {
    /// Nothing newer than what was last posted, or the lookup failed transiently.
    Nothing,
    Match(Box<FullMatch>),
    /// The provider reported quota exhaustion. The pass must stop.
    QuotaExceeded,
}

#[async_trait]
pub trait MatchFeed: Send + Sync {
    /// Newest match of `account_id` if it differs from `last_posted`.
    async fn newest_match(&self, account_id: i64, last_posted: Option<i64>) -> Feed;
    /// Re-fetches a known match.
    async fn full_match(&self, match_id: i64) -> Feed;
}

/// Missing keys and explicit `null`s both read as the type's default. The
/// provider sends `null` counters for matches it has not finished parsing.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Per-minute series with `null` gaps dropped.
fn series<'de, D>(deserializer: D) -> std::result::Result<Vec<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<Option<i32>>> = Option::deserialize(deserializer)?;
    Ok(raw.unwrap_or_default().into_iter().flatten().collect())
}

fn count<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<IgnoredAny>> = Option::deserialize(deserializer)?;
    Ok(raw.map_or(0, |v| v.len()))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullMatch {
    pub id: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub duration_seconds: i64,
    pub start_date_time: Option<i64>,
    pub game_mode: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub players: Vec<PlayerSlot>,
}

impl FullMatch {
    pub fn slot_for(&self, account_id: i64) -> Option<&PlayerSlot> {
        self.players
            .iter()
            .find(|p| p.steam_account_id == Some(account_id))
    }

    pub fn is_turbo(&self) -> bool {
        self.game_mode
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case("TURBO"))
    }

    pub fn duration_minutes(&self) -> f64 {
        (self.duration_seconds.max(0) as f64) / 60.0
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSlot {
    pub steam_account_id: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_victory: bool,
    pub lane: Option<String>,
    pub role: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub kills: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub deaths: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub assists: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub level: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub gold_per_minute: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub experience_per_minute: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub networth: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub hero_damage: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tower_damage: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub hero_healing: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub num_last_hits: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub num_denies: i32,
    /// Headline impact score. Absent until the provider finishes its analysis.
    pub imp: Option<i32>,
    pub hero: Option<Hero>,
    pub stats: Option<PlayerStats>,
}

impl PlayerSlot {
    pub fn kda_ratio(&self) -> f64 {
        (self.kills + self.assists) as f64 / self.deaths.max(1) as f64
    }

    pub fn hero_name(&self) -> String {
        self.hero
            .as_ref()
            .and_then(|h| h.display_name.clone())
            .unwrap_or_else(|| "Unknown hero".to_string())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hero {
    pub display_name: Option<String>,
    pub short_name: Option<String>,
}

impl Hero {
    pub fn icon_url(&self) -> Option<String> {
        self.short_name.as_ref().map(|s| {
            format!("https://cdn.stratz.com/images/dota2/heroes/{s}_icon.png")
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStats {
    #[serde(default, deserialize_with = "series")]
    pub imp_per_minute: Vec<i32>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub wards: Vec<WardEvent>,
    /// Rune pickups; only the count is used.
    #[serde(default, deserialize_with = "count")]
    pub runes: usize,
}

impl PlayerStats {
    /// `(observer, sentry)` wards placed.
    pub fn ward_counts(&self) -> (usize, usize) {
        self.wards.iter().fold((0, 0), |(obs, sen), w| match w.ward_type {
            Some(OBSERVER_WARD) => (obs + 1, sen),
            Some(SENTRY_WARD) => (obs, sen + 1),
            _ => (obs, sen),
        })
    }
}

const OBSERVER_WARD: i32 = 0;
const SENTRY_WARD: i32 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WardEvent {
    #[serde(rename = "type")]
    pub ward_type: Option<i32>,
}

/// How a non-success upstream response should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpstreamFailure {
    Quota,
    Transient,
}

pub(crate) fn classify_failure(status: StatusCode, body: &str) -> UpstreamFailure {
    if status == StatusCode::TOO_MANY_REQUESTS || body.to_ascii_lowercase().contains("quota") {
        UpstreamFailure::Quota
    } else {
        UpstreamFailure::Transient
    }
}

enum Query<T> {
    Data(T),
    Failed,
    Quota,
}

#[derive(Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Clone)]
pub struct StratzClient {
    client: Client,
    token: String,
    limiters: Arc<Limiters>,
}

impl StratzClient {
    pub fn new(token: String, limiters: Arc<Limiters>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .user_agent("STRATZ_API")
            .build()
            .context("Failed to build STRATZ HTTP client")?;
        Ok(Self {
            client,
            token,
            limiters,
        })
    }

    async fn query<T: for<'de> Deserialize<'de>>(
        &self,
        what: &str,
        query: &str,
        variables: serde_json::Value,
    ) -> Query<T> {
        self.limiters.upstream.acquire().await;

        let body = json!({ "query": query, "variables": variables });
        let res = match self
            .client
            .post(STRATZ_ENDPOINT)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
        {
            Ok(res) => res,
            Err(e) => {
                warn!("STRATZ {} request failed: {}", what, e);
                return Query::Failed;
            }
        };

        let status = res.status();
        let text = match res.text().await {
            Ok(t) => t,
            Err(e) => {
                warn!("Failed to read STRATZ {} body: {}", what, e);
                return Query::Failed;
            }
        };
        if status != StatusCode::OK {
            return match classify_failure(status, &text) {
                UpstreamFailure::Quota => {
                    warn!("STRATZ quota exhausted during {} (status {})", what, status);
                    Query::Quota
                }
                UpstreamFailure::Transient => {
                    warn!("STRATZ {} HTTP error (status {}): {}", what, status, text);
                    Query::Failed
                }
            };
        }

        let parsed: GraphQlResponse<T> = match serde_json::from_str(&text) {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to parse STRATZ {} JSON: {}", what, e);
                return Query::Failed;
            }
        };
        if let Some(errors) = parsed.errors.filter(|e| !e.is_empty()) {
            let msg = errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            warn!("STRATZ {} GraphQL error: {}", what, msg);
            return Query::Failed;
        }
        match parsed.data {
            Some(data) => Query::Data(data),
            None => Query::Failed,
        }
    }

    async fn latest_match_id(&self, account_id: i64) -> Query<Option<i64>> {
        #[derive(Deserialize)]
        struct Data {
            player: Option<Player>,
        }
        #[derive(Deserialize)]
        struct Player {
            matches: Option<Vec<MatchId>>,
        }
        #[derive(Deserialize)]
        struct MatchId {
            id: i64,
        }

        let query = r#"
query ($id: Long!) {
  player(steamAccountId: $id) {
    matches(request: { take: 1 }) { id }
  }
}
"#;
        match self
            .query::<Data>("latest match", query, json!({ "id": account_id }))
            .await
        {
            Query::Data(d) => Query::Data(
                d.player
                    .and_then(|p| p.matches)
                    .and_then(|m| m.first().map(|m| m.id)),
            ),
            Query::Failed => Query::Failed,
            Query::Quota => Query::Quota,
        }
    }
}

const FULL_MATCH_QUERY: &str = r#"
query ($id: Long!) {
  match(id: $id) {
    id durationSeconds startDateTime gameMode
    players {
      steamAccountId isVictory lane role
      kills deaths assists level goldPerMinute experiencePerMinute networth
      heroDamage towerDamage heroHealing numLastHits numDenies imp
      hero { displayName shortName }
      stats {
        impPerMinute
        wards { type }
        runes { time }
      }
    }
  }
}
"#;

#[async_trait]
impl MatchFeed for StratzClient {
    async fn newest_match(&self, account_id: i64, last_posted: Option<i64>) -> Feed {
        let latest = match self.latest_match_id(account_id).await {
            Query::Data(Some(id)) => id,
            Query::Data(None) | Query::Failed => return Feed::Nothing,
            Query::Quota => return Feed::QuotaExceeded,
        };
        if Some(latest) == last_posted {
            debug!("No new match for {} (latest {})", account_id, latest);
            return Feed::Nothing;
        }
        self.full_match(latest).await
    }

    async fn full_match(&self, match_id: i64) -> Feed {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "match")]
            full: Option<FullMatch>,
        }

        match self
            .query::<Data>("full match", FULL_MATCH_QUERY, json!({ "id": match_id }))
            .await
        {
            Query::Data(Data { full: Some(m) }) => Feed::Match(Box::new(m)),
            Query::Data(Data { full: None }) | Query::Failed => Feed::Nothing,
            Query::Quota => Feed::QuotaExceeded,
        }
    }
}

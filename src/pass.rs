//! One scheduled pass: reconcile pending provisional messages, then look for
//! new matches of every tracked player.
//!
//! The pass is the only writer of [`PassState`]. State is mutated in memory
//! as posts and edits succeed and saved once on every exit path, so an
//! aborted pass keeps the progress it made. An expired match is terminal:
//! discovery never announces it again.

use crate::config::TrackedPlayer;
use crate::embed;
use crate::state::{PassState, PendingEntry, Snapshot, StateStore};
use crate::stratz::{Feed, MatchFeed};
use crate::webhook::{Delivery, PostMode, WebhookClient};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(12 * 3600);
pub const MIN_EXPIRY: Duration = Duration::from_secs(30 * 60);
pub const MAX_EXPIRY: Duration = Duration::from_secs(48 * 3600);

/// Expiry window for a pending entry: its own override, else the configured
/// default, else 12h; always clamped to `[30min, 48h]`.
pub fn expiry_for(entry_override: Option<i64>, configured: Option<Duration>) -> Duration {
    let raw = entry_override
        .map(|secs| Duration::from_secs(secs.max(0) as u64))
        .or(configured)
        .unwrap_or(DEFAULT_EXPIRY);
    raw.clamp(MIN_EXPIRY, MAX_EXPIRY)
}

/// Why a pass stopped before finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abort {
    QuotaExceeded,
    Cooldown(Duration),
    HardBlocked,
}

impl fmt::Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Abort::QuotaExceeded => write!(f, "upstream quota exhausted"),
            Abort::Cooldown(d) => write!(f, "webhook cooldown ({:.1}s)", d.as_secs_f64()),
            Abort::HardBlocked => write!(f, "webhook hard-blocked at the edge"),
        }
    }
}

type Flow = Result<(), Abort>;

fn stop_on(delivery: Delivery) -> Flow {
    match delivery {
        Delivery::Cooldown(d) => Err(Abort::Cooldown(d)),
        Delivery::HardBlocked => Err(Abort::HardBlocked),
        Delivery::Delivered(_) | Delivery::Failed => Ok(()),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub posted: usize,
    pub provisional: usize,
    pub upgraded: usize,
    pub expired: usize,
    pub abort: Option<Abort>,
}

#[derive(Debug, Clone)]
pub struct PassOptions {
    /// Destination for new posts. `None` skips discovery entirely.
    pub post_destination: Option<String>,
    pub default_expiry: Option<Duration>,
    /// Post every new match in provisional form.
    pub force_fallback: bool,
    /// Pause between pending entries.
    pub item_pace: Duration,
}

impl Default for PassOptions {
    fn default() -> Self {
        Self {
            post_destination: None,
            default_expiry: None,
            force_fallback: false,
            item_pace: Duration::from_millis(500),
        }
    }
}

pub struct Notifier {
    feed: Arc<dyn MatchFeed>,
    webhook: WebhookClient,
    store: Arc<dyn StateStore>,
    players: Vec<TrackedPlayer>,
    options: PassOptions,
}

impl Notifier {
    pub fn new(
        feed: Arc<dyn MatchFeed>,
        webhook: WebhookClient,
        store: Arc<dyn StateStore>,
        players: Vec<TrackedPlayer>,
        options: PassOptions,
    ) -> Self {
        Self {
            feed,
            webhook,
            store,
            players,
            options,
        }
    }

    pub async fn run_pass(&self) -> PassReport {
        let mut state = self.store.load().await;
        let mut report = PassReport::default();

        let flow = match self.reconcile_pending(&mut state, &mut report).await {
            Ok(()) => self.dispatch_players(&mut state, &mut report).await,
            Err(abort) => Err(abort),
        };
        if let Err(abort) = flow {
            warn!("Pass stopped early: {}", abort);
            report.abort = Some(abort);
        }

        self.store.save(&state).await;
        info!(
            "Pass finished: {} posted, {} provisional, {} upgraded, {} expired, {} still pending",
            report.posted,
            report.provisional,
            report.upgraded,
            report.expired,
            state.pending.len()
        );
        report
    }

    async fn check_abort(&self) -> Flow {
        if self.webhook.is_hard_blocked() {
            return Err(Abort::HardBlocked);
        }
        let remaining = self.webhook.cooldown_remaining().await;
        if !remaining.is_zero() {
            return Err(Abort::Cooldown(remaining));
        }
        Ok(())
    }

    async fn reconcile_pending(&self, state: &mut PassState, report: &mut PassReport) -> Flow {
        for (i, key) in state.pending_in_order().into_iter().enumerate() {
            if i > 0 && !self.options.item_pace.is_zero() {
                sleep(self.options.item_pace).await;
            }
            self.check_abort().await?;

            let Some(entry) = state.pending.get(&key).cloned() else {
                continue;
            };
            let expiry = expiry_for(entry.expires_after_sec, self.options.default_expiry);
            let age = Utc::now().timestamp() - entry.posted_at;
            if age >= expiry.as_secs() as i64 {
                self.expire(state, &key, &entry, report).await?;
            } else {
                self.try_upgrade(state, &entry, report).await?;
            }
        }
        Ok(())
    }

    async fn expire(
        &self,
        state: &mut PassState,
        key: &str,
        entry: &PendingEntry,
        report: &mut PassReport,
    ) -> Flow {
        let Some(message_id) = entry.message_id.as_deref() else {
            warn!("Pending match {} has no message id; expiring it without an edit", key);
            state.mark_expired(entry.player_account_id, entry.snapshot.match_id);
            report.expired += 1;
            return Ok(());
        };

        let delivery = self
            .webhook
            .edit(&entry.webhook_base, message_id, &embed::expired(&entry.snapshot))
            .await;
        match delivery {
            Delivery::Delivered(_) => {
                info!(
                    "Expired provisional message for match {} ({})",
                    key, entry.snapshot.player_name
                );
            }
            Delivery::Failed => {
                warn!("Could not mark match {} as expired; dropping it anyway", key);
            }
            other => return stop_on(other),
        }
        state.mark_expired(entry.player_account_id, entry.snapshot.match_id);
        report.expired += 1;
        Ok(())
    }

    async fn try_upgrade(
        &self,
        state: &mut PassState,
        entry: &PendingEntry,
        report: &mut PassReport,
    ) -> Flow {
        let match_id = entry.snapshot.match_id;
        let full = match self.feed.full_match(match_id).await {
            Feed::Match(m) => m,
            Feed::Nothing => {
                debug!("No data yet for pending match {}", match_id);
                return Ok(());
            }
            Feed::QuotaExceeded => return Err(Abort::QuotaExceeded),
        };
        let Some(slot) = full.slot_for(entry.player_account_id) else {
            debug!(
                "Player {} missing from pending match {}",
                entry.player_account_id, match_id
            );
            return Ok(());
        };
        if slot.imp.is_none() {
            debug!("Match {} still has no impact score", match_id);
            return Ok(());
        }
        let Some(message_id) = entry.message_id.as_deref() else {
            return Ok(());
        };

        let embed = embed::full(&entry.snapshot.player_name, &full, slot);
        match self.webhook.edit(&entry.webhook_base, message_id, &embed).await {
            Delivery::Delivered(_) => {
                info!(
                    "Upgraded match {} for {} in place",
                    match_id, entry.snapshot.player_name
                );
                state.mark_posted(entry.player_account_id, match_id);
                report.upgraded += 1;
                Ok(())
            }
            Delivery::Failed => {
                warn!("Upgrade edit for match {} failed; will retry", match_id);
                Ok(())
            }
            other => stop_on(other),
        }
    }

    async fn dispatch_players(&self, state: &mut PassState, report: &mut PassReport) -> Flow {
        let Some(destination) = self.options.post_destination.as_deref() else {
            info!("No webhook destination configured; skipping match discovery");
            return Ok(());
        };
        for player in &self.players {
            self.check_abort().await?;
            self.dispatch_player(player, destination, state, report)
                .await?;
        }
        Ok(())
    }

    async fn dispatch_player(
        &self,
        player: &TrackedPlayer,
        destination: &str,
        state: &mut PassState,
        report: &mut PassReport,
    ) -> Flow {
        let last = state.last_posted_for(player.account_id);
        let full = match self.feed.newest_match(player.account_id, last).await {
            Feed::Match(m) => m,
            Feed::Nothing => {
                debug!("Nothing new for {}", player.name);
                return Ok(());
            }
            Feed::QuotaExceeded => return Err(Abort::QuotaExceeded),
        };
        let Some(slot) = full.slot_for(player.account_id) else {
            warn!("{} not found in match {}", player.name, full.id);
            return Ok(());
        };
        if state.is_expired(full.id) {
            debug!("Match {} already expired for {}", full.id, player.name);
            return Ok(());
        }
        let key = full.id.to_string();
        let has_score = slot.imp.is_some() && !self.options.force_fallback;

        if let Some(entry) = state.pending.get(&key) {
            if !has_score {
                debug!("Match {} already awaiting its score", key);
                return Ok(());
            }
            if let Some(message_id) = entry.message_id.clone() {
                let base = entry.webhook_base.clone();
                let embed = embed::full(&player.name, &full, slot);
                return match self.webhook.edit(&base, &message_id, &embed).await {
                    Delivery::Delivered(_) => {
                        info!("Upgraded match {} for {} in place", key, player.name);
                        state.mark_posted(player.account_id, full.id);
                        report.upgraded += 1;
                        Ok(())
                    }
                    other => stop_on(other),
                };
            }
        }

        if has_score {
            let embed = embed::full(&player.name, &full, slot);
            match self
                .webhook
                .post(destination, &embed, PostMode::FireAndForget)
                .await
            {
                Delivery::Delivered(_) => {
                    info!("Posted match {} for {}", key, player.name);
                    state.mark_posted(player.account_id, full.id);
                    report.posted += 1;
                    Ok(())
                }
                other => stop_on(other),
            }
        } else {
            let snapshot = Snapshot::capture(&player.name, &full, slot);
            let embed = embed::provisional(&snapshot);
            match self
                .webhook
                .post(destination, &embed, PostMode::WaitForMessage)
                .await
            {
                Delivery::Delivered(receipt) => {
                    if receipt.message_id.is_none() {
                        warn!("No message id returned for match {}; it cannot be upgraded in place", key);
                    }
                    info!("Posted provisional match {} for {}", key, player.name);
                    state.pending.insert(
                        key,
                        PendingEntry {
                            player_account_id: player.account_id,
                            message_id: receipt.message_id,
                            posted_at: Utc::now().timestamp(),
                            webhook_base: receipt.webhook_base,
                            snapshot,
                            expires_after_sec: None,
                        },
                    );
                    report.provisional += 1;
                    Ok(())
                }
                other => stop_on(other),
            }
        }
    }
}

use crate::feedback::{self, Mode};
use crate::state::Snapshot;
use crate::stratz::{FullMatch, PlayerSlot};
use chrono::{DateTime, Utc};
use serde::Serialize;

const COLOR_WIN: u32 = 0x2ecc71;
const COLOR_LOSS: u32 = 0xe74c3c;
const COLOR_PENDING: u32 = 0x95a5a6;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub fields: Vec<EmbedField>,
    pub footer: Footer,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Footer {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Author {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

impl Embed {
    fn field(&mut self, name: &str, value: impl Into<String>, inline: bool) {
        self.fields.push(EmbedField {
            name: name.to_string(),
            value: value.into(),
            inline,
        });
    }
}

fn title_line(player: &str, hero: &str, won: bool, match_id: i64) -> String {
    let result = if won { "Won" } else { "Lost" };
    format!("{player} {result} as {hero} (match {match_id})")
}

fn rfc3339(epoch: Option<i64>) -> String {
    epoch
        .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}

fn match_link(match_id: i64) -> String {
    format!("https://stratz.com/matches/{match_id}")
}

fn dash(value: Option<&str>) -> String {
    value
        .map(|v| v.replace('_', " ").to_lowercase())
        .unwrap_or_else(|| "-".to_string())
}

/// The final message, rendered once the headline score is known.
pub fn full(player_name: &str, full: &FullMatch, slot: &PlayerSlot) -> Embed {
    let mode = Mode::of(full);
    let hero = slot.hero_name();
    let mut embed = Embed {
        title: title_line(player_name, &hero, slot.is_victory, full.id),
        description: match_link(full.id),
        fields: Vec::new(),
        footer: Footer {
            text: format!("{} • {}", mode.label(), format_duration(full.duration_seconds)),
        },
        timestamp: rfc3339(full.start_date_time),
        author: Some(Author {
            name: hero.clone(),
            icon_url: slot.hero.as_ref().and_then(|h| h.icon_url()),
        }),
        color: Some(if slot.is_victory { COLOR_WIN } else { COLOR_LOSS }),
    };

    if let Some(imp) = slot.imp {
        embed.field("Impact", format!("{imp} ({})", feedback::impact_tier(imp)), true);
    }
    embed.field(
        "K / D / A",
        format!(
            "{} / {} / {} ({:.1})",
            slot.kills,
            slot.deaths,
            slot.assists,
            slot.kda_ratio()
        ),
        true,
    );
    embed.field("Level", slot.level.to_string(), true);
    embed.field(
        "GPM / XPM",
        format!("{} / {}", slot.gold_per_minute, slot.experience_per_minute),
        true,
    );
    embed.field("Networth", slot.networth.to_string(), true);
    embed.field(
        "LH / DN",
        format!("{} / {}", slot.num_last_hits, slot.num_denies),
        true,
    );
    embed.field(
        "Damage",
        format!("Hero {} • Tower {}", slot.hero_damage, slot.tower_damage),
        true,
    );
    embed.field("Healing", slot.hero_healing.to_string(), true);
    embed.field(
        "Lane / Role",
        format!("{} / {}", dash(slot.lane.as_deref()), dash(slot.role.as_deref())),
        true,
    );
    if let Some(stats) = &slot.stats {
        let (obs, sen) = stats.ward_counts();
        embed.field(
            "Vision / Runes",
            format!("{obs} obs / {sen} sentries • {} runes", stats.runes),
            true,
        );
    }

    let notes = feedback::commentary(slot, full);
    if !notes.is_empty() {
        embed.field("Notes", notes.join("\n"), false);
    }
    embed
}

/// Posted immediately when the score is not available yet.
pub fn provisional(snapshot: &Snapshot) -> Embed {
    let mut embed = snapshot_base(snapshot);
    embed.description = format!(
        "{}\nImpact score is still being calculated. This message will update automatically.",
        match_link(snapshot.match_id)
    );
    embed.field("Impact", "Awaiting score…", true);
    embed
}

/// Terminal form for a provisional message whose score never arrived.
pub fn expired(snapshot: &Snapshot) -> Embed {
    let mut embed = snapshot_base(snapshot);
    embed.description = format!(
        "{}\nNo impact score arrived in time; detailed stats are unavailable for this match.",
        match_link(snapshot.match_id)
    );
    embed.field("Impact", "Not available", true);
    embed
}

fn snapshot_base(snapshot: &Snapshot) -> Embed {
    let mut embed = Embed {
        title: title_line(
            &snapshot.player_name,
            &snapshot.hero_name,
            snapshot.is_victory,
            snapshot.match_id,
        ),
        description: String::new(),
        fields: Vec::new(),
        footer: Footer {
            text: format!(
                "{} • {}",
                snapshot.mode,
                format_duration(snapshot.duration_seconds)
            ),
        },
        timestamp: rfc3339(snapshot.start_time),
        author: Some(Author {
            name: snapshot.hero_name.clone(),
            icon_url: snapshot.hero_icon.clone(),
        }),
        color: Some(COLOR_PENDING),
    };
    embed.field(
        "K / D / A",
        format!("{} / {} / {}", snapshot.kills, snapshot.deaths, snapshot.assists),
        true,
    );
    embed
}

pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

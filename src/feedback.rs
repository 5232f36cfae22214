//! Evaluative commentary for a finished match.
//!
//! Turbo games run faster and inflate farm numbers, so each mode has its own
//! analyzer and thresholds. Analyzers are plain functions picked from a fixed
//! table by [`Mode`].

use crate::stratz::{FullMatch, PlayerSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Turbo,
    NonTurbo,
}

impl Mode {
    pub fn of(full: &FullMatch) -> Self {
        if full.is_turbo() {
            Mode::Turbo
        } else {
            Mode::NonTurbo
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Mode::Turbo => "Turbo",
            Mode::NonTurbo => "Ranked/Normal",
        }
    }
}

type Analyzer = fn(&PlayerSlot, &FullMatch) -> Vec<String>;

const ANALYZERS: [(Mode, Analyzer); 2] = [(Mode::Turbo, analyze_turbo), (Mode::NonTurbo, analyze_normal)];

pub fn analyzer_for(mode: Mode) -> Analyzer {
    ANALYZERS
        .iter()
        .find(|(m, _)| *m == mode)
        .map(|(_, f)| *f)
        .unwrap_or(analyze_normal)
}

pub fn commentary(slot: &PlayerSlot, full: &FullMatch) -> Vec<String> {
    analyzer_for(Mode::of(full))(slot, full)
}

/// Tier label for a headline impact score.
pub fn impact_tier(imp: i32) -> &'static str {
    match imp {
        i32::MIN..=-20 => "Liability",
        -19..=-1 => "Below par",
        0..=9 => "Solid",
        10..=24 => "Strong",
        25..=39 => "Dominant",
        _ => "Legendary",
    }
}

struct Bands {
    good_gpm: i32,
    poor_gpm: i32,
    feeding_deaths_per_10: f64,
    low_wards: usize,
}

const TURBO_BANDS: Bands = Bands {
    good_gpm: 900,
    poor_gpm: 450,
    feeding_deaths_per_10: 4.0,
    low_wards: 1,
};

const NORMAL_BANDS: Bands = Bands {
    good_gpm: 600,
    poor_gpm: 300,
    feeding_deaths_per_10: 3.0,
    low_wards: 3,
};

fn analyze_turbo(slot: &PlayerSlot, full: &FullMatch) -> Vec<String> {
    analyze_with(&TURBO_BANDS, slot, full)
}

fn analyze_normal(slot: &PlayerSlot, full: &FullMatch) -> Vec<String> {
    analyze_with(&NORMAL_BANDS, slot, full)
}

fn analyze_with(bands: &Bands, slot: &PlayerSlot, full: &FullMatch) -> Vec<String> {
    let mut notes = Vec::new();
    let minutes = full.duration_minutes().max(1.0);

    if slot.gold_per_minute >= bands.good_gpm {
        notes.push(format!("Farm was excellent at {} GPM.", slot.gold_per_minute));
    } else if slot.gold_per_minute <= bands.poor_gpm {
        notes.push(format!(
            "Only {} GPM; look for more efficient farming patterns.",
            slot.gold_per_minute
        ));
    }

    let deaths_per_10 = slot.deaths as f64 * 10.0 / minutes;
    if deaths_per_10 >= bands.feeding_deaths_per_10 {
        notes.push(format!(
            "{} deaths is a lot for a {:.0}-minute game; positioning needs work.",
            slot.deaths, minutes
        ));
    } else if slot.deaths == 0 {
        notes.push("Deathless game.".to_string());
    }

    if slot.kda_ratio() >= 6.0 {
        notes.push(format!("KDA ratio of {:.1}.", slot.kda_ratio()));
    }

    let is_support = slot
        .role
        .as_deref()
        .is_some_and(|r| r.eq_ignore_ascii_case("LIGHT_SUPPORT") || r.eq_ignore_ascii_case("HARD_SUPPORT"));
    let wards = slot
        .stats
        .as_ref()
        .map(|s| {
            let (obs, sen) = s.ward_counts();
            obs + sen
        })
        .unwrap_or(0);
    if is_support && wards <= bands.low_wards {
        notes.push(format!("Only {} wards placed as a support.", wards));
    }

    if let Some(trend) = slot.stats.as_ref().and_then(|s| impact_trend(&s.imp_per_minute)) {
        notes.push(trend.to_string());
    }

    notes
}

/// Compares the first and second half of the per-minute impact series.
pub fn impact_trend(series: &[i32]) -> Option<&'static str> {
    if series.len() < 4 {
        return None;
    }
    let mid = series.len() / 2;
    let avg = |s: &[i32]| s.iter().map(|v| *v as f64).sum::<f64>() / s.len() as f64;
    let (early, late) = (avg(&series[..mid]), avg(&series[mid..]));
    if late - early >= 5.0 {
        Some("Impact grew as the game went on.")
    } else if early - late >= 5.0 {
        Some("Impact faded in the late game.")
    } else {
        None
    }
}

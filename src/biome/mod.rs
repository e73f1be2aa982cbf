//! Biome share market.
//!
//! Seven fixed markets whose share price is cash ÷ shares, moved by a
//! periodic attention-weighted cash redistribution.

pub mod market;
pub mod worker;

use serde::{Deserialize, Serialize};

pub use market::BiomeMarketEngine;
pub use worker::spawn_biome_worker;

/// The fixed biome set. Markets exist for exactly these seven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Biome {
    Ocean,
    Beach,
    Plains,
    Forest,
    Desert,
    Mountain,
    Snow,
}

pub const ALL_BIOMES: [Biome; 7] = [
    Biome::Ocean,
    Biome::Beach,
    Biome::Plains,
    Biome::Forest,
    Biome::Desert,
    Biome::Mountain,
    Biome::Snow,
];

impl Biome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Biome::Ocean => "ocean",
            Biome::Beach => "beach",
            Biome::Plains => "plains",
            Biome::Forest => "forest",
            Biome::Desert => "desert",
            Biome::Mountain => "mountain",
            Biome::Snow => "snow",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ocean" => Some(Biome::Ocean),
            "beach" => Some(Biome::Beach),
            "plains" => Some(Biome::Plains),
            "forest" => Some(Biome::Forest),
            "desert" => Some(Biome::Desert),
            "mountain" => Some(Biome::Mountain),
            "snow" => Some(Biome::Snow),
            _ => None,
        }
    }

    pub fn room(&self) -> String {
        format!("biome_market:{}", self.as_str())
    }
}

/// Room that receives every biome market update.
pub const ROOM_ALL: &str = "biome_market_all";

//! Presence samples and the predicates that produce them
//!
//! The detection model reports raw observations; a predicate folds one
//! observation into the boolean-plus-locus signal the dwell confirmer
//! consumes.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One detector observation cycle, reduced to what the controller needs
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceSample {
    /// Someone is present in the activation zone
    pub detected: bool,
    /// Normalized horizontal position (0.0 = left edge, 1.0 = right edge)
    pub locus: Option<f32>,
}

impl PresenceSample {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn present_at(locus: f32) -> Self {
        Self {
            detected: true,
            locus: Some(locus),
        }
    }
}

/// A single landmark reported by the detection model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    /// Model confidence in [0, 1]
    pub confidence: f32,
    /// Normalized horizontal position of the anchor point (palm base, nose)
    pub x: f32,
}

/// Raw per-frame output of the detection model
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(default)]
    pub hand: Option<Landmark>,
    #[serde(default)]
    pub face: Option<Landmark>,
}

/// Which landmarks count as presence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PresencePredicate {
    /// A confident hand in the middle third of the frame
    #[default]
    HandOnly,
    /// Either a confident hand or a confident face in the middle third
    HandOrFace,
}

/// Left and right bounds of the activation zone
const ZONE: (f32, f32) = (1.0 / 3.0, 2.0 / 3.0);

impl PresencePredicate {
    /// Evaluate one observation
    pub fn evaluate(&self, observation: &Observation, confidence_threshold: f32) -> PresenceSample {
        let qualifies = |landmark: &Option<Landmark>| {
            landmark.filter(|l| l.confidence > confidence_threshold && in_zone(l.x))
        };

        let hit = match self {
            PresencePredicate::HandOnly => qualifies(&observation.hand),
            PresencePredicate::HandOrFace => {
                qualifies(&observation.hand).or_else(|| qualifies(&observation.face))
            }
        };

        match hit {
            Some(landmark) => PresenceSample::present_at(landmark.x),
            None => PresenceSample::absent(),
        }
    }
}

fn in_zone(x: f32) -> bool {
    x > ZONE.0 && x < ZONE.1
}

#[derive(Debug, thiserror::Error)]
#[error("unknown presence predicate '{0}' (expected 'hand' or 'hand_or_face')")]
pub struct UnknownPredicate(String);

impl FromStr for PresencePredicate {
    type Err = UnknownPredicate;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hand" | "hand_only" => Ok(Self::HandOnly),
            "hand_or_face" | "face" => Ok(Self::HandOrFace),
            other => Err(UnknownPredicate(other.to_string())),
        }
    }
}

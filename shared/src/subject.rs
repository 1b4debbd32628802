use crate::error::ZoneResult;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a player whose position drives partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectId(pub u32);

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subject-{}", self.0)
    }
}

/// Persistent state of a subject as reported by an authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectState {
    pub id: SubjectId,
    pub x: f32,
    pub y: f32,
    pub vel_x: f32,
    pub vel_y: f32,
    pub score: u32,
}

impl SubjectState {
    pub fn new(id: SubjectId, x: f32, y: f32) -> Self {
        Self {
            id,
            x,
            y,
            vel_x: 0.0,
            vel_y: 0.0,
            score: 0,
        }
    }

    pub fn position(&self) -> (f32, f32) {
        (self.x, self.y)
    }

    pub fn distance_to(&self, other: &SubjectState) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Field-by-field comparison used by the commit quorum: positions must
    /// agree within `tolerance`, discrete fields must match exactly.
    pub fn is_similar(&self, other: &SubjectState, tolerance: f32) -> bool {
        self.id == other.id && self.score == other.score && self.distance_to(other) <= tolerance
    }

    pub fn to_snapshot(&self) -> ZoneResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_snapshot(bytes: &[u8]) -> ZoneResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

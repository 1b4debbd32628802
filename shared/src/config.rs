//! Tuning knobs for coordinators and hosts.
//!
//! A subset of the settings is replicated: the primary coordinator writes
//! them to the durable config table, secondaries pull them on bootstrap and
//! hosts receive them at login. Which settings replicate is listed
//! explicitly in [`REPLICATED_SETTINGS`].

use crate::error::{ZoneError, ZoneResult};
use crate::geometry::Rect;
use crate::partition::PopulationLimits;
use crate::{WORLD_HEIGHT, WORLD_WIDTH};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub world_width: f32,
    pub world_height: f32,
    pub overpopulation_threshold: usize,
    pub underpopulation_threshold: usize,
    pub authority_quota: usize,
    pub commit_timeout_ms: u64,
    pub position_tolerance: f32,
    pub balance_interval_ms: u64,
    pub commit_interval_ms: u64,
    pub leader_check_interval_ms: u64,
    pub coordinator_stale_ms: u64,
    pub host_timeout_ms: u64,
    pub handoff_grace_ms: u64,
    pub request_timeout_ms: u64,
    pub report_interval_ms: u64,
    pub bootstrap_timeout_ms: u64,
    pub bootstrap_poll_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub drain_timeout_ms: u64,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            world_width: WORLD_WIDTH,
            world_height: WORLD_HEIGHT,
            overpopulation_threshold: 8,
            underpopulation_threshold: 2,
            authority_quota: 2,
            commit_timeout_ms: 5_000,
            position_tolerance: 16.0,
            balance_interval_ms: 3_000,
            commit_interval_ms: 1_000,
            leader_check_interval_ms: 2_000,
            coordinator_stale_ms: 6_000,
            host_timeout_ms: 5_000,
            handoff_grace_ms: 3_000,
            request_timeout_ms: 2_000,
            report_interval_ms: 2_000,
            bootstrap_timeout_ms: 5_000,
            bootstrap_poll_ms: 200,
            reconnect_initial_ms: 100,
            reconnect_max_ms: 10_000,
            drain_timeout_ms: 3_000,
        }
    }
}

impl ZoneConfig {
    pub fn world(&self) -> Rect {
        Rect::new(0.0, 0.0, self.world_width, self.world_height)
    }

    pub fn population_limits(&self) -> PopulationLimits {
        PopulationLimits {
            overpopulated: self.overpopulation_threshold,
            underpopulated: self.underpopulation_threshold,
        }
    }

    pub fn duration(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    /// (name, value) rows for every replicated setting.
    pub fn export_replicated(&self) -> Vec<(String, String)> {
        REPLICATED_SETTINGS
            .iter()
            .map(|s| (s.name.to_string(), (s.get)(self)))
            .collect()
    }

    /// Applies replicated rows over the local values. Unknown names are
    /// ignored so newer coordinators can add settings.
    pub fn apply_replicated(&mut self, rows: &[(String, String)]) -> ZoneResult<()> {
        for (name, value) in rows {
            if let Some(setting) = REPLICATED_SETTINGS.iter().find(|s| s.name == name) {
                (setting.set)(self, value)?;
            }
        }
        Ok(())
    }
}

/// Accessor pair for a setting that is shared across instances.
pub struct ReplicatedSetting {
    pub name: &'static str,
    pub get: fn(&ZoneConfig) -> String,
    pub set: fn(&mut ZoneConfig, &str) -> ZoneResult<()>,
}

macro_rules! replicated {
    ($name:literal, $field:ident) => {
        ReplicatedSetting {
            name: $name,
            get: |config| config.$field.to_string(),
            set: |config, raw| {
                config.$field = raw.parse().map_err(|_| ZoneError::InvalidSetting {
                    name: $name.to_string(),
                    value: raw.to_string(),
                })?;
                Ok(())
            },
        }
    };
}

pub const REPLICATED_SETTINGS: &[ReplicatedSetting] = &[
    replicated!("world_width", world_width),
    replicated!("world_height", world_height),
    replicated!("overpopulation_threshold", overpopulation_threshold),
    replicated!("underpopulation_threshold", underpopulation_threshold),
    replicated!("authority_quota", authority_quota),
    replicated!("commit_timeout_ms", commit_timeout_ms),
    replicated!("position_tolerance", position_tolerance),
    replicated!("handoff_grace_ms", handoff_grace_ms),
    replicated!("request_timeout_ms", request_timeout_ms),
    replicated!("report_interval_ms", report_interval_ms),
];

// ── Runtime configuration ──
//
// Fee and rate tables plus sync tuning. Built by the embedding
// application and handed in -- core never reads config files.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleetdeck_api::{ReconnectPolicy, Topic};

use crate::model::{UnitType, VehicleClass};

/// Configured fees applied on top of the per-unit rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeTable {
    pub pickup_fee: f64,
    pub dropoff_fee: f64,
    pub extra_passenger_fee: f64,
    /// Suggested deposit as a percentage of the total (0–100).
    pub deposit_percentage: f64,
}

impl Default for FeeTable {
    fn default() -> Self {
        Self {
            pickup_fee: 0.0,
            dropoff_fee: 0.0,
            extra_passenger_fee: 0.0,
            deposit_percentage: 30.0,
        }
    }
}

/// Transport options actually flagged on a rental.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TransportFlags {
    pub pickup: bool,
    pub dropoff: bool,
}

/// Per-unit rates by vehicle class and billing unit, with a separate
/// table for VIP customers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateTable {
    pub standard: HashMap<VehicleClass, HashMap<UnitType, f64>>,
    pub vip: HashMap<VehicleClass, HashMap<UnitType, f64>>,
}

impl RateTable {
    /// Resolve the per-unit rate. VIP customers use the VIP table,
    /// falling back to standard where no VIP rate is configured.
    pub fn rate(&self, class: VehicleClass, unit: UnitType, vip: bool) -> Option<f64> {
        let lookup = |table: &HashMap<VehicleClass, HashMap<UnitType, f64>>| {
            table.get(&class).and_then(|m| m.get(&unit)).copied()
        };
        if vip {
            lookup(&self.vip).or_else(|| lookup(&self.standard))
        } else {
            lookup(&self.standard)
        }
    }

    pub fn with_standard(mut self, class: VehicleClass, unit: UnitType, rate: f64) -> Self {
        self.standard.entry(class).or_default().insert(unit, rate);
        self
    }

    pub fn with_vip(mut self, class: VehicleClass, unit: UnitType, rate: f64) -> Self {
        self.vip.entry(class).or_default().insert(unit, rate);
        self
    }
}

/// Debounce/batch timing for the update batcher.
#[derive(Debug, Clone, Copy)]
pub struct BatchTiming {
    /// Quiet period required before a burst is considered settled.
    pub debounce: Duration,
    /// Delay after settling before buffered events are delivered.
    pub batch_delay: Duration,
}

impl Default for BatchTiming {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            batch_delay: Duration::from_millis(250),
        }
    }
}

/// Tuning for the sync service.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Topics to keep synchronized.
    pub topics: Vec<Topic>,
    /// Heartbeat interval for live subscriptions.
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub batch: BatchTiming,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            topics: vec![Topic::Vehicles, Topic::Reservations],
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            batch: BatchTiming::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vip_rate_falls_back_to_standard() {
        let rates = RateTable::default()
            .with_standard(VehicleClass::Standard, UnitType::Hourly, 20.0)
            .with_vip(VehicleClass::Performance, UnitType::Hourly, 45.0);

        assert_eq!(
            rates.rate(VehicleClass::Performance, UnitType::Hourly, true),
            Some(45.0)
        );
        // No VIP rate configured for Standard: fall back.
        assert_eq!(
            rates.rate(VehicleClass::Standard, UnitType::Hourly, true),
            Some(20.0)
        );
        assert_eq!(
            rates.rate(VehicleClass::Utility, UnitType::Daily, false),
            None
        );
    }
}

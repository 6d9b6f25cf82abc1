//! The meter hardware capability (spec §6) and a deterministic stand-in
//! implementation for running the protocol without real smart meters.
//!
//! Grounded in `original_source/src/MeterInterface.h`: the protocol core
//! only ever asks a `MeterCapability` for measurements, never a concrete
//! device. The original's `simulation::Device`/`EventManager` machinery is
//! a full discrete-event load simulator (device on/off cycles, weekday vs.
//! weekend usage probabilities); `SimulatedMeter` here is deliberately
//! lighter than that — a seeded, reproducible load curve rather than an
//! event-driven appliance model, since the protocol core only needs
//! *some* numbers to aggregate, not a faithful household simulation.

use crate::error::{Error, Result};
use crate::fixed_point::FixedPoint;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// A projected per-hour price, as supplied by the utility for
/// `QueryType::ProjectedUsage` queries (spec §3).
pub type PriceFunction = Arc<dyn Fn(u32) -> FixedPoint + Send + Sync>;

/// Builds a `PriceFunction` from `QueryRequest::price_fn`'s serialized
/// bytes. A live function value can't cross the wire, so the wire
/// representation is a per-hour price table (`Vec<FixedPoint>`,
/// `rmp_serde`-encoded); hours beyond the table's length repeat its last
/// entry, so a short table still covers an arbitrary query window.
pub fn price_fn_from_bytes(bytes: &[u8]) -> Result<PriceFunction> {
    let table: Vec<FixedPoint> =
        rmp_serde::from_slice(bytes).map_err(|e| Error::Serialisation(e.to_string()))?;
    if table.is_empty() {
        return Err(Error::Serialisation("empty price table".to_string()));
    }
    Ok(Arc::new(move |hour| {
        table[(hour as usize).min(table.len() - 1)]
    }))
}

/// The inverse of `price_fn_from_bytes`, used by the utility to serialize a
/// price table into a `QueryRequest`.
pub fn price_fn_to_bytes(table: &[FixedPoint]) -> Result<Vec<u8>> {
    rmp_serde::to_vec(table).map_err(|e| Error::Serialisation(e.to_string()))
}

/// What the protocol core needs from meter hardware (spec §6). A real
/// implementation would read this off the physical meter; `SimulatedMeter`
/// fabricates plausible numbers instead.
pub trait MeterCapability: Send + Sync {
    /// Total energy consumed in the last `window_minutes` minutes.
    fn measure_consumption(&self, window_minutes: u32) -> FixedPoint;

    /// The portion of consumption in the last `window_minutes` minutes
    /// that came from shiftable (deferrable) loads.
    fn measure_shiftable_consumption(&self, window_minutes: u32) -> FixedPoint;

    /// Total energy consumed so far today.
    fn measure_daily_consumption(&self) -> FixedPoint;

    /// Projects usage over `time_window` minutes under `price_fn`,
    /// returning one fixed-point value per hour in the window — the only
    /// query type whose answer depends on a utility-supplied function
    /// rather than just the meter's own history.
    fn simulate_projected_usage(&self, price_fn: &PriceFunction, time_window: u32) -> Vec<FixedPoint>;
}

/// A seeded, reproducible substitute for a real household meter: no
/// appliance modeling, just an hour-shaped load curve perturbed by a
/// per-meter seed so different simulated meters disagree plausibly.
pub struct SimulatedMeter {
    base_load_watts: f64,
    seed: u64,
}

impl SimulatedMeter {
    /// `meter_seed` fixes this meter's idiosyncratic consumption pattern
    /// (e.g. the meter's own id), so repeated measurements within a test
    /// run are reproducible.
    pub fn new(meter_seed: u64, base_load_watts: f64) -> Self {
        Self {
            base_load_watts,
            seed: meter_seed,
        }
    }

    fn rng_for(&self, window_minutes: u32) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ (window_minutes as u64))
    }

    fn hourly_shape(hour: u32) -> f64 {
        // A crude day-shaped curve: low overnight, peaks at breakfast and
        // evening. Good enough to make aggregated totals look non-uniform
        // without claiming to model real appliance behavior.
        let h = (hour % 24) as f64;
        0.4 + 0.3 * (1.0 + ((h - 7.0) / 3.0).cos()) + 0.3 * (1.0 + ((h - 19.0) / 3.0).cos())
    }
}

impl MeterCapability for SimulatedMeter {
    fn measure_consumption(&self, window_minutes: u32) -> FixedPoint {
        let mut rng = self.rng_for(window_minutes);
        let noise: f64 = rng.gen_range(0.9, 1.1);
        let hours = window_minutes as f64 / 60.0;
        let watt_hours = self.base_load_watts * hours * noise;
        FixedPoint::from_f64(watt_hours / 1000.0)
    }

    fn measure_shiftable_consumption(&self, window_minutes: u32) -> FixedPoint {
        let total = self.measure_consumption(window_minutes);
        FixedPoint::from_f64(total.to_f64() * 0.35)
    }

    fn measure_daily_consumption(&self) -> FixedPoint {
        self.measure_consumption(24 * 60)
    }

    fn simulate_projected_usage(&self, price_fn: &PriceFunction, time_window: u32) -> Vec<FixedPoint> {
        let hours = (time_window / 60).max(1);
        let mut rng = self.rng_for(time_window);
        (0..hours)
            .map(|hour| {
                let price = price_fn(hour).to_f64().max(0.01);
                let shape = Self::hourly_shape(hour);
                let noise: f64 = rng.gen_range(0.95, 1.05);
                // Higher projected price nudges the simulated household to
                // shed some load, same direction as a real price-responsive
                // customer.
                let responsiveness = 1.0 / price.sqrt();
                let watt_hours = self.base_load_watts * shape * noise * responsiveness;
                FixedPoint::from_f64(watt_hours / 1000.0)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_window_yields_reproducible_measurement() {
        let meter = SimulatedMeter::new(42, 500.0);
        assert_eq!(meter.measure_consumption(60), meter.measure_consumption(60));
    }

    #[test]
    fn different_seeds_usually_disagree() {
        let a = SimulatedMeter::new(1, 500.0);
        let b = SimulatedMeter::new(2, 500.0);
        assert_ne!(a.measure_consumption(60), b.measure_consumption(60));
    }

    #[test]
    fn shiftable_consumption_is_a_fraction_of_total() {
        let meter = SimulatedMeter::new(7, 1000.0);
        let total = meter.measure_consumption(60);
        let shiftable = meter.measure_shiftable_consumption(60);
        assert!(shiftable.to_f64() < total.to_f64());
    }

    #[test]
    fn projected_usage_has_one_value_per_hour() {
        let meter = SimulatedMeter::new(3, 800.0);
        let price_fn: PriceFunction = Arc::new(|_hour| FixedPoint::from_f64(0.12));
        let projected = meter.simulate_projected_usage(&price_fn, 180);
        assert_eq!(projected.len(), 3);
    }

    #[test]
    fn price_table_round_trips_and_clamps_past_its_length() {
        let table = vec![FixedPoint::from_f64(0.10), FixedPoint::from_f64(0.20)];
        let bytes = price_fn_to_bytes(&table).unwrap();
        let price_fn = price_fn_from_bytes(&bytes).unwrap();
        assert_eq!(price_fn(0), table[0]);
        assert_eq!(price_fn(1), table[1]);
        assert_eq!(price_fn(50), table[1]);
    }
}

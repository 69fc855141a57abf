//! Simulated weather station for development and demos.
//!
//! Produces plausible loop packets in US customary units by random-walking
//! each sensor around a starting value, plus archive records summarizing the
//! packets of one archive interval.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::observation::{Observation, Timestamp, Value, US};

/// Rain intensity classes: dry, drizzle, shower. Rain in inches per packet.
const RAIN_CLASSES: &[(u32, f64)] = &[(85, 0.0), (12, 0.01), (3, 0.05)];

/// Configuration for the station simulator.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Seconds between loop packets
    pub loop_interval_secs: u64,

    /// Number of loop packets summarized by each archive record
    pub packets_per_archive: usize,

    /// Outside temperature the walk starts from, in °F
    pub base_temperature: f64,

    /// Number of extra temperature channels to report
    pub extra_channels: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            loop_interval_secs: 2,
            packets_per_archive: 30,
            base_temperature: 59.0,
            extra_channels: 1,
        }
    }
}

/// Station simulator.
pub struct StationSimulator {
    config: SimulatorConfig,
    rain_weights: WeightedIndex<u32>,
    out_temp: f64,
    out_humidity: f64,
    barometer: f64,
    wind_speed: f64,
    wind_dir: f64,
    /// Packets since the last archive record
    pending: Vec<Observation>,
}

impl StationSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let weights = RAIN_CLASSES.iter().map(|(w, _)| *w);
        let rain_weights = WeightedIndex::new(weights).expect("Invalid rain weights");

        Self {
            out_temp: config.base_temperature,
            config,
            rain_weights,
            out_humidity: 60.0,
            barometer: 30.0,
            wind_speed: 5.0,
            wind_dir: 180.0,
            pending: Vec::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SimulatorConfig::default())
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Generate the next loop packet stamped with `now`.
    pub fn next_packet(&mut self, now: Timestamp) -> Observation {
        let mut rng = rand::thread_rng();

        self.out_temp = (self.out_temp + rng.gen_range(-0.3..0.3)).clamp(-40.0, 120.0);
        self.out_humidity = (self.out_humidity + rng.gen_range(-1.0..1.0)).clamp(5.0, 100.0);
        self.barometer = (self.barometer + rng.gen_range(-0.005..0.005)).clamp(28.5, 31.5);
        self.wind_speed = (self.wind_speed + rng.gen_range(-1.0..1.0)).clamp(0.0, 60.0);
        self.wind_dir = (self.wind_dir + rng.gen_range(-15.0..15.0)).rem_euclid(360.0);

        let gust = self.wind_speed + rng.gen_range(0.0..5.0);
        let rain = RAIN_CLASSES[self.rain_weights.sample(&mut rng)].1;
        let wind_dir = if self.wind_speed > 0.0 {
            Value::Number(self.wind_dir.round())
        } else {
            Value::Null
        };

        let mut packet = Observation::new(now, US)
            .with("outTemp", round(self.out_temp, 1))
            .with("outHumidity", self.out_humidity.round())
            .with("barometer", round(self.barometer, 3))
            .with("windSpeed", round(self.wind_speed, 1))
            .with("windGust", round(gust, 1))
            .with("windDir", wind_dir)
            .with("rain", rain)
            .with("rainRate", rain * 3_600.0 / self.config.loop_interval_secs.max(1) as f64)
            .with("inTemp", round(68.0 + rng.gen_range(-0.5..0.5), 1))
            .with("inHumidity", 45.0)
            .with("radiation", round(rng.gen_range(0.0..900.0), 0))
            .with("UV", round(rng.gen_range(0.0..8.0), 1))
            .with("txBatteryStatus", 0.0);

        for channel in 1..=self.config.extra_channels {
            packet = packet.with(
                format!("extraTemp{}", channel),
                round(self.out_temp + rng.gen_range(-2.0..2.0), 1),
            );
        }

        self.pending.push(packet.clone());
        packet
    }

    /// Whether enough packets have been generated for an archive record.
    pub fn archive_due(&self) -> bool {
        self.pending.len() >= self.config.packets_per_archive.max(1)
    }

    /// Summarize pending packets into an archive record.
    ///
    /// The record carries the latest readings and the rain summed over the
    /// interval. Returns `None` if no packet was generated since the last call.
    pub fn take_archive_record(&mut self) -> Option<Observation> {
        let latest = self.pending.last()?.clone();
        let rain: f64 = self
            .pending
            .iter()
            .filter_map(|p| p.get("rain").and_then(Value::as_f64))
            .sum();
        let interval_minutes =
            (self.pending.len() as u64 * self.config.loop_interval_secs) as f64 / 60.0;
        self.pending.clear();

        Some(
            latest
                .with("rain", round(rain, 3))
                .with("interval", interval_minutes),
        )
    }
}

fn round(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

//! Ground truth oracle for simulation.
//!
//! The FleetOracle maintains the "God's eye view" of the simulated fleet:
//! - True positions of all vehicles
//! - Constant-velocity motion between samples
//! - 1 Hz GPS batches (with noise and injected data faults)
//!
//! It also remembers what a correct client must end up storing for each
//! vehicle, so scenarios can check the cache against it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fleetview_core::{LatLng, LocationRecord};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::collections::{BTreeMap, HashMap};

/// A ground truth vehicle in the simulation.
#[derive(Debug, Clone)]
pub struct GroundTruthVehicle {
    pub vehicle_id: String,

    /// True position in degrees
    pub position: LatLng,

    /// Degrees per second
    pub velocity: LatLng,

    pub license_plate: String,
}

/// Per-record fault probabilities applied when sampling a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DataFaults {
    /// Record is followed by a second entry for the same vehicle
    pub duplicate_rate: f64,
    /// Coordinates replaced by the `(0,0)` firmware sentinel
    pub zero_rate: f64,
    /// Coordinates dropped
    pub null_rate: f64,
    /// Whole frame is truncated JSON (per frame, not per record)
    pub malformed_rate: f64,
}

impl DataFaults {
    /// Every fault kind at a noticeable rate.
    pub fn dirty() -> Self {
        Self {
            duplicate_rate: 0.2,
            zero_rate: 0.15,
            null_rate: 0.15,
            malformed_rate: 0.1,
        }
    }
}

/// Counts of faults actually injected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultCounts {
    pub duplicates: u64,
    pub zeroed: u64,
    pub nulled: u64,
    pub malformed_frames: u64,
}

/// The FleetOracle - maintains ground truth and generates GPS frames.
pub struct FleetOracle {
    /// RNG for noise and fault decisions
    physics_rng: ChaCha8Rng,

    vehicles: BTreeMap<String, GroundTruthVehicle>,

    /// Position noise standard deviation (degrees)
    position_noise_std: f64,

    faults: DataFaults,
    injected: FaultCounts,

    /// Position a correct client should hold for each vehicle
    expected: HashMap<String, LatLng>,
}

impl FleetOracle {
    /// Creates a new oracle with the given physics seed.
    pub fn new(physics_seed: u64) -> Self {
        Self {
            physics_rng: ChaCha8Rng::seed_from_u64(physics_seed),
            vehicles: BTreeMap::new(),
            position_noise_std: 1e-5, // ~1 m
            faults: DataFaults::default(),
            injected: FaultCounts::default(),
            expected: HashMap::new(),
        }
    }

    /// Sets the fault probabilities used for subsequent batches.
    pub fn set_faults(&mut self, faults: DataFaults) {
        self.faults = faults;
    }

    /// Sets the position noise standard deviation.
    pub fn set_position_noise(&mut self, std_dev: f64) {
        self.position_noise_std = std_dev;
    }

    /// Adds a vehicle.
    pub fn spawn_vehicle(&mut self, vehicle_id: &str, position: LatLng, velocity: LatLng) {
        let plate = format!("51A-{:05}", self.physics_rng.gen_range(0..100_000));
        self.vehicles.insert(
            vehicle_id.to_string(),
            GroundTruthVehicle {
                vehicle_id: vehicle_id.to_string(),
                position,
                velocity,
                license_plate: plate,
            },
        );
    }

    /// Adds `count` vehicles scattered around `center`, each with a random
    /// heading at city speeds.
    pub fn spawn_fleet(&mut self, count: usize, center: LatLng) {
        for i in 0..count {
            let position = LatLng::new(
                center.lat + self.physics_rng.gen_range(-0.05..0.05),
                center.lng + self.physics_rng.gen_range(-0.05..0.05),
            );
            // Up to ~15 m/s
            let velocity = LatLng::new(
                self.physics_rng.gen_range(-1.5e-4..1.5e-4),
                self.physics_rng.gen_range(-1.5e-4..1.5e-4),
            );
            self.spawn_vehicle(&format!("v{}", i + 1), position, velocity);
        }
    }

    /// Advances motion by dt seconds.
    pub fn step(&mut self, dt: f64) {
        for vehicle in self.vehicles.values_mut() {
            vehicle.position = LatLng::new(
                vehicle.position.lat + vehicle.velocity.lat * dt,
                vehicle.position.lng + vehicle.velocity.lng * dt,
            );
        }
    }

    pub fn vehicle(&self, vehicle_id: &str) -> Option<&GroundTruthVehicle> {
        self.vehicles.get(vehicle_id)
    }

    pub fn vehicle_ids(&self) -> Vec<String> {
        self.vehicles.keys().cloned().collect()
    }

    /// Last valid position emitted as the first entry for this vehicle in a
    /// well-formed frame.
    pub fn expected_position(&self, vehicle_id: &str) -> Option<LatLng> {
        self.expected.get(vehicle_id).copied()
    }

    pub fn injected_faults(&self) -> FaultCounts {
        self.injected
    }

    fn noisy(&mut self, position: LatLng) -> LatLng {
        if self.position_noise_std <= 0.0 {
            return position;
        }
        // Normal::new only fails for a non-finite std, excluded above
        let Ok(normal) = Normal::new(0.0, self.position_noise_std) else {
            return position;
        };
        LatLng::new(
            position.lat + normal.sample(&mut self.physics_rng),
            position.lng + normal.sample(&mut self.physics_rng),
        )
    }

    fn record(&mut self, vehicle_id: &str, now: DateTime<Utc>) -> Option<LocationRecord> {
        let vehicle = self.vehicles.get(vehicle_id)?.clone();
        let position = self.noisy(vehicle.position);
        let mut record = LocationRecord::new(vehicle_id)
            .at(position.lat, position.lng)
            .updated_at(now)
            .moving(vehicle.velocity.lat, vehicle.velocity.lng);
        record.license_plate_number = Some(vehicle.license_plate);
        record.vehicle_type_name = Some("Truck".to_string());
        Some(record)
    }

    /// Samples one batch for every vehicle, stamped `now`, with faults applied.
    ///
    /// Updates the expected client state as if the batch were delivered.
    pub fn sample_batch(&mut self, now: DateTime<Utc>) -> Vec<LocationRecord> {
        let mut batch = Vec::with_capacity(self.vehicles.len());
        for vehicle_id in self.vehicle_ids() {
            let Some(mut record) = self.record(&vehicle_id, now) else {
                continue;
            };

            let roll: f64 = self.physics_rng.gen();
            if roll < self.faults.zero_rate {
                record.latitude = Some(0.0);
                record.longitude = Some(0.0);
                self.injected.zeroed += 1;
            } else if roll < self.faults.zero_rate + self.faults.null_rate {
                record.latitude = None;
                record.longitude = None;
                self.injected.nulled += 1;
            }

            let duplicate = self.physics_rng.gen_bool(self.faults.duplicate_rate.clamp(0.0, 1.0));
            let first = record.clone();
            batch.push(record);
            if duplicate {
                // Same vehicle, different (valid) coordinates; must lose to the first
                let mut dup = first.clone();
                dup.latitude = Some(first.latitude.unwrap_or(10.0) + 0.5);
                dup.longitude = Some(first.longitude.unwrap_or(106.0) + 0.5);
                batch.push(dup);
                self.injected.duplicates += 1;
            }
        }
        batch
    }

    /// Samples a batch and encodes it as a stream frame.
    ///
    /// A malformed frame leaves the expected state untouched.
    pub fn frame(&mut self, now: DateTime<Utc>) -> Vec<u8> {
        let batch = self.sample_batch(now);
        let malformed = self.physics_rng.gen_bool(self.faults.malformed_rate.clamp(0.0, 1.0));
        let bytes = serde_json::to_vec(&batch).unwrap_or_default();

        if malformed {
            self.injected.malformed_frames += 1;
            return bytes[..bytes.len() / 2].to_vec();
        }

        self.record_delivery(&batch);
        bytes
    }

    /// A single-vehicle frame (the vehicle channel's payload shape).
    pub fn vehicle_frame(&mut self, vehicle_id: &str, now: DateTime<Utc>) -> Option<Vec<u8>> {
        let record = self.record(vehicle_id, now)?;
        self.record_delivery(std::slice::from_ref(&record));
        serde_json::to_vec(&record).ok()
    }

    /// A frame stamped `age` in the past, placing every vehicle far from its
    /// true position. A client that has seen newer data must ignore it.
    pub fn stale_frame(&mut self, now: DateTime<Utc>, age: ChronoDuration) -> Vec<u8> {
        let stamp = now - age;
        let records: Vec<LocationRecord> = self
            .vehicles
            .values()
            .map(|v| {
                LocationRecord::new(v.vehicle_id.clone())
                    .at(v.position.lat + 1.0, v.position.lng - 1.0)
                    .updated_at(stamp)
            })
            .collect();
        serde_json::to_vec(&records).unwrap_or_default()
    }

    fn record_delivery(&mut self, batch: &[LocationRecord]) {
        let mut seen = std::collections::HashSet::new();
        for record in batch {
            if !seen.insert(record.vehicle_id.as_str()) {
                continue;
            }
            if let Some(position) = record.position() {
                self.expected.insert(record.vehicle_id.clone(), position);
            }
        }
    }
}

//! Simulated test stand used when no hardware is attached.
//!
//! One shared plant model backs every simulated sensor and the valve driver, so valve
//! commands show up in the pressure readings the sequencer sees.

use crate::actuation::ValveDriver;
use crate::clock::Clock;
use crate::config::SimConfig;
use crate::sensors::{DeviceError, SensorDevice};
use engine_control_shared::{ActuationType, SensorLocation, SensorType, ValveLocation, ValveType};
use rand::RngExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// How long a pulsed valve stays open before it falls back closed.
const PULSE_MS: u64 = 500;

#[derive(Debug, Clone, Copy)]
struct SimValve {
    commanded: ActuationType,
    commanded_ms: u64,
    observed: Option<ActuationType>,
}

#[derive(Debug)]
struct Plant {
    pressure_psi: f64,
    updated_ms: u64,
    valves: HashMap<(ValveType, ValveLocation), SimValve>,
}

impl Plant {
    fn is_open(&self, location: ValveLocation) -> bool {
        ValveType::ALL.iter().any(|valve_type| {
            self.valves
                .get(&(*valve_type, location))
                .is_some_and(|v| v.observed == Some(ActuationType::OpenVent))
        })
    }

    /// Integrates pressure with the valves as they stood, then lets pending commands land.
    fn advance(&mut self, now_ms: u64, config: &SimConfig) {
        let dt = now_ms.saturating_sub(self.updated_ms) as f64 / 1000.0;
        let mut rate = 0.0;
        if self.is_open(ValveLocation::Pressurization) {
            rate += config.fill_rate_psi;
        }
        for vent in [
            ValveLocation::PressureRelief,
            ValveLocation::MainPropellantValve,
            ValveLocation::RemoteDrain,
        ] {
            if self.is_open(vent) {
                rate -= config.vent_rate_psi;
            }
        }
        self.pressure_psi = (self.pressure_psi + rate * dt).max(config.ambient_psi);
        self.updated_ms = self.updated_ms.max(now_ms);

        for valve in self.valves.values_mut() {
            let landed_ms = valve.commanded_ms + config.valve_lag_ms;
            if now_ms < landed_ms {
                continue;
            }
            if valve.commanded == ActuationType::Pulse {
                if now_ms < landed_ms + PULSE_MS {
                    valve.observed = Some(ActuationType::OpenVent);
                } else {
                    valve.commanded = ActuationType::CloseVent;
                    valve.observed = Some(ActuationType::CloseVent);
                }
            } else {
                valve.observed = Some(valve.commanded);
            }
        }
    }
}

#[derive(Clone)]
pub struct SimulatedStand {
    plant: Arc<Mutex<Plant>>,
    clock: Arc<dyn Clock>,
    config: SimConfig,
}

impl SimulatedStand {
    pub fn new(config: SimConfig, clock: Arc<dyn Clock>) -> Self {
        let plant = Plant {
            pressure_psi: config.ambient_psi,
            updated_ms: clock.now_ms(),
            valves: HashMap::new(),
        };
        Self {
            plant: Arc::new(Mutex::new(plant)),
            clock,
            config,
        }
    }

    fn plant(&self) -> MutexGuard<'_, Plant> {
        let mut plant = self
            .plant
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        plant.advance(self.clock.now_ms(), &self.config);
        plant
    }

    pub fn pressure_psi(&self) -> f64 {
        self.plant().pressure_psi
    }

    pub fn sensor(&self, sensor_type: SensorType, location: SensorLocation) -> SimSensor {
        SimSensor {
            stand: self.clone(),
            sensor_type,
            location,
        }
    }

    fn noise(&self) -> f64 {
        if self.config.noise_psi <= 0.0 {
            return 0.0;
        }
        let mut rng = rand::rng();
        rng.random_range(-self.config.noise_psi..self.config.noise_psi)
    }
}

impl ValveDriver for SimulatedStand {
    fn write(&mut self, valve_type: ValveType, location: ValveLocation, actuation: ActuationType) -> bool {
        if actuation == ActuationType::None {
            return false;
        }
        let now_ms = self.clock.now_ms();
        let mut plant = self.plant();
        let valve = plant.valves.entry((valve_type, location)).or_insert(SimValve {
            commanded: actuation,
            commanded_ms: now_ms,
            observed: None,
        });
        if valve.commanded != actuation {
            valve.commanded = actuation;
            valve.commanded_ms = now_ms;
        }
        tracing::debug!(?valve_type, ?location, ?actuation, "simulated valve commanded");
        true
    }

    fn observed(&mut self, valve_type: ValveType, location: ValveLocation) -> Option<ActuationType> {
        self.plant()
            .valves
            .get(&(valve_type, location))
            .and_then(|v| v.observed)
    }
}

pub struct SimSensor {
    stand: SimulatedStand,
    sensor_type: SensorType,
    location: SensorLocation,
}

impl SensorDevice for SimSensor {
    fn sensor_type(&self) -> SensorType {
        self.sensor_type
    }

    fn location(&self) -> SensorLocation {
        self.location
    }

    fn read(&mut self) -> Result<Vec<u8>, DeviceError> {
        let psi = match (self.sensor_type, self.location) {
            (SensorType::Pressure, SensorLocation::PT2) => self.stand.pressure_psi(),
            (SensorType::Pressure, _) => self.stand.config.ambient_psi,
            _ => {
                return Err(DeviceError::Unavailable(format!(
                    "{:?} {:?}",
                    self.sensor_type, self.location
                )));
            }
        };
        let value = (psi + self.stand.noise()) as f32;
        Ok(value.to_le_bytes().to_vec())
    }
}

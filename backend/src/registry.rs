use crate::store::{LookupError, PutError, Reading, Schema, SchemaError, Store, Value, ValueKind};
use engine_control_shared::{
    ActuationType, LogEntry, SensorLocation, SensorType, Stage, Status, ValveLocation, ValveType,
};
use serde::Serialize;

/// Keys of observed and derived system state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum RegistryKey {
    /// Current stage, written by the sequencer.
    Stage,
    /// Completion of the current stage in percent.
    StageStatus,
    SensorMeasured {
        sensor_type: SensorType,
        location: SensorLocation,
    },
    SensorNormalized {
        sensor_type: SensorType,
        location: SensorLocation,
    },
    SensorStatus {
        sensor_type: SensorType,
        location: SensorLocation,
    },
    /// Actuation the valve hardware last reported.
    ValveActuation {
        valve_type: ValveType,
        location: ValveLocation,
    },
    TelemetryQueue,
}

impl RegistryKey {
    pub fn normalized(sensor_type: SensorType, location: SensorLocation) -> Self {
        RegistryKey::SensorNormalized {
            sensor_type,
            location,
        }
    }

    pub fn valve(valve_type: ValveType, location: ValveLocation) -> Self {
        RegistryKey::ValveActuation {
            valve_type,
            location,
        }
    }
}

/// Default schema: one channel per sensor and valve the domain enums know about.
pub fn default_schema() -> Result<Schema<RegistryKey>, SchemaError> {
    let mut schema = Schema::new()
        .declare(RegistryKey::Stage, ValueKind::Stage)?
        .declare(RegistryKey::StageStatus, ValueKind::Float)?
        .declare(RegistryKey::TelemetryQueue, ValueKind::Logs)?;

    for sensor_type in SensorType::ALL {
        for location in SensorLocation::ALL {
            schema = schema
                .declare(
                    RegistryKey::SensorMeasured {
                        sensor_type,
                        location,
                    },
                    ValueKind::Float,
                )?
                .declare(RegistryKey::normalized(sensor_type, location), ValueKind::Float)?
                .declare(
                    RegistryKey::SensorStatus {
                        sensor_type,
                        location,
                    },
                    ValueKind::Status,
                )?;
        }
    }

    for valve_type in ValveType::ALL {
        for location in ValveLocation::ALL {
            schema = schema.declare(RegistryKey::valve(valve_type, location), ValueKind::Actuation)?;
        }
    }

    Ok(schema)
}

/// Shared store of observed state: sensor readings, valve feedback, stage and status.
#[derive(Debug)]
pub struct Registry {
    store: Store<RegistryKey>,
}

impl Registry {
    pub fn new(schema: Schema<RegistryKey>) -> Self {
        Self {
            store: Store::new(schema),
        }
    }

    pub fn with_default_schema() -> Result<Self, SchemaError> {
        Ok(Self::new(default_schema()?))
    }

    pub fn put(&self, key: RegistryKey, value: Value) -> Result<(), PutError> {
        self.store.put(&key, value)
    }

    pub fn get(&self, key: RegistryKey) -> Result<Reading, LookupError> {
        self.store.get(&key)
    }

    pub fn snapshot(&self) -> Vec<(RegistryKey, Reading)> {
        self.store.snapshot()
    }

    pub fn stage(&self) -> Result<Option<Stage>, LookupError> {
        Ok(self.get(RegistryKey::Stage)?.value.and_then(|v| v.as_stage()))
    }

    pub fn put_stage(&self, stage: Stage) -> Result<(), PutError> {
        self.put(RegistryKey::Stage, Value::Stage(stage))
    }

    pub fn stage_status(&self) -> Result<Option<f64>, LookupError> {
        Ok(self
            .get(RegistryKey::StageStatus)?
            .value
            .and_then(|v| v.as_float()))
    }

    pub fn put_stage_status(&self, status: f64) -> Result<(), PutError> {
        self.put(RegistryKey::StageStatus, Value::Float(status))
    }

    pub fn sensor_normalized(
        &self,
        sensor_type: SensorType,
        location: SensorLocation,
    ) -> Result<Option<f64>, LookupError> {
        Ok(self
            .get(RegistryKey::normalized(sensor_type, location))?
            .value
            .and_then(|v| v.as_float()))
    }

    pub fn put_sensor(
        &self,
        sensor_type: SensorType,
        location: SensorLocation,
        measured: f64,
        normalized: f64,
    ) -> Result<(), PutError> {
        self.put(
            RegistryKey::SensorMeasured {
                sensor_type,
                location,
            },
            Value::Float(measured),
        )?;
        self.put(RegistryKey::normalized(sensor_type, location), Value::Float(normalized))
    }

    pub fn sensor_status(
        &self,
        sensor_type: SensorType,
        location: SensorLocation,
    ) -> Result<Option<Status>, LookupError> {
        Ok(self
            .get(RegistryKey::SensorStatus {
                sensor_type,
                location,
            })?
            .value
            .and_then(|v| v.as_status()))
    }

    pub fn put_sensor_status(
        &self,
        sensor_type: SensorType,
        location: SensorLocation,
        status: Status,
    ) -> Result<(), PutError> {
        self.put(
            RegistryKey::SensorStatus {
                sensor_type,
                location,
            },
            Value::Status(status),
        )
    }

    pub fn valve_actuation(
        &self,
        valve_type: ValveType,
        location: ValveLocation,
    ) -> Result<Option<ActuationType>, LookupError> {
        Ok(self
            .get(RegistryKey::valve(valve_type, location))?
            .value
            .and_then(|v| v.as_actuation()))
    }

    pub fn put_valve_actuation(
        &self,
        valve_type: ValveType,
        location: ValveLocation,
        actuation: ActuationType,
    ) -> Result<(), PutError> {
        self.put(RegistryKey::valve(valve_type, location), Value::Actuation(actuation))
    }

    /// Queues a telemetry record for the drain task.
    pub fn enqueue(&self, log: LogEntry) -> Result<(), PutError> {
        self.store.append_log(&RegistryKey::TelemetryQueue, log)
    }

    pub fn take_telemetry(&self) -> Result<Vec<LogEntry>, LookupError> {
        self.store.take_logs(&RegistryKey::TelemetryQueue)
    }
}

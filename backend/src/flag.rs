use crate::store::{LookupError, PutError, Reading, Schema, SchemaError, Store, Value, ValueKind};
use engine_control_shared::{ActuationRequest, ValveLocation, ValveType};
use serde::Serialize;

/// Keys of requested state and cross-task signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum FlagKey {
    /// Operator approval to leave the current stage.
    Progress,
    /// Latest actuation requested for a valve, with its priority.
    Actuation {
        valve_type: ValveType,
        location: ValveLocation,
    },
}

impl FlagKey {
    pub fn valve(valve_type: ValveType, location: ValveLocation) -> Self {
        FlagKey::Actuation {
            valve_type,
            location,
        }
    }
}

pub fn default_schema() -> Result<Schema<FlagKey>, SchemaError> {
    let mut schema = Schema::new().declare(FlagKey::Progress, ValueKind::Bool)?;
    for valve_type in ValveType::ALL {
        for location in ValveLocation::ALL {
            schema = schema.declare(FlagKey::valve(valve_type, location), ValueKind::Request)?;
        }
    }
    Ok(schema)
}

/// Request channel between producers (sequencer, operator) and the actuation executor.
///
/// Last write wins. Conflicting requests are not resolved here; the priority travels in
/// the stored [`ActuationRequest`] and the executor decides which one governs.
#[derive(Debug)]
pub struct Flag {
    store: Store<FlagKey>,
}

/// A request together with the time it was posted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostedRequest {
    pub request: ActuationRequest,
    pub timestamp_ms: u64,
}

impl Flag {
    pub fn new(schema: Schema<FlagKey>) -> Self {
        Self {
            store: Store::new(schema),
        }
    }

    pub fn with_default_schema() -> Result<Self, SchemaError> {
        Ok(Self::new(default_schema()?))
    }

    pub fn put(&self, key: FlagKey, value: Value) -> Result<(), PutError> {
        self.store.put(&key, value)
    }

    pub fn get(&self, key: FlagKey) -> Result<Reading, LookupError> {
        self.store.get(&key)
    }

    pub fn snapshot(&self) -> Vec<(FlagKey, Reading)> {
        self.store.snapshot()
    }

    /// Unset reads as not approved.
    pub fn progress_approved(&self) -> Result<bool, LookupError> {
        Ok(self
            .get(FlagKey::Progress)?
            .value
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    pub fn set_progress(&self, approved: bool) -> Result<(), PutError> {
        self.put(FlagKey::Progress, Value::Bool(approved))
    }

    pub fn actuation_request(
        &self,
        valve_type: ValveType,
        location: ValveLocation,
    ) -> Result<Option<PostedRequest>, LookupError> {
        let reading = self.get(FlagKey::valve(valve_type, location))?;
        let request = reading.value.and_then(|v| v.as_request());
        Ok(request
            .zip(reading.timestamp_ms)
            .map(|(request, timestamp_ms)| PostedRequest {
                request,
                timestamp_ms,
            }))
    }

    pub fn request_actuation(
        &self,
        valve_type: ValveType,
        location: ValveLocation,
        request: ActuationRequest,
    ) -> Result<(), PutError> {
        self.put(FlagKey::valve(valve_type, location), Value::Request(request))
    }
}

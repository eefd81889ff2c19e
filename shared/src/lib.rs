use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Operational stages of a test, in the order the sequencer walks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Waiting,
    Pressurization,
    Autosequence,
    Postburn,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Waiting,
        Stage::Pressurization,
        Stage::Autosequence,
        Stage::Postburn,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Waiting => "waiting",
            Stage::Pressurization => "pressurization",
            Stage::Autosequence => "autosequence",
            Stage::Postburn => "postburn",
        }
    }

    /// Looks a stage up by its configuration name.
    pub fn from_name(name: &str) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| s.name() == name)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Thermocouple,
    Pressure,
    Load,
}

impl SensorType {
    pub const ALL: [SensorType; 3] = [SensorType::Thermocouple, SensorType::Pressure, SensorType::Load];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorLocation {
    #[serde(rename = "PT-1")]
    PT1,
    #[serde(rename = "PT-2")]
    PT2,
    #[serde(rename = "PT-3")]
    PT3,
    #[serde(rename = "PT-4")]
    PT4,
    #[serde(rename = "PT-5")]
    PT5,
    #[serde(rename = "PT-6")]
    PT6,
    #[serde(rename = "PT-7")]
    PT7,
    #[serde(rename = "PT-8")]
    PT8,
    #[serde(rename = "PT-P")]
    PTP,
}

impl SensorLocation {
    pub const ALL: [SensorLocation; 9] = [
        SensorLocation::PT1,
        SensorLocation::PT2,
        SensorLocation::PT3,
        SensorLocation::PT4,
        SensorLocation::PT5,
        SensorLocation::PT6,
        SensorLocation::PT7,
        SensorLocation::PT8,
        SensorLocation::PTP,
    ];
}

/// Health of a device channel as last reported by its ingest task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Working,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValveType {
    Solenoid,
    Ball,
}

impl ValveType {
    pub const ALL: [ValveType; 2] = [ValveType::Solenoid, ValveType::Ball];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValveLocation {
    Pressurization,
    PressureRelief,
    RemoteDrain,
    MainPropellantValve,
}

impl ValveLocation {
    pub const ALL: [ValveLocation; 4] = [
        ValveLocation::Pressurization,
        ValveLocation::PressureRelief,
        ValveLocation::RemoteDrain,
        ValveLocation::MainPropellantValve,
    ];
}

/// Commanded physical state of a valve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuationType {
    Pulse,
    OpenVent,
    CloseVent,
    None,
}

/// Priority attached to an actuation request.
///
/// Ordering follows the ranking table below, not declaration order:
///
/// | priority       | rank |
/// |----------------|------|
/// | `Abort`        | 0    |
/// | `MaxTelemetry` | 1    |
/// | `Pi`           | 2    |
/// | `Low`          | 3    |
/// | `None`         | 4    |
///
/// A lower rank is a stronger priority, so `Abort < Pi` under `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValvePriority {
    None,
    Low,
    Pi,
    MaxTelemetry,
    Abort,
}

impl ValvePriority {
    pub fn rank(&self) -> u8 {
        match self {
            ValvePriority::Abort => 0,
            ValvePriority::MaxTelemetry => 1,
            ValvePriority::Pi => 2,
            ValvePriority::Low => 3,
            ValvePriority::None => 4,
        }
    }

    /// True when `self` must govern over a competing request at `other`.
    pub fn outranks(&self, other: ValvePriority) -> bool {
        self.rank() < other.rank()
    }
}

impl Ord for ValvePriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for ValvePriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Desired actuation for one valve together with the priority it was requested at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuationRequest {
    pub actuation: ActuationType,
    pub priority: ValvePriority,
}

impl ActuationRequest {
    pub fn new(actuation: ActuationType, priority: ValvePriority) -> Self {
        Self { actuation, priority }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogPriority {
    Info,
    Crit,
}

/// Telemetry record queued for the downlink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp_ms: u64,
    pub header: String,
    pub priority: LogPriority,
    pub message: serde_json::Value,
}

/// Commands accepted from the operator interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum OperatorCommand {
    /// Approve progression to the next stage.
    Progress,
    /// Drive every valve to its abort position.
    Abort,
    Actuate {
        valve_type: ValveType,
        location: ValveLocation,
        actuation: ActuationType,
    },
    /// Drop the latched request for a valve so weaker priorities apply again.
    Release {
        valve_type: ValveType,
        location: ValveLocation,
    },
}

/// Valve positions commanded on abort.
pub const ABORT_STATE: [(ValveLocation, ActuationType); 4] = [
    (ValveLocation::Pressurization, ActuationType::CloseVent),
    (ValveLocation::PressureRelief, ActuationType::OpenVent),
    (ValveLocation::MainPropellantValve, ActuationType::CloseVent),
    (ValveLocation::RemoteDrain, ActuationType::OpenVent),
];

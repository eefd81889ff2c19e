use crate::config::SensorChannel;
use crate::registry::Registry;
use engine_control_shared::{SensorLocation, SensorType, Status};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{Duration, MissedTickBehavior, interval};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    #[error("device {0} did not answer")]
    Unavailable(String),
    #[error("payload of {0} bytes is not a single little-endian f32")]
    BadPayload(usize),
    #[error("reading is not finite")]
    NotFinite,
}

/// One sensor channel on the stand.
pub trait SensorDevice: Send {
    fn sensor_type(&self) -> SensorType;
    fn location(&self) -> SensorLocation;
    /// Raw payload: one little-endian `f32`.
    fn read(&mut self) -> Result<Vec<u8>, DeviceError>;
}

pub fn decode_f32(bytes: &[u8]) -> Result<f32, DeviceError> {
    let chunk: [u8; 4] = bytes
        .try_into()
        .map_err(|_| DeviceError::BadPayload(bytes.len()))?;
    let value = f32::from_le_bytes(chunk);
    if !value.is_finite() {
        return Err(DeviceError::NotFinite);
    }
    Ok(value)
}

type Calibration = HashMap<(SensorType, SensorLocation), SensorChannel>;

/// Reads every sensor device and publishes measured, normalized and status channels.
pub struct SensorIngest {
    registry: Arc<Registry>,
    devices: Vec<Box<dyn SensorDevice>>,
    calibration: Calibration,
}

impl SensorIngest {
    pub fn new(
        registry: Arc<Registry>,
        devices: Vec<Box<dyn SensorDevice>>,
        channels: &[SensorChannel],
    ) -> Self {
        let calibration = channels
            .iter()
            .map(|c| ((c.sensor_type, c.location), *c))
            .collect();
        Self {
            registry,
            devices,
            calibration,
        }
    }

    pub fn poll_once(&mut self) {
        let Self {
            registry,
            devices,
            calibration,
        } = self;
        for device in devices.iter_mut() {
            let (sensor_type, location) = (device.sensor_type(), device.location());
            let reading = device.read().and_then(|bytes| decode_f32(&bytes));

            let previous = registry.sensor_status(sensor_type, location).ok().flatten();
            let result = match reading {
                Ok(raw) => {
                    if previous == Some(Status::Error) {
                        tracing::info!(?sensor_type, ?location, "sensor recovered");
                    }
                    let measured = f64::from(raw);
                    let normalized = calibration
                        .get(&(sensor_type, location))
                        .map_or(measured, |channel| channel.normalize(measured));
                    registry
                        .put_sensor(sensor_type, location, measured, normalized)
                        .and_then(|_| registry.put_sensor_status(sensor_type, location, Status::Working))
                }
                Err(e) => {
                    if previous != Some(Status::Error) {
                        tracing::warn!(?sensor_type, ?location, error = %e, "sensor read failed");
                    }
                    registry.put_sensor_status(sensor_type, location, Status::Error)
                }
            };
            if let Err(e) = result {
                tracing::error!(?sensor_type, ?location, error = %e, "sensor write rejected");
            }
        }
    }
}

pub async fn sensor_task(mut ingest: SensorIngest, period: Duration) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        ingest.poll_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSensor {
        location: SensorLocation,
        payload: Result<Vec<u8>, DeviceError>,
    }

    impl SensorDevice for FixedSensor {
        fn sensor_type(&self) -> SensorType {
            SensorType::Pressure
        }

        fn location(&self) -> SensorLocation {
            self.location
        }

        fn read(&mut self) -> Result<Vec<u8>, DeviceError> {
            self.payload.clone()
        }
    }

    #[test]
    fn decodes_a_single_le_float() {
        assert_eq!(decode_f32(&245.5f32.to_le_bytes()), Ok(245.5));
        assert_eq!(decode_f32(&[0, 1, 2]), Err(DeviceError::BadPayload(3)));
        assert_eq!(
            decode_f32(&f32::NAN.to_le_bytes()),
            Err(DeviceError::NotFinite)
        );
    }

    #[test]
    fn poll_publishes_calibrated_values_and_status() {
        let registry = Arc::new(Registry::with_default_schema().expect("registry"));
        let devices: Vec<Box<dyn SensorDevice>> = vec![
            Box::new(FixedSensor {
                location: SensorLocation::PT2,
                payload: Ok(100.0f32.to_le_bytes().to_vec()),
            }),
            Box::new(FixedSensor {
                location: SensorLocation::PT1,
                payload: Err(DeviceError::Unavailable("PT-1".to_string())),
            }),
        ];
        let channels = [SensorChannel {
            sensor_type: SensorType::Pressure,
            location: SensorLocation::PT2,
            scale: 2.0,
            offset: 5.0,
        }];

        let mut ingest = SensorIngest::new(registry.clone(), devices, &channels);
        ingest.poll_once();

        assert_eq!(
            registry
                .sensor_normalized(SensorType::Pressure, SensorLocation::PT2)
                .expect("declared"),
            Some(205.0)
        );
        assert_eq!(
            registry
                .sensor_status(SensorType::Pressure, SensorLocation::PT2)
                .expect("declared"),
            Some(Status::Working)
        );
        assert_eq!(
            registry
                .sensor_status(SensorType::Pressure, SensorLocation::PT1)
                .expect("declared"),
            Some(Status::Error)
        );
        assert_eq!(
            registry
                .sensor_normalized(SensorType::Pressure, SensorLocation::PT1)
                .expect("declared"),
            None
        );
    }
}

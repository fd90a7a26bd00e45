mod aggregate;
mod anomaly;
mod device;
mod feature;
mod reading;

pub use aggregate::{DailyAggregate, HourlyAggregate};
pub use anomaly::{Anomaly, AnomalyKind, Severity};
pub use device::{DeviceMetadata, ACTIVE_STATUS};
pub use feature::FeatureRow;
pub use reading::{RawReading, Reading};

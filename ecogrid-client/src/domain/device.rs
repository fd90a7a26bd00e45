use serde::{Deserialize, Serialize};

pub const ACTIVE_STATUS: &str = "active";

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub device_id: String,
    pub device_name: Option<String>,
    pub device_type: Option<String>,
    pub location: Option<String>,
    pub capacity_w: Option<f64>,
    pub status: String,
}

impl DeviceMetadata {
    pub fn is_active(&self) -> bool {
        self.status == ACTIVE_STATUS
    }
}

pub mod device_queries;
pub mod reading_queries;

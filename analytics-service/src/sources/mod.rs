pub mod csv_file;
pub mod memory;
pub mod ndjson_file;
pub mod questdb;

pub use csv_file::load_csv;
pub use memory::InMemoryReadingStore;
pub use ndjson_file::{load_devices_ndjson, load_ndjson};
pub use questdb::QuestDbReadingStore;

pub mod ndjson_dir;
pub mod questdb;

pub use ndjson_dir::NdjsonDirSink;
pub use questdb::QuestDbTableSink;

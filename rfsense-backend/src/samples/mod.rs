//! Sample records, their Avro schema and the wire framing nodes use to
//! push them to the collector.

mod framing;
mod record;
mod schema;

pub use framing::{read_frame, write_frame, FrameError, Framing};
pub use record::{PartitionKey, SampleConfig, SampleRecord, SampleTime};
pub use schema::{DecodeError, SampleSchema};

//! Avro codec for [`SampleRecord`] frames.
//!
//! Frames are bare Avro datums (no container header) written against the
//! bundled `sample.avsc`, which must match the producers' copy.

use apache_avro::{from_avro_datum, from_value, to_avro_datum, to_value, Schema};
use std::sync::Arc;

use super::{PartitionKey, SampleRecord};

const SAMPLE_SCHEMA: &str = include_str!("sample.avsc");

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("avro: {0}")]
    Avro(#[from] apache_avro::Error),
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
}

/// Parsed schema, shared between listener handlers and the store sink.
#[derive(Clone, Debug)]
pub struct SampleSchema {
    schema: Arc<Schema>,
}

impl SampleSchema {
    pub fn bundled() -> Result<Self, DecodeError> {
        Self::parse(SAMPLE_SCHEMA)
    }

    pub fn parse(document: &str) -> Result<Self, DecodeError> {
        Ok(Self {
            schema: Arc::new(Schema::parse_str(document)?),
        })
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<SampleRecord, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        let mut reader = bytes;
        let value = from_avro_datum(&self.schema, &mut reader, None)?;
        if !reader.is_empty() {
            return Err(DecodeError::TrailingBytes(reader.len()));
        }
        Ok(from_value::<SampleRecord>(&value)?)
    }

    pub fn encode(&self, record: &SampleRecord) -> Result<Vec<u8>, DecodeError> {
        let value = to_value(record)?.resolve(&self.schema)?;
        Ok(to_avro_datum(&self.schema, value)?)
    }

    /// Decodes just far enough to build the storage partition of a frame.
    pub fn partition_key(&self, bytes: &[u8]) -> Result<PartitionKey, DecodeError> {
        Ok(self.decode(bytes)?.partition_key())
    }
}

//! Chunk encode/decode for record batch transfers.
//!
//! A batch is serialized once with the Arrow IPC stream format and the
//! resulting buffer split into size-bounded chunks. Each chunk carries its
//! own CRC-32 so a corrupt chunk is detectable without buffering the whole
//! transfer on the sending side.

use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use data_types::{EngineError, QueryId};
use generated_types::stratus::exchange::v1::{Chunk, Compression};
use snafu::{ensure, ResultExt, Snafu};
use std::io::Cursor;
use stratus_time::Time;

/// Default upper bound for one chunk payload.
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 4 * 1024 * 1024;

/// Hard cap for one chunk payload; configured values above this are clamped.
pub const MAX_CHUNK_BYTES_CAP: usize = 16 * 1024 * 1024;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Error serializing record batch: {}", source))]
    SerializeBatch { source: arrow::error::ArrowError },

    #[snafu(display("Error deserializing record batch: {}", source))]
    DeserializeBatch { source: arrow::error::ArrowError },

    #[snafu(display("Cannot decode an empty chunk sequence"))]
    EmptyTransfer,

    #[snafu(display(
        "Checksum mismatch on chunk {}: expected {:#010x}, got {:#010x}",
        index,
        expected,
        actual
    ))]
    ChecksumMismatch {
        index: u32,
        expected: u32,
        actual: u32,
    },

    #[snafu(display("Chunk sequence has a gap at index {}", index))]
    MissingChunk { index: u32 },

    #[snafu(display("Duplicate chunk index {}", index))]
    DuplicateChunk { index: u32 },

    #[snafu(display("Chunk {} is marked last but {} chunks were sent", index, total))]
    MisplacedLast { index: u32, total: usize },

    #[snafu(display("Chunk sequence has no chunk marked last"))]
    NoLastChunk,

    #[snafu(display(
        "Schema descriptor mismatch within one transfer: {} vs {}",
        first,
        other
    ))]
    SchemaDescriptorMismatch { first: String, other: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<Error> for EngineError {
    fn from(e: Error) -> Self {
        match &e {
            Error::SerializeBatch { .. } | Error::DeserializeBatch { .. } => {
                Self::internal(e.to_string())
            }
            // every sequence/checksum violation is a corrupt transfer:
            // non-retryable for this transfer, retried at stage level
            _ => Self::corrupt_transfer(e.to_string()),
        }
    }
}

/// Identity of one transfer, stamped onto every chunk.
#[derive(Debug, Clone)]
pub struct TransferMeta {
    pub transfer_id: String,
    pub query_id: QueryId,
    pub stage_id: u64,
    pub partition_id: u64,
    pub timestamp: Time,
}

/// A short stable digest of a batch schema, attached to every chunk so the
/// receiver can detect a transfer spliced from different producers.
pub fn schema_descriptor(schema: &arrow::datatypes::Schema) -> String {
    let mut rendered = String::new();
    for field in schema.fields() {
        rendered.push_str(field.name());
        rendered.push(':');
        rendered.push_str(&field.data_type().to_string());
        rendered.push(';');
    }
    format!("{:08x}", crc32fast::hash(rendered.as_bytes()))
}

/// Split `batch` into an ordered chunk sequence.
///
/// Every chunk carries the schema descriptor and a CRC-32 over its payload;
/// the final chunk is flagged `is_last`. An empty batch still produces one
/// chunk so the receiver learns the schema.
pub fn encode(
    batch: &RecordBatch,
    meta: &TransferMeta,
    max_chunk_bytes: usize,
) -> Result<Vec<Chunk>> {
    let max_chunk_bytes = max_chunk_bytes.clamp(1, MAX_CHUNK_BYTES_CAP);

    let mut buffer = Vec::new();
    {
        let mut writer =
            StreamWriter::try_new(&mut buffer, &batch.schema()).context(SerializeBatchSnafu)?;
        writer.write(batch).context(SerializeBatchSnafu)?;
        writer.finish().context(SerializeBatchSnafu)?;
    }

    let descriptor = schema_descriptor(&batch.schema());
    let total = buffer.len();
    let chunk_count = (total + max_chunk_bytes - 1) / max_chunk_bytes;
    let chunk_count = chunk_count.max(1);

    let mut chunks = Vec::with_capacity(chunk_count);
    for (index, payload) in buffer.chunks(max_chunk_bytes).enumerate() {
        chunks.push(Chunk {
            transfer_id: meta.transfer_id.clone(),
            query_id: meta.query_id.to_string(),
            stage_id: meta.stage_id,
            partition_id: meta.partition_id,
            index: index as u32,
            is_last: false,
            schema_descriptor: descriptor.clone(),
            payload: payload.to_vec(),
            payload_uncompressed_size: payload.len() as u64,
            compression: Compression::None as i32,
            checksum: crc32fast::hash(payload),
            timestamp_millis: meta.timestamp.timestamp_millis(),
        });
    }

    if let Some(last) = chunks.last_mut() {
        last.is_last = true;
    }

    Ok(chunks)
}

/// Reassemble a chunk sequence into the record batch it was encoded from.
///
/// Chunks may arrive in any order in the buffer. Validates, in order:
/// per-chunk checksum, schema descriptor agreement, index contiguity from 0
/// with no duplicates, and exactly one trailing `is_last`.
pub fn decode(mut chunks: Vec<Chunk>) -> Result<RecordBatch> {
    ensure!(!chunks.is_empty(), EmptyTransferSnafu);

    chunks.sort_by_key(|c| c.index);

    let descriptor = chunks[0].schema_descriptor.clone();
    for chunk in &chunks {
        let actual = crc32fast::hash(&chunk.payload);
        ensure!(
            actual == chunk.checksum,
            ChecksumMismatchSnafu {
                index: chunk.index,
                expected: chunk.checksum,
                actual,
            }
        );
        ensure!(
            chunk.schema_descriptor == descriptor,
            SchemaDescriptorMismatchSnafu {
                first: descriptor.clone(),
                other: chunk.schema_descriptor.clone(),
            }
        );
    }

    let total = chunks.len();
    for (expected, chunk) in chunks.iter().enumerate() {
        let expected = expected as u32;
        if chunk.index > expected {
            return MissingChunkSnafu { index: expected }.fail();
        }
        ensure!(chunk.index == expected, DuplicateChunkSnafu { index: chunk.index });

        let should_be_last = expected as usize == total - 1;
        if chunk.is_last != should_be_last {
            if chunk.is_last {
                return MisplacedLastSnafu {
                    index: chunk.index,
                    total,
                }
                .fail();
            }
            // the highest index must carry the marker
            return NoLastChunkSnafu.fail();
        }
    }

    let mut buffer = Vec::with_capacity(chunks.iter().map(|c| c.payload.len()).sum());
    for chunk in &chunks {
        buffer.extend_from_slice(&chunk.payload);
    }

    let reader =
        StreamReader::try_new(Cursor::new(buffer), None).context(DeserializeBatchSnafu)?;
    let schema = reader.schema();
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.context(DeserializeBatchSnafu)?);
    }

    match batches.len() {
        0 => Ok(RecordBatch::new_empty(schema)),
        1 => Ok(batches.remove(0)),
        _ => arrow::compute::concat_batches(&schema, &batches).context(DeserializeBatchSnafu),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn test_batch(rows: usize) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("category", DataType::Utf8, true),
        ]));
        let ids = Int64Array::from_iter_values(0..rows as i64);
        let categories =
            StringArray::from_iter((0..rows).map(|i| Some(format!("cat-{}", i % 3))));
        RecordBatch::try_new(schema, vec![Arc::new(ids), Arc::new(categories)]).unwrap()
    }

    fn test_meta() -> TransferMeta {
        TransferMeta {
            transfer_id: "t-1".to_string(),
            query_id: QueryId::new("q-1"),
            stage_id: 2,
            partition_id: 3,
            timestamp: Time::from_timestamp_millis(1_000),
        }
    }

    #[test]
    fn round_trip_single_chunk() {
        let batch = test_batch(100);
        let chunks = encode(&batch, &test_meta(), DEFAULT_MAX_CHUNK_BYTES).unwrap();

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_last);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].partition_id, 3);

        let decoded = decode(chunks).unwrap();
        assert_eq!(decoded.schema(), batch.schema());
        assert_eq!(decoded, batch);
    }

    #[test]
    fn round_trip_many_chunks() {
        let batch = test_batch(500);
        let chunks = encode(&batch, &test_meta(), 128).unwrap();

        assert!(chunks.len() > 3, "got {} chunks", chunks.len());
        assert!(chunks.iter().rev().skip(1).all(|c| !c.is_last));
        assert!(chunks.last().unwrap().is_last);
        let indices: Vec<_> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, (0..chunks.len() as u32).collect::<Vec<_>>());

        let decoded = decode(chunks).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn round_trip_empty_batch() {
        let batch = test_batch(0);
        let chunks = encode(&batch, &test_meta(), DEFAULT_MAX_CHUNK_BYTES).unwrap();
        assert_eq!(chunks.len(), 1);

        let decoded = decode(chunks).unwrap();
        assert_eq!(decoded.num_rows(), 0);
        assert_eq!(decoded.schema(), batch.schema());
    }

    #[test]
    fn unsorted_chunks_are_accepted() {
        let batch = test_batch(500);
        let mut chunks = encode(&batch, &test_meta(), 128).unwrap();
        chunks.reverse();

        let decoded = decode(chunks).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn corrupted_payload_is_detected() {
        let batch = test_batch(500);
        let mut chunks = encode(&batch, &test_meta(), 128).unwrap();
        chunks[2].payload[0] ^= 0xff;

        let err = decode(chunks).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { index: 2, .. }), "{err}");

        let engine: EngineError = err.into();
        assert_eq!(engine.kind(), data_types::ErrorKind::CorruptTransfer);
    }

    #[test]
    fn gap_is_detected() {
        let batch = test_batch(500);
        let mut chunks = encode(&batch, &test_meta(), 128).unwrap();
        chunks.remove(1);

        let err = decode(chunks).unwrap_err();
        assert!(matches!(err, Error::MissingChunk { index: 1 }), "{err}");
    }

    #[test]
    fn duplicate_is_detected() {
        let batch = test_batch(500);
        let mut chunks = encode(&batch, &test_meta(), 128).unwrap();
        let dup = chunks[1].clone();
        chunks.insert(1, dup);

        let err = decode(chunks).unwrap_err();
        assert!(matches!(err, Error::DuplicateChunk { index: 1 }), "{err}");
    }

    #[test]
    fn missing_last_marker_is_detected() {
        let batch = test_batch(500);
        let mut chunks = encode(&batch, &test_meta(), 128).unwrap();
        chunks.last_mut().unwrap().is_last = false;

        let err = decode(chunks).unwrap_err();
        assert!(matches!(err, Error::NoLastChunk), "{err}");
    }

    #[test]
    fn early_last_marker_is_detected() {
        let batch = test_batch(500);
        let mut chunks = encode(&batch, &test_meta(), 128).unwrap();
        chunks[1].is_last = true;

        let err = decode(chunks).unwrap_err();
        assert!(matches!(err, Error::MisplacedLast { index: 1, .. }), "{err}");
    }

    #[test]
    fn empty_sequence_is_rejected() {
        let err = decode(vec![]).unwrap_err();
        assert!(matches!(err, Error::EmptyTransfer), "{err}");
    }

    #[test]
    fn descriptor_is_stable_and_schema_sensitive() {
        let a = schema_descriptor(&test_batch(1).schema());
        let b = schema_descriptor(&test_batch(500).schema());
        assert_eq!(a, b);

        let other = Schema::new(vec![Field::new("x", DataType::Float64, false)]);
        assert_ne!(a, schema_descriptor(&other));
    }

    #[test]
    fn oversized_chunk_limit_is_clamped() {
        let batch = test_batch(10);
        let chunks = encode(&batch, &test_meta(), usize::MAX).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].payload.len() <= MAX_CHUNK_BYTES_CAP);
    }
}

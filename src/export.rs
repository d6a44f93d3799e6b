//! Arrow export of query results.
//!
//! Query results are small ordered series; columnar consumers get them as a
//! two-column [`RecordBatch`] and as an Arrow IPC stream.

use crate::error::Result;
use crate::record::Point;
use crate::storage::to_micros;
use arrow::array::{Float64Array, TimestampMicrosecondArray};
use arrow::record_batch::RecordBatch;
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::ipc::writer::StreamWriter;
use lazy_static::lazy_static;
use std::sync::Arc;

lazy_static! {
    /// Schema of an exported series:
    /// - timestamp (Timestamp µs, UTC)
    /// - value (Float64)
    pub static ref POINTS_SCHEMA: Arc<Schema> = Arc::new(Schema::new(vec![
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false
        ),
        Field::new("value", DataType::Float64, false),
    ]));
}

/// Converts ordered points into a record batch using [`POINTS_SCHEMA`].
pub fn points_to_record_batch(points: &[Point]) -> Result<RecordBatch> {
    let mut timestamps = Vec::with_capacity(points.len());
    let mut values = Vec::with_capacity(points.len());
    for point in points {
        timestamps.push(to_micros(point.timestamp));
        values.push(point.value);
    }

    Ok(RecordBatch::try_new(
        POINTS_SCHEMA.clone(),
        vec![
            Arc::new(TimestampMicrosecondArray::from(timestamps).with_timezone("UTC")),
            Arc::new(Float64Array::from(values)),
        ],
    )?)
}

/// Encodes a batch as a complete Arrow IPC stream (schema, batch, end marker).
pub fn encode_ipc(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buffer, batch.schema().as_ref())?;
        writer.write(batch)?;
        writer.finish()?;
    }
    Ok(buffer)
}

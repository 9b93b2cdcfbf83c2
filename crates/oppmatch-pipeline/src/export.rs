//! Parquet snapshot of a reconciler run's records.

use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use oppmatch_core::MatchResult;
use oppmatch_storage::sha256_hex;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub name: String,
    pub key: String,
    pub sha256: String,
    pub bytes: u64,
}

impl SnapshotFile {
    pub fn describe(name: &str, key: &str, body: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            key: key.to_string(),
            sha256: sha256_hex(body),
            bytes: body.len() as u64,
        }
    }
}

fn records_schema() -> Schema {
    Schema::new(vec![
        ArrowField::new("solicitation_id", DataType::Utf8, false),
        ArrowField::new("opportunity_id", DataType::Utf8, false),
        ArrowField::new("processed_timestamp", DataType::Utf8, false),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("match_threshold", DataType::Float64, false),
        ArrowField::new("match_score", DataType::Float64, false),
        ArrowField::new("is_match", DataType::Boolean, false),
        ArrowField::new("citation_count", DataType::UInt32, false),
        ArrowField::new("title", DataType::Utf8, true),
        ArrowField::new("agency", DataType::Utf8, true),
        ArrowField::new("error_stage", DataType::Utf8, true),
    ])
}

fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}

/// Encode one row per result into an in-memory Parquet file.
pub fn encode_records(records: &[MatchResult]) -> Result<Vec<u8>> {
    let schema = Arc::new(records_schema());
    let timestamps = records
        .iter()
        .map(|r| r.processed_timestamp.to_rfc3339())
        .collect::<Vec<_>>();
    let error_stages = records
        .iter()
        .map(|r| r.error.as_ref().map(|e| e.stage.to_string()))
        .collect::<Vec<_>>();

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(
                records.iter().map(|r| r.solicitation_id.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records.iter().map(|r| r.opportunity_id.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                timestamps.iter().map(String::as_str).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records.iter().map(|r| r.category.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                records.iter().map(|r| r.match_threshold).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                records.iter().map(|r| r.match_score).collect::<Vec<_>>(),
            )),
            Arc::new(BooleanArray::from(
                records.iter().map(|r| r.is_match).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                records
                    .iter()
                    .map(|r| r.citations.len() as u32)
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records
                    .iter()
                    .map(|r| non_empty(&r.opportunity_summary.title))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                records
                    .iter()
                    .map(|r| non_empty(&r.opportunity_summary.agency))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                error_stages.iter().map(|s| s.as_deref()).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building match results record batch")?;

    let mut buffer = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buffer, schema, None).context("opening parquet writer")?;
    writer.write(&batch).context("writing match results record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use oppmatch_core::{Assessment, ExtractedSummary, ProcessingError, Stage};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    #[test]
    fn snapshot_has_one_row_per_record() {
        let at = Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).single().unwrap();
        let records = vec![
            MatchResult::scored(
                "SOL-1",
                "opp-1",
                at,
                0.7,
                ExtractedSummary {
                    title: "Cloud migration".into(),
                    ..Default::default()
                },
                Assessment {
                    match_score: 0.8,
                    rationale: "fit".into(),
                    ..Default::default()
                },
            ),
            MatchResult::failed(
                "SOL-2",
                "opp-2",
                at,
                0.7,
                None,
                &ProcessingError::transient(Stage::Scoring, "timeout"),
            ),
        ];

        let bytes = encode_records(&records).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(bytes::Bytes::from(bytes))
            .unwrap()
            .build()
            .unwrap();
        let rows: usize = reader.map(|batch| batch.unwrap().num_rows()).sum();
        assert_eq!(rows, 2);
    }

    #[test]
    fn empty_runs_still_encode() {
        let bytes = encode_records(&[]).unwrap();
        assert!(bytes.starts_with(b"PAR1"));
        let file = SnapshotFile::describe("records", "summaries/x.parquet", &bytes);
        assert_eq!(file.bytes, bytes.len() as u64);
        assert_eq!(file.sha256.len(), 64);
    }
}

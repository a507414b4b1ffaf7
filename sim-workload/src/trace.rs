use std::path::Path;

use sim_types::{Request, RequestId, Tick};

use crate::{WorkloadError, WorkloadSource};

/// Ingests a CSV trace: one row per request,
/// `(arrival_seconds, _ignored, _ignored, prefill_tokens_json, decode_tokens_json)`.
/// A structurally malformed file (any row failing to parse as CSV at
/// all) is fatal at load time and never yields a partial result. A row
/// that parses as CSV but whose token columns are not valid JSON arrays
/// is dropped individually and logged, since that is a data-quality
/// defect in one row, not a broken file.
pub struct TraceFileSource {
    requests: Vec<Request>,
}

impl TraceFileSource {
    pub fn from_path(path: impl AsRef<Path>, horizon: Tick) -> Result<Self, WorkloadError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path.as_ref())
            .map_err(|e| WorkloadError::Io(e.to_string()))?;

        let mut requests = Vec::new();
        for (row_index, record) in reader.records().enumerate() {
            let record = record.map_err(|e| WorkloadError::MalformedTrace(e.to_string()))?;
            if record.len() < 5 {
                return Err(WorkloadError::MalformedTrace(format!(
                    "row {row_index} has {} fields, expected 5",
                    record.len()
                )));
            }

            let Some(req) = parse_row(row_index, &record, horizon) else {
                continue;
            };
            requests.push(req);
        }

        requests.sort_by(|a, b| a.arrival_tick.cmp(&b.arrival_tick));
        Ok(Self { requests })
    }
}

fn parse_row(row_index: usize, record: &csv::StringRecord, horizon: Tick) -> Option<Request> {
    let arrival_seconds: f64 = match record[0].trim().parse() {
        Ok(v) => v,
        Err(_) => {
            tracing::debug!(row_index, field = &record[0], "unparseable arrival_seconds, dropping row");
            return None;
        }
    };
    let arrival_tick = (arrival_seconds * 1_000_000.0).round() as Tick;
    if arrival_tick > horizon {
        tracing::debug!(row_index, arrival_tick, horizon, "arrival beyond horizon, dropping row");
        return None;
    }

    let prefill: Vec<u32> = match serde_json::from_str(&record[3]) {
        Ok(v) => v,
        Err(_) => {
            tracing::debug!(row_index, "malformed prefill_tokens_json, dropping row");
            return None;
        }
    };
    let decode: Vec<u32> = match serde_json::from_str(&record[4]) {
        Ok(v) => v,
        Err(_) => {
            tracing::debug!(row_index, "malformed decode_tokens_json, dropping row");
            return None;
        }
    };

    Some(Request::new(
        RequestId::from(format!("trace-{row_index}")),
        arrival_tick,
        prefill,
        decode,
    ))
}

impl WorkloadSource for TraceFileSource {
    fn generate(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.requests)
    }
}

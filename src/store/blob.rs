// BLOB version prefix helpers. [version: u8][payload].

use crate::error::{Result, RollupError};
use crate::models::TaskRecord;

pub(super) const TASK_RECORD_VERSION: u8 = 1;

fn with_version_prefix(version: u8, payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(version);
    out.extend_from_slice(&payload);
    out
}

/// Payload after the version byte, or `None` when the version does not match.
fn versioned_payload(bytes: &[u8], expected_version: u8) -> Option<&[u8]> {
    match bytes.split_first() {
        Some((v, rest)) if *v == expected_version => Some(rest),
        _ => None,
    }
}

pub(super) fn encode_task_record(record: &TaskRecord) -> Result<Vec<u8>> {
    let payload = wincode::serialize(record).map_err(|e| RollupError::Blob {
        reason: format!("wincode task record: {}", e),
    })?;
    Ok(with_version_prefix(TASK_RECORD_VERSION, payload))
}

pub(super) fn decode_task_record(bytes: &[u8]) -> Result<TaskRecord> {
    let payload =
        versioned_payload(bytes, TASK_RECORD_VERSION).ok_or_else(|| RollupError::Blob {
            reason: format!(
                "task record blob version {} (expected {})",
                bytes.first().copied().unwrap_or(0),
                TASK_RECORD_VERSION
            ),
        })?;
    wincode::deserialize(payload).map_err(|e| RollupError::Blob {
        reason: format!("wincode deserialize task record: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskKind;

    #[test]
    fn unknown_version_is_rejected() {
        assert!(decode_task_record(&[]).is_err());
        assert!(decode_task_record(&[TASK_RECORD_VERSION + 1, 0, 0]).is_err());
    }

    #[test]
    fn encoded_record_starts_with_version_byte() {
        let record = TaskRecord {
            task_id: "aggregation:r1:1".into(),
            kind: TaskKind::Aggregation,
            subject: "r1".into(),
            stage: "PUBLISH_METRICS".into(),
            cursor: None,
            detail: Some("2 keys".into()),
            started_micros: 1,
            updated_micros: 2,
            expires_micros: 3,
        };
        let bytes = encode_task_record(&record).unwrap();
        assert_eq!(bytes[0], TASK_RECORD_VERSION);
        assert_eq!(decode_task_record(&bytes).unwrap(), record);
    }
}

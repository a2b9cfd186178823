use serde::Serialize;
use serde_json::Value;

use super::ApiError;

/// Platform identifier of an async job.
pub type JobId = String;

/// Coarse outcome of an async job as reported by `jobstatus`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum JobStatus {
    Pending,
    Succeeded,
    /// Any other status code; the platform only documents `2` but may add
    /// more failure states.
    Failed(i64),
}

impl JobStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => JobStatus::Pending,
            1 => JobStatus::Succeeded,
            other => JobStatus::Failed(other),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Pending)
    }
}

/// One entry of the platform's async job listing.
///
/// The typed fields are read out of the record for routing; the record
/// itself is kept untouched in `raw` so it can be flattened or republished
/// exactly as received.
#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    id: JobId,
    status: JobStatus,
    cmd: String,
    raw: Value,
}

impl Job {
    /// Build a job from one element of the listing. `jobid` and `jobstatus`
    /// are required; `cmd` defaults to empty.
    pub fn from_value(raw: Value) -> Result<Self, ApiError> {
        let record = raw
            .as_object()
            .ok_or_else(|| ApiError::InvalidJob(format!("expected an object, got {raw}")))?;

        let id = match record.get("jobid") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => return Err(ApiError::InvalidJob("missing `jobid`".into())),
        };
        let status = record
            .get("jobstatus")
            .and_then(Value::as_i64)
            .map(JobStatus::from_code)
            .ok_or_else(|| ApiError::InvalidJob(format!("job {id} has no numeric `jobstatus`")))?;
        let cmd = record
            .get("cmd")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            id,
            status,
            cmd,
            raw,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// The record as JSON bytes, for the queue.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_job_fields_are_read_from_the_record() -> Result<(), ApiError> {
        let job = Job::from_value(json!({
            "jobid": "J1",
            "jobstatus": 1,
            "cmd": "com.cloud.api.commands.DestroyVMCmd",
            "jobresult": {"virtualmachine": {"id": 5}},
        }))?;
        assert_eq!("J1", job.id());
        assert_eq!(JobStatus::Succeeded, job.status());
        assert_eq!("com.cloud.api.commands.DestroyVMCmd", job.cmd());
        assert_eq!(json!(5), job.raw()["jobresult"]["virtualmachine"]["id"]);
        Ok(())
    }

    #[test]
    fn test_status_codes() {
        assert!(JobStatus::from_code(0).is_pending());
        assert_eq!(JobStatus::Succeeded, JobStatus::from_code(1));
        assert_eq!(JobStatus::Failed(2), JobStatus::from_code(2));
    }

    #[test]
    fn test_numeric_job_ids_are_accepted() -> Result<(), ApiError> {
        let job = Job::from_value(json!({"jobid": 77, "jobstatus": 0}))?;
        assert_eq!("77", job.id());
        assert_eq!("", job.cmd());
        Ok(())
    }

    #[test]
    fn test_records_without_an_id_are_rejected() {
        let err = Job::from_value(json!({"jobstatus": 1})).unwrap_err();
        assert!(matches!(err, ApiError::InvalidJob(_)));
    }

    #[test]
    fn test_raw_record_round_trips_to_bytes() -> Result<(), Box<dyn std::error::Error>> {
        let raw = json!({"jobid": "J9", "jobstatus": 2, "extra": [1, 2]});
        let job = Job::from_value(raw.clone())?;
        let bytes = job.to_json_bytes()?;
        assert_eq!(raw, serde_json::from_slice::<Value>(&bytes)?);
        Ok(())
    }
}

//! Data exchanged between the coordinator, the queue and the sandbox service.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio_util::bytes::Bytes;

use crate::jrtp::{self, JrtpError, Payload};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Establishes reference artifacts and scores for a problem
    Audit,
    /// Evaluates a submission against previously audited references
    Judge,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid task JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("judgeScript must not be empty")]
    EmptyScript,
    #[error("url must be an absolute http(s) URL, got {0:?}")]
    InvalidUrl(String),
    #[error("info is required in judge mode")]
    MissingInfo,
}

/// One grading request sent to the sandbox service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Task {
    pub judge_record_id: i64,
    pub judge_script: String,
    pub mode: Mode,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<HashMap<String, String>>,
}

impl Task {
    /// Parses and validates a task received over the channel
    pub fn parse(raw: &[u8]) -> Result<Self, TaskError> {
        let task: Task = serde_json::from_slice(raw)?;
        task.validate()?;
        Ok(task)
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        if self.judge_script.trim().is_empty() {
            return Err(TaskError::EmptyScript);
        }
        let has_scheme = ["http://", "https://"]
            .iter()
            .any(|scheme| self.url.starts_with(scheme) && self.url.len() > scheme.len());
        if !has_scheme {
            return Err(TaskError::InvalidUrl(self.url.clone()));
        }
        if self.mode == Mode::Judge && self.info.is_none() {
            return Err(TaskError::MissingInfo);
        }
        Ok(())
    }
}

/// Best-effort extraction of the record id from a request that failed to parse.
pub fn peek_record_id(raw: &[u8]) -> Option<i64> {
    serde_json::from_slice::<serde_json::Value>(raw)
        .ok()?
        .get("judgeRecordId")?
        .as_i64()
}

/// File content inside a submitted snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum SnapshotFile {
    Text(String),
    Binary { base64: String },
}

/// Payload the external web application enqueues.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub judge_record_id: i64,
    pub judge_script: String,
    pub fs_snapshot: BTreeMap<String, SnapshotFile>,
    pub mode: Mode,
    pub problem_id: i64,
    pub user_id: i64,
    /// Declared total score of the problem, required for audit runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_score: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Pass => "pass",
            CheckStatus::Fail => "fail",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pass" => Some(CheckStatus::Pass),
            "fail" => Some(CheckStatus::Fail),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckPointResult {
    pub name: String,
    pub score: f64,
    pub total_score: f64,
    pub status: CheckStatus,
    pub details: String,
    pub cache_files: BTreeMap<String, Vec<u8>>,
}

impl CheckPointResult {
    pub fn new(
        name: String,
        score: f64,
        total_score: f64,
        details: String,
        cache_files: BTreeMap<String, Vec<u8>>,
    ) -> Self {
        let status = if score == total_score {
            CheckStatus::Pass
        } else {
            CheckStatus::Fail
        };
        Self {
            name,
            score,
            total_score,
            status,
            details,
            cache_files,
        }
    }

    /// A checkpoint whose handler raised an error
    pub fn failed(
        name: String,
        score: f64,
        total_score: f64,
        details: String,
        cache_files: BTreeMap<String, Vec<u8>>,
    ) -> Self {
        Self {
            name,
            score,
            total_score,
            status: CheckStatus::Fail,
            details,
            cache_files,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JudgeSummary {
    pub results: Vec<CheckPointResult>,
    pub total_score: f64,
    pub max_score: f64,
    pub status: CheckStatus,
    pub first_screen: Option<Vec<u8>>,
}

impl JudgeSummary {
    /// Aggregates checkpoint results.
    ///
    /// `max_score` is the best single checkpoint score, not the sum.
    pub fn from_results(results: Vec<CheckPointResult>, first_screen: Option<Vec<u8>>) -> Self {
        let total_score = results.iter().map(|r| r.score).sum();
        let max_score = results.iter().map(|r| r.score).fold(0.0, f64::max);
        let status = if results.iter().all(|r| r.status == CheckStatus::Pass) {
            CheckStatus::Pass
        } else {
            CheckStatus::Fail
        };
        Self {
            results,
            total_score,
            max_score,
            status,
            first_screen,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JudgeOutcome {
    Done(JudgeSummary),
    Error { message: String },
}

/// Reply of the sandbox service for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeReply {
    pub judge_record_id: i64,
    /// Milliseconds spent inside the sandbox service
    pub judge_time: u64,
    pub outcome: JudgeOutcome,
}

impl JudgeReply {
    pub fn error(judge_record_id: i64, judge_time: u64, message: impl Into<String>) -> Self {
        Self {
            judge_record_id,
            judge_time,
            outcome: JudgeOutcome::Error {
                message: message.into(),
            },
        }
    }

    pub fn encode(&self) -> Result<Bytes, JrtpError> {
        jrtp::pack(&self.to_payload()?)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, JrtpError> {
        Self::from_payload(&jrtp::unpack(frame)?)
    }

    pub fn to_payload(&self) -> Result<Payload, JrtpError> {
        let mut map = BTreeMap::new();
        map.insert(
            "judgeRecordId".to_string(),
            Payload::from(json!(self.judge_record_id)),
        );
        map.insert("judgeTime".to_string(), Payload::from(json!(self.judge_time)));

        match &self.outcome {
            JudgeOutcome::Error { message } => {
                map.insert("type".to_string(), Payload::from(json!("error")));
                map.insert("message".to_string(), Payload::from(json!(message)));
            }
            JudgeOutcome::Done(summary) => {
                map.insert("type".to_string(), Payload::from(json!("done")));
                map.insert(
                    "results".to_string(),
                    Payload::List(
                        summary
                            .results
                            .iter()
                            .map(result_to_payload)
                            .collect::<Result<_, _>>()?,
                    ),
                );
                map.insert(
                    "totalScore".to_string(),
                    number("totalScore", summary.total_score)?,
                );
                map.insert("maxScore".to_string(), number("maxScore", summary.max_score)?);
                map.insert(
                    "status".to_string(),
                    Payload::from(json!(summary.status.as_str())),
                );
                if let Some(screen) = &summary.first_screen {
                    map.insert("firstScreen".to_string(), Payload::Binary(screen.clone()));
                }
            }
        }

        Ok(Payload::Map(map))
    }

    pub fn from_payload(payload: &Payload) -> Result<Self, JrtpError> {
        let judge_record_id = field(payload, "judgeRecordId")?
            .as_i64()
            .ok_or_else(|| schema("judgeRecordId is not an integer"))?;
        let judge_time = field(payload, "judgeTime")?
            .as_u64()
            .ok_or_else(|| schema("judgeTime is not an unsigned integer"))?;
        let kind = field(payload, "type")?
            .as_str()
            .ok_or_else(|| schema("type is not a string"))?;

        let outcome = match kind {
            "error" => JudgeOutcome::Error {
                message: text(payload, "message")?,
            },
            "done" => {
                let results = field(payload, "results")?
                    .as_list()
                    .ok_or_else(|| schema("results is not a list"))?
                    .iter()
                    .map(result_from_payload)
                    .collect::<Result<Vec<_>, _>>()?;
                let first_screen = payload
                    .get("firstScreen")
                    .and_then(Payload::as_binary)
                    .map(<[u8]>::to_vec);
                JudgeOutcome::Done(JudgeSummary {
                    results,
                    total_score: float(payload, "totalScore")?,
                    max_score: float(payload, "maxScore")?,
                    status: status(payload)?,
                    first_screen,
                })
            }
            other => return Err(schema(&format!("unknown reply type {other:?}"))),
        };

        Ok(Self {
            judge_record_id,
            judge_time,
            outcome,
        })
    }
}

fn number(key: &str, value: f64) -> Result<Payload, JrtpError> {
    serde_json::Number::from_f64(value)
        .map(Payload::Number)
        .ok_or_else(|| schema(&format!("{key} {value} is not a finite number")))
}

fn result_to_payload(result: &CheckPointResult) -> Result<Payload, JrtpError> {
    let files = result
        .cache_files
        .iter()
        .map(|(name, bytes)| (name.clone(), Payload::Binary(bytes.clone())))
        .collect();

    let mut map = BTreeMap::new();
    map.insert("name".to_string(), Payload::from(json!(result.name)));
    map.insert("score".to_string(), number("score", result.score)?);
    map.insert(
        "totalScore".to_string(),
        number("totalScore", result.total_score)?,
    );
    map.insert(
        "status".to_string(),
        Payload::from(json!(result.status.as_str())),
    );
    map.insert("details".to_string(), Payload::from(json!(result.details)));
    map.insert("cacheFiles".to_string(), Payload::Map(files));
    Ok(Payload::Map(map))
}

fn result_from_payload(payload: &Payload) -> Result<CheckPointResult, JrtpError> {
    let cache_files = field(payload, "cacheFiles")?
        .as_map()
        .ok_or_else(|| schema("cacheFiles is not a map"))?
        .iter()
        .map(|(name, value)| {
            value
                .as_binary()
                .map(|bytes| (name.clone(), bytes.to_vec()))
                .ok_or_else(|| schema(&format!("cache file {name:?} is not binary")))
        })
        .collect::<Result<_, _>>()?;

    Ok(CheckPointResult {
        name: text(payload, "name")?,
        score: float(payload, "score")?,
        total_score: float(payload, "totalScore")?,
        status: status(payload)?,
        details: text(payload, "details")?,
        cache_files,
    })
}

fn schema(message: &str) -> JrtpError {
    JrtpError::Schema(message.to_string())
}

fn field<'a>(payload: &'a Payload, key: &str) -> Result<&'a Payload, JrtpError> {
    payload
        .get(key)
        .ok_or_else(|| schema(&format!("missing field {key:?}")))
}

fn text(payload: &Payload, key: &str) -> Result<String, JrtpError> {
    field(payload, key)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| schema(&format!("{key} is not a string")))
}

fn float(payload: &Payload, key: &str) -> Result<f64, JrtpError> {
    field(payload, key)?
        .as_f64()
        .ok_or_else(|| schema(&format!("{key} is not a number")))
}

fn status(payload: &Payload) -> Result<CheckStatus, JrtpError> {
    field(payload, "status")?
        .as_str()
        .and_then(CheckStatus::parse)
        .ok_or_else(|| schema("status must be \"pass\" or \"fail\""))
}

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Outcome of every public engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationResult {
    Success,
    /// A value was written.
    Set,
    /// `IgnoreIfPresent` found a live value and left it in place.
    Ignored,
    NotFound,
    Expired,
    InvalidAppend,
    NoCapacity,
    TooManyFound,
    SqlError,
    InitFailure,
    /// Empty or over-long key or value, a non-positive debit, or an inverted
    /// time range. Nothing was touched.
    InvalidArgument,
}

impl OperationResult {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationResult::Success => "success",
            OperationResult::Set => "set",
            OperationResult::Ignored => "ignored",
            OperationResult::NotFound => "not_found",
            OperationResult::Expired => "expired",
            OperationResult::InvalidAppend => "invalid_append",
            OperationResult::NoCapacity => "no_capacity",
            OperationResult::TooManyFound => "too_many_found",
            OperationResult::SqlError => "sql_error",
            OperationResult::InitFailure => "init_failure",
            OperationResult::InvalidArgument => "invalid_argument",
        }
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            OperationResult::SqlError
                | OperationResult::InitFailure
                | OperationResult::TooManyFound
                | OperationResult::InvalidArgument
        )
    }
}

impl std::fmt::Display for OperationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SetBehavior {
    #[default]
    Default,
    IgnoreIfPresent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetResult {
    pub value: Option<String>,
    pub last_used_time: Option<SystemTime>,
    pub result: OperationResult,
}

impl GetResult {
    pub(crate) fn status(result: OperationResult) -> Self {
        Self {
            value: None,
            last_used_time: None,
            result,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetResult {
    pub bits: f64,
    pub result: OperationResult,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeResult {
    pub time: Option<SystemTime>,
    pub result: OperationResult,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetadataResult {
    /// Live entries.
    pub length: i64,
    /// Live bytes.
    pub bytes_used: i64,
    pub remaining_budget: f64,
    pub creation_time: Option<SystemTime>,
    pub time_result: OperationResult,
    pub budget_result: OperationResult,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntriesResult {
    pub entries: Vec<(String, String)>,
    pub result: OperationResult,
}

/// One step of a batch update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ModifierMethod {
    Set {
        key: String,
        value: String,
        #[serde(default)]
        ignore_if_present: bool,
    },
    Append {
        key: String,
        value: String,
    },
    Delete {
        key: String,
    },
    Clear,
}

impl ModifierMethod {
    /// Results that let the batch continue.
    pub(crate) fn accepts(&self, result: OperationResult) -> bool {
        match self {
            ModifierMethod::Set { .. } => {
                matches!(result, OperationResult::Set | OperationResult::Ignored)
            }
            ModifierMethod::Append { .. } => result == OperationResult::Set,
            ModifierMethod::Delete { .. } | ModifierMethod::Clear => {
                result == OperationResult::Success
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchUpdateResult {
    pub overall_result: OperationResult,
    pub inner_method_results: Vec<OperationResult>,
}

/// Per-origin usage row, as listed by `fetch_origins`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OriginUsage {
    pub origin: String,
    pub num_bytes: i64,
    #[serde(with = "micros")]
    pub creation_time: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStatus {
    Unattempted,
    Success,
    Error,
    TooNew,
    TooOld,
    UpgradeFailed,
}

/// Whether a lazy initialization may create a store that does not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbCreationPolicy {
    IgnoreIfAbsent,
    CreateIfAbsent,
}

mod micros {
    use serde::Serializer;
    use std::time::SystemTime;

    pub fn serialize<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(crate::clock::to_micros(*time))
    }
}

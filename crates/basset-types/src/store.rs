//! Workflow store envelope and query types.
//!
//! Every workflow store operation answers with a [`StoreResponse`] instead of
//! raising, so callers on the other side of a process or network boundary see
//! a uniform `{success, data | error, timestamp}` shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Uniform result envelope returned by workflow store operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> StoreResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    /// Unwrap the envelope back into a `Result`.
    pub fn into_result(self) -> Result<T, String> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err("response carried no data".to_string()),
            (false, _) => Err(self.error.unwrap_or_else(|| "unknown error".to_string())),
        }
    }
}

impl<T, E: std::fmt::Display> From<Result<T, E>> for StoreResponse<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(data) => StoreResponse::ok(data),
            Err(e) => StoreResponse::err(e.to_string()),
        }
    }
}

/// Field a workflow listing is sorted by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Name,
    CreatedAt,
    #[default]
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Search, sort and pagination over stored workflows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowQuery {
    /// Case-insensitive substring matched against name, description and tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Every listed tag must be present.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub sort_by: SortField,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default)]
    pub offset: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_envelope_shape() {
        let resp = StoreResponse::ok(42);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"], 42);
        assert!(json.get("error").is_none());
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn test_err_envelope_into_result() {
        let resp: StoreResponse<u32> = StoreResponse::err("workflow not found: abc");
        assert!(!resp.success);
        assert_eq!(resp.into_result().unwrap_err(), "workflow not found: abc");
    }

    #[test]
    fn test_from_result() {
        let resp: StoreResponse<u32> = Err::<u32, String>("boom".to_string()).into();
        assert_eq!(resp.error.as_deref(), Some("boom"));
        let resp: StoreResponse<u32> = Ok::<u32, String>(7).into();
        assert_eq!(resp.into_result().unwrap(), 7);
    }

    #[test]
    fn test_query_defaults() {
        let q = WorkflowQuery::default();
        assert_eq!(q.sort_by, SortField::UpdatedAt);
        assert_eq!(q.order, SortOrder::Desc);
        assert_eq!(q.offset, 0);
    }
}

use serde::{Deserialize, Serialize};

use super::{ArbitraryJson, Item};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    #[default]
    InProgress,
    Completed,
    Cancelled,
    Failed,
    Incomplete,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Response {
    pub id: String,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub status: ResponseStatus,
    #[serde(default)]
    pub status_details: Option<ResponseStatusDetails>,
    #[serde(default)]
    pub output: Vec<Item>,
    /// Token accounting is passed through untouched.
    #[serde(default)]
    pub usage: Option<ArbitraryJson>,
}

impl Response {
    #[must_use]
    pub fn new(id: impl Into<String>, status: ResponseStatus) -> Self {
        Self {
            id: id.into(),
            status,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseStatusDetails {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub error: Option<crate::error::ServerError>,
}

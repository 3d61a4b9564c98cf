//! Core domain model for the tender ingestion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tenderwatch-core";

/// Affirmative-action set-aside category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AffirmativeActionType {
    Youth,
    Women,
    Pwds,
    #[default]
    None,
}

impl AffirmativeActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Youth => "youth",
            Self::Women => "women",
            Self::Pwds => "pwds",
            Self::None => "none",
        }
    }

    /// Lenient parse used when reading the store; unknown values map to `None`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "youth" => Self::Youth,
            "women" => Self::Women,
            "pwds" | "pwd" => Self::Pwds,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffirmativeAction {
    #[serde(rename = "type")]
    pub kind: AffirmativeActionType,
    pub percentage: i32,
    pub details: String,
}

impl AffirmativeAction {
    pub fn none() -> Self {
        Self {
            kind: AffirmativeActionType::None,
            percentage: 0,
            details: String::new(),
        }
    }
}

impl Default for AffirmativeAction {
    fn default() -> Self {
        Self::none()
    }
}

/// Which extraction strategy produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    SourceSpecific,
    ApiDiscovery,
    GenericTable,
}

/// Extracted, not-yet-deduplicated tender. Text fields are raw as found on the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenderDraft {
    pub source_id: String,
    pub title: String,
    pub reference: Option<String>,
    pub description: Option<String>,
    pub requirements: Option<String>,
    pub organization: Option<String>,
    pub deadline_text: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub location: Option<String>,
    pub tender_url: Option<String>,
    pub fee_text: Option<String>,
    pub prerequisites: Option<String>,
    pub extracted_by: ExtractionMethod,
    /// Selector, row index or JSON pointer the candidate was read from.
    pub selector_or_pointer: String,
}

impl TenderDraft {
    pub fn new(
        source_id: impl Into<String>,
        title: impl Into<String>,
        extracted_by: ExtractionMethod,
        selector_or_pointer: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            title: title.into(),
            reference: None,
            description: None,
            requirements: None,
            organization: None,
            deadline_text: None,
            category: None,
            subcategory: None,
            location: None,
            tender_url: None,
            fee_text: None,
            prerequisites: None,
            extracted_by,
            selector_or_pointer: selector_or_pointer.into(),
        }
    }
}

/// Canonical persisted tender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tender {
    pub id: Uuid,
    pub source_id: String,
    pub title: String,
    pub reference: Option<String>,
    pub description: String,
    pub requirements: String,
    pub deadline: DateTime<Utc>,
    pub contact: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub location: String,
    pub tender_url: Option<String>,
    pub fees: Option<String>,
    pub prerequisites: Option<String>,
    pub points_required: i32,
    pub affirmative_action: AffirmativeAction,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Queued unit of work for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: Uuid,
    pub source_id: String,
    pub status: JobStatus,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(Self::InProgress),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Audit record for one scrape invocation (whole pipeline, one source, or one child source).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRunLog {
    pub id: Uuid,
    pub source_name: String,
    pub status: RunStatus,
    pub records_found: i64,
    pub records_inserted: i64,
    pub details: Option<String>,
    pub error_message: Option<String>,
    pub parent_log_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The single terminal update applied to a run log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Success {
        records_found: i64,
        records_inserted: i64,
        details: Option<String>,
    },
    Error {
        message: String,
    },
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Success { .. } => RunStatus::Success,
            Self::Error { .. } => RunStatus::Error,
        }
    }
}

/// Downstream notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Webhook,
    Microblog,
    ChatBot,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Microblog => "microblog",
            Self::ChatBot => "chat_bot",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "webhook" => Some(Self::Webhook),
            "microblog" => Some(Self::Microblog),
            "chat_bot" => Some(Self::ChatBot),
            _ => None,
        }
    }
}

/// Write-once ledger row for one distribution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionRecord {
    pub id: Uuid,
    pub tender_id: Uuid,
    pub channel: Channel,
    pub success: bool,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affirmative_action_serializes_type_field() {
        let aa = AffirmativeAction {
            kind: AffirmativeActionType::Pwds,
            percentage: 30,
            details: "AGPO".into(),
        };
        let json = serde_json::to_value(&aa).unwrap();
        assert_eq!(json["type"], "pwds");
        assert_eq!(json["percentage"], 30);
    }

    #[test]
    fn status_strings_match_store_values() {
        for status in [
            JobStatus::Pending,
            JobStatus::InProgress,
            JobStatus::Completed,
            JobStatus::Error,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("in_progress"), Some(RunStatus::InProgress));
        assert_eq!(Channel::parse("chat_bot"), Some(Channel::ChatBot));
        assert_eq!(AffirmativeActionType::parse("PWD"), AffirmativeActionType::Pwds);
        assert_eq!(AffirmativeActionType::parse("other"), AffirmativeActionType::None);
    }
}

//! Date parsing, affirmative-action classification, and candidate normalization.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tenderwatch_core::{AffirmativeAction, AffirmativeActionType, Tender, TenderDraft};
use uuid::Uuid;

pub const DEFAULT_DEADLINE_DAYS: i64 = 14;
const AGPO_PERCENTAGE: i32 = 30;

static NUMERIC_DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,2})[/.\-](\d{1,2})[/.\-](\d{4})\b").expect("valid numeric date pattern")
});

static TEXTUAL_DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})(?:st|nd|rd|th)?\s+([a-z]{3,9})\.?,?\s+(\d{4})\b")
        .expect("valid textual date pattern")
});

const NATIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

fn month_number(name: &str) -> Option<u32> {
    let lower = name.to_ascii_lowercase();
    let month = match lower.as_str() {
        "jan" | "january" => 1,
        "feb" | "february" => 2,
        "mar" | "march" => 3,
        "apr" | "april" => 4,
        "may" => 5,
        "jun" | "june" => 6,
        "jul" | "july" => 7,
        "aug" | "august" => 8,
        "sep" | "sept" | "september" => 9,
        "oct" | "october" => 10,
        "nov" | "november" => 11,
        "dec" | "december" => 12,
        _ => return None,
    };
    Some(month)
}

fn at_midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

fn parse_native(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NATIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d").ok().map(at_midnight)
}

fn parse_numeric(text: &str) -> Option<DateTime<Utc>> {
    NUMERIC_DATE_RE.captures_iter(text).find_map(|caps| {
        let day = caps.get(1)?.as_str().parse().ok()?;
        let month = caps.get(2)?.as_str().parse().ok()?;
        let year = caps.get(3)?.as_str().parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, day).map(at_midnight)
    })
}

fn parse_textual(text: &str) -> Option<DateTime<Utc>> {
    TEXTUAL_DATE_RE.captures_iter(text).find_map(|caps| {
        let day = caps.get(1)?.as_str().parse().ok()?;
        let month = month_number(caps.get(2)?.as_str())?;
        let year = caps.get(3)?.as_str().parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, day).map(at_midnight)
    })
}

/// Tries native timestamps, then DD/MM/YYYY, then "D Mon YYYY".
pub fn parse_deadline_text(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    parse_native(trimmed)
        .or_else(|| parse_numeric(trimmed))
        .or_else(|| parse_textual(trimmed))
}

/// Total: anything unparseable becomes `now + 14 days`.
pub fn parse_deadline(text: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
    text.and_then(parse_deadline_text)
        .unwrap_or_else(|| now + Duration::days(DEFAULT_DEADLINE_DAYS))
}

/// Keyword sets, tried youth, then women, then pwds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AffirmativeRules {
    #[serde(default = "default_youth")]
    pub youth: Vec<String>,
    #[serde(default = "default_women")]
    pub women: Vec<String>,
    #[serde(default = "default_pwds")]
    pub pwds: Vec<String>,
    #[serde(default = "default_percentage")]
    pub percentage: i32,
}

fn keywords(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

fn default_youth() -> Vec<String> {
    keywords(&["youth", "agpo", "young people", "young entrepreneurs"])
}

fn default_women() -> Vec<String> {
    keywords(&["women", "woman", "female", "ladies"])
}

fn default_pwds() -> Vec<String> {
    keywords(&[
        "pwd",
        "persons with disabilit",
        "people with disabilit",
        "disabled",
        "disability",
        "special needs",
    ])
}

fn default_percentage() -> i32 {
    AGPO_PERCENTAGE
}

impl Default for AffirmativeRules {
    fn default() -> Self {
        Self {
            youth: default_youth(),
            women: default_women(),
            pwds: default_pwds(),
            percentage: default_percentage(),
        }
    }
}

impl AffirmativeRules {
    /// Reads `rules/affirmative_action.yaml` when present, otherwise the built-in sets.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("affirmative_action.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn classify(&self, title: &str, description: &str, organization: &str) -> AffirmativeAction {
        let haystack = format!("{title} {description} {organization}").to_lowercase();
        let hit = |set: &[String]| set.iter().any(|k| haystack.contains(&k.to_lowercase()));

        let (kind, label) = if hit(&self.youth) {
            (AffirmativeActionType::Youth, "youth")
        } else if hit(&self.women) {
            (AffirmativeActionType::Women, "women")
        } else if hit(&self.pwds) {
            (AffirmativeActionType::Pwds, "persons with disabilities")
        } else {
            return AffirmativeAction::none();
        };
        AffirmativeAction {
            kind,
            percentage: self.percentage,
            details: format!("Reserved for {label} under AGPO"),
        }
    }
}

/// Per-source values used when a candidate leaves a field empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDefaults {
    pub category: String,
    pub location: String,
    pub points_required: i32,
}

impl Default for SourceDefaults {
    fn default() -> Self {
        Self {
            category: "General".to_string(),
            location: "Kenya".to_string(),
            points_required: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    rules: AffirmativeRules,
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|v| !v.is_empty())
}

impl Normalizer {
    pub fn new(rules: AffirmativeRules) -> Self {
        Self { rules }
    }

    /// Returns `None` only when the candidate has no usable title.
    pub fn normalize(
        &self,
        draft: TenderDraft,
        defaults: &SourceDefaults,
        now: DateTime<Utc>,
    ) -> Option<Tender> {
        let title = clean(Some(draft.title))?;
        let description = clean(draft.description);
        let organization = clean(draft.organization);
        let affirmative_action = self.rules.classify(
            &title,
            description.as_deref().unwrap_or_default(),
            organization.as_deref().unwrap_or_default(),
        );
        let deadline = parse_deadline(draft.deadline_text.as_deref(), now);

        Some(Tender {
            id: Uuid::new_v4(),
            source_id: draft.source_id,
            reference: clean(draft.reference),
            description: description.unwrap_or_else(|| title.clone()),
            requirements: clean(draft.requirements)
                .unwrap_or_else(|| "See tender document".to_string()),
            deadline,
            contact: organization.unwrap_or_else(|| "Not specified".to_string()),
            category: clean(draft.category).unwrap_or_else(|| defaults.category.clone()),
            subcategory: clean(draft.subcategory),
            location: clean(draft.location).unwrap_or_else(|| defaults.location.clone()),
            tender_url: clean(draft.tender_url),
            fees: clean(draft.fee_text),
            prerequisites: clean(draft.prerequisites),
            points_required: defaults.points_required,
            affirmative_action,
            created_at: now,
            last_seen_at: now,
            title,
        })
    }
}

//! Extraction strategies that turn fetched source content into tender candidates.
//!
//! A source declares one source-specific strategy; the [`Extractor`] tries it first and
//! then falls back to API discovery and the generic table heuristic.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tenderwatch_core::{ExtractionMethod, TenderDraft};
use tenderwatch_storage::{FetchOptions, PageFetcher};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const CRATE_NAME: &str = "tenderwatch-adapters";

const DEFAULT_MAX_ENDPOINTS: usize = 6;
const MAX_JSON_DEPTH: usize = 8;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("content is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("JSON pointer `{0}` does not resolve to an array")]
    Pointer(String),
}

/// Column positions for a source whose listing is a fixed table layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMap {
    pub title: usize,
    #[serde(default)]
    pub reference: Option<usize>,
    #[serde(default)]
    pub organization: Option<usize>,
    #[serde(default)]
    pub deadline: Option<usize>,
    #[serde(default)]
    pub location: Option<usize>,
    #[serde(default)]
    pub category: Option<usize>,
    #[serde(default)]
    pub description: Option<usize>,
    /// Column holding the detail link; defaults to the title column.
    #[serde(default)]
    pub link: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRules {
    #[serde(default = "default_row_selector")]
    pub row_selector: String,
    #[serde(default = "default_cell_selector")]
    pub cell_selector: String,
    pub columns: ColumnMap,
    /// Title cell values that mark a header row rather than a tender.
    #[serde(default = "default_header_titles")]
    pub header_titles: Vec<String>,
}

fn default_row_selector() -> String {
    "table tr".to_string()
}

fn default_cell_selector() -> String {
    "td".to_string()
}

fn default_header_titles() -> Vec<String> {
    ["title", "tender", "tender title", "tender name", "description", "subject", "#", "no"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Field-name preferences for JSON sources. Each list is tried in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRules {
    /// RFC 6901 pointer to the tender array; empty means search the document.
    #[serde(default)]
    pub items_pointer: String,
    #[serde(default = "default_title_fields")]
    pub title_fields: Vec<String>,
    #[serde(default = "default_deadline_fields")]
    pub deadline_fields: Vec<String>,
    #[serde(default = "default_organization_fields")]
    pub organization_fields: Vec<String>,
    #[serde(default = "default_reference_fields")]
    pub reference_fields: Vec<String>,
    #[serde(default = "default_url_fields")]
    pub url_fields: Vec<String>,
    #[serde(default = "default_description_fields")]
    pub description_fields: Vec<String>,
    #[serde(default = "default_location_fields")]
    pub location_fields: Vec<String>,
    #[serde(default = "default_category_fields")]
    pub category_fields: Vec<String>,
}

impl Default for JsonRules {
    fn default() -> Self {
        Self {
            items_pointer: String::new(),
            title_fields: default_title_fields(),
            deadline_fields: default_deadline_fields(),
            organization_fields: default_organization_fields(),
            reference_fields: default_reference_fields(),
            url_fields: default_url_fields(),
            description_fields: default_description_fields(),
            location_fields: default_location_fields(),
            category_fields: default_category_fields(),
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

fn default_title_fields() -> Vec<String> {
    strings(&["title", "tender_title", "tenderTitle", "tender_name", "name", "subject"])
}

fn default_deadline_fields() -> Vec<String> {
    strings(&[
        "deadline",
        "closing_date",
        "closingDate",
        "close_date",
        "closing_time",
        "submission_deadline",
        "due_date",
        "end_date",
        "expiry_date",
    ])
}

fn default_organization_fields() -> Vec<String> {
    strings(&[
        "organization",
        "organisation",
        "procuring_entity",
        "procuringEntity",
        "entity",
        "ministry",
        "agency",
        "buyer",
    ])
}

fn default_reference_fields() -> Vec<String> {
    strings(&["reference", "ref", "tender_no", "tender_number", "tenderNumber", "ref_no"])
}

fn default_url_fields() -> Vec<String> {
    strings(&["url", "link", "tender_url", "href", "document_url"])
}

fn default_description_fields() -> Vec<String> {
    strings(&["description", "details", "summary"])
}

fn default_location_fields() -> Vec<String> {
    strings(&["location", "county", "region"])
}

fn default_category_fields() -> Vec<String> {
    strings(&["category", "procurement_method", "procurementMethod", "type", "sector"])
}

/// The strategy a source declares in the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    Table(TableRules),
    Json(JsonRules),
    /// No source-specific rules; rely on discovery and heuristics only.
    #[default]
    Adaptive,
}

/// One way of reading candidates out of fetched content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionStrategy {
    Table(TableRules),
    Json(JsonRules),
    ApiDiscovery { max_endpoints: usize },
    GenericTable,
}

/// Content of one fetched source page plus what is needed to follow links from it.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionInput<'a> {
    pub source_id: &'a str,
    pub base_url: &'a str,
    pub body: &'a str,
    pub is_json: bool,
    pub verify_tls: bool,
}

impl ExtractionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Table(_) => "table",
            Self::Json(_) => "json",
            Self::ApiDiscovery { .. } => "api_discovery",
            Self::GenericTable => "generic_table",
        }
    }

    /// Returns `Ok(None)` when the strategy does not apply to this content.
    pub async fn try_extract(
        &self,
        input: &ExtractionInput<'_>,
        fetcher: &dyn PageFetcher,
    ) -> Result<Option<Vec<TenderDraft>>, ExtractError> {
        let drafts = match self {
            Self::Table(rules) => {
                if input.is_json {
                    return Ok(None);
                }
                extract_rule_table(rules, input)?
            }
            Self::Json(rules) => {
                if !input.is_json {
                    return Ok(None);
                }
                extract_rule_json(rules, input)?
            }
            Self::ApiDiscovery { max_endpoints } => {
                discover_and_query(input, fetcher, *max_endpoints).await
            }
            Self::GenericTable => {
                if input.is_json {
                    return Ok(None);
                }
                extract_generic_tables(input)?
            }
        };
        Ok(if drafts.is_empty() { None } else { Some(drafts) })
    }
}

/// Result of running the fallback chain over one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionReport {
    pub candidates: Vec<TenderDraft>,
    /// Name of the strategy that produced the candidates, if any did.
    pub strategy: Option<&'static str>,
    pub attempted: Vec<&'static str>,
}

/// Ordered fallback chain: the source-specific strategy, then API discovery, then
/// the generic table heuristic.
#[derive(Debug, Clone)]
pub struct Extractor {
    strategies: Vec<ExtractionStrategy>,
}

impl Extractor {
    pub fn for_config(config: &StrategyConfig) -> Self {
        let mut strategies = Vec::with_capacity(3);
        match config {
            StrategyConfig::Table(rules) => strategies.push(ExtractionStrategy::Table(rules.clone())),
            StrategyConfig::Json(rules) => strategies.push(ExtractionStrategy::Json(rules.clone())),
            StrategyConfig::Adaptive => {}
        }
        strategies.push(ExtractionStrategy::ApiDiscovery {
            max_endpoints: DEFAULT_MAX_ENDPOINTS,
        });
        strategies.push(ExtractionStrategy::GenericTable);
        Self { strategies }
    }

    /// Never fails: a strategy that errors is logged and the next one is tried.
    pub async fn extract(
        &self,
        input: &ExtractionInput<'_>,
        fetcher: &dyn PageFetcher,
    ) -> ExtractionReport {
        let mut report = ExtractionReport::default();
        for strategy in &self.strategies {
            report.attempted.push(strategy.name());
            match strategy.try_extract(input, fetcher).await {
                Ok(Some(candidates)) => {
                    debug!(
                        source_id = input.source_id,
                        strategy = strategy.name(),
                        count = candidates.len(),
                        "extraction succeeded"
                    );
                    report.candidates = candidates;
                    report.strategy = Some(strategy.name());
                    return report;
                }
                Ok(None) => debug!(
                    source_id = input.source_id,
                    strategy = strategy.name(),
                    "strategy produced no candidates"
                ),
                Err(err) => warn!(
                    source_id = input.source_id,
                    strategy = strategy.name(),
                    error = %err,
                    "strategy failed; trying next"
                ),
            }
        }
        report
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn cell_text(cell: &ElementRef<'_>) -> Option<String> {
    text_or_none(&cell.text().collect::<Vec<_>>().join(" "))
}

fn resolve_url(base_url: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    match Url::parse(base_url) {
        Ok(base) => base.join(href).ok().map(|u| u.to_string()),
        Err(_) => Url::parse(href).ok().map(|u| u.to_string()),
    }
}

fn cell_link(cell: &ElementRef<'_>, link_sel: &Selector, base_url: &str) -> Option<String> {
    cell.select(link_sel)
        .next()
        .and_then(|a| a.value().attr("href"))
        .and_then(|href| resolve_url(base_url, href))
}

fn extract_rule_table(
    rules: &TableRules,
    input: &ExtractionInput<'_>,
) -> Result<Vec<TenderDraft>, ExtractError> {
    let row_sel = parse_selector(&rules.row_selector)?;
    let cell_sel = parse_selector(&rules.cell_selector)?;
    let link_sel = parse_selector("a[href]")?;
    let document = Html::parse_document(input.body);
    let cols = &rules.columns;

    let mut drafts = Vec::new();
    for (row_index, row) in document.select(&row_sel).enumerate() {
        let cells: Vec<ElementRef<'_>> = row.select(&cell_sel).collect();
        let text_at = |idx: Option<usize>| idx.and_then(|i| cells.get(i)).and_then(cell_text);
        let Some(title) = text_at(Some(cols.title)) else {
            continue;
        };
        if rules
            .header_titles
            .iter()
            .any(|h| h.eq_ignore_ascii_case(&title))
        {
            continue;
        }
        let mut draft = TenderDraft::new(
            input.source_id,
            title,
            ExtractionMethod::SourceSpecific,
            format!("{} >> row[{row_index}]", rules.row_selector),
        );
        draft.reference = text_at(cols.reference);
        draft.organization = text_at(cols.organization);
        draft.deadline_text = text_at(cols.deadline);
        draft.location = text_at(cols.location);
        draft.category = text_at(cols.category);
        draft.description = text_at(cols.description);
        draft.tender_url = cells
            .get(cols.link.unwrap_or(cols.title))
            .and_then(|cell| cell_link(cell, &link_sel, input.base_url));
        drafts.push(draft);
    }
    Ok(drafts)
}

fn extract_rule_json(
    rules: &JsonRules,
    input: &ExtractionInput<'_>,
) -> Result<Vec<TenderDraft>, ExtractError> {
    let document: JsonValue = serde_json::from_str(input.body)?;
    let (pointer, items) = if rules.items_pointer.is_empty() {
        match find_tender_array(&document) {
            Some(found) => found,
            None => return Ok(Vec::new()),
        }
    } else {
        let items = document
            .pointer(&rules.items_pointer)
            .and_then(JsonValue::as_array)
            .ok_or_else(|| ExtractError::Pointer(rules.items_pointer.clone()))?;
        (rules.items_pointer.clone(), items)
    };
    Ok(drafts_from_json_items(
        items,
        &pointer,
        rules,
        input,
        ExtractionMethod::SourceSpecific,
    ))
}

fn drafts_from_json_items(
    items: &[JsonValue],
    pointer: &str,
    rules: &JsonRules,
    input: &ExtractionInput<'_>,
    method: ExtractionMethod,
) -> Vec<TenderDraft> {
    items
        .iter()
        .enumerate()
        .filter_map(|(idx, item)| {
            let object = item.as_object()?;
            let field = |names: &[String]| {
                names
                    .iter()
                    .find_map(|name| object.get(name).and_then(json_scalar_text))
            };
            let title = field(&rules.title_fields)?;
            let mut draft = TenderDraft::new(input.source_id, title, method, format!("{pointer}/{idx}"));
            draft.deadline_text = field(&rules.deadline_fields);
            draft.organization = field(&rules.organization_fields);
            draft.reference = field(&rules.reference_fields);
            draft.description = field(&rules.description_fields);
            draft.location = field(&rules.location_fields);
            draft.category = field(&rules.category_fields);
            draft.tender_url = field(&rules.url_fields).and_then(|u| resolve_url(input.base_url, &u));
            Some(draft)
        })
        .collect()
}

/// Text of a scalar, or of the `name`/`title` member of a nested object.
fn json_scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Object(map) => ["name", "title"]
            .iter()
            .find_map(|k| map.get(*k).and_then(JsonValue::as_str))
            .and_then(text_or_none),
        _ => None,
    }
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

static TITLE_KEYS: Lazy<HashSet<String>> = Lazy::new(|| {
    ["title", "tender_title", "tender_name", "name", "subject"]
        .iter()
        .map(|k| normalize_key(k))
        .collect()
});

static DATE_KEYS: Lazy<HashSet<String>> = Lazy::new(|| {
    [
        "deadline",
        "closing_date",
        "close_date",
        "closing",
        "closing_time",
        "submission_deadline",
        "due_date",
        "end_date",
        "expiry_date",
        "date",
    ]
    .iter()
    .map(|k| normalize_key(k))
    .collect()
});

fn looks_like_tender_list(items: &[JsonValue]) -> bool {
    items.iter().take(5).any(|item| {
        let Some(object) = item.as_object() else {
            return false;
        };
        let keys: Vec<String> = object.keys().map(|k| normalize_key(k)).collect();
        keys.iter().any(|k| TITLE_KEYS.contains(k)) && keys.iter().any(|k| DATE_KEYS.contains(k))
    })
}

fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Depth-first search for the first array of objects carrying a title-like and a
/// date-like key. Returns the array with its JSON pointer.
pub fn find_tender_array(document: &JsonValue) -> Option<(String, &Vec<JsonValue>)> {
    fn walk<'a>(value: &'a JsonValue, pointer: String, depth: usize) -> Option<(String, &'a Vec<JsonValue>)> {
        if depth > MAX_JSON_DEPTH {
            return None;
        }
        match value {
            JsonValue::Array(items) => {
                if looks_like_tender_list(items) {
                    return Some((pointer, items));
                }
                items
                    .iter()
                    .enumerate()
                    .find_map(|(i, item)| walk(item, format!("{pointer}/{i}"), depth + 1))
            }
            JsonValue::Object(map) => map.iter().find_map(|(key, item)| {
                walk(item, format!("{pointer}/{}", escape_pointer_token(key)), depth + 1)
            }),
            _ => None,
        }
    }
    walk(document, String::new(), 0)
}

static API_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"["'`]((?:https?://[^"'`\s]+?)?/?(?:api|wp-json|rest)/[A-Za-z0-9_\-./?=&%]*)["'`]"#)
        .expect("valid api path pattern")
});

const ASSET_SUFFIXES: &[&str] = &[".js", ".css", ".png", ".jpg", ".jpeg", ".svg", ".gif", ".ico", ".woff", ".woff2", ".map"];

/// API-looking endpoints referenced from inline scripts, resolved and de-duplicated.
pub fn discover_api_paths(html: &str, base_url: &str) -> Vec<String> {
    let Ok(script_sel) = Selector::parse("script") else {
        return Vec::new();
    };
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for script in document.select(&script_sel) {
        let code = script.text().collect::<String>();
        for capture in API_PATH_RE.captures_iter(&code) {
            let Some(raw) = capture.get(1).map(|m| m.as_str()) else {
                continue;
            };
            let path_only = raw.split('?').next().unwrap_or(raw).to_ascii_lowercase();
            if ASSET_SUFFIXES.iter().any(|s| path_only.ends_with(s)) {
                continue;
            }
            let Some(resolved) = resolve_url(base_url, raw) else {
                continue;
            };
            if seen.insert(resolved.clone()) {
                out.push(resolved);
            }
        }
    }
    out
}

async fn discover_and_query(
    input: &ExtractionInput<'_>,
    fetcher: &dyn PageFetcher,
    max_endpoints: usize,
) -> Vec<TenderDraft> {
    let rules = JsonRules::default();
    if input.is_json {
        return match serde_json::from_str::<JsonValue>(input.body) {
            Ok(document) => find_tender_array(&document)
                .map(|(pointer, items)| {
                    drafts_from_json_items(items, &pointer, &rules, input, ExtractionMethod::ApiDiscovery)
                })
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
    }

    let endpoints = discover_api_paths(input.body, input.base_url);
    let options = FetchOptions {
        verify_tls: input.verify_tls,
        prefer_json: true,
    };
    for endpoint in endpoints.into_iter().take(max_endpoints) {
        let response = match fetcher.fetch(input.source_id, &endpoint, options).await {
            Ok(response) => response,
            Err(err) => {
                debug!(source_id = input.source_id, endpoint = %endpoint, error = %err, "discovered endpoint fetch failed");
                continue;
            }
        };
        if !response.looks_like_json() {
            continue;
        }
        let Ok(document) = serde_json::from_slice::<JsonValue>(&response.body) else {
            continue;
        };
        let endpoint_input = ExtractionInput {
            base_url: &endpoint,
            ..*input
        };
        let drafts = find_tender_array(&document)
            .map(|(pointer, items)| {
                let pointer = format!("{endpoint}#{pointer}");
                drafts_from_json_items(items, &pointer, &rules, &endpoint_input, ExtractionMethod::ApiDiscovery)
            })
            .unwrap_or_default();
        if !drafts.is_empty() {
            return drafts;
        }
    }
    Vec::new()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderField {
    Reference,
    Deadline,
    Published,
    Organization,
    Location,
    Category,
    Description,
    Title,
}

/// Checked in order; the first field whose synonyms match a header claims the column.
const HEADER_SYNONYMS: &[(HeaderField, &[&str])] = &[
    (
        HeaderField::Reference,
        &["ref", "reference", "tender no", "tender number", "ref no", "bid no", "number"],
    ),
    (
        HeaderField::Deadline,
        &["deadline", "closing", "closes", "close", "due", "submission", "expiry", "end date"],
    ),
    (
        HeaderField::Published,
        &["posted", "published", "opening", "open date", "start date", "issued"],
    ),
    (
        HeaderField::Organization,
        &[
            "organization",
            "organisation",
            "ministry",
            "entity",
            "agency",
            "department",
            "institution",
            "client",
            "buyer",
            "employer",
        ],
    ),
    (HeaderField::Location, &["location", "county", "region", "town"]),
    (
        HeaderField::Category,
        &["category", "type", "method", "sector", "classification"],
    ),
    (HeaderField::Description, &["description", "details", "summary"]),
    (
        HeaderField::Title,
        &["title", "tender", "tenders", "name", "subject", "item", "bid", "opportunity"],
    ),
];

const PROCUREMENT_KEYWORDS: &[&str] = &[
    "tender",
    "tenders",
    "bid",
    "bids",
    "procurement",
    "contract",
    "contracts",
    "closing",
    "deadline",
    "rfq",
    "rfp",
    "quotation",
    "supply",
    "eoi",
];

fn header_words(header: &str) -> Vec<String> {
    header
        .to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// True when the synonym's words appear contiguously in the header's words.
fn header_matches(words: &[String], synonym: &str) -> bool {
    let needle: Vec<&str> = synonym.split(' ').collect();
    words
        .windows(needle.len())
        .any(|window| window.iter().zip(&needle).all(|(w, n)| w == n))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct HeaderMapping {
    reference: Option<usize>,
    deadline: Option<usize>,
    organization: Option<usize>,
    location: Option<usize>,
    category: Option<usize>,
    description: Option<usize>,
    title: Option<usize>,
}

impl HeaderMapping {
    fn slot(&mut self, field: HeaderField) -> Option<&mut Option<usize>> {
        match field {
            HeaderField::Reference => Some(&mut self.reference),
            HeaderField::Deadline => Some(&mut self.deadline),
            HeaderField::Organization => Some(&mut self.organization),
            HeaderField::Location => Some(&mut self.location),
            HeaderField::Category => Some(&mut self.category),
            HeaderField::Description => Some(&mut self.description),
            HeaderField::Title => Some(&mut self.title),
            HeaderField::Published => None,
        }
    }
}

fn map_headers(headers: &[String]) -> HeaderMapping {
    let mut mapping = HeaderMapping::default();
    for (idx, header) in headers.iter().enumerate() {
        let words = header_words(header);
        for (field, synonyms) in HEADER_SYNONYMS {
            if !synonyms.iter().any(|s| header_matches(&words, s)) {
                continue;
            }
            // A recognised column is consumed even if its field is already mapped.
            if let Some(slot) = mapping.slot(*field) {
                if slot.is_none() {
                    *slot = Some(idx);
                }
            }
            break;
        }
    }
    if mapping.title.is_none() {
        mapping.title = mapping.description.take();
    }
    mapping
}

fn has_procurement_keyword(headers: &[String]) -> bool {
    headers.iter().any(|h| {
        let words = header_words(h);
        PROCUREMENT_KEYWORDS.iter().any(|k| words.iter().any(|w| w == k))
    })
}

/// True when `owner` is the closest `tag` element above `el`.
fn owned_by(el: &ElementRef<'_>, tag: &str, owner: &ElementRef<'_>) -> bool {
    el.ancestors()
        .find(|node| node.value().as_element().is_some_and(|e| e.name() == tag))
        .is_some_and(|node| node.id() == owner.id())
}

/// Heuristic over every `<table>`: map header synonyms to fields and read the rows.
/// Rows and cells belonging to a nested table are left to that table's own pass.
fn extract_generic_tables(input: &ExtractionInput<'_>) -> Result<Vec<TenderDraft>, ExtractError> {
    let table_sel = parse_selector("table")?;
    let row_sel = parse_selector("tr")?;
    let header_cell_sel = parse_selector("th, td")?;
    let cell_sel = parse_selector("td")?;
    let link_sel = parse_selector("a[href]")?;
    let document = Html::parse_document(input.body);

    let mut drafts = Vec::new();
    for (table_index, table) in document.select(&table_sel).enumerate() {
        let mut rows = table
            .select(&row_sel)
            .filter(move |row| owned_by(row, "table", &table));
        let Some(header_row) = rows.next() else {
            continue;
        };
        let header_cells: Vec<ElementRef<'_>> = header_row
            .select(&header_cell_sel)
            .filter(|cell| owned_by(cell, "tr", &header_row))
            .collect();
        // Layout wrapper around other tables.
        if header_cells.iter().any(|cell| cell.select(&table_sel).next().is_some()) {
            continue;
        }
        let headers: Vec<String> = header_cells
            .iter()
            .map(|cell| cell_text(cell).unwrap_or_default())
            .collect();
        if !has_procurement_keyword(&headers) {
            continue;
        }
        let mapping = map_headers(&headers);
        let Some(title_col) = mapping.title else {
            continue;
        };
        let header_title = headers.get(title_col).cloned().unwrap_or_default();

        for (row_index, row) in rows.enumerate() {
            let cells: Vec<ElementRef<'_>> = row
                .select(&cell_sel)
                .filter(|cell| owned_by(cell, "tr", &row))
                .collect();
            if cells.iter().any(|cell| cell.select(&table_sel).next().is_some()) {
                continue;
            }
            let text_at = |idx: Option<usize>| idx.and_then(|i| cells.get(i)).and_then(cell_text);
            let Some(title) = text_at(Some(title_col)) else {
                continue;
            };
            if title.eq_ignore_ascii_case(&header_title) {
                continue;
            }
            let mut draft = TenderDraft::new(
                input.source_id,
                title,
                ExtractionMethod::GenericTable,
                format!("table[{table_index}] tr[{}]", row_index + 1),
            );
            draft.reference = text_at(mapping.reference);
            draft.organization = text_at(mapping.organization);
            draft.deadline_text = text_at(mapping.deadline);
            draft.location = text_at(mapping.location);
            draft.category = text_at(mapping.category);
            draft.description = text_at(mapping.description);
            draft.tender_url = cells
                .get(title_col)
                .and_then(|cell| cell_link(cell, &link_sel, input.base_url))
                .or_else(|| cells.iter().find_map(|cell| cell_link(cell, &link_sel, input.base_url)));
            drafts.push(draft);
        }
    }
    Ok(drafts)
}

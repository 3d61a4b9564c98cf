//! Distribution of newly persisted tenders to notification channels, guarded by the
//! distribution ledger so a tender is announced at most once.

mod channels;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tenderwatch_core::{Channel, DistributionRecord, Tender};
use tenderwatch_storage::{Store, StoreError};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub use channels::{
    format_chat_message, format_microblog, format_summary, sign_payload, webhook_payload,
    ChatBotNotifier, MicroblogNotifier, WebhookNotifier, MICROBLOG_LIMIT,
};

pub const CRATE_NAME: &str = "tenderwatch-notify";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("{channel} request failed: {source}")]
    Request {
        channel: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{channel} responded with status {status}: {body}")]
    Status {
        channel: &'static str,
        status: u16,
        body: String,
    },
    #[error("{0}")]
    Other(String),
}

/// One downstream channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> Channel;
    async fn send(&self, tender: &Tender) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "error", rename_all = "snake_case")]
pub enum DistributionResult {
    Sent,
    AlreadySent,
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub tenders: usize,
    pub sent: usize,
    pub failed: usize,
    pub already_sent: usize,
}

#[derive(Debug, Clone)]
pub struct MicroblogSettings {
    pub url: String,
    pub api_key: String,
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct ChatBotSettings {
    pub api_base: String,
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub microblog: Option<MicroblogSettings>,
    pub chat_bot: Option<ChatBotSettings>,
    pub http_timeout_secs: u64,
    pub lookback_hours: i64,
    pub sweep_limit: i64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            microblog: None,
            chat_bot: None,
            http_timeout_secs: 15,
            lookback_hours: 24,
            sweep_limit: 50,
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl NotifyConfig {
    /// A channel is enabled only when all of its settings are present.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let microblog = match (
            non_empty_env("TENDERWATCH_MICROBLOG_URL"),
            non_empty_env("TENDERWATCH_MICROBLOG_KEY"),
            non_empty_env("TENDERWATCH_MICROBLOG_SECRET"),
        ) {
            (Some(url), Some(api_key), Some(secret)) => Some(MicroblogSettings { url, api_key, secret }),
            _ => None,
        };
        let chat_bot = match (
            non_empty_env("TENDERWATCH_TELEGRAM_BOT_TOKEN"),
            non_empty_env("TENDERWATCH_TELEGRAM_CHAT_ID"),
        ) {
            (Some(bot_token), Some(chat_id)) => Some(ChatBotSettings {
                api_base: non_empty_env("TENDERWATCH_TELEGRAM_API_BASE")
                    .unwrap_or_else(|| "https://api.telegram.org".to_string()),
                bot_token,
                chat_id,
            }),
            _ => None,
        };
        Self {
            webhook_url: non_empty_env("TENDERWATCH_WEBHOOK_URL"),
            microblog,
            chat_bot,
            http_timeout_secs: non_empty_env("TENDERWATCH_NOTIFY_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            lookback_hours: non_empty_env("TENDERWATCH_DISTRIBUTE_LOOKBACK_HOURS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.lookback_hours),
            sweep_limit: non_empty_env("TENDERWATCH_DISTRIBUTE_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.sweep_limit),
        }
    }

    pub fn build_notifiers(&self) -> anyhow::Result<Vec<Arc<dyn Notifier>>> {
        let timeout = Duration::from_secs(self.http_timeout_secs);
        let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
        if let Some(url) = &self.webhook_url {
            notifiers.push(Arc::new(WebhookNotifier::new(url.clone(), timeout)?));
        }
        if let Some(mb) = &self.microblog {
            notifiers.push(Arc::new(MicroblogNotifier::new(
                mb.url.clone(),
                mb.api_key.clone(),
                mb.secret.clone(),
                timeout,
            )?));
        }
        if let Some(bot) = &self.chat_bot {
            notifiers.push(Arc::new(ChatBotNotifier::new(
                bot.api_base.clone(),
                bot.bot_token.clone(),
                bot.chat_id.clone(),
                timeout,
            )?));
        }
        Ok(notifiers)
    }
}

pub struct Distributor {
    store: Arc<dyn Store>,
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl Distributor {
    pub fn new(store: Arc<dyn Store>, notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { store, notifiers }
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.notifiers.iter().map(|n| n.channel()).collect()
    }

    /// Sends one tender on one channel unless the ledger already holds a success for it
    /// on any channel.
    pub async fn distribute(
        &self,
        tender: &Tender,
        channel: Channel,
    ) -> Result<DistributionResult, StoreError> {
        if self.store.has_distribution_success(tender.id).await? {
            return Ok(DistributionResult::AlreadySent);
        }
        let Some(notifier) = self.notifiers.iter().find(|n| n.channel() == channel) else {
            return Ok(DistributionResult::Failed(format!(
                "channel {} is not configured",
                channel.as_str()
            )));
        };
        self.send_and_record(tender, notifier.as_ref()).await
    }

    async fn send_and_record(
        &self,
        tender: &Tender,
        notifier: &dyn Notifier,
    ) -> Result<DistributionResult, StoreError> {
        let channel = notifier.channel();
        let outcome = notifier.send(tender).await;
        let record = DistributionRecord {
            id: Uuid::new_v4(),
            tender_id: tender.id,
            channel,
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(ToString::to_string),
            attempted_at: Utc::now(),
        };
        self.store.record_distribution(&record).await?;
        Ok(match outcome {
            Ok(()) => DistributionResult::Sent,
            Err(err) => {
                warn!(
                    tender_id = %tender.id,
                    channel = channel.as_str(),
                    error = %err,
                    "distribution attempt failed"
                );
                DistributionResult::Failed(err.to_string())
            }
        })
    }

    /// Pushes every recent, never-distributed tender to all configured channels.
    /// A failure on one channel does not stop the others.
    pub async fn sweep(&self, since: DateTime<Utc>, limit: i64) -> Result<SweepSummary, StoreError> {
        let mut summary = SweepSummary::default();
        if self.notifiers.is_empty() {
            warn!("no notification channels configured; skipping distribution sweep");
            return Ok(summary);
        }

        let tenders = self.store.undistributed_tenders(since, limit).await?;
        summary.tenders = tenders.len();
        for tender in &tenders {
            if self.store.has_distribution_success(tender.id).await? {
                summary.already_sent += 1;
                continue;
            }
            for notifier in &self.notifiers {
                match self.send_and_record(tender, notifier.as_ref()).await {
                    Ok(DistributionResult::Sent) => summary.sent += 1,
                    Ok(_) => summary.failed += 1,
                    Err(err) => {
                        warn!(tender_id = %tender.id, error = %err, "could not record distribution attempt");
                        return Err(err);
                    }
                }
            }
        }
        info!(
            tenders = summary.tenders,
            sent = summary.sent,
            failed = summary.failed,
            "distribution sweep finished"
        );
        Ok(summary)
    }
}

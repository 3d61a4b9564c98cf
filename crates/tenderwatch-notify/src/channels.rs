//! Channel notifiers and their message formats.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{json, Value as JsonValue};
use sha2::Sha256;
use tenderwatch_core::{AffirmativeActionType, Channel, Tender};

use crate::{NotifyError, Notifier};

type HmacSha256 = Hmac<Sha256>;

pub const MICROBLOG_LIMIT: usize = 280;

fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("building notifier http client")
}

async fn ensure_success(channel: Channel, resp: reqwest::Response) -> Result<reqwest::Response, NotifyError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(NotifyError::Status {
        channel: channel.as_str(),
        status: status.as_u16(),
        body: body.chars().take(200).collect(),
    })
}

fn request_error(channel: Channel) -> impl FnOnce(reqwest::Error) -> NotifyError {
    move |source| NotifyError::Request {
        channel: channel.as_str(),
        source,
    }
}

fn deadline_label(tender: &Tender) -> String {
    tender.deadline.format("%d %b %Y").to_string()
}

fn set_aside_label(tender: &Tender) -> Option<String> {
    let aa = &tender.affirmative_action;
    let group = match aa.kind {
        AffirmativeActionType::Youth => "youth",
        AffirmativeActionType::Women => "women",
        AffirmativeActionType::Pwds => "persons with disabilities",
        AffirmativeActionType::None => return None,
    };
    Some(format!("Reserved for {group} ({}% AGPO)", aa.percentage))
}

/// Plain-text summary shared by the webhook payload.
pub fn format_summary(tender: &Tender) -> String {
    let mut lines = vec![
        format!("New tender: {}", tender.title),
        format!("Organization: {}", tender.contact),
        format!("Deadline: {}", deadline_label(tender)),
        format!("Category: {}", tender.category),
    ];
    if let Some(label) = set_aside_label(tender) {
        lines.push(label);
    }
    if let Some(url) = &tender.tender_url {
        lines.push(url.clone());
    }
    lines.join("\n")
}

pub fn webhook_payload(tender: &Tender) -> JsonValue {
    let mut fields = vec![
        json!({ "type": "mrkdwn", "text": format!("*Organization:*\n{}", tender.contact) }),
        json!({ "type": "mrkdwn", "text": format!("*Deadline:*\n{}", deadline_label(tender)) }),
        json!({ "type": "mrkdwn", "text": format!("*Category:*\n{}", tender.category) }),
        json!({ "type": "mrkdwn", "text": format!("*Location:*\n{}", tender.location) }),
    ];
    if let Some(label) = set_aside_label(tender) {
        fields.push(json!({ "type": "mrkdwn", "text": format!("*Set-aside:*\n{label}") }));
    }
    let mut blocks = vec![
        json!({ "type": "header", "text": { "type": "plain_text", "text": tender.title } }),
        json!({ "type": "section", "fields": fields }),
    ];
    if let Some(url) = &tender.tender_url {
        blocks.push(json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": format!("<{url}|View tender>") }
        }));
    }
    json!({ "text": format_summary(tender), "blocks": blocks })
}

/// At most 280 characters; the title is shortened first, hashtags are kept.
pub fn format_microblog(tender: &Tender) -> String {
    let mut tags = String::from("#Tenders #Kenya");
    if tender.affirmative_action.kind != AffirmativeActionType::None {
        tags.push_str(" #AGPO");
    }
    let mut tail = match &tender.tender_url {
        Some(url) => format!(" {url} {tags}"),
        None => format!(" {tags}"),
    };
    if tail.chars().count() >= MICROBLOG_LIMIT / 2 {
        tail = format!(" {tags}");
    }

    let head = format!(
        "New tender: {} ({}), closes {}",
        tender.title,
        tender.contact,
        deadline_label(tender)
    );
    let room = MICROBLOG_LIMIT - tail.chars().count();
    let head = if head.chars().count() > room {
        let mut cut: String = head.chars().take(room.saturating_sub(1)).collect();
        cut.push('…');
        cut
    } else {
        head
    };
    format!("{head}{tail}")
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// HTML-formatted chat message.
pub fn format_chat_message(tender: &Tender) -> String {
    let mut lines = vec![
        format!("<b>{}</b>", escape_html(&tender.title)),
        format!("Organization: {}", escape_html(&tender.contact)),
        format!("Deadline: {}", deadline_label(tender)),
        format!("Category: {}", escape_html(&tender.category)),
    ];
    if let Some(label) = set_aside_label(tender) {
        lines.push(label);
    }
    if let Some(url) = &tender.tender_url {
        lines.push(format!("<a href=\"{}\">View tender</a>", escape_html(url)));
    }
    lines.join("\n")
}

/// Hex HMAC-SHA256 over `"{timestamp}.{payload}"`.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &str) -> Result<String, NotifyError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| NotifyError::Other(format!("invalid signing key: {e}")))?;
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn channel(&self) -> Channel {
        Channel::Webhook
    }

    async fn send(&self, tender: &Tender) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&webhook_payload(tender))
            .send()
            .await
            .map_err(request_error(Channel::Webhook))?;
        ensure_success(Channel::Webhook, resp).await?;
        Ok(())
    }
}

pub struct MicroblogNotifier {
    client: reqwest::Client,
    url: String,
    api_key: String,
    secret: String,
}

impl MicroblogNotifier {
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
            api_key: api_key.into(),
            secret: secret.into(),
        })
    }
}

#[async_trait]
impl Notifier for MicroblogNotifier {
    fn channel(&self) -> Channel {
        Channel::Microblog
    }

    async fn send(&self, tender: &Tender) -> Result<(), NotifyError> {
        let payload = json!({ "text": format_microblog(tender) }).to_string();
        let timestamp = Utc::now().timestamp();
        let signature = sign_payload(&self.secret, timestamp, &payload)?;
        let resp = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header("X-Api-Key", &self.api_key)
            .header("X-Timestamp", timestamp.to_string())
            .header("X-Signature", signature)
            .body(payload)
            .send()
            .await
            .map_err(request_error(Channel::Microblog))?;
        ensure_success(Channel::Microblog, resp).await?;
        Ok(())
    }
}

pub struct ChatBotNotifier {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl ChatBotNotifier {
    pub fn new(
        api_base: impl Into<String>,
        bot_token: impl Into<String>,
        chat_id: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            api_base: api_base.into(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.bot_token
        )
    }
}

#[async_trait]
impl Notifier for ChatBotNotifier {
    fn channel(&self) -> Channel {
        Channel::ChatBot
    }

    async fn send(&self, tender: &Tender) -> Result<(), NotifyError> {
        let body = json!({
            "chat_id": self.chat_id,
            "text": format_chat_message(tender),
            "parse_mode": "HTML",
        });
        let resp = self
            .client
            .post(self.endpoint())
            .json(&body)
            .send()
            .await
            .map_err(request_error(Channel::ChatBot))?;
        let resp = ensure_success(Channel::ChatBot, resp).await?;
        let reply: JsonValue = resp.json().await.map_err(request_error(Channel::ChatBot))?;
        if reply.get("ok").and_then(JsonValue::as_bool) == Some(false) {
            return Err(NotifyError::Other(format!(
                "chat bot rejected message: {}",
                reply
                    .get("description")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("no description")
            )));
        }
        Ok(())
    }
}

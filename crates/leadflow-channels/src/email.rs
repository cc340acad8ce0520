//! Email Dispatcher: rendered, tracked, sent over SMTP.
//!
//! Every outbound message gets a tracking record, its links rewritten to the
//! click redirector and a 1×1 open beacon. Send failures are not masked: the
//! record is marked failed and the error goes back to the caller.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::Utc;
use leadflow_core::config::SmtpConfig;
use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::retry::{RetryPolicy, with_retry};
use leadflow_core::template::{Placeholders, render};
use leadflow_core::tracking::TrackingStore;
use leadflow_core::traits::{Mailer, OutboundEmail};
use leadflow_core::types::{
    Correlation, TrackingChannel, TrackingPatch, TrackingRecord, TrackingStatus,
};
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use regex::{Captures, Regex};

static HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)href\s*=\s*(["'])(https?://[^"']+)["']"#).expect("href pattern is valid")
});

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[a-zA-Z][^>]*>").expect("tag pattern is valid"));

static BARE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"]+"#).expect("url pattern is valid"));

pub struct EmailDispatcher {
    mailer: Arc<dyn Mailer>,
    store: Arc<TrackingStore>,
    public_url: String,
    retry: RetryPolicy,
}

impl EmailDispatcher {
    pub fn new(mailer: Arc<dyn Mailer>, store: Arc<TrackingStore>, public_url: &str) -> Self {
        Self {
            mailer,
            store,
            public_url: public_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::smtp(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        placeholders: &Placeholders,
        correlation: Correlation,
    ) -> Result<TrackingRecord> {
        let to = to.trim();
        if to.is_empty() || !to.contains('@') {
            return Err(LeadflowError::Validation(format!(
                "invalid recipient address '{to}'"
            )));
        }

        let subject = render(subject, placeholders);
        let body = render(body, placeholders);

        let mut draft = TrackingRecord::new(TrackingChannel::Email, to, correlation);
        draft.subject = Some(subject.clone());
        let mut record = self.store.create(draft).await;
        let tracking_id = record.tracking_id.clone();

        let html = self.instrument(&body, &tracking_id);
        let email = OutboundEmail {
            to: to.to_string(),
            subject,
            html_body: html,
            tracking_id: tracking_id.clone(),
        };

        let mailer = &self.mailer;
        let msg = &email;
        let sent = with_retry("smtp send", self.retry, || async move { mailer.send(msg).await }).await;

        let patch = match &sent {
            Ok(message_id) => TrackingPatch {
                status: Some(TrackingStatus::Sent),
                sent_at: Some(Utc::now()),
                external_id: message_id.clone(),
                ..Default::default()
            },
            Err(e) => TrackingPatch {
                status: Some(TrackingStatus::Failed),
                failed_at: Some(Utc::now()),
                error: Some(e.to_string()),
                ..Default::default()
            },
        };
        if let Err(e) = self.store.update(&tracking_id, &patch).await {
            tracing::warn!("Could not update email tracking {tracking_id}: {e}");
        }
        record.apply(&patch);

        match sent {
            Ok(_) => {
                tracing::info!("📤 Email {tracking_id} sent to {to}");
                Ok(record)
            }
            Err(e) => {
                tracing::warn!("❌ Email {tracking_id} to {to} failed: {e}");
                Err(e)
            }
        }
    }

    /// Rewrite links to the click redirector and append the open beacon.
    fn instrument(&self, body: &str, tracking_id: &str) -> String {
        let html = if TAG.is_match(body) {
            body.to_string()
        } else {
            text_to_html(body)
        };

        let click_base = format!("{}/click/{}", self.public_url, urlencoding::encode(tracking_id));
        let rewritten = HREF.replace_all(&html, |caps: &Captures<'_>| {
            let quote = &caps[1];
            let target = caps[2].replace("&amp;", "&");
            format!(
                "href={quote}{click_base}?url={}{quote}",
                urlencoding::encode(&target)
            )
        });

        let beacon = format!(
            r#"<img src="{}/open/{}" width="1" height="1" alt="" style="display:none;border:0" />"#,
            self.public_url,
            urlencoding::encode(tracking_id)
        );
        match rewritten.rfind("</body>") {
            Some(pos) => format!("{}{beacon}{}", &rewritten[..pos], &rewritten[pos..]),
            None => format!("{rewritten}{beacon}"),
        }
    }
}

/// Escape plain text and wrap it in paragraphs, turning bare URLs into links.
fn text_to_html(text: &str) -> String {
    let escaped = text
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    let linked = BARE_URL.replace_all(&escaped, |caps: &Captures<'_>| {
        format!(r#"<a href="{0}">{0}</a>"#, &caps[0])
    });
    linked
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{}</p>", p.replace('\n', "<br>")))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── SMTP transport ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct XTrackingId(String);

impl Header for XTrackingId {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-Tracking-Id")
    }

    fn parse(s: &str) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// [`Mailer`] over an SMTP relay (async lettre).
pub struct SmtpMailer {
    from: Mailbox,
    domain: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let from_name = config.from_name.as_deref().unwrap_or("Leadflow");
        let from_email = match (config.from_email.as_str(), config.username.as_str()) {
            ("", "") => {
                tracing::warn!("⚠️ smtp.from_email not set, sending as leadflow@localhost");
                "leadflow@localhost"
            }
            ("", user) => user,
            (from, _) => from,
        };
        let from: Mailbox = format!("{from_name} <{from_email}>")
            .parse()
            .map_err(|e| LeadflowError::Config(format!("Invalid from address: {e}")))?;
        let domain = from_email
            .rsplit_once('@')
            .map(|(_, d)| d.to_string())
            .unwrap_or_else(|| "localhost".into());

        let builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
        }
        .map_err(|e| LeadflowError::Config(format!("SMTP relay: {e}")))?
        .port(config.port);
        let builder = if config.username.is_empty() {
            builder
        } else {
            builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
        };

        Ok(Self { from, domain, transport: builder.build() })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<Option<String>> {
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|e| LeadflowError::Validation(format!("Invalid to: {e}")))?;
        let message_id = format!("<{}@{}>", email.tracking_id, self.domain);

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject.clone())
            .message_id(Some(message_id.clone()))
            .header(XTrackingId(email.tracking_id.clone()))
            .header(ContentType::TEXT_HTML)
            .body(email.html_body.clone())
            .map_err(|e| LeadflowError::Channel(format!("Build email: {e}")))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| LeadflowError::Channel(format!("SMTP send: {e}")))?;
        Ok(Some(message_id))
    }
}

//! Outbound mail transport.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart, SinglePart, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::AsyncSmtpConnection;
use lettre::transport::smtp::extension::{ClientId, Extension};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;

/// Send failures, classified by whether another attempt could succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// Network trouble, timeouts, SMTP 4xx.
    #[error("transient send failure: {0}")]
    Transient(String),

    /// Invalid recipient, SMTP 5xx. Retrying will not help.
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

/// A fully composed message ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMail {
    pub to: String,
    pub reply_to: Option<String>,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    /// Message id, used to build the `Message-ID` header.
    pub message_id: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &OutboundMail) -> Result<(), SendError>;
}

/// SMTP settings for [`SmtpMailer`].
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub tls: bool,
    pub sender: String,
    pub domain: String,
}

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    domain: String,
    host: String,
    port: u16,
    tls: bool,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> anyhow::Result<Self> {
        let from: Mailbox = config
            .sender
            .parse()
            .map_err(|e| anyhow::anyhow!("SENDER '{}' is not a valid address: {}", config.sender, e))?;

        let mut builder = if config.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };
        builder = builder
            .port(config.port)
            .timeout(Some(SMTP_TIMEOUT));
        if let (Some(user), Some(pass)) = (&config.user, &config.pass) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            domain: config.domain.clone(),
            host: config.host.clone(),
            port: config.port,
            tls: config.tls,
        })
    }

    /// Boot-time sanity check: connect, say hello, and make sure the server's
    /// STARTTLS support matches the configured `tls` setting.
    pub async fn verify(&self) -> anyhow::Result<()> {
        let mut connection = AsyncSmtpConnection::connect_tokio1(
            (self.host.as_str(), self.port),
            Some(SMTP_TIMEOUT),
            &ClientId::default(),
            None,
            None,
        )
        .await
        .map_err(|e| anyhow::anyhow!("SMTP connect to {}:{} failed: {}", self.host, self.port, e))?;

        let starttls = connection.server_info().supports_feature(Extension::StartTls);
        if let Err(e) = connection.quit().await {
            tracing::debug!(error = %e, "SMTP QUIT failed after hello");
        }

        check_starttls(self.tls, starttls)?;
        tracing::info!(host = %self.host, port = self.port, starttls, "SMTP server reachable");
        Ok(())
    }

    fn compose(&self, mail: &OutboundMail) -> Result<Message, SendError> {
        let to: Mailbox = mail
            .to
            .parse()
            .map_err(|e| SendError::Permanent(format!("invalid recipient '{}': {}", mail.to, e)))?;

        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(mail.subject.clone())
            .message_id(Some(format!("<{}@{}>", mail.message_id, self.domain)));

        if let Some(reply_to) = &mail.reply_to {
            match reply_to.parse::<Mailbox>() {
                Ok(mailbox) => builder = builder.reply_to(mailbox),
                Err(e) => tracing::warn!(reply_to = %reply_to, error = %e, "Ignoring invalid reply-to"),
            }
        }

        let message = match (&mail.text, &mail.html) {
            (Some(text), Some(html)) => builder.multipart(MultiPart::alternative_plain_html(
                text.clone(),
                html.clone(),
            )),
            (None, Some(html)) => builder.singlepart(SinglePart::html(html.clone())),
            (text, None) => builder
                .header(ContentType::TEXT_PLAIN)
                .body(text.clone().unwrap_or_default()),
        };

        message.map_err(|e| SendError::Permanent(format!("failed to build message: {}", e)))
    }
}

fn check_starttls(configured: bool, supported: bool) -> anyhow::Result<()> {
    match (configured, supported) {
        (true, false) => anyhow::bail!(
            "SMTP TLS configuration mismatch: configured to use TLS over SMTP, \
             but the mail server does not support the STARTTLS extension"
        ),
        (false, true) => anyhow::bail!(
            "SMTP TLS configuration mismatch: not configured to use TLS over SMTP, \
             but the mail server does support the STARTTLS extension"
        ),
        _ => Ok(()),
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, mail: &OutboundMail) -> Result<(), SendError> {
        let message = self.compose(mail)?;

        match self.transport.send(message).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_permanent() => Err(SendError::Permanent(e.to_string())),
            Err(e) => Err(SendError::Transient(e.to_string())),
        }
    }
}

//! Owner notification. Delivery is best effort: callers log failures and
//! never roll back the recorded violation.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::NotificationConfig;
use crate::violation_detection::TIMESTAMP_FORMAT;

pub const SUBJECT: &str = "Speed Violation Notice";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("violation timestamp {0:?} is not YYYYMMDD_HHMMSS")]
    Timestamp(String),
    #[error("cannot attach evidence image {path:?}")]
    Attachment {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid mail address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("cannot build message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp transport failed: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
}

/// What the owner is told about one violation.
#[derive(Debug, Clone, PartialEq)]
pub struct ViolationNotice {
    pub email: String,
    /// Metres per second.
    pub speed: f64,
    /// `YYYYMMDD_HHMMSS`.
    pub timestamp: String,
    pub image_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// No credentials configured; nothing was attempted.
    Disabled,
}

pub trait Notifier: Send {
    fn notify(&self, notice: &ViolationNotice) -> Result<Delivery, NotifyError>;
}

impl<N: Notifier + ?Sized> Notifier for Box<N> {
    fn notify(&self, notice: &ViolationNotice) -> Result<Delivery, NotifyError> {
        (**self).notify(notice)
    }
}

/// `20240309_140507` → `2024-03-09 14:05:07`.
pub fn format_timestamp(timestamp: &str) -> Result<String, NotifyError> {
    let parsed = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
        .map_err(|_| NotifyError::Timestamp(timestamp.to_string()))?;
    Ok(parsed.format("%Y-%m-%d %H:%M:%S").to_string())
}

pub fn compose_body(speed: f64, timestamp: &str) -> Result<String, NotifyError> {
    let when = format_timestamp(timestamp)?;
    Ok(format!(
        "Dear Driver,

This is an automated notification regarding a speed violation detected on {when}.

Details of the violation:
- Speed: {speed:.1} m/s
- Time: {when}

Please find attached the violation image for your reference.

This is an automated system. If you believe this is an error, please contact the traffic department.

Best regards,
Traffic Monitoring System
"
    ))
}

fn image_content_type(path: &Path) -> ContentType {
    let mime = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    };
    ContentType::parse(mime).unwrap_or(ContentType::TEXT_PLAIN)
}

/// Build the full message: plain-text body plus the evidence image.
pub fn build_message(sender: &Mailbox, notice: &ViolationNotice) -> Result<Message, NotifyError> {
    let body = compose_body(notice.speed, &notice.timestamp)?;
    let image = fs::read(&notice.image_path).map_err(|source| NotifyError::Attachment {
        path: notice.image_path.clone(),
        source,
    })?;
    let filename = notice
        .image_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "violation.jpg".to_string());

    let message = Message::builder()
        .from(sender.clone())
        .to(notice.email.parse::<Mailbox>()?)
        .subject(SUBJECT)
        .multipart(
            MultiPart::mixed()
                .singlepart(SinglePart::plain(body))
                .singlepart(
                    Attachment::new(filename).body(image, image_content_type(&notice.image_path)),
                ),
        )?;
    Ok(message)
}

/// Sends through an SMTP relay with STARTTLS.
pub struct SmtpNotifier {
    sender: Mailbox,
    transport: SmtpTransport,
}

impl SmtpNotifier {
    pub fn new(
        config: &NotificationConfig,
        user: &str,
        password: &str,
    ) -> Result<Self, NotifyError> {
        let transport = SmtpTransport::starttls_relay(&config.smtp_server)?
            .port(config.smtp_port)
            .credentials(Credentials::new(user.to_string(), password.to_string()))
            .build();
        Ok(Self {
            sender: user.parse::<Mailbox>()?,
            transport,
        })
    }
}

impl Notifier for SmtpNotifier {
    fn notify(&self, notice: &ViolationNotice) -> Result<Delivery, NotifyError> {
        let message = build_message(&self.sender, notice)?;
        self.transport.send(&message)?;
        info!("Violation notification sent to {}", notice.email);
        Ok(Delivery::Sent)
    }
}

/// Used when no credentials are configured.
#[derive(Debug, Default)]
pub struct DisabledNotifier;

impl Notifier for DisabledNotifier {
    fn notify(&self, notice: &ViolationNotice) -> Result<Delivery, NotifyError> {
        debug!(
            "Email credentials not configured, skipping notification to {}",
            notice.email
        );
        Ok(Delivery::Disabled)
    }
}

/// SMTP notifier when both credential variables are set, otherwise the
/// disabled one. Missing credentials are not an error.
pub fn notifier_from_env(config: &NotificationConfig) -> Result<Box<dyn Notifier>, NotifyError> {
    let user = env::var(&config.user_env).ok().filter(|v| !v.is_empty());
    let password = env::var(&config.password_env).ok().filter(|v| !v.is_empty());
    match (user, password) {
        (Some(user), Some(password)) => Ok(Box::new(SmtpNotifier::new(config, &user, &password)?)),
        _ => {
            warn!(
                "{} / {} not set, owner notifications are disabled",
                config.user_env, config.password_env
            );
            Ok(Box::new(DisabledNotifier))
        }
    }
}

//! Composes and delivers the mail for one marker: a notice when its run is
//! found and basecalling starts, then the outcome report. A marker whose
//! experiment directory cannot be placed gets a failure report instead.
//!
//! Delivery problems never change a marker's status. They are logged and
//! returned as [`DeliveryResult::Failed`] for the pipeline to record.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;

use crate::basecaller::InvocationResult;
use crate::config::MailConfig;
use crate::error::{PodwatchError, Result};
use crate::resolver::Resolution;
use crate::types::ExperimentRequest;
use crate::watch::MarkerEvent;

pub const SMTP_USER_ENV: &str = "SMTP_USER";
pub const SMTP_PASSWORD_ENV: &str = "SMTP_PASSWORD";

/// Lines of basecaller stderr quoted in a failure report.
const STDERR_TAIL_LINES: usize = 40;

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
}

fn subject(request: &ExperimentRequest, headline: &str) -> String {
    format!(
        "[podwatch] {headline}: {} ({} {})",
        request.date_stamp(),
        request.basecalling.method(),
        request.basecalling.model()
    )
}

/// Build the notice sent once a finished run is found and its basecaller is
/// about to start.
pub fn compose_started(
    request: &ExperimentRequest,
    event: &MarkerEvent,
    resolution: &Resolution,
    command_line: &str,
) -> Notification {
    let mut body = String::new();
    let _ = writeln!(
        body,
        "Sequencing of the {} experiment has finished. Basecalling is starting now.",
        request.date_stamp()
    );
    let _ = writeln!(body);
    write_context(&mut body, request, event);
    let _ = writeln!(body);
    let _ = writeln!(body, "Run");
    let _ = writeln!(body, "  Directory:     {}", resolution.experiment_dir.display());
    let _ = writeln!(body, "  Raw data:      {}", resolution.raw_dir.display());
    let _ = writeln!(body, "  Device:        {}", resolution.device_id);
    let _ = writeln!(body, "  Flow cell:     {}", resolution.flow_cell_id);
    let _ = writeln!(body, "  Command:       {command_line}");
    let _ = writeln!(body);
    let _ = writeln!(body, "A second message will follow when basecalling ends.");

    Notification {
        subject: subject(request, "Run finished, basecalling started"),
        body,
    }
}

/// Build the failure report for a marker whose experiment directory could
/// not be placed. No basecaller was run.
pub fn compose_unresolved(
    request: &ExperimentRequest,
    event: &MarkerEvent,
    reason: &PodwatchError,
) -> Notification {
    let mut body = String::new();
    let _ = writeln!(
        body,
        "A finished run was found for the {} experiment, but basecalling could not start.",
        request.date_stamp()
    );
    let _ = writeln!(body);
    write_context(&mut body, request, event);
    let _ = writeln!(body);
    let _ = writeln!(body, "Outcome");
    let _ = writeln!(body, "  Status:        FAILED");
    let _ = writeln!(body, "  Reason:        {reason}");
    let _ = writeln!(body);
    let _ = writeln!(
        body,
        "The marker is recorded as failed and will not be retried automatically."
    );

    Notification {
        subject: subject(request, "Basecalling FAILED"),
        body,
    }
}

/// Build the plain-text report for a finished basecalling attempt.
pub fn compose(
    request: &ExperimentRequest,
    event: &MarkerEvent,
    result: &InvocationResult,
) -> Notification {
    let status = if result.succeeded() { "succeeded" } else { "FAILED" };

    let mut body = String::new();
    let _ = writeln!(body, "Basecalling {status} for the {} experiment.", request.date_stamp());
    let _ = writeln!(body);
    write_context(&mut body, request, event);
    let _ = writeln!(body);
    let _ = writeln!(body, "Outcome");
    let _ = writeln!(body, "  Status:        {status}");
    let _ = writeln!(body, "  Command:       {}", result.command_line());
    let _ = writeln!(body, "  Duration:      {}", format_duration(result.duration.as_secs()));

    match &result.failure {
        None => {
            let _ = writeln!(body, "  Output:        {}", result.output_dir.display());
            for artifact in &result.artifacts {
                let _ = writeln!(body, "  Reads:         {}", artifact.display());
            }
        }
        Some(failure) => {
            let _ = writeln!(body, "  Reason:        {failure}");
            if let Some(code) = result.exit_code {
                let _ = writeln!(body, "  Exit code:     {code}");
            }
            let tail = tail_lines(&result.stderr, STDERR_TAIL_LINES);
            if !tail.is_empty() {
                let _ = writeln!(body);
                let _ = writeln!(body, "Last basecaller output (stderr):");
                for line in tail {
                    let _ = writeln!(body, "  {line}");
                }
            }
            let _ = writeln!(body);
            let _ = writeln!(
                body,
                "The marker is recorded as failed and will not be retried automatically."
            );
        }
    }

    Notification {
        subject: subject(request, &format!("Basecalling {status}")),
        body,
    }
}

/// The experiment and marker sections shared by every message.
fn write_context(body: &mut String, request: &ExperimentRequest, event: &MarkerEvent) {
    let _ = writeln!(body, "Experiment");
    let _ = writeln!(body, "  Date:          {}", request.date.format("%Y-%m-%d"));
    let _ = writeln!(body, "  Method:        {}", request.basecalling.method());
    let _ = writeln!(body, "  Model:         {}", request.basecalling.model());
    let _ = writeln!(body, "  Kit:           {}", request.kit);
    let _ = writeln!(body, "  Input type:    {}", request.input_type);
    let _ = writeln!(
        body,
        "  Sample type:   {}",
        request.sample_type.as_deref().unwrap_or("not given")
    );
    let _ = writeln!(
        body,
        "  Amplification: {}",
        request.amplification.as_deref().unwrap_or("not given")
    );
    let _ = writeln!(body);
    let _ = writeln!(body, "Marker");
    let _ = writeln!(body, "  File:          {}", event.marker.display());
    let _ = writeln!(
        body,
        "  Discovered:    {} ({})",
        event.discovered_at.format("%Y-%m-%d %H:%M:%S UTC"),
        event.origin
    );
}

fn tail_lines(text: &str, n: usize) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let skip = lines.len().saturating_sub(n);
    lines[skip..].to_vec()
}

fn format_duration(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

// ---------------------------------------------------------------------------
// Transports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryResult {
    Delivered { recipients: usize },
    Skipped { reason: String },
    Failed { reason: String },
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, recipients: &[String], notification: &Notification) -> Result<DeliveryResult>;
}

/// Authenticated SMTP with STARTTLS.
pub struct SmtpMailer {
    config: MailConfig,
    user: String,
    password: String,
}

impl SmtpMailer {
    pub fn new(config: MailConfig, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            config,
            user: user.into(),
            password: password.into(),
        }
    }

    /// Read credentials from `SMTP_USER` / `SMTP_PASSWORD`.
    pub fn from_env(config: MailConfig) -> Result<Self> {
        let user = std::env::var(SMTP_USER_ENV).ok().filter(|v| !v.is_empty());
        let password = std::env::var(SMTP_PASSWORD_ENV).ok().filter(|v| !v.is_empty());
        match (user, password) {
            (Some(user), Some(password)) => Ok(Self::new(config, user, password)),
            _ => Err(PodwatchError::Mail(format!(
                "SMTP credentials not found: set {SMTP_USER_ENV} and {SMTP_PASSWORD_ENV}"
            ))),
        }
    }

    fn build_message(&self, recipients: &[String], notification: &Notification) -> Result<Message> {
        let sender = self.config.from.as_deref().unwrap_or(&self.user);
        let from: Mailbox = sender
            .parse()
            .map_err(|e| PodwatchError::Mail(format!("invalid sender '{sender}': {e}")))?;
        let mut builder = Message::builder()
            .from(from)
            .subject(notification.subject.clone())
            .header(ContentType::TEXT_PLAIN);
        for r in recipients {
            let to: Mailbox = r
                .parse()
                .map_err(|e| PodwatchError::Mail(format!("invalid recipient '{r}': {e}")))?;
            builder = builder.to(to);
        }
        builder
            .body(notification.body.clone())
            .map_err(|e| PodwatchError::Mail(e.to_string()))
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, recipients: &[String], notification: &Notification) -> Result<DeliveryResult> {
        let message = self.build_message(recipients, notification)?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.server)
            .map_err(|e| PodwatchError::Mail(e.to_string()))?
            .port(self.config.port)
            .credentials(Credentials::new(self.user.clone(), self.password.clone()))
            .build();
        transport
            .send(message)
            .await
            .map_err(|e| PodwatchError::Mail(e.to_string()))?;
        Ok(DeliveryResult::Delivered {
            recipients: recipients.len(),
        })
    }
}

/// Logs the report instead of sending it.
pub struct LogMailer {
    reason: String,
}

impl LogMailer {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl MailTransport for LogMailer {
    async fn send(&self, recipients: &[String], notification: &Notification) -> Result<DeliveryResult> {
        tracing::info!(
            recipients = %recipients.join(", "),
            subject = %notification.subject,
            "mail not sent ({}):\n{}",
            self.reason,
            notification.body
        );
        Ok(DeliveryResult::Skipped {
            reason: self.reason.clone(),
        })
    }
}

/// Pick the transport for `config`, falling back to logging when mail is
/// disabled or credentials are missing.
pub fn transport_from_config(config: &MailConfig) -> Arc<dyn MailTransport> {
    if !config.enabled {
        return Arc::new(LogMailer::new("mail disabled in configuration"));
    }
    match SmtpMailer::from_env(config.clone()) {
        Ok(mailer) => Arc::new(mailer),
        Err(e) => {
            tracing::error!("{e}; notifications will only be logged");
            Arc::new(LogMailer::new(e.to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn MailTransport>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn MailTransport>) -> Self {
        Self { transport }
    }

    /// Compose and deliver the outcome report. Never fails; problems come
    /// back as `DeliveryResult::Failed`.
    pub async fn notify(
        &self,
        request: &ExperimentRequest,
        event: &MarkerEvent,
        result: &InvocationResult,
    ) -> DeliveryResult {
        self.deliver(request, event, compose(request, event, result))
            .await
    }

    /// Announce that basecalling is starting for a resolved marker.
    pub async fn notify_started(
        &self,
        request: &ExperimentRequest,
        event: &MarkerEvent,
        resolution: &Resolution,
        command_line: &str,
    ) -> DeliveryResult {
        let notification = compose_started(request, event, resolution, command_line);
        self.deliver(request, event, notification).await
    }

    /// Report a marker that could not be placed in an experiment directory.
    pub async fn notify_unresolved(
        &self,
        request: &ExperimentRequest,
        event: &MarkerEvent,
        reason: &PodwatchError,
    ) -> DeliveryResult {
        self.deliver(request, event, compose_unresolved(request, event, reason))
            .await
    }

    async fn deliver(
        &self,
        request: &ExperimentRequest,
        event: &MarkerEvent,
        notification: Notification,
    ) -> DeliveryResult {
        match self.transport.send(&request.recipients, &notification).await {
            Ok(delivery) => {
                if let DeliveryResult::Delivered { recipients } = &delivery {
                    tracing::info!(recipients, subject = %notification.subject, "notification sent");
                }
                delivery
            }
            Err(e) => {
                tracing::error!(marker = %event.marker.display(), "notification failed: {e}");
                DeliveryResult::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

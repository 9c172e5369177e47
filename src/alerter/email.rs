use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;

use crate::config::EmailConfig;
use crate::error::{MonitorError, Result};
use crate::types::{AlertRecord, AlertState};
use super::{ChannelKind, NotificationChannel};

/// SMTP alert channel. Addresses are parsed once, at startup.
pub struct EmailChannel {
    from: Mailbox,
    to: Vec<Mailbox>,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailChannel {
    pub fn new(config: &EmailConfig, timeout: Duration) -> Result<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| MonitorError::config(format!("email from address {:?}: {}", config.from, e)))?;

        let to = config
            .to
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>()
                    .map_err(|e| MonitorError::config(format!("email recipient {:?}: {}", addr, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut builder = if config.smtp_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .map_err(|e| MonitorError::config(format!("smtp relay {}: {}", config.smtp_host, e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        };
        builder = builder.port(config.smtp_port).timeout(Some(timeout));

        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(config.username.clone(), config.password.clone()));
        }

        Ok(Self { from, to, mailer: builder.build() })
    }
}

pub(crate) fn subject(alert: &AlertRecord) -> String {
    match alert.state {
        AlertState::Resolved => format!("[RESOLVED] {} on {}", alert.metric, alert.hostname),
        _ => format!("[{}] {} on {}", alert.level, alert.metric, alert.hostname),
    }
}

pub(crate) fn body(alert: &AlertRecord) -> String {
    let mut body = format!(
        "{}\n\nHost: {}\nMetric: {}\nValue: {:.2}\nLevel: {}\nState: {}\nFirst fired: {}\nFires: {} (suppressed repeats: {})\n",
        alert.message,
        alert.hostname,
        alert.metric,
        alert.observed_value,
        alert.level,
        alert.state.as_str(),
        alert.created_at.to_rfc3339(),
        alert.fire_count,
        alert.repeat_count,
    );
    if let Some(resolved) = alert.resolved_at {
        body.push_str(&format!("Resolved: {}\n", resolved.to_rfc3339()));
    }
    body.push_str(&format!("Alert id: {}\n", alert.id));
    body
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str { "email" }

    fn kind(&self) -> ChannelKind { ChannelKind::Email }

    async fn send(&self, alert: &AlertRecord) -> Result<()> {
        let mut message = Message::builder().from(self.from.clone()).subject(subject(alert));
        for to in &self.to {
            message = message.to(to.clone());
        }
        let message = message
            .header(ContentType::TEXT_PLAIN)
            .body(body(alert))
            .map_err(|e| MonitorError::delivery("email", e))?;

        self.mailer
            .send(message)
            .await
            .map_err(|e| MonitorError::delivery("email", e))?;

        tracing::debug!(alert_id = %alert.id, recipients = self.to.len(), "Alert email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertLevel, Direction};
    use chrono::Utc;
    use uuid::Uuid;

    fn config() -> EmailConfig {
        EmailConfig {
            smtp_host: "smtp.example.com".into(),
            smtp_port: 587,
            smtp_tls: true,
            username: String::new(),
            password: String::new(),
            from: "monitor@example.com".into(),
            to: vec!["ops@example.com".into()],
        }
    }

    #[test]
    fn rejects_bad_recipient() {
        let mut cfg = config();
        cfg.to.push("not an address".into());
        let err = EmailChannel::new(&cfg, Duration::from_secs(5)).err().unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn builds_with_valid_addresses() {
        let channel = EmailChannel::new(&config(), Duration::from_secs(5)).unwrap();
        assert_eq!(channel.name(), "email");
        assert_eq!(channel.to.len(), 1);
    }

    #[test]
    fn resolved_alerts_get_a_recovery_subject() {
        let now = Utc::now();
        let mut alert = AlertRecord {
            id: Uuid::new_v4(),
            level: AlertLevel::Critical,
            metric: "cpu_usage".into(),
            direction: Direction::HigherIsBad,
            dedup_key: "cpu_usage:higher_is_bad".into(),
            message: "cpu_usage is 85.00 (critical threshold: 80.00)".into(),
            observed_value: 85.0,
            hostname: "worker-1".into(),
            created_at: now,
            last_fired_at: now,
            resolved_at: None,
            state: AlertState::Active,
            fire_count: 1,
            repeat_count: 0,
            critical_fires: 1,
            deliveries: Vec::new(),
        };
        assert_eq!(subject(&alert), "[CRITICAL] cpu_usage on worker-1");

        alert.state = AlertState::Resolved;
        alert.resolved_at = Some(now);
        assert_eq!(subject(&alert), "[RESOLVED] cpu_usage on worker-1");
        assert!(body(&alert).contains("Resolved:"));
    }
}

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::error::{AppError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_FROM: &str = "apptrack <reminders@apptrack.local>";

// --- Sink trait ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub message_id: Option<String>,
}

pub trait EmailSink: Send + Sync {
    fn deliver(&self, email: &OutgoingEmail) -> Result<DeliveryReceipt>;
}

// --- Configuration ---

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub from: Option<String>,
}

impl MailConfig {
    /// Both relay settings present and not left at a sample value.
    pub fn is_configured(&self) -> bool {
        let real = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .is_some_and(|v| !v.is_empty() && !v.starts_with("your-") && !v.contains("example.com"))
        };
        real(&self.api_url) && real(&self.api_key)
    }

    pub fn from_address(&self) -> &str {
        self.from.as_deref().unwrap_or(DEFAULT_FROM)
    }
}

// --- HTTP relay ---

#[derive(Debug, Serialize)]
struct RelayRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
    html: &'a str,
}

/// Posts mail as JSON to a transactional-mail HTTP relay.
#[derive(Debug, Clone)]
pub struct HttpMailer {
    api_url: String,
    api_key: String,
    from: String,
}

impl HttpMailer {
    pub fn new(config: &MailConfig) -> Result<Self> {
        if !config.is_configured() {
            return Err(AppError::EmailNotConfigured);
        }
        Ok(Self {
            api_url: config.api_url.clone().unwrap_or_default(),
            api_key: config.api_key.clone().unwrap_or_default(),
            from: config.from_address().to_string(),
        })
    }

    // The blocking client owns a runtime of its own, so it is built and
    // dropped on the calling thread rather than stored.
    fn client(&self) -> Result<reqwest::blocking::Client> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build mail relay client")?;
        Ok(client)
    }
}

impl EmailSink for HttpMailer {
    fn deliver(&self, email: &OutgoingEmail) -> Result<DeliveryReceipt> {
        let request = RelayRequest {
            from: &self.from,
            to: &email.to,
            subject: &email.subject,
            text: &email.text,
            html: &email.html,
        };

        let response = self
            .client()?
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .map_err(|e| AppError::Delivery(format!("Failed to reach mail relay: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(AppError::Delivery(format!(
                "Mail relay rejected message with status {}: {}",
                status, error_text
            )));
        }

        let body: serde_json::Value = response.json().unwrap_or_default();
        let message_id = ["id", "messageId", "message_id"]
            .iter()
            .find_map(|key| body.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string);

        tracing::info!(to = %email.to, message_id = ?message_id, "Email sent");
        Ok(DeliveryReceipt { message_id })
    }
}

// --- Composition ---

pub fn reminder_email(to: &str, company: &str, role: &str, follow_up: DateTime<Utc>) -> OutgoingEmail {
    let date = follow_up.format("%Y-%m-%d").to_string();
    let subject = format!("Follow-up Reminder: {} - {}", company, role);

    let text = format!(
        "Hi there!\n\n\
         This is a reminder to follow up on your job application:\n\n\
         Company: {company}\n\
         Role: {role}\n\
         Follow-up Date: {date}\n\n\
         Don't forget to reach out and show your continued interest!\n\n\
         Best of luck,\n\
         apptrack\n"
    );

    let html = format!(
        r#"<!DOCTYPE html>
<html>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
  <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
    <h1 style="background: #4F46E5; color: white; padding: 20px; margin: 0;">Follow-up Reminder</h1>
    <p>Hi there!</p>
    <p>This is a reminder to follow up on your job application:</p>
    <p><strong>Company:</strong> {}</p>
    <p><strong>Role:</strong> {}</p>
    <p><strong>Follow-up Date:</strong> {}</p>
    <p>Don't forget to reach out and show your continued interest!</p>
    <p>Best of luck,<br>apptrack</p>
  </div>
</body>
</html>
"#,
        escape_html(company),
        escape_html(role),
        date
    );

    OutgoingEmail {
        to: to.to_string(),
        subject,
        text,
        html,
    }
}

pub fn test_email(to: &str) -> OutgoingEmail {
    OutgoingEmail {
        to: to.to_string(),
        subject: "Test Email from apptrack".to_string(),
        text: "If you received this email, your email configuration is working correctly!".to_string(),
        html: "<div style=\"font-family: Arial, sans-serif; padding: 20px;\">\
               <h2 style=\"color: #4F46E5;\">Email Configuration Working!</h2>\
               <p>If you received this email, your apptrack email configuration is set up correctly.</p>\
               <p>You can now receive follow-up reminders for your job applications.</p>\
               </div>"
            .to_string(),
    }
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
pub mod testing {
    //! In-memory sinks for tests.

    use super::*;
    use parking_lot::Mutex;

    /// Records every message; fails for addresses listed in `fail_for`.
    #[derive(Default)]
    pub struct RecordingSink {
        pub sent: Mutex<Vec<OutgoingEmail>>,
        pub fail_for: Vec<String>,
    }

    impl RecordingSink {
        pub fn failing_for(addresses: &[&str]) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_for: addresses.iter().map(|a| a.to_string()).collect(),
            }
        }

        pub fn count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    impl EmailSink for RecordingSink {
        fn deliver(&self, email: &OutgoingEmail) -> Result<DeliveryReceipt> {
            if self.fail_for.contains(&email.to) {
                return Err(AppError::Delivery("relay unavailable".to_string()));
            }
            let mut sent = self.sent.lock();
            sent.push(email.clone());
            Ok(DeliveryReceipt {
                message_id: Some(format!("msg-{}", sent.len())),
            })
        }
    }
}

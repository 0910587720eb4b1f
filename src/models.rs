use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Applied,
    Interview,
    Offer,
    Rejected,
    Ghosted,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Applied,
        Status::Interview,
        Status::Offer,
        Status::Rejected,
        Status::Ghosted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Applied => "applied",
            Status::Interview => "interview",
            Status::Offer => "offer",
            Status::Rejected => "rejected",
            Status::Ghosted => "ghosted",
        }
    }

    /// Offers and rejections no longer need a follow-up.
    pub fn is_active(self) -> bool {
        !matches!(self, Status::Offer | Status::Rejected)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "Invalid status '{}'. Expected one of: applied, interview, offer, rejected, ghosted",
                    s
                )
            })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::Low, Priority::Medium, Priority::High];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::High => "HIGH",
        }
    }

    /// Sort rank: most urgent first when ascending.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Priority::ALL
            .into_iter()
            .find(|priority| priority.as_str() == s)
            .ok_or_else(|| format!("Invalid priority '{}'. Expected one of: LOW, MEDIUM, HIGH", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: String,
    pub user_id: String,
    pub company: String,
    pub role: String,
    pub status: Status,
    pub priority: Priority,
    pub applied_date: NaiveDate,
    pub follow_up_date: Option<DateTime<Utc>>,
    pub reminder_sent_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub recruiter_name: Option<String>,
    pub job_url: Option<String>,
    pub salary: Option<i64>,
    pub currency: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A validated application that has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationDraft {
    pub company: String,
    pub role: String,
    pub status: Status,
    pub priority: Priority,
    pub applied_date: NaiveDate,
    pub follow_up_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub recruiter_name: Option<String>,
    pub job_url: Option<String>,
    pub salary: Option<i64>,
    pub currency: Option<String>,
    pub tags: Vec<String>,
}

/// Sparse update. `None` leaves a field alone; for nullable fields
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplicationPatch {
    pub company: Option<String>,
    pub role: Option<String>,
    pub status: Option<Status>,
    pub priority: Option<Priority>,
    pub applied_date: Option<NaiveDate>,
    pub follow_up_date: Option<Option<DateTime<Utc>>>,
    pub notes: Option<Option<String>>,
    pub recruiter_name: Option<Option<String>>,
    pub job_url: Option<Option<String>>,
    pub salary: Option<Option<i64>>,
    pub currency: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
}

impl ApplicationPatch {
    pub fn is_empty(&self) -> bool {
        *self == ApplicationPatch::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub const DATE_FORMATS: [&str; 3] = ["DD/MM/YYYY", "MM/DD/YYYY", "YYYY-MM-DD"];
pub const THEMES: [&str; 3] = ["light", "dark", "system"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreferences {
    pub default_status: Status,
    pub default_priority: Priority,
    pub default_currency: String,
    pub date_format: String,
    pub theme: String,
    pub accent_color: String,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            default_status: Status::Applied,
            default_priority: Priority::Medium,
            default_currency: "USD".to_string(),
            date_format: "DD/MM/YYYY".to_string(),
            theme: "system".to_string(),
            accent_color: "indigo".to_string(),
        }
    }
}

/// What `GET /settings` returns: identity plus preferences.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub name: Option<String>,
    pub email: String,
    #[serde(flatten)]
    pub preferences: UserPreferences,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreferencesPatch {
    pub name: Option<Option<String>>,
    pub default_status: Option<Status>,
    pub default_priority: Option<Priority>,
    pub default_currency: Option<String>,
    pub date_format: Option<String>,
    pub theme: Option<String>,
    pub accent_color: Option<String>,
}

impl PreferencesPatch {
    pub fn is_empty(&self) -> bool {
        *self == PreferencesPatch::default()
    }
}

/// Owner address joined onto a due application for the reminder sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct DueReminder {
    pub application: Application,
    pub email: String,
}

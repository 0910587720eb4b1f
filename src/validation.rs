use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Deserializer};

use crate::error::{AppError, FieldErrors, Result};
use crate::models::{
    ApplicationDraft, ApplicationPatch, DATE_FORMATS, PreferencesPatch, Priority, Status, THEMES,
    UserPreferences,
};

pub const MAX_COMPANY_LEN: usize = 100;
pub const MAX_ROLE_LEN: usize = 100;
pub const MAX_RECRUITER_LEN: usize = 100;
pub const MAX_NOTES_LEN: usize = 2000;
pub const MAX_CURRENCY_LEN: usize = 10;
pub const MAX_TAGS: usize = 10;
pub const MAX_TAG_LEN: usize = 50;
pub const MAX_NAME_LEN: usize = 100;
pub const MAX_ACCENT_LEN: usize = 20;

/// Body of `POST /applications`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateApplicationRequest {
    pub company: Option<String>,
    pub role: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub applied_date: Option<String>,
    pub follow_up_date: Option<String>,
    pub notes: Option<String>,
    pub recruiter_name: Option<String>,
    pub job_url: Option<String>,
    pub salary: Option<serde_json::Value>,
    pub currency: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// Body of `PATCH /applications/{id}`. The outer `Option` says whether the
/// key was present at all, the inner one whether it was `null`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateApplicationRequest {
    #[serde(default, deserialize_with = "nullable")]
    pub company: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub role: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub status: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub priority: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub applied_date: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub follow_up_date: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub notes: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub recruiter_name: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub job_url: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub salary: Option<Option<serde_json::Value>>,
    #[serde(default, deserialize_with = "nullable")]
    pub currency: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub tags: Option<Option<Vec<String>>>,
}

/// Body of `PATCH /settings`. Keys outside this allow-list are dropped.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesRequest {
    #[serde(default, deserialize_with = "nullable")]
    pub name: Option<Option<String>>,
    pub default_status: Option<String>,
    pub default_priority: Option<String>,
    pub default_currency: Option<String>,
    pub date_format: Option<String>,
    pub theme: Option<String>,
    pub accent_color: Option<String>,
}

fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Default)]
struct Collector {
    errors: FieldErrors,
}

impl Collector {
    fn push(&mut self, field: &str, message: impl Into<String>) {
        self.errors
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    fn finish<T>(self, value: T) -> Result<T> {
        if self.errors.is_empty() {
            Ok(value)
        } else {
            Err(self.into_error())
        }
    }

    fn into_error(self) -> AppError {
        AppError::Validation {
            details: self.errors,
        }
    }

    fn required_text(&mut self, field: &str, label: &str, value: &str, max: usize) -> String {
        let value = value.trim();
        if value.is_empty() {
            self.push(field, format!("{} is required", label));
        } else if value.chars().count() > max {
            self.push(field, format!("{} must be less than {} characters", label, max));
        }
        value.to_string()
    }

    fn optional_text(&mut self, field: &str, label: &str, value: Option<String>, max: usize) -> Option<String> {
        let value = value?;
        if value.chars().count() > max {
            self.push(field, format!("{} must be less than {} characters", label, max));
        }
        Some(value)
    }

    fn status(&mut self, field: &str, value: &str) -> Option<Status> {
        match value.parse() {
            Ok(status) => Some(status),
            Err(message) => {
                self.push(field, message);
                None
            }
        }
    }

    fn priority(&mut self, field: &str, value: &str) -> Option<Priority> {
        match value.parse() {
            Ok(priority) => Some(priority),
            Err(message) => {
                self.push(field, message);
                None
            }
        }
    }

    fn applied_date(&mut self, value: &str) -> Option<NaiveDate> {
        let parsed = parse_date(value);
        if parsed.is_none() {
            self.push("appliedDate", "Invalid date format");
        }
        parsed
    }

    /// Empty string counts as "no follow-up".
    fn follow_up_date(&mut self, value: Option<String>) -> Option<DateTime<Utc>> {
        let value = value.filter(|v| !v.trim().is_empty())?;
        let parsed = parse_datetime(&value);
        if parsed.is_none() {
            self.push("followUpDate", "Invalid follow-up date format");
        }
        parsed
    }

    fn job_url(&mut self, value: Option<String>) -> Option<String> {
        let value = value.filter(|v| !v.trim().is_empty())?;
        if url::Url::parse(value.trim()).is_err() {
            self.push("jobUrl", "Invalid URL format");
        }
        Some(value.trim().to_string())
    }

    fn salary(&mut self, value: Option<serde_json::Value>) -> Option<i64> {
        match value? {
            serde_json::Value::Null => None,
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(v) if v > 0 => Some(v),
                Some(_) => {
                    self.push("salary", "Salary must be a positive number");
                    None
                }
                None => {
                    self.push("salary", "Salary must be a whole number");
                    None
                }
            },
            _ => {
                self.push("salary", "Salary must be a number");
                None
            }
        }
    }

    fn tags(&mut self, tags: Vec<String>) -> Vec<String> {
        if tags.len() > MAX_TAGS {
            self.push("tags", format!("Maximum {} tags allowed", MAX_TAGS));
        }
        if tags.iter().any(|t| t.chars().count() > MAX_TAG_LEN) {
            self.push("tags", format!("Tags must be at most {} characters", MAX_TAG_LEN));
        }
        tags
    }
}

/// Validates a create payload. Omitted status, priority and currency fall
/// back to the owner's preferences.
pub fn validate_create(req: CreateApplicationRequest, prefs: &UserPreferences) -> Result<ApplicationDraft> {
    let mut c = Collector::default();

    let company = c.required_text("company", "Company name", req.company.as_deref().unwrap_or(""), MAX_COMPANY_LEN);
    let role = c.required_text("role", "Role", req.role.as_deref().unwrap_or(""), MAX_ROLE_LEN);
    let status = match req.status.as_deref() {
        Some(s) => c.status("status", s).unwrap_or(prefs.default_status),
        None => prefs.default_status,
    };
    let priority = match req.priority.as_deref() {
        Some(p) => c.priority("priority", p).unwrap_or(prefs.default_priority),
        None => prefs.default_priority,
    };
    let applied_date = match req.applied_date.as_deref() {
        Some(d) => c.applied_date(d),
        None => {
            c.push("appliedDate", "Applied date is required");
            None
        }
    };
    let follow_up_date = c.follow_up_date(req.follow_up_date);
    let notes = c.optional_text("notes", "Notes", req.notes, MAX_NOTES_LEN);
    let recruiter_name = c.optional_text("recruiterName", "Recruiter name", req.recruiter_name, MAX_RECRUITER_LEN);
    let job_url = c.job_url(req.job_url);
    let salary = c.salary(req.salary);
    let currency = c
        .optional_text("currency", "Currency code", req.currency, MAX_CURRENCY_LEN)
        .unwrap_or_else(|| prefs.default_currency.clone());
    let tags = c.tags(req.tags.unwrap_or_default());

    let Some(applied_date) = applied_date else {
        return Err(c.into_error());
    };

    c.finish(ApplicationDraft {
        company,
        role,
        status,
        priority,
        applied_date,
        follow_up_date,
        notes,
        recruiter_name,
        job_url,
        salary,
        currency: Some(currency),
        tags,
    })
}

/// Validates a partial update. At least one known field must be present.
pub fn validate_update(req: UpdateApplicationRequest) -> Result<ApplicationPatch> {
    let mut c = Collector::default();
    let mut patch = ApplicationPatch::default();

    if let Some(company) = req.company {
        match company {
            Some(v) => patch.company = Some(c.required_text("company", "Company name", &v, MAX_COMPANY_LEN)),
            None => c.push("company", "Company name is required"),
        }
    }
    if let Some(role) = req.role {
        match role {
            Some(v) => patch.role = Some(c.required_text("role", "Role", &v, MAX_ROLE_LEN)),
            None => c.push("role", "Role is required"),
        }
    }
    if let Some(status) = req.status {
        match status {
            Some(v) => patch.status = c.status("status", &v),
            None => c.push("status", "Status cannot be null"),
        }
    }
    if let Some(priority) = req.priority {
        match priority {
            Some(v) => patch.priority = c.priority("priority", &v),
            None => c.push("priority", "Priority cannot be null"),
        }
    }
    if let Some(applied) = req.applied_date {
        match applied {
            Some(v) => patch.applied_date = c.applied_date(&v),
            None => c.push("appliedDate", "Applied date is required"),
        }
    }
    if let Some(follow_up) = req.follow_up_date {
        patch.follow_up_date = Some(c.follow_up_date(follow_up));
    }
    if let Some(notes) = req.notes {
        patch.notes = Some(c.optional_text("notes", "Notes", notes, MAX_NOTES_LEN));
    }
    if let Some(recruiter) = req.recruiter_name {
        patch.recruiter_name = Some(c.optional_text("recruiterName", "Recruiter name", recruiter, MAX_RECRUITER_LEN));
    }
    if let Some(job_url) = req.job_url {
        patch.job_url = Some(c.job_url(job_url));
    }
    if let Some(salary) = req.salary {
        patch.salary = Some(c.salary(salary));
    }
    if let Some(currency) = req.currency {
        patch.currency = Some(c.optional_text("currency", "Currency code", currency, MAX_CURRENCY_LEN));
    }
    if let Some(tags) = req.tags {
        patch.tags = Some(c.tags(tags.unwrap_or_default()));
    }

    let patch = c.finish(patch)?;
    if patch.is_empty() {
        return Err(AppError::validation("root", "At least one field is required to update"));
    }
    Ok(patch)
}

pub fn validate_preferences(req: PreferencesRequest) -> Result<PreferencesPatch> {
    let mut c = Collector::default();
    let mut patch = PreferencesPatch::default();

    if let Some(name) = req.name {
        patch.name = Some(c.optional_text("name", "Name", name, MAX_NAME_LEN));
    }
    if let Some(status) = req.default_status {
        patch.default_status = c.status("defaultStatus", &status);
    }
    if let Some(priority) = req.default_priority {
        patch.default_priority = c.priority("defaultPriority", &priority);
    }
    if let Some(currency) = req.default_currency {
        patch.default_currency = Some(c.required_text("defaultCurrency", "Currency code", &currency, MAX_CURRENCY_LEN));
    }
    if let Some(format) = req.date_format {
        if !DATE_FORMATS.contains(&format.as_str()) {
            c.push("dateFormat", format!("Date format must be one of: {}", DATE_FORMATS.join(", ")));
        }
        patch.date_format = Some(format);
    }
    if let Some(theme) = req.theme {
        if !THEMES.contains(&theme.as_str()) {
            c.push("theme", format!("Theme must be one of: {}", THEMES.join(", ")));
        }
        patch.theme = Some(theme);
    }
    if let Some(accent) = req.accent_color {
        patch.accent_color = Some(c.required_text("accentColor", "Accent color", &accent, MAX_ACCENT_LEN));
    }

    c.finish(patch)
}

/// Parses the calendar date part of a user-supplied date or date-time.
pub fn parse_date(input: &str) -> Option<NaiveDate> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    for format in ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(input, format) {
            return Some(date);
        }
    }
    parse_datetime(input).map(|dt| dt.date_naive())
}

/// Parses a user-supplied date-time. Date-only input means midnight UTC.
pub fn parse_datetime(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Some(naive.and_utc());
        }
    }
    for format in ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(input, format) {
            return Some(date.and_time(NaiveTime::MIN).and_utc());
        }
    }
    None
}

/// Cuts a string to at most `max` characters.
pub fn clamp_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

/// Trims tags, drops empties and enforces the tag limits.
pub fn normalize_tags<'a>(raw: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    raw.into_iter()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| clamp_chars(t, MAX_TAG_LEN))
        .take(MAX_TAGS)
        .collect()
}

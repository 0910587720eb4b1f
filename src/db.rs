use anyhow::Context;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};
use crate::models::{
    Application, ApplicationDraft, ApplicationPatch, DueReminder, PreferencesPatch, Priority,
    Settings, Status, User, UserPreferences,
};
use crate::query::{ListQuery, SortBy};

const APPLICATION_COLUMNS: &str = "a.id, a.user_id, a.company, a.role, a.status, a.priority,
     a.applied_date, a.follow_up_date, a.reminder_sent_at, a.notes, a.recruiter_name,
     a.job_url, a.salary, a.currency, a.tags, a.created_at, a.updated_at";

const USER_COLUMNS: &str = "id, email, name, created_at, default_status, default_priority,
     default_currency, date_format, theme, accent_color";

/// Predicate shared by every reminder query: due, not yet notified, still active.
const REMINDER_DUE: &str = "a.follow_up_date IS NOT NULL AND a.follow_up_date <= ?1
     AND a.reminder_sent_at IS NULL AND a.status NOT IN ('offer', 'rejected')";

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::configure(conn, path.to_path_buf())
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self::configure(conn, PathBuf::from(":memory:"))?;
        db.init()?;
        Ok(db)
    }

    fn configure(conn: Connection, path: PathBuf) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
        // SQLite's LOWER() only folds ASCII.
        conn.create_scalar_function(
            "unicode_lower",
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let value: Option<String> = ctx.get(0)?;
                Ok(value.map(|v| v.to_lowercase()))
            },
        )?;
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn default_path() -> PathBuf {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "apptrack") {
            proj_dirs.data_dir().join("apptrack.db")
        } else {
            PathBuf::from("apptrack.db")
        }
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT,
                default_status TEXT NOT NULL DEFAULT 'applied'
                    CHECK (default_status IN ('applied', 'interview', 'offer', 'rejected', 'ghosted')),
                default_priority TEXT NOT NULL DEFAULT 'MEDIUM'
                    CHECK (default_priority IN ('LOW', 'MEDIUM', 'HIGH')),
                default_currency TEXT NOT NULL DEFAULT 'USD',
                date_format TEXT NOT NULL DEFAULT 'DD/MM/YYYY',
                theme TEXT NOT NULL DEFAULT 'system',
                accent_color TEXT NOT NULL DEFAULT 'indigo',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS applications (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                company TEXT NOT NULL,
                role TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'applied'
                    CHECK (status IN ('applied', 'interview', 'offer', 'rejected', 'ghosted')),
                priority TEXT NOT NULL DEFAULT 'MEDIUM' CHECK (priority IN ('LOW', 'MEDIUM', 'HIGH')),
                applied_date TEXT NOT NULL,
                follow_up_date TEXT,
                reminder_sent_at TEXT,
                notes TEXT,
                recruiter_name TEXT,
                job_url TEXT,
                salary INTEGER,
                currency TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (reminder_sent_at IS NULL OR follow_up_date IS NOT NULL)
            );

            CREATE INDEX IF NOT EXISTS idx_applications_user ON applications(user_id);
            CREATE INDEX IF NOT EXISTS idx_applications_status ON applications(status);
            CREATE INDEX IF NOT EXISTS idx_applications_follow_up
                ON applications(follow_up_date) WHERE reminder_sent_at IS NULL;
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='applications'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow::anyhow!("Database not initialized. Run 'apptrack init' first.").into());
        }
        Ok(())
    }

    // --- User operations ---

    /// Creates the user on first sight. Later calls follow an email change
    /// and fill in a missing name; a stored name is kept.
    pub fn upsert_user(&self, id: &str, email: &str, name: Option<&str>) -> Result<User> {
        self.conn.execute(
            "INSERT INTO users (id, email, name, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                name = COALESCE(users.name, excluded.name)",
            params![id, email, name, format_ts(&Utc::now())],
        )?;
        self.get_user(id)?
            .ok_or_else(|| AppError::NotFound("User".to_string()))
    }

    pub fn get_or_create_user_by_email(&self, email: &str) -> Result<User> {
        if let Some(user) = self.get_user_by_email(email)? {
            return Ok(user);
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.upsert_user(&id, email, None)
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
        Ok(self.conn.query_row(&sql, [id], row_to_user).optional()?)
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE unicode_lower(email) = unicode_lower(?1)", USER_COLUMNS);
        Ok(self.conn.query_row(&sql, [email], row_to_user).optional()?)
    }

    /// Deletes the user; their applications go with them.
    pub fn delete_user(&self, id: &str) -> Result<bool> {
        let removed = self.conn.execute("DELETE FROM users WHERE id = ?1", [id])?;
        Ok(removed > 0)
    }

    pub fn get_settings(&self, user_id: &str) -> Result<Option<Settings>> {
        let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
        Ok(self.conn.query_row(&sql, [user_id], row_to_settings).optional()?)
    }

    /// Preferences of an unknown user are the defaults.
    pub fn get_preferences(&self, user_id: &str) -> Result<UserPreferences> {
        Ok(self
            .get_settings(user_id)?
            .map(|s| s.preferences)
            .unwrap_or_default())
    }

    pub fn update_preferences(&self, user_id: &str, patch: &PreferencesPatch) -> Result<Option<Settings>> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(name) = &patch.name {
            sets.push("name");
            values.push(opt_text(name.as_deref()));
        }
        if let Some(status) = patch.default_status {
            sets.push("default_status");
            values.push(text(status.as_str()));
        }
        if let Some(priority) = patch.default_priority {
            sets.push("default_priority");
            values.push(text(priority.as_str()));
        }
        if let Some(currency) = &patch.default_currency {
            sets.push("default_currency");
            values.push(text(currency));
        }
        if let Some(format) = &patch.date_format {
            sets.push("date_format");
            values.push(text(format));
        }
        if let Some(theme) = &patch.theme {
            sets.push("theme");
            values.push(text(theme));
        }
        if let Some(accent) = &patch.accent_color {
            sets.push("accent_color");
            values.push(text(accent));
        }

        if !sets.is_empty() {
            let assignments: Vec<String> = sets
                .iter()
                .enumerate()
                .map(|(i, column)| format!("{} = ?{}", column, i + 1))
                .collect();
            let sql = format!(
                "UPDATE users SET {} WHERE id = ?{}",
                assignments.join(", "),
                values.len() + 1
            );
            values.push(text(user_id));
            self.conn.execute(&sql, params_from_iter(values))?;
        }

        self.get_settings(user_id)
    }

    // --- Application operations ---

    pub fn insert_application(&self, user_id: &str, draft: &ApplicationDraft, now: DateTime<Utc>) -> Result<Application> {
        let id = insert_draft(&self.conn, user_id, draft, now)?;
        self.get_application(&id)?
            .ok_or_else(|| AppError::NotFound("Application".to_string()))
    }

    /// Inserts every draft in one transaction.
    pub fn insert_applications(&self, user_id: &str, drafts: &[ApplicationDraft], now: DateTime<Utc>) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        for draft in drafts {
            insert_draft(&tx, user_id, draft, now)?;
        }
        tx.commit()?;
        Ok(drafts.len())
    }

    pub fn get_application(&self, id: &str) -> Result<Option<Application>> {
        let sql = format!("SELECT {} FROM applications a WHERE a.id = ?1", APPLICATION_COLUMNS);
        Ok(self.conn.query_row(&sql, [id], row_to_application).optional()?)
    }

    /// Loads an application the caller owns: 404 when missing, 403 when
    /// it belongs to someone else.
    pub fn owned_application(&self, user_id: &str, id: &str) -> Result<Application> {
        let app = self
            .get_application(id)?
            .ok_or_else(|| AppError::NotFound("Application".to_string()))?;
        if app.user_id != user_id {
            return Err(AppError::Forbidden);
        }
        Ok(app)
    }

    /// Applies a sparse patch. Changing the follow-up date clears
    /// `reminder_sent_at` so the new date gets its own reminder.
    pub fn update_application(&self, user_id: &str, id: &str, patch: &ApplicationPatch, now: DateTime<Utc>) -> Result<Application> {
        let existing = self.owned_application(user_id, id)?;

        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(company) = &patch.company {
            sets.push("company");
            values.push(text(company));
        }
        if let Some(role) = &patch.role {
            sets.push("role");
            values.push(text(role));
        }
        if let Some(status) = patch.status {
            sets.push("status");
            values.push(text(status.as_str()));
        }
        if let Some(priority) = patch.priority {
            sets.push("priority");
            values.push(text(priority.as_str()));
        }
        if let Some(date) = patch.applied_date {
            sets.push("applied_date");
            values.push(text(&format_date(&date)));
        }
        if let Some(follow_up) = &patch.follow_up_date {
            sets.push("follow_up_date");
            values.push(opt_text(follow_up.as_ref().map(format_ts).as_deref()));
            if *follow_up != existing.follow_up_date {
                sets.push("reminder_sent_at");
                values.push(Value::Null);
            }
        }
        if let Some(notes) = &patch.notes {
            sets.push("notes");
            values.push(opt_text(notes.as_deref()));
        }
        if let Some(recruiter) = &patch.recruiter_name {
            sets.push("recruiter_name");
            values.push(opt_text(recruiter.as_deref()));
        }
        if let Some(job_url) = &patch.job_url {
            sets.push("job_url");
            values.push(opt_text(job_url.as_deref()));
        }
        if let Some(salary) = patch.salary {
            sets.push("salary");
            values.push(salary.map(Value::Integer).unwrap_or(Value::Null));
        }
        if let Some(currency) = &patch.currency {
            sets.push("currency");
            values.push(opt_text(currency.as_deref()));
        }
        if let Some(tags) = &patch.tags {
            sets.push("tags");
            values.push(text(&encode_tags(tags)));
        }

        sets.push("updated_at");
        values.push(text(&format_ts(&now)));

        let assignments: Vec<String> = sets
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{} = ?{}", column, i + 1))
            .collect();
        let sql = format!(
            "UPDATE applications SET {} WHERE id = ?{} AND user_id = ?{}",
            assignments.join(", "),
            values.len() + 1,
            values.len() + 2
        );
        values.push(text(id));
        values.push(text(user_id));
        self.conn.execute(&sql, params_from_iter(values))?;

        self.owned_application(user_id, id)
    }

    pub fn delete_application(&self, user_id: &str, id: &str) -> Result<Application> {
        let existing = self.owned_application(user_id, id)?;
        self.conn.execute(
            "DELETE FROM applications WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        Ok(existing)
    }

    /// One page of the owner's applications plus the unpaginated total.
    pub fn query_applications(&self, user_id: &str, query: &ListQuery) -> Result<(Vec<Application>, u64)> {
        let mut filter = String::from(" WHERE a.user_id = ?1");
        let mut values: Vec<Value> = vec![text(user_id)];

        if let Some(status) = query.status {
            values.push(text(status.as_str()));
            filter.push_str(&format!(" AND a.status = ?{}", values.len()));
        }

        if let Some(search) = &query.search {
            values.push(text(&format!("%{}%", escape_like(&search.to_lowercase()))));
            let n = values.len();
            filter.push_str(&format!(
                " AND (unicode_lower(a.company) LIKE ?{n} ESCAPE '\\' OR unicode_lower(a.role) LIKE ?{n} ESCAPE '\\')"
            ));
        }

        let total: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM applications a{}", filter),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let direction = query.sort_order.sql();
        let order = match query.sort_by {
            SortBy::AppliedDate => format!("a.applied_date {direction}, a.created_at {direction}"),
            SortBy::CreatedAt => format!("a.created_at {direction}"),
            SortBy::Priority => format!(
                "CASE a.priority WHEN 'HIGH' THEN 1 WHEN 'MEDIUM' THEN 2 ELSE 3 END {direction}, a.created_at DESC"
            ),
        };

        values.push(Value::Integer(query.limit as i64));
        values.push(Value::Integer(query.offset() as i64));
        let sql = format!(
            "SELECT {} FROM applications a{} ORDER BY {}, a.id LIMIT ?{} OFFSET ?{}",
            APPLICATION_COLUMNS,
            filter,
            order,
            values.len() - 1,
            values.len()
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_application)?;
        let apps = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((apps, total.max(0) as u64))
    }

    /// Everything the owner has, newest application first.
    pub fn list_for_export(&self, user_id: &str) -> Result<Vec<Application>> {
        let sql = format!(
            "SELECT {} FROM applications a WHERE a.user_id = ?1
             ORDER BY a.applied_date DESC, a.created_at DESC",
            APPLICATION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([user_id], row_to_application)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Active applications whose follow-up date has arrived, notified or not.
    pub fn follow_ups_due(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<Application>> {
        let sql = format!(
            "SELECT {} FROM applications a
             WHERE a.user_id = ?1 AND a.follow_up_date IS NOT NULL AND a.follow_up_date <= ?2
               AND a.status NOT IN ('offer', 'rejected')
             ORDER BY a.follow_up_date ASC",
            APPLICATION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, format_ts(&now)], row_to_application)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Sweep candidates across every user, with the owner's address.
    pub fn due_reminders(&self, now: DateTime<Utc>) -> Result<Vec<DueReminder>> {
        let sql = format!(
            "SELECT {}, u.email FROM applications a
             JOIN users u ON u.id = a.user_id
             WHERE {}
             ORDER BY a.follow_up_date ASC",
            APPLICATION_COLUMNS, REMINDER_DUE
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([format_ts(&now)], |row| {
            Ok(DueReminder {
                application: row_to_application(row)?,
                email: row.get(17)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn due_reminders_for_user(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<Application>> {
        let sql = format!(
            "SELECT {} FROM applications a WHERE {} AND a.user_id = ?2 ORDER BY a.follow_up_date ASC",
            APPLICATION_COLUMNS, REMINDER_DUE
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![format_ts(&now), user_id], row_to_application)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Marks the reminder as sent unless another sweep got there first.
    /// Returns whether this caller now holds the claim.
    pub fn claim_reminder(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE applications SET reminder_sent_at = ?1
             WHERE id = ?2 AND reminder_sent_at IS NULL AND follow_up_date IS NOT NULL",
            params![format_ts(&now), id],
        )?;
        Ok(updated == 1)
    }

    /// Undoes a claim after a failed delivery.
    pub fn release_reminder(&self, id: &str, claimed_at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE applications SET reminder_sent_at = NULL WHERE id = ?1 AND reminder_sent_at = ?2",
            params![id, format_ts(&claimed_at)],
        )?;
        Ok(())
    }

    /// Stamps a manually requested reminder regardless of any earlier one.
    pub fn mark_reminder_sent(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE applications SET reminder_sent_at = ?1 WHERE id = ?2 AND follow_up_date IS NOT NULL",
            params![format_ts(&now), id],
        )?;
        Ok(())
    }

    /// `(applied_date, status)` for every application the user owns.
    pub fn application_summaries(&self, user_id: &str) -> Result<Vec<(NaiveDate, Status)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT applied_date, status FROM applications WHERE user_id = ?1")?;
        let rows = stmt.query_map([user_id], |row| {
            Ok((
                parse_date_col(0, row.get(0)?)?,
                parse_enum::<Status>(1, row.get(1)?)?,
            ))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn insert_draft(conn: &Connection, user_id: &str, draft: &ApplicationDraft, now: DateTime<Utc>) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    let created = format_ts(&now);
    conn.execute(
        "INSERT INTO applications (id, user_id, company, role, status, priority, applied_date,
            follow_up_date, notes, recruiter_name, job_url, salary, currency, tags,
            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
        params![
            id,
            user_id,
            draft.company,
            draft.role,
            draft.status.as_str(),
            draft.priority.as_str(),
            format_date(&draft.applied_date),
            draft.follow_up_date.as_ref().map(format_ts),
            draft.notes,
            draft.recruiter_name,
            draft.job_url,
            draft.salary,
            draft.currency,
            encode_tags(&draft.tags),
            created,
        ],
    )?;
    Ok(id)
}

fn row_to_application(row: &Row) -> rusqlite::Result<Application> {
    let tags: String = row.get(14)?;
    Ok(Application {
        id: row.get(0)?,
        user_id: row.get(1)?,
        company: row.get(2)?,
        role: row.get(3)?,
        status: parse_enum(4, row.get(4)?)?,
        priority: parse_enum(5, row.get(5)?)?,
        applied_date: parse_date_col(6, row.get(6)?)?,
        follow_up_date: row
            .get::<_, Option<String>>(7)?
            .map(|raw| parse_ts(7, raw))
            .transpose()?,
        reminder_sent_at: row
            .get::<_, Option<String>>(8)?
            .map(|raw| parse_ts(8, raw))
            .transpose()?,
        notes: row.get(9)?,
        recruiter_name: row.get(10)?,
        job_url: row.get(11)?,
        salary: row.get(12)?,
        currency: row.get(13)?,
        tags: serde_json::from_str(&tags)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(14, Type::Text, Box::new(e)))?,
        created_at: parse_ts(15, row.get(15)?)?,
        updated_at: parse_ts(16, row.get(16)?)?,
    })
}

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        created_at: parse_ts(3, row.get(3)?)?,
    })
}

fn row_to_settings(row: &Row) -> rusqlite::Result<Settings> {
    Ok(Settings {
        name: row.get(2)?,
        email: row.get(1)?,
        preferences: UserPreferences {
            default_status: parse_enum(4, row.get(4)?)?,
            default_priority: parse_enum::<Priority>(5, row.get(5)?)?,
            default_currency: row.get(6)?,
            date_format: row.get(7)?,
            theme: row.get(8)?,
            accent_color: row.get(9)?,
        },
    })
}

// --- Column encoding ---

/// Fixed-width UTC timestamps so that text comparison in SQL is chronological.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn format_date(date: &NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn encode_tags(tags: &[String]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

fn opt_text(value: Option<&str>) -> Value {
    value.map(text).unwrap_or(Value::Null)
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn conversion_error(idx: usize, err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_date_col(idx: usize, raw: String) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| conversion_error(idx, e))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(idx: usize, raw: String) -> rusqlite::Result<T> {
    raw.parse().map_err(|e: String| conversion_error(idx, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SortOrder;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn draft(company: &str, priority: Priority) -> ApplicationDraft {
        ApplicationDraft {
            company: company.to_string(),
            role: "Engineer".to_string(),
            status: Status::Applied,
            priority,
            applied_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            follow_up_date: None,
            notes: None,
            recruiter_name: None,
            job_url: None,
            salary: None,
            currency: Some("USD".to_string()),
            tags: vec!["rust".to_string(), "remote".to_string()],
        }
    }

    fn setup() -> (Database, User, User) {
        let db = Database::open_in_memory().unwrap();
        let alice = db.upsert_user("alice", "alice@example.com", Some("Alice")).unwrap();
        let bob = db.upsert_user("bob", "bob@example.com", None).unwrap();
        (db, alice, bob)
    }

    #[test]
    fn test_insert_and_fetch_round_trip() {
        let (db, alice, _) = setup();
        let app = db.insert_application(&alice.id, &draft("Acme", Priority::High), at(2024, 1, 16)).unwrap();
        let fetched = db.get_application(&app.id).unwrap().unwrap();
        assert_eq!(fetched, app);
        assert_eq!(fetched.tags, vec!["rust", "remote"]);
        assert_eq!(fetched.created_at, at(2024, 1, 16));
    }

    #[test]
    fn test_upsert_user_is_idempotent() {
        let (db, alice, _) = setup();
        let again = db.upsert_user("alice", "alice@example.com", Some("Someone Else")).unwrap();
        assert_eq!(again, alice);
        assert_eq!(db.get_or_create_user_by_email("ALICE@example.com").unwrap().id, "alice");
    }

    #[test]
    fn test_upsert_user_follows_email_change() {
        let (db, _, bob) = setup();
        let moved = db.upsert_user("bob", "robert@example.com", Some("Robert")).unwrap();
        assert_eq!(moved.email, "robert@example.com");
        assert_eq!(moved.name.as_deref(), Some("Robert"));
        assert_eq!(moved.created_at, bob.created_at);
        assert!(db.get_user_by_email("bob@example.com").unwrap().is_none());
    }

    #[test]
    fn test_ownership_is_enforced() {
        let (db, alice, bob) = setup();
        let app = db.insert_application(&alice.id, &draft("Acme", Priority::Low), at(2024, 1, 16)).unwrap();

        let patch = ApplicationPatch {
            company: Some("Hijacked".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            db.update_application(&bob.id, &app.id, &patch, at(2024, 1, 17)),
            Err(AppError::Forbidden)
        ));
        assert!(matches!(db.delete_application(&bob.id, &app.id), Err(AppError::Forbidden)));
        assert!(matches!(db.owned_application(&alice.id, "missing"), Err(AppError::NotFound(_))));

        let unchanged = db.get_application(&app.id).unwrap().unwrap();
        assert_eq!(unchanged.company, "Acme");
    }

    #[test]
    fn test_sparse_update_touches_only_given_fields() {
        let (db, alice, _) = setup();
        let mut d = draft("Acme", Priority::Low);
        d.notes = Some("first call".to_string());
        d.salary = Some(100_000);
        let app = db.insert_application(&alice.id, &d, at(2024, 1, 16)).unwrap();

        let patch = ApplicationPatch {
            status: Some(Status::Interview),
            notes: Some(None),
            ..Default::default()
        };
        let updated = db.update_application(&alice.id, &app.id, &patch, at(2024, 1, 20)).unwrap();
        assert_eq!(updated.status, Status::Interview);
        assert_eq!(updated.notes, None);
        assert_eq!(updated.salary, Some(100_000));
        assert_eq!(updated.company, "Acme");
        assert_eq!(updated.updated_at, at(2024, 1, 20));
    }

    #[test]
    fn test_changing_follow_up_resets_reminder() {
        let (db, alice, _) = setup();
        let mut d = draft("Acme", Priority::Low);
        d.follow_up_date = Some(at(2024, 2, 28));
        let app = db.insert_application(&alice.id, &d, at(2024, 1, 16)).unwrap();
        assert!(db.claim_reminder(&app.id, at(2024, 3, 1)).unwrap());

        // Same date again keeps the stamp.
        let same = ApplicationPatch {
            follow_up_date: Some(Some(at(2024, 2, 28))),
            ..Default::default()
        };
        let kept = db.update_application(&alice.id, &app.id, &same, at(2024, 3, 2)).unwrap();
        assert_eq!(kept.reminder_sent_at, Some(at(2024, 3, 1)));

        let moved = ApplicationPatch {
            follow_up_date: Some(Some(at(2024, 4, 1))),
            ..Default::default()
        };
        let reset = db.update_application(&alice.id, &app.id, &moved, at(2024, 3, 2)).unwrap();
        assert_eq!(reset.reminder_sent_at, None);
        assert_eq!(reset.follow_up_date, Some(at(2024, 4, 1)));
    }

    #[test]
    fn test_claim_is_exclusive_and_releasable() {
        let (db, alice, _) = setup();
        let mut d = draft("Acme", Priority::Low);
        d.follow_up_date = Some(at(2024, 2, 28));
        let app = db.insert_application(&alice.id, &d, at(2024, 1, 16)).unwrap();

        assert!(db.claim_reminder(&app.id, at(2024, 3, 1)).unwrap());
        assert!(!db.claim_reminder(&app.id, at(2024, 3, 1)).unwrap());
        db.release_reminder(&app.id, at(2024, 3, 1)).unwrap();
        assert!(db.get_application(&app.id).unwrap().unwrap().reminder_sent_at.is_none());
    }

    #[test]
    fn test_reminder_requires_follow_up_date() {
        let (db, alice, _) = setup();
        let app = db.insert_application(&alice.id, &draft("Acme", Priority::Low), at(2024, 1, 16)).unwrap();
        assert!(!db.claim_reminder(&app.id, at(2024, 3, 1)).unwrap());
        db.mark_reminder_sent(&app.id, at(2024, 3, 1)).unwrap();
        assert!(db.get_application(&app.id).unwrap().unwrap().reminder_sent_at.is_none());
    }

    #[test]
    fn test_query_filters_by_owner_status_and_search() {
        let (db, alice, bob) = setup();
        let now = at(2024, 1, 16);
        db.insert_application(&alice.id, &draft("Acme Corp", Priority::Low), now).unwrap();
        let mut globex = draft("Globex", Priority::High);
        globex.role = "Data Scientist".to_string();
        globex.status = Status::Interview;
        db.insert_application(&alice.id, &globex, now).unwrap();
        db.insert_application(&bob.id, &draft("Acme Corp", Priority::Low), now).unwrap();

        let all = ListQuery::default();
        let (apps, total) = db.query_applications(&alice.id, &all).unwrap();
        assert_eq!(total, 2);
        assert!(apps.iter().all(|a| a.user_id == alice.id));

        let interviews = ListQuery {
            status: Some(Status::Interview),
            ..ListQuery::default()
        };
        let (apps, _) = db.query_applications(&alice.id, &interviews).unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].company, "Globex");

        let search = ListQuery {
            search: Some("SCIENT".to_string()),
            ..ListQuery::default()
        };
        let (apps, total) = db.query_applications(&alice.id, &search).unwrap();
        assert_eq!(total, 1);
        assert_eq!(apps[0].role, "Data Scientist");

        let wildcard = ListQuery {
            search: Some("%".to_string()),
            ..ListQuery::default()
        };
        assert_eq!(db.query_applications(&alice.id, &wildcard).unwrap().1, 0);
    }

    #[test]
    fn test_search_folds_non_ascii_case() {
        let (db, alice, _) = setup();
        let mut ecole = draft("École Polytechnique", Priority::Medium);
        ecole.role = "Ingénieur".to_string();
        db.insert_application(&alice.id, &ecole, at(2024, 1, 16)).unwrap();
        db.insert_application(&alice.id, &draft("Acme Corp", Priority::Low), at(2024, 1, 16)).unwrap();

        for term in ["École", "école", "ÉCOLE", "INGÉNIEUR", "énieur"] {
            let query = ListQuery {
                search: Some(term.to_string()),
                ..ListQuery::default()
            };
            let (apps, total) = db.query_applications(&alice.id, &query).unwrap();
            assert_eq!(total, 1, "{term}");
            assert_eq!(apps[0].company, "École Polytechnique");
        }
    }

    #[test]
    fn test_query_priority_sort_and_pagination() {
        let (db, alice, _) = setup();
        let now = at(2024, 1, 16);
        for (i, p) in [Priority::Low, Priority::High, Priority::Medium, Priority::High, Priority::Low]
            .into_iter()
            .enumerate()
        {
            db.insert_application(&alice.id, &draft(&format!("Co{i}"), p), now).unwrap();
        }

        let first = ListQuery {
            sort_by: SortBy::Priority,
            sort_order: SortOrder::Asc,
            limit: 2,
            ..ListQuery::default()
        };
        let (page1, total) = db.query_applications(&alice.id, &first).unwrap();
        assert_eq!(total, 5);
        assert!(page1.iter().all(|a| a.priority == Priority::High));

        let third = ListQuery { page: 3, ..first };
        let (page3, _) = db.query_applications(&alice.id, &third).unwrap();
        assert_eq!(page3.len(), 1);
        assert_eq!(page3[0].priority, Priority::Low);
    }

    #[test]
    fn test_delete_user_cascades() {
        let (db, alice, _) = setup();
        let app = db.insert_application(&alice.id, &draft("Acme", Priority::Low), at(2024, 1, 16)).unwrap();
        assert!(db.delete_user(&alice.id).unwrap());
        assert!(db.get_application(&app.id).unwrap().is_none());
        assert!(!db.delete_user(&alice.id).unwrap());
    }

    #[test]
    fn test_preferences_update() {
        let (db, alice, _) = setup();
        assert_eq!(db.get_preferences(&alice.id).unwrap(), UserPreferences::default());

        let patch = PreferencesPatch {
            theme: Some("dark".to_string()),
            default_priority: Some(Priority::High),
            name: Some(None),
            ..Default::default()
        };
        let settings = db.update_preferences(&alice.id, &patch).unwrap().unwrap();
        assert_eq!(settings.preferences.theme, "dark");
        assert_eq!(settings.preferences.default_priority, Priority::High);
        assert_eq!(settings.name, None);
        assert_eq!(settings.email, "alice@example.com");

        assert!(db.update_preferences("ghost", &patch).unwrap().is_none());
    }

    #[test]
    fn test_batch_insert_is_atomic() {
        let (db, alice, _) = setup();
        let drafts = vec![draft("A", Priority::Low), draft("B", Priority::High)];
        assert_eq!(db.insert_applications(&alice.id, &drafts, at(2024, 1, 16)).unwrap(), 2);

        // Unknown owner violates the foreign key; nothing from the batch lands.
        let err = db.insert_applications("ghost", &drafts, at(2024, 1, 16)).unwrap_err();
        assert!(matches!(err, AppError::ForeignKey));
        assert_eq!(db.list_for_export(&alice.id).unwrap().len(), 2);
    }

    #[test]
    fn test_timestamps_sort_as_text() {
        let earlier = format_ts(&Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        let later = format_ts(&(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + chrono::Duration::milliseconds(5)));
        assert!(earlier < later);
        assert_eq!(earlier, "2024-03-01T00:00:00.000Z");
    }

    #[test]
    fn test_file_database_requires_init() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("apptrack.db");

        let db = Database::open(&path).unwrap();
        assert!(path.parent().unwrap().is_dir());
        let err = db.ensure_initialized().unwrap_err();
        assert!(err.to_string().contains("apptrack init"));

        db.init().unwrap();
        db.ensure_initialized().unwrap();
        let user = db.get_or_create_user_by_email("sam@example.com").unwrap();
        drop(db);

        let reopened = Database::open(&path).unwrap();
        reopened.ensure_initialized().unwrap();
        assert_eq!(reopened.get_user_by_email("SAM@example.com").unwrap().map(|u| u.id), Some(user.id));
    }
}

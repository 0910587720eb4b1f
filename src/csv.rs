//! CSV import and export of applications.
//!
//! Export always writes the same eleven columns. Import is lenient: the
//! header is matched loosely, unparseable optional fields fall back to
//! defaults, and a bad row is reported and skipped instead of failing the
//! whole file.

use chrono::{DateTime, NaiveDate, Utc};
use std::borrow::Cow;

use crate::error::{AppError, Result};
use crate::models::{Application, ApplicationDraft, Priority, Status};
use crate::validation::{
    MAX_COMPANY_LEN, MAX_CURRENCY_LEN, MAX_NOTES_LEN, MAX_RECRUITER_LEN, MAX_ROLE_LEN, clamp_chars,
    normalize_tags, parse_date, parse_datetime,
};

pub const HEADERS: [&str; 11] = [
    "Company",
    "Role",
    "Status",
    "Applied Date",
    "Follow-up Date",
    "Priority",
    "Recruiter Name",
    "Job URL",
    "Salary",
    "Notes",
    "Tags",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Company,
    Role,
    Status,
    AppliedDate,
    FollowUpDate,
    Priority,
    RecruiterName,
    JobUrl,
    Salary,
    Notes,
    Tags,
}

impl Column {
    const ALL: [Column; 11] = [
        Column::Company,
        Column::Role,
        Column::Status,
        Column::AppliedDate,
        Column::FollowUpDate,
        Column::Priority,
        Column::RecruiterName,
        Column::JobUrl,
        Column::Salary,
        Column::Notes,
        Column::Tags,
    ];

    /// Lower-case name as it is searched for inside header cells.
    fn key(self) -> &'static str {
        match self {
            Column::Company => "company",
            Column::Role => "role",
            Column::Status => "status",
            Column::AppliedDate => "applied date",
            Column::FollowUpDate => "followup date",
            Column::Priority => "priority",
            Column::RecruiterName => "recruiter name",
            Column::JobUrl => "job url",
            Column::Salary => "salary",
            Column::Notes => "notes",
            Column::Tags => "tags",
        }
    }
}

/// Header position of each known column that the file actually has.
#[derive(Debug, Default)]
struct ColumnMap([Option<usize>; 11]);

impl ColumnMap {
    fn from_header(cells: &[String]) -> Self {
        let normalized: Vec<String> = cells.iter().map(|c| c.to_lowercase().replace('-', "")).collect();
        let mut map = ColumnMap::default();
        for (slot, column) in Column::ALL.into_iter().enumerate() {
            map.0[slot] = normalized.iter().position(|cell| cell.contains(column.key()));
        }
        map
    }

    fn index(&self, column: Column) -> Option<usize> {
        self.0[column as usize]
    }

    fn value<'a>(&self, row: &'a [String], column: Column) -> &'a str {
        self.index(column)
            .and_then(|i| row.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Successfully parsed rows plus `Row N: ...` messages for the skipped ones.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCsv {
    pub drafts: Vec<ApplicationDraft>,
    pub errors: Vec<String>,
}

// --- Encode ---

pub fn encode(apps: &[Application]) -> String {
    let mut lines = Vec::with_capacity(apps.len() + 1);
    lines.push(HEADERS.join(","));
    for app in apps {
        let fields: [Cow<str>; 11] = [
            escape(&app.company),
            escape(&app.role),
            escape(app.status.as_str()),
            Cow::Owned(app.applied_date.format("%Y-%m-%d").to_string()),
            Cow::Owned(
                app.follow_up_date
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_default(),
            ),
            escape(app.priority.as_str()),
            escape(app.recruiter_name.as_deref().unwrap_or("")),
            escape(app.job_url.as_deref().unwrap_or("")),
            Cow::Owned(app.salary.map(|s| s.to_string()).unwrap_or_default()),
            escape(app.notes.as_deref().unwrap_or("")),
            Cow::Owned(escape(&app.tags.join("; ")).into_owned()),
        ];
        lines.push(fields.join(","));
    }
    lines.join("\n")
}

fn escape(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) || value.trim() != value {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

pub fn export_filename(today: NaiveDate) -> String {
    format!("applications-{}.csv", today.format("%Y-%m-%d"))
}

// --- Decode ---

/// Parses an uploaded file into drafts. `now` supplies the applied date for
/// rows without a usable one; `default_currency` fills the currency.
pub fn decode(text: &str, now: DateTime<Utc>, default_currency: &str) -> Result<DecodedCsv> {
    let records = tokenize(text);
    if records.len() < 2 {
        return Err(AppError::BadRequest(
            "CSV must have a header row and at least one data row".to_string(),
        ));
    }

    let columns = ColumnMap::from_header(&records[0]);
    if columns.index(Column::Company).is_none() || columns.index(Column::Role).is_none() {
        return Err(AppError::BadRequest(
            "CSV must have at least 'Company' and 'Role' columns".to_string(),
        ));
    }

    let mut drafts = Vec::new();
    let mut errors = Vec::new();
    let currency = clamp_chars(default_currency, MAX_CURRENCY_LEN);

    for (i, row) in records.iter().enumerate().skip(1) {
        let company = columns.value(row, Column::Company);
        let role = columns.value(row, Column::Role);
        if company.trim().is_empty() || role.trim().is_empty() {
            errors.push(format!("Row {}: Missing company or role", i + 1));
            continue;
        }

        let status_raw = columns.value(row, Column::Status).to_lowercase();
        let priority_raw = columns.value(row, Column::Priority).to_uppercase();
        let tags_raw = columns.value(row, Column::Tags);

        drafts.push(ApplicationDraft {
            company: clamp_chars(company, MAX_COMPANY_LEN),
            role: clamp_chars(role, MAX_ROLE_LEN),
            status: status_raw.parse().unwrap_or(Status::Applied),
            priority: priority_raw.parse().unwrap_or(Priority::Medium),
            applied_date: parse_date(columns.value(row, Column::AppliedDate))
                .unwrap_or_else(|| now.date_naive()),
            follow_up_date: parse_datetime(columns.value(row, Column::FollowUpDate)),
            notes: non_empty(columns.value(row, Column::Notes), MAX_NOTES_LEN),
            recruiter_name: non_empty(columns.value(row, Column::RecruiterName), MAX_RECRUITER_LEN),
            job_url: absolute_url(columns.value(row, Column::JobUrl)),
            salary: leading_integer(columns.value(row, Column::Salary)).filter(|s| *s > 0),
            currency: Some(currency.clone()),
            tags: normalize_tags(tags_raw.split([';', ','])),
        });
    }

    if drafts.is_empty() {
        return Err(AppError::Import {
            message: "No valid applications found in CSV".to_string(),
            details: errors,
        });
    }

    Ok(DecodedCsv { drafts, errors })
}

/// Splits text into records. Text outside quotes is trimmed; quoted text
/// is kept as written, newlines included. Records with nothing but
/// whitespace are dropped.
fn tokenize(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut field = FieldBuf::default();
    let mut fields: Vec<String> = Vec::new();
    let mut in_quotes = false;
    let mut blank = true;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.value.push('"');
                chars.next();
            }
            '"' if in_quotes => in_quotes = false,
            '"' => {
                field.open_quote();
                in_quotes = true;
                blank = false;
            }
            _ if in_quotes => field.value.push(c),
            ',' => {
                fields.push(field.finish());
                blank = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                fields.push(field.finish());
                let record = std::mem::take(&mut fields);
                if !blank {
                    records.push(record);
                }
                blank = true;
            }
            _ => {
                if !c.is_whitespace() {
                    blank = false;
                }
                field.pending.push(c);
            }
        }
    }

    fields.push(field.finish());
    if !blank {
        records.push(fields);
    }
    records
}

/// One field in progress: `value` holds quoted text verbatim, `pending`
/// holds unquoted text not yet trimmed into it.
#[derive(Default)]
struct FieldBuf {
    value: String,
    pending: String,
    quoted: bool,
}

impl FieldBuf {
    fn open_quote(&mut self) {
        self.flush_pending();
        self.quoted = true;
    }

    fn flush_pending(&mut self) {
        self.value.push_str(self.pending.trim());
        self.pending.clear();
    }

    fn finish(&mut self) -> String {
        if !self.quoted {
            self.value = self.pending.trim().to_string();
            self.pending.clear();
        } else {
            self.flush_pending();
        }
        self.quoted = false;
        std::mem::take(&mut self.value)
    }
}

fn non_empty(value: &str, max: usize) -> Option<String> {
    (!value.is_empty()).then(|| clamp_chars(value, max))
}

fn absolute_url(value: &str) -> Option<String> {
    url::Url::parse(value).ok().map(|_| value.to_string())
}

/// Reads the integer at the start of `value`, ignoring whatever follows it.
fn leading_integer(value: &str) -> Option<i64> {
    let value = value.trim_start();
    let digits_start = usize::from(value.starts_with(['-', '+']));
    let digits_len = value[digits_start..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits_len == 0 {
        return None;
    }
    value[..digits_start + digits_len].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn application(company: &str, role: &str) -> Application {
        Application {
            id: "a1".to_string(),
            user_id: "u1".to_string(),
            company: company.to_string(),
            role: role.to_string(),
            status: Status::Interview,
            priority: Priority::High,
            applied_date: date(2024, 1, 15),
            follow_up_date: Some(Utc.with_ymd_and_hms(2024, 2, 1, 9, 30, 0).unwrap()),
            reminder_sent_at: None,
            notes: None,
            recruiter_name: Some("Jane Doe".to_string()),
            job_url: Some("https://example.com/jobs/1".to_string()),
            salary: Some(150000),
            currency: Some("USD".to_string()),
            tags: vec!["rust".to_string(), "remote".to_string()],
            created_at: now(),
            updated_at: now(),
        }
    }

    #[test]
    fn test_encode_layout() {
        let csv = encode(&[application("Acme", "Engineer")]);
        let lines: Vec<&str> = csv.split('\n').collect();
        assert_eq!(
            lines[0],
            "Company,Role,Status,Applied Date,Follow-up Date,Priority,Recruiter Name,Job URL,Salary,Notes,Tags"
        );
        assert_eq!(
            lines[1],
            "Acme,Engineer,interview,2024-01-15,2024-02-01,HIGH,Jane Doe,https://example.com/jobs/1,150000,,rust; remote"
        );
        assert!(!csv.ends_with('\n'));
    }

    #[test]
    fn test_encode_empty_list_is_header_only() {
        assert_eq!(encode(&[]), HEADERS.join(","));
    }

    #[test]
    fn test_escape_rules() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a,b"), "\"a,b\"");
        assert_eq!(escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape("two\nlines"), "\"two\nlines\"");
        assert_eq!(escape("  indented"), "\"  indented\"");
        assert_eq!(escape("trailing "), "\"trailing \"");
    }

    #[test]
    fn test_export_filename() {
        assert_eq!(export_filename(date(2024, 3, 1)), "applications-2024-03-01.csv");
    }

    #[test]
    fn test_decode_quoted_comma_scenario() {
        let text = "Company,Role,Status,Applied Date\nAcme,\"Engineer, Sr.\",interview,2024-01-15";
        let decoded = decode(text, now(), "USD").unwrap();
        assert!(decoded.errors.is_empty());
        assert_eq!(decoded.drafts.len(), 1);
        let draft = &decoded.drafts[0];
        assert_eq!(draft.company, "Acme");
        assert_eq!(draft.role, "Engineer, Sr.");
        assert_eq!(draft.status, Status::Interview);
        assert_eq!(draft.applied_date, date(2024, 1, 15));
        assert_eq!(draft.priority, Priority::Medium);
        assert!(draft.tags.is_empty());
        assert_eq!(draft.follow_up_date, None);
    }

    #[test]
    fn test_decode_missing_role_column_fails_batch() {
        let text = "Company,Status\nAcme,applied\nGlobex,offer";
        match decode(text, now(), "USD") {
            Err(AppError::BadRequest(msg)) => {
                assert_eq!(msg, "CSV must have at least 'Company' and 'Role' columns")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_decode_requires_a_data_row() {
        for text in ["", "Company,Role", "Company,Role\n\n   \n"] {
            assert!(matches!(decode(text, now(), "USD"), Err(AppError::BadRequest(_))));
        }
    }

    #[test]
    fn test_decode_row_errors_do_not_abort() {
        let text = "Company,Role\r\nAcme,Engineer\r\n,Designer\r\n\r\nGlobex,\r\nInitech,PM";
        let decoded = decode(text, now(), "USD").unwrap();
        assert_eq!(decoded.drafts.len(), 2);
        // The blank line is not counted.
        assert_eq!(
            decoded.errors,
            vec!["Row 3: Missing company or role", "Row 4: Missing company or role"]
        );
    }

    #[test]
    fn test_decode_all_rows_bad_is_batch_error() {
        let text = "Company,Role\n,Engineer\nAcme,";
        match decode(text, now(), "USD") {
            Err(AppError::Import { message, details }) => {
                assert_eq!(message, "No valid applications found in CSV");
                assert_eq!(details.len(), 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_decode_defaults_on_bad_values() {
        let text = "company,role,status,applied date,follow-up date,priority,salary,job url,tags\n\
                    Acme,Engineer,Hired,yesterday,soon,urgent,lots,not a url, ;;";
        let draft = &decode(text, now(), "EUR").unwrap().drafts[0];
        assert_eq!(draft.status, Status::Applied);
        assert_eq!(draft.applied_date, date(2024, 3, 1));
        assert_eq!(draft.follow_up_date, None);
        assert_eq!(draft.priority, Priority::Medium);
        assert_eq!(draft.salary, None);
        assert_eq!(draft.job_url, None);
        assert!(draft.tags.is_empty());
        assert_eq!(draft.currency.as_deref(), Some("EUR"));
    }

    #[test]
    fn test_decode_case_insensitive_enums_and_loose_header() {
        let text = "Company Name,Job Role,STATUS,Priority Level,Expected Salary,Tags\n\
                    Acme,Engineer,OFFER,high,120000 USD,\"a; b, c\"";
        let draft = &decode(text, now(), "USD").unwrap().drafts[0];
        assert_eq!(draft.status, Status::Offer);
        assert_eq!(draft.priority, Priority::High);
        assert_eq!(draft.salary, Some(120000));
        assert_eq!(draft.tags, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_decode_zero_salary_is_null() {
        let text = "Company,Role,Salary\nAcme,Engineer,0";
        assert_eq!(decode(text, now(), "USD").unwrap().drafts[0].salary, None);
    }

    #[test]
    fn test_decode_clamps_to_limits() {
        let long = "x".repeat(150);
        let tags: Vec<String> = (0..12).map(|i| format!("t{i}")).collect();
        let text = format!("Company,Role,Tags\n{long},Engineer,{}", tags.join(";"));
        let draft = &decode(&text, now(), "USD").unwrap().drafts[0];
        assert_eq!(draft.company.chars().count(), MAX_COMPANY_LEN);
        assert_eq!(draft.tags.len(), 10);
    }

    #[test]
    fn test_round_trip_preserves_core_fields() {
        let mut second = application("Globex, Inc.", "Staff \"Platform\" Engineer");
        second.status = Status::Ghosted;
        second.priority = Priority::Low;
        second.applied_date = date(2023, 12, 31);
        second.tags = Vec::new();
        second.notes = Some("line one\nline two, with comma".to_string());
        let apps = vec![application("Acme", "Engineer"), second];

        let decoded = decode(&encode(&apps), now(), "USD").unwrap();
        assert!(decoded.errors.is_empty());
        assert_eq!(decoded.drafts.len(), apps.len());
        for (app, draft) in apps.iter().zip(&decoded.drafts) {
            assert_eq!(draft.company, app.company);
            assert_eq!(draft.role, app.role);
            assert_eq!(draft.status, app.status);
            assert_eq!(draft.priority, app.priority);
            assert_eq!(draft.tags, app.tags);
            assert_eq!(draft.applied_date, app.applied_date);
            assert_eq!(draft.notes, app.notes);
            assert_eq!(draft.salary, app.salary);
            assert_eq!(draft.recruiter_name, app.recruiter_name);
        }
        assert_eq!(
            decoded.drafts[0].follow_up_date,
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_round_trip_keeps_whitespace_in_quoted_fields() {
        let mut app = application("Acme", " Engineer, Sr. ");
        app.notes = Some("  indented,\nline".to_string());
        app.recruiter_name = Some("Jane ".to_string());

        let decoded = decode(&encode(&[app.clone()]), now(), "USD").unwrap();
        let draft = &decoded.drafts[0];
        assert_eq!(draft.role, " Engineer, Sr. ");
        assert_eq!(draft.notes.as_deref(), Some("  indented,\nline"));
        assert_eq!(draft.recruiter_name.as_deref(), Some("Jane "));
    }

    #[test]
    fn test_tokenize_trims_only_outside_quotes() {
        let records = tokenize("a , \"  b \" ,c\n\"\",  d  ");
        assert_eq!(records, vec![vec!["a", "  b ", "c"], vec!["", "d"]]);
    }

    #[test]
    fn test_decode_malformed_input_never_panics() {
        let inputs = [
            "\"",
            "\"\"\"",
            ",,,\n,,,",
            "Company,Role\n\"",
            "Company,Role\n  \n\t\n",
            "\r\r\n\r",
            "Company,Role,Status\nAcme\nGlobex,PM,offer,extra,more",
            "Company,Role\nAcme,\"Engineer\nGlobex,PM",
            "Company,\"Role\nAcme,Engineer",
            "Company,Role\n\"\"\"\",\"\"\"",
        ];
        for text in inputs {
            match decode(text, now(), "USD") {
                Ok(decoded) => assert!(!decoded.drafts.is_empty(), "{text:?}"),
                Err(AppError::BadRequest(_)) | Err(AppError::Import { .. }) => {}
                Err(other) => panic!("unexpected error for {text:?}: {other:?}"),
            }
        }
    }

    #[test]
    fn test_decode_ragged_rows_and_unclosed_quote() {
        let ragged = decode("Company,Role,Status\nAcme\nGlobex,PM,offer,extra", now(), "USD").unwrap();
        assert_eq!(ragged.errors, vec!["Row 2: Missing company or role"]);
        assert_eq!(ragged.drafts.len(), 1);
        assert_eq!(ragged.drafts[0].status, Status::Offer);

        let unclosed = decode("Company,Role\nAcme,\"Engineer\nGlobex,PM", now(), "USD").unwrap();
        assert_eq!(unclosed.drafts.len(), 1);
        assert_eq!(unclosed.drafts[0].role, "Engineer\nGlobex,PM");
    }

    #[test]
    fn test_leading_integer() {
        assert_eq!(leading_integer("42"), Some(42));
        assert_eq!(leading_integer("120,000"), Some(120));
        assert_eq!(leading_integer("-5k"), Some(-5));
        assert_eq!(leading_integer("$100"), None);
        assert_eq!(leading_integer(""), None);
    }
}

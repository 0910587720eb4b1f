use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::db::Database;
use crate::error::Result;
use crate::mailer::{EmailSink, reminder_email};
use crate::models::{Application, User};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderOutcome {
    pub application_id: String,
    pub company: String,
    pub email: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    pub checked: DateTime<Utc>,
    pub total: usize,
    pub sent: usize,
    pub results: Vec<ReminderOutcome>,
}

impl SweepReport {
    fn new(checked: DateTime<Utc>, total: usize, results: Vec<ReminderOutcome>) -> Self {
        let sent = results.iter().filter(|r| r.success).count();
        Self { checked, total, sent, results }
    }

    pub fn message(&self) -> String {
        if self.total == 0 {
            "No reminders to send".to_string()
        } else {
            format!("Sent {} of {} reminder(s)", self.sent, self.total)
        }
    }
}

/// Sends every due reminder across all users to each owner's address.
///
/// The store lock is taken per step and released while mail is in flight.
pub fn sweep_all(db: &Mutex<Database>, sink: &dyn EmailSink, now: DateTime<Utc>) -> Result<SweepReport> {
    let due = db.lock().due_reminders(now)?;
    tracing::info!(candidates = due.len(), %now, "Starting reminder sweep");

    let results: Vec<ReminderOutcome> = due
        .iter()
        .filter_map(|d| notify(db, sink, &d.application, &d.email, now))
        .collect();

    let report = SweepReport::new(now, due.len(), results);
    tracing::info!(total = report.total, sent = report.sent, "Reminder sweep finished");
    Ok(report)
}

/// The same sweep restricted to one user's records, sent to their address.
pub fn sweep_for_user(db: &Mutex<Database>, sink: &dyn EmailSink, user: &User, now: DateTime<Utc>) -> Result<SweepReport> {
    let due = db.lock().due_reminders_for_user(&user.id, now)?;
    tracing::info!(user = %user.id, candidates = due.len(), "Sending reminders for user");

    let results: Vec<ReminderOutcome> = due
        .iter()
        .filter_map(|app| notify(db, sink, app, &user.email, now))
        .collect();

    Ok(SweepReport::new(now, due.len(), results))
}

/// Sends the reminder for one application on request, whether or not it
/// was already sent. Nothing happens unless the caller owns it and it has
/// a follow-up date. Only a send on or after that date is recorded.
pub fn send_for_application(
    db: &Mutex<Database>,
    sink: &dyn EmailSink,
    user: &User,
    application_id: &str,
    now: DateTime<Utc>,
) -> Result<SweepReport> {
    let app = db
        .lock()
        .get_application(application_id)?
        .filter(|app| app.user_id == user.id);

    let Some((app, follow_up)) = app.and_then(|app| app.follow_up_date.map(|d| (app, d))) else {
        return Ok(SweepReport::new(now, 0, Vec::new()));
    };

    let email = reminder_email(&user.email, &app.company, &app.role, follow_up);
    let outcome = match sink.deliver(&email) {
        Ok(_) => {
            // An early send must not suppress the sweep's reminder on the day.
            if follow_up <= now {
                db.lock().mark_reminder_sent(&app.id, now)?;
            }
            success(&app, &user.email)
        }
        Err(e) => {
            tracing::warn!(application = %app.id, error = %e, "Reminder delivery failed");
            failure(&app, &user.email, e.to_string())
        }
    };
    Ok(SweepReport::new(now, 1, vec![outcome]))
}

/// Claims, delivers and on failure releases one reminder. Returns `None`
/// when another sweep already holds the claim.
fn notify(
    db: &Mutex<Database>,
    sink: &dyn EmailSink,
    app: &Application,
    to: &str,
    now: DateTime<Utc>,
) -> Option<ReminderOutcome> {
    let follow_up = app.follow_up_date?;

    match db.lock().claim_reminder(&app.id, now) {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(application = %app.id, "Reminder already claimed, skipping");
            return None;
        }
        Err(e) => {
            tracing::error!(application = %app.id, error = %e, "Failed to claim reminder");
            return Some(failure(app, to, e.to_string()));
        }
    }

    let email = reminder_email(to, &app.company, &app.role, follow_up);
    match sink.deliver(&email) {
        Ok(receipt) => {
            tracing::info!(application = %app.id, to, message_id = ?receipt.message_id, "Reminder sent");
            Some(success(app, to))
        }
        Err(e) => {
            tracing::warn!(application = %app.id, to, error = %e, "Reminder delivery failed");
            if let Err(release_err) = db.lock().release_reminder(&app.id, now) {
                tracing::error!(application = %app.id, error = %release_err, "Failed to release reminder claim");
            }
            Some(failure(app, to, e.to_string()))
        }
    }
}

fn success(app: &Application, to: &str) -> ReminderOutcome {
    ReminderOutcome {
        application_id: app.id.clone(),
        company: app.company.clone(),
        email: to.to_string(),
        success: true,
        error: None,
    }
}

fn failure(app: &Application, to: &str, error: String) -> ReminderOutcome {
    ReminderOutcome {
        application_id: app.id.clone(),
        company: app.company.clone(),
        email: to.to_string(),
        success: false,
        error: Some(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::testing::RecordingSink;
    use crate::models::{ApplicationDraft, Priority, Status};
    use chrono::{NaiveDate, TimeZone};

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn draft(company: &str, status: Status, follow_up: Option<DateTime<Utc>>) -> ApplicationDraft {
        ApplicationDraft {
            company: company.to_string(),
            role: "Engineer".to_string(),
            status,
            priority: Priority::Medium,
            applied_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            follow_up_date: follow_up,
            notes: None,
            recruiter_name: None,
            job_url: None,
            salary: None,
            currency: None,
            tags: Vec::new(),
        }
    }

    fn setup() -> (Mutex<Database>, User, User) {
        let db = Database::open_in_memory().unwrap();
        let alice = db.upsert_user("alice", "alice@example.com", None).unwrap();
        let bob = db.upsert_user("bob", "bob@example.com", None).unwrap();
        (Mutex::new(db), alice, bob)
    }

    fn add(db: &Mutex<Database>, user: &User, draft: &ApplicationDraft) -> Application {
        db.lock().insert_application(&user.id, draft, at(2024, 1, 15)).unwrap()
    }

    fn reload(db: &Mutex<Database>, app: &Application) -> Application {
        db.lock().get_application(&app.id).unwrap().unwrap()
    }

    #[test]
    fn test_due_record_is_sent_and_stamped() {
        let (db, alice, _) = setup();
        let app = add(&db, &alice, &draft("Acme", Status::Applied, Some(at(2024, 2, 28))));
        let sink = RecordingSink::default();

        let report = sweep_all(&db, &sink, at(2024, 3, 1)).unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(report.results[0].email, "alice@example.com");
        assert_eq!(sink.count(), 1);
        assert_eq!(sink.sent.lock()[0].subject, "Follow-up Reminder: Acme - Engineer");
        assert_eq!(reload(&db, &app).reminder_sent_at, Some(at(2024, 3, 1)));
    }

    #[test]
    fn test_second_sweep_sends_nothing() {
        let (db, alice, _) = setup();
        add(&db, &alice, &draft("Acme", Status::Applied, Some(at(2024, 2, 28))));
        let sink = RecordingSink::default();

        sweep_all(&db, &sink, at(2024, 3, 1)).unwrap();
        let again = sweep_all(&db, &sink, at(2024, 3, 2)).unwrap();
        assert_eq!(again.total, 0);
        assert_eq!(again.sent, 0);
        assert_eq!(again.message(), "No reminders to send");
        assert_eq!(sink.count(), 1);
    }

    #[test]
    fn test_offers_rejections_and_future_dates_are_excluded() {
        let (db, alice, _) = setup();
        add(&db, &alice, &draft("Offer Co", Status::Offer, Some(at(2024, 2, 1))));
        add(&db, &alice, &draft("Rejected Co", Status::Rejected, Some(at(2024, 2, 1))));
        add(&db, &alice, &draft("Later Co", Status::Applied, Some(at(2024, 4, 1))));
        add(&db, &alice, &draft("No Date Co", Status::Applied, None));
        let ghosted = add(&db, &alice, &draft("Ghost Co", Status::Ghosted, Some(at(2024, 3, 1))));
        let sink = RecordingSink::default();

        let report = sweep_all(&db, &sink, at(2024, 3, 1)).unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.results[0].application_id, ghosted.id);
    }

    #[test]
    fn test_failed_delivery_stays_eligible() {
        let (db, alice, bob) = setup();
        let a = add(&db, &alice, &draft("Acme", Status::Applied, Some(at(2024, 2, 28))));
        let b = add(&db, &bob, &draft("Globex", Status::Interview, Some(at(2024, 2, 27))));

        let flaky = RecordingSink::failing_for(&["bob@example.com"]);
        let report = sweep_all(&db, &flaky, at(2024, 3, 1)).unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.sent, 1);
        let failed = report.results.iter().find(|r| !r.success).unwrap();
        assert_eq!(failed.application_id, b.id);
        assert!(failed.error.is_some());
        assert!(reload(&db, &b).reminder_sent_at.is_none());
        assert!(reload(&db, &a).reminder_sent_at.is_some());

        let healthy = RecordingSink::default();
        let retry = sweep_all(&db, &healthy, at(2024, 3, 2)).unwrap();
        assert_eq!(retry.sent, 1);
        assert_eq!(retry.results[0].application_id, b.id);
    }

    #[test]
    fn test_claimed_record_is_not_sent_twice() {
        let (db, alice, _) = setup();
        let app = add(&db, &alice, &draft("Acme", Status::Applied, Some(at(2024, 2, 28))));
        let stale = reload(&db, &app);

        // Another sweep claims it between selection and delivery.
        assert!(db.lock().claim_reminder(&app.id, at(2024, 3, 1)).unwrap());

        let sink = RecordingSink::default();
        assert!(notify(&db, &sink, &stale, "alice@example.com", at(2024, 3, 1)).is_none());
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_user_sweep_only_touches_own_records() {
        let (db, alice, bob) = setup();
        add(&db, &alice, &draft("Acme", Status::Applied, Some(at(2024, 2, 28))));
        let theirs = add(&db, &bob, &draft("Globex", Status::Applied, Some(at(2024, 2, 28))));
        let sink = RecordingSink::default();

        let report = sweep_for_user(&db, &sink, &alice, at(2024, 3, 1)).unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(sink.sent.lock()[0].to, "alice@example.com");
        assert!(reload(&db, &theirs).reminder_sent_at.is_none());
    }

    #[test]
    fn test_single_application_send() {
        let (db, alice, bob) = setup();
        let app = add(&db, &alice, &draft("Acme", Status::Offer, Some(at(2024, 5, 1))));
        let undated = add(&db, &alice, &draft("Undated", Status::Applied, None));
        let sink = RecordingSink::default();

        let not_owner = send_for_application(&db, &sink, &bob, &app.id, at(2024, 3, 1)).unwrap();
        assert_eq!(not_owner.total, 0);
        let missing = send_for_application(&db, &sink, &alice, "nope", at(2024, 3, 1)).unwrap();
        assert_eq!(missing.total, 0);
        let no_date = send_for_application(&db, &sink, &alice, &undated.id, at(2024, 3, 1)).unwrap();
        assert_eq!(no_date.total, 0);
        assert_eq!(sink.count(), 0);

        let sent = send_for_application(&db, &sink, &alice, &app.id, at(2024, 5, 2)).unwrap();
        assert_eq!(sent.sent, 1);
        assert_eq!(reload(&db, &app).reminder_sent_at, Some(at(2024, 5, 2)));
    }

    #[test]
    fn test_early_manual_send_leaves_sweep_reminder() {
        let (db, alice, _) = setup();
        let app = add(&db, &alice, &draft("Acme", Status::Applied, Some(at(2024, 5, 1))));
        let sink = RecordingSink::default();

        let early = send_for_application(&db, &sink, &alice, &app.id, at(2024, 3, 1)).unwrap();
        assert_eq!(early.sent, 1);
        assert!(reload(&db, &app).reminder_sent_at.is_none());

        let report = sweep_all(&db, &sink, at(2024, 5, 1)).unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(sink.count(), 2);
        assert_eq!(reload(&db, &app).reminder_sent_at, Some(at(2024, 5, 1)));
    }
}

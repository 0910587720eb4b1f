mod config;
mod csv;
mod db;
mod error;
mod mailer;
mod models;
mod query;
mod reminders;
mod server;
mod stats;
mod validation;

use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use config::Config;
use db::Database;
use error::AppError;
use mailer::{EmailSink, HttpMailer};
use models::{Application, User};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "apptrack")]
#[command(about = "Job application tracker - record applications, import/export CSV, send follow-up reminders")]
struct Cli {
    /// Database file (overrides APPTRACK_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Email address of the local user to act as
    #[arg(short, long, global = true, env = "APPTRACK_USER", default_value = "me@localhost")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Run the HTTP API
    Serve {
        /// Address to bind (overrides HOST)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Record an application
    Add {
        company: String,
        role: String,

        /// applied, interview, offer, rejected or ghosted
        #[arg(short, long)]
        status: Option<String>,

        /// LOW, MEDIUM or HIGH
        #[arg(short, long)]
        priority: Option<String>,

        /// Date applied (defaults to today)
        #[arg(short, long)]
        applied: Option<String>,

        /// When to follow up
        #[arg(short, long)]
        follow_up: Option<String>,

        #[arg(short, long)]
        notes: Option<String>,

        #[arg(short, long)]
        recruiter: Option<String>,

        #[arg(long)]
        url: Option<String>,

        #[arg(long)]
        salary: Option<i64>,

        #[arg(long)]
        currency: Option<String>,

        /// Comma-separated tags
        #[arg(short, long)]
        tags: Option<String>,
    },

    /// List applications
    List {
        #[arg(short, long)]
        status: Option<String>,

        /// Match company or role
        #[arg(short = 'q', long)]
        search: Option<String>,

        /// appliedDate, createdAt or priority
        #[arg(long)]
        sort: Option<String>,

        /// asc or desc
        #[arg(long)]
        order: Option<String>,

        #[arg(long)]
        page: Option<u32>,

        #[arg(short, long)]
        limit: Option<u32>,
    },

    /// Show application details
    Show {
        id: String,
    },

    /// Change fields of an application (pass "" to clear an optional field)
    Update {
        id: String,

        #[arg(long)]
        company: Option<String>,

        #[arg(long)]
        role: Option<String>,

        #[arg(short, long)]
        status: Option<String>,

        #[arg(short, long)]
        priority: Option<String>,

        #[arg(short, long)]
        applied: Option<String>,

        #[arg(short, long)]
        follow_up: Option<String>,

        #[arg(short, long)]
        notes: Option<String>,

        #[arg(short, long)]
        recruiter: Option<String>,

        #[arg(long)]
        url: Option<String>,

        #[arg(long)]
        salary: Option<i64>,

        #[arg(long)]
        currency: Option<String>,

        /// Comma-separated tags, replacing the current ones
        #[arg(short, long)]
        tags: Option<String>,
    },

    /// Delete an application
    Delete {
        id: String,
    },

    /// Write all applications to a CSV file
    Export {
        /// Output path (defaults to applications-<date>.csv)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load applications from a CSV file
    Import {
        file: PathBuf,
    },

    /// Follow-up reminders for the current user
    Reminders {
        #[command(subcommand)]
        command: ReminderCommands,
    },

    /// Send every due reminder for all users
    Sweep,

    /// Show dashboard statistics
    Stats,

    /// View or change preferences
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },

    /// Send a test email
    TestEmail {
        to: String,
    },

    /// Delete the current user and all their applications
    DeleteAccount {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ReminderCommands {
    /// List active applications whose follow-up date has passed
    Due,

    /// Email due reminders (or one application's reminder) to yourself
    Send {
        /// Only this application
        #[arg(long)]
        id: Option<String>,
    },
}

#[derive(Subcommand)]
enum SettingsCommands {
    /// Show current settings
    Show,

    /// Update one or more settings
    Set {
        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        default_status: Option<String>,

        #[arg(long)]
        default_priority: Option<String>,

        #[arg(long)]
        default_currency: Option<String>,

        /// DD/MM/YYYY, MM/DD/YYYY or YYYY-MM-DD
        #[arg(long)]
        date_format: Option<String>,

        /// light, dark or system
        #[arg(long)]
        theme: Option<String>,

        #[arg(long)]
        accent_color: Option<String>,
    },
}

fn init_tracing() {
    // LOG_FORMAT - "json" or "text" (default: "text")
    // RUST_LOG   - standard env filter
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "apptrack=info,tower_http=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Validation and import errors carry details that `Display` leaves out.
fn describe(err: AppError) -> anyhow::Error {
    match err {
        AppError::Validation { details } => {
            let fields: Vec<String> = details
                .iter()
                .map(|(field, messages)| format!("  {}: {}", field, messages.join(", ")))
                .collect();
            anyhow!("Validation failed:\n{}", fields.join("\n"))
        }
        AppError::Import { message, details } if !details.is_empty() => {
            anyhow!("{}\n  {}", message, details.join("\n  "))
        }
        other => other.into(),
    }
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(path) = cli.db {
        config.db_path = path;
    }

    let db = Database::open(&config.db_path)?;

    match cli.command {
        Commands::Init => {
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            db.init()?;

            let mailer: Option<Arc<dyn EmailSink>> = match HttpMailer::new(&config.mail) {
                Ok(m) => Some(Arc::new(m)),
                Err(_) => {
                    tracing::warn!("Mail relay not configured (MAIL_API_URL, MAIL_API_KEY); reminders are disabled");
                    None
                }
            };
            if config.cron_secret.is_none() {
                tracing::warn!("CRON_SECRET not set; /cron/send-reminders is open");
            }

            let state = server::AppState::new(db, mailer, config.cron_secret.clone());
            let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
            runtime.block_on(server::serve(&config, state))?;
        }

        Commands::Add {
            company,
            role,
            status,
            priority,
            applied,
            follow_up,
            notes,
            recruiter,
            url,
            salary,
            currency,
            tags,
        } => {
            db.ensure_initialized()?;
            let user = db.get_or_create_user_by_email(&cli.user)?;
            let prefs = db.get_preferences(&user.id)?;
            let req = validation::CreateApplicationRequest {
                company: Some(company),
                role: Some(role),
                status,
                priority,
                applied_date: Some(applied.unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string())),
                follow_up_date: follow_up,
                notes,
                recruiter_name: recruiter,
                job_url: url,
                salary: salary.map(serde_json::Value::from),
                currency,
                tags: tags.map(|t| split_tags(&t)),
            };
            let draft = validation::validate_create(req, &prefs).map_err(describe)?;
            let app = db.insert_application(&user.id, &draft, Utc::now())?;
            println!("Added application {} ({} - {})", app.id, app.company, app.role);
        }

        Commands::List {
            status,
            search,
            sort,
            order,
            page,
            limit,
        } => {
            db.ensure_initialized()?;
            let user = db.get_or_create_user_by_email(&cli.user)?;
            let prefs = db.get_preferences(&user.id)?;
            let raw = query::RawListQuery {
                page: page.map(|p| p.to_string()),
                limit: limit.map(|l| l.to_string()),
                sort_by: sort,
                sort_order: order,
                status,
                search,
            };
            let list_query = query::ListQuery::try_from(raw).map_err(describe)?;
            let page = query::list_applications(&db, &user.id, &list_query)?;

            if page.data.is_empty() {
                println!("No applications found.");
            } else {
                println!(
                    "{:<10} {:<10} {:<7} {:<24} {:<24} {:<11}",
                    "ID", "STATUS", "PRIO", "COMPANY", "ROLE", "APPLIED"
                );
                println!("{}", "-".repeat(89));
                for app in &page.data {
                    println!(
                        "{:<10} {:<10} {:<7} {:<24} {:<24} {:<11}",
                        truncate(&app.id, 8),
                        app.status,
                        app.priority,
                        truncate(&app.company, 22),
                        truncate(&app.role, 22),
                        display_date(app.applied_date, &prefs.date_format)
                    );
                }
                println!(
                    "\nPage {} of {} ({} total)",
                    page.meta.page,
                    page.meta.total_pages.max(1),
                    page.meta.total
                );
            }
        }

        Commands::Show { id } => {
            db.ensure_initialized()?;
            let user = db.get_or_create_user_by_email(&cli.user)?;
            let prefs = db.get_preferences(&user.id)?;
            match db.owned_application(&user.id, &id) {
                Ok(app) => print_application(&app, &prefs.date_format),
                Err(AppError::NotFound(_)) | Err(AppError::Forbidden) => {
                    println!("Application {} not found.", id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Update {
            id,
            company,
            role,
            status,
            priority,
            applied,
            follow_up,
            notes,
            recruiter,
            url,
            salary,
            currency,
            tags,
        } => {
            db.ensure_initialized()?;
            let user = db.get_or_create_user_by_email(&cli.user)?;
            let req = validation::UpdateApplicationRequest {
                company: company.map(Some),
                role: role.map(Some),
                status: status.map(Some),
                priority: priority.map(Some),
                applied_date: applied.map(Some),
                follow_up_date: follow_up.map(Some),
                notes: notes.map(clearable),
                recruiter_name: recruiter.map(clearable),
                job_url: url.map(Some),
                salary: salary.map(|s| Some(serde_json::Value::from(s))),
                currency: currency.map(clearable),
                tags: tags.map(|t| Some(split_tags(&t))),
            };
            let patch = validation::validate_update(req).map_err(describe)?;
            let app = db.update_application(&user.id, &id, &patch, Utc::now())?;
            println!("Updated application {} ({} - {})", app.id, app.company, app.role);
        }

        Commands::Delete { id } => {
            db.ensure_initialized()?;
            let user = db.get_or_create_user_by_email(&cli.user)?;
            let app = db.delete_application(&user.id, &id)?;
            println!("Deleted application {} ({} - {})", app.id, app.company, app.role);
        }

        Commands::Export { output } => {
            db.ensure_initialized()?;
            let user = db.get_or_create_user_by_email(&cli.user)?;
            let apps = db.list_for_export(&user.id)?;
            let path = output.unwrap_or_else(|| PathBuf::from(csv::export_filename(Utc::now().date_naive())));
            std::fs::write(&path, csv::encode(&apps))
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Exported {} applications to {}", apps.len(), path.display());
        }

        Commands::Import { file } => {
            db.ensure_initialized()?;
            let is_csv = file
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
            if !is_csv {
                return Err(anyhow!("File must be a CSV"));
            }
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;

            let user = db.get_or_create_user_by_email(&cli.user)?;
            let prefs = db.get_preferences(&user.id)?;
            let decoded = csv::decode(&text, Utc::now(), &prefs.default_currency).map_err(describe)?;
            let imported = db.insert_applications(&user.id, &decoded.drafts, Utc::now())?;

            println!("Successfully imported {} applications", imported);
            if !decoded.errors.is_empty() {
                println!("\nSkipped {} row(s):", decoded.errors.len());
                for error in &decoded.errors {
                    println!("  {}", error);
                }
            }
        }

        Commands::Reminders { command } => {
            db.ensure_initialized()?;
            let user = db.get_or_create_user_by_email(&cli.user)?;
            match command {
                ReminderCommands::Due => {
                    let prefs = db.get_preferences(&user.id)?;
                    let apps = db.follow_ups_due(&user.id, Utc::now())?;
                    if apps.is_empty() {
                        println!("No follow-ups due.");
                    } else {
                        println!("{:<10} {:<24} {:<24} {:<11} {:<5}", "ID", "COMPANY", "ROLE", "FOLLOW-UP", "SENT");
                        println!("{}", "-".repeat(78));
                        for app in apps {
                            println!(
                                "{:<10} {:<24} {:<24} {:<11} {:<5}",
                                truncate(&app.id, 8),
                                truncate(&app.company, 22),
                                truncate(&app.role, 22),
                                app.follow_up_date
                                    .map(|d| display_date(d.date_naive(), &prefs.date_format))
                                    .unwrap_or_default(),
                                if app.reminder_sent_at.is_some() { "yes" } else { "no" }
                            );
                        }
                    }
                }

                ReminderCommands::Send { id } => {
                    let mailer = HttpMailer::new(&config.mail).map_err(describe)?;
                    let db = Mutex::new(db);
                    let report = match id {
                        Some(id) => reminders::send_for_application(&db, &mailer, &user, &id, Utc::now())?,
                        None => reminders::sweep_for_user(&db, &mailer, &user, Utc::now())?,
                    };
                    print_report(&report);
                }
            }
        }

        Commands::Sweep => {
            db.ensure_initialized()?;
            let mailer = HttpMailer::new(&config.mail).map_err(describe)?;
            let report = reminders::sweep_all(&Mutex::new(db), &mailer, Utc::now())?;
            print_report(&report);
        }

        Commands::Stats => {
            db.ensure_initialized()?;
            let user = db.get_or_create_user_by_email(&cli.user)?;
            let stats = stats::dashboard(&db, &user.id, Utc::now().date_naive())?;

            println!("Applications:   {}", stats.total_applications);
            println!("This month:     {}", stats.applications_this_month);
            println!("Interviews:     {} ({}%)", stats.total_interviews, stats.interview_rate);
            println!("Offers:         {} ({}%)", stats.total_offers, stats.offer_rate);
            println!("Rejections:     {} ({}%)", stats.total_rejected, stats.rejection_rate);

            println!("\nBy status:");
            for entry in &stats.status_distribution {
                println!("  {:<10} {:>4}", entry.status, entry.count);
            }

            println!("\nLast 12 months:");
            for month in &stats.monthly_trend {
                println!("  {}  {:>4} {}", month.month, month.count, "#".repeat(month.count.min(40)));
            }
        }

        Commands::Settings { command } => {
            db.ensure_initialized()?;
            let user = db.get_or_create_user_by_email(&cli.user)?;
            let settings = match command {
                SettingsCommands::Show => db.get_settings(&user.id)?,
                SettingsCommands::Set {
                    name,
                    default_status,
                    default_priority,
                    default_currency,
                    date_format,
                    theme,
                    accent_color,
                } => {
                    let req = validation::PreferencesRequest {
                        name: name.map(clearable),
                        default_status,
                        default_priority,
                        default_currency,
                        date_format,
                        theme,
                        accent_color,
                    };
                    let patch = validation::validate_preferences(req).map_err(describe)?;
                    if patch.is_empty() {
                        return Err(anyhow!("Nothing to update. See 'apptrack settings set --help'."));
                    }
                    let updated = db.update_preferences(&user.id, &patch)?;
                    println!("Settings updated.\n");
                    updated
                }
            };
            let settings = settings.ok_or_else(|| anyhow!("User {} not found", user.email))?;
            print_settings(&user, &settings);
        }

        Commands::TestEmail { to } => {
            let sink = HttpMailer::new(&config.mail).map_err(describe)?;
            let receipt = sink.deliver(&mailer::test_email(&to))?;
            println!("Test email sent to {}. Check your inbox!", to);
            if let Some(id) = receipt.message_id {
                println!("Message ID: {}", id);
            }
        }

        Commands::DeleteAccount { yes } => {
            db.ensure_initialized()?;
            if !yes {
                return Err(anyhow!(
                    "This deletes {} and every application they own. Re-run with --yes to confirm.",
                    cli.user
                ));
            }
            let user = db
                .get_user_by_email(&cli.user)?
                .ok_or_else(|| anyhow!("User {} not found", cli.user))?;
            db.delete_user(&user.id)?;
            println!("Deleted account {}.", user.email);
        }
    }

    Ok(())
}

fn print_application(app: &Application, date_format: &str) {
    println!("Application {}", app.id);
    println!("Company: {}", app.company);
    println!("Role: {}", app.role);
    println!("Status: {}", app.status);
    println!("Priority: {}", app.priority);
    println!("Applied: {}", display_date(app.applied_date, date_format));
    if let Some(follow_up) = app.follow_up_date {
        let sent = match app.reminder_sent_at {
            Some(at) => format!(" (reminder sent {})", display_date(at.date_naive(), date_format)),
            None => String::new(),
        };
        println!("Follow up: {}{}", display_date(follow_up.date_naive(), date_format), sent);
    }
    if let Some(recruiter) = &app.recruiter_name {
        println!("Recruiter: {}", recruiter);
    }
    if let Some(url) = &app.job_url {
        println!("URL: {}", url);
    }
    if let Some(salary) = app.salary {
        println!("Salary: {} {}", salary, app.currency.as_deref().unwrap_or(""));
    }
    if !app.tags.is_empty() {
        println!("Tags: {}", app.tags.join(", "));
    }
    println!("Created: {}", app.created_at.format("%Y-%m-%d %H:%M"));
    println!("Updated: {}", app.updated_at.format("%Y-%m-%d %H:%M"));
    if let Some(notes) = &app.notes {
        println!("\n--- Notes ---\n{}", textwrap::fill(notes, 78));
    }
}

fn print_report(report: &reminders::SweepReport) {
    println!("{}", report.message());
    for result in &report.results {
        match &result.error {
            None => println!("  sent    {} -> {}", result.company, result.email),
            Some(err) => println!("  FAILED  {} -> {}: {}", result.company, result.email, err),
        }
    }
}

fn print_settings(user: &User, settings: &models::Settings) {
    let prefs = &settings.preferences;
    println!("User: {} <{}>", settings.name.as_deref().unwrap_or("-"), user.email);
    println!("Default status: {}", prefs.default_status);
    println!("Default priority: {}", prefs.default_priority);
    println!("Default currency: {}", prefs.default_currency);
    println!("Date format: {}", prefs.date_format);
    println!("Theme: {}", prefs.theme);
    println!("Accent color: {}", prefs.accent_color);
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// CLI convention: an empty argument clears the field.
fn clearable(value: String) -> Option<String> {
    (!value.trim().is_empty()).then_some(value)
}

fn display_date(date: NaiveDate, date_format: &str) -> String {
    let pattern = match date_format {
        "MM/DD/YYYY" => "%m/%d/%Y",
        "YYYY-MM-DD" => "%Y-%m-%d",
        _ => "%d/%m/%Y",
    };
    date.format(pattern).to_string()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

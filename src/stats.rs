use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use crate::db::Database;
use crate::error::Result;
use crate::models::Status;

const TREND_MONTHS: i32 = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthCount {
    pub month: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusCount {
    pub status: Status,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_applications: usize,
    pub total_offers: usize,
    pub total_rejected: usize,
    pub total_interviews: usize,
    pub applications_this_month: usize,
    pub offer_rate: String,
    pub interview_rate: String,
    pub rejection_rate: String,
    pub monthly_trend: Vec<MonthCount>,
    pub status_distribution: Vec<StatusCount>,
}

pub fn dashboard(db: &Database, user_id: &str, today: NaiveDate) -> Result<DashboardStats> {
    let summaries = db.application_summaries(user_id)?;
    Ok(compute(&summaries, today))
}

pub fn compute(summaries: &[(NaiveDate, Status)], today: NaiveDate) -> DashboardStats {
    let total = summaries.len();
    let count_status = |status: Status| summaries.iter().filter(|(_, s)| *s == status).count();

    let month_start = first_of_month(today.year(), today.month0() as i32);
    let applications_this_month = summaries.iter().filter(|(d, _)| *d >= month_start).count();

    let monthly_trend = (0..TREND_MONTHS)
        .rev()
        .map(|back| {
            let month = first_of_month(today.year(), today.month0() as i32 - back);
            let count = summaries
                .iter()
                .filter(|(d, _)| d.year() == month.year() && d.month() == month.month())
                .count();
            MonthCount {
                month: month.format("%Y-%m").to_string(),
                count,
            }
        })
        .collect();

    let status_distribution = Status::ALL
        .into_iter()
        .map(|status| StatusCount {
            status,
            count: count_status(status),
        })
        .collect();

    let total_offers = count_status(Status::Offer);
    let total_rejected = count_status(Status::Rejected);
    let total_interviews = count_status(Status::Interview);

    DashboardStats {
        total_applications: total,
        total_offers,
        total_rejected,
        total_interviews,
        applications_this_month,
        offer_rate: rate(total_offers, total),
        interview_rate: rate(total_interviews, total),
        rejection_rate: rate(total_rejected, total),
        monthly_trend,
        status_distribution,
    }
}

/// Percentage with one decimal place.
fn rate(part: usize, total: usize) -> String {
    if total == 0 {
        return "0.0".to_string();
    }
    format!("{:.1}", part as f64 / total as f64 * 100.0)
}

/// First day of `year`/`month0`, where `month0` may run outside 0..12.
fn first_of_month(year: i32, month0: i32) -> NaiveDate {
    let y = year + month0.div_euclid(12);
    let m = month0.rem_euclid(12) as u32 + 1;
    NaiveDate::from_ymd_opt(y, m, 1).unwrap_or(NaiveDate::MIN)
}

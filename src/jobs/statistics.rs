//! Booking statistics: aggregate finished bookings per day, then write daily and weekly reports
//! in parallel.

use anyhow::{Context, Result, bail};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use rusqlite::{Transaction, named_params};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::collaborators::ReportWriter;
use super::entities::{BookingStatus, FinishedBooking, StatisticsRow};
use super::{JobContext, MAKE_STATISTICS_JOB, step_config};
use crate::ExecutionContext;
use crate::engine::{ChunkStep, CommitStage, TaskletStep, TransformStage};
use crate::pipeline::{Flow, FlowNode, Job, JobParams};
use crate::store::{CursorSource, Database, QuerySpec, SqlCommitter};
use crate::utils::config::JobDefaults;

/// Params: `from`, `to` (datetimes, inclusive).
pub fn make_statistics_job(ctx: &JobContext, params: &JobParams) -> Result<Job> {
    let from = params.datetime("from")?;
    let to = params.datetime("to")?;
    if from > to {
        bail!("'from' ({from}) is after 'to' ({to})");
    }

    let reports = Flow::parallel(
        "makeStatisticsReportsFlow",
        vec![
            Flow::single(
                "makeDailyStatisticsFlow",
                report_step("makeDailyStatisticsStep", ctx, from, to, Period::Daily),
            ),
            Flow::single(
                "makeWeeklyStatisticsFlow",
                report_step("makeWeeklyStatisticsStep", ctx, from, to, Period::Weekly),
            ),
        ],
    );
    let flow = Flow::sequential(
        MAKE_STATISTICS_JOB,
        vec![
            FlowNode::Flow(Flow::single(
                "addStatisticsFlow",
                add_statistics_step(ctx, from, to)?,
            )),
            reports.into(),
        ],
    );
    Ok(Job::new(MAKE_STATISTICS_JOB, flow))
}

// --- addStatisticsStep ---

fn add_statistics_step(
    ctx: &JobContext,
    from: NaiveDateTime,
    to: NaiveDateTime,
) -> Result<ChunkStep<FinishedBooking, FinishedBooking>> {
    let settings = ctx.job_settings(MAKE_STATISTICS_JOB);
    let query = QuerySpec::new(
        "SELECT booking_seq, status, attended, ended_at FROM booking \
         WHERE ended_at >= :from AND ended_at <= :to ORDER BY booking_seq",
    )
    .bind("from", from)
    .bind("to", to);
    let source = CursorSource::new(
        "addStatisticsItemReader",
        ctx.db.clone(),
        query,
        FinishedBooking::from_row,
    )?;
    let committer = SqlCommitter::new("addStatisticsItemWriter", ctx.db.clone(), write_statistics);
    Ok(ChunkStep::new(
        "addStatisticsStep",
        source,
        TransformStage::pass_through(),
        CommitStage::sync(committer),
        step_config(&settings, JobDefaults::STATISTICS_CHUNK),
    ))
}

#[derive(Default)]
struct DayCounts {
    all: i64,
    attended: i64,
    cancelled: i64,
}

/// One statistics row per day present in the chunk. Rows from different chunks for the same day
/// are summed when reports are built.
fn write_statistics(tx: &Transaction<'_>, bookings: Vec<FinishedBooking>) -> Result<usize> {
    let mut per_day: BTreeMap<NaiveDate, DayCounts> = BTreeMap::new();
    for b in &bookings {
        let day = per_day.entry(b.ended_at.date()).or_default();
        day.all += 1;
        if b.attended {
            day.attended += 1;
        }
        if b.status == BookingStatus::Cancelled {
            day.cancelled += 1;
        }
    }
    let mut stmt = tx
        .prepare_cached(
            "INSERT INTO statistics (statistics_at, all_count, attended_count, cancelled_count) \
             VALUES (:statistics_at, :all_count, :attended_count, :cancelled_count)",
        )
        .context("prepare statistics insert")?;
    for (day, c) in &per_day {
        stmt.execute(named_params! {
            ":statistics_at": day.and_time(chrono::NaiveTime::MIN),
            ":all_count": c.all,
            ":attended_count": c.attended,
            ":cancelled_count": c.cancelled,
        })
        .with_context(|| format!("insert statistics for {day}"))?;
    }
    Ok(per_day.len())
}

// --- reports ---

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Period {
    Daily,
    Weekly,
}

impl Period {
    /// Report filename prefix.
    pub fn prefix(self) -> &'static str {
        match self {
            Period::Daily => "daily_statistics",
            Period::Weekly => "weekly_statistics",
        }
    }

    /// Bucket start: the day itself, or the Monday of its ISO week.
    pub fn bucket(self, day: NaiveDate) -> NaiveDate {
        match self {
            Period::Daily => day,
            Period::Weekly => {
                day - Duration::days(i64::from(day.weekday().num_days_from_monday()))
            }
        }
    }
}

fn report_step(
    name: &str,
    ctx: &JobContext,
    from: NaiveDateTime,
    to: NaiveDateTime,
    period: Period,
) -> TaskletStep {
    let db = ctx.db.clone();
    let reports = Arc::clone(&ctx.reports);
    TaskletStep::from_fn(name, move |ec: &mut ExecutionContext| {
        write_report(&db, reports.as_ref(), from, to, period, ec)
    })
}

/// Statistics for the days `from` through `to` grouped per period, oldest first.
pub fn aggregate_statistics(
    db: &Database,
    from: NaiveDateTime,
    to: NaiveDateTime,
    period: Period,
) -> Result<Vec<StatisticsRow>> {
    let conn = db.connect()?;
    let mut stmt = conn
        .prepare(
            "SELECT date(statistics_at) AS day, SUM(all_count), SUM(attended_count), \
             SUM(cancelled_count) FROM statistics \
             WHERE date(statistics_at) >= :from AND date(statistics_at) <= :to \
             GROUP BY day ORDER BY day",
        )
        .context("prepare statistics query")?;
    let (from, to) = (from.date(), to.date());
    let days = stmt
        .query_map(named_params! { ":from": from, ":to": to }, |row| {
            Ok((
                row.get::<_, NaiveDate>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("read statistics")?;

    let mut buckets: BTreeMap<NaiveDate, (i64, i64, i64)> = BTreeMap::new();
    for (day, all, attended, cancelled) in days {
        let b = buckets.entry(period.bucket(day)).or_default();
        b.0 += all;
        b.1 += attended;
        b.2 += cancelled;
    }
    Ok(buckets
        .into_iter()
        .map(|(day, (all, attended, cancelled))| StatisticsRow {
            statistics_at: day.format("%Y-%m-%d").to_string(),
            all_count: all,
            attended_count: attended,
            cancelled_count: cancelled,
        })
        .collect())
}

fn write_report(
    db: &Database,
    reports: &dyn ReportWriter,
    from: NaiveDateTime,
    to: NaiveDateTime,
    period: Period,
    ec: &mut ExecutionContext,
) -> Result<()> {
    let rows = aggregate_statistics(db, from, to, period)?;
    let mut records: Vec<Vec<String>> = Vec::with_capacity(rows.len() + 1);
    records.push(StatisticsRow::HEADER.iter().map(|h| h.to_string()).collect());
    records.extend(rows.iter().map(StatisticsRow::to_record));
    let filename = format!("{}_{}.csv", period.prefix(), from.format("%Y%m%d"));
    reports.write(&filename, &records)?;

    ec.chunk = 1;
    ec.counts.read += rows.len();
    ec.counts.written += rows.len();
    ec.counts.persisted += rows.len();
    ec.counts.commits += 1;
    Ok(())
}

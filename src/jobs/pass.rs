//! Pass lifecycle jobs: expire finished passes, consume passes for completed bookings, and hand
//! out bulk passes to user groups.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDateTime};
use log::info;
use rusqlite::{Transaction, TransactionBehavior, named_params};

use super::entities::{BookingPass, BookingStatus, BulkPass, BulkPassStatus, Pass, PassStatus};
use super::{
    ADD_PASSES_JOB, EXPIRE_PASSES_JOB, JobContext, USE_PASSES_JOB, step_config, worker_pool,
};
use crate::ExecutionContext;
use crate::engine::{ChunkStep, CommitStage, TaskletStep, TransformStage, Transformed, WorkerPool};
use crate::pipeline::{Job, JobParams};
use crate::store::{CursorSource, Database, QuerySpec, SqlCommitter};
use crate::utils::config::JobDefaults;

// --- expirePassesJob ---

/// Passes in progress whose end time has passed become EXPIRED.
pub fn expire_passes_job(ctx: &JobContext, params: &JobParams) -> Result<Job> {
    let now = params.datetime_or_now("now")?;
    let settings = ctx.job_settings(EXPIRE_PASSES_JOB);

    let query = QuerySpec::new(format!(
        "SELECT {} FROM pass WHERE status = :status AND ended_at <= :ended_at ORDER BY pass_seq",
        Pass::COLUMNS
    ))
    .bind("status", PassStatus::Progressed)
    .bind("ended_at", now);
    let source = CursorSource::new("expirePassesItemReader", ctx.db.clone(), query, Pass::from_row)?;

    let transform = TransformStage::map(move |mut pass: Pass| {
        pass.status = PassStatus::Expired;
        pass.expired_at = Some(now);
        Ok(Transformed::Item(pass))
    });
    let committer = SqlCommitter::new("expirePassesItemWriter", ctx.db.clone(), write_expired);

    let step = ChunkStep::new(
        "expirePassesStep",
        source,
        transform,
        CommitStage::sync(committer),
        step_config(&settings, JobDefaults::EXPIRE_PASSES_CHUNK),
    );
    Ok(Job::single_step(EXPIRE_PASSES_JOB, step))
}

fn write_expired(tx: &Transaction<'_>, passes: Vec<Pass>) -> Result<usize> {
    let mut stmt = tx
        .prepare_cached(
            "UPDATE pass SET status = :status, expired_at = :expired_at WHERE pass_seq = :pass_seq",
        )
        .context("prepare pass update")?;
    let mut changed = 0;
    for pass in &passes {
        changed += stmt
            .execute(named_params! {
                ":status": pass.status,
                ":expired_at": pass.expired_at,
                ":pass_seq": pass.pass_seq,
            })
            .with_context(|| format!("expire pass {}", pass.pass_seq))?;
    }
    Ok(changed)
}

// --- usePassesJob ---

/// A booking's claim on one use of its pass.
#[derive(Clone, Debug)]
pub struct PassUse {
    pub booking_seq: i64,
    pub pass_seq: i64,
}

/// Completed bookings consume one use of their pass. Both stages run on worker pools: the
/// transformer per booking, the committer one chunk behind the reader.
pub fn use_passes_job(ctx: &JobContext, params: &JobParams) -> Result<Job> {
    let now = params.datetime_or_now("now")?;
    let settings = ctx.job_settings(USE_PASSES_JOB);

    let query = QuerySpec::new(
        "SELECT b.booking_seq, b.pass_seq, p.remaining_count \
         FROM booking b JOIN pass p ON p.pass_seq = b.pass_seq \
         WHERE b.status = :status AND b.used_pass = :used_pass AND b.ended_at < :ended_at \
         ORDER BY b.booking_seq",
    )
    .bind("status", BookingStatus::Completed)
    .bind("used_pass", false)
    .bind("ended_at", now);
    let source = CursorSource::new(
        "usePassesItemReader",
        ctx.db.clone(),
        query,
        BookingPass::from_row,
    )?;

    let transform =
        TransformStage::parallel_map(use_pass, worker_pool("usePassesProcessor", &settings)?);
    let committer = SqlCommitter::new("usePassesItemWriter", ctx.db.clone(), write_pass_uses);
    let commit = CommitStage::background(committer, WorkerPool::new("usePassesWriter", 1)?);

    let step = ChunkStep::new(
        "usePassesStep",
        source,
        transform,
        commit,
        step_config(&settings, JobDefaults::USE_PASSES_CHUNK),
    );
    Ok(Job::single_step(USE_PASSES_JOB, step))
}

/// Exhausted passes are filtered; the booking stays unused.
fn use_pass(booking: BookingPass) -> Result<Transformed<PassUse>> {
    if booking.remaining_count.is_some_and(|n| n <= 0) {
        return Ok(Transformed::Filtered);
    }
    Ok(Transformed::Item(PassUse {
        booking_seq: booking.booking_seq,
        pass_seq: booking.pass_seq,
    }))
}

/// Decrements in SQL so bookings sharing a pass within or across chunks never lose an update;
/// a booking is marked used only when its pass actually had a use left.
fn write_pass_uses(tx: &Transaction<'_>, uses: Vec<PassUse>) -> Result<usize> {
    let mut decrement = tx
        .prepare_cached(
            "UPDATE pass SET remaining_count = remaining_count - 1 \
             WHERE pass_seq = :pass_seq AND (remaining_count IS NULL OR remaining_count > 0)",
        )
        .context("prepare pass decrement")?;
    let mut mark_used = tx
        .prepare_cached(
            "UPDATE booking SET used_pass = 1 WHERE booking_seq = :booking_seq AND used_pass = 0",
        )
        .context("prepare booking update")?;
    let mut used = 0;
    for u in &uses {
        let decremented = decrement
            .execute(named_params! { ":pass_seq": u.pass_seq })
            .with_context(|| format!("decrement pass {}", u.pass_seq))?;
        if decremented == 0 {
            continue;
        }
        used += mark_used
            .execute(named_params! { ":booking_seq": u.booking_seq })
            .with_context(|| format!("mark booking {} used", u.booking_seq))?;
    }
    Ok(used)
}

// --- addPassesJob ---

/// Bulk passes starting after `now - 1 day` grant one pass to every member of their user group.
pub fn add_passes_job(ctx: &JobContext, params: &JobParams) -> Result<Job> {
    let now = params.datetime_or_now("now")?;
    let db = ctx.db.clone();
    let step = TaskletStep::from_fn("addPassesStep", move |ec: &mut ExecutionContext| {
        add_passes(&db, now, ec)
    });
    Ok(Job::single_step(ADD_PASSES_JOB, step))
}

/// One transaction for every bulk pass: all grants land or none do.
fn add_passes(db: &Database, now: NaiveDateTime, ec: &mut ExecutionContext) -> Result<()> {
    let since = now - Duration::days(JobDefaults::BULK_PASS_LOOKBACK_DAYS);
    let mut conn = db.connect()?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("begin transaction")?;

    let bulk_passes: Vec<BulkPass> = {
        let mut stmt = tx
            .prepare(
                "SELECT bulk_pass_seq, package_seq, user_group_id, count, started_at, ended_at \
                 FROM bulk_pass WHERE status = :status AND started_at > :since \
                 ORDER BY bulk_pass_seq",
            )
            .context("prepare bulk pass query")?;
        let rows = stmt.query_map(
            named_params! { ":status": BulkPassStatus::Ready, ":since": since },
            BulkPass::from_row,
        )?;
        rows.collect::<rusqlite::Result<_>>()
            .context("read bulk passes")?
    };

    let mut added = 0;
    for bulk in &bulk_passes {
        ec.counts.read += 1;
        let user_ids: Vec<String> = {
            let mut stmt = tx
                .prepare_cached("SELECT user_id FROM user_group_mapping WHERE user_group_id = ?1")
                .context("prepare group query")?;
            let rows = stmt.query_map([&bulk.user_group_id], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()
                .with_context(|| format!("read user group {}", bulk.user_group_id))?
        };
        added += grant_passes(&tx, bulk, &user_ids)?;
        tx.execute(
            "UPDATE bulk_pass SET status = :status WHERE bulk_pass_seq = :seq",
            named_params! { ":status": BulkPassStatus::Completed, ":seq": bulk.bulk_pass_seq },
        )
        .with_context(|| format!("complete bulk pass {}", bulk.bulk_pass_seq))?;
    }
    tx.commit().context("commit transaction")?;

    ec.chunk = 1;
    ec.counts.written += added;
    ec.counts.persisted += added;
    ec.counts.commits += 1;
    info!(
        "Added {} passes from {} bulk passes (started after {})",
        added,
        bulk_passes.len(),
        since
    );
    Ok(())
}

fn grant_passes(tx: &Transaction<'_>, bulk: &BulkPass, user_ids: &[String]) -> Result<usize> {
    let mut stmt = tx
        .prepare_cached(
            "INSERT INTO pass (package_seq, user_id, status, remaining_count, started_at, ended_at) \
             VALUES (:package_seq, :user_id, :status, :remaining_count, :started_at, :ended_at)",
        )
        .context("prepare pass insert")?;
    for user_id in user_ids {
        stmt.execute(named_params! {
            ":package_seq": bulk.package_seq,
            ":user_id": user_id,
            ":status": PassStatus::Ready,
            ":remaining_count": bulk.count,
            ":started_at": bulk.started_at,
            ":ended_at": bulk.ended_at,
        })
        .with_context(|| format!("grant pass to {user_id}"))?;
    }
    Ok(user_ids.len())
}

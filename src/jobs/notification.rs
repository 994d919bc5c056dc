//! Class reminders: queue a notification for every booking starting soon, then deliver the
//! unsent ones on several workers sharing one cursor.

use anyhow::{Context, Result};
use chrono::{Duration, Local, NaiveDateTime};
use log::{info, warn};
use rusqlite::{Transaction, named_params};
use std::sync::Arc;

use super::collaborators::Notifier;
use super::entities::{
    BookingStatus, Notification, NotificationDraft, NotificationEvent, UpcomingBooking,
};
use super::{JobContext, SEND_NOTIFICATION_JOB, step_config, worker_count};
use crate::engine::{
    ChunkStep, CommitStage, Committer, CommitterFactory, ConcurrentChunkStep, SynchronizedSource,
    TransformStage, Transformed,
};
use crate::pipeline::{Flow, FlowNode, Job, JobParams};
use crate::store::{CursorSource, PagingSource, QuerySpec, SqlCommitter};
use crate::utils::config::JobDefaults;

pub fn send_notification_job(ctx: &JobContext, params: &JobParams) -> Result<Job> {
    let now = params.datetime_or_now("now")?;
    let flow = Flow::sequential(
        SEND_NOTIFICATION_JOB,
        vec![
            FlowNode::step(add_notification_step(ctx, now)?),
            FlowNode::step(send_notification_step(ctx)?),
        ],
    );
    Ok(Job::new(SEND_NOTIFICATION_JOB, flow))
}

// --- addNotificationStep ---

/// Paging is enough here: the step inserts notifications and never changes the bookings it
/// selects.
fn add_notification_step(
    ctx: &JobContext,
    now: NaiveDateTime,
) -> Result<ChunkStep<UpcomingBooking, NotificationDraft>> {
    let settings = ctx.job_settings(SEND_NOTIFICATION_JOB);
    let config = step_config(&settings, JobDefaults::NOTIFICATION_CHUNK);
    let until = now + Duration::minutes(JobDefaults::NOTIFY_BEFORE_MINUTES);

    let query = QuerySpec::new(
        "SELECT b.booking_seq, u.uuid, b.started_at \
         FROM booking b JOIN users u ON u.user_id = b.user_id \
         WHERE b.status = :status AND b.started_at > :now AND b.started_at <= :until \
           AND b.booking_seq > :__after \
         ORDER BY b.booking_seq LIMIT :__page_size",
    )
    .bind("status", BookingStatus::Ready)
    .bind("now", now)
    .bind("until", until);
    let source = PagingSource::new(
        "addNotificationItemReader",
        ctx.db.clone(),
        query,
        "booking_seq",
        settings.page_size.unwrap_or(config.chunk_size.max(1)),
        UpcomingBooking::from_row,
    )?;

    let committer = SqlCommitter::new(
        "addNotificationItemWriter",
        ctx.db.clone(),
        insert_notifications,
    );
    Ok(ChunkStep::new(
        "addNotificationStep",
        source,
        TransformStage::map(to_notification),
        CommitStage::sync(committer),
        config,
    ))
}

/// Users without a messaging id cannot be reached; their bookings are filtered.
fn to_notification(booking: UpcomingBooking) -> Result<Transformed<NotificationDraft>> {
    let Some(uuid) = booking.uuid else {
        return Ok(Transformed::Filtered);
    };
    Ok(Transformed::Item(NotificationDraft {
        uuid,
        event: NotificationEvent::BeforeClass,
        text: format!(
            "Your class starts at {}. Please arrive a few minutes early.",
            booking.started_at.format("%Y-%m-%d %H:%M")
        ),
    }))
}

fn insert_notifications(tx: &Transaction<'_>, drafts: Vec<NotificationDraft>) -> Result<usize> {
    let created_at = Local::now().naive_local();
    let mut stmt = tx
        .prepare_cached(
            "INSERT INTO notification (uuid, event, text, sent, created_at) \
             VALUES (:uuid, :event, :text, 0, :created_at)",
        )
        .context("prepare notification insert")?;
    for d in &drafts {
        stmt.execute(named_params! {
            ":uuid": d.uuid,
            ":event": d.event,
            ":text": d.text,
            ":created_at": created_at,
        })
        .with_context(|| format!("insert notification for {}", d.uuid))?;
    }
    Ok(drafts.len())
}

// --- sendNotificationStep ---

/// The cursor is read under a lock, one record per call; delivery and marking run on each
/// worker in parallel.
fn send_notification_step(
    ctx: &JobContext,
) -> Result<ConcurrentChunkStep<Notification, Notification>> {
    let settings = ctx.job_settings(SEND_NOTIFICATION_JOB);
    let config = step_config(&settings, JobDefaults::NOTIFICATION_CHUNK);
    let workers = worker_count(&settings)?;

    let query = QuerySpec::new(
        "SELECT notification_seq, uuid, event, text FROM notification \
         WHERE event = :event AND sent = :sent ORDER BY notification_seq",
    )
    .bind("event", NotificationEvent::BeforeClass)
    .bind("sent", false);
    let cursor = CursorSource::new(
        "sendNotificationItemReader",
        ctx.db.clone(),
        query,
        Notification::from_row,
    )?;

    let db = ctx.db.clone();
    let notifier = Arc::clone(&ctx.notifier);
    let committers: CommitterFactory<Notification> = Arc::new(move || {
        Box::new(DeliveryCommitter {
            notifier: Arc::clone(&notifier),
            marker: SqlCommitter::new("sendNotificationItemWriter", db.clone(), mark_sent),
        }) as Box<dyn Committer<Notification>>
    });

    Ok(ConcurrentChunkStep::new(
        "sendNotificationStep",
        Arc::new(SynchronizedSource::new(cursor)),
        TransformStage::pass_through(),
        committers,
        workers,
        config,
    ))
}

/// Delivers each notification of the chunk, then marks the delivered ones sent in one
/// transaction. Undelivered ones stay unsent for the next run.
struct DeliveryCommitter {
    notifier: Arc<dyn Notifier>,
    marker: SqlCommitter<i64>,
}

impl Committer<Notification> for DeliveryCommitter {
    fn open(&mut self) -> Result<()> {
        self.marker.open()
    }

    fn commit(&mut self, chunk: Vec<Notification>) -> Result<usize> {
        let total = chunk.len();
        let delivered: Vec<i64> = chunk
            .into_iter()
            .filter(|n| {
                let ok = self.notifier.deliver(&n.uuid, &n.text);
                if !ok {
                    warn!("notification {} to {} not delivered", n.notification_seq, n.uuid);
                }
                ok
            })
            .map(|n| n.notification_seq)
            .collect();
        let sent = self.marker.commit(delivered)?;
        info!("{}/{} notifications delivered", sent, total);
        Ok(sent)
    }

    fn close(&mut self) {
        self.marker.close();
    }
}

fn mark_sent(tx: &Transaction<'_>, seqs: Vec<i64>) -> Result<usize> {
    let sent_at = Local::now().naive_local();
    let mut stmt = tx
        .prepare_cached(
            "UPDATE notification SET sent = 1, sent_at = :sent_at \
             WHERE notification_seq = :seq AND sent = 0",
        )
        .context("prepare notification update")?;
    let mut changed = 0;
    for seq in seqs {
        changed += stmt
            .execute(named_params! { ":sent_at": sent_at, ":seq": seq })
            .with_context(|| format!("mark notification {seq} sent"))?;
    }
    Ok(changed)
}

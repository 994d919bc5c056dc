//! Domain job tests against a temp SQLite database. Every run pins `now` through the job params.

mod common;

use chrono::{Duration, NaiveDateTime};
use common::{TempDb, dt};
use passbatch::jobs::entities::PassStatus;
use passbatch::jobs::statistics::{Period, aggregate_statistics};
use passbatch::jobs::{
    ADD_PASSES_JOB, CsvReportWriter, EXPIRE_PASSES_JOB, JobContext, MAKE_STATISTICS_JOB, Notifier,
    SEND_NOTIFICATION_JOB, USE_PASSES_JOB, default_registry,
};
use passbatch::pipeline::JobParams;
use passbatch::{BatchStatus, JobResult, JobSettings, Settings};
use rusqlite::{Connection, params};
use std::sync::{Arc, Mutex};

const NOW: &str = "2024-03-01 10:00";

fn settings_with(job: &str, job_settings: JobSettings) -> Settings {
    let mut settings = Settings::default();
    settings.jobs.insert(job.to_string(), job_settings);
    settings
}

fn run(ctx: &JobContext, job: &str, params: JobParams) -> JobResult {
    default_registry().launch(ctx, job, &params).unwrap()
}

fn at_now() -> JobParams {
    JobParams::new().with("now", NOW)
}

fn insert_user(conn: &Connection, user_id: &str, uuid: Option<&str>) {
    conn.execute(
        "INSERT INTO users (user_id, user_name, uuid) VALUES (?1, ?1, ?2)",
        params![user_id, uuid],
    )
    .unwrap();
}

fn insert_pass(
    conn: &Connection,
    status: &str,
    remaining: Option<i64>,
    ended_at: NaiveDateTime,
) -> i64 {
    conn.execute(
        "INSERT INTO pass (package_seq, user_id, status, remaining_count, started_at, ended_at) \
         VALUES (1, 'u1', ?1, ?2, ?3, ?4)",
        params![status, remaining, ended_at - Duration::days(30), ended_at],
    )
    .unwrap();
    conn.last_insert_rowid()
}

struct NewBooking<'a> {
    pass_seq: i64,
    user_id: &'a str,
    status: &'a str,
    used_pass: bool,
    attended: bool,
    started_at: NaiveDateTime,
    ended_at: NaiveDateTime,
}

impl Default for NewBooking<'_> {
    fn default() -> Self {
        Self {
            pass_seq: 1,
            user_id: "u1",
            status: "COMPLETED",
            used_pass: false,
            attended: false,
            started_at: dt("2024-02-29 09:00"),
            ended_at: dt("2024-02-29 10:00"),
        }
    }
}

fn insert_booking(conn: &Connection, b: NewBooking<'_>) -> i64 {
    conn.execute(
        "INSERT INTO booking (pass_seq, user_id, status, used_pass, attended, started_at, ended_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            b.pass_seq,
            b.user_id,
            b.status,
            b.used_pass,
            b.attended,
            b.started_at,
            b.ended_at
        ],
    )
    .unwrap();
    conn.last_insert_rowid()
}

fn pass_status(tmp: &TempDb, pass_seq: i64) -> (PassStatus, Option<NaiveDateTime>) {
    tmp.conn()
        .query_row(
            "SELECT status, expired_at FROM pass WHERE pass_seq = ?1",
            [pass_seq],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap()
}

fn remaining(tmp: &TempDb, pass_seq: i64) -> Option<i64> {
    tmp.conn()
        .query_row(
            "SELECT remaining_count FROM pass WHERE pass_seq = ?1",
            [pass_seq],
            |row| row.get(0),
        )
        .unwrap()
}

fn used(tmp: &TempDb, booking_seq: i64) -> bool {
    tmp.conn()
        .query_row(
            "SELECT used_pass FROM booking WHERE booking_seq = ?1",
            [booking_seq],
            |row| row.get(0),
        )
        .unwrap()
}

// --- registry ---

#[test]
fn test_default_registry_names_every_job() {
    let registry = default_registry();
    for name in [
        EXPIRE_PASSES_JOB,
        USE_PASSES_JOB,
        ADD_PASSES_JOB,
        SEND_NOTIFICATION_JOB,
        MAKE_STATISTICS_JOB,
    ] {
        assert!(registry.contains(name), "{name}");
    }
    assert_eq!(registry.names().len(), 5);
}

#[test]
fn test_bad_now_param_fails_job_build() {
    let tmp = TempDb::new("bad-now");
    let ctx = JobContext::new(tmp.db.clone(), Settings::default());
    let params = JobParams::new().with("now", "yesterday");
    let err = default_registry()
        .launch(&ctx, EXPIRE_PASSES_JOB, &params)
        .unwrap_err();
    assert!(format!("{err:#}").contains("now"), "{err:#}");
}

// --- expirePassesJob ---

#[test]
fn test_expire_passes() {
    let tmp = TempDb::new("expire");
    let conn = tmp.conn();
    let now = dt(NOW);
    let expired: Vec<i64> = (0..12)
        .map(|i| insert_pass(&conn, "PROGRESSED", Some(3), now - Duration::hours(i + 1)))
        .collect();
    let at_boundary = insert_pass(&conn, "PROGRESSED", Some(3), now);
    let future = insert_pass(&conn, "PROGRESSED", Some(3), now + Duration::hours(1));
    let ready = insert_pass(&conn, "READY", Some(3), now - Duration::hours(1));

    let ctx = JobContext::new(tmp.db.clone(), Settings::default());
    let result = run(&ctx, EXPIRE_PASSES_JOB, at_now());

    assert_eq!(result.status, BatchStatus::Completed);
    let step = result.step("expirePassesStep").unwrap();
    assert_eq!(step.counts.read, 13);
    assert_eq!(step.counts.written, 13);
    // Chunks of 5.
    assert_eq!(step.counts.commits, 3);
    for seq in expired.iter().copied().chain([at_boundary]) {
        assert_eq!(pass_status(&tmp, seq), (PassStatus::Expired, Some(now)));
    }
    assert_eq!(pass_status(&tmp, future), (PassStatus::Progressed, None));
    assert_eq!(pass_status(&tmp, ready), (PassStatus::Ready, None));

    // Nothing left to expire.
    let again = run(&ctx, EXPIRE_PASSES_JOB, at_now());
    assert_eq!(again.step("expirePassesStep").unwrap().counts.read, 0);
}

#[test]
fn test_expire_passes_chunk_size_override() {
    let tmp = TempDb::new("expire-chunk");
    let conn = tmp.conn();
    for i in 0..7 {
        insert_pass(&conn, "PROGRESSED", None, dt(NOW) - Duration::minutes(i + 1));
    }
    let settings = settings_with(
        EXPIRE_PASSES_JOB,
        JobSettings {
            chunk_size: Some(2),
            ..JobSettings::default()
        },
    );
    let ctx = JobContext::new(tmp.db.clone(), settings);
    let result = run(&ctx, EXPIRE_PASSES_JOB, at_now());
    assert_eq!(result.step("expirePassesStep").unwrap().counts.commits, 4);
    assert_eq!(tmp.count("SELECT COUNT(*) FROM pass WHERE status = 'EXPIRED'"), 7);
}

// --- usePassesJob ---

#[test]
fn test_use_passes() {
    let tmp = TempDb::new("use-passes");
    let conn = tmp.conn();
    let far = dt("2024-12-31 00:00");
    let limited = insert_pass(&conn, "PROGRESSED", Some(2), far);
    let exhausted = insert_pass(&conn, "PROGRESSED", Some(0), far);
    let unlimited = insert_pass(&conn, "PROGRESSED", None, far);

    let on = |pass_seq| NewBooking {
        pass_seq,
        ..NewBooking::default()
    };
    let l1 = insert_booking(&conn, on(limited));
    let l2 = insert_booking(&conn, on(limited));
    // Third use of a two-use pass: read, but the guarded decrement refuses it.
    let l3 = insert_booking(&conn, on(limited));
    let e1 = insert_booking(&conn, on(exhausted));
    let u1 = insert_booking(&conn, on(unlimited));
    let not_completed = insert_booking(
        &conn,
        NewBooking {
            status: "READY",
            ..on(unlimited)
        },
    );
    let not_ended = insert_booking(
        &conn,
        NewBooking {
            ended_at: dt(NOW) + Duration::minutes(30),
            ..on(unlimited)
        },
    );
    let already_used = insert_booking(
        &conn,
        NewBooking {
            used_pass: true,
            ..on(limited)
        },
    );

    let settings = settings_with(
        USE_PASSES_JOB,
        JobSettings {
            chunk_size: Some(2),
            workers: Some(3),
            ..JobSettings::default()
        },
    );
    let ctx = JobContext::new(tmp.db.clone(), settings);
    let result = run(&ctx, USE_PASSES_JOB, at_now());

    assert_eq!(result.status, BatchStatus::Completed);
    let counts = result.step("usePassesStep").unwrap().counts;
    assert_eq!(counts.read, 5);
    assert_eq!(counts.filtered, 1);
    assert_eq!(counts.written, 4);
    assert_eq!(counts.persisted, 3);
    assert_eq!(counts.commits, 3);

    assert_eq!(remaining(&tmp, limited), Some(0));
    assert_eq!(remaining(&tmp, exhausted), Some(0));
    assert_eq!(remaining(&tmp, unlimited), None);
    assert!(used(&tmp, l1));
    assert!(used(&tmp, l2));
    assert!(!used(&tmp, l3));
    assert!(!used(&tmp, e1));
    assert!(used(&tmp, u1));
    assert!(!used(&tmp, not_completed));
    assert!(!used(&tmp, not_ended));
    assert!(used(&tmp, already_used));
}

#[test]
fn test_use_passes_zero_workers_fails_build() {
    let tmp = TempDb::new("use-passes-workers");
    let settings = settings_with(
        USE_PASSES_JOB,
        JobSettings {
            workers: Some(0),
            ..JobSettings::default()
        },
    );
    let ctx = JobContext::new(tmp.db.clone(), settings);
    assert!(default_registry().launch(&ctx, USE_PASSES_JOB, &at_now()).is_err());
}

// --- addPassesJob ---

#[test]
fn test_add_passes_from_bulk_passes() {
    let tmp = TempDb::new("add-passes");
    let conn = tmp.conn();
    for (group, user) in [("G1", "a"), ("G1", "b"), ("G1", "c"), ("G2", "d")] {
        conn.execute(
            "INSERT INTO user_group_mapping (user_group_id, user_id) VALUES (?1, ?2)",
            params![group, user],
        )
        .unwrap();
    }
    let now = dt(NOW);
    let insert_bulk = |group: &str, status: &str, started_at: NaiveDateTime| {
        conn.execute(
            "INSERT INTO bulk_pass (package_seq, user_group_id, status, count, started_at, ended_at) \
             VALUES (7, ?1, ?2, 10, ?3, ?4)",
            params![group, status, started_at, started_at + Duration::days(30)],
        )
        .unwrap();
        conn.last_insert_rowid()
    };
    let fresh = insert_bulk("G1", "READY", now - Duration::hours(2));
    let stale = insert_bulk("G2", "READY", now - Duration::days(3));
    let done = insert_bulk("G1", "COMPLETED", now - Duration::hours(1));

    let ctx = JobContext::new(tmp.db.clone(), Settings::default());
    let result = run(&ctx, ADD_PASSES_JOB, at_now());

    assert_eq!(result.status, BatchStatus::Completed);
    let counts = result.step("addPassesStep").unwrap().counts;
    assert_eq!(counts.read, 1);
    assert_eq!(counts.written, 3);
    assert_eq!(tmp.count("SELECT COUNT(*) FROM pass"), 3);
    assert_eq!(
        tmp.count(
            "SELECT COUNT(*) FROM pass WHERE package_seq = 7 AND status = 'READY' \
             AND remaining_count = 10 AND user_id IN ('a', 'b', 'c')"
        ),
        3
    );
    let status = |seq: i64| -> String {
        tmp.conn()
            .query_row(
                "SELECT status FROM bulk_pass WHERE bulk_pass_seq = ?1",
                [seq],
                |row| row.get(0),
            )
            .unwrap()
    };
    assert_eq!(status(fresh), "COMPLETED");
    assert_eq!(status(stale), "READY");
    assert_eq!(status(done), "COMPLETED");

    // Completed bulk passes are not granted twice.
    let again = run(&ctx, ADD_PASSES_JOB, at_now());
    assert_eq!(again.step("addPassesStep").unwrap().counts.written, 0);
    assert_eq!(tmp.count("SELECT COUNT(*) FROM pass"), 3);
}

// --- sendNotificationBeforeClassJob ---

/// Records deliveries; refuses one uuid.
struct RecordingNotifier {
    refuse: String,
    delivered: Mutex<Vec<(String, String)>>,
}

impl Notifier for RecordingNotifier {
    fn deliver(&self, uuid: &str, text: &str) -> bool {
        if uuid == self.refuse {
            return false;
        }
        self.delivered
            .lock()
            .unwrap()
            .push((uuid.to_string(), text.to_string()));
        true
    }
}

#[test]
fn test_send_notifications_before_class() {
    let tmp = TempDb::new("notify");
    let conn = tmp.conn();
    insert_user(&conn, "u1", Some("uuid-1"));
    insert_user(&conn, "u2", Some("uuid-2"));
    insert_user(&conn, "u3", None);
    let now = dt(NOW);
    let upcoming = |user_id: &'static str, status: &'static str, minutes: i64| NewBooking {
        user_id,
        status,
        started_at: now + Duration::minutes(minutes),
        ended_at: now + Duration::minutes(minutes + 60),
        ..NewBooking::default()
    };
    insert_booking(&conn, upcoming("u1", "READY", 5));
    // Window end is inclusive.
    insert_booking(&conn, upcoming("u2", "READY", 10));
    // No messaging id.
    insert_booking(&conn, upcoming("u3", "READY", 5));
    insert_booking(&conn, upcoming("u1", "READY", 30));
    insert_booking(&conn, upcoming("u1", "READY", 0));
    insert_booking(&conn, upcoming("u1", "READY", -5));
    insert_booking(&conn, upcoming("u1", "CANCELLED", 5));

    let notifier = Arc::new(RecordingNotifier {
        refuse: "uuid-2".to_string(),
        delivered: Mutex::new(Vec::new()),
    });
    let settings = settings_with(
        SEND_NOTIFICATION_JOB,
        JobSettings {
            chunk_size: Some(1),
            page_size: Some(2),
            workers: Some(2),
            skip_limit: None,
        },
    );
    let ctx = JobContext::new(tmp.db.clone(), settings).with_notifier(notifier.clone());
    let result = run(&ctx, SEND_NOTIFICATION_JOB, at_now());

    assert_eq!(result.status, BatchStatus::Completed);
    let add = result.step("addNotificationStep").unwrap().counts;
    assert_eq!(add.read, 3);
    assert_eq!(add.filtered, 1);
    assert_eq!(add.written, 2);
    let send = result.step("sendNotificationStep").unwrap().counts;
    assert_eq!(send.read, 2);
    assert_eq!(send.written, 2);
    assert_eq!(send.persisted, 1);

    let delivered = notifier.delivered.lock().unwrap().clone();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, "uuid-1");
    assert!(delivered[0].1.contains("2024-03-01 10:05"), "{}", delivered[0].1);

    assert_eq!(tmp.count("SELECT COUNT(*) FROM notification"), 2);
    assert_eq!(
        tmp.count("SELECT COUNT(*) FROM notification WHERE sent = 1 AND sent_at IS NOT NULL"),
        1
    );
    assert_eq!(
        tmp.count("SELECT COUNT(*) FROM notification WHERE sent = 0 AND uuid = 'uuid-2'"),
        1
    );
}

#[test]
fn test_send_step_delivers_each_pending_notification_once() {
    let tmp = TempDb::new("notify-many");
    let conn = tmp.conn();
    for i in 0..40 {
        conn.execute(
            "INSERT INTO notification (uuid, event, text) VALUES (?1, 'BEFORE_CLASS', 'hi')",
            [format!("uuid-{i}")],
        )
        .unwrap();
    }
    let notifier = Arc::new(RecordingNotifier {
        refuse: String::new(),
        delivered: Mutex::new(Vec::new()),
    });
    let settings = settings_with(
        SEND_NOTIFICATION_JOB,
        JobSettings {
            chunk_size: Some(3),
            workers: Some(4),
            ..JobSettings::default()
        },
    );
    let ctx = JobContext::new(tmp.db.clone(), settings).with_notifier(notifier.clone());
    // Nothing is upcoming at this `now`; only the queued notifications go out.
    let result = run(&ctx, SEND_NOTIFICATION_JOB, at_now());

    assert_eq!(result.status, BatchStatus::Completed);
    assert_eq!(result.step("addNotificationStep").unwrap().counts.read, 0);
    assert_eq!(result.step("sendNotificationStep").unwrap().counts.persisted, 40);
    let mut uuids: Vec<String> = notifier
        .delivered
        .lock()
        .unwrap()
        .iter()
        .map(|(u, _)| u.clone())
        .collect();
    uuids.sort();
    uuids.dedup();
    assert_eq!(uuids.len(), 40);
    assert_eq!(tmp.count("SELECT COUNT(*) FROM notification WHERE sent = 0"), 0);
}

// --- makeStatisticsJob ---

fn seed_statistics_bookings(tmp: &TempDb) {
    let conn = tmp.conn();
    let finished = |status: &'static str, attended: bool, ended_at: &str| NewBooking {
        status,
        attended,
        ended_at: dt(ended_at),
        started_at: dt(ended_at) - Duration::hours(1),
        ..NewBooking::default()
    };
    // Monday 2024-03-04 is split across chunks of two.
    insert_booking(&conn, finished("COMPLETED", true, "2024-03-04 10:00"));
    insert_booking(&conn, finished("COMPLETED", false, "2024-03-05 09:00"));
    insert_booking(&conn, finished("CANCELLED", false, "2024-03-04 12:00"));
    insert_booking(&conn, finished("COMPLETED", true, "2024-03-11 10:00"));
    insert_booking(&conn, finished("COMPLETED", true, "2024-03-20 10:00"));
}

#[test]
fn test_make_statistics_writes_daily_and_weekly_reports() {
    let tmp = TempDb::new("statistics");
    seed_statistics_bookings(&tmp);
    let report_dir = tmp.dir().join("reports");
    let settings = settings_with(
        MAKE_STATISTICS_JOB,
        JobSettings {
            chunk_size: Some(2),
            ..JobSettings::default()
        },
    );
    let ctx = JobContext::new(tmp.db.clone(), settings)
        .with_reports(Arc::new(CsvReportWriter::new(&report_dir)));
    let params = JobParams::new()
        .with("from", "2024-03-04")
        .with("to", "2024-03-12");
    let result = run(&ctx, MAKE_STATISTICS_JOB, params);

    assert_eq!(result.status, BatchStatus::Completed);
    let add = result.step("addStatisticsStep").unwrap().counts;
    assert_eq!(add.read, 4);
    assert_eq!(add.commits, 2);
    // One row per day per chunk.
    assert_eq!(add.persisted, 4);
    assert_eq!(tmp.count("SELECT COUNT(*) FROM statistics"), 4);

    let daily = std::fs::read_to_string(report_dir.join("daily_statistics_20240304.csv")).unwrap();
    assert_eq!(
        daily.lines().collect::<Vec<_>>(),
        vec![
            "statistics_at,all_count,attended_count,cancelled_count",
            "2024-03-04,2,1,1",
            "2024-03-05,1,0,0",
            "2024-03-11,1,1,0",
        ]
    );
    let weekly =
        std::fs::read_to_string(report_dir.join("weekly_statistics_20240304.csv")).unwrap();
    assert_eq!(
        weekly.lines().collect::<Vec<_>>(),
        vec![
            "statistics_at,all_count,attended_count,cancelled_count",
            "2024-03-04,3,1,1",
            "2024-03-11,1,1,0",
        ]
    );
    assert_eq!(
        result.step("makeWeeklyStatisticsStep").unwrap().counts.written,
        2
    );
}

#[test]
fn test_aggregate_statistics_weekly_buckets_start_monday() {
    let tmp = TempDb::new("statistics-weekly");
    let conn = tmp.conn();
    // Sunday 03-10 belongs to the week of Monday 03-04.
    for (day, all) in [("2024-03-06", 2), ("2024-03-10", 3), ("2024-03-11", 4)] {
        conn.execute(
            "INSERT INTO statistics (statistics_at, all_count, attended_count, cancelled_count) \
             VALUES (?1, ?2, 0, 0)",
            params![dt(&format!("{day} 00:00")), all],
        )
        .unwrap();
    }
    let rows = aggregate_statistics(
        &tmp.db,
        dt("2024-03-01 12:00"),
        dt("2024-03-31 00:00"),
        Period::Weekly,
    )
    .unwrap();
    let got: Vec<(&str, i64)> = rows
        .iter()
        .map(|r| (r.statistics_at.as_str(), r.all_count))
        .collect();
    assert_eq!(got, vec![("2024-03-04", 5), ("2024-03-11", 4)]);
}

#[test]
fn test_make_statistics_rejects_bad_range() {
    let tmp = TempDb::new("statistics-range");
    let ctx = JobContext::new(tmp.db.clone(), Settings::default());
    let registry = default_registry();

    let reversed = JobParams::new()
        .with("from", "2024-03-10")
        .with("to", "2024-03-01");
    assert!(registry.launch(&ctx, MAKE_STATISTICS_JOB, &reversed).is_err());

    let missing = JobParams::new().with("from", "2024-03-01");
    let err = registry
        .launch(&ctx, MAKE_STATISTICS_JOB, &missing)
        .unwrap_err();
    assert!(format!("{err:#}").contains("'to'"), "{err:#}");
}

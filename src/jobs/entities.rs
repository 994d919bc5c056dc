//! Minimal row shapes the jobs read and write.

use chrono::NaiveDateTime;
use rusqlite::Row;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::Serialize;

/// Status enum stored as upper-case text.
macro_rules! sql_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                match value.as_str()? {
                    $($text => Ok($name::$variant),)+
                    other => Err(FromSqlError::Other(
                        format!("unknown {} '{}'", stringify!($name), other).into(),
                    )),
                }
            }
        }
    };
}

sql_enum!(PassStatus {
    Ready => "READY",
    Progressed => "PROGRESSED",
    Expired => "EXPIRED",
});

sql_enum!(BulkPassStatus {
    Ready => "READY",
    Completed => "COMPLETED",
});

sql_enum!(BookingStatus {
    Ready => "READY",
    Progressed => "PROGRESSED",
    Completed => "COMPLETED",
    Cancelled => "CANCELLED",
});

sql_enum!(NotificationEvent {
    BeforeClass => "BEFORE_CLASS",
});

#[derive(Clone, Debug, PartialEq)]
pub struct Pass {
    pub pass_seq: i64,
    pub status: PassStatus,
    pub ended_at: Option<NaiveDateTime>,
    pub expired_at: Option<NaiveDateTime>,
}

impl Pass {
    pub const COLUMNS: &'static str = "pass_seq, status, ended_at, expired_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            pass_seq: row.get("pass_seq")?,
            status: row.get("status")?,
            ended_at: row.get("ended_at")?,
            expired_at: row.get("expired_at")?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct BulkPass {
    pub bulk_pass_seq: i64,
    pub package_seq: i64,
    pub user_group_id: String,
    /// Uses granted per pass; None means unlimited.
    pub count: Option<i64>,
    pub started_at: NaiveDateTime,
    pub ended_at: Option<NaiveDateTime>,
}

impl BulkPass {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            bulk_pass_seq: row.get("bulk_pass_seq")?,
            package_seq: row.get("package_seq")?,
            user_group_id: row.get("user_group_id")?,
            count: row.get("count")?,
            started_at: row.get("started_at")?,
            ended_at: row.get("ended_at")?,
        })
    }
}

/// A finished booking joined to the pass it consumes.
#[derive(Clone, Debug)]
pub struct BookingPass {
    pub booking_seq: i64,
    pub pass_seq: i64,
    pub remaining_count: Option<i64>,
}

impl BookingPass {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            booking_seq: row.get("booking_seq")?,
            pass_seq: row.get("pass_seq")?,
            remaining_count: row.get("remaining_count")?,
        })
    }
}

/// An upcoming booking joined to the booking user's messaging id.
#[derive(Clone, Debug)]
pub struct UpcomingBooking {
    pub booking_seq: i64,
    pub uuid: Option<String>,
    pub started_at: NaiveDateTime,
}

impl UpcomingBooking {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            booking_seq: row.get("booking_seq")?,
            uuid: row.get("uuid")?,
            started_at: row.get("started_at")?,
        })
    }
}

/// Booking fields the statistics aggregate over.
#[derive(Clone, Debug)]
pub struct FinishedBooking {
    pub booking_seq: i64,
    pub status: BookingStatus,
    pub attended: bool,
    pub ended_at: NaiveDateTime,
}

impl FinishedBooking {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            booking_seq: row.get("booking_seq")?,
            status: row.get("status")?,
            attended: row.get("attended")?,
            ended_at: row.get("ended_at")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub notification_seq: i64,
    pub uuid: String,
    pub event: NotificationEvent,
    pub text: String,
}

impl Notification {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            notification_seq: row.get("notification_seq")?,
            uuid: row.get("uuid")?,
            event: row.get("event")?,
            text: row.get("text")?,
        })
    }
}

/// A notification not yet inserted.
#[derive(Clone, Debug, PartialEq)]
pub struct NotificationDraft {
    pub uuid: String,
    pub event: NotificationEvent,
    pub text: String,
}

/// One aggregated statistics row, as written to reports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatisticsRow {
    pub statistics_at: String,
    pub all_count: i64,
    pub attended_count: i64,
    pub cancelled_count: i64,
}

impl StatisticsRow {
    pub const HEADER: [&'static str; 4] = [
        "statistics_at",
        "all_count",
        "attended_count",
        "cancelled_count",
    ];

    pub fn to_record(&self) -> Vec<String> {
        vec![
            self.statistics_at.clone(),
            self.all_count.to_string(),
            self.attended_count.to_string(),
            self.cancelled_count.to_string(),
        ]
    }
}

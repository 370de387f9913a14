//! Ticket sources: `fetch_tickets(system, since_days)`.
//!
//! Every source filters by system and opening date, rejects duplicate ids and
//! returns tickets sorted by id.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::error::SourceError;
use crate::model::Ticket;

pub trait TicketSource: Send + Sync {
    fn fetch_tickets(&self, system: &str, since_days: u32) -> Result<Vec<Ticket>, SourceError>;
}

/// Parse an opening timestamp. Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`,
/// `YYYY-MM-DD` and `DD/MM/YYYY`; naive values are taken as UTC.
pub fn parse_opened_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(t.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return d.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
        }
    }
    None
}

/// Sort by id, reject duplicates, keep only `system` inside the window.
fn finalize(
    tickets: Vec<Ticket>,
    system: &str,
    since_days: u32,
    now: DateTime<Utc>,
) -> Result<Vec<Ticket>, SourceError> {
    let cutoff = now - Duration::days(since_days as i64);
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for ticket in tickets {
        if ticket.system != system || ticket.opened_at < cutoff || ticket.opened_at > now {
            continue;
        }
        if !seen.insert(ticket.id.clone()) {
            return Err(SourceError::DuplicateId(ticket.id));
        }
        out.push(ticket);
    }
    out.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(out)
}

#[derive(Debug, Deserialize)]
struct RawTicket {
    id: String,
    system: String,
    requester: String,
    #[serde(default)]
    requester_email: Option<String>,
    service: String,
    #[serde(default)]
    subarea: Option<String>,
    status: String,
    opened_at: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
}

impl RawTicket {
    fn into_ticket(self) -> Result<Ticket, SourceError> {
        let opened_at = parse_opened_at(&self.opened_at).ok_or_else(|| {
            SourceError::Parse(format!(
                "ticket {}: unrecognized opened_at {:?}",
                self.id, self.opened_at
            ))
        })?;
        Ok(Ticket {
            id: self.id,
            system: self.system,
            requester: self.requester,
            requester_email: self.requester_email.filter(|e| !e.trim().is_empty()),
            service: self.service,
            subarea: self.subarea.filter(|s| !s.trim().is_empty()),
            status: self.status,
            opened_at,
            title: self.title,
            description: self.description,
        })
    }
}

/// Parse a JSON array of tickets.
pub fn parse_tickets_json(json: &str) -> Result<Vec<Ticket>, SourceError> {
    let raw: Vec<RawTicket> =
        serde_json::from_str(json).map_err(|e| SourceError::Parse(e.to_string()))?;
    raw.into_iter().map(RawTicket::into_ticket).collect()
}

/// Tickets from a JSON file (an array of ticket objects).
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
    now: Option<DateTime<Utc>>,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            now: None,
        }
    }

    /// Fix the reference time of the window (defaults to the wall clock).
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every ticket in the file, unfiltered.
    pub fn read_all(&self) -> Result<Vec<Ticket>, SourceError> {
        let json = std::fs::read_to_string(&self.path).map_err(|source| SourceError::Io {
            path: self.path.clone(),
            source,
        })?;
        parse_tickets_json(&json)
    }
}

impl TicketSource for JsonFileSource {
    fn fetch_tickets(&self, system: &str, since_days: u32) -> Result<Vec<Ticket>, SourceError> {
        let now = self.now.unwrap_or_else(Utc::now);
        finalize(self.read_all()?, system, since_days, now)
    }
}

#[cfg(feature = "cache")]
pub use self::sqlite::SqliteTicketSource;

#[cfg(feature = "cache")]
mod sqlite {
    use std::sync::Mutex;

    use chrono::{DateTime, Utc};
    use rusqlite::{params, Connection, OpenFlags};

    use super::{finalize, parse_opened_at, TicketSource};
    use crate::error::SourceError;
    use crate::model::Ticket;

    /// Tickets from a SQLite table of versioned documents:
    ///
    /// `tickets(document_id, version, system, requester, requester_email,
    /// service, subarea, status, opened_at, title, description)`
    ///
    /// Only the latest version of each document is read. The document id is
    /// the ticket id.
    pub struct SqliteTicketSource {
        conn: Mutex<Connection>,
        now: Option<DateTime<Utc>>,
    }

    impl SqliteTicketSource {
        pub fn open(path: &str) -> Result<Self, SourceError> {
            let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
            Ok(Self::from_connection(conn))
        }

        pub fn from_connection(conn: Connection) -> Self {
            Self {
                conn: Mutex::new(conn),
                now: None,
            }
        }

        pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
            self.now = Some(now);
            self
        }
    }

    impl TicketSource for SqliteTicketSource {
        fn fetch_tickets(
            &self,
            system: &str,
            since_days: u32,
        ) -> Result<Vec<Ticket>, SourceError> {
            let conn = self
                .conn
                .lock()
                .map_err(|_| SourceError::Parse("connection lock poisoned".into()))?;
            let mut stmt = conn.prepare(
                "SELECT t.document_id, t.system, t.requester, t.requester_email, t.service,
                        t.subarea, t.status, t.opened_at, t.title, t.description
                 FROM tickets t
                 JOIN (SELECT document_id, MAX(version) AS version
                       FROM tickets GROUP BY document_id) latest
                   ON latest.document_id = t.document_id AND latest.version = t.version
                 WHERE t.system = ?1",
            )?;
            let rows = stmt.query_map(params![system], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                ))
            })?;

            let mut tickets = Vec::new();
            for row in rows {
                let (id, system, requester, email, service, subarea, status, opened, title, desc) =
                    row?;
                let opened_at = parse_opened_at(&opened).ok_or_else(|| {
                    SourceError::Parse(format!("ticket {id}: unrecognized opened_at {opened:?}"))
                })?;
                tickets.push(Ticket {
                    id,
                    system,
                    requester: requester.unwrap_or_default(),
                    requester_email: email.filter(|e| !e.trim().is_empty()),
                    service: service.unwrap_or_default(),
                    subarea: subarea.filter(|s| !s.trim().is_empty()),
                    status: status.unwrap_or_default(),
                    opened_at,
                    title: title.unwrap_or_default(),
                    description: desc.unwrap_or_default(),
                });
            }
            finalize(tickets, system, since_days, self.now.unwrap_or_else(Utc::now))
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};

    const FILE: &str = r#"[
        {"id": "b", "system": "ERP", "requester": "ana", "service": "Access",
         "status": "open", "opened_at": "2024-05-08T09:30:00Z", "title": "Login", "description": "x"},
        {"id": "a", "system": "ERP", "requester": "bob", "service": "Access", "subarea": "",
         "status": "open", "opened_at": "2024-05-09", "title": "Login", "description": "y"},
        {"id": "c", "system": "CRM", "requester": "eve", "service": "Sales",
         "status": "open", "opened_at": "2024-05-09", "title": "Quote", "description": "z"},
        {"id": "d", "system": "ERP", "requester": "eve", "service": "Access",
         "status": "open", "opened_at": "2024-01-01", "title": "Old", "description": "w"}
    ]"#;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap()
    }

    #[test]
    fn parse_opened_at_formats() {
        let t = parse_opened_at("2024-05-08T09:30:00-03:00").unwrap();
        assert_eq!(t.hour(), 12);
        assert_eq!(parse_opened_at("08/05/2024").unwrap().day(), 8);
        assert!(parse_opened_at("2024-05-08 09:30:00").is_some());
        assert!(parse_opened_at("yesterday").is_none());
    }

    #[test]
    fn json_source_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tickets.json");
        std::fs::write(&path, FILE).unwrap();
        let tickets = JsonFileSource::new(&path)
            .with_now(now())
            .fetch_tickets("ERP", 30)
            .unwrap();
        let ids: Vec<&str> = tickets.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(tickets[0].subarea, None);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let tickets = parse_tickets_json(FILE).unwrap();
        let mut doubled = tickets.clone();
        doubled.extend(tickets);
        assert!(matches!(
            finalize(doubled, "ERP", 365, now()),
            Err(SourceError::DuplicateId(_))
        ));
    }

    #[test]
    fn bad_timestamp_is_a_parse_error() {
        let json = r#"[{"id": "a", "system": "ERP", "requester": "r", "service": "s",
                        "status": "open", "opened_at": "soon"}]"#;
        assert!(matches!(parse_tickets_json(json), Err(SourceError::Parse(_))));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = JsonFileSource::new("/nonexistent/tickets.json").fetch_tickets("ERP", 30);
        assert!(matches!(err, Err(SourceError::Io { .. })));
    }
}

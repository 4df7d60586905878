//! Requests repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::error::Result;
use crate::models::{LoggedRequest, NewRequest};

/// Separator between serialized header lines.
pub const HEADER_SEPARATOR: &str = "\n";

const SELECT_COLUMNS: &str = "SELECT id, from_ip, method, host, url, headers, created_at FROM requests";

/// Repository for request log operations.
pub struct RequestsRepo;

impl RequestsRepo {
    /// Insert a new request row.
    ///
    /// Pass a transaction to make the insert part of a larger atomic unit.
    pub fn insert(conn: &Connection, request: &NewRequest) -> Result<i64> {
        conn.execute(
            "INSERT INTO requests (from_ip, method, host, url, headers)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                request.source_ip,
                request.method,
                request.host,
                request.url,
                request.headers,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Get a request by ID.
    pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<LoggedRequest>> {
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
        let request = stmt.query_row([id], map_row).ok();
        Ok(request)
    }

    /// Get recent requests, newest first.
    pub fn get_recent(conn: &Connection, limit: i64, offset: i64) -> Result<Vec<LoggedRequest>> {
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} ORDER BY id DESC LIMIT ?1 OFFSET ?2"
        ))?;

        let requests = stmt
            .query_map([limit, offset], map_row)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(requests)
    }

    /// Count logged requests.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM requests", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<LoggedRequest> {
    Ok(LoggedRequest {
        id: row.get(0)?,
        source_ip: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        method: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        host: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        url: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        headers: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        created_at: parse_datetime(&row.get::<_, String>(6)?),
    })
}

/// Serialize headers as `name: value` lines with lowercased names.
///
/// Lines keep the order the iterator yields them in. Values that are not
/// valid UTF-8 are converted lossily.
pub fn serialize_headers<I, N, V>(headers: I) -> String
where
    I: IntoIterator<Item = (N, V)>,
    N: AsRef<str>,
    V: AsRef<[u8]>,
{
    headers
        .into_iter()
        .map(|(name, value)| {
            format!(
                "{}: {}",
                name.as_ref().to_ascii_lowercase(),
                String::from_utf8_lossy(value.as_ref())
            )
        })
        .collect::<Vec<_>>()
        .join(HEADER_SEPARATOR)
}

/// Parse a datetime from SQLite format.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|dt| dt.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::run_migrations;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn sample(url: &str) -> NewRequest {
        NewRequest {
            source_ip: "10.0.0.7".to_string(),
            method: "GET".to_string(),
            host: "example.com".to_string(),
            url: url.to_string(),
            headers: "accept: */*".to_string(),
        }
    }

    #[test]
    fn test_insert_and_get_request() {
        let conn = setup_db();

        let id = RequestsRepo::insert(&conn, &sample("/secret")).unwrap();
        let row = RequestsRepo::get_by_id(&conn, id).unwrap().unwrap();

        assert_eq!(row.id, id);
        assert_eq!(row.source_ip, "10.0.0.7");
        assert_eq!(row.method, "GET");
        assert_eq!(row.host, "example.com");
        assert_eq!(row.url, "/secret");
        assert_eq!(row.headers, "accept: */*");
    }

    #[test]
    fn test_get_missing_request() {
        let conn = setup_db();
        assert!(RequestsRepo::get_by_id(&conn, 42).unwrap().is_none());
    }

    #[test]
    fn test_get_recent_newest_first() {
        let conn = setup_db();

        for i in 0..5 {
            RequestsRepo::insert(&conn, &sample(&format!("/{}", i))).unwrap();
        }

        let rows = RequestsRepo::get_recent(&conn, 3, 0).unwrap();
        let urls: Vec<_> = rows.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["/4", "/3", "/2"]);

        let rows = RequestsRepo::get_recent(&conn, 3, 3).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_count_requests() {
        let conn = setup_db();
        assert_eq!(RequestsRepo::count(&conn).unwrap(), 0);

        RequestsRepo::insert(&conn, &sample("/a")).unwrap();
        RequestsRepo::insert(&conn, &sample("/b")).unwrap();

        assert_eq!(RequestsRepo::count(&conn).unwrap(), 2);
    }

    #[test]
    fn test_serialize_headers_lowercases_names() {
        let headers = vec![
            ("Content-Type", "text/plain"),
            ("X-Trace", "abc"),
            ("X-Trace", "def"),
        ];

        assert_eq!(
            serialize_headers(headers),
            "content-type: text/plain\nx-trace: abc\nx-trace: def"
        );
    }

    #[test]
    fn test_serialize_headers_empty() {
        let headers: Vec<(&str, &[u8])> = Vec::new();
        assert_eq!(serialize_headers(headers), "");
    }

    #[test]
    fn test_serialize_headers_keeps_value_case() {
        let headers = vec![("Authorization", b"Bearer AbC".as_slice())];
        assert_eq!(serialize_headers(headers), "authorization: Bearer AbC");
    }

    #[test]
    fn test_parse_sqlite_datetime() {
        let dt = parse_datetime("2024-03-01 12:30:00");
        assert_eq!(dt.to_rfc3339(), "2024-03-01T12:30:00+00:00");
    }
}

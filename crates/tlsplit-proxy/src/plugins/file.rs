//! Appends every event to a file as a JSON record per line.
use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use tlsplit::{CommEvent, ConnEvent, Hook};

pub const FILE_PATH_ENV: &str = "FILE_PATH";

#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record<'a> {
    Comm {
        occurred_at: String,
        connection_id: &'a str,
        direction: &'a str,
        data: &'a str,
    },
    Conn {
        occurred_at: String,
        connection_id: &'a str,
        from: &'a str,
        to: &'a str,
        elapse: String,
    },
}

pub struct FileHook {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

impl FileHook {
    /// The file is opened on first use. Without an explicit path the
    /// `FILE_PATH` environment variable is consulted at that point.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    fn resolve_path(&self) -> anyhow::Result<PathBuf> {
        self.path
            .clone()
            .or_else(|| std::env::var_os(FILE_PATH_ENV).map(PathBuf::from))
            .filter(|path| !path.as_os_str().is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("missing path for file, use --file-path or set `{FILE_PATH_ENV}`")
            })
    }

    fn append(&self, record: &Record) -> anyhow::Result<()> {
        let mut record_text = serde_json::to_vec(record).context("serializing record")?;
        record_text.push(b'\n');

        let mut file = self.file.lock();
        if file.is_none() {
            let path = self.resolve_path()?;
            let opened = std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(&path)
                .with_context(|| format!("open log file {}", path.display()))?;
            *file = Some(opened);
        }
        if let Some(file) = file.as_mut() {
            file.write_all(&record_text).context("file append")?;
        }
        Ok(())
    }

    fn report(&self, result: anyhow::Result<()>) {
        if let Err(err) = result {
            tracing::error!("[{}] {err:#}", self.name());
        }
    }
}

fn timestamp(occurred_at: &DateTime<Utc>) -> String {
    occurred_at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl Hook for FileHook {
    fn name(&self) -> &str {
        "file"
    }

    fn after_comm(&self, event: &CommEvent) {
        self.report(self.append(&Record::Comm {
            occurred_at: timestamp(&event.occurred_at),
            connection_id: &event.conn_id,
            direction: event.direction.as_str(),
            data: &event.data,
        }));
    }

    fn after_conn(&self, event: &ConnEvent) {
        self.report(self.append(&Record::Conn {
            occurred_at: timestamp(&event.occurred_at),
            connection_id: &event.conn_id,
            from: &event.mail_from,
            to: &event.mail_to,
            elapse: event.elapse.to_string(),
        }));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use k9::assert_equal;
    use std::time::Duration;
    use tlsplit::{Direction, Elapse};

    fn occurred_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 3, 1, 10, 20, 30).unwrap()
    }

    #[test]
    fn writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let hook = FileHook::new(Some(path.clone()));

        let mut comm = CommEvent::new("01HTEST", b"EHLO mx.example.com\r\n", Direction::SrcToDst);
        comm.occurred_at = occurred_at();
        hook.after_comm(&comm);

        hook.after_conn(&ConnEvent {
            conn_id: "01HTEST".to_string(),
            occurred_at: occurred_at(),
            mail_from: "alice@example.com".to_string(),
            mail_to: "bob@example.net".to_string(),
            elapse: Elapse::Measured(Duration::from_millis(12)),
        });

        let content = std::fs::read_to_string(&path).unwrap();
        assert_equal!(
            content,
            concat!(
                r#"{"type":"comm","occurred_at":"2023-03-01T10:20:30Z","connection_id":"01HTEST","direction":"->","data":"EHLO mx.example.com\\r\\n"}"#,
                "\n",
                r#"{"type":"conn","occurred_at":"2023-03-01T10:20:30Z","connection_id":"01HTEST","from":"alice@example.com","to":"bob@example.net","elapse":"12 msec"}"#,
                "\n",
            )
        );
    }

    #[test]
    fn appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        std::fs::write(&path, "existing\n").unwrap();

        let hook = FileHook::new(Some(path.clone()));
        hook.after_comm(&CommEvent::new("id", b"hello", Direction::Proxy));

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("existing\n{\"type\":\"comm\""), "{content}");
        assert_equal!(content.lines().count(), 2);
    }

    #[test]
    fn unavailable_elapse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let hook = FileHook::new(Some(path.clone()));

        hook.after_conn(&ConnEvent {
            conn_id: "id".to_string(),
            occurred_at: occurred_at(),
            mail_from: "unknown".to_string(),
            mail_to: "unknown".to_string(),
            elapse: Elapse::DataNotStarted,
        });

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(r#""elapse":"unavailable""#), "{content}");
    }

    #[test]
    fn unopenable_path_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let hook = FileHook::new(Some(dir.path().join("missing").join("events.log")));
        // Reported through tracing; the event is dropped
        hook.after_comm(&CommEvent::new("id", b"hello", Direction::Proxy));
        assert!(hook.file.lock().is_none());
    }
}

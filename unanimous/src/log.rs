//! Durable snapshot log.
//!
//! The log is an append-only file of newline-terminated records:
//!
//! ```text
//! <table>\t<serialized table>
//! ```
//!
//! Each record is a full snapshot of one named table, so replay only needs
//! the last record per table. Maps serialize as `key@v1#v2!key2@...` and
//! lists as `v1#v2`; an empty table is an empty string.
//!
//! Appends are synced to stable storage before [`DurableLog::append`]
//! returns. A trailing line without a newline is a torn write and is ignored
//! on replay.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use error_stack::{Report, ResultExt};
use tracing::{trace, warn};

use crate::error::LogError;

/// A table keyed by artifact id whose values are sets of ids.
pub type MapTable = BTreeMap<String, BTreeSet<String>>;
/// A flat set of ids.
pub type ListTable = BTreeSet<String>;

/// A borrowed table about to be written.
#[derive(Debug, Clone, Copy)]
pub enum Snapshot<'a> {
    Map(&'a MapTable),
    List(&'a ListTable),
}

impl Snapshot<'_> {
    fn serialize(self) -> String {
        match self {
            Snapshot::Map(map) => serialize_map(map),
            Snapshot::List(list) => serialize_list(list),
        }
    }
}

#[must_use]
pub fn serialize_list(list: &ListTable) -> String {
    list.iter().map(String::as_str).collect::<Vec<_>>().join("#")
}

#[must_use]
pub fn parse_list(s: &str) -> ListTable {
    s.split('#')
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .collect()
}

#[must_use]
pub fn serialize_map(map: &MapTable) -> String {
    map.iter()
        .map(|(key, values)| format!("{key}@{}", serialize_list(values)))
        .collect::<Vec<_>>()
        .join("!")
}

#[must_use]
pub fn parse_map(s: &str) -> MapTable {
    s.split('!')
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('@') {
            Some((key, values)) => (key.to_owned(), parse_list(values)),
            None => (entry.to_owned(), ListTable::new()),
        })
        .collect()
}

/// Append-only writer for one process's log file.
#[derive(Debug)]
pub struct DurableLog {
    path: PathBuf,
    file: File,
}

impl DurableLog {
    /// Open (or create) the log for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Report<LogError>> {
        let path = path.as_ref().to_owned();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .change_context(LogError)
            .attach_with(|| format!("opening log file: {}", path.display()))?;
        Ok(Self { path, file })
    }

    /// Append a snapshot of `table` and sync it to disk.
    pub fn append(&mut self, table: &str, snapshot: Snapshot<'_>) -> Result<(), Report<LogError>> {
        let mut record = snapshot.serialize();
        record.insert(0, '\t');
        record.insert_str(0, table);
        record.push('\n');

        self.file
            .write_all(record.as_bytes())
            .and_then(|()| self.file.sync_data())
            .change_context(LogError)
            .attach_with(|| format!("appending {table} to {}", self.path.display()))?;
        trace!(table, bytes = record.len(), "log record synced");
        Ok(())
    }

    /// Read the last snapshot of each table in `tables`.
    ///
    /// A missing file replays as empty.
    pub fn replay(path: impl AsRef<Path>, tables: &[&str]) -> Result<Replay, Report<LogError>> {
        let path = path.as_ref();
        let contents = match std::fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => {
                return Err(Report::new(e)
                    .change_context(LogError)
                    .attach(format!("reading log file: {}", path.display())));
            }
        };

        let mut latest = HashMap::new();
        let mut lines = contents.split(|&b| b == b'\n');
        // The final element is either empty (file ended with a newline) or a
        // torn write.
        let complete = lines.clone().count().saturating_sub(1);

        for line in lines.by_ref().take(complete) {
            let Ok(line) = std::str::from_utf8(line) else {
                warn!(path = %path.display(), "skipping non UTF-8 log record");
                continue;
            };
            if line.is_empty() {
                continue;
            }
            let Some((table, value)) = line.split_once('\t') else {
                warn!(path = %path.display(), line, "skipping log record without table name");
                continue;
            };
            if !tables.contains(&table) {
                warn!(path = %path.display(), table, "skipping record for unknown table");
                continue;
            }
            latest.insert(table.to_owned(), value.to_owned());
        }

        if lines.next().is_some_and(|torn| !torn.is_empty()) {
            warn!(path = %path.display(), "ignoring torn final log record");
        }

        Ok(Replay { latest })
    }
}

/// Last snapshot seen for each table during replay.
#[derive(Debug, Default, Clone)]
pub struct Replay {
    latest: HashMap<String, String>,
}

impl Replay {
    #[must_use]
    pub fn map(&self, table: &str) -> MapTable {
        self.latest
            .get(table)
            .map(|s| parse_map(s))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn list(&self, table: &str) -> ListTable {
        self.latest
            .get(table)
            .map(|s| parse_list(s))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

//! Guardian notifications for absentees.
//!
//! Delivery is best-effort: a failed notification is logged and never fails
//! the attendance run that triggered it.

use crate::attendance::AttendanceRecord;
use crate::types::display_name;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification transport failed: {0}")]
    Transport(String),
    #[error("notification rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("guardian directory: {0}")]
    Directory(#[from] toml::de::Error),
    #[error("sms log: {0}")]
    Log(#[from] serde_json::Error),
}

/// Sends one message to one contact address (e.g., an SMS to a phone number).
pub trait Notifier: Send + Sync {
    fn notify(&self, address: &str, message: &str) -> Result<(), NotifyError>;
}

#[derive(Debug, Default, Deserialize)]
struct GuardianFile {
    #[serde(default)]
    guardians: BTreeMap<String, String>,
}

/// Identity → guardian contact address.
#[derive(Debug, Clone, Default)]
pub struct GuardianDirectory {
    contacts: BTreeMap<String, String>,
}

impl GuardianDirectory {
    /// Parse a `[guardians]` TOML table (`ann = "+15550100"`). Names are lowercased.
    pub fn from_toml_str(src: &str) -> Result<Self, NotifyError> {
        let file: GuardianFile = toml::from_str(src)?;
        Ok(file.guardians.into_iter().collect())
    }

    /// Load from a file; a missing file is an empty directory.
    pub fn load(path: &Path) -> Result<Self, NotifyError> {
        match std::fs::read_to_string(path) {
            Ok(src) => Self::from_toml_str(&src),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no guardian directory; absentee notifications disabled");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn contact(&self, identity: &str) -> Option<&str> {
        self.contacts.get(identity).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

impl FromIterator<(String, String)> for GuardianDirectory {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            contacts: iter
                .into_iter()
                .map(|(name, contact)| (name.trim().to_lowercase(), contact.trim().to_string()))
                .collect(),
        }
    }
}

pub fn absence_message(identity: &str, date: NaiveDate) -> String {
    format!(
        "Dear parent, your child {} was absent on {}.",
        display_name(identity),
        date.format("%Y-%m-%d")
    )
}

/// Notify the guardian of every absentee with a known contact.
///
/// Returns the display names whose notification was accepted.
pub fn notify_absentees(
    record: &AttendanceRecord,
    directory: &GuardianDirectory,
    notifier: &dyn Notifier,
    date: NaiveDate,
) -> Vec<String> {
    let mut notified = Vec::new();
    for identity in record.absentees() {
        let Some(address) = directory.contact(identity) else {
            continue;
        };
        match notifier.notify(address, &absence_message(identity, date)) {
            Ok(()) => {
                tracing::info!(%identity, "guardian notified");
                notified.push(display_name(identity));
            }
            Err(e) => tracing::warn!(%identity, error = %e, "guardian notification failed"),
        }
    }
    notified
}

/// Date → display names notified that day, persisted as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SmsLog {
    days: BTreeMap<String, Vec<String>>,
}

impl SmsLog {
    /// Load from a file; a missing file is an empty log.
    pub fn load(path: &Path) -> Result<Self, NotifyError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), NotifyError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Replace the list for `date` with `names`.
    pub fn record(&mut self, date: NaiveDate, names: Vec<String>) {
        self.days.insert(date.format("%Y-%m-%d").to_string(), names);
    }

    pub fn sent_on(&self, date: NaiveDate) -> &[String] {
        self.days
            .get(&date.format("%Y-%m-%d").to_string())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, String)>>,
        fail_for: Option<&'static str>,
    }

    impl Notifier for Recorder {
        fn notify(&self, address: &str, message: &str) -> Result<(), NotifyError> {
            if self.fail_for == Some(address) {
                return Err(NotifyError::Transport("gateway down".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((address.to_string(), message.to_string()));
            Ok(())
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()
    }

    fn directory() -> GuardianDirectory {
        GuardianDirectory::from_toml_str(
            r#"
            [guardians]
            Ali = "+7060293337"
            bob = "+919876543210"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_directory_lowercases_names() {
        let dir = directory();
        assert_eq!(dir.contact("ali"), Some("+7060293337"));
        assert_eq!(dir.len(), 2);
        assert!(GuardianDirectory::from_toml_str("").unwrap().is_empty());
    }

    #[test]
    fn test_directory_missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = GuardianDirectory::load(&tmp.path().join("guardians.toml")).unwrap();
        assert!(dir.is_empty());
    }

    #[test]
    fn test_absence_message() {
        assert_eq!(
            absence_message("ali", date()),
            "Dear parent, your child Ali was absent on 2024-03-05."
        );
    }

    #[test]
    fn test_only_absentees_with_contacts_are_notified() {
        let mut record = AttendanceRecord::all_absent(["ali", "bob", "carl"]);
        record.mark_present("bob");

        let recorder = Recorder::default();
        let notified = notify_absentees(&record, &directory(), &recorder, date());

        assert_eq!(notified, vec!["Ali".to_string()]);
        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "+7060293337");
    }

    #[test]
    fn test_failures_are_swallowed() {
        let record = AttendanceRecord::all_absent(["ali", "bob"]);
        let recorder = Recorder {
            fail_for: Some("+7060293337"),
            ..Recorder::default()
        };
        let notified = notify_absentees(&record, &directory(), &recorder, date());
        assert_eq!(notified, vec!["Bob".to_string()]);
    }

    #[test]
    fn test_sms_log_round_trip_overwrites_day() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sms_log.json");

        let mut log = SmsLog::load(&path).unwrap();
        log.record(date(), vec!["Ali".into(), "Bob".into()]);
        log.record(date(), vec!["Bob".into()]);
        log.save(&path).unwrap();

        let reloaded = SmsLog::load(&path).unwrap();
        assert_eq!(reloaded.sent_on(date()), &["Bob".to_string()]);
        assert!(reloaded.sent_on(NaiveDate::from_ymd_opt(2024, 3, 6).unwrap()).is_empty());

        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["2024-03-05"][0], "Bob");
    }
}

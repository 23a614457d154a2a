//! Side effects of a finished attendance run: guardian notifications, the
//! per-day SMS log, and CSV exports. Everything here blocks on I/O.

use crate::config::Config;
use chrono::NaiveDate;
use rollcall_core::attendance::AttendanceRecord;
use rollcall_core::export::{self, AttendanceSummary, ExportError};
use rollcall_core::notify::{self, GuardianDirectory, Notifier, SmsLog};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct Registrar {
    notifier: Arc<dyn Notifier>,
    guardians_path: PathBuf,
    sms_log_path: PathBuf,
    export_dir: PathBuf,
}

impl Registrar {
    pub fn new(config: &Config, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            guardians_path: config.guardians_path.clone(),
            sms_log_path: config.sms_log_path.clone(),
            export_dir: config.export_dir.clone(),
        }
    }

    /// Notify guardians of every absentee and replace `date`'s SMS log entry.
    ///
    /// Never fails: an unreadable guardian file or log is logged and skipped.
    pub fn notify_absentees(&self, record: &AttendanceRecord, date: NaiveDate) -> Vec<String> {
        // Re-read on every run so edits to the guardian file apply without a restart.
        let directory = match GuardianDirectory::load(&self.guardians_path) {
            Ok(directory) => directory,
            Err(e) => {
                tracing::warn!(path = %self.guardians_path.display(), error = %e, "cannot read guardian directory");
                GuardianDirectory::default()
            }
        };
        let sent = notify::notify_absentees(record, &directory, self.notifier.as_ref(), date);

        let mut log = match SmsLog::load(&self.sms_log_path) {
            Ok(log) => log,
            Err(e) => {
                tracing::warn!(path = %self.sms_log_path.display(), error = %e, "sms log unreadable; starting a new one");
                SmsLog::default()
            }
        };
        log.record(date, sent.clone());
        if let Err(e) = log.save(&self.sms_log_path) {
            tracing::warn!(path = %self.sms_log_path.display(), error = %e, "failed to write sms log");
        }

        tracing::info!(absent = record.absentees().count(), notified = sent.len(), "absentees processed");
        sent
    }

    /// Notify absentees, then write the day's CSV export.
    pub fn save(
        &self,
        record: &AttendanceRecord,
        date: NaiveDate,
    ) -> Result<(PathBuf, Vec<String>), ExportError> {
        let sent = self.notify_absentees(record, date);
        let path = export::write_csv(&self.export_dir, record, date)?;
        Ok((path, sent))
    }

    /// Counts from `date`'s export (zero when nothing was saved) and who was notified.
    pub fn summary(
        &self,
        date: NaiveDate,
    ) -> Result<(AttendanceSummary, Vec<String>), ExportError> {
        let counts = export::summarize_day(&self.export_dir, date)?.unwrap_or_default();
        let sent = match SmsLog::load(&self.sms_log_path) {
            Ok(log) => log.sent_on(date).to_vec(),
            Err(e) => {
                tracing::warn!(error = %e, "sms log unreadable");
                Vec::new()
            }
        };
        Ok((counts, sent))
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::notify::NotifyError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Outbox(Mutex<Vec<String>>);

    impl Notifier for Outbox {
        fn notify(&self, address: &str, _message: &str) -> Result<(), NotifyError> {
            self.0.lock().unwrap().push(address.to_string());
            Ok(())
        }
    }

    fn registrar(dir: &Path, outbox: Arc<Outbox>) -> Registrar {
        Registrar {
            notifier: outbox,
            guardians_path: dir.join("guardians.toml"),
            sms_log_path: dir.join("sms_log.json"),
            export_dir: dir.join("exports"),
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, 2).unwrap()
    }

    #[test]
    fn test_save_notifies_logs_and_exports() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("guardians.toml"),
            "[guardians]\nann = \"+15550101\"\nbob = \"+15550102\"\n",
        )
        .unwrap();
        let outbox = Arc::new(Outbox::default());
        let registrar = registrar(tmp.path(), Arc::clone(&outbox));

        let mut record = AttendanceRecord::all_absent(["ann", "bob", "carl"]);
        record.mark_present("bob");

        let (path, sent) = registrar.save(&record, date()).unwrap();
        assert_eq!(sent, vec!["Ann".to_string()]);
        assert_eq!(*outbox.0.lock().unwrap(), vec!["+15550101".to_string()]);
        assert!(path.starts_with(registrar.export_dir()));

        let (counts, logged) = registrar.summary(date()).unwrap();
        assert_eq!(counts, AttendanceSummary { present: 1, absent: 2 });
        assert_eq!(logged, vec!["Ann".to_string()]);
    }

    #[test]
    fn test_missing_guardian_file_notifies_nobody() {
        let tmp = tempfile::tempdir().unwrap();
        let outbox = Arc::new(Outbox::default());
        let registrar = registrar(tmp.path(), Arc::clone(&outbox));

        let sent = registrar.notify_absentees(&AttendanceRecord::all_absent(["ann"]), date());
        assert!(sent.is_empty());
        assert!(outbox.0.lock().unwrap().is_empty());
        // The day is still logged, with nobody notified.
        assert!(tmp.path().join("sms_log.json").is_file());
    }

    #[test]
    fn test_summary_before_any_save() {
        let tmp = tempfile::tempdir().unwrap();
        let registrar = registrar(tmp.path(), Arc::new(Outbox::default()));
        let (counts, sent) = registrar.summary(date()).unwrap();
        assert_eq!(counts, AttendanceSummary::default());
        assert!(sent.is_empty());
    }
}

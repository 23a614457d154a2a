use crate::engine::{EngineError, EngineHandle};
use crate::registrar::Registrar;
use rollcall_core::attendance::{AttendanceRecord, ResolveError, Status};
use rollcall_core::normalize::NormalizeError;
use rollcall_core::roster::{RosterError, RosterStore};
use rollcall_core::types::display_name;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use zbus::interface;

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    engine: EngineHandle,
    store: RosterStore,
    registrar: Arc<Registrar>,
    tolerance: f32,
    sms_gateway: bool,
}

impl AttendanceService {
    pub fn new(
        engine: EngineHandle,
        store: RosterStore,
        registrar: Registrar,
        tolerance: f32,
        sms_gateway: bool,
    ) -> Self {
        Self {
            engine,
            store,
            registrar: Arc::new(registrar),
            tolerance,
            sms_gateway,
        }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Enroll a student from a photo file. Returns the stored identity.
    async fn enroll(&self, name: &str, photo_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, photo_path, "enroll requested");
        let photo = read_photo(photo_path).await?;
        let filename = Path::new(photo_path)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        let result = self
            .engine
            .enroll(name.to_string(), filename, photo)
            .await
            .map_err(to_fdo)?;
        tracing::info!(identity = %result.identity, upsert = ?result.upsert, "enroll complete");
        Ok(result.identity)
    }

    /// Remove a student and their stored photos.
    async fn remove(&self, name: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(name, "remove requested");
        self.engine.remove(name.to_string()).await.map_err(to_fdo)
    }

    /// Take attendance from a group photo and notify guardians of absentees.
    async fn take_attendance(&self, photo_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(photo_path, "take_attendance requested");
        let photo = read_photo(photo_path).await?;
        let record = self.engine.resolve(photo).await.map_err(to_fdo)?;

        let date = today();
        let registrar = Arc::clone(&self.registrar);
        let notify_record = record.clone();
        let sms_sent =
            tokio::task::spawn_blocking(move || registrar.notify_absentees(&notify_record, date))
                .await
                .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

        Ok(serde_json::json!({
            "date": date.to_string(),
            "attendance": statuses_json(&record),
            "sms_sent": sms_sent,
        })
        .to_string())
    }

    /// Save manually reviewed statuses (`{"ann": "Present", ...}`) as today's export.
    ///
    /// Students left out are Absent. Returns the CSV path.
    async fn save_attendance(&self, statuses_json: &str) -> zbus::fdo::Result<String> {
        let statuses = parse_statuses(statuses_json)?;
        let roster = self.engine.roster();
        let record = AttendanceRecord::from_manual(
            roster.iter().map(|e| e.identity.as_str()),
            statuses,
        );
        tracing::info!(students = record.len(), present = record.present_count(), "save_attendance requested");

        let date = today();
        let registrar = Arc::clone(&self.registrar);
        let (path, sms_sent) = tokio::task::spawn_blocking(move || registrar.save(&record, date))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

        tracing::info!(path = %path.display(), ?sms_sent, "attendance saved");
        Ok(path.to_string_lossy().into_owned())
    }

    /// List enrolled students with their display name and photo path.
    async fn list_students(&self) -> zbus::fdo::Result<String> {
        let roster = self.engine.roster();
        let store = self.store.clone();
        let students = tokio::task::spawn_blocking(move || {
            roster
                .iter()
                .map(|entry| {
                    serde_json::json!({
                        "identity": entry.identity,
                        "name": display_name(&entry.identity),
                        "image": store
                            .publish_image(&entry.identity)
                            .map(|p| p.to_string_lossy().into_owned()),
                    })
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

        Ok(serde_json::Value::Array(students).to_string())
    }

    /// Today's totals from the saved export and the guardians notified.
    async fn summary(&self) -> zbus::fdo::Result<String> {
        let total = self.engine.roster().len();
        let date = today();
        let registrar = Arc::clone(&self.registrar);
        let (counts, sms_sent) = tokio::task::spawn_blocking(move || registrar.summary(date))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

        Ok(serde_json::json!({
            "date": date.to_string(),
            "total_students": total,
            "present": counts.present,
            "absent": counts.absent,
            "sms_sent": sms_sent,
        })
        .to_string())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "students": self.engine.roster().len(),
            "roster_dir": self.store.dir().to_string_lossy(),
            "export_dir": self.registrar.export_dir().to_string_lossy(),
            "tolerance": self.tolerance,
            "sms_gateway": self.sms_gateway,
        })
        .to_string())
    }
}

fn today() -> chrono::NaiveDate {
    chrono::Local::now().date_naive()
}

async fn read_photo(path: &str) -> zbus::fdo::Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("cannot read {path}: {e}")))
}

fn statuses_json(record: &AttendanceRecord) -> serde_json::Value {
    record
        .iter()
        .map(|(identity, status)| (identity.to_string(), serde_json::json!(status.to_string())))
        .collect::<serde_json::Map<_, _>>()
        .into()
}

fn parse_statuses(json: &str) -> zbus::fdo::Result<Vec<(String, Status)>> {
    let raw: BTreeMap<String, String> = serde_json::from_str(json)
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("statuses must be a JSON object of strings: {e}")))?;
    raw.into_iter()
        .map(|(name, status)| {
            status
                .parse::<Status>()
                .map(|s| (name, s))
                .map_err(zbus::fdo::Error::InvalidArgs)
        })
        .collect()
}

/// User-correctable failures become `InvalidArgs`; everything else is `Failed`.
fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    let user_error = matches!(
        &err,
        EngineError::Roster(
            RosterError::UnsupportedFormat(_)
                | RosterError::InvalidIdentity(_)
                | RosterError::NoFaceDetected
                | RosterError::Normalize(NormalizeError::ImageDecode(_))
        ) | EngineError::Resolve(ResolveError::Normalize(NormalizeError::ImageDecode(_)))
    );
    if user_error {
        tracing::warn!(error = %err, "request rejected");
        zbus::fdo::Error::InvalidArgs(err.to_string())
    } else {
        tracing::error!(error = %err, "request failed");
        zbus::fdo::Error::Failed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_statuses() {
        let parsed = parse_statuses(r#"{"ann": "Present", "bob": "absent"}"#).unwrap();
        assert_eq!(
            parsed,
            vec![
                ("ann".to_string(), Status::Present),
                ("bob".to_string(), Status::Absent),
            ]
        );
        assert!(parse_statuses(r#"{"ann": "late"}"#).is_err());
        assert!(parse_statuses("[1, 2]").is_err());
    }

    #[test]
    fn test_statuses_json() {
        let mut record = AttendanceRecord::all_absent(["ann", "bob"]);
        record.mark_present("bob");
        assert_eq!(
            statuses_json(&record),
            serde_json::json!({"ann": "Absent", "bob": "Present"})
        );
    }

    #[test]
    fn test_error_mapping() {
        let rejected = to_fdo(EngineError::Roster(RosterError::NoFaceDetected));
        assert!(matches!(rejected, zbus::fdo::Error::InvalidArgs(_)));

        let failed = to_fdo(EngineError::ChannelClosed);
        assert!(matches!(failed, zbus::fdo::Error::Failed(_)));
    }

    #[tokio::test]
    async fn test_service_round_trip() {
        use crate::engine::tests::{png, start_in};

        let tmp = tempfile::tempdir().unwrap();
        let roster_dir = tmp.path().join("students_db");
        let engine = start_in(&roster_dir);
        let store = RosterStore::open(&roster_dir).unwrap();

        let mut config = crate::config::Config::from_env();
        config.guardians_path = tmp.path().join("guardians.toml");
        config.sms_log_path = tmp.path().join("sms_log.json");
        config.export_dir = tmp.path().join("exports");
        std::fs::write(&config.guardians_path, "[guardians]\nann = \"+15550101\"\n").unwrap();

        let registrar = Registrar::new(&config, Arc::new(crate::notifier::LogNotifier));
        let service = AttendanceService::new(engine, store, registrar, 0.6, false);

        let photo = tmp.path().join("Ann.PNG");
        std::fs::write(&photo, png([255, 0, 0])).unwrap();
        let identity = service.enroll("Ann", photo.to_str().unwrap()).await.unwrap();
        assert_eq!(identity, "ann");

        let group = tmp.path().join("group.png");
        std::fs::write(&group, png([0, 0, 255])).unwrap();
        let taken: serde_json::Value =
            serde_json::from_str(&service.take_attendance(group.to_str().unwrap()).await.unwrap())
                .unwrap();
        assert_eq!(taken["attendance"]["ann"], "Absent");
        assert_eq!(taken["sms_sent"], serde_json::json!(["Ann"]));

        let csv = service.save_attendance(r#"{"ann": "Present"}"#).await.unwrap();
        assert!(Path::new(&csv).is_file());

        let summary: serde_json::Value =
            serde_json::from_str(&service.summary().await.unwrap()).unwrap();
        assert_eq!(summary["total_students"], 1);
        assert_eq!(summary["present"], 1);

        let listed: serde_json::Value =
            serde_json::from_str(&service.list_students().await.unwrap()).unwrap();
        assert_eq!(listed[0]["name"], "Ann");

        assert!(service.remove("ann").await.unwrap());
        let err = service.enroll("ann", "/nonexistent/ann.png").await.unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));
    }
}

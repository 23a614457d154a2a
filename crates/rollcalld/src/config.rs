use rollcall_core::normalize::{DEFAULT_MAX_DIMENSION, ENROLL_MAX_DIMENSION};
use rollcall_core::types::DEFAULT_TOLERANCE;
use std::path::PathBuf;

/// Twilio REST credentials for outgoing SMS.
#[derive(Debug, Clone, PartialEq)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    /// Sender phone number.
    pub from: String,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// One photo per enrolled student.
    pub roster_dir: PathBuf,
    /// Optional directory that receives published copies of roster photos.
    pub publish_dir: Option<PathBuf>,
    /// Where `attendance_{date}.csv` exports are written.
    pub export_dir: PathBuf,
    /// JSON log of guardian notifications per day.
    pub sms_log_path: PathBuf,
    /// TOML file mapping students to guardian phone numbers.
    pub guardians_path: PathBuf,
    /// Euclidean distance at or below which a face matches a student.
    pub tolerance: f32,
    pub max_dimension: u32,
    pub enroll_max_dimension: u32,
    /// Convert non-RGB roster photos to RGB on disk while loading.
    pub rewrite_on_load: bool,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
    /// `None` when any credential is missing; notifications are then only logged.
    pub twilio: Option<TwilioConfig>,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let path_or = |key: &str, default: PathBuf| var(key).map(PathBuf::from).unwrap_or(default);

        let twilio = match (
            var("ROLLCALL_TWILIO_SID"),
            var("ROLLCALL_TWILIO_TOKEN"),
            var("ROLLCALL_TWILIO_FROM"),
        ) {
            (Some(account_sid), Some(auth_token), Some(from)) => Some(TwilioConfig {
                account_sid,
                auth_token,
                from,
            }),
            _ => None,
        };

        Self {
            model_dir: path_or("ROLLCALL_MODEL_DIR", data_dir.join("models")),
            roster_dir: path_or("ROLLCALL_ROSTER_DIR", data_dir.join("students_db")),
            publish_dir: var("ROLLCALL_PUBLISH_DIR").map(PathBuf::from),
            export_dir: path_or("ROLLCALL_EXPORT_DIR", data_dir.join("exports")),
            sms_log_path: path_or("ROLLCALL_SMS_LOG", data_dir.join("sms_log.json")),
            guardians_path: path_or("ROLLCALL_GUARDIANS", data_dir.join("guardians.toml")),
            tolerance: parse_or(var("ROLLCALL_TOLERANCE"), DEFAULT_TOLERANCE),
            max_dimension: parse_or(var("ROLLCALL_MAX_DIMENSION"), DEFAULT_MAX_DIMENSION),
            enroll_max_dimension: parse_or(
                var("ROLLCALL_ENROLL_MAX_DIMENSION"),
                ENROLL_MAX_DIMENSION,
            ),
            rewrite_on_load: var("ROLLCALL_REWRITE_ON_LOAD")
                .map(|v| v != "0")
                .unwrap_or(true),
            system_bus: var("ROLLCALL_SYSTEM_BUS")
                .map(|v| v == "1")
                .unwrap_or(false),
            twilio,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[("HOME", "/home/teacher")]);
        assert_eq!(
            cfg.roster_dir,
            PathBuf::from("/home/teacher/.local/share/rollcall/students_db")
        );
        assert_eq!(cfg.tolerance, DEFAULT_TOLERANCE);
        assert_eq!(cfg.max_dimension, 1600);
        assert_eq!(cfg.enroll_max_dimension, 1200);
        assert!(cfg.rewrite_on_load);
        assert!(!cfg.system_bus);
        assert!(cfg.publish_dir.is_none());
        assert!(cfg.twilio.is_none());
    }

    #[test]
    fn test_xdg_data_home() {
        let cfg = config(&[("XDG_DATA_HOME", "/data")]);
        assert_eq!(cfg.sms_log_path, PathBuf::from("/data/rollcall/sms_log.json"));
        assert_eq!(
            cfg.scrfd_model_path(),
            "/data/rollcall/models/det_10g.onnx"
        );
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("ROLLCALL_MODEL_DIR", "/opt/models"),
            ("ROLLCALL_TOLERANCE", "0.45"),
            ("ROLLCALL_MAX_DIMENSION", "800"),
            ("ROLLCALL_REWRITE_ON_LOAD", "0"),
            ("ROLLCALL_SYSTEM_BUS", "1"),
            ("ROLLCALL_PUBLISH_DIR", "/srv/www/static"),
        ]);
        assert_eq!(cfg.arcface_model_path(), "/opt/models/w600k_r50.onnx");
        assert!((cfg.tolerance - 0.45).abs() < 1e-6);
        assert_eq!(cfg.max_dimension, 800);
        assert!(!cfg.rewrite_on_load);
        assert!(cfg.system_bus);
        assert_eq!(cfg.publish_dir, Some(PathBuf::from("/srv/www/static")));
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let cfg = config(&[("ROLLCALL_TOLERANCE", "loose")]);
        assert_eq!(cfg.tolerance, DEFAULT_TOLERANCE);
    }

    #[test]
    fn test_twilio_requires_all_credentials() {
        let partial = config(&[("ROLLCALL_TWILIO_SID", "AC1"), ("ROLLCALL_TWILIO_TOKEN", "t")]);
        assert!(partial.twilio.is_none());

        let full = config(&[
            ("ROLLCALL_TWILIO_SID", "AC1"),
            ("ROLLCALL_TWILIO_TOKEN", "t"),
            ("ROLLCALL_TWILIO_FROM", "+15550100"),
        ]);
        assert_eq!(full.twilio.unwrap().from, "+15550100");
    }
}

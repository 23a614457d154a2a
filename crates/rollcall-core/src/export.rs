//! Daily attendance export (`attendance_{date}.csv`) and its summary.

use crate::attendance::{AttendanceRecord, Status};
use chrono::NaiveDate;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const HEADER: [&str; 3] = ["Name", "Date", "Status"];

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{path}: missing column {column:?}")]
    MissingColumn { path: PathBuf, column: &'static str },
}

/// Counts from one saved export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AttendanceSummary {
    pub present: usize,
    /// Every row whose status is not Present.
    pub absent: usize,
}

pub fn export_file_name(date: NaiveDate) -> String {
    format!("attendance_{}.csv", date.format("%Y-%m-%d"))
}

/// Write `record` to `dir/attendance_{date}.csv`, replacing any earlier export for that date.
pub fn write_csv(
    dir: &Path,
    record: &AttendanceRecord,
    date: NaiveDate,
) -> Result<PathBuf, ExportError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(export_file_name(date));
    let day = date.format("%Y-%m-%d").to_string();

    let mut out = String::new();
    push_row(&mut out, &HEADER);
    for (identity, status) in record.iter() {
        push_row(&mut out, &[identity, &day, &status.to_string()]);
    }
    std::fs::write(&path, out)?;

    tracing::info!(path = %path.display(), rows = record.len(), "attendance exported");
    Ok(path)
}

/// Count Present and non-Present rows of a saved export.
pub fn summarize(path: &Path) -> Result<AttendanceSummary, ExportError> {
    let text = std::fs::read_to_string(path)?;
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());

    let header = lines.next().map(split_row).unwrap_or_default();
    let Some(status_col) = header.iter().position(|h| h == "Status") else {
        return Err(ExportError::MissingColumn {
            path: path.to_path_buf(),
            column: "Status",
        });
    };

    let mut summary = AttendanceSummary::default();
    for line in lines {
        let fields = split_row(line);
        match fields.get(status_col).map(|s| s.parse::<Status>()) {
            Some(Ok(Status::Present)) => summary.present += 1,
            _ => summary.absent += 1,
        }
    }
    Ok(summary)
}

/// Summary of the export for `date`, or `None` when nothing was saved that day.
pub fn summarize_day(
    dir: &Path,
    date: NaiveDate,
) -> Result<Option<AttendanceSummary>, ExportError> {
    let path = dir.join(export_file_name(date));
    if !path.exists() {
        return Ok(None);
    }
    summarize(&path).map(Some)
}

fn push_row(out: &mut String, fields: &[&str]) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if field.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push_str("\r\n");
}

/// Split one CSV line, honouring double-quoted fields.
fn split_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', true) => quoted = false,
            ('"', false) if field.is_empty() => quoted = true,
            (',', false) => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()
    }

    #[test]
    fn test_write_csv_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let mut record = AttendanceRecord::all_absent(["bob", "ann"]);
        record.mark_present("ann");

        let path = write_csv(tmp.path(), &record, date()).unwrap();
        assert_eq!(path.file_name().unwrap(), "attendance_2024-03-05.csv");

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Name,Date,Status",
                "ann,2024-03-05,Present",
                "bob,2024-03-05,Absent",
            ]
        );
    }

    #[test]
    fn test_fields_are_quoted_when_needed() {
        let tmp = tempfile::tempdir().unwrap();
        let mut record = AttendanceRecord::all_absent(["smith, jo", "the \"kid\""]);
        record.mark_present("smith, jo");

        let path = write_csv(tmp.path(), &record, date()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"smith, jo\",2024-03-05,Present"));
        assert!(text.contains("\"the \"\"kid\"\"\",2024-03-05,Absent"));

        let summary = summarize(&path).unwrap();
        assert_eq!(summary, AttendanceSummary { present: 1, absent: 1 });
    }

    #[test]
    fn test_split_row() {
        assert_eq!(split_row("a,b,c"), vec!["a", "b", "c"]);
        assert_eq!(split_row("\"a,b\",\"x\"\"y\","), vec!["a,b", "x\"y", ""]);
    }

    #[test]
    fn test_summarize_counts_non_present_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.csv");
        std::fs::write(
            &path,
            "Name,Date,Status\nann,2024-03-05,Present\nbob,2024-03-05,Absent\ncarl,2024-03-05,Late\n",
        )
        .unwrap();

        let summary = summarize(&path).unwrap();
        assert_eq!(summary, AttendanceSummary { present: 1, absent: 2 });
    }

    #[test]
    fn test_summarize_requires_status_column() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("attendance.csv");
        std::fs::write(&path, "Name,Date\nann,2024-03-05\n").unwrap();
        assert!(matches!(
            summarize(&path),
            Err(ExportError::MissingColumn { column: "Status", .. })
        ));
    }

    #[test]
    fn test_summarize_day_without_export() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(summarize_day(tmp.path(), date()).unwrap(), None);

        let record = AttendanceRecord::all_absent(["ann"]);
        write_csv(tmp.path(), &record, date()).unwrap();
        assert_eq!(
            summarize_day(tmp.path(), date()).unwrap(),
            Some(AttendanceSummary { present: 0, absent: 1 })
        );
    }
}

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use market_core::MarketError;
use serde::Serialize;
use tracing::info;

/// One score row as exported to the pre-deletion CSV backup. Columns mirror
/// the source query so the data can be restored by hand if needed.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreBackupRow {
    pub forecast_id: String,
    pub user_id: String,
    pub variable: String,
    pub metric: String,
    pub value: f64,
    pub target_day: NaiveDate,
}

/// Write a timestamped score backup CSV. The backup is a hard prerequisite
/// for any destructive score deletion; failures abort the recompute.
pub fn write_scores_backup(
    dir: &Path,
    prefix: &str,
    start: NaiveDate,
    end: NaiveDate,
    rows: &[ScoreBackupRow],
) -> Result<PathBuf, MarketError> {
    std::fs::create_dir_all(dir).map_err(|e| MarketError::Backup(e.to_string()))?;
    let path = dir.join(format!("backup_{prefix}_{start}_{end}.csv"));

    let mut writer =
        csv::Writer::from_path(&path).map_err(|e| MarketError::Backup(e.to_string()))?;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|e| MarketError::Backup(e.to_string()))?;
    }
    writer
        .flush()
        .map_err(|e| MarketError::Backup(e.to_string()))?;

    info!(path = %path.display(), rows = rows.len(), "Score backup written");
    Ok(path)
}

/// Store the session-input snapshot: one JSON file keyed by session id with
/// the four dataset slots. Failures are reported, never fatal to the run.
pub fn store_session_snapshot(
    dir: &Path,
    session_id: i64,
    snapshot: &serde_json::Value,
) -> Result<PathBuf, MarketError> {
    let session_dir = dir.join(session_id.to_string());
    std::fs::create_dir_all(&session_dir).map_err(|e| MarketError::Backup(e.to_string()))?;
    let path = session_dir.join("session_datasets.json");

    let body =
        serde_json::to_vec_pretty(snapshot).map_err(|e| MarketError::Backup(e.to_string()))?;
    std::fs::write(&path, body).map_err(|e| MarketError::Backup(e.to_string()))?;

    info!(path = %path.display(), "Session datasets stored");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str, value: f64) -> ScoreBackupRow {
        ScoreBackupRow {
            forecast_id: id.to_string(),
            user_id: "u1".to_string(),
            variable: "q50".to_string(),
            metric: "rmse".to_string(),
            value,
            target_day: NaiveDate::from_ymd_opt(2024, 4, 2).unwrap(),
        }
    }

    #[test]
    fn backup_writes_one_line_per_row_plus_header() {
        let dir = tempfile::tempdir().unwrap();
        let start = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 4, 20).unwrap();
        let rows = vec![row("s1", 1.5), row("s2", 2.5)];

        let path = write_scores_backup(dir.path(), "sub_scores", start, end, &rows).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "backup_sub_scores_2024-04-01_2024-04-20.csv"
        );
        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("forecast_id"));
        assert!(lines[1].starts_with("s1,"));
    }

    #[test]
    fn snapshot_lands_under_the_session_directory() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = json!({
            "session_id": "42",
            "buyer_measurements": {},
            "sellers_forecasts": {},
            "challenges": [],
            "sellers_resources": [],
        });
        let path = store_session_snapshot(dir.path(), 42, &snapshot).unwrap();
        assert!(path.ends_with("42/session_datasets.json"));
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("buyer_measurements"));
    }
}

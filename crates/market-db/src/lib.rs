pub mod backup;
pub mod store;

pub use backup::{store_session_snapshot, ScoreBackupRow};
pub use store::{scoring_window_start, MarketDb, ScoreRow, SubmissionRow};

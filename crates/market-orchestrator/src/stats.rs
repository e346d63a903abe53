use std::collections::BTreeMap;

use market_core::Challenge;
use tracing::info;

/// Log a human-readable summary of the session's challenges and the
/// quantiles each forecaster submitted.
pub fn log_session_stats(session_id: i64, challenges: &[Challenge]) {
    info!(session_id, open_challenges = challenges.len(), "Session data:");
    for challenge in challenges {
        let mut forecasters: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for submission in &challenge.submission_list {
            forecasters
                .entry(submission.user.as_str())
                .or_default()
                .push(submission.variable.as_str());
        }
        info!(
            challenge = %challenge.id,
            use_case = %challenge.use_case,
            resource = %challenge.resource,
            period = %format!("{} - {}", challenge.start_datetime, challenge.end_datetime),
            submissions = ?forecasters,
            "Open challenge"
        );
    }
}

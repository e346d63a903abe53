pub mod orchestrator;
pub mod runner;
pub mod session;
pub mod stats;

pub use orchestrator::{month_window, MarketOrchestrator, ScoringOutcome, SessionInfo};
pub use runner::{forecast_buyer, BuyerOutput};
pub use session::{gate_closure_utc, SessionState};
pub use stats::log_session_stats;

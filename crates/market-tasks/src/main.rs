//! market-tasks: scheduled entry points for the collaborative forecasting
//! market.
//!
//! An external cron-like driver invokes one command per gate-closure cycle:
//!
//!   cargo run -p market-tasks -- open_session --gate_closure_hour=10
//!   cargo run -p market-tasks -- run_session
//!   cargo run -p market-tasks -- calculate_scores --update_scores=false
//!   cargo run -p market-tasks -- aggregate_scores --previous_month=true
//!   cargo run -p market-tasks -- aggregate_scores --year=2024 --month=11
//!
//! Exit codes: 0 on success; `calculate_scores` exits 1 when only some
//! challenges scored and 2 when all failed; `aggregate_scores` exits 1 on
//! failure.

use std::process::ExitCode;

use anyhow::{bail, Context};
use market_core::MarketError;
use market_orchestrator::{MarketOrchestrator, ScoringOutcome};
use tracing::{error, info, warn};

fn flag_value(args: &[String], name: &str) -> Option<String> {
    let prefix = format!("--{name}=");
    args.iter()
        .find_map(|a| a.strip_prefix(&prefix).map(str::to_string))
}

fn flag_bool(args: &[String], name: &str) -> Option<bool> {
    flag_value(args, name).map(|v| matches!(v.as_str(), "true" | "True" | "1"))
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "market_tasks=info,market_orchestrator=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().cloned() else {
        error!(
            "Usage: market-tasks <open_session|run_session|calculate_scores|\
             aggregate_scores> [flags]"
        );
        return ExitCode::from(1);
    };

    match command.as_str() {
        "open_session" => {
            let msg = "Opening session ...";
            info!("{msg}");
            match open_session(&args).await {
                Ok(()) => {
                    info!("{msg} Ok!");
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    error!(%err, "{msg} Failed!");
                    ExitCode::from(1)
                }
            }
        }
        "run_session" => {
            let msg = "Running session ...";
            info!("{msg}");
            match run_session().await {
                Ok(()) => {
                    info!("{msg} Ok!");
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    error!(%err, "{msg} Failed!");
                    ExitCode::from(1)
                }
            }
        }
        "calculate_scores" => {
            let msg = "Calculating forecasting skill scores ...";
            info!("{msg}");
            match calculate_scores(&args).await {
                Ok(ScoringOutcome::AllOk) => {
                    info!("{msg} Ok!");
                    ExitCode::SUCCESS
                }
                Ok(ScoringOutcome::Partial) => {
                    warn!("{msg} Failed for some!");
                    ExitCode::from(1)
                }
                Ok(ScoringOutcome::AllFailed) => {
                    error!("{msg} Failed!");
                    ExitCode::from(2)
                }
                Err(err) => {
                    error!(%err, "{msg} Failed!");
                    ExitCode::from(2)
                }
            }
        }
        "aggregate_scores" => {
            let msg = "Aggregating monthly forecasting skill scores ...";
            info!("{msg}");
            match aggregate_scores(&args).await {
                Ok(()) => {
                    info!("{msg} Ok!");
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    error!(%err, "{msg} Failed!");
                    ExitCode::from(1)
                }
            }
        }
        other => {
            error!("Unknown command '{other}'");
            ExitCode::from(1)
        }
    }
}

async fn connect() -> anyhow::Result<MarketOrchestrator> {
    MarketOrchestrator::connect()
        .await
        .context("failed to initialise market controller")
}

async fn open_session(args: &[String]) -> anyhow::Result<()> {
    let gate_closure_hour: u32 = match flag_value(args, "gate_closure_hour") {
        Some(v) => v
            .parse()
            .with_context(|| format!("invalid --gate_closure_hour value '{v}'"))?,
        None => 10,
    };
    if gate_closure_hour > 23 {
        bail!("gate_closure_hour must be between 0 and 23");
    }
    let force_new = flag_bool(args, "force_new").unwrap_or(false);

    let market = connect().await?;
    market.open_session(gate_closure_hour, force_new).await?;
    Ok(())
}

async fn run_session() -> anyhow::Result<()> {
    let market = connect().await?;

    // Stop bidding on the current open session first.
    if let Err(err) = market.close_session().await {
        error!(%err, "Failed to close the open session");
    }

    // Relay continuous forecasts before the market runs.
    if let Err(err) = market.prepare_continuous_submissions().await {
        error!(%err, "Failed to prepare continuous submissions");
    }

    let result = market.run_session(true).await;

    // Close out whatever is left running, then the latest session
    // regardless of status, so no session is ever left dangling.
    if let Err(err) = market.finish_session(true).await {
        error!(%err, "Failed to finish running session");
    }
    if let Err(err) = market.finish_session(false).await {
        error!(%err, "Failed to finish latest session");
    }

    match result {
        Ok(true) => Ok(()),
        Ok(false) => {
            warn!("No challenges to run; session closed without running the market.");
            Ok(())
        }
        Err(err @ MarketError::NoMarketSession(_)) => Err(err.into()),
        Err(err) => Err(err).context("failed to run market session pipeline"),
    }
}

async fn calculate_scores(args: &[String]) -> anyhow::Result<ScoringOutcome> {
    let update_scores = flag_bool(args, "update_scores")
        .context("calculate_scores requires --update_scores=<bool>")?;
    let market = connect().await?;
    Ok(market.calculate_scores(update_scores).await?)
}

async fn aggregate_scores(args: &[String]) -> anyhow::Result<()> {
    let previous_month = flag_bool(args, "previous_month").unwrap_or(false);
    let year: Option<i32> = match flag_value(args, "year") {
        Some(v) => Some(v.parse().with_context(|| format!("invalid --year '{v}'"))?),
        None => None,
    };
    let month: Option<u32> = match flag_value(args, "month") {
        Some(v) => Some(v.parse().with_context(|| format!("invalid --month '{v}'"))?),
        None => None,
    };

    let market = connect().await?;
    market
        .aggregate_scores(previous_month, year, month)
        .await?;
    Ok(())
}

use std::sync::Once;

use dashmap::DashMap;
use lazy_static::lazy_static;
use market_core::MarketError;
use tracing::debug;

use crate::strategy::{Strategy, StrategyParams};

pub type StrategyFactory = fn(&StrategyParams) -> Box<dyn Strategy>;

lazy_static! {
    static ref REGISTRY: DashMap<String, StrategyFactory> = DashMap::new();
}

static BUILTINS: Once = Once::new();

/// Register the four built-in strategies. Idempotent; the forecast engine
/// calls this on construction.
pub fn register_builtins() {
    let builtins: [(&str, StrategyFactory); 4] = [
        ("weighted_avg", crate::weighted_average::factory),
        ("arithmetic_mean", crate::arithmetic_mean::factory),
        ("best_forecaster", crate::best_forecaster::factory),
        ("median", crate::median::factory),
    ];
    BUILTINS.call_once(|| {
        for (name, factory) in builtins {
            if let Err(err) = register(name, factory) {
                debug!(%err, "builtin strategy already registered");
            }
        }
    });
}

/// Register a strategy factory under a unique name.
pub fn register(name: &str, factory: StrategyFactory) -> Result<(), MarketError> {
    if REGISTRY.contains_key(name) {
        return Err(MarketError::Validation(format!(
            "Strategy '{name}' is already registered. Use a different name or \
             unregister the existing strategy first."
        )));
    }
    REGISTRY.insert(name.to_string(), factory);
    Ok(())
}

/// Instantiate a registered strategy.
pub fn get(name: &str, params: &StrategyParams) -> Result<Box<dyn Strategy>, MarketError> {
    match REGISTRY.get(name) {
        Some(factory) => Ok(factory(params)),
        None => Err(MarketError::StrategyNotFound {
            name: name.to_string(),
            available: {
                let names = list();
                if names.is_empty() {
                    "none".to_string()
                } else {
                    names.join(", ")
                }
            },
        }),
    }
}

pub fn is_registered(name: &str) -> bool {
    REGISTRY.contains_key(name)
}

/// Registered strategy names, sorted for stable output.
pub fn list() -> Vec<String> {
    let mut names: Vec<String> = REGISTRY.iter().map(|e| e.key().clone()).collect();
    names.sort();
    names
}

pub fn unregister(name: &str) -> Result<(), MarketError> {
    match REGISTRY.remove(name) {
        Some(_) => Ok(()),
        None => Err(MarketError::Validation(format!(
            "Cannot unregister: strategy '{name}' not found."
        ))),
    }
}

/// Remove every registered strategy. Primarily useful for tests.
pub fn clear() {
    REGISTRY.clear();
}

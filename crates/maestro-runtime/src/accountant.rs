//! Cost accounting: rate table, per-turn updates, budget checks.

use chrono::Utc;
use maestro_core::{SessionId, SessionMetrics, TokenUsage, UserId};
use maestro_store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::RuntimeResult;

const MTOK: f64 = 1_000_000.0;

/// Per-model pricing in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRate {
    /// Input tokens.
    pub input_per_mtok: f64,
    /// Output tokens.
    pub output_per_mtok: f64,
    /// Cache-write tokens.
    pub cache_write_per_mtok: f64,
    /// Cache-read tokens.
    pub cache_read_per_mtok: f64,
}

impl ModelRate {
    /// Cost of one turn's usage at this rate.
    #[must_use]
    pub fn cost(&self, usage: TokenUsage) -> f64 {
        let tokens = |n: u64| n as f64 / MTOK;
        tokens(usage.input_tokens) * self.input_per_mtok
            + tokens(usage.output_tokens) * self.output_per_mtok
            + tokens(usage.cache_creation_tokens) * self.cache_write_per_mtok
            + tokens(usage.cache_read_tokens) * self.cache_read_per_mtok
    }
}

/// Versioned model → rate mapping. Unknown models use the fallback rate
/// so a new model never bills at zero.
#[derive(Debug, Clone)]
pub struct RateTable {
    /// Table version, recorded for reproducible reports.
    pub version: &'static str,
    rates: HashMap<String, ModelRate>,
    fallback: ModelRate,
}

impl RateTable {
    /// The table shipped with this build.
    #[must_use]
    pub fn builtin() -> Self {
        let mut rates = HashMap::new();
        rates.insert(
            "claude-opus-4-20250514".to_string(),
            ModelRate {
                input_per_mtok: 15.0,
                output_per_mtok: 75.0,
                cache_write_per_mtok: 18.75,
                cache_read_per_mtok: 1.5,
            },
        );
        rates.insert(
            "claude-sonnet-4-20250514".to_string(),
            ModelRate {
                input_per_mtok: 3.0,
                output_per_mtok: 15.0,
                cache_write_per_mtok: 3.75,
                cache_read_per_mtok: 0.3,
            },
        );
        rates.insert(
            "claude-3-5-haiku-20241022".to_string(),
            ModelRate {
                input_per_mtok: 0.8,
                output_per_mtok: 4.0,
                cache_write_per_mtok: 1.0,
                cache_read_per_mtok: 0.08,
            },
        );
        Self {
            version: "2026-08",
            rates,
            fallback: ModelRate {
                input_per_mtok: 3.0,
                output_per_mtok: 15.0,
                cache_write_per_mtok: 3.75,
                cache_read_per_mtok: 0.3,
            },
        }
    }

    /// Rate for `model`, falling back for unknown names.
    #[must_use]
    pub fn rate_for(&self, model: &str) -> ModelRate {
        self.rates.get(model).copied().unwrap_or(self.fallback)
    }
}

/// Month-to-date budget position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    /// Below 80% of budget.
    Under,
    /// At or above 80% of budget.
    Near,
    /// At or above budget.
    Over,
}

/// Applies usage to session counters and user aggregates.
pub struct CostAccountant {
    store: Arc<Store>,
    rates: RateTable,
}

impl CostAccountant {
    /// Create over the store with a rate table.
    #[must_use]
    pub fn new(store: Arc<Store>, rates: RateTable) -> Self {
        Self { store, rates }
    }

    /// The rate table in use.
    #[must_use]
    pub fn rates(&self) -> &RateTable {
        &self.rates
    }

    /// Account one finished turn.
    ///
    /// Prefers the cost the agent itself reported; computes from the rate
    /// table otherwise. Counters are incremented atomically in the store.
    pub fn record_turn(
        &self,
        session_id: SessionId,
        user_id: UserId,
        model: &str,
        usage: TokenUsage,
        duration_ms: u64,
        reported_cost_usd: Option<f64>,
    ) -> RuntimeResult<f64> {
        let cost_usd =
            reported_cost_usd.unwrap_or_else(|| self.rates.rate_for(model).cost(usage));
        let delta = SessionMetrics {
            cost_usd,
            usage,
            duration_ms,
            ..SessionMetrics::default()
        };
        self.store.increment_session_metrics(session_id, &delta)?;
        self.store.add_user_cost(user_id, Utc::now(), cost_usd)?;
        debug!(
            session_id = %session_id,
            model,
            cost_usd,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "turn accounted"
        );
        Ok(cost_usd)
    }

    /// Month-to-date budget status for a user.
    pub fn check_budget(&self, user_id: UserId) -> RuntimeResult<(BudgetStatus, f64, f64)> {
        let user = self.store.get_user(user_id)?;
        let spent = self.store.month_to_date_cost(user_id, Utc::now())?;
        let budget = user.quotas.monthly_budget_usd;
        let status = if budget > 0.0 && spent >= budget {
            BudgetStatus::Over
        } else if budget > 0.0 && spent >= budget * 0.8 {
            BudgetStatus::Near
        } else {
            BudgetStatus::Under
        };
        Ok((status, spent, budget))
    }
}

//! Hot in-memory pricing with invalidation and the cost formula.
//!
//! The whole pricing table lives in an [`ArcSwap`] snapshot so request
//! handlers read rates without touching the database. Pricing edits flip a
//! dirty flag; the next request entry reloads the table atomically, which
//! gives effectively-immediate propagation without per-request reads.
//! Callers inside one request always see a consistent snapshot.

use crate::store::{GatewayStore, PricingRow, Result as StoreResult};
use crate::types::Provider;
use crate::usage::UsageFacts;
use arc_swap::ArcSwap;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, instrument};

/// Per-token rates for one `(provider, model)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rates {
    pub input_rate: Decimal,
    pub output_rate: Decimal,
    pub cache_write_rate: Option<Decimal>,
    pub cache_read_rate: Option<Decimal>,
}

impl From<&PricingRow> for Rates {
    fn from(row: &PricingRow) -> Self {
        Rates {
            input_rate: row.input_rate,
            output_rate: row.output_rate,
            cache_write_rate: row.cache_write_rate,
            cache_read_rate: row.cache_read_rate,
        }
    }
}

#[derive(Debug, Default)]
struct PricingSnapshot {
    rates: HashMap<(Provider, String), Rates>,
}

pub struct PricingEngine {
    store: Arc<dyn GatewayStore>,
    snapshot: ArcSwap<PricingSnapshot>,
    dirty: AtomicBool,
}

impl PricingEngine {
    /// Load the pricing table and build the engine. Called once at startup.
    pub async fn new(store: Arc<dyn GatewayStore>) -> StoreResult<Self> {
        let snapshot = Self::load(store.as_ref()).await?;
        Ok(PricingEngine {
            store,
            snapshot: ArcSwap::from_pointee(snapshot),
            dirty: AtomicBool::new(false),
        })
    }

    async fn load(store: &dyn GatewayStore) -> StoreResult<PricingSnapshot> {
        let rows = store.list_pricing().await?;
        let mut rates = HashMap::with_capacity(rows.len());
        for row in &rows {
            let Some(provider) = Provider::parse(&row.provider) else {
                tracing::warn!(provider = %row.provider, model = %row.model, "Skipping pricing row for unknown provider");
                continue;
            };
            rates.insert((provider, row.model.clone()), Rates::from(row));
        }
        debug!(rows = rates.len(), "Loaded pricing snapshot");
        Ok(PricingSnapshot { rates })
    }

    /// Mark the snapshot stale. The next [`ensure_fresh`](Self::ensure_fresh)
    /// call reloads it.
    pub fn invalidate(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Reload the snapshot if an invalidation is pending. Runs at request
    /// entry; readers holding the previous snapshot are unaffected.
    #[instrument(skip(self))]
    pub async fn ensure_fresh(&self) -> StoreResult<()> {
        if self.dirty.swap(false, Ordering::AcqRel) {
            match Self::load(self.store.as_ref()).await {
                Ok(snapshot) => self.snapshot.store(Arc::new(snapshot)),
                Err(e) => {
                    // Keep serving the previous snapshot, retry on the next
                    // request.
                    self.dirty.store(true, Ordering::Release);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Exact-match rate lookup. `None` means the model is unpriced and the
    /// request must be rejected before any upstream spend: there is no
    /// fallback to a provider default.
    pub fn get(&self, provider: Provider, model: &str) -> Option<Rates> {
        self.snapshot
            .load()
            .rates
            .get(&(provider, model.to_string()))
            .cloned()
    }
}

/// Cost of one call:
/// `prompt·input + completion·output + cache_creation·cache_write + cache_read·cache_read`.
/// Absent cache rates count as zero.
pub fn cost(facts: &UsageFacts, rates: &Rates) -> Decimal {
    Decimal::from(facts.prompt_tokens) * rates.input_rate
        + Decimal::from(facts.completion_tokens) * rates.output_rate
        + Decimal::from(facts.cache_creation_tokens) * rates.cache_write_rate.unwrap_or(Decimal::ZERO)
        + Decimal::from(facts.cache_read_tokens) * rates.cache_read_rate.unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::in_memory::InMemoryStore;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn facts(prompt: i64, completion: i64, cache_creation: i64, cache_read: i64) -> UsageFacts {
        UsageFacts {
            prompt_tokens: prompt,
            completion_tokens: completion,
            cache_creation_tokens: cache_creation,
            cache_read_tokens: cache_read,
            request_hash: String::new(),
            response_hash: String::new(),
            estimated: false,
        }
    }

    fn row(provider: &str, model: &str, input: &str, output: &str) -> PricingRow {
        PricingRow {
            provider: provider.to_string(),
            model: model.to_string(),
            input_rate: dec(input),
            output_rate: dec(output),
            cache_write_rate: None,
            cache_read_rate: None,
        }
    }

    async fn engine_with(rows: &[PricingRow]) -> (Arc<InMemoryStore>, PricingEngine) {
        let store = Arc::new(InMemoryStore::new());
        for r in rows {
            store.upsert_pricing(r).await.unwrap();
        }
        let engine = PricingEngine::new(store.clone()).await.unwrap();
        (store, engine)
    }

    #[tokio::test]
    async fn lookup_is_exact_match_only() {
        let (_store, engine) = engine_with(&[
            row("openai", "gpt-5", "0.00000125", "0.00001"),
            // Provider-wide default row: present but never consulted for
            // other models.
            row("openai", "", "0.001", "0.001"),
        ])
        .await;

        assert!(engine.get(Provider::OpenAi, "gpt-5").is_some());
        assert!(engine.get(Provider::OpenAi, "gpt-99").is_none());
        assert!(engine.get(Provider::Anthropic, "gpt-5").is_none());
        // The default row only matches the empty model name itself.
        assert!(engine.get(Provider::OpenAi, "").is_some());
    }

    #[tokio::test]
    async fn invalidate_reloads_on_next_entry() {
        let (store, engine) = engine_with(&[row("openai", "gpt-5", "0.00000125", "0.00001")]).await;

        store
            .upsert_pricing(&row("openai", "gpt-5", "0.000002", "0.00001"))
            .await
            .unwrap();

        // Not yet visible: no invalidation has happened.
        engine.ensure_fresh().await.unwrap();
        assert_eq!(
            engine.get(Provider::OpenAi, "gpt-5").unwrap().input_rate,
            dec("0.00000125")
        );

        engine.invalidate();
        engine.ensure_fresh().await.unwrap();
        assert_eq!(
            engine.get(Provider::OpenAi, "gpt-5").unwrap().input_rate,
            dec("0.000002")
        );
    }

    #[test]
    fn cost_law() {
        let rates = Rates {
            input_rate: dec("0.00000125"),
            output_rate: dec("0.00001"),
            cache_write_rate: None,
            cache_read_rate: None,
        };
        // 8 * 1.25e-6 + 12 * 1e-5 = 0.00013
        assert_eq!(cost(&facts(8, 12, 0, 0), &rates), dec("0.00013"));

        // Doubling a rate doubles exactly that contribution.
        let doubled_output = Rates {
            output_rate: dec("0.00002"),
            ..rates.clone()
        };
        let base = cost(&facts(8, 12, 0, 0), &rates);
        let with_doubled = cost(&facts(8, 12, 0, 0), &doubled_output);
        assert_eq!(with_doubled - base, dec("0.00012"));
    }

    #[test]
    fn cost_with_cache_rates() {
        let rates = Rates {
            input_rate: dec("0.000003"),
            output_rate: dec("0.000015"),
            cache_write_rate: Some(dec("0.00000375")),
            cache_read_rate: Some(dec("0.0000003")),
        };
        // 100*3e-6 + 50*1.5e-5 + 2000*3.75e-6 + 500*3e-7
        assert_eq!(cost(&facts(100, 50, 2000, 500), &rates), dec("0.0087"));
    }

    #[test]
    fn absent_cache_rates_count_as_zero() {
        let rates = Rates {
            input_rate: dec("0.000003"),
            output_rate: dec("0.000015"),
            cache_write_rate: None,
            cache_read_rate: None,
        };
        assert_eq!(cost(&facts(100, 50, 2000, 500), &rates), dec("0.00105"));
    }

    #[test]
    fn zero_rates_yield_zero_cost() {
        let rates = Rates {
            input_rate: Decimal::ZERO,
            output_rate: Decimal::ZERO,
            cache_write_rate: Some(Decimal::ZERO),
            cache_read_rate: Some(Decimal::ZERO),
        };
        assert_eq!(cost(&facts(123456, 98765, 1000, 1000), &rates), Decimal::ZERO);
    }

    #[tokio::test]
    async fn unknown_provider_rows_are_skipped() {
        let (_store, engine) = engine_with(&[
            row("openai", "gpt-5", "0.00000125", "0.00001"),
            row("mistral", "mistral-large", "0.000001", "0.000001"),
        ])
        .await;
        assert!(engine.get(Provider::OpenAi, "gpt-5").is_some());
        // The unknown-provider row never becomes reachable.
        assert!(engine.get(Provider::OpenAi, "mistral-large").is_none());
    }
}

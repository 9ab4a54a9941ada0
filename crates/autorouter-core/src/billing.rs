//! C12 — Billing & Log Emitter, cost-computation half (§4.12). Persistence
//! of the resulting `RequestLog`/`BillingSnapshot` pair is
//! `autorouter_storage::LogEmitter`'s job (async, best-effort, bounded
//! queue); this module is the pure pricing/usage-to-cost computation that
//! feeds it.

use crate::data::{BillingMultipliers, ProviderType};
use crate::forwarder::UsageSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingStatus {
    Billed,
    Unbilled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnbillableReason {
    ModelMissing,
    UsageMissing,
    PriceNotFound,
}

#[derive(Debug, Clone, Copy)]
pub struct ModelPrice {
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
    pub cache_read_price_per_million: Option<f64>,
    pub cache_write_price_per_million: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct PriceResolution<'a> {
    pub manual_override: Option<&'a ModelPrice>,
    pub synced_price: Option<&'a ModelPrice>,
}

/// Manual override by model > synced price source > none (§4.12 step 2).
pub fn resolve_price<'a>(resolution: PriceResolution<'a>) -> Option<&'a ModelPrice> {
    resolution.manual_override.or(resolution.synced_price)
}

#[derive(Debug, Clone, Copy)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

impl From<&UsageSignal> for Usage {
    fn from(signal: &UsageSignal) -> Self {
        Usage {
            prompt_tokens: signal.prompt_tokens.unwrap_or(0),
            completion_tokens: signal.completion_tokens.unwrap_or(0),
            cache_read_tokens: signal.cache_read_tokens.unwrap_or(0),
            cache_write_tokens: signal.cache_write_tokens.unwrap_or(0),
        }
    }
}

/// `billedInputTokens` (§4.12 step 3): for Anthropic, if cache tokens cover
/// the full prompt the billed input is zero; otherwise subtract cache reads
/// and writes from the prompt, floored at zero.
pub fn billed_input_tokens(provider_type: ProviderType, usage: &Usage) -> u64 {
    let cache_total = usage.cache_read_tokens + usage.cache_write_tokens;
    if provider_type == ProviderType::Anthropic && cache_total >= usage.prompt_tokens {
        return 0;
    }
    usage.prompt_tokens.saturating_sub(cache_total)
}

#[derive(Debug, Clone, Copy)]
pub struct CostBreakdown {
    pub final_cost: f64,
    pub billed_input_tokens: u64,
}

/// `finalCost` (§4.12 step 4): per-million normalized unit prices multiplied
/// by the upstream's input/output multipliers.
pub fn compute_cost(
    provider_type: ProviderType,
    usage: &Usage,
    price: &ModelPrice,
    multipliers: BillingMultipliers,
) -> CostBreakdown {
    let billed_input = billed_input_tokens(provider_type, usage);
    let million = 1_000_000.0;

    let input_cost =
        (billed_input as f64 / million) * price.input_price_per_million * multipliers.input_multiplier;
    let output_cost = (usage.completion_tokens as f64 / million)
        * price.output_price_per_million
        * multipliers.output_multiplier;
    let cache_read_cost = price
        .cache_read_price_per_million
        .map(|p| (usage.cache_read_tokens as f64 / million) * p * multipliers.input_multiplier)
        .unwrap_or(0.0);
    let cache_write_cost = price
        .cache_write_price_per_million
        .map(|p| (usage.cache_write_tokens as f64 / million) * p * multipliers.input_multiplier)
        .unwrap_or(0.0);

    CostBreakdown {
        final_cost: input_cost + output_cost + cache_read_cost + cache_write_cost,
        billed_input_tokens: billed_input,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BillingOutcome {
    pub status: BillingStatus,
    pub unbillable_reason: Option<UnbillableReason>,
    pub cost: Option<CostBreakdown>,
}

/// Full §4.12 pipeline steps 1-4 collapsed: given the evidence gathered
/// during the attempt, decide whether the request can be billed and, if so,
/// at what cost.
pub fn evaluate_billing(
    provider_type: ProviderType,
    model: Option<&str>,
    usage: Option<&Usage>,
    price: Option<&ModelPrice>,
    multipliers: BillingMultipliers,
) -> BillingOutcome {
    if model.is_none() {
        return BillingOutcome {
            status: BillingStatus::Unbilled,
            unbillable_reason: Some(UnbillableReason::ModelMissing),
            cost: None,
        };
    }
    let Some(usage) = usage else {
        return BillingOutcome {
            status: BillingStatus::Unbilled,
            unbillable_reason: Some(UnbillableReason::UsageMissing),
            cost: None,
        };
    };
    let Some(price) = price else {
        return BillingOutcome {
            status: BillingStatus::Unbilled,
            unbillable_reason: Some(UnbillableReason::PriceNotFound),
            cost: None,
        };
    };

    let cost = compute_cost(provider_type, usage, price, multipliers);
    BillingOutcome {
        status: BillingStatus::Billed,
        unbillable_reason: None,
        cost: Some(cost),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price() -> ModelPrice {
        ModelPrice {
            input_price_per_million: 3.0,
            output_price_per_million: 15.0,
            cache_read_price_per_million: Some(0.3),
            cache_write_price_per_million: Some(3.75),
        }
    }

    #[test]
    fn anthropic_billed_input_zero_when_cache_covers_prompt() {
        let usage = Usage {
            prompt_tokens: 100,
            completion_tokens: 50,
            cache_read_tokens: 100,
            cache_write_tokens: 0,
        };
        assert_eq!(billed_input_tokens(ProviderType::Anthropic, &usage), 0);
    }

    #[test]
    fn non_anthropic_subtracts_cache_from_prompt() {
        let usage = Usage {
            prompt_tokens: 100,
            completion_tokens: 50,
            cache_read_tokens: 20,
            cache_write_tokens: 10,
        };
        assert_eq!(billed_input_tokens(ProviderType::Openai, &usage), 70);
    }

    #[test]
    fn s1_happy_path_cost_matches_scenario() {
        let usage = Usage {
            prompt_tokens: 100,
            completion_tokens: 50,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
        };
        let outcome = evaluate_billing(
            ProviderType::Anthropic,
            Some("claude-3-5-sonnet"),
            Some(&usage),
            Some(&price()),
            BillingMultipliers::default(),
        );
        assert_eq!(outcome.status, BillingStatus::Billed);
        let expected = (100.0 * 3.0 + 50.0 * 15.0) / 1_000_000.0;
        assert!((outcome.cost.unwrap().final_cost - expected).abs() < 1e-9);
    }

    #[test]
    fn missing_usage_is_unbilled() {
        let outcome = evaluate_billing(
            ProviderType::Anthropic,
            Some("claude-3-5-sonnet"),
            None,
            Some(&price()),
            BillingMultipliers::default(),
        );
        assert_eq!(outcome.status, BillingStatus::Unbilled);
        assert_eq!(outcome.unbillable_reason, Some(UnbillableReason::UsageMissing));
    }

    #[test]
    fn missing_price_is_unbilled_with_price_not_found() {
        let usage = Usage {
            prompt_tokens: 1,
            completion_tokens: 1,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
        };
        let outcome = evaluate_billing(
            ProviderType::Anthropic,
            Some("m"),
            Some(&usage),
            None,
            BillingMultipliers::default(),
        );
        assert_eq!(outcome.unbillable_reason, Some(UnbillableReason::PriceNotFound));
    }

    #[test]
    fn manual_override_wins_over_synced_price() {
        let manual = ModelPrice {
            input_price_per_million: 1.0,
            output_price_per_million: 2.0,
            cache_read_price_per_million: None,
            cache_write_price_per_million: None,
        };
        let synced = price();
        let resolved = resolve_price(PriceResolution {
            manual_override: Some(&manual),
            synced_price: Some(&synced),
        });
        assert_eq!(resolved.unwrap().input_price_per_million, 1.0);
    }

    #[test]
    fn final_cost_applies_multipliers() {
        let usage = Usage {
            prompt_tokens: 1_000_000,
            completion_tokens: 1_000_000,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
        };
        let breakdown = compute_cost(
            ProviderType::Openai,
            &usage,
            &price(),
            BillingMultipliers {
                input_multiplier: 2.0,
                output_multiplier: 1.5,
            },
        );
        assert!((breakdown.final_cost - (3.0 * 2.0 + 15.0 * 1.5)).abs() < 1e-9);
    }
}

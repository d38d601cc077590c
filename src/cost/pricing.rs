//! Tiered per-model pricing. Rates are USD per 1M tokens; a tier's
//! `threshold` is the cumulative-token upper bound it applies to, with 0
//! meaning unbounded (the tail tier). Per-alias overrides are flat rates
//! that win over the tier schedule.

use std::collections::{BTreeMap, HashMap};

use crate::config::{ModelPricingConfig, ProviderConfig};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CostBreakdown {
    pub input: f64,
    pub output: f64,
    pub total: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct PricingTier {
    pub threshold: u64,
    pub input: f64,
    pub output: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct PricingOverride {
    pub input: f64,
    pub output: f64,
}

#[derive(Clone, Debug, Default)]
pub struct ModelPricing {
    pub tiers: Vec<PricingTier>,
    pub overrides: HashMap<String, PricingOverride>,
}

impl ModelPricing {
    fn from_config(config: &ModelPricingConfig) -> Self {
        Self {
            tiers: config
                .tiers
                .iter()
                .map(|tier| PricingTier {
                    threshold: tier.threshold,
                    input: tier.input,
                    output: tier.output,
                })
                .collect(),
            overrides: config
                .overrides
                .iter()
                .map(|(alias, rates)| {
                    (
                        alias.clone(),
                        PricingOverride {
                            input: rates.input,
                            output: rates.output,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Written once at startup, read-only afterwards.
#[derive(Clone, Debug, Default)]
pub struct PricingTable {
    models: HashMap<(String, String), ModelPricing>,
}

impl PricingTable {
    /// Registers pricing for every enabled model under its name and each of
    /// its aliases.
    pub fn from_config(providers: &BTreeMap<String, ProviderConfig>) -> Self {
        let mut table = Self::default();
        for (provider_name, provider) in providers {
            if !provider.enabled {
                continue;
            }
            for (model_name, model) in &provider.models {
                if !model.enabled {
                    continue;
                }
                let Some(pricing_config) = model.pricing.as_ref() else {
                    tracing::warn!(
                        provider = %provider_name,
                        model = %model_name,
                        "model has no pricing configured"
                    );
                    continue;
                };
                let pricing = ModelPricing::from_config(pricing_config);
                table.set_model_pricing(provider_name, model_name, pricing.clone());
                for alias in &model.aliases {
                    table.set_model_pricing(provider_name, alias, pricing.clone());
                }
            }
        }
        table
    }

    pub fn set_model_pricing(
        &mut self,
        provider: impl Into<String>,
        model: impl Into<String>,
        pricing: ModelPricing,
    ) {
        self.models.insert((provider.into(), model.into()), pricing);
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Cost of a completed request, or `None` when the model is unpriced.
    pub fn cost(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Option<CostBreakdown> {
        let pricing = self
            .models
            .get(&(provider.to_string(), model.to_string()))?;

        if let Some(rates) = pricing.overrides.get(model) {
            let input = per_million(input_tokens, rates.input);
            let output = per_million(output_tokens, rates.output);
            return Some(CostBreakdown {
                input,
                output,
                total: input + output,
            });
        }

        if pricing.tiers.is_empty() {
            return None;
        }

        let input = tiered_cost(&pricing.tiers, input_tokens, |tier| tier.input);
        let output = tiered_cost(&pricing.tiers, output_tokens, |tier| tier.output);
        Some(CostBreakdown {
            input,
            output,
            total: input + output,
        })
    }
}

fn per_million(tokens: u64, rate: f64) -> f64 {
    tokens as f64 * rate / 1_000_000.0
}

/// Piecewise cost: each tier prices the tokens between the previous bound
/// and its own; the unbounded tier (or the last tier's rate) covers the rest.
fn tiered_cost(tiers: &[PricingTier], tokens: u64, rate: fn(&PricingTier) -> f64) -> f64 {
    let mut sorted: Vec<&PricingTier> = tiers.iter().collect();
    sorted.sort_by_key(|tier| {
        if tier.threshold == 0 {
            u64::MAX
        } else {
            tier.threshold
        }
    });

    let mut remaining = tokens;
    let mut previous_bound = 0u64;
    let mut cost = 0.0;
    let mut last_rate = 0.0;

    for tier in &sorted {
        if remaining == 0 {
            break;
        }
        let span = if tier.threshold == 0 {
            remaining
        } else {
            remaining.min(tier.threshold.saturating_sub(previous_bound))
        };
        cost += per_million(span, rate(tier));
        remaining -= span;
        if tier.threshold != 0 {
            previous_bound = tier.threshold;
        }
        last_rate = rate(tier);
    }

    // Tokens past the last bounded tier keep its rate.
    if remaining > 0 {
        cost += per_million(remaining, last_rate);
    }

    cost
}

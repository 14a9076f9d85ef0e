use meridian_core::{PriceData, Usage};

/// Total input tokens at or above this threshold trigger the
/// long-context surcharge on Claude models
const LONG_CONTEXT_THRESHOLD: i64 = 200_000;
const LONG_CONTEXT_INPUT_MULTIPLIER: f64 = 2.0;
const LONG_CONTEXT_OUTPUT_MULTIPLIER: f64 = 1.5;

/// Inputs to a settle-time quota computation
#[derive(Debug, Clone, Copy)]
pub struct PricingInput<'a> {
    pub model_name: &'a str,
    pub usage: &'a Usage,
    pub price: &'a PriceData,
    /// Quota units per unit of flat model price
    pub quota_per_unit: f64,
    /// Channel setting: bill 1-hour cache creation at the 5-minute ratio
    pub cache_1h_as_5m: bool,
    /// Channel-switch forgiveness: cache-creation tokens bill as zero
    pub free_cache_creation: bool,
}

/// A priced request with its billing facts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaBreakdown {
    pub quota: i64,
    pub long_context: bool,
    /// Input-side tokens counted toward the long-context threshold
    pub total_input_tokens: i64,
    pub input_multiplier: f64,
    pub output_multiplier: f64,
    /// Cache-creation tokens actually billed (zero when forgiven)
    pub billed_cache_creation_tokens: i64,
}

/// Price a settled request
///
/// Ratio model: prompt, cache-read and cache-creation tokens each
/// carry their own multiplier, outputs carry the completion ratio,
/// and the whole sum scales by group and model ratios. Flat-priced
/// models bypass tokens entirely. The Anthropic long-context rule
/// applies when the model name contains "claude" and the input side
/// reaches 200K tokens: inputs ×2.0, outputs ×1.5.
pub fn compute_quota(input: &PricingInput<'_>) -> QuotaBreakdown {
    let usage = input.usage;
    let price = input.price;

    // forgiven cache writes drop out before the threshold count
    let (cache_creation, cache_creation_5m, cache_creation_1h) = if input.free_cache_creation {
        (0, 0, 0)
    } else {
        (
            usage.cache_creation_tokens,
            usage.cache_creation_5m_tokens,
            usage.cache_creation_1h_tokens,
        )
    };

    let total_input_tokens = usage.prompt_tokens + usage.cache_read_tokens + cache_creation;
    let long_context = total_input_tokens >= LONG_CONTEXT_THRESHOLD
        && input.model_name.to_lowercase().contains("claude");
    let (input_multiplier, output_multiplier) = if long_context {
        (LONG_CONTEXT_INPUT_MULTIPLIER, LONG_CONTEXT_OUTPUT_MULTIPLIER)
    } else {
        (1.0, 1.0)
    };

    let mut quota = if price.use_price {
        price.model_price * input.quota_per_unit * price.group_ratio
    } else {
        let cache_creation_1h_ratio = if input.cache_1h_as_5m {
            price.cache_creation_5m_ratio
        } else {
            price.cache_creation_1h_ratio
        };
        let unclassified_creation = (cache_creation - cache_creation_5m - cache_creation_1h).max(0);

        let mut tokens = usage.prompt_tokens as f64 * input_multiplier;
        tokens += usage.cache_read_tokens as f64 * price.cache_ratio * input_multiplier;
        tokens += cache_creation_5m as f64 * price.cache_creation_5m_ratio * input_multiplier;
        tokens += cache_creation_1h as f64 * cache_creation_1h_ratio * input_multiplier;
        tokens += unclassified_creation as f64 * price.cache_creation_ratio * input_multiplier;
        tokens += usage.completion_tokens as f64 * price.completion_ratio * output_multiplier;
        tokens * price.group_ratio * price.model_ratio
    };

    // a priced model never bills zero for a non-empty request
    if price.model_ratio != 0.0 && quota <= 0.0 {
        quota = 1.0;
    }

    QuotaBreakdown {
        quota: quota as i64,
        long_context,
        total_input_tokens,
        input_multiplier,
        output_multiplier,
        billed_cache_creation_tokens: cache_creation,
    }
}

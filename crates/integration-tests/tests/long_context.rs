//! Anthropic long-context surcharge scenario

mod harness;

use harness::{channel, harness, request};
use meridian_core::Usage;

fn usage(prompt: i64, cache_read: i64, cache_creation: i64, completion: i64) -> Usage {
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        cache_read_tokens: cache_read,
        cache_creation_tokens: cache_creation,
        ..Usage::default()
    }
}

fn priced_request(estimate: i64) -> meridian_runtime::DispatchRequest {
    let mut req = request("std", "claude-sonnet-4", "", estimate);
    req.price.completion_ratio = 5.0;
    req.price.cache_ratio = 0.1;
    req.price.cache_creation_ratio = 1.25;
    req.price.cache_creation_5m_ratio = 1.25;
    req.price.cache_creation_1h_ratio = 2.0;
    req
}

#[tokio::test]
async fn two_hundred_k_inputs_double_input_cost() {
    let fixture = harness(&[channel(1, 10, 0, "std", "claude-sonnet-4", "")]).await;

    // 150K prompt + 80K cache read + 70K cache creation = 300K inputs
    let dispatch = fixture.runtime.dispatch(priced_request(0)).await.unwrap();
    let quota = fixture
        .runtime
        .settle(&dispatch.ctx, &usage(150_000, 80_000, 70_000, 10_000))
        .await
        .unwrap();
    let expected =
        150_000.0 * 2.0 + 80_000.0 * 0.1 * 2.0 + 70_000.0 * 1.25 * 2.0 + 10_000.0 * 5.0 * 1.5;
    assert_eq!(quota, expected as i64);

    let row = fixture.store.consume_logs().pop().unwrap();
    assert_eq!(row.other.get("is_long_context"), Some(&true.into()));
    assert_eq!(row.other.get("total_input_tokens"), Some(&300_000_i64.into()));
}

#[tokio::test]
async fn threshold_counts_cache_tokens_and_is_exact() {
    let fixture = harness(&[channel(1, 10, 0, "std", "claude-sonnet-4", "")]).await;

    // 100K + 80K + 70K = 250K: still surcharged
    let dispatch = fixture.runtime.dispatch(priced_request(0)).await.unwrap();
    let quota = fixture
        .runtime
        .settle(&dispatch.ctx, &usage(100_000, 80_000, 70_000, 10_000))
        .await
        .unwrap();
    let expected =
        100_000.0 * 2.0 + 80_000.0 * 0.1 * 2.0 + 70_000.0 * 1.25 * 2.0 + 10_000.0 * 5.0 * 1.5;
    assert_eq!(quota, expected as i64);

    // 199,999 total inputs: normal pricing
    let dispatch = fixture.runtime.dispatch(priced_request(0)).await.unwrap();
    let quota = fixture
        .runtime
        .settle(&dispatch.ctx, &usage(49_999, 80_000, 70_000, 10_000))
        .await
        .unwrap();
    let expected = 49_999.0 + 80_000.0 * 0.1 + 70_000.0 * 1.25 + 10_000.0 * 5.0;
    assert_eq!(quota, expected as i64);

    let row = fixture.store.consume_logs().pop().unwrap();
    assert_eq!(row.other.get("is_long_context"), None);
}

#[tokio::test]
async fn non_claude_models_never_pay_the_surcharge() {
    let fixture = harness(&[channel(1, 10, 0, "std", "gpt-4o", "")]).await;

    let mut req = request("std", "gpt-4o", "", 0);
    req.price.completion_ratio = 5.0;
    let dispatch = fixture.runtime.dispatch(req).await.unwrap();
    let quota = fixture
        .runtime
        .settle(&dispatch.ctx, &usage(300_000, 0, 0, 10_000))
        .await
        .unwrap();
    assert_eq!(quota, (300_000.0 + 10_000.0 * 5.0) as i64);
}

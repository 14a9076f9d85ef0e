//! Funding-source scenarios: envelope precedence, degrade, free-tier
//! isolation, and refund conservation

mod harness;

use harness::{TOKEN, USER, channel, harness, request, subscription};
use meridian_core::Usage;
use meridian_ledger::SubscriptionQuota;
use meridian_store::Store;

fn usage(prompt: i64, completion: i64) -> Usage {
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        ..Usage::default()
    }
}

/// An active subscription funds the request; the refund of an
/// over-estimate returns to the subscription, never the balance.
#[tokio::test]
async fn envelope_precedence_and_source_preserving_refund() {
    let fixture = harness(&[channel(1, 10, 0, "default", "m", "")]).await;
    let (user_sub, plan) = subscription(10_000, 50_000, 200_000);
    fixture.store.put_subscription(user_sub.clone(), plan.clone());
    let windows = SubscriptionQuota::new(fixture.kv.clone(), &user_sub, &plan);

    let dispatch = fixture
        .runtime
        .dispatch(request("default", "m", "", 3000))
        .await
        .unwrap();
    assert!(dispatch.ctx.flags.subscription_pre_consumed);
    assert_eq!(windows.used().await.unwrap(), [3000, 3000, 3000]);
    assert_eq!(fixture.store.user_quota(USER).await.unwrap(), 1_000_000);

    // actual 2500: 500 back to the subscription only
    let quota = fixture
        .runtime
        .settle(&dispatch.ctx, &usage(2000, 500))
        .await
        .unwrap();
    assert_eq!(quota, 2500);
    fixture.runtime.drain().flush().await;
    assert_eq!(windows.used().await.unwrap(), [2500, 2500, 2500]);
    assert_eq!(fixture.store.user_quota(USER).await.unwrap(), 1_000_000);
}

/// When the daily envelope fills between pre-consume and settle, only
/// the extra debit degrades to the paid balance.
#[tokio::test]
async fn settle_degrade_splits_between_sources() {
    let fixture = harness(&[channel(1, 10, 0, "default", "m", "")]).await;
    let (user_sub, plan) = subscription(10_000, 0, 0);
    fixture.store.put_subscription(user_sub.clone(), plan.clone());
    let windows = SubscriptionQuota::new(fixture.kv.clone(), &user_sub, &plan);
    windows.consume(9500).await.unwrap();

    let dispatch = fixture
        .runtime
        .dispatch(request("default", "m", "", 400))
        .await
        .unwrap();
    assert!(dispatch.ctx.flags.subscription_pre_consumed);
    assert_eq!(windows.used().await.unwrap()[0], 9900);

    // actual 600: the +200 delta cannot fit the daily envelope
    fixture
        .runtime
        .settle(&dispatch.ctx, &usage(600, 0))
        .await
        .unwrap();
    fixture.runtime.drain().flush().await;
    assert_eq!(windows.used().await.unwrap()[0], 9900);
    assert_eq!(fixture.store.user_quota(USER).await.unwrap(), 1_000_000 - 200);
}

/// The free-tier group lives entirely on the check-in pool; paid and
/// subscription counters are untouched by debit and refund alike.
#[tokio::test]
async fn free_tier_is_fully_isolated() {
    let fixture = harness(&[channel(1, 10, 0, "free", "m", "")]).await;
    let (user_sub, plan) = subscription(10_000, 50_000, 200_000);
    fixture.store.put_subscription(user_sub.clone(), plan.clone());
    let windows = SubscriptionQuota::new(fixture.kv.clone(), &user_sub, &plan);
    fixture.runtime.ledger().checkin().claim(USER, 1000).await.unwrap();

    let dispatch = fixture
        .runtime
        .dispatch(request("free", "m", "", 300))
        .await
        .unwrap();
    assert_eq!(dispatch.ctx.flags.checkin_consumed, 300);
    assert_eq!(
        fixture.runtime.ledger().checkin().remaining(USER).await.unwrap(),
        700
    );

    fixture
        .runtime
        .settle(&dispatch.ctx, &usage(200, 50))
        .await
        .unwrap();
    fixture.runtime.drain().flush().await;
    assert_eq!(
        fixture.runtime.ledger().checkin().remaining(USER).await.unwrap(),
        750
    );
    assert_eq!(fixture.store.user_quota(USER).await.unwrap(), 1_000_000);
    assert_eq!(windows.used().await.unwrap(), [0, 0, 0]);
    // the token is reconciled to the true cost of 250
    assert_eq!(
        fixture.store.token_remain_quota(TOKEN).await.unwrap(),
        1_000_000 - 250
    );
}

/// Pre-consume followed by an upstream failure is conservation-neutral
/// for every counter involved.
#[tokio::test]
async fn failed_request_nets_to_zero() {
    let fixture = harness(&[channel(1, 10, 0, "default", "m", "")]).await;

    let dispatch = fixture
        .runtime
        .dispatch(request("default", "m", "", 5000))
        .await
        .unwrap();
    assert_eq!(fixture.store.user_quota(USER).await.unwrap(), 995_000);
    assert_eq!(fixture.store.token_remain_quota(TOKEN).await.unwrap(), 995_000);

    let error = meridian_core::UpstreamError::from_message("connection reset").with_status(502);
    fixture.runtime.upstream_failed(&dispatch.ctx, &error).await;
    fixture.runtime.drain().flush().await;

    assert_eq!(fixture.store.user_quota(USER).await.unwrap(), 1_000_000);
    assert_eq!(fixture.store.token_remain_quota(TOKEN).await.unwrap(), 1_000_000);
    assert_eq!(fixture.store.user_used_quota(USER), 0);
}

/// Settling at exactly the estimate leaves every counter where
/// pre-consume put it.
#[tokio::test]
async fn zero_delta_settle_changes_nothing() {
    let fixture = harness(&[channel(1, 10, 0, "default", "m", "")]).await;

    let dispatch = fixture
        .runtime
        .dispatch(request("default", "m", "", 2500))
        .await
        .unwrap();
    fixture
        .runtime
        .settle(&dispatch.ctx, &usage(2000, 500))
        .await
        .unwrap();
    fixture.runtime.drain().flush().await;

    assert_eq!(fixture.store.user_quota(USER).await.unwrap(), 1_000_000 - 2500);
    assert_eq!(fixture.store.token_remain_quota(TOKEN).await.unwrap(), 1_000_000 - 2500);
    assert_eq!(fixture.store.user_used_quota(USER), 2500);
}

/// The consume log records one row per settled request with the
/// ratios and token counts.
#[tokio::test]
async fn consume_log_rows_are_emitted() {
    let fixture = harness(&[channel(1, 10, 0, "default", "m", "")]).await;

    let dispatch = fixture
        .runtime
        .dispatch(request("default", "m", "", 100))
        .await
        .unwrap();
    fixture
        .runtime
        .settle(&dispatch.ctx, &usage(80, 20))
        .await
        .unwrap();

    let logs = fixture.store.consume_logs();
    assert_eq!(logs.len(), 1);
    let row = &logs[0];
    assert_eq!(row.user_id, USER);
    assert_eq!(row.channel_id, 1);
    assert_eq!(row.prompt_tokens, 80);
    assert_eq!(row.completion_tokens, 20);
    assert_eq!(row.quota, 100);
    assert_eq!(row.group, "default");
    assert_eq!(row.ip, "10.0.0.1");
    assert!(row.other.contains_key("model_ratio"));
}

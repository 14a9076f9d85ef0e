//! Sticky lock-in and distribution scenarios

mod harness;

use harness::{channel, harness, request, sticky_settings};

/// Two equal channels with capacity 5 each: ten distinct sessions
/// spread exactly five and five, an eleventh session is served but
/// not bound anywhere.
#[tokio::test]
async fn sticky_lock_in_fills_both_channels_evenly() {
    let fixture = harness(&[
        channel(1, 10, 0, "std", "m", &sticky_settings(5)),
        channel(2, 10, 0, "std", "m", &sticky_settings(5)),
    ])
    .await;

    for i in 0..10 {
        let dispatch = fixture
            .runtime
            .dispatch(request("std", "m", &format!("s{i}"), 0))
            .await
            .unwrap();
        assert!(dispatch.ctx.flags.sticky_bound);
    }
    assert_eq!(fixture.runtime.registry().count(1).await.unwrap(), 5);
    assert_eq!(fixture.runtime.registry().count(2).await.unwrap(), 5);

    // both at cap: the request is still served, unbound
    let eleventh = fixture
        .runtime
        .dispatch(request("std", "m", "s-new", 0))
        .await
        .unwrap();
    assert!(!eleventh.ctx.flags.sticky_bound);
    assert_eq!(fixture.runtime.registry().count(1).await.unwrap(), 5);
    assert_eq!(fixture.runtime.registry().count(2).await.unwrap(), 5);
}

/// The same session keeps hitting the channel it bound first.
#[tokio::test]
async fn one_session_never_migrates() {
    let fixture = harness(&[
        channel(1, 10, 0, "std", "m", &sticky_settings(0)),
        channel(2, 10, 0, "std", "m", &sticky_settings(0)),
    ])
    .await;

    let first = fixture
        .runtime
        .dispatch(request("std", "m", "stable", 0))
        .await
        .unwrap();
    for _ in 0..8 {
        let next = fixture
            .runtime
            .dispatch(request("std", "m", "stable", 0))
            .await
            .unwrap();
        assert_eq!(next.channel.id, first.channel.id);
    }
}

/// Racing requests for one fresh session agree on a single channel
/// once the dust settles.
#[tokio::test]
async fn concurrent_first_requests_converge_on_one_channel() {
    let fixture = harness(&[
        channel(1, 10, 0, "std", "m", &sticky_settings(0)),
        channel(2, 10, 0, "std", "m", &sticky_settings(0)),
    ])
    .await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let runtime = fixture.runtime.clone();
        tasks.push(tokio::spawn(async move {
            runtime.dispatch(request("std", "m", "raced", 0)).await.unwrap()
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // after the race the binding is authoritative and every further
    // request follows it
    let settled = fixture
        .runtime
        .registry()
        .lookup("std", "m", "raced")
        .await
        .unwrap()
        .expect("session must be bound");
    for _ in 0..4 {
        let next = fixture
            .runtime
            .dispatch(request("std", "m", "raced", 0))
            .await
            .unwrap();
        assert_eq!(next.channel.id, settled.channel_id);
    }
}

/// With all weights zero and sticky enabled everywhere, bindings
/// spread within one of the fair share.
#[tokio::test]
async fn zero_weight_sticky_distribution_is_even() {
    let fixture = harness(&[
        channel(1, 10, 0, "std", "m", &sticky_settings(0)),
        channel(2, 10, 0, "std", "m", &sticky_settings(0)),
        channel(3, 10, 0, "std", "m", &sticky_settings(0)),
    ])
    .await;

    for i in 0..30 {
        fixture
            .runtime
            .dispatch(request("std", "m", &format!("d{i}"), 0))
            .await
            .unwrap();
    }
    for id in [1, 2, 3] {
        let count = fixture.runtime.registry().count(id).await.unwrap();
        assert!((9..=11).contains(&count), "channel {id} holds {count} sessions");
    }
}

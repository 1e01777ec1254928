use std::time::Duration;

use super::*;

#[tokio::test]
async fn frame_without_subtasks_resolves_immediately() {
    let barrier = FrameCompletionBarrier::new();
    let failures = tokio::time::timeout(
        Duration::from_secs(1),
        barrier.trigger_and_await(Generation(1), async { Ok(()) }),
    )
    .await
    .expect("barrier must not hang on static frames")
    .unwrap();
    assert!(failures.is_empty());
}

#[tokio::test]
async fn waits_for_every_subtask_and_collects_failures() {
    let barrier = FrameCompletionBarrier::new();
    let done = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let trigger = {
        let barrier = barrier.clone();
        let done = Arc::clone(&done);
        async move {
            for (i, delay_ms) in [30u64, 5, 15].into_iter().enumerate() {
                let done = Arc::clone(&done);
                barrier.wait_for(format!("layer-{i}"), async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    done.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    if i == 1 { Err("decode failed") } else { Ok(()) }
                })?;
            }
            Ok(())
        }
    };

    let failures = barrier
        .trigger_and_await(Generation(1), trigger)
        .await
        .unwrap();
    assert_eq!(done.load(std::sync::atomic::Ordering::SeqCst), 3);
    assert_eq!(
        failures,
        vec![SubtaskFailure {
            label: "layer-1".into(),
            error: "decode failed".into()
        }]
    );
    assert_eq!(barrier.pending(), 0);
}

#[tokio::test]
async fn registration_is_closed_after_trigger() {
    let barrier = FrameCompletionBarrier::new();
    barrier
        .trigger_and_await(Generation(1), async { Ok(()) })
        .await
        .unwrap();
    assert!(barrier.register("late").is_err());
}

#[tokio::test]
async fn registration_requires_an_open_generation() {
    let barrier = FrameCompletionBarrier::new();
    assert!(barrier.register("early").is_err());
}

#[tokio::test]
async fn generations_must_increase() {
    let barrier = FrameCompletionBarrier::new();
    barrier.begin(Generation(5)).unwrap();
    assert!(barrier.begin(Generation(5)).is_err());
    assert!(barrier.begin(Generation(4)).is_err());
    barrier.begin(Generation(6)).unwrap();
}

#[tokio::test]
async fn dropped_ticket_counts_as_failure() {
    let barrier = FrameCompletionBarrier::new();
    let trigger = {
        let barrier = barrier.clone();
        async move {
            let ticket = barrier.register("forgotten")?;
            drop(ticket);
            Ok(())
        }
    };
    let failures = barrier
        .trigger_and_await(Generation(1), trigger)
        .await
        .unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].label, "forgotten");
}

#[tokio::test]
async fn stale_completion_never_satisfies_a_newer_generation() {
    let barrier = FrameCompletionBarrier::new();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let slow = {
        let barrier = barrier.clone();
        async move {
            tx.send(barrier.register("slow")?).ok();
            Ok(())
        }
    };
    // The first frame gives up while its subtask is still outstanding.
    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), barrier.trigger_and_await(Generation(1), slow))
            .await;
    assert!(abandoned.is_err());
    let stale_ticket = rx.await.unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let current = {
        let barrier = barrier.clone();
        async move {
            tx.send(barrier.register("current")?).ok();
            Ok(())
        }
    };
    let drain = tokio::spawn({
        let barrier = barrier.clone();
        async move { barrier.trigger_and_await(Generation(2), current).await }
    });
    let current_ticket = rx.await.unwrap();

    stale_ticket.fail("late failure");
    tokio::task::yield_now().await;
    assert_eq!(barrier.pending(), 1);
    assert!(!drain.is_finished());

    current_ticket.complete();
    let failures = drain.await.unwrap().unwrap();
    assert!(failures.is_empty());
}

#[tokio::test]
async fn trigger_error_propagates() {
    let barrier = FrameCompletionBarrier::new();
    let err = barrier
        .trigger_and_await(Generation(1), async {
            Err(FramecastError::validation("no such frame"))
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no such frame"));
}

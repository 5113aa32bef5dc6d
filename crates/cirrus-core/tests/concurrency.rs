/// Cross-thread behavior of the completion and transfer primitives.
///
/// Run with:
///   cargo test -p cirrus-core --test concurrency
use cirrus_core::completion::TaggedCompletion;
use cirrus_core::transfer::{TransferState, TransferTask};
use cirrus_core::types::TransferDirection;
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_callbacks_resolve_exactly_once() {
    let completion: TaggedCompletion<u32, usize> = TaggedCompletion::new(7);
    let winners = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..16)
        .map(|i| {
            let completion = completion.clone();
            let winners = Arc::clone(&winners);
            std::thread::spawn(move || {
                // Odd threads answer with a stale tag.
                let tag = if i % 2 == 0 { 7 } else { 8 };
                if completion.complete(&tag, i) {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    let value = completion.wait().await.unwrap();
    assert_eq!(value % 2, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_from_worker_thread_is_monotone() {
    let (task, reporter) =
        TransferTask::new(TransferDirection::Upload, Path::new("/tmp/src.db"), "src.db");
    let observed = tokio::spawn(task.progress().collect::<Vec<_>>());

    std::thread::spawn(move || {
        for done in [10u64, 40, 20, 80, 60, 100] {
            reporter.progress(done, Some(100));
        }
        reporter.succeed(100);
    })
    .join()
    .unwrap();

    let states = observed.await.unwrap();
    let done: Vec<u64> = states.iter().map(TransferState::bytes_done).collect();
    assert!(done.windows(2).all(|w| w[0] <= w[1]), "{done:?}");
    assert_eq!(states.last(), Some(&TransferState::Succeeded { bytes: 100 }));
    assert_eq!(states.iter().filter(|s| s.is_terminal()).count(), 1);
}

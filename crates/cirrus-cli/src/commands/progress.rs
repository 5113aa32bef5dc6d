use futures::StreamExt;
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};

use cirrus_core::transfer::{TransferState, TransferTask};
use cirrus_storage::coordinator::{BatchReport, SkipReason, TargetResult, TransferStarted};

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}";

/// Draw one progress bar per started transfer until the coordinator is dropped.
pub fn watch_transfers(mut started: broadcast::Receiver<TransferStarted>) -> JoinHandle<()> {
    let bars = MultiProgress::new();
    let style = ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");

    tokio::spawn(async move {
        let mut followers = JoinSet::new();
        loop {
            match started.recv().await {
                Ok(event) => {
                    let pb = bars.add(ProgressBar::new(0));
                    pb.set_style(style.clone());
                    pb.set_message(event.target.clone());
                    followers.spawn(follow(pb, event.task));
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Progress display fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        while followers.join_next().await.is_some() {}
    })
}

async fn follow(pb: ProgressBar, task: TransferTask) {
    let mut progress = Box::pin(task.progress());
    while let Some(state) = progress.next().await {
        match state {
            TransferState::Pending => {}
            TransferState::InProgress {
                bytes_done,
                bytes_total,
            } => {
                if let Some(total) = bytes_total {
                    pb.set_length(total);
                }
                pb.set_position(bytes_done);
            }
            TransferState::Succeeded { bytes } => {
                pb.set_length(bytes);
                pb.set_position(bytes);
                pb.finish();
            }
            TransferState::Failed { failure, .. } => {
                pb.abandon_with_message(format!(
                    "{} failed: {}",
                    task.remote_key(),
                    failure.message
                ));
            }
            TransferState::Cancelled { .. } => {
                pb.abandon_with_message(format!("{} cancelled", task.remote_key()));
            }
        }
    }
}

/// Print per-target outcomes. Fails when any target failed.
pub fn print_report(action: &str, report: &BatchReport) -> anyhow::Result<()> {
    let outcomes = match report {
        BatchReport::Disabled => {
            println!("{action} skipped: no provider selected or automatic backup off.");
            return Ok(());
        }
        BatchReport::NeedsReauth => {
            anyhow::bail!("{action} needs sign-in: refresh the provider credentials and retry")
        }
        BatchReport::Aborted(failure) => {
            anyhow::bail!("{action} aborted: {}", failure.message)
        }
        BatchReport::Completed(outcomes) => outcomes,
    };

    println!("\n{action} finished:");
    let mut failed = 0;
    for outcome in outcomes {
        let line = match &outcome.result {
            TargetResult::Succeeded { bytes } => format!("ok ({})", HumanBytes(*bytes)),
            TargetResult::Failed(f) => {
                failed += 1;
                format!("failed: {}", f.message)
            }
            TargetResult::Cancelled => {
                failed += 1;
                "cancelled".to_string()
            }
            TargetResult::NeedsReauth => {
                failed += 1;
                "needs sign-in".to_string()
            }
            TargetResult::NothingToRestore => "nothing to restore".to_string(),
            TargetResult::Skipped(SkipReason::NotEnabled) => "skipped (not enabled)".to_string(),
            TargetResult::Skipped(SkipReason::TooLarge { size, limit }) => format!(
                "skipped ({} over the {} limit)",
                HumanBytes(*size),
                HumanBytes(*limit)
            ),
        };
        println!("  {:<20} {line}", outcome.target);
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} targets failed", outcomes.len());
    }
    Ok(())
}

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{Phase, PipelineError};

/// Run `fut` unless `token` is cancelled first.
///
/// Returns `None` on cancellation; `fut` is dropped at that point.
pub(crate) async fn cancellable<F>(token: &CancellationToken, fut: F) -> Option<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        output = fut => Some(output),
    }
}

/// Like [`cancellable`], mapping cancellation to [`PipelineError::Cancelled`]
/// for `target` in `phase`.
pub(crate) async fn guarded<F>(
    token: &CancellationToken,
    phase: Phase,
    target: &str,
    fut: F,
) -> Result<F::Output, PipelineError>
where
    F: Future,
{
    cancellable(token, fut)
        .await
        .ok_or_else(|| PipelineError::Cancelled {
            phase,
            target: target.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_completes_when_not_cancelled() {
        let token = CancellationToken::new();
        assert_eq!(cancellable(&token, async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn test_cancel_wins_over_ready_future() {
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(cancellable(&token, async { 7 }).await, None);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_future() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            child.cancel();
        });

        let out = cancellable(&token, tokio::time::sleep(Duration::from_secs(30))).await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_guarded_reports_phase() {
        let token = CancellationToken::new();
        token.cancel();
        match guarded(&token, Phase::Cleanup, "web/backup-1", async {}).await {
            Err(PipelineError::Cancelled { phase, target }) => {
                assert_eq!(phase, Phase::Cleanup);
                assert_eq!(target, "web/backup-1");
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }
}

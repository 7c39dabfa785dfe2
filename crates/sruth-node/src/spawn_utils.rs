// Cancellable task spawning, used throughout this crate's long-running
// loops (peer stream tasks, the clearing-house dispatch loop, accept and
// outbound-connection loops) so every one of them logs start/stop
// uniformly and can be torn down with a single `CancellationToken`.

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, Instrument};

#[derive(Debug)]
struct CancelledError {}
impl std::error::Error for CancelledError {}
impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("cancelled")
    }
}

#[track_caller]
pub fn spawn(
    span: tracing::Span,
    fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    let fut = async move {
        trace!("started");
        tokio::pin!(fut);
        let mut trace_interval = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = trace_interval.tick() => {
                    trace!("still running");
                },
                r = &mut fut => {
                    match r {
                        Ok(_) => trace!("finished"),
                        Err(e) => {
                            if e.is::<CancelledError>() {
                                debug!("task cancelled");
                            } else {
                                error!("finished with error: {:#}", e);
                            }
                        }
                    }
                    return;
                }
            }
        }
    }
    .instrument(span);
    tokio::task::spawn(fut)
}

/// Races `fut` against `cancellation_token`. Whichever one of a group of
/// tasks sharing the same token finishes first — successfully, with an
/// error, or because something else already cancelled the token — cancels
/// it for the rest, so one stream failing tears down every task sharing its
/// connection instead of leaving siblings running forever.
#[track_caller]
pub fn spawn_with_cancel(
    span: tracing::Span,
    cancellation_token: CancellationToken,
    fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    spawn(span, async move {
        let result = tokio::select! {
            _ = cancellation_token.cancelled() => Err(CancelledError {}.into()),
            r = fut => r,
        };
        cancellation_token.cancel();
        result
    })
}

use futures_util::StreamExt;
use tokio::time::Instant;

use super::{GatewayStream, RequestOutcome, UsageReconciler};
use crate::gateway::provider::ProviderStream;
use crate::gateway::{GatewayError, TimeoutPhase};

struct ReconciledStreamState {
    upstream: ProviderStream,
    reconciler: Option<UsageReconciler>,
    first_byte_deadline: Instant,
    total_deadline: Instant,
    received_first: bool,
}

impl ReconciledStreamState {
    async fn finish(&mut self, outcome: RequestOutcome) {
        if let Some(reconciler) = self.reconciler.take() {
            reconciler.finalize(outcome).await;
        }
    }
}

/// Forwards provider chunks one at a time while tracking usage.
///
/// Normal end, upstream error and timeout finalize inline. When the consumer drops
/// the stream early, the state (and with it the upstream call) is dropped and the
/// reconciler's own `Drop` reconciles the request as cancelled.
pub(super) fn reconciled_stream(
    upstream: ProviderStream,
    reconciler: UsageReconciler,
    first_byte_deadline: Instant,
    total_deadline: Instant,
) -> GatewayStream {
    let state = ReconciledStreamState {
        upstream,
        reconciler: Some(reconciler),
        first_byte_deadline,
        total_deadline,
        received_first: false,
    };

    futures_util::stream::try_unfold(state, |mut state| async move {
        let (deadline, phase) = if state.received_first {
            (state.total_deadline, TimeoutPhase::Total)
        } else {
            (state.first_byte_deadline, TimeoutPhase::FirstByte)
        };
        match tokio::time::timeout_at(deadline, state.upstream.next()).await {
            Err(_) => {
                tracing::warn!(phase = %phase, "provider stream timed out");
                state.finish(RequestOutcome::TimedOut).await;
                Err(GatewayError::Timeout { phase })
            }
            Ok(Some(Ok(chunk))) => {
                state.received_first = true;
                if let (Some(usage), Some(reconciler)) = (chunk.usage, state.reconciler.as_mut()) {
                    reconciler.observe(usage);
                }
                Ok(Some((chunk, state)))
            }
            Ok(Some(Err(err))) => {
                tracing::warn!(status = err.status_code, error = %err, "provider stream failed");
                state.finish(RequestOutcome::Failed).await;
                Err(err.into())
            }
            Ok(None) => {
                state.finish(RequestOutcome::Completed).await;
                Ok(None)
            }
        }
    })
    .boxed()
}

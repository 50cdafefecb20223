//! Per-batch polling loop.

use std::sync::Arc;

use serde_json::Value;

use crate::http::HttpRequest;
use crate::providers::{PollStatus, Provider};

use super::batch::ActiveBatch;
use super::Engine;

/// Poll one batch until it reaches a terminal state or the engine shuts
/// down. Exactly one poller runs per batch key; requests attaching later
/// only register their handles in the batch's map.
///
/// Poll and fetch failures are treated as transient and retried on the
/// next interval; provider-side expiry bounds how long that can go on.
pub(crate) async fn poll_batch(
    engine: Arc<Engine>,
    provider: Arc<dyn Provider>,
    batch: Arc<ActiveBatch>,
    api_key: String,
) {
    // Deregister the batch on every exit path so a later request with the
    // same fingerprint starts a fresh poller instead of attaching to a
    // finished one. Identity-checked: a rejected attachment may already
    // have installed a replacement batch under the same key.
    let _deregister = scopeguard::guard((engine.clone(), batch.clone()), |(engine, batch)| {
        engine.forget_batch(&batch);
    });

    tracing::debug!(batch = %batch.key, "Poller started");

    loop {
        tokio::select! {
            _ = engine.shutdown_signal().cancelled() => {
                tracing::debug!(
                    batch = %batch.key,
                    last_status = ?batch.last_status(),
                    "Poller stopping on engine shutdown"
                );
                return;
            }
            _ = tokio::time::sleep(engine.poll_interval()) => {}
        }

        let request = HttpRequest::get(batch.poll.url.clone())
            .headers(&batch.poll.headers)
            .internal();

        let payload: Value = match engine.http().execute(request).await {
            Ok(response) if response.is_success() => match response.json() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(batch = %batch.key, error = %e, "Unparseable poll payload");
                    continue;
                }
            },
            Ok(response) => {
                tracing::warn!(
                    batch = %batch.key,
                    status = response.status,
                    "Poll attempt returned an error status"
                );
                continue;
            }
            Err(e) => {
                tracing::warn!(batch = %batch.key, error = %e, "Poll attempt failed");
                continue;
            }
        };

        let status = provider.extract_status(&payload);
        batch.set_status(status.clone());

        let state = match status {
            PollStatus::Pending | PollStatus::Running => {
                tracing::trace!(batch = %batch.key, ?status, "Batch still in progress");
                continue;
            }
            PollStatus::Terminal(state) => state,
        };

        tracing::info!(
            batch = %batch.key,
            state = %state,
            age_secs = (chrono::Utc::now() - batch.created_at).num_seconds(),
            "Batch reached terminal state"
        );
        engine.touch_activity();

        let lines = match provider
            .fetch_results(engine.http(), &batch.key.host, &payload, &api_key)
            .await
        {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!(batch = %batch.key, error = %e, "Fetching results failed, retrying");
                continue;
            }
        };

        // Results are in hand; anything attaching from here on gets a
        // replacement batch instead.
        batch.seal();

        let mut resolved = 0usize;
        for line in &lines {
            match provider.decode_line(line) {
                Ok((custom_id, response)) => {
                    if batch.complete(&custom_id, response) {
                        resolved += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(batch = %batch.key, error = %e, "Skipping undecodable result line");
                }
            }
        }

        tracing::info!(
            batch = %batch.key,
            resolved,
            lines = lines.len(),
            leftover = batch.unresolved(),
            "Processed batch results"
        );

        // Requests the provider never answered get an explicit error
        // naming the terminal state.
        batch.fail_remaining(|| crate::error::BatchlingError::ProviderIncomplete {
            batch_id: batch.key.batch_id.clone(),
            state: state.clone(),
        });

        return;
    }
}

//! `PriceChanged` listener with resubscription

use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::FeedError;
use crate::feed::OnChainFeed;
use crate::shutdown::ShutdownSignal;
use crate::types::Price;

const RESUBSCRIBE_BASE_BACKOFF_SECS: u64 = 1;
const RESUBSCRIBE_MAX_BACKOFF_SECS: u64 = 60;
const RESUBSCRIBE_JITTER_RATIO: f64 = 0.2;

fn backoff_with_jitter(attempt: u32) -> Duration {
    let capped_attempt = attempt.min(16);
    let base = RESUBSCRIBE_BASE_BACKOFF_SECS.saturating_mul(1u64 << capped_attempt);
    let bounded = base.min(RESUBSCRIBE_MAX_BACKOFF_SECS).max(1) as f64;

    let jitter = 1.0 + rand::thread_rng().gen_range(-RESUBSCRIBE_JITTER_RATIO..=RESUBSCRIBE_JITTER_RATIO);
    let millis = (bounded * jitter * 1_000.0)
        .round()
        .clamp(1_000.0, (RESUBSCRIBE_MAX_BACKOFF_SECS * 1_000) as f64);
    Duration::from_millis(millis as u64)
}

/// Sleep before the next subscription attempt; false if shutdown came first
async fn wait_before_resubscribe(attempt: &mut u32, shutdown: &mut ShutdownSignal) -> bool {
    *attempt = attempt.saturating_add(1);
    let delay = backoff_with_jitter(*attempt);
    warn!(
        attempt = *attempt,
        delay_ms = delay.as_millis() as u64,
        "Resubscribing to PriceChanged with exponential backoff + jitter"
    );
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

impl OnChainFeed {
    /// Owns `tx` for its whole life; the output channel closes when this returns.
    pub(crate) async fn run_listener(&self, tx: mpsc::Sender<Price>, mut shutdown: ShutdownSignal) {
        let mut attempt: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                info!("🛑 PriceChanged listener stopped: shutdown");
                return;
            }

            let subscribed = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("🛑 PriceChanged listener stopped: shutdown");
                    return;
                }
                result = self.contract.watch_price_changed() => result,
            };

            let mut subscription = match subscribed {
                Ok(subscription) => {
                    attempt = 0;
                    info!("📡 Listening for PriceChanged events");
                    subscription
                }
                Err(e) => {
                    error!(error = %e, "🔴 Failed to subscribe to PriceChanged");
                    if !wait_before_resubscribe(&mut attempt, &mut shutdown).await {
                        info!("🛑 PriceChanged listener stopped: shutdown");
                        return;
                    }
                    continue;
                }
            };

            let reason = loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        // Dropping the subscription unsubscribes
                        info!("🛑 PriceChanged listener stopped: shutdown");
                        return;
                    }
                    item = subscription.next() => match item {
                        Some(Ok(event)) => {
                            let price = self.apply_event(&event).await;
                            tokio::select! {
                                _ = shutdown.cancelled() => {
                                    info!("🛑 PriceChanged listener stopped: shutdown");
                                    return;
                                }
                                sent = tx.send(price) => {
                                    if sent.is_err() {
                                        info!("🛑 PriceChanged listener stopped: receiver dropped");
                                        return;
                                    }
                                }
                            }
                        }
                        Some(Err(FeedError::Decode(reason))) => {
                            warn!(reason = %reason, "⚠️ Skipping undecodable PriceChanged log");
                        }
                        Some(Err(e)) => break e.to_string(),
                        None => break "event stream closed".to_string(),
                    }
                }
            };

            error!(reason = %reason, "🔴 PriceChanged subscription lost");
            drop(subscription);
            if !wait_before_resubscribe(&mut attempt, &mut shutdown).await {
                info!("🛑 PriceChanged listener stopped: shutdown");
                return;
            }
            debug!(attempt, "Retrying PriceChanged subscription");
        }
    }
}

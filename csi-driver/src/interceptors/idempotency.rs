//! Keyed mutual exclusion with result sharing.
//!
//! The guard admits at most one concurrent execution per fingerprint. The
//! first caller runs the operation; duplicates arriving while it is in
//! flight wait for its result instead of re-executing the side effect, up
//! to the configured timeout. Completed results are retained for the same
//! duration so short-window retries replay the stored answer.
//!
//! Results are shared as their prost encoding, which keeps a single table
//! across RPCs with different response types; each caller decodes into its
//! own type. The fingerprint embeds the RPC name, so a key never maps to
//! two different response types.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, watch};
use tonic::Status;
use tracing::debug;

type Outcome = Result<Vec<u8>, Status>;

enum Slot {
    /// An execution is in flight; duplicates subscribe to the channel.
    Running(watch::Receiver<Option<Outcome>>),
    /// The execution finished; the outcome replays until expiry.
    Done {
        outcome: Outcome,
        expires_at: Instant,
    },
}

enum Claim {
    Run(watch::Sender<Option<Outcome>>),
    Wait(watch::Receiver<Option<Outcome>>),
    Done(Outcome),
}

pub struct IdempotencyGuard {
    /// Wait limit for duplicate callers, and retention for completed
    /// results. Zero waits indefinitely and retains nothing.
    timeout: Duration,
    table: RwLock<HashMap<String, Slot>>,
}

impl IdempotencyGuard {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Execute `op` under the `key` slot, or share the result of the
    /// execution that already holds it.
    pub async fn run<T, F, Fut>(&self, key: &str, op: F) -> Result<T, Status>
    where
        T: prost::Message + Default,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        match self.claim(key).await {
            Claim::Done(outcome) => decode(outcome),
            Claim::Wait(rx) => self.wait(key, rx).await,
            Claim::Run(tx) => {
                let result = op().await;
                let outcome: Outcome = match &result {
                    Ok(resp) => Ok(resp.encode_to_vec()),
                    Err(status) => Err(status.clone()),
                };

                // Publish to the table before notifying waiters, so new
                // arrivals observe the Done entry rather than a stale
                // Running slot.
                {
                    let mut table = self.table.write().await;
                    if self.timeout > Duration::ZERO {
                        table.insert(
                            key.to_string(),
                            Slot::Done {
                                outcome: outcome.clone(),
                                expires_at: Instant::now() + self.timeout,
                            },
                        );
                    } else {
                        table.remove(key);
                    }
                }
                let _ = tx.send(Some(outcome));

                result
            }
        }
    }

    async fn claim(&self, key: &str) -> Claim {
        // Fast path: replay a still-valid completed result under the read
        // lock.
        {
            let table = self.table.read().await;
            if let Some(Slot::Done {
                outcome,
                expires_at,
            }) = table.get(key)
            {
                if *expires_at > Instant::now() {
                    return Claim::Done(outcome.clone());
                }
            }
        }

        let mut table = self.table.write().await;
        let now = Instant::now();
        table.retain(|_, slot| match slot {
            Slot::Done { expires_at, .. } => *expires_at > now,
            Slot::Running(_) => true,
        });

        match table.get(key) {
            Some(Slot::Done { outcome, .. }) => Claim::Done(outcome.clone()),
            Some(Slot::Running(rx)) => Claim::Wait(rx.clone()),
            None => {
                let (tx, rx) = watch::channel(None);
                table.insert(key.to_string(), Slot::Running(rx));
                Claim::Run(tx)
            }
        }
    }

    async fn wait<T>(
        &self,
        key: &str,
        mut rx: watch::Receiver<Option<Outcome>>,
    ) -> Result<T, Status>
    where
        T: prost::Message + Default,
    {
        debug!(key, "waiting for pending operation with same fingerprint");

        let received = if self.timeout > Duration::ZERO {
            match tokio::time::timeout(self.timeout, rx.wait_for(|v| v.is_some())).await {
                Ok(result) => result.map(|value| (*value).clone()),
                Err(_) => {
                    return Err(Status::deadline_exceeded(format!(
                        "timed out waiting for pending operation: {}",
                        key
                    )));
                }
            }
        } else {
            rx.wait_for(|v| v.is_some())
                .await
                .map(|value| (*value).clone())
        };

        match received {
            Ok(Some(outcome)) => decode(outcome),
            // wait_for guarantees a Some value on success.
            Ok(None) => Err(Status::internal("idempotency channel yielded no result")),
            Err(_) => {
                // The owner vanished without publishing (cancelled or
                // panicked). Free the slot so a retry can execute.
                self.release_abandoned(key).await;
                Err(Status::aborted(format!(
                    "pending operation abandoned: {}; retry",
                    key
                )))
            }
        }
    }

    async fn release_abandoned(&self, key: &str) {
        let mut table = self.table.write().await;
        // Only drop the slot when its owner is really gone; a live owner
        // replaces the entry itself on completion.
        let abandoned = matches!(
            table.get(key),
            Some(Slot::Running(rx)) if rx.has_changed().is_err()
        );
        if abandoned {
            table.remove(key);
        }
    }
}

fn decode<T>(outcome: Outcome) -> Result<T, Status>
where
    T: prost::Message + Default,
{
    match outcome {
        Ok(bytes) => T::decode(bytes.as_slice()).map_err(|e| {
            Status::internal(format!("decoding shared idempotent result: {}", e))
        }),
        Err(status) => Err(status),
    }
}

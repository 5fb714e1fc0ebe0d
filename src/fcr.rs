//! FCR Monitor: tracks the chain's fast-finality subprotocol and answers "how deep is
//! this height confirmed?" for the settlement engine and the `/fcr/*` routes.
//!
//! No file in the retrieved corpus implements anything like a consensus-round monitor, so
//! this module's shape is original, grounded only in spec.md §4.6's data model (instance/
//! round/phase, certificates) and the teacher's general async polling conventions (structured
//! tracing spans, a `CancellationToken`-driven loop like `sig_down.rs`). The certificate cache
//! uses the `lru` crate, picked because several repos in the broader example pack
//! (`aptos-labs-aptos-core`, `MystenLabs-sui`) reach for it for exactly this kind of bounded
//! cache.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{RwLock, watch};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::types::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsensusCertificate {
    pub instance: u64,
    pub finalized_height: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct InstanceProgress {
    pub instance: u64,
    pub round: u64,
    pub phase: Phase,
}

#[derive(Debug, Clone, Copy)]
struct InstanceState {
    instance: u64,
    round: u64,
    phase: Phase,
    phase_entered_at: Instant,
    round_zero_entered_at: Instant,
}

/// The subset of the chain's fast-finality RPC surface the monitor polls.
#[async_trait::async_trait]
pub trait ConsensusRpc: Send + Sync {
    async fn get_progress(&self) -> Result<InstanceProgress, FcrError>;
    async fn get_latest_certificate(&self) -> Result<ConsensusCertificate, FcrError>;
    async fn get_certificate(&self, instance: u64) -> Result<Option<ConsensusCertificate>, FcrError>;
    /// The chain head height as seen in the node's local view (GetManifest), used for
    /// the `L1` "included" check — distinct from `finalized_height`, which only advances
    /// once a certificate covers it.
    async fn get_chain_head(&self) -> Result<u64, FcrError>;
}

#[derive(thiserror::Error, Debug)]
pub enum FcrError {
    #[error("consensus rpc error: {0}")]
    Rpc(String),
}

/// Levels in the lattice, in ascending safety order. `L0` is implicit (seen in mempool,
/// no confirmation claimed) and never returned by `evaluate`; it's the floor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    L0,
    L1,
    L2,
    L3,
}

/// Polls the consensus subprotocol and answers confirmation-depth queries for any height.
///
/// `evaluate(height)` is the core query: `L3` once the height is behind a finalized
/// certificate, `L2` once the current instance's progress satisfies the safety heuristic
/// (phase >= COMMIT, or PREPARE at round 0 held for >= `l2_min_elapsed`), `L1` once a
/// height is known included, else `L0`.
pub struct FcrMonitor {
    state: Arc<RwLock<MonitorState>>,
    l2_min_elapsed: Duration,
}

struct MonitorState {
    instance: Option<InstanceState>,
    latest_certificate: Option<ConsensusCertificate>,
    certificates: LruCache<u64, ConsensusCertificate>,
    chain_head: Option<u64>,
}

impl FcrMonitor {
    pub fn new(l2_min_elapsed: Duration) -> Self {
        FcrMonitor {
            state: Arc::new(RwLock::new(MonitorState {
                instance: None,
                latest_certificate: None,
                certificates: LruCache::new(NonZeroUsize::new(100).expect("100 > 0")),
                chain_head: None,
            })),
            l2_min_elapsed,
        }
    }

    /// Runs the poll loop until `cancellation` fires. `tick` is how often `GetProgress`/
    /// `GetLatestCertificate` are polled; `on_update` is notified after each successful poll
    /// so the settlement engine's worker can re-evaluate pending settlements promptly
    /// instead of waiting for its own fixed tick.
    pub async fn run(
        self: Arc<Self>,
        rpc: Arc<dyn ConsensusRpc>,
        tick: Duration,
        cancellation: CancellationToken,
        on_update: watch::Sender<()>,
    ) {
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    tracing::info!("fcr monitor shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(error) = self.poll_once(rpc.as_ref()).await {
                        tracing::warn!(%error, "fcr poll failed");
                        continue;
                    }
                    let _ = on_update.send(());
                }
            }
        }
    }

    #[instrument(skip_all, err)]
    pub(crate) async fn poll_once(&self, rpc: &dyn ConsensusRpc) -> Result<(), FcrError> {
        let progress = rpc.get_progress().await?;
        let certificate = rpc.get_latest_certificate().await?;
        let chain_head = rpc.get_chain_head().await?;

        let mut state = self.state.write().await;
        let now = Instant::now();
        match state.instance {
            Some(existing) if existing.instance == progress.instance => {
                let round_changed = existing.round != progress.round;
                let phase_changed = existing.phase != progress.phase;
                let round_zero_entered_at = if round_changed && progress.round == 0 {
                    now
                } else {
                    existing.round_zero_entered_at
                };
                state.instance = Some(InstanceState {
                    instance: progress.instance,
                    round: progress.round,
                    phase: progress.phase,
                    phase_entered_at: if phase_changed { now } else { existing.phase_entered_at },
                    round_zero_entered_at,
                });
            }
            _ => {
                state.instance = Some(InstanceState {
                    instance: progress.instance,
                    round: progress.round,
                    phase: progress.phase,
                    phase_entered_at: now,
                    round_zero_entered_at: now,
                });
            }
        }
        state.chain_head = Some(state.chain_head.unwrap_or(0).max(chain_head));
        state.certificates.put(certificate.instance, certificate);
        state.latest_certificate = Some(certificate);
        Ok(())
    }

    /// Evaluates the confirmation level of `height`, following spec.md §4.6's five-step
    /// instance-mapping algorithm rather than only inspecting the current instance's
    /// state: a height can be finalized by the latest certificate, finalized by a
    /// certificate already recorded for the current (now-decided) instance, pending the
    /// next instance once the current one is decided but doesn't cover `height`, or
    /// active in the current instance (delegated to the phase evaluator). The monitor
    /// never returns `L0` — that level is reserved for the settlement engine's own
    /// "not yet included in any tipset" bookkeeping, before a height even exists to map.
    pub async fn evaluate(&self, height: u64) -> Level {
        let state = self.state.read().await;

        // Step 1: the latest certificate (any instance) already covers this height.
        if let Some(certificate) = state.latest_certificate {
            if certificate.finalized_height >= height {
                return Level::L3;
            }
        }

        // Step 2: no progress observed yet at all — treat as pending.
        let Some(instance) = state.instance else {
            return Level::L1;
        };

        // Step 3/4: a certificate already published for the current instance. A
        // `finalized_height` of 0 is the not-yet-published sentinel (genesis never needs
        // finalizing), so only a nonzero cached certificate counts as "this instance
        // decided". Step 3: if it covers `height` after all, finalized. Step 4: it
        // decided but didn't reach `height` — the next instance will, so pending (L1).
        if let Some(certificate) = state.certificates.peek(&instance.instance) {
            if certificate.finalized_height > 0 {
                if certificate.finalized_height >= height {
                    return Level::L3;
                }
                return Level::L1;
            }
        }

        // Step 5: the current instance is still active and will cover `height`.
        match instance.phase {
            Phase::Decide => Level::L3,
            Phase::Commit => Level::L2,
            Phase::Prepare if instance.round == 0 && instance.round_zero_entered_at.elapsed() >= self.l2_min_elapsed => {
                Level::L2
            }
            _ => Level::L1,
        }
    }

    pub async fn current_progress(&self) -> Option<InstanceProgress> {
        let state = self.state.read().await;
        state.instance.map(|instance| InstanceProgress {
            instance: instance.instance,
            round: instance.round,
            phase: instance.phase,
        })
    }

    pub async fn latest_certificate(&self) -> Option<ConsensusCertificate> {
        self.state.read().await.latest_certificate
    }

    pub async fn certificate_for_instance(&self, instance: u64) -> Option<ConsensusCertificate> {
        let mut state = self.state.write().await;
        state.certificates.get(&instance).copied()
    }

    /// The highest chain head observed across polls, for status introspection.
    pub async fn current_chain_head(&self) -> Option<u64> {
        self.state.read().await.chain_head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct StubConsensusRpc {
        instance: AtomicU64,
        round: AtomicU64,
        phase: std::sync::Mutex<Phase>,
        finalized_height: AtomicU64,
        chain_head: AtomicU64,
    }

    #[async_trait::async_trait]
    impl ConsensusRpc for StubConsensusRpc {
        async fn get_progress(&self) -> Result<InstanceProgress, FcrError> {
            Ok(InstanceProgress {
                instance: self.instance.load(Ordering::SeqCst),
                round: self.round.load(Ordering::SeqCst),
                phase: *self.phase.lock().unwrap(),
            })
        }
        async fn get_latest_certificate(&self) -> Result<ConsensusCertificate, FcrError> {
            Ok(ConsensusCertificate {
                instance: self.instance.load(Ordering::SeqCst),
                finalized_height: self.finalized_height.load(Ordering::SeqCst),
            })
        }
        async fn get_certificate(&self, instance: u64) -> Result<Option<ConsensusCertificate>, FcrError> {
            Ok(Some(ConsensusCertificate {
                instance,
                finalized_height: self.finalized_height.load(Ordering::SeqCst),
            }))
        }
        async fn get_chain_head(&self) -> Result<u64, FcrError> {
            Ok(self.chain_head.load(Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn l3_once_finalized() {
        let monitor = FcrMonitor::new(Duration::from_secs(5));
        let rpc = StubConsensusRpc {
            instance: AtomicU64::new(1),
            round: AtomicU64::new(0),
            phase: std::sync::Mutex::new(Phase::Decide),
            finalized_height: AtomicU64::new(100),
            chain_head: AtomicU64::new(100),
        };
        monitor.poll_once(&rpc).await.unwrap();
        assert_eq!(monitor.evaluate(50).await, Level::L3);
    }

    #[tokio::test]
    async fn l2_safe_once_commit_phase_reached() {
        let monitor = FcrMonitor::new(Duration::from_secs(5));
        let rpc = StubConsensusRpc {
            instance: AtomicU64::new(1),
            round: AtomicU64::new(0),
            phase: std::sync::Mutex::new(Phase::Commit),
            finalized_height: AtomicU64::new(0),
            chain_head: AtomicU64::new(10),
        };
        monitor.poll_once(&rpc).await.unwrap();
        assert_eq!(monitor.evaluate(10).await, Level::L2);
    }

    #[tokio::test]
    async fn prepare_round_zero_requires_elapsed_window() {
        let monitor = FcrMonitor::new(Duration::from_millis(50));
        let rpc = StubConsensusRpc {
            instance: AtomicU64::new(1),
            round: AtomicU64::new(0),
            phase: std::sync::Mutex::new(Phase::Prepare),
            finalized_height: AtomicU64::new(0),
            chain_head: AtomicU64::new(5),
        };
        monitor.poll_once(&rpc).await.unwrap();
        assert_eq!(monitor.evaluate(5).await, Level::L1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        monitor.poll_once(&rpc).await.unwrap();
        assert_eq!(monitor.evaluate(5).await, Level::L2);
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, warn};
use vellum_store::{DocumentStore, WorkContext};

use crate::api::{ReplicationConfig, ReplicationHandle};
use crate::batch::BatchLimits;
use crate::destinations::load_destinations;
use crate::failure::FailureTracker;
use crate::peer::PeerApi;
use crate::siblings::spawn_sibling_notifications;
use crate::worker::replicate_to_destination;

/// Shared dependencies handed to destination workers.
#[derive(Clone)]
pub(crate) struct EngineContext {
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) work: Arc<WorkContext>,
    pub(crate) peer: PeerApi,
    pub(crate) failures: Arc<FailureTracker>,
    pub(crate) limits: BatchLimits,
}

pub(crate) fn start(
    cfg: ReplicationConfig,
    store: Arc<dyn DocumentStore>,
    work: Arc<WorkContext>,
) -> anyhow::Result<ReplicationHandle> {
    let http = reqwest::Client::builder()
        .timeout(cfg.request_timeout)
        .build()?;
    let peer = PeerApi::new(http, cfg.server_url.clone(), store.storage_id());
    let failures = Arc::new(FailureTracker::new(store.clone()));
    let ctx = EngineContext {
        store,
        work: work.clone(),
        peer,
        failures: failures.clone(),
        limits: BatchLimits {
            max_records: cfg.batch_max_records,
            max_bytes: cfg.batch_max_bytes,
        },
    };

    let scheduler = Scheduler {
        ctx,
        cfg,
        active: HashMap::new(),
        attempt: 0,
        warned_no_destinations: false,
    };
    let join = tokio::spawn(scheduler.run());
    Ok(ReplicationHandle {
        work,
        failures,
        join,
    })
}

/// Data-driven skip policy: the longer a destination has been failing, the
/// fewer data-driven cycles attempt it. Idle cycles ignore this entirely.
pub(crate) fn should_skip(persisted_failures: u64, attempt: u64) -> bool {
    let modulus = match persisted_failures {
        0..=10 => return false,
        11..=100 => 2,
        101..=1000 => 5,
        _ => 10,
    };
    attempt % modulus != 0
}

struct Scheduler {
    ctx: EngineContext,
    cfg: ReplicationConfig,
    active: HashMap<String, Arc<AtomicBool>>,
    attempt: u64,
    warned_no_destinations: bool,
}

impl Scheduler {
    async fn run(mut self) {
        debug!(server = %self.cfg.server_url, "replication scheduler starting");
        spawn_sibling_notifications(&self.ctx);

        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut last_seen = self.ctx.work.work_counter();
        let mut data_driven = false;

        while self.ctx.work.should_continue() {
            while let Some(res) = tasks.try_join_next() {
                if let Err(err) = res {
                    error!(error = %err, "destination worker panicked");
                }
            }
            if let Err(err) = self.run_cycle(data_driven, &mut tasks) {
                // The scheduler never dies on a cycle fault; the next wait
                // gives it a fresh start.
                error!(error = %err, "replication cycle failed");
            }

            let timeout = if data_driven {
                self.cfg.data_poll_interval
            } else {
                self.cfg.idle_poll_interval
            };
            data_driven = self
                .ctx
                .work
                .wait_for_work(timeout, &mut last_seen, "replication")
                .await;
        }

        // Let in-flight workers finish; they observe shutdown at their next step.
        while let Some(res) = tasks.join_next().await {
            if let Err(err) = res {
                error!(error = %err, "destination worker panicked");
            }
        }
        debug!("replication scheduler stopped");
    }

    fn run_cycle(&mut self, data_driven: bool, tasks: &mut JoinSet<()>) -> anyhow::Result<()> {
        let destinations = load_destinations(self.ctx.store.as_ref())?;
        if destinations.is_empty() {
            if !self.warned_no_destinations {
                warn!("no replication destinations configured");
                self.warned_no_destinations = true;
            }
            return Ok(());
        }
        self.warned_no_destinations = false;
        self.attempt = self.attempt.wrapping_add(1);

        for destination in destinations {
            let url = destination.key();
            if data_driven
                && should_skip(self.ctx.failures.persisted_failure_count(&url), self.attempt)
            {
                debug!(destination = %url, "skipped by failure back-off");
                continue;
            }

            let flag = self
                .active
                .entry(url.clone())
                .or_insert_with(|| Arc::new(AtomicBool::new(false)))
                .clone();
            let Some(guard) = BusyGuard::acquire(flag) else {
                debug!(destination = %url, "previous replication still in flight");
                continue;
            };

            let ctx = self.ctx.clone();
            tasks.spawn(async move {
                let _busy = guard;
                if replicate_to_destination(&ctx, &destination).await {
                    // More records may be waiting; wake the scheduler for
                    // another pass.
                    ctx.work.notify_about_work();
                }
            });
        }
        Ok(())
    }
}

/// Holds a destination's busy flag; releases it on every exit path,
/// panics included.
struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    fn acquire(flag: Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
            .then_some(BusyGuard(flag))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use super::{should_skip, BusyGuard};

    #[test]
    fn low_failure_counts_never_skip() {
        for attempt in 1..=20 {
            assert!(!should_skip(0, attempt));
            assert!(!should_skip(10, attempt));
        }
    }

    #[test]
    fn skip_modulus_grows_with_the_failure_count() {
        let attempts = |failures: u64, cycles: u64| -> Vec<u64> {
            (1..=cycles).filter(|a| !should_skip(failures, *a)).collect()
        };

        assert_eq!(attempts(50, 10).len(), 5);
        assert_eq!(attempts(150, 10), vec![5, 10]);
        assert_eq!(attempts(1000, 10), vec![5, 10]);
        assert_eq!(attempts(5000, 30), vec![10, 20, 30]);
    }

    #[test]
    fn busy_flag_transitions_are_matched_pairs() {
        let flag = Arc::new(AtomicBool::new(false));

        let guard = BusyGuard::acquire(flag.clone()).expect("flag was free");
        assert!(BusyGuard::acquire(flag.clone()).is_none());
        drop(guard);

        let again = BusyGuard::acquire(flag.clone()).expect("flag released on drop");
        drop(again);
        assert!(!flag.load(std::sync::atomic::Ordering::SeqCst));
    }
}

//! The broker: the set of all tubes plus the shared id counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;
use crate::journal::Journal;
use crate::tube::{Tube, TubeConfig};
use crate::types::protocol::ServerStats;

#[derive(Clone, Copy, Debug)]
pub struct BrokerConfig {
    pub tube: TubeConfig,
    /// How often the background sweeper visits every tube.
    pub sweep_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            tube: TubeConfig::default(),
            sweep_interval: Duration::from_millis(100),
        }
    }
}

pub struct Broker {
    config: BrokerConfig,
    tubes: Mutex<HashMap<String, Arc<Tube>>>,
    /// Job ids are allocated here, so they are unique across tubes and
    /// deterministic: the first job is always id 1.
    next_id: AtomicU64,
    /// Consumer identities, handed to each connection; reservations are
    /// scoped to the consumer that made them.
    next_client: AtomicU64,
    started: Instant,
    journal: Option<Journal>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            tubes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_client: AtomicU64::new(1),
            started: Instant::now(),
            journal: None,
        }
    }

    /// As `new`, but offers a copy of every committed state transition to
    /// `journal`.
    pub fn with_journal(config: BrokerConfig, journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Returns the named tube, creating it if it doesn't exist yet.
    pub fn tube(&self, name: &str) -> Arc<Tube> {
        let mut tubes = self.tubes.lock();
        if let Some(tube) = tubes.get(name) {
            return Arc::clone(tube);
        }

        debug!(tube = name, "creating tube");
        let tube = Arc::new(Tube::new(
            name,
            self.config.tube,
            self.journal.clone(),
        ));
        tubes.insert(name.to_owned(), Arc::clone(&tube));
        tube
    }

    /// Returns the named tube only if it already exists.
    pub fn lookup(&self, name: &str) -> Option<Arc<Tube>> {
        self.tubes.lock().get(name).cloned()
    }

    /// Creates a job with a fresh id on the named tube.
    pub fn put(
        &self,
        tube: &str,
        pri: i64,
        delay: Duration,
        ttr: Duration,
        data: Bytes,
    ) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tube(tube).put(id, pri, delay, ttr, data)
    }

    /// Finds the tube holding the job with this id, if any. Job-addressed
    /// commands (delete, release, peek, ...) arrive without a tube name,
    /// so this scans the tube set.
    pub fn find(&self, id: u64) -> Option<Arc<Tube>> {
        let tubes: Vec<_> = self.tubes.lock().values().cloned().collect();
        tubes.into_iter().find(|tube| tube.contains(id))
    }

    /// Allocates a fresh consumer identity for a connecting client.
    pub fn client_id(&self) -> u64 {
        self.next_client.fetch_add(1, Ordering::Relaxed)
    }

    /// Releases every reservation held by `client` across all tubes,
    /// returning the number of jobs released. Called when a connection
    /// closes so its in-flight jobs become available immediately instead
    /// of waiting out their TTR.
    pub fn drop_client(&self, client: u64) -> usize {
        let tubes: Vec<_> = self.tubes.lock().values().cloned().collect();
        tubes.iter().map(|tube| tube.release_owned(client)).sum()
    }

    /// Sweeps every tube, returning the total number of jobs moved.
    pub fn sweep(&self) -> usize {
        let tubes: Vec<_> = self.tubes.lock().values().cloned().collect();
        tubes.iter().map(|tube| tube.sweep()).sum()
    }

    pub fn list_tubes(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.tubes.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stats(&self) -> ServerStats {
        let now = Instant::now();
        let tubes: Vec<_> = self.tubes.lock().values().cloned().collect();

        let mut stats = ServerStats {
            current_jobs_urgent: 0,
            current_jobs_ready: 0,
            current_jobs_reserved: 0,
            current_jobs_delayed: 0,
            current_jobs_buried: 0,
            job_timeouts: 0,
            total_jobs: 0,
            current_tubes: tubes.len() as u64,
            current_waiting: 0,
            uptime: now.saturating_duration_since(self.started).as_secs(),
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION"),
        };

        for tube in tubes {
            let t = tube.stats();
            stats.current_jobs_urgent += t.current_jobs_urgent;
            stats.current_jobs_ready += t.current_jobs_ready;
            stats.current_jobs_reserved += t.current_jobs_reserved;
            stats.current_jobs_delayed += t.current_jobs_delayed;
            stats.current_jobs_buried += t.current_jobs_buried;
            stats.job_timeouts += t.job_timeouts;
            stats.total_jobs += t.total_jobs;
            stats.current_waiting += t.current_waiting;
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body() -> Bytes {
        Bytes::from_static(b"body")
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ids_are_sequential_across_tubes() {
        let broker = Broker::new(BrokerConfig::default());

        assert_eq!(
            broker.put("a", 0, secs(0), secs(60), body()).unwrap(),
            1
        );
        assert_eq!(
            broker.put("b", 0, secs(0), secs(60), body()).unwrap(),
            2
        );
        assert_eq!(
            broker.put("a", 0, secs(0), secs(60), body()).unwrap(),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tube_get_or_create() {
        let broker = Broker::new(BrokerConfig::default());

        assert!(broker.lookup("jobs").is_none());
        let t1 = broker.tube("jobs");
        let t2 = broker.tube("jobs");
        assert!(Arc::ptr_eq(&t1, &t2));
        assert!(broker.lookup("jobs").is_some());
        assert_eq!(broker.list_tubes(), ["jobs"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_locates_the_owning_tube() {
        let broker = Broker::new(BrokerConfig::default());
        let id = broker.put("a", 0, secs(0), secs(60), body()).unwrap();
        broker.put("b", 0, secs(0), secs(60), body()).unwrap();

        let tube = broker.find(id).unwrap();
        assert_eq!(tube.name(), "a");
        assert!(broker.find(999).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_client_releases_across_tubes() {
        let broker = Broker::new(BrokerConfig::default());
        let worker = broker.client_id();
        let other = broker.client_id();

        let a1 = broker.put("a", 0, secs(0), secs(60), body()).unwrap();
        let b1 = broker.put("b", 0, secs(0), secs(60), body()).unwrap();
        let b2 = broker.put("b", 0, secs(0), secs(60), body()).unwrap();

        let zero = Some(Duration::ZERO);
        broker.tube("a").reserve(worker, zero).await.unwrap();
        broker.tube("b").reserve(worker, zero).await.unwrap();
        broker.tube("b").reserve(other, zero).await.unwrap();

        // Dropping the worker frees its jobs on both tubes, leaving the
        // other consumer's reservation alone.
        assert_eq!(broker.drop_client(worker), 2);
        assert_eq!(broker.drop_client(worker), 0);

        let state = |tube: &str, id| {
            broker.tube(tube).job_stats(id).unwrap().state.name()
        };
        assert_eq!(state("a", a1), "ready");
        assert_eq!(state("b", b1), "ready");
        assert_eq!(state("b", b2), "reserved");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_aggregate_over_tubes() {
        let broker = Broker::new(BrokerConfig::default());
        broker.put("a", 1, secs(0), secs(60), body()).unwrap();
        broker.put("b", 1, secs(0), secs(60), body()).unwrap();
        broker.put("b", 1, secs(30), secs(60), body()).unwrap();

        let stats = broker.stats();
        assert_eq!(stats.current_tubes, 2);
        assert_eq!(stats.current_jobs_ready, 2);
        assert_eq!(stats.current_jobs_delayed, 1);
        assert_eq!(stats.total_jobs, 3);
        assert_eq!(stats.version, env!("CARGO_PKG_VERSION"));
    }
}

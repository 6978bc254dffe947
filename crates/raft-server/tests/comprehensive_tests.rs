//! # comprehensive cluster tests
//!
//! why: verify replicas agree end to end over a (simulated) network
//! relations: runs raft-server replicas on InMemoryNetwork with raft-core and raft-storage backends
//! what: elections, client requests, dedup, redirects, failover, isolation, restart, shutdown

use raft_core::{
    ClientRequest, ClientResponse, InMemoryStorage, NodeId, NodeState, Operation, RaftConfig,
    RaftError, Storage, Term,
};
use raft_server::{InMemoryNetwork, Replica};
use raft_storage::FileStorage;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

// =============================================================================
// HELPERS
// =============================================================================

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config() -> RaftConfig {
    RaftConfig {
        election_timeout_min: 150,
        election_timeout_max: 300,
        heartbeat_interval: 30,
        rpc_timeout: 100,
        client_timeout: 1000,
        ..RaftConfig::default()
    }
}

fn names(size: usize) -> Vec<NodeId> {
    (1..=size).map(|i| format!("n{i}")).collect()
}

fn request(client: &str, serial: u64, operation: Operation, key: &str, value: &str) -> ClientRequest {
    ClientRequest {
        client_id: client.into(),
        client_serial: serial,
        operation,
        key: key.into(),
        value: value.into(),
    }
}

fn put(client: &str, serial: u64, key: &str, value: &str) -> ClientRequest {
    request(client, serial, Operation::Put, key, value)
}

fn get(client: &str, serial: u64, key: &str) -> ClientRequest {
    request(client, serial, Operation::Get, key, "")
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(20)).await;
    }
}

struct Cluster {
    network: InMemoryNetwork,
    names: Vec<NodeId>,
    replicas: BTreeMap<NodeId, Replica>,
}

impl Cluster {
    fn start(size: usize) -> Self {
        Self::start_with(size, |_| InMemoryStorage::new())
    }

    fn start_with<S: Storage + 'static>(size: usize, mut storage: impl FnMut(&str) -> S) -> Self {
        init_tracing();
        let mut cluster = Self {
            network: InMemoryNetwork::new(),
            names: names(size),
            replicas: BTreeMap::new(),
        };
        for name in cluster.names.clone() {
            let storage = storage(&name);
            cluster.launch(&name, storage);
        }
        cluster
    }

    /// Start (or restart) one replica on the shared network.
    fn launch<S: Storage + 'static>(&mut self, name: &str, storage: S) {
        let peers = self.names.iter().filter(|n| *n != name).cloned().collect();
        let inbox = self.network.register(name);
        let replica = Replica::start(
            name,
            peers,
            test_config(),
            storage,
            Arc::new(self.network.transport(name)),
            inbox,
        )
        .unwrap();
        self.replicas.insert(name.to_string(), replica);
    }

    fn replica(&self, name: &str) -> &Replica {
        &self.replicas[name]
    }

    fn reachable(&self) -> Vec<NodeId> {
        self.names
            .iter()
            .filter(|n| !self.network.is_crashed(n))
            .cloned()
            .collect()
    }

    /// Leader of the highest term among reachable replicas, if any.
    fn current_leader(&self) -> Option<(NodeId, Term)> {
        let reachable = self.reachable();
        let max_term = reachable
            .iter()
            .map(|n| self.replica(n).status().term)
            .max()?;
        reachable.into_iter().find_map(|n| {
            let status = self.replica(&n).status();
            (status.role == NodeState::Leader && status.term == max_term).then_some((n, max_term))
        })
    }

    async fn wait_for_leader(&self) -> NodeId {
        self.wait_for_leader_excluding("").await
    }

    /// Like `wait_for_leader`, ignoring a replica that was shut down while leading.
    async fn wait_for_leader_excluding(&self, excluded: &str) -> NodeId {
        let deadline = Instant::now() + WAIT;
        loop {
            match self.current_leader() {
                Some((leader, _)) if leader != excluded => return leader,
                _ => {}
            }
            assert!(Instant::now() < deadline, "no leader elected");
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Submit like a client would: follow redirects until the request completes.
    async fn submit(&self, request: ClientRequest) -> ClientResponse {
        let deadline = Instant::now() + WAIT;
        let mut attempt = 0;
        let mut target = self.reachable()[0].clone();
        loop {
            assert!(Instant::now() < deadline, "request {request:?} never completed");
            let outcome = self.replica(&target).handle_client_request(request.clone()).await;
            let redirect_to = match outcome {
                Ok(response) if !response.is_redirect() => return response,
                Ok(response) => response.redirect_to,
                // stopped replica
                Err(_) => None,
            };
            attempt += 1;
            target = match redirect_to {
                Some(next) if !self.network.is_crashed(&next) && next != target => next,
                _ => {
                    sleep(Duration::from_millis(50)).await;
                    let reachable = self.reachable();
                    reachable[attempt % reachable.len()].clone()
                }
            };
        }
    }

    fn log_clients(&self, name: &str) -> Vec<String> {
        self.replica(name)
            .read_log()
            .unwrap()
            .into_iter()
            .map(|e| e.command.client_id)
            .collect()
    }

    async fn shutdown(&self) {
        for replica in self.replicas.values() {
            replica.shutdown().await;
        }
    }
}

// =============================================================================
// SECTION 1: LEADER ELECTION
// =============================================================================

mod election {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn elects_exactly_one_leader() {
        let cluster = Cluster::start(3);
        let leader = cluster.wait_for_leader().await;

        eventually("every replica to know the leader", || {
            cluster
                .names
                .iter()
                .all(|n| cluster.replica(n).status().leader.as_ref() == Some(&leader))
        })
        .await;

        let term = cluster.replica(&leader).status().term;
        let leaders_in_term = cluster
            .names
            .iter()
            .map(|n| cluster.replica(n).status())
            .filter(|s| s.role == NodeState::Leader && s.term == term)
            .count();
        assert_eq!(leaders_in_term, 1);
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn healthy_leader_keeps_its_term() {
        let cluster = Cluster::start(3);
        let leader = cluster.wait_for_leader().await;
        let term = cluster.replica(&leader).status().term;

        sleep(Duration::from_secs(1)).await;

        let status = cluster.replica(&leader).status();
        assert_eq!(status.role, NodeState::Leader);
        assert_eq!(status.term, term, "heartbeats should suppress new elections");
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn five_node_cluster_elects_leader() {
        let cluster = Cluster::start(5);
        let leader = cluster.wait_for_leader().await;
        assert!(cluster.names.contains(&leader));
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_node_cluster_leads_itself() {
        let cluster = Cluster::start(1);
        assert_eq!(cluster.wait_for_leader().await, "n1");

        let response = cluster.submit(put("c1", 1, "x", "1")).await;
        assert!(response.successful);
        cluster.shutdown().await;
    }
}

// =============================================================================
// SECTION 2: CLIENT REQUESTS
// =============================================================================

mod client_requests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn put_then_get_reaches_every_replica() {
        let cluster = Cluster::start(3);
        cluster.wait_for_leader().await;

        let put_response = cluster.submit(put("c1", 1, "x", "1")).await;
        let get_response = cluster.submit(get("c1", 2, "x")).await;

        assert!(put_response.successful);
        assert_eq!(put_response.client_serial, 1);
        assert!(get_response.successful);
        assert_eq!(get_response.result, "1");

        eventually("followers to apply the write", || {
            cluster
                .names
                .iter()
                .all(|n| cluster.replica(n).kv_snapshot().get("x").map(String::as_str) == Some("1"))
        })
        .await;
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_key_and_delete() {
        let cluster = Cluster::start(3);
        cluster.wait_for_leader().await;

        let missing = cluster.submit(get("c1", 1, "nope")).await;
        assert!(!missing.successful);
        assert_eq!(missing.result, "");

        cluster.submit(put("c1", 2, "k", "v")).await;
        assert!(cluster.submit(request("c1", 3, Operation::Delete, "k", "")).await.successful);
        assert!(!cluster.submit(request("c1", 4, Operation::Delete, "k", "")).await.successful);
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retried_request_is_answered_from_cache() {
        let cluster = Cluster::start(3);
        let leader = cluster.wait_for_leader().await;

        let first = cluster.submit(put("c1", 1, "x", "1")).await;
        cluster.submit(get("c1", 2, "x")).await;
        let log_len = cluster.replica(&leader).read_log().unwrap().len();

        let retry = cluster.submit(put("c1", 1, "x", "1")).await;

        assert!(first.successful);
        assert!(retry.successful);
        assert_eq!(
            cluster.replica(&leader).read_log().unwrap().len(),
            log_len,
            "a duplicate must not be appended"
        );
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn clients_are_isolated_from_each_other() {
        let cluster = Cluster::start(3);
        cluster.wait_for_leader().await;

        cluster.submit(put("alice", 1, "a", "1")).await;
        let bob = cluster.submit(put("bob", 1, "b", "2")).await;

        assert!(bob.successful);
        let leader = cluster.wait_for_leader().await;
        let data = cluster.replica(&leader).kv_snapshot();
        assert_eq!(data.get("a").map(String::as_str), Some("1"));
        assert_eq!(data.get("b").map(String::as_str), Some("2"));
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn follower_redirects_to_leader() {
        let cluster = Cluster::start(3);
        let leader = cluster.wait_for_leader().await;
        let follower = cluster.names.iter().find(|n| **n != leader).unwrap().clone();
        eventually("follower to learn the leader", || {
            cluster.replica(&follower).status().leader.as_ref() == Some(&leader)
        })
        .await;

        let response = cluster
            .replica(&follower)
            .handle_client_request(put("c1", 1, "x", "1"))
            .await
            .unwrap();

        assert!(response.is_redirect());
        assert_eq!(response.redirect_to.as_ref(), Some(&leader));
        assert!(cluster.replica(&follower).kv_snapshot().is_empty());
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_clients_all_complete() {
        let cluster = Arc::new(Cluster::start(3));
        cluster.wait_for_leader().await;

        let mut tasks = Vec::new();
        for c in 0..8 {
            let cluster = cluster.clone();
            tasks.push(tokio::spawn(async move {
                let client = format!("client-{c}");
                for serial in 1..=5 {
                    let response = cluster.submit(put(&client, serial, &client, &serial.to_string())).await;
                    assert!(response.successful);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let leader = cluster.wait_for_leader().await;
        let data = cluster.replica(&leader).kv_snapshot();
        assert_eq!(data.len(), 8);
        assert!(data.values().all(|v| v == "5"));
        cluster.shutdown().await;
    }
}

// =============================================================================
// SECTION 3: FAILURES
// =============================================================================

mod failures {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn new_leader_after_leader_failure() {
        let cluster = Cluster::start(3);
        let old = cluster.wait_for_leader().await;
        let old_term = cluster.replica(&old).status().term;
        cluster.submit(put("c1", 1, "x", "1")).await;

        cluster.network.crash(&old);
        let new = cluster.wait_for_leader().await;

        assert_ne!(new, old);
        assert!(cluster.replica(&new).status().term > old_term);
        let read = cluster.submit(get("c1", 2, "x")).await;
        assert_eq!(read.result, "1", "committed data survives failover");
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn isolated_leader_loses_uncommitted_tail() {
        let cluster = Cluster::start(3);
        let old = cluster.wait_for_leader().await;
        cluster.submit(put("c1", 1, "a", "1")).await;

        cluster.network.crash(&old);
        let stranded = cluster
            .replica(&old)
            .handle_client_request(put("ghost", 1, "lost", "x"))
            .await
            .unwrap();
        assert!(stranded.is_redirect(), "a minority leader cannot complete writes");
        assert!(cluster.log_clients(&old).contains(&"ghost".to_string()));

        let new = cluster.wait_for_leader().await;
        assert_ne!(new, old);
        cluster.submit(put("c2", 1, "b", "2")).await;

        cluster.network.restore(&old);
        eventually("old leader to converge on the new log", || {
            let ours = cluster.replica(&old).read_log().unwrap();
            let theirs = cluster.replica(&new).read_log().unwrap();
            ours == theirs
        })
        .await;
        eventually("old leader to apply the new entry", || {
            cluster.replica(&old).kv_snapshot().get("b").is_some()
        })
        .await;

        assert_eq!(cluster.replica(&old).status().role, NodeState::Follower);
        assert!(!cluster.log_clients(&old).contains(&"ghost".to_string()));
        assert!(cluster.replica(&old).kv_snapshot().get("lost").is_none());
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn minority_cannot_commit() {
        let cluster = Cluster::start(3);
        let leader = cluster.wait_for_leader().await;
        cluster.submit(put("c1", 1, "x", "1")).await;
        let committed = cluster.replica(&leader).status().commit_index;

        for n in cluster.names.iter().filter(|n| **n != leader) {
            cluster.network.crash(n);
        }
        let response = cluster
            .replica(&leader)
            .handle_client_request(put("c1", 2, "x", "2"))
            .await
            .unwrap();

        assert!(response.is_redirect());
        assert_eq!(cluster.replica(&leader).status().commit_index, committed);
        assert_eq!(
            cluster.replica(&leader).kv_snapshot().get("x").map(String::as_str),
            Some("1")
        );
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deposed_leader_redirects_pending_request_at_once() {
        let cluster = Cluster::start(3);
        let old = cluster.wait_for_leader().await;
        let old_term = cluster.replica(&old).status().term;

        cluster.network.crash(&old);
        let new = cluster.wait_for_leader().await;
        assert_ne!(new, old);
        assert!(cluster.replica(&new).status().term > old_term);
        assert_eq!(cluster.replica(&old).status().role, NodeState::Leader);

        let replica = cluster.replica(&old).clone();
        let started = Instant::now();
        let pending = tokio::spawn(async move {
            let response = replica.handle_client_request(put("c1", 1, "x", "1")).await;
            (response, started.elapsed())
        });
        sleep(Duration::from_millis(100)).await;
        cluster.network.restore(&old);

        let (response, waited) = pending.await.unwrap();
        let response = response.unwrap();
        assert!(response.is_redirect(), "expected a redirect, got {response:?}");
        assert!(
            waited < test_config().client_deadline() / 2,
            "redirect took {waited:?}, should not wait for the client timeout"
        );
        assert_eq!(cluster.replica(&old).status().role, NodeState::Follower);
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn at_most_one_leader_per_term() {
        let cluster = Cluster::start(5);
        let mut leaders: HashMap<Term, HashSet<NodeId>> = HashMap::new();
        let mut crashed: Option<NodeId> = None;
        let start = Instant::now();
        let mut last_fault = Instant::now();

        while start.elapsed() < Duration::from_secs(4) {
            for name in &cluster.names {
                let status = cluster.replica(name).status();
                if status.role == NodeState::Leader {
                    leaders.entry(status.term).or_default().insert(name.clone());
                }
            }
            if last_fault.elapsed() > Duration::from_millis(700) {
                if let Some(previous) = crashed.take() {
                    cluster.network.restore(&previous);
                }
                if let Some((leader, _)) = cluster.current_leader() {
                    cluster.network.crash(&leader);
                    crashed = Some(leader);
                }
                last_fault = Instant::now();
            }
            sleep(Duration::from_millis(10)).await;
        }

        assert!(!leaders.is_empty());
        for (term, who) in &leaders {
            assert_eq!(who.len(), 1, "term {term} had leaders {who:?}");
        }
        cluster.shutdown().await;
    }
}

// =============================================================================
// SECTION 4: DURABILITY AND RESTART
// =============================================================================

mod restart {
    use super::*;

    fn open(root: &Path, name: &str) -> FileStorage {
        FileStorage::open(root.join(name)).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn whole_cluster_restarts_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let terms_before: Vec<Term>;
        {
            let cluster = Cluster::start_with(3, |name| open(dir.path(), name));
            cluster.wait_for_leader().await;
            cluster.submit(put("c1", 1, "x", "1")).await;
            cluster.submit(put("c1", 2, "y", "2")).await;
            terms_before = cluster.names.iter().map(|n| cluster.replica(n).status().term).collect();
            cluster.shutdown().await;
        }

        let cluster = Cluster::start_with(3, |name| open(dir.path(), name));
        for (name, before) in cluster.names.iter().zip(&terms_before) {
            assert!(cluster.replica(name).status().term >= *before, "{name} lost its term");
        }
        cluster.wait_for_leader().await;

        let x = cluster.submit(get("c1", 3, "x")).await;
        let y = cluster.submit(get("c1", 4, "y")).await;
        assert_eq!(x.result, "1");
        assert_eq!(y.result, "2");
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restarted_follower_catches_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = Cluster::start_with(3, |name| open(dir.path(), name));
        let leader = cluster.wait_for_leader().await;
        let follower = cluster.names.iter().find(|n| **n != leader).unwrap().clone();
        cluster.submit(put("c1", 1, "x", "1")).await;

        cluster.replica(&follower).shutdown().await;
        cluster.submit(put("c1", 2, "y", "2")).await;
        cluster.launch(&follower, open(dir.path(), &follower));

        eventually("restarted follower to catch up", || {
            let data = cluster.replica(&follower).kv_snapshot();
            data.get("x").is_some() && data.get("y").is_some()
        })
        .await;
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retry_after_restart_is_not_applied_twice() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cluster = Cluster::start_with(3, |name| open(dir.path(), name));
            cluster.wait_for_leader().await;
            cluster.submit(put("c1", 1, "x", "first")).await;
            cluster.shutdown().await;
        }

        let cluster = Cluster::start_with(3, |name| open(dir.path(), name));
        cluster.wait_for_leader().await;
        cluster.submit(put("c2", 1, "x", "second")).await;
        // c1 retries its old serial; the log replay already executed it
        cluster.submit(put("c1", 1, "x", "first")).await;

        let read = cluster.submit(get("c3", 1, "x")).await;
        assert_eq!(read.result, "second");
        cluster.shutdown().await;
    }
}

// =============================================================================
// SECTION 5: SHUTDOWN
// =============================================================================

mod shutdown {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_request_fails_on_shutdown() {
        let cluster = Cluster::start(3);
        let leader = cluster.wait_for_leader().await;
        cluster.network.crash(&leader);

        let replica = cluster.replica(&leader).clone();
        let pending = tokio::spawn(async move {
            replica.handle_client_request(put("c1", 1, "x", "1")).await
        });
        sleep(Duration::from_millis(100)).await;
        cluster.replica(&leader).shutdown().await;

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(RaftError::Shutdown)));
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_replica_is_unreachable() {
        let cluster = Cluster::start(3);
        let leader = cluster.wait_for_leader().await;
        cluster.replica(&leader).shutdown().await;

        let new = cluster.wait_for_leader_excluding(&leader).await;

        assert_ne!(new, leader);
        cluster.shutdown().await;
    }
}

// =============================================================================
// SECTION 6: STORAGE FAULTS
// =============================================================================

mod storage_faults {
    use super::*;
    use raft_core::{LogEntry, LogIndex};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory storage whose next `budget` log reads fail.
    struct FaultyStorage {
        inner: InMemoryStorage,
        budget: Arc<AtomicUsize>,
    }

    impl FaultyStorage {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let budget = Arc::new(AtomicUsize::new(0));
            let storage = Self {
                inner: InMemoryStorage::new(),
                budget: budget.clone(),
            };
            (storage, budget)
        }
    }

    impl Storage for FaultyStorage {
        fn load_state(&self) -> io::Result<(Term, Option<NodeId>)> {
            self.inner.load_state()
        }

        fn save_state(&mut self, term: Term, voted_for: Option<&NodeId>) -> io::Result<()> {
            self.inner.save_state(term, voted_for)
        }

        fn verify_entry_at(&self, index: LogIndex, term: Term) -> io::Result<bool> {
            self.inner.verify_entry_at(index, term)
        }

        fn last_entry(&self) -> io::Result<Option<(LogIndex, Term)>> {
            self.inner.last_entry()
        }

        fn read_entries(&self, from: LogIndex, to: LogIndex) -> io::Result<Vec<LogEntry>> {
            let spent = self
                .budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if spent.is_ok() {
                return Err(io::Error::new(io::ErrorKind::Other, "read failed"));
            }
            self.inner.read_entries(from, to)
        }

        fn save_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
            self.inner.save_entries(entries)
        }

        // only bulk reads fail
        fn term_at(&self, index: LogIndex) -> io::Result<Option<Term>> {
            self.inner.term_at(index)
        }
    }

    fn faulty_cluster(size: usize) -> (Cluster, HashMap<NodeId, Arc<AtomicUsize>>) {
        let mut budgets = HashMap::new();
        let cluster = Cluster::start_with(size, |name| {
            let (storage, budget) = FaultyStorage::new();
            budgets.insert(name.to_string(), budget);
            storage
        });
        (cluster, budgets)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn leader_survives_transient_read_errors() {
        let (cluster, budgets) = faulty_cluster(3);
        let leader = cluster.wait_for_leader().await;
        cluster.submit(put("c1", 1, "a", "1")).await;
        let term = cluster.replica(&leader).status().term;

        budgets[&leader].store(2, Ordering::SeqCst);
        sleep(Duration::from_millis(1500)).await;

        assert_eq!(budgets[&leader].load(Ordering::SeqCst), 0, "reads should have been retried");
        let status = cluster.replica(&leader).status();
        assert_eq!(status.role, NodeState::Leader);
        assert_eq!(status.term, term, "a failed read must not cost the leadership");

        let response = cluster.submit(put("c1", 2, "b", "2")).await;
        assert!(response.successful);
        eventually("every replica to apply the second write", || {
            cluster
                .names
                .iter()
                .all(|n| cluster.replica(n).kv_snapshot().get("b").map(String::as_str) == Some("2"))
        })
        .await;
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn committed_entry_is_applied_once_reads_recover() {
        let (cluster, budgets) = faulty_cluster(1);
        let leader = cluster.wait_for_leader().await;
        budgets[&leader].store(usize::MAX, Ordering::SeqCst);

        let replica = cluster.replica(&leader).clone();
        let pending = tokio::spawn(async move {
            replica.handle_client_request(put("c1", 1, "x", "1")).await
        });
        eventually("the entry to commit", || {
            cluster.replica(&leader).status().commit_index >= 1
        })
        .await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(cluster.replica(&leader).status().last_applied, 0);

        budgets[&leader].store(0, Ordering::SeqCst);

        let response = pending.await.unwrap().unwrap();
        assert!(!response.is_redirect(), "committed write was answered with {response:?}");
        assert!(response.successful);
        assert_eq!(
            cluster.replica(&leader).kv_snapshot().get("x").map(String::as_str),
            Some("1")
        );
        cluster.shutdown().await;
    }
}

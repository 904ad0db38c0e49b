//! Fan-out/fan-in execution over subsets of a cluster's machines.
//!
//! Every dispatch launches one future per selected id (or per id and worker)
//! eagerly and resolves only when all of them have finished. A failing action
//! does not cancel its siblings: results, successful or not, are handed back to
//! the caller after the join, in selection order. Machines are borrowed for the
//! duration of the call only.

use futures::future::join_all;
use std::collections::BTreeSet;
use std::future::Future;
use tracing::debug;

use crate::domain::cluster::Cluster;
use crate::domain::machine::Machine;
use crate::error::{CoreError, Result};

/// Identifies one worker on one machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerKey {
    pub id: usize,
    pub worker: usize,
}

impl std::fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "machine {} worker {}", self.id, self.worker)
    }
}

fn check_ids(len: usize, ids: &[usize]) -> Result<()> {
    match ids.iter().find(|&&id| id >= len) {
        Some(id) => Err(CoreError::NotFound(format!(
            "machine {} (cluster has {} machines)",
            id, len
        ))),
        None => Ok(()),
    }
}

/// Run `action(machine, id)` concurrently for every id in `ids`.
pub async fn for_each<'a, F, Fut, T>(
    machines: &'a [Machine],
    ids: &[usize],
    action: F,
) -> Result<Vec<(usize, T)>>
where
    F: Fn(&'a Machine, usize) -> Fut,
    Fut: Future<Output = T>,
{
    check_ids(machines.len(), ids)?;
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    debug!(tasks = ids.len(), "Dispatching per-machine tasks");

    let tasks = ids.iter().map(|&id| {
        let fut = action(&machines[id], id);
        async move { (id, fut.await) }
    });
    Ok(join_all(tasks).await)
}

/// Run `action(machine, id, worker)` concurrently `times` times for every id.
pub async fn for_each_multiple<'a, F, Fut, T>(
    machines: &'a [Machine],
    ids: &[usize],
    times: usize,
    action: F,
) -> Result<Vec<(WorkerKey, T)>>
where
    F: Fn(&'a Machine, usize, usize) -> Fut,
    Fut: Future<Output = T>,
{
    check_ids(machines.len(), ids)?;
    if ids.is_empty() || times == 0 {
        return Ok(Vec::new());
    }
    debug!(
        machines = ids.len(),
        workers_per_machine = times,
        "Dispatching per-worker tasks"
    );

    let action = &action;
    let tasks = ids.iter().flat_map(move |&id| {
        (0..times).map(move |worker| {
            let fut = action(&machines[id], id, worker);
            async move { (WorkerKey { id, worker }, fut.await) }
        })
    });
    Ok(join_all(tasks).await)
}

/// Run `action(machine, id)` concurrently with exclusive access to each selected machine.
///
/// Each id must appear at most once; results come back in ascending id order.
pub async fn for_each_mut<'a, F, Fut, T>(
    machines: &'a mut [Machine],
    ids: &[usize],
    action: F,
) -> Result<Vec<(usize, T)>>
where
    F: Fn(&'a mut Machine, usize) -> Fut,
    Fut: Future<Output = T>,
{
    check_ids(machines.len(), ids)?;
    let selected: BTreeSet<usize> = ids.iter().copied().collect();
    if selected.len() != ids.len() {
        return Err(CoreError::invalid("machine ids passed to a mutable fan-out repeat"));
    }
    if selected.is_empty() {
        return Ok(Vec::new());
    }
    debug!(tasks = selected.len(), "Dispatching per-machine mutations");

    let tasks = machines
        .iter_mut()
        .enumerate()
        .filter(|(id, _)| selected.contains(id))
        .map(|(id, machine)| {
            let fut = action(machine, id);
            async move { (id, fut.await) }
        });
    Ok(join_all(tasks).await)
}

impl Cluster {
    /// [`for_each`] over this cluster's machines.
    pub async fn for_each<'a, F, Fut, T>(&'a self, ids: &[usize], action: F) -> Result<Vec<(usize, T)>>
    where
        F: Fn(&'a Machine, usize) -> Fut,
        Fut: Future<Output = T>,
    {
        for_each(&self.machines, ids, action).await
    }

    /// [`for_each_multiple`] over this cluster's machines.
    pub async fn for_each_multiple<'a, F, Fut, T>(
        &'a self,
        ids: &[usize],
        times: usize,
        action: F,
    ) -> Result<Vec<(WorkerKey, T)>>
    where
        F: Fn(&'a Machine, usize, usize) -> Fut,
        Fut: Future<Output = T>,
    {
        for_each_multiple(&self.machines, ids, times, action).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_for_each_invokes_once_per_id() {
        let cluster = Cluster::create("bench", 6);
        let calls = AtomicUsize::new(0);
        let ids = [5, 0, 3];

        let results = cluster
            .for_each(&ids, |_, id| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { id * 10 }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(results, vec![(5, 50), (0, 0), (3, 30)]);
    }

    #[tokio::test]
    async fn test_for_each_empty_returns_immediately() {
        let cluster = Cluster::create("bench", 2);
        let results = cluster
            .for_each(&[], |_, id| async move { id })
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_for_each_rejects_unknown_id_before_running() {
        let cluster = Cluster::create("bench", 2);
        let calls = AtomicUsize::new(0);
        let err = cluster
            .for_each(&[0, 7], |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {}
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_for_each_waits_for_slowest_task() {
        let cluster = Cluster::create("bench", 4);
        let gate = Notify::new();
        let released = AtomicBool::new(false);

        let dispatch = async {
            let results = cluster
                .for_each(&cluster.all_ids(), |_, id| {
                    let gate = &gate;
                    async move {
                        if id == 2 {
                            gate.notified().await;
                        }
                        id
                    }
                })
                .await
                .unwrap();
            assert!(released.load(Ordering::SeqCst));
            results
        };
        let signal = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            released.store(true, Ordering::SeqCst);
            gate.notify_one();
        };

        let (results, ()) = tokio::join!(dispatch, signal);
        assert_eq!(results.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tasks_run_concurrently() {
        let cluster = Cluster::create("bench", 8);
        let start = tokio::time::Instant::now();
        cluster
            .for_each(&cluster.all_ids(), |_, _| {
                tokio::time::sleep(Duration::from_secs(10))
            })
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test]
    async fn test_failure_does_not_cancel_siblings() {
        let cluster = Cluster::create("bench", 3);
        let finished = AtomicUsize::new(0);
        let results = cluster
            .for_each(&cluster.all_ids(), |_, id| {
                let finished = &finished;
                async move {
                    tokio::task::yield_now().await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    if id == 0 {
                        Err("boom")
                    } else {
                        Ok(id)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert_eq!(results.iter().filter(|(_, r)| r.is_err()).count(), 1);
    }

    #[tokio::test]
    async fn test_for_each_multiple_covers_every_pair() {
        let cluster = Cluster::create("bench", 4);
        let ids = [1, 3];
        let results = cluster
            .for_each_multiple(&ids, 3, |_, id, worker| async move { (id, worker) })
            .await
            .unwrap();

        assert_eq!(results.len(), 6);
        let pairs: HashSet<(usize, usize)> = results.iter().map(|(_, pair)| *pair).collect();
        assert_eq!(pairs.len(), 6);
        for id in ids {
            for worker in 0..3 {
                assert!(pairs.contains(&(id, worker)));
            }
        }
        assert!(results
            .iter()
            .all(|(key, (id, worker))| key.id == *id && key.worker == *worker));
    }

    #[tokio::test]
    async fn test_for_each_mut_writes_each_machine_once() {
        let mut cluster = Cluster::create("bench", 4);
        let results = for_each_mut(&mut cluster.machines, &[3, 1], |machine, id| {
            machine.vm_name = Some(format!("bench-{}", id));
            async move { id }
        })
        .await
        .unwrap();

        assert_eq!(results, vec![(1, 1), (3, 3)]);
        assert_eq!(cluster.machines[1].vm_name.as_deref(), Some("bench-1"));
        assert!(cluster.machines[0].vm_name.is_none());

        let err = for_each_mut(&mut cluster.machines, &[2, 2], |_, _| async {})
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }
}

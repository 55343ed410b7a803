//! Control state shared between the pool manager and its workers.
//!
//! The manager is the only writer of `permission`; workers only read it.
//! The ready-to-die queue and the sleep switch implement the quiescence
//! handshake: a worker that observes revoked permission consumes one
//! sentinel, acknowledges it, then sleeps until the manager releases the
//! switch at teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

pub(crate) struct ControlState {
    permission: AtomicBool,
    ready_to_die: ReadyQueue,
    sleep_switch: SleepSwitch,
    pid_registry: Option<PidRegistry>,
}

impl ControlState {
    pub(crate) fn new(track_pids: bool) -> Self {
        ControlState {
            permission: AtomicBool::new(true),
            ready_to_die: ReadyQueue::new(),
            sleep_switch: SleepSwitch::new(),
            pid_registry: track_pids.then(PidRegistry::new),
        }
    }

    pub(crate) fn permission(&self) -> bool {
        self.permission.load(Ordering::SeqCst)
    }

    pub(crate) fn revoke_permission(&self) {
        self.permission.store(false, Ordering::SeqCst);
    }

    pub(crate) fn ready_to_die(&self) -> &ReadyQueue {
        &self.ready_to_die
    }

    pub(crate) fn sleep_switch(&self) -> &SleepSwitch {
        &self.sleep_switch
    }

    pub(crate) fn pid_registry(&self) -> Option<&PidRegistry> {
        self.pid_registry.as_ref()
    }
}

/// A sentinel queue with explicit completion acknowledgement.
///
/// `join` blocks until every sentinel ever `put` has been both consumed and
/// acknowledged via `task_done`.
pub(crate) struct ReadyQueue {
    state: Mutex<ReadyState>,
    cond: Condvar,
}

struct ReadyState {
    /// Sentinels available for consumption.
    sentinels: usize,
    /// Sentinels put but not yet acknowledged.
    outstanding: usize,
}

impl ReadyQueue {
    fn new() -> Self {
        ReadyQueue {
            state: Mutex::new(ReadyState {
                sentinels: 0,
                outstanding: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn put(&self, count: usize) {
        let mut state = self.state.lock().expect("ready queue lock poisoned");
        state.sentinels += count;
        state.outstanding += count;
        self.cond.notify_all();
    }

    /// Consume one sentinel, blocking until one is available.
    pub(crate) fn get(&self) {
        let mut state = self.state.lock().expect("ready queue lock poisoned");
        while state.sentinels == 0 {
            state = self
                .cond
                .wait(state)
                .expect("ready queue lock poisoned");
        }
        state.sentinels -= 1;
    }

    /// Acknowledge one previously consumed sentinel.
    pub(crate) fn task_done(&self) {
        let mut state = self.state.lock().expect("ready queue lock poisoned");
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.outstanding == 0 {
            self.cond.notify_all();
        }
    }

    /// Block until every sentinel has been acknowledged.
    pub(crate) fn join(&self) {
        let mut state = self.state.lock().expect("ready queue lock poisoned");
        while state.outstanding > 0 {
            state = self
                .cond
                .wait(state)
                .expect("ready queue lock poisoned");
        }
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.state
            .lock()
            .expect("ready queue lock poisoned")
            .outstanding
    }
}

/// Parking spot for quiesced workers.
///
/// Workers block in `sleep` until the manager calls `release` during
/// teardown; only then do their threads finish and become joinable.
pub(crate) struct SleepSwitch {
    released: Mutex<bool>,
    cond: Condvar,
}

impl SleepSwitch {
    fn new() -> Self {
        SleepSwitch {
            released: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn sleep(&self) {
        let mut released = self.released.lock().expect("sleep switch lock poisoned");
        while !*released {
            released = self
                .cond
                .wait(released)
                .expect("sleep switch lock poisoned");
        }
    }

    pub(crate) fn release(&self) {
        let mut released = self.released.lock().expect("sleep switch lock poisoned");
        *released = true;
        self.cond.notify_all();
    }
}

/// PIDs of the child processes currently running, keyed by worker name.
///
/// Each worker writes only its own entry; the manager reads the whole map
/// when it has to tear the children down.
pub(crate) struct PidRegistry {
    map: Mutex<HashMap<String, u32>>,
}

impl PidRegistry {
    fn new() -> Self {
        PidRegistry {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn publish(&self, worker: &str, pid: u32) {
        self.map
            .lock()
            .expect("pid registry lock poisoned")
            .insert(worker.to_string(), pid);
    }

    pub(crate) fn remove(&self, worker: &str) {
        self.map
            .lock()
            .expect("pid registry lock poisoned")
            .remove(worker);
    }

    pub(crate) fn snapshot(&self) -> Vec<u32> {
        self.map
            .lock()
            .expect("pid registry lock poisoned")
            .values()
            .copied()
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.map.lock().expect("pid registry lock poisoned").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn ready_queue_join_waits_for_acknowledgement() {
        let queue = Arc::new(ReadyQueue::new());
        queue.put(2);
        assert_eq!(queue.outstanding(), 2);

        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for _ in 0..2 {
                    queue.get();
                    queue.task_done();
                }
            })
        };
        queue.join();
        assert_eq!(queue.outstanding(), 0);
        consumer.join().unwrap();
    }

    #[test]
    fn sleep_switch_parks_until_released() {
        let control = Arc::new(ControlState::new(false));
        let sleeper = {
            let control = Arc::clone(&control);
            std::thread::spawn(move || control.sleep_switch().sleep())
        };
        // The sleeper must still be parked shortly after starting.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!sleeper.is_finished());
        control.sleep_switch().release();
        sleeper.join().unwrap();
    }

    #[test]
    fn pid_registry_tracks_per_worker_entries() {
        let registry = PidRegistry::new();
        registry.publish("crew-0", 100);
        registry.publish("crew-1", 200);
        registry.publish("crew-0", 101);
        let mut pids = registry.snapshot();
        pids.sort_unstable();
        assert_eq!(pids, vec![101, 200]);
        registry.remove("crew-0");
        registry.remove("crew-0");
        registry.remove("crew-1");
        assert!(registry.is_empty());
    }
}

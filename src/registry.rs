//! Shared session bookkeeping.
//!
//! Every session ever admitted keeps its record for the life of the process;
//! finishing a session only stamps `finished_at` and drops it from the active
//! set. All state (records, active set, name counter) sits behind one mutex
//! that is held only for the mutation or copy itself.

use chrono::{DateTime, Local};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Timestamp format used in status rows
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Metadata for one session, active or historical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub name: String,
    pub peer: SocketAddr,
    pub accepted_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
}

impl SessionRecord {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// One padded row of the `status` table.
    pub fn status_row(&self) -> String {
        let finished = self
            .finished_at
            .map(|t| t.format(TIMESTAMP_FORMAT).to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{:<10} {:<19} {:<19} {}",
            self.name,
            self.accepted_at.format(TIMESTAMP_FORMAT),
            finished,
            self.peer
        )
    }
}

/// Header row matching `SessionRecord::status_row`.
pub fn status_header() -> String {
    format!("{:<10} {:<19} {:<19} {}", "CLIENT", "ACCEPTED", "FINISHED", "ADDR")
}

#[derive(Default)]
struct RegistryState {
    /// Records in registration order
    records: Vec<SessionRecord>,
    /// name -> index into `records`
    index: HashMap<String, usize>,
    active: BTreeSet<String>,
    /// Last issued session number
    counter: u64,
}

impl RegistryState {
    fn insert(&mut self, name: &str, peer: SocketAddr) -> bool {
        if self.index.contains_key(name) {
            return false;
        }
        self.index.insert(name.to_string(), self.records.len());
        self.records.push(SessionRecord {
            name: name.to_string(),
            peer,
            accepted_at: Local::now(),
            finished_at: None,
        });
        self.active.insert(name.to_string());
        true
    }
}

/// Thread-safe table of session records.
#[derive(Default)]
pub struct ClientRegistry {
    state: Mutex<RegistryState>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave a half-applied mutation,
    // so a poisoned guard is still usable.
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue the next name and register it in one step.
    pub fn admit(&self, peer: SocketAddr) -> String {
        let mut state = self.lock();
        loop {
            state.counter += 1;
            let name = session_name(state.counter);
            if state.insert(&name, peer) {
                trace!(session = %name, peer = %peer, "Registered session");
                return name;
            }
        }
    }

    /// Add a record for `name`. Returns `false` if the name is already known.
    pub fn register(&self, name: &str, peer: SocketAddr) -> bool {
        self.lock().insert(name, peer)
    }

    /// Stamp `finished_at` and remove `name` from the active set.
    ///
    /// A second call leaves the original finish time untouched.
    pub fn mark_finished(&self, name: &str) {
        let mut state = self.lock();
        state.active.remove(name);
        let idx = state.index.get(name).copied();
        if let Some(idx) = idx {
            let record = &mut state.records[idx];
            if record.finished_at.is_none() {
                record.finished_at = Some(Local::now());
            }
        }
    }

    /// Point-in-time copy of every record, in registration order.
    pub fn snapshot(&self) -> Vec<SessionRecord> {
        self.lock().records.clone()
    }

    /// Point-in-time copy of the active names, sorted.
    pub fn active_names(&self) -> BTreeSet<String> {
        self.lock().active.clone()
    }

    pub fn get(&self, name: &str) -> Option<SessionRecord> {
        let state = self.lock();
        state.index.get(name).map(|&idx| state.records[idx].clone())
    }

    /// Number of records ever registered.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }
}

fn session_name(n: u64) -> String {
    format!("Client{:02}", n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_sequential_names() {
        let registry = ClientRegistry::new();
        assert_eq!(registry.admit(addr(1000)), "Client01");
        assert_eq!(registry.admit(addr(1001)), "Client02");
        assert_eq!(registry.admit(addr(1002)), "Client03");
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_admit_skips_manually_registered_name() {
        let registry = ClientRegistry::new();
        assert!(registry.register("Client01", addr(1000)));
        assert!(!registry.register("Client01", addr(1001)));
        assert_eq!(registry.admit(addr(1002)), "Client02");
        assert_eq!(registry.get("Client01").unwrap().peer, addr(1000));
    }

    #[test]
    fn test_mark_finished_keeps_record() {
        let registry = ClientRegistry::new();
        let a = registry.admit(addr(1000));
        let b = registry.admit(addr(1001));

        registry.mark_finished(&a);

        let active = registry.active_names();
        assert!(!active.contains(&a));
        assert!(active.contains(&b));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, a);
        assert!(snapshot[0].is_finished());
        assert!(!snapshot[1].is_finished());
    }

    #[test]
    fn test_mark_finished_is_idempotent() {
        let registry = ClientRegistry::new();
        let name = registry.admit(addr(1000));
        registry.mark_finished(&name);
        let first = registry.get(&name).unwrap().finished_at;
        registry.mark_finished(&name);
        assert_eq!(registry.get(&name).unwrap().finished_at, first);

        // Unknown names are ignored
        registry.mark_finished("Client99");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_status_rows() {
        let registry = ClientRegistry::new();
        let name = registry.admit(addr(4242));
        let row = registry.get(&name).unwrap().status_row();
        assert!(row.starts_with("Client01   "));
        assert!(row.contains(" - "));
        assert!(row.ends_with("127.0.0.1:4242"));
        assert!(status_header().starts_with("CLIENT     ACCEPTED"));
    }

    #[test]
    fn test_concurrent_admission() {
        let registry = Arc::new(ClientRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let name = registry.admit(addr(2000 + i));
                    registry.mark_finished(&name);
                    name
                })
            })
            .collect();

        let mut names: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 8);
        assert!(registry.active_names().is_empty());
        assert!(registry.snapshot().iter().all(SessionRecord::is_finished));
    }
}

//! The process-level drive point.
//!
//! A [`Breather`] holds every live client and server; calling
//! [`Breather::breathe`] once per host tick drains all of them — every
//! accept, read, and callback happens inside that call, on the calling
//! thread. Facades register themselves at construction and deregister before
//! their own teardown, so a breathe can never reach a half-dead instance.
//!
//! The registry is an explicit value, not a hidden global. Clone it freely;
//! clones share the same roster.

use std::sync::{Arc, Mutex, Weak};

/// One cooperative poll pass. Implemented by client and server contexts.
pub trait Breathe: Send + Sync {
    fn breathe(&self);
}

struct Slot {
    id: u64,
    target: Weak<dyn Breathe>,
}

#[derive(Default)]
struct Roster {
    clients: Vec<Slot>,
    servers: Vec<Slot>,
    next: u64,
}

/// Registry of everything that wants to be driven each tick.
#[derive(Clone, Default)]
pub struct Breather {
    roster: Arc<Mutex<Roster>>,
}

impl Breather {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drives one tick: polls every registered client, then every registered
    /// server, in registration order.
    ///
    /// Targets are collected before any of them runs, so a callback may
    /// create or drop facades (which touch the roster) without deadlocking.
    pub fn breathe(&self) {
        let live: Vec<Arc<dyn Breathe>> = {
            let mut roster = self.roster.lock().unwrap();
            roster.clients.retain(|slot| slot.target.strong_count() > 0);
            roster.servers.retain(|slot| slot.target.strong_count() > 0);
            roster
                .clients
                .iter()
                .chain(roster.servers.iter())
                .filter_map(|slot| slot.target.upgrade())
                .collect()
        };
        for target in live {
            target.breathe();
        }
    }

    /// Number of currently registered instances.
    pub fn registered(&self) -> usize {
        let roster = self.roster.lock().unwrap();
        roster.clients.len() + roster.servers.len()
    }

    pub(crate) fn register_client(&self, target: Weak<dyn Breathe>) -> u64 {
        let mut roster = self.roster.lock().unwrap();
        let id = roster.next;
        roster.next += 1;
        roster.clients.push(Slot { id, target });
        id
    }

    pub(crate) fn register_server(&self, target: Weak<dyn Breathe>) -> u64 {
        let mut roster = self.roster.lock().unwrap();
        let id = roster.next;
        roster.next += 1;
        roster.servers.push(Slot { id, target });
        id
    }

    pub(crate) fn deregister(&self, id: u64) {
        let mut roster = self.roster.lock().unwrap();
        roster.clients.retain(|slot| slot.id != id);
        roster.servers.retain(|slot| slot.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        tag: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Breathe for Probe {
        fn breathe(&self) {
            self.log.lock().unwrap().push(self.tag);
        }
    }

    fn probe(tag: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<Probe> {
        Arc::new(Probe {
            tag,
            log: Arc::clone(log),
        })
    }

    #[test]
    fn clients_run_before_servers_in_registration_order() {
        let breather = Breather::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let s1 = probe("s1", &log);
        let c1 = probe("c1", &log);
        let c2 = probe("c2", &log);

        breather.register_server(Arc::downgrade(&s1) as Weak<dyn Breathe>);
        breather.register_client(Arc::downgrade(&c1) as Weak<dyn Breathe>);
        breather.register_client(Arc::downgrade(&c2) as Weak<dyn Breathe>);

        breather.breathe();
        assert_eq!(*log.lock().unwrap(), vec!["c1", "c2", "s1"]);
    }

    #[test]
    fn deregistered_instances_are_skipped() {
        let breather = Breather::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let c1 = probe("c1", &log);
        let c2 = probe("c2", &log);
        let id1 = breather.register_client(Arc::downgrade(&c1) as Weak<dyn Breathe>);
        breather.register_client(Arc::downgrade(&c2) as Weak<dyn Breathe>);

        breather.deregister(id1);
        breather.breathe();
        assert_eq!(*log.lock().unwrap(), vec!["c2"]);
        assert_eq!(breather.registered(), 1);
    }

    #[test]
    fn dropped_instances_are_pruned() {
        let breather = Breather::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let c1 = probe("c1", &log);
        breather.register_client(Arc::downgrade(&c1) as Weak<dyn Breathe>);
        drop(c1);

        breather.breathe();
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(breather.registered(), 0);
    }
}

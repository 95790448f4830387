//! Console widget bookkeeping and the reuse policy.

use crate::host::{ConsoleHandle, ConsoleReuse, RunKind};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ConsoleSlot {
    handle: ConsoleHandle,
    kind: RunKind,
    owner: String,
}

/// Consoles the manager has handed out, in creation order.
#[derive(Debug, Default)]
pub(crate) struct ConsolePool {
    slots: Vec<ConsoleSlot>,
}

impl ConsolePool {
    /// First console of `kind` whose owning run is no longer tracked.
    ///
    /// `NoReuse` never finds one, so every launch gets a fresh console.
    pub(crate) fn find_idle<F>(
        &self,
        kind: RunKind,
        policy: ConsoleReuse,
        is_tracked: F,
    ) -> Option<ConsoleHandle>
    where
        F: Fn(&str) -> bool,
    {
        if policy == ConsoleReuse::NoReuse {
            return None;
        }
        self.slots
            .iter()
            .find(|slot| slot.kind == kind && !is_tracked(&slot.owner))
            .map(|slot| slot.handle)
    }

    pub(crate) fn insert(&mut self, handle: ConsoleHandle, kind: RunKind, owner: &str) {
        self.slots.push(ConsoleSlot {
            handle,
            kind,
            owner: owner.to_string(),
        });
    }

    /// Move an existing console to a new owner.
    pub(crate) fn assign(&mut self, handle: ConsoleHandle, owner: &str) {
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.handle == handle) {
            slot.owner = owner.to_string();
        }
    }

    /// Forget a console the host closed.
    pub(crate) fn remove(&mut self, handle: ConsoleHandle) -> bool {
        let before = self.slots.len();
        self.slots.retain(|slot| slot.handle != handle);
        self.slots.len() != before
    }

    #[cfg(test)]
    pub(crate) fn owner_of(&self, handle: ConsoleHandle) -> Option<&str> {
        self.slots
            .iter()
            .find(|slot| slot.handle == handle)
            .map(|slot| slot.owner.as_str())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn pool() -> ConsolePool {
        let mut pool = ConsolePool::default();
        pool.insert(ConsoleHandle(1), RunKind::Run, "live-run");
        pool.insert(ConsoleHandle(2), RunKind::Profile, "done-profile");
        pool.insert(ConsoleHandle(3), RunKind::Run, "done-run");
        pool.insert(ConsoleHandle(4), RunKind::Run, "done-run-2");
        pool
    }

    fn tracked(owner: &str) -> bool {
        owner.starts_with("live")
    }

    #[rstest]
    #[case(ConsoleReuse::NoReuse, RunKind::Run, None)]
    #[case(ConsoleReuse::Reuse, RunKind::Run, Some(ConsoleHandle(3)))]
    #[case(ConsoleReuse::ClearAndReuse, RunKind::Run, Some(ConsoleHandle(3)))]
    #[case(ConsoleReuse::Reuse, RunKind::Profile, Some(ConsoleHandle(2)))]
    #[case(ConsoleReuse::ClearAndReuse, RunKind::Debug, None)]
    fn find_idle_follows_policy_and_kind(
        #[case] policy: ConsoleReuse,
        #[case] kind: RunKind,
        #[case] expected: Option<ConsoleHandle>,
    ) {
        assert_eq!(pool().find_idle(kind, policy, tracked), expected);
    }

    #[test]
    fn consoles_of_tracked_runs_are_never_idle() {
        let mut pool = ConsolePool::default();
        pool.insert(ConsoleHandle(7), RunKind::Run, "live-a");
        assert_eq!(pool.find_idle(RunKind::Run, ConsoleReuse::Reuse, tracked), None);
    }

    #[test]
    fn assign_and_remove_update_ownership() {
        let mut pool = pool();
        pool.assign(ConsoleHandle(3), "live-new");
        assert_eq!(pool.owner_of(ConsoleHandle(3)), Some("live-new"));
        assert_eq!(
            pool.find_idle(RunKind::Run, ConsoleReuse::Reuse, tracked),
            Some(ConsoleHandle(4))
        );
        assert!(pool.remove(ConsoleHandle(4)));
        assert!(!pool.remove(ConsoleHandle(4)));
        assert_eq!(pool.find_idle(RunKind::Run, ConsoleReuse::Reuse, tracked), None);
        assert_eq!(pool.len(), 3);
    }
}

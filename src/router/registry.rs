//! Live connections keyed by identifier, one map per role.

use dashmap::DashMap;

use super::classify::Role;
use crate::connection::ConnectionHandle;

/// Host and viewer maps behind one synchronized interface.
///
/// Each operation is atomic on its own. Nothing spans a lookup and the
/// send that follows it: a handle may close in between, and its send then
/// does nothing.
#[derive(Default)]
pub struct Registry {
    hosts: DashMap<String, ConnectionHandle>,
    viewers: DashMap<String, ConnectionHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, role: Role) -> &DashMap<String, ConnectionHandle> {
        match role {
            Role::Host => &self.hosts,
            Role::Viewer => &self.viewers,
        }
    }

    /// Upserts `id`, returning the handle it replaced.
    ///
    /// The replaced handle is only unreferenced, never closed.
    pub fn register(
        &self,
        role: Role,
        id: &str,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        self.map(role).insert(id.to_owned(), handle)
    }

    pub fn lookup(&self, role: Role, id: &str) -> Option<ConnectionHandle> {
        self.map(role).get(id).map(|entry| entry.value().clone())
    }

    /// Removes `id` unconditionally. Removing an absent id is a no-op.
    pub fn remove(&self, role: Role, id: &str) -> Option<ConnectionHandle> {
        self.map(role).remove(id).map(|(_, handle)| handle)
    }

    pub fn len(&self, role: Role) -> usize {
        self.map(role).len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.viewers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Frame, ReadyState};

    #[test]
    fn later_registration_replaces_earlier() {
        let registry = Registry::new();
        let (h1, mut rx1) = ConnectionHandle::open(8);
        let (h2, _rx2) = ConnectionHandle::open(8);

        assert!(registry.register(Role::Host, "A", h1.clone()).is_none());
        let replaced = registry.register(Role::Host, "A", h2.clone()).unwrap();

        assert!(replaced.same_connection(&h1));
        assert!(registry.lookup(Role::Host, "A").unwrap().same_connection(&h2));
        assert_eq!(registry.len(Role::Host), 1);

        // H1 is neither closed nor sent anything by the registry.
        assert_eq!(h1.state(), ReadyState::Open);
        assert!(rx1.try_recv().is_err());
        assert!(h1.send(Frame::Text("still usable".into())));
    }

    #[test]
    fn roles_are_independent_namespaces() {
        let registry = Registry::new();
        let (host, _rx) = ConnectionHandle::open(8);
        let (viewer, _rx2) = ConnectionHandle::open(8);

        registry.register(Role::Host, "same", host.clone());
        registry.register(Role::Viewer, "same", viewer.clone());

        assert!(registry.lookup(Role::Host, "same").unwrap().same_connection(&host));
        assert!(registry.lookup(Role::Viewer, "same").unwrap().same_connection(&viewer));
    }

    #[test]
    fn removal_is_idempotent() {
        let registry = Registry::new();
        let (handle, _rx) = ConnectionHandle::open(8);
        registry.register(Role::Viewer, "cli-1", handle);

        assert!(registry.remove(Role::Viewer, "cli-1").is_some());
        assert!(registry.remove(Role::Viewer, "cli-1").is_none());
        assert!(registry.remove(Role::Viewer, "never-registered").is_none());
        assert!(registry.lookup(Role::Viewer, "cli-1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_register_and_remove() {
        let registry = std::sync::Arc::new(Registry::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let id = format!("{t}-{i}");
                        let (handle, _rx) = ConnectionHandle::open(1);
                        registry.register(Role::Host, &id, handle);
                        assert!(registry.lookup(Role::Host, &id).is_some());
                        if i % 2 == 0 {
                            registry.remove(Role::Host, &id);
                        }
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(registry.len(Role::Host), 8 * 100);
    }
}

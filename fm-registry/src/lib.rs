//! Maps a service name to the ordered list of server instances willing to
//! serve it.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInstance {
    pub service_name: String,
    pub instance_id: String,
    pub server_fd: RawFd,
}

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    by_name: HashMap<String, Vec<ServerInstance>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new entry. Duplicate `(service, instance_id)` pairs,
    /// even on the same `server_fd`, are tolerated rather than rejected:
    /// the single-threaded event loop has no concurrent-register race to
    /// guard against, and a tolerated duplicate is undone by the first
    /// matching `deregister` leaving the second copy alone, which is a
    /// simpler failure mode than rejecting the call outright.
    pub fn register(&mut self, service_name: &str, instance_id: &str, server_fd: RawFd) {
        self.by_name
            .entry(service_name.to_string())
            .or_default()
            .push(ServerInstance {
                service_name: service_name.to_string(),
                instance_id: instance_id.to_string(),
                server_fd,
            });
    }

    /// Removes the first entry matching `(service, instance_id, server_fd)`.
    /// Returns whether an entry was removed.
    pub fn deregister(&mut self, service_name: &str, instance_id: &str, server_fd: RawFd) -> bool {
        let Some(list) = self.by_name.get_mut(service_name) else {
            return false;
        };
        let pos = list
            .iter()
            .position(|s| s.instance_id == instance_id && s.server_fd == server_fd);
        match pos {
            Some(i) => {
                list.remove(i);
                if list.is_empty() {
                    self.by_name.remove(service_name);
                }
                true
            }
            None => false,
        }
    }

    /// The earliest-registered still-live server for `service_name`, if
    /// any. Later revisions may substitute load-aware selection; callers
    /// should only depend on "a live registered server is returned if one
    /// exists".
    pub fn pick(&self, service_name: &str) -> Option<ServerInstance> {
        self.by_name.get(service_name)?.first().cloned()
    }

    /// Removes every entry whose `server_fd == fd`. Called on disconnect.
    pub fn drop_by_fd(&mut self, fd: RawFd) {
        self.by_name.retain(|_, list| {
            list.retain(|s| s.server_fd != fd);
            !list.is_empty()
        });
    }

    #[cfg(test)]
    fn count(&self, service_name: &str) -> usize {
        self.by_name.get(service_name).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_returns_earliest_registered() {
        let mut r = ServiceRegistry::new();
        r.register("svc", "a", 3);
        r.register("svc", "b", 4);
        assert_eq!(r.pick("svc").unwrap().instance_id, "a");
    }

    #[test]
    fn pick_missing_service_is_none() {
        let r = ServiceRegistry::new();
        assert!(r.pick("missing").is_none());
    }

    #[test]
    fn deregister_removes_first_match_only() {
        let mut r = ServiceRegistry::new();
        r.register("svc", "a", 3);
        r.register("svc", "a", 3);
        assert_eq!(r.count("svc"), 2);
        assert!(r.deregister("svc", "a", 3));
        assert_eq!(r.count("svc"), 1);
    }

    #[test]
    fn deregister_unknown_returns_false() {
        let mut r = ServiceRegistry::new();
        assert!(!r.deregister("svc", "a", 3));
    }

    #[test]
    fn drop_by_fd_clears_all_entries_for_fd() {
        let mut r = ServiceRegistry::new();
        r.register("svc1", "a", 3);
        r.register("svc2", "b", 3);
        r.register("svc2", "c", 4);
        r.drop_by_fd(3);
        assert!(r.pick("svc1").is_none());
        assert_eq!(r.pick("svc2").unwrap().instance_id, "c");
    }

    #[test]
    fn duplicate_registration_on_same_fd_is_tolerated() {
        let mut r = ServiceRegistry::new();
        r.register("svc", "a", 3);
        r.register("svc", "a", 3);
        assert_eq!(r.count("svc"), 2);
    }
}

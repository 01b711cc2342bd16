//! Live channel bookkeeping: the channel record itself plus the
//! `fd -> {channel_id}` reverse indices the disconnect path needs.
//!
//! Per the design notes, a device is referenced by a stable index into
//! the FM's device vector, not by aliased ownership, and the
//! connection-to-channels mapping is a reverse index rebuilt from the
//! channel table rather than a second source of truth.

use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedRegion {
    pub device_index: usize,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub channel_id: u64,
    pub client_instance_id: String,
    pub client_fd: RawFd,
    pub server_instance_id: String,
    pub server_fd: RawFd,
    pub service_name: String,
    pub regions: Vec<AllocatedRegion>,
}

/// A channel record before it has been assigned a `channel_id`, i.e. the
/// input to `ChannelTable::insert`.
#[derive(Debug, Clone)]
pub struct NewChannel {
    pub client_instance_id: String,
    pub client_fd: RawFd,
    pub server_instance_id: String,
    pub server_fd: RawFd,
    pub service_name: String,
    pub regions: Vec<AllocatedRegion>,
}

#[derive(Debug, Default)]
pub struct ChannelTable {
    channels: HashMap<u64, Channel>,
    by_fd: HashMap<RawFd, HashSet<u64>>,
    next_id: u64,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a monotonically increasing `channel_id` (wrapping to 0
    /// past `u64::MAX`, with no collision check against still-live
    /// channels — a known limitation carried over from the design this
    /// is modeled on, not fixed here) and records the channel under both
    /// its client and server fd.
    pub fn insert(&mut self, new: NewChannel) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let channel = Channel {
            channel_id: id,
            client_instance_id: new.client_instance_id,
            client_fd: new.client_fd,
            server_instance_id: new.server_instance_id,
            server_fd: new.server_fd,
            service_name: new.service_name,
            regions: new.regions,
        };

        self.by_fd.entry(channel.client_fd).or_default().insert(id);
        self.by_fd.entry(channel.server_fd).or_default().insert(id);
        self.channels.insert(id, channel);
        id
    }

    pub fn lookup(&self, channel_id: u64) -> Option<&Channel> {
        self.channels.get(&channel_id)
    }

    pub fn lookup_mut(&mut self, channel_id: u64) -> Option<&mut Channel> {
        self.channels.get_mut(&channel_id)
    }

    /// Drops the record. The caller is responsible for first freeing
    /// each region on its backing device.
    pub fn remove(&mut self, channel_id: u64) -> Option<Channel> {
        let channel = self.channels.remove(&channel_id)?;
        if let Some(set) = self.by_fd.get_mut(&channel.client_fd) {
            set.remove(&channel_id);
            if set.is_empty() {
                self.by_fd.remove(&channel.client_fd);
            }
        }
        if let Some(set) = self.by_fd.get_mut(&channel.server_fd) {
            set.remove(&channel_id);
            if set.is_empty() {
                self.by_fd.remove(&channel.server_fd);
            }
        }
        Some(channel)
    }

    /// Every live channel naming `fd` as either its client or server
    /// side. Used by the disconnect path to find what needs tearing
    /// down in O(local state).
    pub fn channels_for_fd(&self, fd: RawFd) -> Vec<u64> {
        self.by_fd
            .get(&fd)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(client_fd: RawFd, server_fd: RawFd) -> NewChannel {
        NewChannel {
            client_instance_id: "C1".into(),
            client_fd,
            server_instance_id: "S1".into(),
            server_fd,
            service_name: "svc".into(),
            regions: vec![AllocatedRegion {
                device_index: 0,
                offset: 0,
                size: 256 << 20,
            }],
        }
    }

    #[test]
    fn insert_assigns_increasing_ids() {
        let mut t = ChannelTable::new();
        let a = t.insert(sample(3, 4));
        let b = t.insert(sample(5, 6));
        assert_eq!(a, 0);
        assert_eq!(b, 1);
    }

    #[test]
    fn lookup_after_insert() {
        let mut t = ChannelTable::new();
        let id = t.insert(sample(3, 4));
        assert_eq!(t.lookup(id).unwrap().client_fd, 3);
        assert!(t.lookup(id + 1).is_none());
    }

    #[test]
    fn remove_clears_fd_index() {
        let mut t = ChannelTable::new();
        let id = t.insert(sample(3, 4));
        assert_eq!(t.channels_for_fd(3), vec![id]);
        t.remove(id);
        assert!(t.channels_for_fd(3).is_empty());
        assert!(t.lookup(id).is_none());
    }

    #[test]
    fn remove_twice_is_noop_on_second_call() {
        let mut t = ChannelTable::new();
        let id = t.insert(sample(3, 4));
        assert!(t.remove(id).is_some());
        assert!(t.remove(id).is_none());
    }

    #[test]
    fn channels_for_fd_covers_both_roles() {
        let mut t = ChannelTable::new();
        let id1 = t.insert(sample(3, 4));
        let id2 = t.insert(sample(9, 3));
        let mut for_3 = t.channels_for_fd(3);
        for_3.sort();
        assert_eq!(for_3, vec![id1, id2]);
    }

    #[test]
    fn id_wraps_past_u64_max() {
        let mut t = ChannelTable::new();
        t.next_id = u64::MAX;
        let a = t.insert(sample(1, 2));
        let b = t.insert(sample(1, 2));
        assert_eq!(a, u64::MAX);
        assert_eq!(b, 0);
    }
}

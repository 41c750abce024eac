use crate::expiration::ExpirationTime;
use std::collections::BTreeMap;

/// How an incoming payload combines with an entry already queued at the
/// same expiration time.
pub enum MergePolicy<T> {
    /// Replace the queued payload.
    KeepLatest,
    /// Never merge; every enqueue is its own entry.
    Append,
    /// Merge into the queued payload, or hand the payload back to be
    /// appended as a separate entry.
    Custom(fn(&mut T, T) -> Option<T>),
}

impl<T> Clone for MergePolicy<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for MergePolicy<T> {}

impl<T> Default for MergePolicy<T> {
    fn default() -> Self {
        MergePolicy::KeepLatest
    }
}

/// Pending entries ordered by expiration time, then insertion order.
///
/// The minimum pending time is cached so [`UpdateQueue::min_time`] never
/// walks the entries.
pub struct UpdateQueue<T> {
    entries: BTreeMap<(ExpirationTime, u64), T>,
    next_seq: u64,
    min: ExpirationTime,
    policy: MergePolicy<T>,
}

impl<T> Default for UpdateQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> UpdateQueue<T> {
    pub fn new() -> Self {
        Self::with_policy(MergePolicy::KeepLatest)
    }

    pub fn with_policy(policy: MergePolicy<T>) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
            min: ExpirationTime::DONE,
            policy,
        }
    }

    pub fn enqueue(&mut self, time: ExpirationTime, payload: T) {
        if time.is_done() {
            tracing::trace!("ignoring enqueue at done time");
            return;
        }

        let policy = self.policy;
        let payload = match policy {
            MergePolicy::Append => Some(payload),
            MergePolicy::KeepLatest => match self.last_at_mut(time) {
                Some(existing) => {
                    *existing = payload;
                    None
                }
                None => Some(payload),
            },
            MergePolicy::Custom(merge) => match self.last_at_mut(time) {
                Some(existing) => merge(existing, payload),
                None => Some(payload),
            },
        };

        if let Some(payload) = payload {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.entries.insert((time, seq), payload);
        }
        self.min = self.min.most_urgent(time);
    }

    fn last_at_mut(&mut self, time: ExpirationTime) -> Option<&mut T> {
        self.entries
            .range_mut((time, 0)..=(time, u64::MAX))
            .next_back()
            .map(|(_, payload)| payload)
    }

    /// The most urgent pending time, or `DONE` when empty.
    pub fn min_time(&self) -> ExpirationTime {
        self.min
    }

    /// True when something is pending at or before `time`.
    pub fn has_work_at(&self, time: ExpirationTime) -> bool {
        !self.min.is_done() && self.min <= time
    }

    /// Removes entries at or before `time`, in order, as they are pulled.
    /// Entries not pulled before the iterator is dropped stay queued.
    pub fn drain_up_to(&mut self, time: ExpirationTime) -> DrainUpTo<'_, T> {
        DrainUpTo { queue: self, time }
    }

    /// Entries at or before `time` in order, left in place.
    pub fn iter_up_to(&self, time: ExpirationTime) -> impl Iterator<Item = &T> + '_ {
        self.entries
            .range(..=(time, u64::MAX))
            .map(|(_, payload)| payload)
    }

    /// Drops every entry at exactly `time`. Returns how many were removed.
    pub fn remove(&mut self, time: ExpirationTime) -> usize {
        let keys: Vec<_> = self
            .entries
            .range((time, 0)..=(time, u64::MAX))
            .map(|(key, _)| *key)
            .collect();
        for key in &keys {
            self.entries.remove(key);
        }
        self.refresh_min();
        keys.len()
    }

    /// Drops every entry at `time` or later (less urgent).
    pub fn discard_from(&mut self, time: ExpirationTime) -> usize {
        let dropped = self.entries.split_off(&(time, 0));
        self.refresh_min();
        dropped.len()
    }

    pub fn times(&self) -> impl Iterator<Item = ExpirationTime> + '_ {
        self.entries.keys().map(|(time, _)| *time)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn refresh_min(&mut self) {
        self.min = self
            .entries
            .keys()
            .next()
            .map(|(time, _)| *time)
            .unwrap_or(ExpirationTime::DONE);
    }
}

/// Minimum pending time of an optional queue.
pub fn min_time_of<T>(queue: Option<&UpdateQueue<T>>) -> ExpirationTime {
    queue.map_or(ExpirationTime::DONE, UpdateQueue::min_time)
}

pub struct DrainUpTo<'a, T> {
    queue: &'a mut UpdateQueue<T>,
    time: ExpirationTime,
}

impl<T> Iterator for DrainUpTo<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if !self.queue.has_work_at(self.time) {
            return None;
        }
        let (_, payload) = self.queue.entries.pop_first()?;
        self.queue.refresh_min();
        Some(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(raw: u32) -> ExpirationTime {
        ExpirationTime::from_raw(raw)
    }

    #[test]
    fn empty_queue_is_done() {
        let queue: UpdateQueue<()> = UpdateQueue::new();
        assert_eq!(queue.min_time(), ExpirationTime::DONE);
        assert_eq!(min_time_of::<()>(None), ExpirationTime::DONE);
    }

    #[test]
    fn keep_latest_merges_same_time() {
        let mut queue = UpdateQueue::new();
        queue.enqueue(t(10), "a");
        queue.enqueue(t(10), "b");
        queue.enqueue(t(5), "c");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.min_time(), t(5));
        let drained: Vec<_> = queue.drain_up_to(t(10)).collect();
        assert_eq!(drained, vec!["c", "b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn append_keeps_insertion_order_for_ties() {
        let mut queue = UpdateQueue::with_policy(MergePolicy::Append);
        queue.enqueue(t(7), 1);
        queue.enqueue(t(7), 2);
        queue.enqueue(t(3), 3);
        queue.enqueue(t(9), 4);
        let drained: Vec<_> = queue.drain_up_to(t(7)).collect();
        assert_eq!(drained, vec![3, 1, 2]);
        assert_eq!(queue.min_time(), t(9));
    }

    #[test]
    fn custom_merge_can_refuse() {
        fn sum_small(existing: &mut u32, incoming: u32) -> Option<u32> {
            if *existing + incoming <= 10 {
                *existing += incoming;
                None
            } else {
                Some(incoming)
            }
        }
        let mut queue = UpdateQueue::with_policy(MergePolicy::Custom(sum_small));
        queue.enqueue(t(4), 3);
        queue.enqueue(t(4), 4);
        queue.enqueue(t(4), 9);
        let drained: Vec<_> = queue.drain_up_to(t(4)).collect();
        assert_eq!(drained, vec![7, 9]);
    }

    #[test]
    fn drain_is_lazy() {
        let mut queue = UpdateQueue::with_policy(MergePolicy::Append);
        for raw in [3, 4, 5] {
            queue.enqueue(t(raw), raw);
        }
        {
            let mut drain = queue.drain_up_to(t(5));
            assert_eq!(drain.next(), Some(3));
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.min_time(), t(4));
    }

    #[test]
    fn iter_up_to_leaves_entries_queued() {
        let mut queue = UpdateQueue::with_policy(MergePolicy::Append);
        for raw in [6, 2, 4] {
            queue.enqueue(t(raw), raw);
        }
        let seen: Vec<_> = queue.iter_up_to(t(4)).copied().collect();
        assert_eq!(seen, vec![2, 4]);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.min_time(), t(2));
    }

    #[test]
    fn remove_and_discard() {
        let mut queue = UpdateQueue::with_policy(MergePolicy::Append);
        for raw in [2, 4, 4, 6, 8] {
            queue.enqueue(t(raw), ());
        }
        assert_eq!(queue.remove(t(4)), 2);
        assert_eq!(queue.discard_from(t(6)), 2);
        assert_eq!(queue.times().collect::<Vec<_>>(), vec![t(2)]);
        assert_eq!(queue.remove(t(2)), 1);
        assert_eq!(queue.min_time(), ExpirationTime::DONE);
    }

    #[test]
    fn done_time_is_not_queued() {
        let mut queue = UpdateQueue::new();
        queue.enqueue(ExpirationTime::DONE, ());
        assert!(queue.is_empty());
        assert!(!queue.has_work_at(ExpirationTime::NEVER));
    }
}

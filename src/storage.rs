//! Append-only per-feature history of serialized states.
//!
//! Every feature owns a stream of flat string maps ([`StateMap`]). The current state of a feature
//! is the last entry of its stream; older entries are kept for auditing and are never modified. A
//! feature that was never configured has an empty stream, which is not an error.
//!
//! [`MemoryStorage`] keeps streams in process memory and is mostly useful for tests. Other
//! backends (e.g., a stream-oriented key-value store) implement [`Storage`] outside this crate.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
};

use chrono::Utc;

use crate::{Error, Result};

/// Flat string map a state is serialized into.
pub type StateMap = BTreeMap<String, String>;

/// Identifier assigned to an appended entry. Identifiers are strictly increasing within a
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    /// Wall-clock milliseconds at append time.
    pub millis: u64,
    /// Disambiguates entries appended within the same millisecond.
    pub seq: u64,
}

impl EntryId {
    /// Id for an entry appended after `last`, at `now_millis`.
    fn next(last: Option<EntryId>, now_millis: u64) -> EntryId {
        match last {
            Some(last) if now_millis <= last.millis => EntryId {
                millis: last.millis,
                seq: last.seq + 1,
            },
            _ => EntryId {
                millis: now_millis,
                seq: 0,
            },
        }
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl log::kv::ToValue for EntryId {
    fn to_value(&self) -> log::kv::Value {
        log::kv::Value::from_display(self)
    }
}

/// Backend holding the state history of every feature.
///
/// Implementations must return independent copies: mutating a returned map must not affect
/// stored history.
pub trait Storage: Send + Sync {
    /// Append `entry` to the stream of `feature`, returning its id.
    fn append(&self, feature: &str, entry: StateMap) -> Result<EntryId>;

    /// Entries with ids in `start..=end`, oldest first. `None` leaves that side open.
    fn range(
        &self,
        feature: &str,
        start: Option<EntryId>,
        end: Option<EntryId>,
    ) -> Result<Vec<(EntryId, StateMap)>>;

    /// The most recent entry, or `None` if the stream is empty.
    fn last(&self, feature: &str) -> Result<Option<StateMap>>;

    /// The oldest entry, or `None` if the stream is empty.
    fn first(&self, feature: &str) -> Result<Option<StateMap>>;

    /// Number of entries in the stream.
    fn len(&self, feature: &str) -> Result<usize>;

    /// Returns `true` if nothing was appended for `feature`.
    fn is_empty(&self, feature: &str) -> Result<bool> {
        Ok(self.len(feature)? == 0)
    }

    /// The entry appended as `id`, if any.
    fn get(&self, feature: &str, id: EntryId) -> Result<Option<StateMap>> {
        Ok(self
            .range(feature, Some(id), Some(id))?
            .into_iter()
            .next()
            .map(|(_, entry)| entry))
    }

    /// Snapshot of the whole stream. Entries appended afterwards are not observed.
    fn history(&self, feature: &str) -> Result<StreamIterator> {
        Ok(StreamIterator::new(self.range(feature, None, None)?))
    }
}

/// Iterator over a snapshot of a feature stream.
///
/// The whole stream is loaded when the snapshot is taken, so appends made during iteration are
/// not visible. Cloning is cheap and [`rewind`](Self::rewind) restarts iteration.
#[derive(Debug, Clone)]
pub struct StreamIterator {
    entries: Arc<[(EntryId, StateMap)]>,
    index: usize,
}

impl StreamIterator {
    /// Iterate over `entries`, expected oldest first.
    pub fn new(entries: Vec<(EntryId, StateMap)>) -> StreamIterator {
        StreamIterator {
            entries: entries.into(),
            index: 0,
        }
    }

    /// Restart iteration from the oldest entry.
    pub fn rewind(&mut self) {
        self.index = 0;
    }

    /// All entries of the snapshot along with their ids, regardless of iteration progress.
    pub fn entries(&self) -> &[(EntryId, StateMap)] {
        &self.entries
    }
}

impl Iterator for StreamIterator {
    type Item = StateMap;

    fn next(&mut self) -> Option<StateMap> {
        let (_, entry) = self.entries.get(self.index)?;
        self.index += 1;
        Some(entry.clone())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.entries.len() - self.index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for StreamIterator {}

/// `MemoryStorage` keeps all streams in memory. Everything is lost when the process exits.
///
/// It is `Sync`, so it can be shared between evaluating threads and an operator appending new
/// states.
#[derive(Default)]
pub struct MemoryStorage {
    streams: RwLock<HashMap<String, Vec<(EntryId, StateMap)>>>,
}

impl MemoryStorage {
    /// Create an empty storage.
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    fn read<T>(
        &self,
        feature: &str,
        f: impl FnOnce(&[(EntryId, StateMap)]) -> T,
    ) -> Result<T> {
        let streams = self
            .streams
            .read()
            .map_err(|_| Error::StorageUnavailable("memory storage lock poisoned".to_owned()))?;
        Ok(f(streams.get(feature).map(Vec::as_slice).unwrap_or_default()))
    }
}

impl Storage for MemoryStorage {
    fn append(&self, feature: &str, entry: StateMap) -> Result<EntryId> {
        let now_millis = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);

        let mut streams = self
            .streams
            .write()
            .map_err(|_| Error::StorageUnavailable("memory storage lock poisoned".to_owned()))?;
        let stream = streams.entry(feature.to_owned()).or_default();
        let id = EntryId::next(stream.last().map(|(id, _)| *id), now_millis);
        stream.push((id, entry));
        Ok(id)
    }

    fn range(
        &self,
        feature: &str,
        start: Option<EntryId>,
        end: Option<EntryId>,
    ) -> Result<Vec<(EntryId, StateMap)>> {
        self.read(feature, |stream| {
            stream
                .iter()
                .filter(|(id, _)| start.map_or(true, |start| *id >= start))
                .filter(|(id, _)| end.map_or(true, |end| *id <= end))
                .cloned()
                .collect()
        })
    }

    fn last(&self, feature: &str) -> Result<Option<StateMap>> {
        self.read(feature, |stream| stream.last().map(|(_, entry)| entry.clone()))
    }

    fn first(&self, feature: &str) -> Result<Option<StateMap>> {
        self.read(feature, |stream| stream.first().map(|(_, entry)| entry.clone()))
    }

    fn len(&self, feature: &str) -> Result<usize> {
        self.read(feature, |stream| stream.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{EntryId, MemoryStorage, StateMap, Storage};

    fn entry(value: &str) -> StateMap {
        StateMap::from([("some".to_owned(), value.to_owned())])
    }

    #[test]
    fn unknown_feature_is_an_empty_stream() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.last("unknown").unwrap(), None);
        assert_eq!(storage.first("unknown").unwrap(), None);
        assert_eq!(storage.len("unknown").unwrap(), 0);
        assert!(storage.is_empty("unknown").unwrap());
        assert_eq!(storage.history("unknown").unwrap().count(), 0);
    }

    #[test]
    fn last_and_first() {
        let storage = MemoryStorage::new();
        storage.append("f", entry("one")).unwrap();
        storage.append("f", entry("two")).unwrap();
        storage.append("other", entry("three")).unwrap();

        assert_eq!(storage.first("f").unwrap(), Some(entry("one")));
        assert_eq!(storage.last("f").unwrap(), Some(entry("two")));
        assert_eq!(storage.len("f").unwrap(), 2);
    }

    #[test]
    fn mutating_returned_entry_does_not_change_history() {
        let storage = MemoryStorage::new();
        storage.append("f", entry("serialized_data")).unwrap();

        let mut last = storage.last("f").unwrap().unwrap();
        last.insert("some".to_owned(), "new_data".to_owned());

        assert_eq!(storage.last("f").unwrap(), Some(entry("serialized_data")));
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let storage = MemoryStorage::new();
        let ids: Vec<EntryId> = (0..100)
            .map(|i| storage.append("f", entry(&i.to_string())).unwrap())
            .collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn next_id_bumps_sequence_when_clock_does_not_advance() {
        let last = EntryId { millis: 10, seq: 3 };
        assert_eq!(EntryId::next(Some(last), 10), EntryId { millis: 10, seq: 4 });
        assert_eq!(EntryId::next(Some(last), 9), EntryId { millis: 10, seq: 4 });
        assert_eq!(EntryId::next(Some(last), 11), EntryId { millis: 11, seq: 0 });
        assert_eq!(EntryId::next(None, 5), EntryId { millis: 5, seq: 0 });
        assert_eq!(last.to_string(), "10-3");
    }

    #[test]
    fn range_is_inclusive() {
        let storage = MemoryStorage::new();
        let ids: Vec<EntryId> = (0..5)
            .map(|i| storage.append("f", entry(&i.to_string())).unwrap())
            .collect();

        let middle: Vec<EntryId> = storage
            .range("f", Some(ids[1]), Some(ids[3]))
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(middle, ids[1..=3].to_vec());
        assert_eq!(storage.range("f", None, Some(ids[0])).unwrap().len(), 1);
        assert_eq!(storage.get("f", ids[2]).unwrap(), Some(entry("2")));
    }

    #[test]
    fn snapshot_ignores_later_appends() {
        let storage = MemoryStorage::new();
        for i in 0..4 {
            storage.append("f", entry(&i.to_string())).unwrap();
        }

        let mut history = storage.history("f").unwrap();
        storage.append("f", entry("4")).unwrap();

        let seen: Vec<StateMap> = history.by_ref().collect();
        assert_eq!(seen, (0..4).map(|i| entry(&i.to_string())).collect::<Vec<_>>());

        history.rewind();
        assert_eq!(history.len(), 4);
        assert_eq!(storage.len("f").unwrap(), 5);
    }

    #[test]
    fn can_append_from_another_thread() {
        let storage = Arc::new(MemoryStorage::new());

        {
            let storage = storage.clone();
            let _ = std::thread::spawn(move || {
                storage.append("f", entry("from thread")).unwrap();
            })
            .join();
        }

        assert_eq!(storage.last("f").unwrap(), Some(entry("from thread")));
    }
}

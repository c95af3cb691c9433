use std::collections::BTreeMap as Map;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kind {
    Added,
    Updated,
    Deleted,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Kind::Added => "added",
            Kind::Updated => "updated",
            Kind::Deleted => "deleted",
        })
    }
}

/// A change of one object: `old` is `None` when added, `new` is `None` when deleted (`old` then
/// holds the last known object).
#[derive(Debug)]
pub struct Change<T> {
    pub kind: Kind,
    pub new: Option<Arc<T>>,
    pub old: Option<Arc<T>>,
}

impl<T> Clone for Change<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            new: self.new.clone(),
            old: self.old.clone(),
        }
    }
}

/// Remembers the last successfully processed version of each object, so a worker can turn "this
/// key changed" into a full change triple.
#[derive(Debug)]
pub struct Tracker<K: Ord, T> {
    processed: Map<K, Arc<T>>,
}

impl<K: Ord, T> Default for Tracker<K, T> {
    fn default() -> Self {
        Self {
            processed: Map::new(),
        }
    }
}

impl<K: Ord + Clone, T> Tracker<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The change between the last processed version and `current`, if any.
    pub fn check(&self, key: &K, current: Option<Arc<T>>) -> Option<Change<T>> {
        let old = self.processed.get(key).cloned();

        let kind = match (&old, &current) {
            (None, None) => return None,
            (Some(old), Some(new)) if Arc::ptr_eq(old, new) => return None,
            (None, Some(_)) => Kind::Added,
            (Some(_), Some(_)) => Kind::Updated,
            (Some(_), None) => Kind::Deleted,
        };

        Some(Change {
            kind,
            new: current,
            old,
        })
    }

    /// Records a change as processed.
    pub fn done(&mut self, key: &K, change: &Change<T>) {
        match change.new {
            Some(ref new) => {
                self.processed.insert(key.clone(), new.clone());
            }
            None => {
                self.processed.remove(key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }
}

// Copyright 2026 cachetable Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use cachetable_common::strict_assert;
use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListAtomicLink};

use crate::{code::Value, entry::Entry};

intrusive_adapter! { ClockAdapter<V> = Arc<Entry<V>>: Entry<V> { link => LinkedListAtomicLink } where V: Value }

/// Clock ring over all resident entries.
///
/// The front of the list is the clock hand. Victim selection is deterministic: the hand visits entries in insertion
/// order, and each visit of an entry with a positive clock count only decrements it (second chance).
pub(crate) struct Clock<V>
where
    V: Value,
{
    list: LinkedList<ClockAdapter<V>>,
    len: usize,
}

impl<V> Clock<V>
where
    V: Value,
{
    pub(crate) fn new() -> Self {
        Self {
            list: LinkedList::new(ClockAdapter::new()),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Insert a new entry just behind the hand.
    pub(crate) fn push(&mut self, entry: Arc<Entry<V>>) {
        strict_assert!(!entry.link.is_linked());
        self.list.push_back(entry);
        self.len += 1;
    }

    pub(crate) fn remove(&mut self, entry: &Entry<V>) -> Option<Arc<Entry<V>>> {
        if !entry.link.is_linked() {
            return None;
        }
        let removed = unsafe { self.list.cursor_mut_from_ptr(entry) }.remove();
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Return the entry under the hand and move the hand past it.
    pub(crate) fn advance(&mut self) -> Option<Arc<Entry<V>>> {
        let entry = self.list.pop_front()?;
        self.list.push_back(entry.clone());
        Some(entry)
    }

    /// All entries, starting at the hand.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Entry<V>>> {
        let mut entries = Vec::with_capacity(self.len);
        let mut cursor = self.list.front();
        while let Some(entry) = cursor.clone_pointer() {
            entries.push(entry);
            cursor.move_next();
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        code::BlockId,
        file::{FileRegistry, NoopFileNotify},
        test_utils::{TestBlock, TestCallbacks},
    };

    #[test]
    fn test_clock_advance_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(0);
        let file = registry.open(&dir.path().join("a"), Arc::new(NoopFileNotify)).unwrap();
        let callbacks = Arc::new(TestCallbacks::new(1));

        let entries = (0..3)
            .map(|i| {
                Arc::new(Entry::<TestBlock>::placeholder(
                    BlockId(i),
                    i as u32,
                    file.shared().clone(),
                    callbacks.clone(),
                ))
            })
            .collect::<Vec<_>>();

        let mut clock = Clock::new();
        for entry in &entries {
            clock.push(entry.clone());
        }
        assert_eq!(clock.len(), 3);

        let keys = |clock: &Clock<TestBlock>| clock.snapshot().iter().map(|e| e.key().0).collect::<Vec<_>>();

        assert_eq!(clock.advance().unwrap().key(), BlockId(0));
        assert_eq!(keys(&clock), vec![1, 2, 0]);

        assert!(clock.remove(&entries[2]).is_some());
        assert!(clock.remove(&entries[2]).is_none());
        assert!(!entries[2].link.is_linked());
        assert_eq!(keys(&clock), vec![1, 0]);
        assert_eq!(clock.len(), 2);
    }
}

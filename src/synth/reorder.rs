//! Re-sequencing of out-of-order completions

use std::collections::HashMap;

use thiserror::Error;

/// Rejected insertion into a [`ReorderBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReorderError {
    /// Index was already released
    #[error("index {index} already released (cursor at {cursor})")]
    AlreadyReleased {
        /// Offending index
        index: u64,
        /// Current release cursor
        cursor: u64,
    },

    /// Index is already held
    #[error("index {0} already held")]
    Duplicate(u64),
}

/// Holds completed items until they can be released in index order.
///
/// Invariants: the cursor only advances, and `held` never contains an
/// index below the cursor.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    held: HashMap<u64, T>,
    cursor: u64,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReorderBuffer<T> {
    /// Create an empty buffer expecting index 0 first
    #[must_use]
    pub fn new() -> Self {
        Self {
            held: HashMap::new(),
            cursor: 0,
        }
    }

    /// Store a completed item.
    ///
    /// # Errors
    ///
    /// Rejects indices below the cursor and indices already held; the item
    /// is dropped in that case.
    pub fn insert(&mut self, index: u64, item: T) -> Result<(), ReorderError> {
        if index < self.cursor {
            return Err(ReorderError::AlreadyReleased {
                index,
                cursor: self.cursor,
            });
        }
        if self.held.contains_key(&index) {
            return Err(ReorderError::Duplicate(index));
        }

        self.held.insert(index, item);
        Ok(())
    }

    /// Release the item at the cursor, if it has completed
    pub fn pop_ready(&mut self) -> Option<(u64, T)> {
        let item = self.held.remove(&self.cursor)?;
        let index = self.cursor;
        self.cursor += 1;
        Some((index, item))
    }

    /// Release the longest contiguous run starting at the cursor
    pub fn drain_ready(&mut self) -> impl Iterator<Item = (u64, T)> + '_ {
        std::iter::from_fn(move || self.pop_ready())
    }

    /// Next index to be released
    #[must_use]
    pub const fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Number of completed items waiting on an earlier index
    #[must_use]
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Whether nothing is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

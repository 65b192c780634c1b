//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Crymap.
//
// Crymap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Crymap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Crymap. If not, see <http://www.gnu.org/licenses/>.

//! Durable storage of change records.
//!
//! Stores are keyed by `(account, state)` and never modify a record once it
//! is appended. The general guidelines are:
//!
//! 1. Every operation is atomic unless otherwise noted.
//! 2. Scans are lazy and read the underlying storage a page at a time, so a
//!    reader that stops early never pays for the rest of the history.
//! 3. The store is the arbiter of per-account order: a record is only
//!    accepted if its state follows every state already stored for its
//!    account.

use std::collections::VecDeque;
use std::ops::Bound;

use chrono::prelude::*;

use super::model::*;
use crate::support::error::Error;

mod migrations;
pub mod memory;
pub mod partition;
pub mod sqlite;
mod types;

pub use self::memory::MemoryChangeStore;
pub use self::partition::{PartitionFactory, PartitionedStore};
pub use self::sqlite::{SqliteChangeStore, SqlitePartitions};

/// A lazily-evaluated scan over change records in ascending state order.
pub type RecordStream<I> =
    Box<dyn Iterator<Item = Result<ChangeRecord<I>, Error>> + Send>;

/// The storage operations the change repository depends on.
pub trait ChangeStore<I: ObjectId>: Send + Sync {
    /// Appends `record` to the history of its account.
    ///
    /// Fails with `Error::StateConflict` if the account already has a record
    /// whose state is equal to or greater than `record.state`.
    fn append(&self, record: &ChangeRecord<I>) -> Result<(), Error>;

    /// Scans the records of `account` whose state is at least `from`, in
    /// ascending state order.
    fn scan_from(
        &self,
        account: &AccountId,
        from: State,
    ) -> Result<RecordStream<I>, Error>;

    /// Scans every record of `account` in ascending state order.
    fn scan_all(&self, account: &AccountId) -> Result<RecordStream<I>, Error> {
        self.scan_from(account, State::INITIAL)
    }

    /// Returns the greatest state stored for `account`, only considering
    /// shared records if `include_shared` is true.
    fn latest(
        &self,
        account: &AccountId,
        include_shared: bool,
    ) -> Result<Option<State>, Error>;

    /// Removes every record (of any account) dated before `cutoff`.
    ///
    /// Returns the number of records removed.
    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, Error>;
}

/// Reads up to `limit` records starting at the given lower bound.
type PageFetch<I> = Box<
    dyn FnMut(Bound<State>, usize) -> Result<Vec<ChangeRecord<I>>, Error>
        + Send,
>;

/// Iterator over a store which pulls records a page at a time.
///
/// Each page resumes strictly after the last state of the previous page, so
/// records appended while the scan is in progress may or may not be seen,
/// but no record is ever returned twice or out of order.
struct PagedScan<I> {
    fetch: PageFetch<I>,
    from: State,
    after: Option<State>,
    page: VecDeque<ChangeRecord<I>>,
    page_size: usize,
    exhausted: bool,
}

impl<I: ObjectId> PagedScan<I> {
    fn stream(
        from: State,
        page_size: usize,
        fetch: impl FnMut(
                Bound<State>,
                usize,
            ) -> Result<Vec<ChangeRecord<I>>, Error>
            + Send
            + 'static,
    ) -> RecordStream<I> {
        Box::new(Self {
            fetch: Box::new(fetch),
            from,
            after: None,
            page: VecDeque::new(),
            page_size: page_size.max(1),
            exhausted: false,
        })
    }
}

impl<I: ObjectId> Iterator for PagedScan<I> {
    type Item = Result<ChangeRecord<I>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(record) = self.page.pop_front() {
            return Some(Ok(record));
        }

        if self.exhausted {
            return None;
        }

        let lower = match self.after {
            Some(after) => Bound::Excluded(after),
            None => Bound::Included(self.from),
        };

        match (self.fetch)(lower, self.page_size) {
            Ok(page) => {
                self.exhausted = page.len() < self.page_size;
                self.page = page.into();
                if let Some(last) = self.page.back() {
                    self.after = Some(last.state);
                }
                self.page.pop_front().map(Ok)
            }
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
        }
    }
}

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

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use chrono::prelude::*;
use log::warn;

use super::{ChangeStore, PagedScan, RecordStream};
use crate::changes::model::*;
use crate::support::error::Error;

type History<I> = BTreeMap<State, ChangeRecord<I>>;

/// A change store which keeps everything in memory.
///
/// This is the reference implementation of `ChangeStore`, used in tests and
/// for ephemeral setups. Clones share the same underlying data.
#[derive(Clone)]
pub struct MemoryChangeStore<I> {
    accounts: Arc<RwLock<BTreeMap<AccountId, History<I>>>>,
    page_size: usize,
}

impl<I: ObjectId> Default for MemoryChangeStore<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: ObjectId> MemoryChangeStore<I> {
    pub fn new() -> Self {
        Self::with_page_size(64)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            accounts: Arc::new(RwLock::new(BTreeMap::new())),
            page_size,
        }
    }

    /// The total number of records held, across all accounts.
    pub fn len(&self) -> usize {
        self.accounts
            .read()
            .unwrap()
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        0 == self.len()
    }
}

impl<I: ObjectId> ChangeStore<I> for MemoryChangeStore<I> {
    fn append(&self, record: &ChangeRecord<I>) -> Result<(), Error> {
        let mut accounts = self.accounts.write().unwrap();
        let history = accounts.entry(record.account_id.clone()).or_default();

        let latest =
            history.keys().next_back().copied().unwrap_or(State::INITIAL);
        if record.state <= latest {
            warn!(
                "Rejecting {} change {} for {}: latest is {}",
                I::FAMILY,
                record.state,
                record.account_id,
                latest,
            );
            return Err(Error::StateConflict(record.state));
        }

        history.insert(record.state, record.clone());
        Ok(())
    }

    fn scan_from(
        &self,
        account: &AccountId,
        from: State,
    ) -> Result<RecordStream<I>, Error> {
        let accounts = Arc::clone(&self.accounts);
        let account = account.clone();
        Ok(PagedScan::stream(from, self.page_size, move |lower, limit| {
            Ok(accounts
                .read()
                .unwrap()
                .get(&account)
                .map(|history| {
                    history
                        .range((lower, Bound::Unbounded))
                        .take(limit)
                        .map(|(_, record)| record.clone())
                        .collect()
                })
                .unwrap_or_default())
        }))
    }

    fn latest(
        &self,
        account: &AccountId,
        include_shared: bool,
    ) -> Result<Option<State>, Error> {
        Ok(self.accounts.read().unwrap().get(account).and_then(|history| {
            history
                .values()
                .rev()
                .find(|record| include_shared || !record.is_shared)
                .map(|record| record.state)
        }))
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, Error> {
        let mut accounts = self.accounts.write().unwrap();
        let mut purged = 0;
        for history in accounts.values_mut() {
            let before = history.len();
            history.retain(|_, record| record.date >= cutoff);
            purged += before - history.len();
        }
        accounts.retain(|_, history| !history.is_empty());
        Ok(purged)
    }
}

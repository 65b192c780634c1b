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

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::prelude::*;
use log::{info, warn};

use super::{ChangeStore, RecordStream};
use crate::changes::model::*;
use crate::support::{error::Error, safe_name::is_safe_partition_name};

/// Opens the underlying store of each partition of a `PartitionedStore`.
pub trait PartitionFactory<S>: Send + Sync {
    /// Opens the named partition, creating its storage if it does not exist
    /// yet.
    fn create(&self, partition: &str) -> Result<S, Error>;

    /// Opens the named partition only if its storage already exists.
    fn open_existing(&self, partition: &str) -> Result<Option<S>, Error>;

    /// Lists the names of all partitions whose storage exists.
    fn existing(&self) -> Result<Vec<String>, Error>;
}

/// A bare closure creates partitions but never finds existing ones, which
/// suits stores that do not outlive the process.
impl<S, F> PartitionFactory<S> for F
where
    F: Fn(&str) -> Result<S, Error> + Send + Sync,
{
    fn create(&self, partition: &str) -> Result<S, Error> {
        self(partition)
    }

    fn open_existing(&self, _: &str) -> Result<Option<S>, Error> {
        Ok(None)
    }

    fn existing(&self) -> Result<Vec<String>, Error> {
        Ok(Vec::new())
    }
}

/// A change store which routes each account to a separate underlying store
/// chosen by the account's partition (its domain, or `LOCAL_PARTITION`).
///
/// Underlying stores are opened through `factory` the first time an account
/// in their partition is accessed and are kept open from then on. Only
/// writes create a partition; reading an account whose partition has no
/// storage sees an empty history.
pub struct PartitionedStore<S, F> {
    factory: F,
    partitions: Mutex<HashMap<String, Arc<S>>>,
}

impl<S, F: PartitionFactory<S>> PartitionedStore<S, F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            partitions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the names of the partitions opened so far, sorted.
    pub fn open_partitions(&self) -> Vec<String> {
        let mut names = self
            .partitions
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    fn partition_name(account: &AccountId) -> Result<String, Error> {
        let name = account.partition();
        if !is_safe_partition_name(&name) {
            warn!("Refusing unsafe partition name for account {account}");
            return Err(Error::UnsafeName);
        }

        Ok(name)
    }

    fn writable(&self, account: &AccountId) -> Result<Arc<S>, Error> {
        let name = Self::partition_name(account)?;
        if let Some(store) = self.cached(&name) {
            return Ok(store);
        }

        let store = self.factory.create(&name)?;
        Ok(self.insert(name, store))
    }

    fn readable(&self, account: &AccountId) -> Result<Option<Arc<S>>, Error> {
        self.open_existing(Self::partition_name(account)?)
    }

    fn open_existing(&self, name: String) -> Result<Option<Arc<S>>, Error> {
        if let Some(store) = self.cached(&name) {
            return Ok(Some(store));
        }

        Ok(self
            .factory
            .open_existing(&name)?
            .map(|store| self.insert(name, store)))
    }

    fn cached(&self, name: &str) -> Option<Arc<S>> {
        self.partitions.lock().unwrap().get(name).cloned()
    }

    /// Adds a freshly opened store to the map, unless another thread got
    /// there first, in which case `store` is dropped in favour of the one
    /// already present.
    fn insert(&self, name: String, store: S) -> Arc<S> {
        let mut partitions = self.partitions.lock().unwrap();
        let store = partitions.entry(name).or_insert_with_key(|name| {
            info!("Opened change partition {name}");
            Arc::new(store)
        });
        Arc::clone(store)
    }

    fn all_partitions(&self) -> Vec<Arc<S>> {
        self.partitions
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect()
    }
}

impl<I, S, F> ChangeStore<I> for PartitionedStore<S, F>
where
    I: ObjectId,
    S: ChangeStore<I>,
    F: PartitionFactory<S>,
{
    fn append(&self, record: &ChangeRecord<I>) -> Result<(), Error> {
        self.writable(&record.account_id)?.append(record)
    }

    fn scan_from(
        &self,
        account: &AccountId,
        from: State,
    ) -> Result<RecordStream<I>, Error> {
        match self.readable(account)? {
            Some(store) => store.scan_from(account, from),
            None => Ok(Box::new(
                std::iter::empty::<Result<ChangeRecord<I>, Error>>(),
            )),
        }
    }

    fn latest(
        &self,
        account: &AccountId,
        include_shared: bool,
    ) -> Result<Option<State>, Error> {
        match self.readable(account)? {
            Some(store) => store.latest(account, include_shared),
            None => Ok(None),
        }
    }

    /// Every partition with existing storage is purged, whether or not it
    /// has been opened yet.
    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, Error> {
        for name in self.factory.existing()? {
            if is_safe_partition_name(&name) {
                self.open_existing(name)?;
            } else {
                warn!("Skipping unsafe partition directory {name:?}");
            }
        }

        let mut purged = 0;
        for store in self.all_partitions() {
            purged += store.purge_before(cutoff)?;
        }
        Ok(purged)
    }
}

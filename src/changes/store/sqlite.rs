//-
// Copyright (c) 2023, 2024, Jason Lingle
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

use std::fs;
use std::io;
use std::marker::PhantomData;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::prelude::*;
use log::{info, warn};

use super::{
    migrations,
    partition::{PartitionFactory, PartitionedStore},
    types::*,
    ChangeStore, PagedScan, RecordStream,
};
use crate::changes::model::*;
use crate::support::{config::StorageConfig, error::Error};

/// A change store backed by a SQLite database holding one family.
///
/// Clones share the same connection.
pub struct SqliteChangeStore<I> {
    cxn: Arc<Mutex<rusqlite::Connection>>,
    table: Arc<str>,
    page_size: usize,
    _family: PhantomData<fn() -> I>,
}

impl<I> Clone for SqliteChangeStore<I> {
    fn clone(&self) -> Self {
        Self {
            cxn: Arc::clone(&self.cxn),
            table: Arc::clone(&self.table),
            page_size: self.page_size,
            _family: PhantomData,
        }
    }
}

impl<I: ObjectId> SqliteChangeStore<I> {
    /// Opens (creating if needed) the database at `path`, bringing its schema
    /// up to date.
    pub fn open(path: &Path, config: &StorageConfig) -> Result<Self, Error> {
        let mut cxn = rusqlite::Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        cxn.pragma_update(None, "journal_mode", "PERSIST")?;
        cxn.pragma_update(None, "journal_size_limit", 1024 * 1024)?;
        cxn.busy_timeout(config.busy_timeout())?;

        let table = format!("{}_change", I::FAMILY);
        migrations::apply_migrations(
            &mut cxn,
            I::FAMILY,
            &migrations::change_table_migrations(&table),
        )?;

        info!("Opened {} change log at {}", I::FAMILY, path.display());

        Ok(Self {
            cxn: Arc::new(Mutex::new(cxn)),
            table: table.into(),
            page_size: config.page_size,
            _family: PhantomData,
        })
    }

    /// Returns a store which keeps each partition in its own directory under
    /// `config.root`, opening each database the first time an account in
    /// that partition is accessed.
    pub fn partitioned(
        config: &StorageConfig,
    ) -> PartitionedStore<Self, SqlitePartitions<I>> {
        PartitionedStore::new(SqlitePartitions {
            config: config.clone(),
            _family: PhantomData,
        })
    }
}

/// Lays out partitions as `<root>/<partition>/<family>.sqlite`.
pub struct SqlitePartitions<I> {
    config: StorageConfig,
    _family: PhantomData<fn() -> I>,
}

impl<I: ObjectId> SqlitePartitions<I> {
    fn path(&self, partition: &str) -> PathBuf {
        self.config
            .root
            .join(partition)
            .join(format!("{}.sqlite", I::FAMILY))
    }
}

impl<I: ObjectId> PartitionFactory<SqliteChangeStore<I>>
    for SqlitePartitions<I>
{
    fn create(&self, partition: &str) -> Result<SqliteChangeStore<I>, Error> {
        fs::create_dir_all(self.config.root.join(partition))?;
        SqliteChangeStore::open(&self.path(partition), &self.config)
    }

    fn open_existing(
        &self,
        partition: &str,
    ) -> Result<Option<SqliteChangeStore<I>>, Error> {
        let path = self.path(partition);
        if !path.is_file() {
            return Ok(None);
        }

        SqliteChangeStore::open(&path, &self.config).map(Some)
    }

    fn existing(&self) -> Result<Vec<String>, Error> {
        let entries = match fs::read_dir(&self.config.root) {
            Ok(entries) => entries,
            Err(e) if io::ErrorKind::NotFound == e.kind() => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned)
            else {
                continue;
            };
            if self.path(&name).is_file() {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }
}

impl<I: ObjectId> ChangeStore<I> for SqliteChangeStore<I> {
    fn append(&self, record: &ChangeRecord<I>) -> Result<(), Error> {
        let mut cxn = self.cxn.lock().unwrap();
        let txn = cxn.write_tx()?;

        let latest = txn
            .prepare_cached(&format!(
                "SELECT MAX(`state`) FROM `{}` WHERE `account_id` = ?",
                self.table,
            ))?
            .query_row((&record.account_id,), from_single::<Option<State>>)?
            .unwrap_or(State::INITIAL);
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

        txn.prepare_cached(&format!(
            "INSERT INTO `{}` (\
               `account_id`, `state`, `date`, `is_shared`, \
               `is_count_change`, `created`, `updated`, `destroyed`\
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            self.table,
        ))?
        .execute((
            &record.account_id,
            record.state,
            UnixMillis(record.date),
            record.is_shared,
            record.is_count_change,
            IdSet(&record.created),
            IdSet(&record.updated),
            IdSet(&record.destroyed),
        ))?;
        txn.commit()?;

        Ok(())
    }

    fn scan_from(
        &self,
        account: &AccountId,
        from: State,
    ) -> Result<RecordStream<I>, Error> {
        let cxn = Arc::clone(&self.cxn);
        let table = Arc::clone(&self.table);
        let account = account.clone();
        Ok(PagedScan::stream(from, self.page_size, move |lower, limit| {
            let (op, state) = match lower {
                Bound::Included(state) => (">=", state),
                Bound::Excluded(state) => (">", state),
                Bound::Unbounded => (">=", State::INITIAL),
            };

            let mut cxn = cxn.lock().unwrap();
            let txn = cxn.read_tx()?;
            let page = txn
                .prepare_cached(&format!(
                    "SELECT * FROM `{table}` \
                     WHERE `account_id` = ? AND `state` {op} ? \
                     ORDER BY `state` LIMIT ?",
                ))?
                .query_map((&account, state, limit), from_row)?
                .collect::<rusqlite::Result<Vec<ChangeRecord<I>>>>()?;
            Ok(page)
        }))
    }

    fn latest(
        &self,
        account: &AccountId,
        include_shared: bool,
    ) -> Result<Option<State>, Error> {
        let mut cxn = self.cxn.lock().unwrap();
        let txn = cxn.read_tx()?;
        let latest = txn
            .prepare_cached(&format!(
                "SELECT MAX(`state`) FROM `{}` \
                 WHERE `account_id` = ? AND (? OR NOT `is_shared`)",
                self.table,
            ))?
            .query_row(
                (account, include_shared),
                from_single::<Option<State>>,
            )?;

        Ok(latest)
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, Error> {
        let mut cxn = self.cxn.lock().unwrap();
        let txn = cxn.write_tx()?;
        let purged = txn.execute(
            &format!("DELETE FROM `{}` WHERE `date` < ?", self.table),
            (UnixMillis(cutoff),),
        )?;
        txn.commit()?;

        if purged > 0 {
            info!("Purged {purged} expired {} change(s)", I::FAMILY);
        }

        Ok(purged)
    }
}

trait ConnectionExt {
    fn read_tx(&mut self) -> rusqlite::Result<rusqlite::Transaction<'_>>;
    fn write_tx(&mut self) -> rusqlite::Result<rusqlite::Transaction<'_>>;
    fn enable_write(&mut self, enabled: bool) -> rusqlite::Result<()>;
}

impl ConnectionExt for rusqlite::Connection {
    fn read_tx(&mut self) -> rusqlite::Result<rusqlite::Transaction<'_>> {
        self.enable_write(false)?;
        self.transaction_with_behavior(rusqlite::TransactionBehavior::Deferred)
    }

    fn write_tx(&mut self) -> rusqlite::Result<rusqlite::Transaction<'_>> {
        self.enable_write(true)?;
        self.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
    }

    #[cfg(debug_assertions)]
    fn enable_write(&mut self, enabled: bool) -> rusqlite::Result<()> {
        // PRAGMA doesn't actually support templates, so switch the whole query
        // string based on `enabled`.
        self.execute(
            if enabled {
                "PRAGMA query_only = false"
            } else {
                "PRAGMA query_only = true"
            },
            (),
        )?;
        Ok(())
    }

    #[cfg(not(debug_assertions))]
    fn enable_write(&mut self, _: bool) -> rusqlite::Result<()> {
        Ok(())
    }
}

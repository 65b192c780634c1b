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

use log::info;

use super::types::*;
use crate::support::error::Error;

/// Returns the migrations for the change table named `table`, in order.
///
/// Each family lives in its own database, but the table name still carries
/// the family so that a stray file opened as the wrong family fails loudly
/// instead of yielding garbage.
pub fn change_table_migrations(table: &str) -> Vec<String> {
    vec![format!(
        "CREATE TABLE `{table}` (\
           `account_id` TEXT NOT NULL, \
           `state` BLOB NOT NULL, \
           `date` INTEGER NOT NULL, \
           `is_shared` INTEGER NOT NULL, \
           `is_count_change` INTEGER NOT NULL, \
           `created` BLOB NOT NULL, \
           `updated` BLOB NOT NULL, \
           `destroyed` BLOB NOT NULL, \
           PRIMARY KEY (`account_id`, `state`)\
         ) STRICT, WITHOUT ROWID;\n\
         CREATE INDEX `{table}_shared` \
           ON `{table}` (`account_id`, `is_shared`, `state`);\n\
         CREATE INDEX `{table}_date` ON `{table}` (`date`);"
    )]
}

pub fn apply_migrations(
    cxn: &mut rusqlite::Connection,
    db_name: &str,
    migrations: &[String],
) -> Result<(), Error> {
    let latest_version = migrations.len();

    if Ok(Some(latest_version))
        == cxn.query_row(
            "SELECT MAX(`version`) FROM `migration`",
            (),
            from_single::<Option<usize>>,
        )
    {
        return Ok(());
    }

    let txn = cxn
        .transaction_with_behavior(rusqlite::TransactionBehavior::Exclusive)?;
    txn.execute(
        "CREATE TABLE IF NOT EXISTS `migration` (\
         `version` INTEGER NOT NULL PRIMARY KEY, \
         `applied_at` INTEGER NOT NULL\
         ) STRICT",
        (),
    )?;

    let current_version = txn
        .query_row(
            "SELECT MAX(`version`) FROM `migration`",
            (),
            from_single::<Option<usize>>,
        )?
        .unwrap_or(0);

    for (version, migration) in migrations
        .iter()
        .enumerate()
        .map(|(ix, migration)| (ix + 1, migration))
        .skip(current_version)
    {
        info!("Applying #{version} migration to {db_name} DB");
        txn.execute_batch(migration)?;
        txn.execute(
            "INSERT INTO `migration` (`version`, `applied_at`) \
             VALUES (?, ?)",
            (version, UnixMillis(chrono::Utc::now())),
        )?;
    }

    txn.commit()?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let mut cxn = rusqlite::Connection::open_in_memory().unwrap();
        let migrations = change_table_migrations("email_change");
        apply_migrations(&mut cxn, "email", &migrations).unwrap();
        apply_migrations(&mut cxn, "email", &migrations).unwrap();

        let version = cxn
            .query_row(
                "SELECT MAX(`version`) FROM `migration`",
                (),
                from_single::<usize>,
            )
            .unwrap();
        assert_eq!(1, version);

        let tables = cxn
            .query_row(
                "SELECT COUNT(*) FROM `sqlite_master` \
                 WHERE `type` = 'table' AND `name` = 'email_change'",
                (),
                from_single::<i64>,
            )
            .unwrap();
        assert_eq!(1, tables);
    }
}

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

//! Bindings for our model types to `rusqlite`.

use std::collections::BTreeSet;

use chrono::prelude::*;
use rusqlite::types::{
    FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef,
};
use uuid::Uuid;

use crate::changes::model::*;

impl ToSql for State {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        // Big-endian bytes, so that SQLite's memcmp ordering of blobs agrees
        // with the ordering of states.
        Ok(ToSqlOutput::Owned(rusqlite::types::Value::Blob(
            self.as_uuid().as_bytes().to_vec(),
        )))
    }
}

impl FromSql for State {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let ValueRef::Blob(value) = value else {
            return Err(FromSqlError::InvalidType);
        };

        Uuid::from_slice(value)
            .map(State::from_uuid)
            .map_err(|_| FromSqlError::InvalidBlobSize {
                expected_size: 16,
                blob_size: value.len(),
            })
    }
}

impl ToSql for AccountId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(ValueRef::Text(self.as_str().as_bytes())))
    }
}

impl FromSql for AccountId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = String::column_result(value)?;
        AccountId::new(s).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// A timestamp stored as milliseconds since the UNIX epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnixMillis(pub DateTime<Utc>);

impl ToSql for UnixMillis {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Owned(rusqlite::types::Value::Integer(
            self.0.timestamp_millis(),
        )))
    }
}

impl FromSql for UnixMillis {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let inner = i64::column_result(value)?;
        DateTime::<Utc>::from_timestamp_millis(inner)
            .ok_or(FromSqlError::OutOfRange(inner))
            .map(Self)
    }
}

/// A set of object ids stored as a CBOR array.
pub struct IdSet<'a, I>(pub &'a BTreeSet<I>);

impl<I: ObjectId> ToSql for IdSet<'_, I> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        serde_cbor::to_vec(self.0)
            .map(|bytes| {
                ToSqlOutput::Owned(rusqlite::types::Value::Blob(bytes))
            })
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
    }
}

fn id_set_from_sql<I: ObjectId>(
    value: ValueRef<'_>,
) -> FromSqlResult<BTreeSet<I>> {
    let ValueRef::Blob(value) = value else {
        return Err(FromSqlError::InvalidType);
    };

    serde_cbor::from_slice(value).map_err(|e| FromSqlError::Other(Box::new(e)))
}

impl<I: ObjectId> FromRow for ChangeRecord<I> {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let id_set = |name: &str| -> rusqlite::Result<BTreeSet<I>> {
            let ix = row.as_ref().column_index(name)?;
            id_set_from_sql(row.get_ref(ix)?).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    ix,
                    rusqlite::types::Type::Blob,
                    Box::new(e),
                )
            })
        };

        Ok(Self {
            account_id: row.get("account_id")?,
            state: row.get("state")?,
            date: row.get::<_, UnixMillis>("date")?.0,
            is_shared: row.get("is_shared")?,
            is_count_change: row.get("is_count_change")?,
            created: id_set("created")?,
            updated: id_set("updated")?,
            destroyed: id_set("destroyed")?,
        })
    }
}

pub fn from_row<T: FromRow>(row: &rusqlite::Row<'_>) -> rusqlite::Result<T> {
    T::from_row(row)
}

pub fn from_single<T: FromSql>(row: &rusqlite::Row<'_>) -> rusqlite::Result<T> {
    row.get(0)
}

pub trait FromRow: Sized {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self>;
}

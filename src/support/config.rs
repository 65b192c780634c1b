//-
// Copyright (c) 2020, 2024, Jason Lingle
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
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::prelude::*;
use serde::{Deserialize, Serialize};

use crate::changes::model::{Limit, ObjectId};
use crate::support::error::Error;

/// The configuration for the change log.
///
/// This is normally stored in a file named `changes.toml` next to the rest
/// of the server configuration. Every section is optional.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ChangeLogConfig {
    /// Bounds on the size of the chunks returned to clients.
    #[serde(default)]
    pub limits: LimitConfig,

    /// Where and how change records are stored.
    #[serde(default)]
    pub storage: StorageConfig,

    /// How long change records are kept before they may be purged.
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl ChangeLogConfig {
    /// Loads and validates the configuration in the given TOML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parses and validates TOML configuration text.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let default_limit = self.limits.default_limit()?;
        let max_limit = self.limits.max_limit()?;
        if default_limit > max_limit {
            return Err(Error::InvalidArgument(format!(
                "default_limit {} exceeds max_limit {}",
                default_limit.get(),
                max_limit.get(),
            )));
        }

        if 0 == self.storage.page_size {
            return Err(Error::InvalidArgument(
                "page_size must be positive".to_owned(),
            ));
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitConfig {
    /// The number of objects returned in one chunk when the client does not
    /// ask for a specific number.
    pub default_limit: u32,

    /// The most objects a client may ask for in one chunk. Larger requests
    /// are silently reduced to this value.
    pub max_limit: u32,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            default_limit: Limit::DEFAULT.get() as u32,
            max_limit: 1024,
        }
    }
}

impl LimitConfig {
    pub fn default_limit(&self) -> Result<Limit, Error> {
        Limit::of(self.default_limit.into())
    }

    pub fn max_limit(&self) -> Result<Limit, Error> {
        Limit::of(self.max_limit.into())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// The directory under which each partition gets its own subdirectory of
    /// SQLite databases.
    pub root: PathBuf,

    /// How many records a scan reads from the database at a time.
    pub page_size: usize,

    /// How long to wait for a lock on a database held by another process.
    pub busy_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("changes"),
            page_size: 128,
            busy_timeout_secs: 10,
        }
    }
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Days to keep email change records. 0 keeps them forever.
    pub email_change_ttl_days: u32,
    /// Days to keep mailbox change records. 0 keeps them forever.
    pub mailbox_change_ttl_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            email_change_ttl_days: 60,
            mailbox_change_ttl_days: 60,
        }
    }
}

impl RetentionConfig {
    /// Returns the instant before which records of family `I` may be purged,
    /// or `None` if that family is kept forever.
    pub fn cutoff<I: ObjectId>(
        &self,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let days = I::ttl_days(self);
        if 0 == days {
            None
        } else {
            Some(now - chrono::Duration::days(days.into()))
        }
    }
}

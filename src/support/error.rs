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

use std::io;

use thiserror::Error;

use crate::changes::model::State;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// The cursor is absent from the log, either because it never existed
    /// or because retention removed it. Clients must resynchronise from
    /// `State::INITIAL`.
    #[error("State {0} not found")]
    StateNotFound(State),
    /// The store refused a record whose state does not follow the latest
    /// state of its account.
    #[error("State {0} is not after the latest state of the account")]
    StateConflict(State),
    #[error(
        "Change at state {state} touches {size} objects, \
         more than the limit of {limit}"
    )]
    ChangeExceedsLimit {
        state: State,
        size: usize,
        limit: usize,
    },
    #[error("Unsafe partition name")]
    UnsafeName,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Config(#[from] toml::de::Error),
}

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

//! The per-account change log.
//!
//! Every write to an account's objects is recorded as a `ChangeRecord`
//! tagged with a fresh `State`. Clients remember the last state they saw and
//! ask for everything since; the `ChangeRepository` folds the intervening
//! records into a single `ChangeChunk` of created, updated and destroyed
//! ids, bounded by a `Limit` so that large backlogs are fetched in pieces.

pub mod collector;
pub mod model;
pub mod repository;
pub mod store;

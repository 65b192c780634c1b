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

//! Merging of change records into a single bounded chunk.
//!
//! Each object id ends up in at most one of the created, updated, and
//! destroyed sets, determined by folding the operations on it in state order
//! through `merge()`. Records are folded whole: if a record would push the
//! chunk over its limit, folding stops before that record, so resuming from
//! the chunk's new state never observes half a record.

use std::collections::BTreeSet;

use log::debug;

use super::model::*;
use crate::support::error::Error;

/// Where an id currently stands in a chunk being collected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Absent,
    Created,
    Updated,
    Destroyed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Create,
    Update,
    Destroy,
}

/// Determines the slot of an id after applying `op` to it.
fn merge(current: Slot, op: Op) -> Slot {
    match (op, current) {
        // Destroyed and then re-created within the window: the two cancel.
        (Op::Create, Slot::Destroyed) => Slot::Absent,
        (Op::Create, _) => Slot::Created,
        // The client will fetch the object anyway.
        (Op::Update, Slot::Created) => Slot::Created,
        // Destruction is terminal; a well-behaved writer never produces this.
        (Op::Update, Slot::Destroyed) => Slot::Destroyed,
        (Op::Update, _) => Slot::Updated,
        // Created and destroyed within the window: the client never needs to
        // hear about it.
        (Op::Destroy, Slot::Created) => Slot::Absent,
        (Op::Destroy, _) => Slot::Destroyed,
    }
}

struct Collector<I> {
    created: BTreeSet<I>,
    updated: BTreeSet<I>,
    destroyed: BTreeSet<I>,
}

impl<I: ObjectId> Collector<I> {
    fn new() -> Self {
        Self {
            created: BTreeSet::new(),
            updated: BTreeSet::new(),
            destroyed: BTreeSet::new(),
        }
    }

    fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.destroyed.len()
    }

    fn slot(&self, id: &I) -> Slot {
        if self.created.contains(id) {
            Slot::Created
        } else if self.updated.contains(id) {
            Slot::Updated
        } else if self.destroyed.contains(id) {
            Slot::Destroyed
        } else {
            Slot::Absent
        }
    }

    fn set_mut(&mut self, slot: Slot) -> Option<&mut BTreeSet<I>> {
        match slot {
            Slot::Absent => None,
            Slot::Created => Some(&mut self.created),
            Slot::Updated => Some(&mut self.updated),
            Slot::Destroyed => Some(&mut self.destroyed),
        }
    }

    /// Works out the transitions `record` would cause without applying
    /// them.
    ///
    /// Returns the transitions that actually move an id, along with the size
    /// the collector would have afterwards.
    fn plan<'a>(
        &self,
        record: &'a ChangeRecord<I>,
    ) -> (Vec<(&'a I, Slot, Slot)>, usize) {
        let ops = record
            .created
            .iter()
            .map(|id| (id, Op::Create))
            .chain(record.updated.iter().map(|id| (id, Op::Update)))
            .chain(record.destroyed.iter().map(|id| (id, Op::Destroy)));

        let mut size = self.len();
        let mut moves = Vec::new();
        // The sets of a record are disjoint, so each id is seen at most once
        // here and the transitions are independent of each other.
        for (id, op) in ops {
            let from = self.slot(id);
            let to = merge(from, op);
            if from == to {
                continue;
            }

            if Slot::Absent == from {
                size += 1;
            } else if Slot::Absent == to {
                size -= 1;
            }
            moves.push((id, from, to));
        }

        (moves, size)
    }

    fn apply(&mut self, moves: Vec<(&I, Slot, Slot)>) {
        for (id, from, to) in moves {
            if let Some(set) = self.set_mut(from) {
                set.remove(id);
            }
            if let Some(set) = self.set_mut(to) {
                set.insert(id.clone());
            }
        }
    }
}

/// Folds `records`, which must be in ascending state order and already
/// filtered for visibility, into a single chunk of at most `limit` ids.
///
/// Records are pulled from the iterator lazily; once the limit is reached,
/// no further records are read. Errors from the iterator are returned
/// unchanged.
///
/// If the very first record alone exceeds `limit`, no progress is possible
/// without splitting it, and `Error::ChangeExceedsLimit` is returned.
pub fn fold<I, R>(
    records: R,
    limit: Limit,
    old_state: State,
) -> Result<ChangeChunk<I>, Error>
where
    I: ObjectId,
    R: IntoIterator<Item = Result<ChangeRecord<I>, Error>>,
{
    let mut collector = Collector::new();
    let mut new_state = old_state;
    let mut folded = 0usize;
    let mut count_change_only = true;
    let mut has_more_changes = false;

    for record in records {
        let record = record?;
        let (moves, size) = collector.plan(&record);
        if size > limit.get() {
            if 0 == folded {
                return Err(Error::ChangeExceedsLimit {
                    state: record.state,
                    size,
                    limit: limit.get(),
                });
            }

            has_more_changes = true;
            break;
        }

        collector.apply(moves);
        new_state = record.state;
        count_change_only &= record.is_count_change;
        folded += 1;
    }

    debug!(
        "Folded {} {} change(s) since {}: {} id(s), more={}",
        folded,
        I::FAMILY,
        old_state,
        collector.len(),
        has_more_changes,
    );

    Ok(ChangeChunk {
        old_state,
        new_state,
        created: collector.created,
        updated: collector.updated,
        destroyed: collector.destroyed,
        has_more_changes,
        count_change_only: folded > 0 && count_change_only,
    })
}

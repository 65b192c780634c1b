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

use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::prelude::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::support::{config::RetentionConfig, error::Error};

/// The partition used for accounts whose identifier has no domain part.
pub const LOCAL_PARTITION: &str = "local";

/// Identifies the account which owns a change history.
///
/// The content is opaque except that the part after the last `@`, if any,
/// is taken as the domain used to pick a storage partition.
#[derive(
    Deserialize,
    Serialize,
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Result<Self, Error> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidArgument(
                "account id must not be empty".to_owned(),
            ));
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The lower-cased domain part of the account, if it has one.
    pub fn domain(&self) -> Option<String> {
        self.0
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .filter(|domain| !domain.is_empty())
            .map(str::to_lowercase)
    }

    /// The name of the storage partition holding this account's history.
    pub fn partition(&self) -> String {
        self.domain()
            .unwrap_or_else(|| LOCAL_PARTITION.to_owned())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A point in the change history of an account.
///
/// Real states are version 7 UUIDs, whose byte order (and thus the derived
/// `Ord`) is their creation order. `State::INITIAL` is the nil UUID, which
/// sorts before every generated state and is never stored.
#[derive(
    Deserialize,
    Serialize,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
)]
#[serde(transparent)]
pub struct State(Uuid);

impl State {
    pub const INITIAL: Self = State(Uuid::nil());

    pub fn from_uuid(uuid: Uuid) -> Self {
        State(uuid)
    }

    pub fn as_uuid(self) -> Uuid {
        self.0
    }

    pub fn is_initial(self) -> bool {
        Self::INITIAL == self
    }

    /// Parses the textual form of a state as handed out to clients.
    pub fn parse(s: &str) -> Result<Self, Error> {
        Uuid::parse_str(s).map(State).map_err(|e| {
            Error::InvalidArgument(format!("malformed state {s:?}: {e}"))
        })
    }

    /// The smallest state strictly greater than `self`.
    fn successor(self) -> Self {
        // A v7 UUID never has all bits set, so this cannot wrap for any state
        // we generate.
        State(Uuid::from_u128(self.0.as_u128().wrapping_add(1)))
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_initial() {
            write!(f, "State(INITIAL)")
        } else {
            write!(f, "State({})", self.0.hyphenated())
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Self::parse(s)
    }
}

/// Hands out strictly increasing states to a writer.
///
/// Each state is normally a fresh v7 UUID, but if the clock has not advanced
/// past (or went back behind) the last state handed out, the factory steps
/// forward from the last state instead, so the sequence never repeats or
/// decreases within one process.
#[derive(Debug, Default)]
pub struct StateFactory {
    last: Mutex<State>,
}

impl StateFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate(&self) -> State {
        let mut last = self.last.lock().unwrap();
        let fresh = State(Uuid::now_v7());
        *last = if fresh > *last {
            fresh
        } else {
            last.successor()
        };
        *last
    }
}

/// The maximum number of distinct object ids in one chunk of changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Limit(NonZeroUsize);

impl Limit {
    pub const DEFAULT: Self = match NonZeroUsize::new(256) {
        Some(n) => Limit(n),
        None => panic!(),
    };

    /// Creates a limit, which must be strictly positive.
    pub fn of(value: i64) -> Result<Self, Error> {
        usize::try_from(value)
            .ok()
            .and_then(NonZeroUsize::new)
            .map(Limit)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "limit must be positive, got {value}"
                ))
            })
    }

    pub fn get(self) -> usize {
        self.0.get()
    }
}

impl Default for Limit {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// The identifier of an object whose changes are tracked.
///
/// Each implementation is one family of objects with its own change history.
pub trait ObjectId:
    Clone
    + Ord
    + Hash
    + fmt::Debug
    + fmt::Display
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Short lower-case name of the family, used in table names, file names
    /// and logs.
    const FAMILY: &'static str;
    /// Whether records of this family may be flagged as count-only changes.
    const HAS_COUNT_CHANGES: bool;

    /// The number of days records of this family are kept. 0 keeps them
    /// forever.
    fn ttl_days(retention: &RetentionConfig) -> u32;
}

macro_rules! object_id {
    (
        $(#[$meta:meta])* $t:ident,
        $family:expr,
        $count:expr,
        $ttl:ident $(,)?
    ) => {
        $(#[$meta])*
        #[derive(
            Deserialize,
            Serialize,
            Clone,
            Debug,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
        )]
        #[serde(transparent)]
        pub struct $t(pub String);

        impl $t {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl ObjectId for $t {
            const FAMILY: &'static str = $family;
            const HAS_COUNT_CHANGES: bool = $count;

            fn ttl_days(retention: &RetentionConfig) -> u32 {
                retention.$ttl
            }
        }
    };
}

object_id!(
    /// Identifies a message, independent of the mailboxes it is in.
    MessageId,
    "email",
    false,
    email_change_ttl_days,
);
object_id!(
    /// Identifies a mailbox.
    MailboxId,
    "mailbox",
    true,
    mailbox_change_ttl_days,
);

/// One atomic write to the change log of an account.
///
/// Records are immutable once stored and are only ever appended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeRecord<I> {
    pub account_id: AccountId,
    pub state: State,
    /// Wall-clock time of the write. Only used for retention; ordering is
    /// always by `state`.
    pub date: DateTime<Utc>,
    /// Whether the change is only visible through delegated access (i.e., it
    /// happened in a mailbox shared with the account).
    pub is_shared: bool,
    /// Whether only the counters of the objects changed. Mailboxes only.
    pub is_count_change: bool,
    pub created: BTreeSet<I>,
    pub updated: BTreeSet<I>,
    pub destroyed: BTreeSet<I>,
}

impl<I: ObjectId> ChangeRecord<I> {
    pub fn builder(
        account_id: AccountId,
        state: State,
    ) -> ChangeRecordBuilder<I> {
        ChangeRecordBuilder {
            record: ChangeRecord {
                account_id,
                state,
                date: Utc::now(),
                is_shared: false,
                is_count_change: false,
                created: BTreeSet::new(),
                updated: BTreeSet::new(),
                destroyed: BTreeSet::new(),
            },
        }
    }

    /// The total number of ids mentioned by this record.
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.destroyed.len()
    }

    pub fn is_empty(&self) -> bool {
        0 == self.len()
    }

    /// Checks the invariants every stored record must satisfy.
    pub fn validate(&self) -> Result<(), Error> {
        if self.account_id.is_empty() {
            return Err(Error::InvalidArgument(
                "account id must not be empty".to_owned(),
            ));
        }

        if self.state.is_initial() {
            return Err(Error::InvalidArgument(
                "the initial state cannot be stored".to_owned(),
            ));
        }

        if self.is_count_change && !I::HAS_COUNT_CHANGES {
            return Err(Error::InvalidArgument(format!(
                "{} changes cannot be count-only",
                I::FAMILY,
            )));
        }

        if let Some(id) = self
            .created
            .intersection(&self.updated)
            .chain(self.created.intersection(&self.destroyed))
            .chain(self.updated.intersection(&self.destroyed))
            .next()
        {
            return Err(Error::InvalidArgument(format!(
                "{} {id} appears in more than one change set",
                I::FAMILY,
            )));
        }

        Ok(())
    }
}

/// Assembles a `ChangeRecord`, validating it on `build()`.
#[derive(Clone, Debug)]
pub struct ChangeRecordBuilder<I> {
    record: ChangeRecord<I>,
}

impl<I: ObjectId> ChangeRecordBuilder<I> {
    pub fn date(mut self, date: DateTime<Utc>) -> Self {
        self.record.date = date;
        self
    }

    pub fn shared(mut self, is_shared: bool) -> Self {
        self.record.is_shared = is_shared;
        self
    }

    pub fn count_change(mut self, is_count_change: bool) -> Self {
        self.record.is_count_change = is_count_change;
        self
    }

    pub fn created(mut self, ids: impl IntoIterator<Item = I>) -> Self {
        self.record.created.extend(ids);
        self
    }

    pub fn updated(mut self, ids: impl IntoIterator<Item = I>) -> Self {
        self.record.updated.extend(ids);
        self
    }

    pub fn destroyed(mut self, ids: impl IntoIterator<Item = I>) -> Self {
        self.record.destroyed.extend(ids);
        self
    }

    pub fn build(self) -> Result<ChangeRecord<I>, Error> {
        self.record.validate()?;
        Ok(self.record)
    }
}

/// The merged changes of an account since some state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeChunk<I> {
    /// The state the client asked about.
    pub old_state: State,
    /// The state the client should resume from.
    pub new_state: State,
    pub created: BTreeSet<I>,
    pub updated: BTreeSet<I>,
    pub destroyed: BTreeSet<I>,
    /// Whether the chunk was truncated and more changes follow `new_state`.
    pub has_more_changes: bool,
    /// Whether every change in the chunk only touched object counters, so
    /// the client need only refresh those.
    pub count_change_only: bool,
}

impl<I> ChangeChunk<I> {
    /// The total number of ids in the chunk.
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.destroyed.len()
    }

    pub fn is_empty(&self) -> bool {
        0 == self.len()
    }
}

pub type EmailChange = ChangeRecord<MessageId>;
pub type MailboxChange = ChangeRecord<MailboxId>;
pub type EmailChanges = ChangeChunk<MessageId>;
pub type MailboxChanges = ChangeChunk<MailboxId>;

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn account() -> AccountId {
        AccountId::new("alice@example.com").unwrap()
    }

    fn m(id: &str) -> MessageId {
        MessageId::new(id)
    }

    #[test]
    fn account_partitions() {
        assert_eq!(
            "example.com",
            AccountId::new("bob@Example.COM").unwrap().partition()
        );
        assert_eq!(
            "example.com",
            AccountId::new("weird@name@example.com").unwrap().partition()
        );
        assert_eq!(LOCAL_PARTITION, AccountId::new("bob").unwrap().partition());
        assert_eq!(
            LOCAL_PARTITION,
            AccountId::new("bob@").unwrap().partition()
        );
        assert_matches!(Err(Error::InvalidArgument(_)), AccountId::new(""));
    }

    #[test]
    fn initial_state_sorts_first() {
        let factory = StateFactory::new();
        let state = factory.generate();
        assert!(State::INITIAL < state);
        assert!(State::INITIAL.is_initial());
        assert!(!state.is_initial());
        assert_eq!(State::INITIAL, State::default());
        assert_eq!("State(INITIAL)", format!("{:?}", State::INITIAL));
    }

    #[test]
    fn state_text_round_trip() {
        let state = StateFactory::new().generate();
        assert_eq!(state, State::parse(&state.to_string()).unwrap());
        assert_eq!(state, state.to_string().parse::<State>().unwrap());
        assert_eq!(
            State::INITIAL,
            State::parse("00000000-0000-0000-0000-000000000000").unwrap()
        );
        assert_matches!(Err(Error::InvalidArgument(_)), State::parse("s1"));
    }

    #[test]
    fn factory_is_strictly_monotonic() {
        let factory = StateFactory::new();
        let mut prev = State::INITIAL;
        for _ in 0..10_000 {
            let next = factory.generate();
            assert!(next > prev, "{:?} <= {:?}", next, prev);
            prev = next;
        }
    }

    #[test]
    fn factory_steps_past_future_states() {
        let factory = StateFactory::new();
        let future = State(Uuid::from_u128(
            Uuid::now_v7().as_u128() + (1u128 << 100),
        ));
        *factory.last.lock().unwrap() = future;
        let next = factory.generate();
        assert!(next > future);
        assert_eq!(future.successor(), next);
    }

    #[test]
    fn limit_construction() {
        assert_eq!(1, Limit::of(1).unwrap().get());
        assert_eq!(256, Limit::DEFAULT.get());
        assert_eq!(Limit::DEFAULT, Limit::default());
        assert_matches!(Err(Error::InvalidArgument(_)), Limit::of(0));
        assert_matches!(Err(Error::InvalidArgument(_)), Limit::of(-5));
    }

    #[test]
    fn builder_validation() {
        let state = StateFactory::new().generate();

        let record = EmailChange::builder(account(), state)
            .created(vec![m("1"), m("2")])
            .updated(vec![m("3")])
            .destroyed(vec![m("4")])
            .shared(true)
            .build()
            .unwrap();
        assert_eq!(4, record.len());
        assert!(record.is_shared);
        assert!(!record.is_count_change);

        assert_matches!(
            Err(Error::InvalidArgument(_)),
            EmailChange::builder(account(), State::INITIAL).build()
        );
        assert_matches!(
            Err(Error::InvalidArgument(_)),
            EmailChange::builder(account(), state)
                .created(vec![m("1")])
                .destroyed(vec![m("1")])
                .build()
        );
        assert_matches!(
            Err(Error::InvalidArgument(_)),
            EmailChange::builder(account(), state)
                .count_change(true)
                .build()
        );

        let mailbox = MailboxChange::builder(account(), state)
            .updated(vec![MailboxId::new("inbox")])
            .count_change(true)
            .build()
            .unwrap();
        assert!(mailbox.is_count_change);
    }

    proptest! {
        #[test]
        fn state_order_matches_text_order(
            a in any::<u128>(),
            b in any::<u128>(),
        ) {
            let a = State(Uuid::from_u128(a));
            let b = State(Uuid::from_u128(b));
            prop_assert_eq!(a.cmp(&b), a.to_string().cmp(&b.to_string()));
        }
    }
}

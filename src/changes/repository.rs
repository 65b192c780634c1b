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

use std::marker::PhantomData;

use chrono::prelude::*;
use log::{debug, info, warn};

use super::collector::fold;
use super::model::*;
use super::store::ChangeStore;
use crate::support::config::{LimitConfig, RetentionConfig};
use crate::support::error::Error;

/// The change log of one family of objects.
///
/// The repository holds no state of its own between calls; everything lives
/// in the store, so any number of repositories may share one store.
pub struct ChangeRepository<I, S> {
    store: S,
    default_limit: Limit,
    max_limit: Limit,
    _family: PhantomData<fn() -> I>,
}

pub type EmailChangeRepository<S> = ChangeRepository<MessageId, S>;
pub type MailboxChangeRepository<S> = ChangeRepository<MailboxId, S>;

impl<I: ObjectId, S: ChangeStore<I>> ChangeRepository<I, S> {
    /// Creates a repository using the default limits.
    pub fn new(store: S) -> Self {
        let defaults = LimitConfig::default();
        Self {
            store,
            default_limit: Limit::DEFAULT,
            max_limit: defaults.max_limit().unwrap_or(Limit::DEFAULT),
            _family: PhantomData,
        }
    }

    pub fn with_config(store: S, limits: &LimitConfig) -> Result<Self, Error> {
        let default_limit = limits.default_limit()?;
        let max_limit = limits.max_limit()?;
        if default_limit > max_limit {
            return Err(Error::InvalidArgument(format!(
                "default_limit {} exceeds max_limit {}",
                default_limit.get(),
                max_limit.get(),
            )));
        }

        Ok(Self {
            store,
            default_limit,
            max_limit,
            _family: PhantomData,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Records a change.
    ///
    /// The record is stored as-is; it is neither merged with nor checked
    /// against earlier records beyond the ordering of its state.
    pub fn save(&self, record: &ChangeRecord<I>) -> Result<(), Error> {
        check_account(&record.account_id)?;
        record.validate()?;
        self.store.append(record)
    }

    /// Returns the changes visible to the account's owner since `state`.
    ///
    /// Changes which only happened through delegated access are excluded.
    pub fn since_state(
        &self,
        account: &AccountId,
        state: State,
        limit: Option<Limit>,
    ) -> Result<ChangeChunk<I>, Error> {
        self.collect(account, state, limit, false)
    }

    /// Like `since_state`, but also includes changes made through delegated
    /// access.
    pub fn since_state_with_delegation(
        &self,
        account: &AccountId,
        state: State,
        limit: Option<Limit>,
    ) -> Result<ChangeChunk<I>, Error> {
        self.collect(account, state, limit, true)
    }

    /// Returns the latest state of the account, ignoring delegated changes,
    /// or `State::INITIAL` if there is none.
    pub fn latest_state(&self, account: &AccountId) -> Result<State, Error> {
        check_account(account)?;
        Ok(self.store.latest(account, false)?.unwrap_or(State::INITIAL))
    }

    pub fn latest_state_with_delegation(
        &self,
        account: &AccountId,
    ) -> Result<State, Error> {
        check_account(account)?;
        Ok(self.store.latest(account, true)?.unwrap_or(State::INITIAL))
    }

    /// Purges records older than the retention period of this family.
    ///
    /// Returns the number of records removed.
    pub fn purge_expired(
        &self,
        retention: &RetentionConfig,
        now: DateTime<Utc>,
    ) -> Result<usize, Error> {
        let Some(cutoff) = retention.cutoff::<I>(now) else {
            return Ok(0);
        };

        let purged = self.store.purge_before(cutoff)?;
        info!(
            "Purged {purged} {} change(s) dated before {cutoff}",
            I::FAMILY,
        );
        Ok(purged)
    }

    fn effective_limit(&self, requested: Option<Limit>) -> Limit {
        requested.unwrap_or(self.default_limit).min(self.max_limit)
    }

    fn collect(
        &self,
        account: &AccountId,
        state: State,
        limit: Option<Limit>,
        include_shared: bool,
    ) -> Result<ChangeChunk<I>, Error> {
        check_account(account)?;
        let limit = self.effective_limit(limit);
        let visible = move |record: &Result<ChangeRecord<I>, Error>| {
            record.as_ref().map_or(true, |record| {
                record.state != state && (include_shared || !record.is_shared)
            })
        };

        if state.is_initial() {
            debug!("Scanning all {} changes of {account}", I::FAMILY);
            return fold(
                self.store.scan_all(account)?.filter(visible),
                limit,
                state,
            );
        }

        let mut records = self.store.scan_from(account, state)?.peekable();
        // The cursor record itself must still exist. A scan which starts
        // elsewhere means the state was purged or never issued, and folding
        // from there would silently skip changes.
        let found = match records.peek() {
            None => false,
            Some(Ok(first)) => first.state == state,
            Some(Err(_)) => true,
        };
        if !found {
            warn!(
                "{} state {state} not found for {account}; \
                 client must resynchronise",
                I::FAMILY,
            );
            return Err(Error::StateNotFound(state));
        }

        fold(records.filter(visible), limit, state)
    }
}

fn check_account(account: &AccountId) -> Result<(), Error> {
    if account.is_empty() {
        return Err(Error::InvalidArgument(
            "account id must not be empty".to_owned(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use rayon::prelude::*;
    use tempfile::TempDir;

    use super::*;
    use crate::changes::store::{MemoryChangeStore, SqliteChangeStore};
    use crate::support::config::StorageConfig;

    type EmailRepo = EmailChangeRepository<MemoryChangeStore<MessageId>>;

    struct Fixture {
        repo: EmailRepo,
        factory: StateFactory,
        account: AccountId,
    }

    impl Fixture {
        fn new() -> Self {
            crate::init_test_log();
            Self::with_store(MemoryChangeStore::new())
        }

        fn with_store(store: MemoryChangeStore<MessageId>) -> Self {
            Self {
                repo: ChangeRepository::new(store),
                factory: StateFactory::new(),
                account: AccountId::new("alice@example.com").unwrap(),
            }
        }

        fn save(
            &self,
            created: &[&str],
            updated: &[&str],
            destroyed: &[&str],
            shared: bool,
        ) -> State {
            let state = self.factory.generate();
            self.repo
                .save(
                    &EmailChange::builder(self.account.clone(), state)
                        .created(created.iter().copied().map(MessageId::new))
                        .updated(updated.iter().copied().map(MessageId::new))
                        .destroyed(
                            destroyed.iter().copied().map(MessageId::new),
                        )
                        .shared(shared)
                        .build()
                        .unwrap(),
                )
                .unwrap();
            state
        }

        fn since(&self, state: State, limit: Option<usize>) -> EmailChanges {
            self.repo
                .since_state(
                    &self.account,
                    state,
                    limit.map(|l| Limit::of(l as i64).unwrap()),
                )
                .unwrap()
        }
    }

    fn set(ids: &[&str]) -> BTreeSet<MessageId> {
        ids.iter().copied().map(MessageId::new).collect()
    }

    #[test]
    fn create_update_destroy_scenario() {
        let fixture = Fixture::new();
        let s1 = fixture.save(&["m1"], &[], &[], false);
        let s2 = fixture.save(&[], &["m1"], &[], false);
        let s3 = fixture.save(&[], &[], &["m1"], false);

        let chunk = fixture.since(State::INITIAL, None);
        assert!(chunk.is_empty());
        assert_eq!(State::INITIAL, chunk.old_state);
        assert_eq!(s3, chunk.new_state);
        assert!(!chunk.has_more_changes);

        let chunk = fixture.since(s2, None);
        assert_eq!(set(&[]), chunk.created);
        assert_eq!(set(&[]), chunk.updated);
        assert_eq!(set(&["m1"]), chunk.destroyed);
        assert_eq!(s3, chunk.new_state);

        // m1 existed at s1, so the client must learn it went away.
        let chunk = fixture.since(s1, None);
        assert_eq!(set(&[]), chunk.updated);
        assert_eq!(set(&["m1"]), chunk.destroyed);
        assert_eq!(s3, chunk.new_state);

        let chunk = fixture.since(s3, None);
        assert!(chunk.is_empty());
        assert_eq!(s3, chunk.new_state);
        assert!(!chunk.has_more_changes);
    }

    #[test]
    fn latest_state_is_monotonic() {
        let fixture = Fixture::new();
        assert_eq!(
            State::INITIAL,
            fixture.repo.latest_state(&fixture.account).unwrap()
        );

        let mut previous = State::INITIAL;
        for n in 0..10 {
            let id = n.to_string();
            let state = fixture.save(&[id.as_str()], &[], &[], false);
            let latest = fixture.repo.latest_state(&fixture.account).unwrap();
            assert_eq!(state, latest);
            assert!(latest > previous);
            previous = latest;
        }
    }

    #[test]
    fn completeness_from_initial() {
        let fixture = Fixture::new();
        fixture.save(&["a", "b", "c"], &[], &[], false);
        fixture.save(&["d"], &["a"], &["b"], false);
        let last = fixture.save(&[], &["c"], &["d"], false);

        let chunk = fixture.since(State::INITIAL, None);
        assert_eq!(set(&["a", "c"]), chunk.created);
        assert_eq!(set(&[]), chunk.updated);
        assert_eq!(set(&[]), chunk.destroyed);
        assert_eq!(last, chunk.new_state);
    }

    #[test]
    fn truncation_and_resumption() {
        let fixture = Fixture::new();
        let states = (0..10)
            .map(|n| {
                let id = format!("m{n}");
                fixture.save(&[id.as_str()], &[], &[], false)
            })
            .collect::<Vec<_>>();

        let chunk = fixture.since(State::INITIAL, Some(3));
        assert_eq!(3, chunk.len());
        assert!(chunk.has_more_changes);
        assert_eq!(states[2], chunk.new_state);

        let mut cursor = State::INITIAL;
        let mut created = BTreeSet::new();
        let mut rounds = 0;
        loop {
            let chunk = fixture.since(cursor, Some(3));
            assert!(chunk.len() <= 3);
            created.extend(chunk.created);
            cursor = chunk.new_state;
            rounds += 1;
            if !chunk.has_more_changes {
                break;
            }
        }

        assert_eq!(4, rounds);
        assert_eq!(states[9], cursor);
        assert_eq!(fixture.since(State::INITIAL, None).created, created);
    }

    #[test]
    fn delegated_changes_filtered() {
        let fixture = Fixture::new();
        let own = fixture.save(&["own"], &[], &[], false);
        let shared = fixture.save(&["shared"], &[], &[], true);

        let chunk = fixture.since(State::INITIAL, None);
        assert_eq!(set(&["own"]), chunk.created);
        assert_eq!(own, chunk.new_state);

        let chunk = fixture
            .repo
            .since_state_with_delegation(&fixture.account, State::INITIAL, None)
            .unwrap();
        assert_eq!(set(&["own", "shared"]), chunk.created);
        assert_eq!(shared, chunk.new_state);

        assert_eq!(own, fixture.repo.latest_state(&fixture.account).unwrap());
        assert_eq!(
            shared,
            fixture
                .repo
                .latest_state_with_delegation(&fixture.account)
                .unwrap()
        );

        // A delegated state is still a valid cursor for the owner view.
        let after = fixture.save(&[], &["own"], &[], false);
        let chunk = fixture.since(shared, None);
        assert_eq!(set(&["own"]), chunk.updated);
        assert_eq!(after, chunk.new_state);
    }

    #[test]
    fn unknown_state_not_found() {
        let fixture = Fixture::new();
        let never = fixture.factory.generate();
        assert_matches!(
            Err(Error::StateNotFound(s)) if s == never,
            fixture.repo.since_state(&fixture.account, never, None)
        );

        let s1 = fixture.save(&["m1"], &[], &[], false);
        fixture.save(&["m2"], &[], &[], false);
        // Earlier than anything stored, so the scan starts at s1.
        assert_matches!(
            Err(Error::StateNotFound(_)),
            fixture.repo.since_state(&fixture.account, never, None)
        );
        // Same state, different account.
        assert_matches!(
            Err(Error::StateNotFound(_)),
            fixture.repo.since_state(
                &AccountId::new("bob@example.com").unwrap(),
                s1,
                None
            )
        );
    }

    #[test]
    fn purged_state_not_found() {
        let store = MemoryChangeStore::new();
        let fixture = Fixture::with_store(store.clone());
        let old = fixture.factory.generate();
        fixture
            .repo
            .save(
                &EmailChange::builder(fixture.account.clone(), old)
                    .date(Utc::now() - chrono::Duration::days(90))
                    .created(vec![MessageId::new("m1")])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let recent = fixture.save(&["m2"], &[], &[], false);

        let retention = RetentionConfig::default();
        assert_eq!(
            1,
            fixture.repo.purge_expired(&retention, Utc::now()).unwrap()
        );
        assert_eq!(1, store.len());

        assert_matches!(
            Err(Error::StateNotFound(_)),
            fixture.repo.since_state(&fixture.account, old, None)
        );
        assert!(fixture.since(recent, None).is_empty());

        let keep_forever = RetentionConfig {
            email_change_ttl_days: 0,
            ..RetentionConfig::default()
        };
        let far_future = Utc::now() + chrono::Duration::days(999);
        assert_eq!(
            0,
            fixture.repo.purge_expired(&keep_forever, far_future).unwrap()
        );
    }

    #[test]
    fn limit_clamped_to_maximum() {
        let repo = ChangeRepository::with_config(
            MemoryChangeStore::new(),
            &LimitConfig {
                default_limit: 2,
                max_limit: 4,
            },
        )
        .unwrap();
        let account = AccountId::new("a").unwrap();
        let factory = StateFactory::new();
        for n in 0..10 {
            repo.save(
                &EmailChange::builder(account.clone(), factory.generate())
                    .created(vec![MessageId::new(n.to_string())])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        }

        assert_eq!(
            2,
            repo.since_state(&account, State::INITIAL, None)
                .unwrap()
                .len()
        );
        assert_eq!(
            4,
            repo.since_state(
                &account,
                State::INITIAL,
                Some(Limit::of(100).unwrap())
            )
            .unwrap()
            .len()
        );

        assert_matches!(
            Some(Error::InvalidArgument(_)),
            ChangeRepository::<MessageId, _>::with_config(
                MemoryChangeStore::new(),
                &LimitConfig {
                    default_limit: 8,
                    max_limit: 4,
                },
            )
            .err()
        );
    }

    #[test]
    fn invalid_arguments_rejected() {
        let fixture = Fixture::new();
        let empty: AccountId =
            serde_cbor::from_slice(&serde_cbor::to_vec(&"").unwrap()).unwrap();

        assert_matches!(
            Err(Error::InvalidArgument(_)),
            fixture.repo.latest_state(&empty)
        );
        assert_matches!(
            Err(Error::InvalidArgument(_)),
            fixture.repo.since_state(&empty, State::INITIAL, None)
        );

        assert_matches!(
            Err(Error::InvalidArgument(_)),
            EmailChange::builder(fixture.account.clone(), State::INITIAL)
                .created(vec![MessageId::new("m1")])
                .build()
        );

        // Bypass the builder to get records it would refuse
        let mut record = EmailChange::builder(
            fixture.account.clone(),
            fixture.factory.generate(),
        )
        .build()
        .unwrap();
        record.is_count_change = true;
        assert_matches!(
            Err(Error::InvalidArgument(_)),
            fixture.repo.save(&record)
        );

        record.is_count_change = false;
        record.created.insert(MessageId::new("m1"));
        record.destroyed.insert(MessageId::new("m1"));
        assert_matches!(
            Err(Error::InvalidArgument(_)),
            fixture.repo.save(&record)
        );
        assert!(fixture.repo.store().is_empty());
    }

    #[test]
    fn save_rejects_stale_state() {
        let fixture = Fixture::new();
        let early = fixture.factory.generate();
        fixture.save(&["m1"], &[], &[], false);

        assert_matches!(
            Err(Error::StateConflict(s)) if s == early,
            fixture.repo.save(
                &EmailChange::builder(fixture.account.clone(), early)
                    .build()
                    .unwrap()
            )
        );
    }

    #[test]
    fn mailbox_count_changes() {
        let repo = MailboxChangeRepository::new(MemoryChangeStore::new());
        let account = AccountId::new("alice@example.com").unwrap();
        let factory = StateFactory::new();
        let save = |count_change: bool, updated: &str| {
            let state = factory.generate();
            repo.save(
                &MailboxChange::builder(account.clone(), state)
                    .updated(vec![MailboxId::new(updated)])
                    .count_change(count_change)
                    .build()
                    .unwrap(),
            )
            .unwrap();
            state
        };

        let s1 = save(true, "inbox");
        save(true, "sent");
        let chunk = repo.since_state(&account, State::INITIAL, None).unwrap();
        assert!(chunk.count_change_only);

        save(false, "inbox");
        let chunk = repo.since_state(&account, s1, None).unwrap();
        assert!(!chunk.count_change_only);
        assert_eq!(2, chunk.updated.len());

        let latest = repo.latest_state(&account).unwrap();
        let chunk = repo.since_state(&account, latest, None).unwrap();
        assert!(!chunk.count_change_only);
    }

    #[test]
    fn concurrent_readers_and_writers() {
        crate::init_test_log();

        let repo = EmailChangeRepository::new(MemoryChangeStore::new());
        let factory = StateFactory::new();
        let accounts = (0..8)
            .map(|n| AccountId::new(format!("user{n}@example.com")).unwrap())
            .collect::<Vec<_>>();

        accounts.par_iter().for_each(|account| {
            let mut cursor = State::INITIAL;
            let mut seen = BTreeSet::new();
            for n in 0..50 {
                repo.save(
                    &EmailChange::builder(account.clone(), factory.generate())
                        .created(vec![MessageId::new(format!("{account}/{n}"))])
                        .build()
                        .unwrap(),
                )
                .unwrap();

                if 0 == n % 7 {
                    let chunk = repo
                        .since_state(
                            account,
                            cursor,
                            Some(Limit::of(5).unwrap()),
                        )
                        .unwrap();
                    seen.extend(chunk.created);
                    cursor = chunk.new_state;
                }
            }

            loop {
                let chunk = repo.since_state(account, cursor, None).unwrap();
                seen.extend(chunk.created);
                cursor = chunk.new_state;
                if !chunk.has_more_changes {
                    break;
                }
            }

            assert_eq!(50, seen.len());
            assert_eq!(cursor, repo.latest_state(account).unwrap());
        });
    }

    #[test]
    fn sqlite_backed_repository() {
        crate::init_test_log();

        let tmpdir = TempDir::new().unwrap();
        let config = StorageConfig {
            root: tmpdir.path().to_owned(),
            page_size: 3,
            ..StorageConfig::default()
        };
        let repo = EmailChangeRepository::new(
            SqliteChangeStore::<MessageId>::partitioned(&config),
        );
        let account = AccountId::new("alice@example.com").unwrap();
        let factory = StateFactory::new();

        let mut states = Vec::new();
        for n in 0..10 {
            let state = factory.generate();
            repo.save(
                &EmailChange::builder(account.clone(), state)
                    .created(vec![MessageId::new(format!("m{n}"))])
                    .destroyed(if n > 0 {
                        vec![MessageId::new(format!("m{}", n - 1))]
                    } else {
                        vec![]
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();
            states.push(state);
        }

        let chunk = repo.since_state(&account, State::INITIAL, None).unwrap();
        assert_eq!(set(&["m9"]), chunk.created);
        assert!(chunk.destroyed.is_empty());
        assert_eq!(states[9], chunk.new_state);

        let chunk = repo.since_state(&account, states[4], None).unwrap();
        assert_eq!(set(&["m9"]), chunk.created);
        assert_eq!(set(&["m4"]), chunk.destroyed);

        assert_matches!(
            Err(Error::StateNotFound(_)),
            repo.since_state(&account, factory.generate(), None)
        );
    }
}

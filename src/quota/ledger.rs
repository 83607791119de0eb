use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{keys, Edit, KeyValueStore, StoreError};

use super::{
    clock::{NetworkTimeSource, TimeUnavailable},
    week::WeeklyBoundary,
};

pub const DEFAULT_MAX_REGULAR: u32 = 10;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error(transparent)]
    TimeUnavailable(#[from] TimeUnavailable),
    #[error("credit ledger could not be persisted: {0}")]
    Store(#[from] StoreError),
}

impl QuotaError {
    /// Whether calling again later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, QuotaError::TimeUnavailable(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreditPool {
    Regular,
    Extra,
}

impl CreditPool {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditPool::Regular => "REGULAR",
            CreditPool::Extra => "EXTRA",
        }
    }
}

impl fmt::Display for CreditPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CreditPool {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "REGULAR" => Ok(CreditPool::Regular),
            "EXTRA" => Ok(CreditPool::Extra),
            other => Err(format!("unknown credit pool {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreditBalance {
    pub regular: u32,
    pub extra: u32,
    pub last_reset_ms: i64,
    pub last_consumed: Option<CreditPool>,
}

impl CreditBalance {
    pub fn total(&self) -> u64 {
        u64::from(self.regular) + u64::from(self.extra)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new week started; regular credits were set back to the maximum.
    Reset { boundary_ms: i64 },
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub max_regular: u32,
    pub boundary: WeeklyBoundary,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            max_regular: DEFAULT_MAX_REGULAR,
            boundary: WeeklyBoundary::default(),
        }
    }
}

/// Weekly-renewing dual-pool usage credits.
///
/// All balance reads and writes happen under one lock, and every mutation is
/// persisted before the in-memory copy changes. Time only ever comes from
/// the [`NetworkTimeSource`]; the local clock is never consulted.
pub struct QuotaLedger {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn NetworkTimeSource>,
    policy: QuotaPolicy,
    balance: Mutex<CreditBalance>,
    offline: AtomicBool,
}

impl QuotaLedger {
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn NetworkTimeSource>,
        policy: QuotaPolicy,
    ) -> Result<Self, QuotaError> {
        let balance = load_balance(store.as_ref(), &policy)?;
        tracing::debug!(?balance, "credit ledger loaded");
        Ok(Self {
            store,
            clock,
            policy,
            balance: Mutex::new(balance),
            offline: AtomicBool::new(false),
        })
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    /// Applies the weekly reset if a new week has begun.
    ///
    /// A failed time fetch leaves balances untouched and flags the ledger as
    /// offline until the next successful refresh.
    pub fn refresh(&self) -> Result<RefreshOutcome, QuotaError> {
        let boundary_ms = match self.clock.now_ms().and_then(|now_ms| {
            self.policy
                .boundary
                .week_start_ms(now_ms)
                .ok_or_else(|| TimeUnavailable::new(format!("timestamp {now_ms} out of range")))
        }) {
            Ok(boundary_ms) => boundary_ms,
            Err(error) => {
                tracing::warn!("Network time verification failed, entering offline mode: {error}");
                self.offline.store(true, Ordering::SeqCst);
                return Err(error.into());
            }
        };
        self.offline.store(false, Ordering::SeqCst);

        let mut balance = self.balance.lock();
        if boundary_ms <= balance.last_reset_ms {
            return Ok(RefreshOutcome::Unchanged);
        }
        self.store.commit(&[
            Edit::set(keys::CREDITS_REGULAR, self.policy.max_regular),
            Edit::set(keys::CREDITS_LAST_RESET, boundary_ms),
        ])?;
        balance.regular = self.policy.max_regular;
        balance.last_reset_ms = boundary_ms;
        tracing::info!(
            boundary_ms,
            regular = balance.regular,
            "weekly credit reset applied"
        );
        Ok(RefreshOutcome::Reset { boundary_ms })
    }

    /// Spends one credit, regular pool first. `false` when both pools are empty.
    pub fn consume(&self) -> Result<bool, QuotaError> {
        let mut balance = self.balance.lock();
        let pool = if balance.regular > 0 {
            CreditPool::Regular
        } else if balance.extra > 0 {
            CreditPool::Extra
        } else {
            tracing::debug!("no credits left to consume");
            return Ok(false);
        };

        let mut next = *balance;
        match pool {
            CreditPool::Regular => next.regular -= 1,
            CreditPool::Extra => next.extra -= 1,
        }
        next.last_consumed = Some(pool);
        self.store.commit(&[
            pool_edit(pool, &next),
            Edit::set(keys::CREDITS_LAST_CONSUMED_POOL, pool),
        ])?;
        *balance = next;
        tracing::debug!(%pool, regular = next.regular, extra = next.extra, "credit consumed");
        Ok(true)
    }

    /// Returns the most recently consumed credit to its pool, at most once.
    pub fn refund(&self) -> Result<Option<CreditPool>, QuotaError> {
        let mut balance = self.balance.lock();
        let Some(pool) = balance.last_consumed else {
            return Ok(None);
        };

        let mut next = *balance;
        match pool {
            CreditPool::Regular => {
                next.regular = next.regular.saturating_add(1).min(self.policy.max_regular)
            }
            CreditPool::Extra => next.extra = next.extra.saturating_add(1),
        }
        next.last_consumed = None;
        self.store.commit(&[
            pool_edit(pool, &next),
            Edit::remove(keys::CREDITS_LAST_CONSUMED_POOL),
        ])?;
        *balance = next;
        tracing::debug!(%pool, regular = next.regular, extra = next.extra, "credit refunded");
        Ok(Some(pool))
    }

    /// Adds earned credits. Returns the new extra balance.
    pub fn add_extra(&self, amount: u32) -> Result<u32, QuotaError> {
        let mut balance = self.balance.lock();
        let extra = balance.extra.saturating_add(amount);
        self.store.set(keys::CREDITS_EXTRA, &extra.to_string())?;
        balance.extra = extra;
        tracing::debug!(amount, extra, "extra credits added");
        Ok(extra)
    }

    pub fn total_credits(&self) -> u64 {
        self.balance.lock().total()
    }

    pub fn balance(&self) -> CreditBalance {
        *self.balance.lock()
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }
}

fn pool_edit(pool: CreditPool, balance: &CreditBalance) -> Edit {
    match pool {
        CreditPool::Regular => Edit::set(keys::CREDITS_REGULAR, balance.regular),
        CreditPool::Extra => Edit::set(keys::CREDITS_EXTRA, balance.extra),
    }
}

fn load_balance(
    store: &dyn KeyValueStore,
    policy: &QuotaPolicy,
) -> Result<CreditBalance, StoreError> {
    let regular: u32 = read_parsed(store, keys::CREDITS_REGULAR)?.unwrap_or(policy.max_regular);
    let extra: u32 = read_parsed(store, keys::CREDITS_EXTRA)?.unwrap_or(0);
    let last_reset_ms: i64 = read_parsed(store, keys::CREDITS_LAST_RESET)?.unwrap_or(0);
    let last_consumed: Option<CreditPool> = read_parsed(store, keys::CREDITS_LAST_CONSUMED_POOL)?;

    if regular > policy.max_regular {
        tracing::warn!(
            regular,
            max = policy.max_regular,
            "persisted regular credits above cap, clamping"
        );
    }
    Ok(CreditBalance {
        regular: regular.min(policy.max_regular),
        extra,
        last_reset_ms,
        last_consumed,
    })
}

/// `None` when the key is absent or holds something unparseable.
fn read_parsed<T>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>, StoreError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };
    match raw.parse() {
        Ok(value) => Ok(Some(value)),
        Err(error) => {
            tracing::warn!("Ignoring malformed value for {key} ({raw:?}): {error}");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const MONDAY_KST: i64 = 1_760_281_200_000; // 2025-10-13T00:00:00+09:00
    const THURSDAY_KST: i64 = 1_760_596_200_000;
    const WEEK_MS: i64 = 7 * 24 * 60 * 60 * 1000;

    /// Network clock the test can move or take offline.
    #[derive(Default)]
    struct FakeClock(Mutex<Option<i64>>);

    impl FakeClock {
        fn at(now_ms: i64) -> Self {
            Self(Mutex::new(Some(now_ms)))
        }

        fn set(&self, now_ms: Option<i64>) {
            *self.0.lock() = now_ms;
        }
    }

    impl NetworkTimeSource for FakeClock {
        fn now_ms(&self) -> Result<i64, TimeUnavailable> {
            self.0
                .lock()
                .ok_or_else(|| TimeUnavailable::new("clock offline"))
        }
    }

    fn ledger_with(store: Arc<MemoryStore>, clock: Arc<FakeClock>) -> QuotaLedger {
        QuotaLedger::open(store, clock, QuotaPolicy::default()).unwrap()
    }

    fn ledger() -> (QuotaLedger, Arc<MemoryStore>, Arc<FakeClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FakeClock::at(THURSDAY_KST));
        (ledger_with(store.clone(), clock.clone()), store, clock)
    }

    #[test]
    fn fresh_ledger_starts_full() {
        let (ledger, _, _) = ledger();
        assert_eq!(
            ledger.balance(),
            CreditBalance {
                regular: 10,
                extra: 0,
                last_reset_ms: 0,
                last_consumed: None
            }
        );
        assert_eq!(ledger.total_credits(), 10);
        assert!(!ledger.is_offline());
    }

    #[test]
    fn regular_pool_drains_before_extra() {
        let (ledger, store, _) = ledger();
        ledger.add_extra(2).unwrap();

        for _ in 0..10 {
            assert!(ledger.consume().unwrap());
            assert_eq!(ledger.balance().last_consumed, Some(CreditPool::Regular));
            assert_eq!(ledger.balance().extra, 2);
        }
        assert!(ledger.consume().unwrap());
        assert_eq!(ledger.balance().last_consumed, Some(CreditPool::Extra));
        assert!(ledger.consume().unwrap());
        assert_eq!(ledger.total_credits(), 0);

        let before = store.snapshot();
        assert!(!ledger.consume().unwrap());
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn refund_restores_consumed_pool_once() {
        let (ledger, store, _) = ledger();
        ledger.consume().unwrap();
        assert_eq!(ledger.balance().regular, 9);

        assert_eq!(ledger.refund().unwrap(), Some(CreditPool::Regular));
        assert_eq!(ledger.balance().regular, 10);
        assert_eq!(store.get(keys::CREDITS_LAST_CONSUMED_POOL).unwrap(), None);

        assert_eq!(ledger.refund().unwrap(), None);
        assert_eq!(ledger.balance().regular, 10);
    }

    #[test]
    fn refund_goes_back_to_extra_pool() {
        let (ledger, _, _) = ledger();
        ledger.add_extra(1).unwrap();
        for _ in 0..11 {
            ledger.consume().unwrap();
        }
        assert_eq!(ledger.balance().extra, 0);

        assert_eq!(ledger.refund().unwrap(), Some(CreditPool::Extra));
        assert_eq!(ledger.balance().extra, 1);
        assert_eq!(ledger.balance().regular, 0);
    }

    #[test]
    fn refund_never_exceeds_regular_cap() {
        let (ledger, _, clock) = ledger();
        ledger.refresh().unwrap();
        ledger.consume().unwrap();

        // a reset lands between consume and refund
        clock.set(Some(THURSDAY_KST + WEEK_MS));
        ledger.refresh().unwrap();
        assert_eq!(ledger.balance().regular, 10);

        assert_eq!(ledger.refund().unwrap(), Some(CreditPool::Regular));
        assert_eq!(ledger.balance().regular, 10);
    }

    #[test]
    fn weekly_reset_applies_once_per_boundary() {
        let (ledger, store, clock) = ledger();

        assert_eq!(
            ledger.refresh().unwrap(),
            RefreshOutcome::Reset {
                boundary_ms: MONDAY_KST
            }
        );
        ledger.consume().unwrap();
        ledger.consume().unwrap();

        clock.set(Some(THURSDAY_KST + 60 * 60 * 1000));
        assert_eq!(ledger.refresh().unwrap(), RefreshOutcome::Unchanged);
        assert_eq!(ledger.balance().regular, 8);

        clock.set(Some(MONDAY_KST + WEEK_MS));
        assert_eq!(
            ledger.refresh().unwrap(),
            RefreshOutcome::Reset {
                boundary_ms: MONDAY_KST + WEEK_MS
            }
        );
        assert_eq!(ledger.balance().regular, 10);
        assert_eq!(
            store.get(keys::CREDITS_LAST_RESET).unwrap().as_deref(),
            Some("1760886000000")
        );
        assert_eq!(ledger.refresh().unwrap(), RefreshOutcome::Unchanged);
    }

    #[test]
    fn reset_sets_regular_absolutely_and_keeps_extra() {
        let store = Arc::new(MemoryStore::new());
        store
            .commit(&[
                Edit::set(keys::CREDITS_REGULAR, 3),
                Edit::set(keys::CREDITS_EXTRA, 4),
                Edit::set(keys::CREDITS_LAST_RESET, MONDAY_KST - WEEK_MS),
            ])
            .unwrap();
        let ledger = ledger_with(store, Arc::new(FakeClock::at(THURSDAY_KST)));

        ledger.refresh().unwrap();

        assert_eq!(ledger.balance().regular, 10);
        assert_eq!(ledger.balance().extra, 4);
    }

    #[test]
    fn offline_refresh_leaves_balances_untouched() {
        let (ledger, store, clock) = ledger();
        ledger.consume().unwrap();
        clock.set(None);
        let before = store.snapshot();

        let error = ledger.refresh().unwrap_err();

        assert!(error.is_transient());
        assert!(ledger.is_offline());
        assert_eq!(store.snapshot(), before);
        assert_eq!(ledger.balance().regular, 9);

        clock.set(Some(THURSDAY_KST));
        ledger.refresh().unwrap();
        assert!(!ledger.is_offline());
    }

    #[test]
    fn out_of_range_time_counts_as_offline() {
        let (ledger, store, clock) = ledger();
        ledger.refresh().unwrap();
        ledger.consume().unwrap();
        assert!(!ledger.is_offline());
        clock.set(Some(i64::MAX));
        let before = store.snapshot();

        let error = ledger.refresh().unwrap_err();

        assert!(matches!(error, QuotaError::TimeUnavailable(_)));
        assert!(ledger.is_offline());
        assert_eq!(store.snapshot(), before);
        assert_eq!(ledger.balance().regular, 9);
    }

    #[test]
    fn state_survives_reopen() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(FakeClock::at(THURSDAY_KST));
        {
            let ledger = ledger_with(store.clone(), clock.clone());
            ledger.refresh().unwrap();
            ledger.add_extra(5).unwrap();
            ledger.consume().unwrap();
        }

        let reopened = ledger_with(store, clock);
        assert_eq!(
            reopened.balance(),
            CreditBalance {
                regular: 9,
                extra: 5,
                last_reset_ms: MONDAY_KST,
                last_consumed: Some(CreditPool::Regular)
            }
        );
        assert_eq!(reopened.refresh().unwrap(), RefreshOutcome::Unchanged);
        assert_eq!(reopened.refund().unwrap(), Some(CreditPool::Regular));
    }

    #[test]
    fn persisted_values_are_clamped_or_defaulted() {
        let store = Arc::new(MemoryStore::new());
        store
            .commit(&[
                Edit::set(keys::CREDITS_REGULAR, 15),
                Edit::set(keys::CREDITS_EXTRA, "lots"),
                Edit::set(keys::CREDITS_LAST_CONSUMED_POOL, "BONUS"),
            ])
            .unwrap();

        let ledger = ledger_with(store, Arc::new(FakeClock::default()));

        let balance = ledger.balance();
        assert_eq!(balance.regular, 10);
        assert_eq!(balance.extra, 0);
        assert_eq!(balance.last_consumed, None);
    }

    #[test]
    fn concurrent_consumers_never_overspend() {
        let (ledger, _, _) = ledger();
        ledger.add_extra(5).unwrap();
        let ledger = Arc::new(ledger);

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    (0..4).filter(|_| ledger.consume().unwrap()).count()
                })
            })
            .collect();
        let spent: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();

        assert_eq!(spent, 15);
        assert_eq!(ledger.total_credits(), 0);
    }

    #[test]
    fn custom_cap_is_respected() {
        let policy = QuotaPolicy {
            max_regular: 3,
            ..QuotaPolicy::default()
        };
        let ledger = QuotaLedger::open(
            Arc::new(MemoryStore::new()),
            Arc::new(FakeClock::at(THURSDAY_KST)),
            policy,
        )
        .unwrap();

        assert_eq!(ledger.balance().regular, 3);
        ledger.refresh().unwrap();
        assert_eq!(ledger.balance().regular, 3);
    }
}

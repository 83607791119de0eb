//! Weekly usage credits gating paid remote operations.

mod clock;
mod ledger;
mod week;

pub use clock::{
    HttpDateTimeSource, NetworkTimeSource, TimeUnavailable, DEFAULT_TIME_TIMEOUT, DEFAULT_TIME_URL,
};
pub use ledger::{
    CreditBalance, CreditPool, QuotaError, QuotaLedger, QuotaPolicy, RefreshOutcome,
    DEFAULT_MAX_REGULAR,
};
pub use week::WeeklyBoundary;

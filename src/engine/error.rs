use ulid::Ulid;

use crate::hours::HoursError;
use crate::lifecycle::LifecycleError;
use crate::model::{format_hhmm, Min};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    Invalid(String),
    OutsideHours(HoursError),
    Unauthorized(String),
    PrepaymentRequired(Ulid),
    /// The client already holds this overlapping appointment.
    ClientOverlap(Ulid),
    SlotFull {
        slot: Min,
        capacity: u32,
    },
    Lifecycle(LifecycleError),
    PaymentInsufficient {
        paid: u64,
        required: u64,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable code returned to callers.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Unauthorized(_) => "UNAUTHORIZED",
            EngineError::PrepaymentRequired(_) => "PREPAYMENT_REQUIRED",
            EngineError::ClientOverlap(_) => "CLIENT_OVERLAP",
            EngineError::SlotFull { .. } => "SLOT_FULL",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Lifecycle(_) => "ILLEGAL_TRANSITION",
            EngineError::PaymentInsufficient { .. } => "PAYMENT_INSUFFICIENT",
            EngineError::AlreadyExists(_)
            | EngineError::Invalid(_)
            | EngineError::OutsideHours(_)
            | EngineError::LimitExceeded(_) => "INVALID",
            EngineError::WalError(_) => "INTERNAL",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = self.code();
        match self {
            EngineError::NotFound(id) => write!(f, "{code}: not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "{code}: already exists: {id}"),
            EngineError::Invalid(msg) => write!(f, "{code}: {msg}"),
            EngineError::OutsideHours(e) => write!(f, "{code}: {e}"),
            EngineError::Unauthorized(msg) => write!(f, "{code}: {msg}"),
            EngineError::PrepaymentRequired(client) => {
                write!(f, "{code}: client {client} must pay in advance to book")
            }
            EngineError::ClientOverlap(id) => {
                write!(f, "{code}: client already has overlapping appointment {id}")
            }
            EngineError::SlotFull { slot, capacity } => {
                write!(f, "{code}: slot {} is at capacity {capacity}", format_hhmm(*slot))
            }
            EngineError::Lifecycle(e) => write!(f, "{code}: {e}"),
            EngineError::PaymentInsufficient { paid, required } => {
                write!(f, "{code}: payment {paid} is below the required advance {required}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "{code}: limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "{code}: WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<LifecycleError> for EngineError {
    fn from(e: LifecycleError) -> Self {
        EngineError::Lifecycle(e)
    }
}

impl From<HoursError> for EngineError {
    fn from(e: HoursError) -> Self {
        EngineError::OutsideHours(e)
    }
}

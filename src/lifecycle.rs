use serde::{Deserialize, Serialize};

/// Appointment status. COMPLETED, CANCELLED and NO_SHOW are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    PendingPayment,
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

/// A requested status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    PaymentReceived,
    Cancel,
    Start,
    Complete,
    MarkNoShow,
}

/// Who is asking for the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Manual,
    Sweep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    Terminal(AppointmentStatus),
    Illegal {
        from: AppointmentStatus,
        transition: Transition,
    },
    SweepOnly(Transition),
    ManualOnly(Transition),
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::Terminal(s) => write!(f, "appointment is {} and cannot change", s.as_str()),
            LifecycleError::Illegal { from, transition } => {
                write!(f, "cannot {} from {}", transition.as_str(), from.as_str())
            }
            LifecycleError::SweepOnly(t) => write!(f, "{} is applied by the maintenance sweep only", t.as_str()),
            LifecycleError::ManualOnly(t) => write!(f, "{} must be requested manually", t.as_str()),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl Transition {
    pub fn as_str(self) -> &'static str {
        match self {
            Transition::PaymentReceived => "confirm payment",
            Transition::Cancel => "cancel",
            Transition::Start => "start",
            Transition::Complete => "complete",
            Transition::MarkNoShow => "mark no-show",
        }
    }

    fn allowed_trigger(self) -> Trigger {
        match self {
            Transition::MarkNoShow => Trigger::Sweep,
            Transition::PaymentReceived
            | Transition::Cancel
            | Transition::Start
            | Transition::Complete => Trigger::Manual,
        }
    }
}

impl AppointmentStatus {
    /// Status a new booking starts in.
    pub fn initial(requires_advance_payment: bool) -> Self {
        if requires_advance_payment {
            AppointmentStatus::PendingPayment
        } else {
            AppointmentStatus::Scheduled
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed | AppointmentStatus::Cancelled | AppointmentStatus::NoShow
        )
    }

    /// Statuses that block the client from a second overlapping booking,
    /// receive reminders and get swept to NO_SHOW.
    pub fn is_open(self) -> bool {
        matches!(self, AppointmentStatus::Scheduled | AppointmentStatus::PendingPayment)
    }

    /// Statuses that occupy slot capacity. PENDING_PAYMENT does not.
    pub fn consumes_capacity(self) -> bool {
        matches!(self, AppointmentStatus::Scheduled | AppointmentStatus::InProgress)
    }

    /// The transition table.
    pub fn next(self, transition: Transition, trigger: Trigger) -> Result<Self, LifecycleError> {
        use AppointmentStatus::*;

        if self.is_terminal() {
            return Err(LifecycleError::Terminal(self));
        }
        match (transition.allowed_trigger(), trigger) {
            (Trigger::Sweep, Trigger::Manual) => return Err(LifecycleError::SweepOnly(transition)),
            (Trigger::Manual, Trigger::Sweep) => return Err(LifecycleError::ManualOnly(transition)),
            _ => {}
        }

        match (self, transition) {
            (PendingPayment, Transition::PaymentReceived) => Ok(Scheduled),
            (PendingPayment | Scheduled, Transition::Cancel) => Ok(Cancelled),
            (Scheduled, Transition::Start) => Ok(InProgress),
            (InProgress, Transition::Complete) => Ok(Completed),
            (PendingPayment | Scheduled, Transition::MarkNoShow) => Ok(NoShow),
            (PendingPayment | Scheduled | InProgress, _) => {
                Err(LifecycleError::Illegal { from: self, transition })
            }
            (Completed | Cancelled | NoShow, _) => Err(LifecycleError::Terminal(self)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::PendingPayment => "pending_payment",
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::InProgress => "in_progress",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending_payment" => Some(AppointmentStatus::PendingPayment),
            "scheduled" => Some(AppointmentStatus::Scheduled),
            "in_progress" => Some(AppointmentStatus::InProgress),
            "completed" => Some(AppointmentStatus::Completed),
            "cancelled" => Some(AppointmentStatus::Cancelled),
            "no_show" => Some(AppointmentStatus::NoShow),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AppointmentStatus::*;
    use super::*;

    const ALL: [AppointmentStatus; 6] = [PendingPayment, Scheduled, InProgress, Completed, Cancelled, NoShow];

    #[test]
    fn initial_status_follows_package() {
        assert_eq!(AppointmentStatus::initial(true), PendingPayment);
        assert_eq!(AppointmentStatus::initial(false), Scheduled);
    }

    #[test]
    fn happy_paths() {
        let s = PendingPayment.next(Transition::PaymentReceived, Trigger::Manual).unwrap();
        assert_eq!(s, Scheduled);
        let s = s.next(Transition::Start, Trigger::Manual).unwrap();
        assert_eq!(s, InProgress);
        assert_eq!(s.next(Transition::Complete, Trigger::Manual).unwrap(), Completed);
    }

    #[test]
    fn cancel_from_open_states_only() {
        assert_eq!(PendingPayment.next(Transition::Cancel, Trigger::Manual).unwrap(), Cancelled);
        assert_eq!(Scheduled.next(Transition::Cancel, Trigger::Manual).unwrap(), Cancelled);
        assert!(matches!(
            InProgress.next(Transition::Cancel, Trigger::Manual),
            Err(LifecycleError::Illegal { .. })
        ));
    }

    #[test]
    fn no_show_is_sweep_only() {
        assert_eq!(Scheduled.next(Transition::MarkNoShow, Trigger::Sweep).unwrap(), NoShow);
        assert_eq!(PendingPayment.next(Transition::MarkNoShow, Trigger::Sweep).unwrap(), NoShow);
        assert_eq!(
            Scheduled.next(Transition::MarkNoShow, Trigger::Manual),
            Err(LifecycleError::SweepOnly(Transition::MarkNoShow))
        );
        assert!(InProgress.next(Transition::MarkNoShow, Trigger::Sweep).is_err());
    }

    #[test]
    fn sweep_cannot_drive_manual_transitions() {
        assert_eq!(
            Scheduled.next(Transition::Cancel, Trigger::Sweep),
            Err(LifecycleError::ManualOnly(Transition::Cancel))
        );
    }

    #[test]
    fn payment_only_from_pending() {
        assert!(Scheduled.next(Transition::PaymentReceived, Trigger::Manual).is_err());
        assert!(PendingPayment.next(Transition::Start, Trigger::Manual).is_err());
    }

    #[test]
    fn nothing_leaves_terminal_states() {
        let transitions = [
            (Transition::PaymentReceived, Trigger::Manual),
            (Transition::Cancel, Trigger::Manual),
            (Transition::Start, Trigger::Manual),
            (Transition::Complete, Trigger::Manual),
            (Transition::MarkNoShow, Trigger::Sweep),
        ];
        for s in ALL.into_iter().filter(|s| s.is_terminal()) {
            for (t, trig) in transitions {
                assert_eq!(s.next(t, trig), Err(LifecycleError::Terminal(s)), "{s:?} {t:?}");
            }
        }
    }

    #[test]
    fn capacity_and_open_sets() {
        let consuming: Vec<_> = ALL.into_iter().filter(|s| s.consumes_capacity()).collect();
        assert_eq!(consuming, vec![Scheduled, InProgress]);
        let open: Vec<_> = ALL.into_iter().filter(|s| s.is_open()).collect();
        assert_eq!(open, vec![PendingPayment, Scheduled]);
    }

    #[test]
    fn status_strings_roundtrip() {
        for s in ALL {
            assert_eq!(AppointmentStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(AppointmentStatus::parse("SCHEDULED"), Some(Scheduled));
        assert_eq!(AppointmentStatus::parse("booked"), None);
    }
}

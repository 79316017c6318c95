use ulid::Ulid;

use crate::hours::sub_slots;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Reject if `client` already holds an open (scheduled or awaiting payment)
/// appointment on this day that overlaps `span`. Independent of capacity.
pub(crate) fn check_client_overlap(
    day: &DayState,
    client: ClientRef,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let clash = day.overlapping(span).find(|a| {
        a.client == client && a.status.is_open() && Some(a.id) != exclude
    });
    match clash {
        Some(a) => Err(EngineError::ClientOverlap(a.id)),
        None => Ok(()),
    }
}

/// Number of capacity-consuming appointments overlapping `slot`.
pub(crate) fn occupancy(day: &DayState, slot: &Span, exclude: Option<Ulid>) -> u32 {
    day.overlapping(slot)
        .filter(|a| a.status.consumes_capacity() && Some(a.id) != exclude)
        .count() as u32
}

/// Reject if any 30-minute slot covered by `span` is already at capacity.
/// Appointments awaiting payment do not hold capacity.
pub(crate) fn check_capacity(
    day: &DayState,
    span: &Span,
    capacity: u32,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    for slot in sub_slots(*span) {
        if occupancy(day, &slot, exclude) >= capacity {
            return Err(EngineError::SlotFull {
                slot: slot.start,
                capacity,
            });
        }
    }
    Ok(())
}

/// Both booking checks, client overlap first.
pub(crate) fn check_booking(
    day: &DayState,
    client: ClientRef,
    span: &Span,
    capacity: u32,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    check_client_overlap(day, client, span, exclude)?;
    check_capacity(day, span, capacity, exclude)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::AppointmentStatus;
    use crate::model::fixtures::*;

    fn day_with(appointments: Vec<Appointment>) -> DayState {
        let mut ds = DayState::new(day(2026, 3, 2));
        for a in appointments {
            ds.insert(a);
        }
        ds
    }

    fn at(client: ClientRef, start: Min, end: Min, status: AppointmentStatus) -> Appointment {
        appointment(client, day(2026, 3, 2), Span::new(start, end), status)
    }

    fn parent() -> ClientRef {
        ClientRef::Parent(Ulid::new())
    }

    #[test]
    fn two_half_hour_bookings_fill_capacity_two() {
        let mut ds = day_with(vec![]);
        let first = Span::new(hm(9, 0), hm(9, 30));
        for _ in 0..2 {
            let c = parent();
            check_booking(&ds, c, &first, 2, None).unwrap();
            ds.insert(at(c, first.start, first.end, AppointmentStatus::Scheduled));
        }

        let third = Span::new(hm(9, 15), hm(9, 45));
        let err = check_booking(&ds, parent(), &third, 2, None).unwrap_err();
        assert!(matches!(err, EngineError::SlotFull { slot, capacity: 2 } if slot == hm(9, 0)));
    }

    #[test]
    fn same_client_overlap_rejected_despite_capacity() {
        let c = parent();
        let ds = day_with(vec![at(c, hm(9, 0), hm(10, 0), AppointmentStatus::Scheduled)]);
        let err = check_booking(&ds, c, &Span::new(hm(9, 30), hm(10, 30)), 5, None).unwrap_err();
        assert!(matches!(err, EngineError::ClientOverlap(_)));
    }

    #[test]
    fn client_overlap_is_half_open() {
        let c = parent();
        let ds = day_with(vec![at(c, hm(9, 0), hm(10, 0), AppointmentStatus::Scheduled)]);
        assert!(check_client_overlap(&ds, c, &Span::new(hm(10, 0), hm(11, 0)), None).is_ok());
        assert!(check_client_overlap(&ds, c, &Span::new(hm(8, 0), hm(9, 0)), None).is_ok());
    }

    #[test]
    fn pending_payment_blocks_client_but_not_capacity() {
        let c = parent();
        let ds = day_with(vec![at(c, hm(9, 0), hm(10, 0), AppointmentStatus::PendingPayment)]);
        let span = Span::new(hm(9, 0), hm(10, 0));
        assert!(check_capacity(&ds, &span, 1, None).is_ok());
        assert!(matches!(
            check_client_overlap(&ds, c, &span, None),
            Err(EngineError::ClientOverlap(_))
        ));
    }

    #[test]
    fn in_progress_consumes_capacity_but_not_client() {
        let c = parent();
        let ds = day_with(vec![at(c, hm(9, 0), hm(10, 0), AppointmentStatus::InProgress)]);
        let span = Span::new(hm(9, 30), hm(10, 0));
        assert!(check_client_overlap(&ds, c, &span, None).is_ok());
        assert!(check_capacity(&ds, &span, 1, None).is_err());
    }

    #[test]
    fn terminal_statuses_release_everything() {
        let c = parent();
        let ds = day_with(vec![
            at(c, hm(9, 0), hm(10, 0), AppointmentStatus::Cancelled),
            at(c, hm(9, 0), hm(10, 0), AppointmentStatus::NoShow),
            at(c, hm(9, 0), hm(10, 0), AppointmentStatus::Completed),
        ]);
        assert!(check_booking(&ds, c, &Span::new(hm(9, 0), hm(10, 0)), 1, None).is_ok());
    }

    #[test]
    fn excluded_appointment_does_not_conflict_with_itself() {
        let c = parent();
        let existing = at(c, hm(9, 0), hm(10, 0), AppointmentStatus::Scheduled);
        let id = existing.id;
        let ds = day_with(vec![existing]);
        let shifted = Span::new(hm(9, 30), hm(10, 30));
        assert!(check_booking(&ds, c, &shifted, 1, Some(id)).is_ok());
        assert!(check_booking(&ds, c, &shifted, 1, None).is_err());
    }

    #[test]
    fn multi_slot_session_checks_every_slot() {
        let ds = day_with(vec![at(parent(), hm(10, 0), hm(10, 30), AppointmentStatus::Scheduled)]);
        // 09:00–10:30 covers 09:00, 09:30 and 10:00; the last one is full.
        let err = check_capacity(&ds, &Span::new(hm(9, 0), hm(10, 30)), 1, None).unwrap_err();
        assert!(matches!(err, EngineError::SlotFull { slot, .. } if slot == hm(10, 0)));
        assert!(check_capacity(&ds, &Span::new(hm(9, 0), hm(10, 0)), 1, None).is_ok());
    }

    #[test]
    fn occupancy_never_exceeds_capacity_under_greedy_admission() {
        let mut ds = day_with(vec![]);
        let capacity = 3;
        let starts = [0, 30, 0, 60, 30, 0, 90, 30, 60, 0, 30, 60];
        for (i, s) in starts.iter().enumerate() {
            let span = Span::new(hm(9, 0) + s, hm(9, 0) + s + 30 * (1 + i as Min % 2));
            let c = parent();
            if check_booking(&ds, c, &span, capacity, None).is_ok() {
                ds.insert(at(c, span.start, span.end, AppointmentStatus::Scheduled));
            }
        }
        for slot in sub_slots(Span::new(hm(9, 0), hm(11, 0))) {
            assert!(occupancy(&ds, &slot, None) <= capacity);
        }
    }
}

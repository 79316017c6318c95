use chrono::NaiveDate;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::hours::DEFAULT_SESSION_MINUTES;
use crate::lifecycle::{AppointmentStatus, Transition, Trigger};
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_booking, check_capacity, now_ms};
use super::{Engine, EngineError, WalCommand};

/// A create-booking request after wire parsing.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub id: Ulid,
    pub client: ClientRef,
    pub date: NaiveDate,
    pub start: Min,
    pub purchase_id: Option<Ulid>,
    pub package_id: Option<Ulid>,
    /// Raw JSON; must be an object when present.
    pub schedule_preferences: Option<String>,
}

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn validate_preferences(raw: &str) -> Result<(), EngineError> {
    check_len(raw, MAX_PREFERENCES_LEN, "schedule preferences too large")?;
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(_)) => Ok(()),
        Ok(_) => Err(EngineError::Invalid("schedule preferences must be a JSON object".into())),
        Err(e) => Err(EngineError::Invalid(format!("schedule preferences: {e}"))),
    }
}

impl Engine {
    // ── Clients & packages ───────────────────────────────────

    /// Insert or update a client. Counters and flags the engine maintains
    /// (`no_show_count`, `requires_prepayment`, `active`) survive updates.
    pub async fn save_client(&self, mut client: Client) -> Result<Client, EngineError> {
        if client.name.trim().is_empty() {
            return Err(EngineError::Invalid("client name is required".into()));
        }
        check_len(&client.name, MAX_NAME_LEN, "client name too long")?;
        for contact in [&client.email, &client.phone].into_iter().flatten() {
            check_len(contact, MAX_CONTACT_LEN, "contact too long")?;
        }
        match client.kind {
            ClientKind::Parent if !client.parent_ids.is_empty() => {
                return Err(EngineError::Invalid("a parent cannot have parents".into()));
            }
            ClientKind::Baby if client.parent_ids.len() > MAX_PARENTS_PER_BABY => {
                return Err(EngineError::LimitExceeded("too many parents"));
            }
            _ => {}
        }
        client.parent_ids.sort();
        client.parent_ids.dedup();
        for pid in &client.parent_ids {
            match self.registry.client(pid) {
                Some(p) if p.kind == ClientKind::Parent => {}
                Some(_) => return Err(EngineError::Invalid(format!("{pid} is not a parent"))),
                None => return Err(EngineError::NotFound(*pid)),
            }
        }

        let _gate = self.gate().await;
        let _registry = self.registry_lock.lock().await;
        match self.registry.client(&client.id) {
            Some(existing) => {
                if existing.kind != client.kind {
                    return Err(EngineError::Invalid("client kind cannot change".into()));
                }
                client.no_show_count = existing.no_show_count;
                client.requires_prepayment = existing.requires_prepayment;
                client.active = existing.active;
            }
            None if self.registry.client_count() >= MAX_CLIENTS => {
                return Err(EngineError::LimitExceeded("too many clients"));
            }
            None => {}
        }
        let event = Event::ClientSaved { client: client.clone() };
        self.persist_registry(&event).await?;
        Ok(client)
    }

    pub async fn save_package(&self, package: Package) -> Result<(), EngineError> {
        if package.name.trim().is_empty() {
            return Err(EngineError::Invalid("package name is required".into()));
        }
        check_len(&package.name, MAX_NAME_LEN, "package name too long")?;
        if package.duration_minutes <= 0 || package.duration_minutes > MAX_SESSION_MINUTES {
            return Err(EngineError::Invalid(format!(
                "package duration {} out of range",
                package.duration_minutes
            )));
        }
        let _gate = self.gate().await;
        self.persist_registry(&Event::PackageSaved { package }).await
    }

    pub async fn save_purchase(&self, purchase: PackagePurchase) -> Result<(), EngineError> {
        if self.registry.package(&purchase.package_id).is_none() {
            return Err(EngineError::NotFound(purchase.package_id));
        }
        let client = self
            .registry
            .client(&purchase.client.id())
            .ok_or(EngineError::NotFound(purchase.client.id()))?;
        if client.kind != purchase.client.kind() {
            return Err(EngineError::Invalid("client type does not match client".into()));
        }
        if self.registry.purchase(&purchase.id).is_some() {
            return Err(EngineError::AlreadyExists(purchase.id));
        }
        let _gate = self.gate().await;
        self.persist_registry(&Event::PurchaseSaved { purchase }).await
    }

    /// The package a booking uses: the purchase's package when a purchase
    /// is given, otherwise the explicit package.
    fn resolve_package(&self, req: &BookingRequest) -> Result<Option<Package>, EngineError> {
        let package_id = match req.purchase_id {
            Some(pid) => {
                let purchase = self.registry.purchase(&pid).ok_or(EngineError::NotFound(pid))?;
                if purchase.client != req.client {
                    return Err(EngineError::Invalid(format!(
                        "purchase {pid} belongs to another client"
                    )));
                }
                if req.package_id.is_some_and(|p| p != purchase.package_id) {
                    return Err(EngineError::Invalid(
                        "package does not match the purchased package".into(),
                    ));
                }
                Some(purchase.package_id)
            }
            None => req.package_id,
        };
        match package_id {
            Some(id) => self
                .registry
                .package(&id)
                .map(Some)
                .ok_or(EngineError::NotFound(id)),
            None => Ok(None),
        }
    }

    // ── Booking ──────────────────────────────────────────────

    /// Create an appointment. Input and ownership checks run first; the
    /// client-overlap and capacity checks run under the day's write lock
    /// together with the insert.
    pub async fn book(&self, req: BookingRequest) -> Result<BookingReceipt, EngineError> {
        let client = self
            .registry
            .client(&req.client.id())
            .ok_or(EngineError::NotFound(req.client.id()))?;
        if client.kind != req.client.kind() {
            return Err(EngineError::Invalid("client type does not match client".into()));
        }
        if !client.active {
            return Err(EngineError::Invalid(format!("client {} is inactive", client.id)));
        }
        if client.requires_prepayment {
            return Err(EngineError::PrepaymentRequired(client.id));
        }
        if let Some(raw) = &req.schedule_preferences {
            validate_preferences(raw)?;
        }
        let package = self.resolve_package(&req)?;
        let duration = package
            .as_ref()
            .map_or(DEFAULT_SESSION_MINUTES, |p| p.duration_minutes);
        let span = self.hours.session_span(req.date, req.start, duration)?;
        let capacity = self.hours.capacity_on(req.date);
        if self.registry.appointment_date(&req.id).is_some() {
            return Err(EngineError::AlreadyExists(req.id));
        }
        let requires_advance_payment = package.as_ref().is_some_and(|p| p.requires_advance_payment);

        let _gate = self.gate().await;
        let day = self.day(req.date);
        let mut guard = day.write().await;
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many appointments on this day"));
        }
        if guard.get(req.id).is_some() {
            return Err(EngineError::AlreadyExists(req.id));
        }
        check_booking(&guard, req.client, &span, capacity, None)?;

        let appointment = Appointment {
            id: req.id,
            client: req.client,
            date: req.date,
            span,
            status: AppointmentStatus::initial(requires_advance_payment),
            package_id: package.as_ref().map(|p| p.id),
            purchase_id: req.purchase_id,
            reminder_24h_sent: false,
            reminder_day_sent: false,
            payment_reminder_sent: false,
            cancel_reason: None,
            schedule_preferences: req.schedule_preferences,
            created_at: now_ms(),
        };
        let event = Event::AppointmentBooked {
            appointment: appointment.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;

        Ok(BookingReceipt {
            appointment,
            requires_advance_payment,
            advance_payment_amount: package
                .as_ref()
                .filter(|p| p.requires_advance_payment)
                .map_or(0, |p| p.advance_payment_amount),
            package_name: package.map(|p| p.name),
        })
    }

    /// Reschedule a SCHEDULED appointment. The session keeps its package
    /// duration and is checked like a new booking, minus itself.
    pub async fn move_appointment(
        &self,
        id: Ulid,
        to: NaiveDate,
        start: Min,
    ) -> Result<Appointment, EngineError> {
        let _gate = self.gate().await;
        let from = self
            .registry
            .appointment_date(&id)
            .ok_or(EngineError::NotFound(id))?;

        if from == to {
            let mut guard = self.day(from).write_owned().await;
            let current = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
            let span = self.moved_span(&current, to, start)?;
            check_booking(&guard, current.client, &span, self.hours.capacity_on(to), Some(id))?;
            let event = Event::AppointmentMoved { id, from, to, span };
            self.persist_and_apply(&mut guard, &event).await?;
            return guard.get(id).cloned().ok_or(EngineError::NotFound(id));
        }

        // Two days: lock in date order.
        let (src, dst) = (self.day(from), self.day(to));
        let (mut src_guard, mut dst_guard) = if from < to {
            let s = src.write_owned().await;
            (s, dst.write_owned().await)
        } else {
            let d = dst.write_owned().await;
            (src.write_owned().await, d)
        };
        let current = src_guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        let span = self.moved_span(&current, to, start)?;
        if dst_guard.appointments.len() >= MAX_APPOINTMENTS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many appointments on this day"));
        }
        check_booking(&dst_guard, current.client, &span, self.hours.capacity_on(to), None)?;
        let event = Event::AppointmentMoved { id, from, to, span };
        self.persist_cross_day_move(&mut src_guard, &mut dst_guard, &event)
            .await?;
        dst_guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    fn moved_span(&self, current: &Appointment, to: NaiveDate, start: Min) -> Result<Span, EngineError> {
        if current.status != AppointmentStatus::Scheduled {
            return Err(EngineError::Invalid(format!(
                "only scheduled appointments can be moved (status is {})",
                current.status.as_str()
            )));
        }
        let duration = current
            .package_id
            .and_then(|p| self.registry.package(&p))
            .map_or(current.span.duration(), |p| p.duration_minutes);
        Ok(self.hours.session_span(to, start, duration)?)
    }

    // ── Lifecycle ────────────────────────────────────────────

    /// PENDING_PAYMENT → SCHEDULED once the paid amount covers the package's
    /// advance payment and the session's slots still have room.
    pub async fn confirm_payment(&self, id: Ulid, paid: u64) -> Result<Appointment, EngineError> {
        let _gate = self.gate().await;
        let (date, mut guard) = self.resolve_appointment_write(&id).await?;
        let current = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        let next = current.status.next(Transition::PaymentReceived, Trigger::Manual)?;
        let required = current
            .package_id
            .and_then(|p| self.registry.package(&p))
            .filter(|p| p.requires_advance_payment)
            .map_or(0, |p| p.advance_payment_amount);
        if paid < required {
            return Err(EngineError::PaymentInsufficient { paid, required });
        }
        // Pending appointments hold no capacity, so the slots may have filled since booking.
        check_capacity(&guard, &current.span, self.hours.capacity_on(date), Some(id))?;
        self.change_status(date, &mut guard, id, next, None).await
    }

    pub async fn cancel(&self, id: Ulid, reason: &str) -> Result<Appointment, EngineError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EngineError::Invalid("a cancellation reason is required".into()));
        }
        check_len(reason, MAX_CANCEL_REASON_LEN, "cancellation reason too long")?;
        self.transition(id, Transition::Cancel, Some(reason.to_string()))
            .await
    }

    pub async fn start_session(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(id, Transition::Start, None).await
    }

    pub async fn complete_session(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(id, Transition::Complete, None).await
    }

    async fn transition(
        &self,
        id: Ulid,
        transition: Transition,
        cancel_reason: Option<String>,
    ) -> Result<Appointment, EngineError> {
        let _gate = self.gate().await;
        let (date, mut guard) = self.resolve_appointment_write(&id).await?;
        let current = guard.get(id).ok_or(EngineError::NotFound(id))?;
        let next = current.status.next(transition, Trigger::Manual)?;
        self.change_status(date, &mut guard, id, next, cancel_reason)
            .await
    }

    async fn change_status(
        &self,
        date: NaiveDate,
        guard: &mut DayState,
        id: Ulid,
        status: AppointmentStatus,
        cancel_reason: Option<String>,
    ) -> Result<Appointment, EngineError> {
        let event = Event::StatusChanged {
            id,
            date,
            status,
            cancel_reason,
        };
        self.persist_and_apply(guard, &event).await?;
        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    // ── Job-facing conditional updates ───────────────────────
    //
    // Each returns Ok(false) when the guarded flag or status had already
    // changed, so concurrent runs never act twice.

    /// Set a reminder flag if it is still unset.
    pub async fn mark_reminder_sent(&self, id: Ulid, kind: ReminderKind) -> Result<bool, EngineError> {
        let _gate = self.gate().await;
        let (date, mut guard) = self.resolve_appointment_write(&id).await?;
        let current = guard.get(id).ok_or(EngineError::NotFound(id))?;
        if current.reminder_sent(kind) {
            return Ok(false);
        }
        let event = Event::ReminderSent { id, date, kind };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Queue an outbound message and flag every appointment it covers, in
    /// one record. Skipped if any covered appointment was already flagged,
    /// is no longer open, or already has a pending message of this category.
    pub async fn queue_reminders(&self, date: NaiveDate, message: OutboundMessage) -> Result<bool, EngineError> {
        if message.appointment_ids.is_empty() {
            return Err(EngineError::Invalid("message covers no appointment".into()));
        }
        let _gate = self.gate().await;
        let day = self.existing_day(date).ok_or_else(|| {
            EngineError::Invalid(format!("no appointments on {date}"))
        })?;
        let mut guard = day.write().await;
        let kind = message.category.reminder();
        for id in &message.appointment_ids {
            let a = guard.get(*id).ok_or(EngineError::NotFound(*id))?;
            if a.reminder_sent(kind)
                || !a.status.is_open()
                || self.registry.has_pending_message(*id, message.category)
            {
                return Ok(false);
            }
        }
        let event = Event::RemindersQueued { date, message };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Transition an open appointment to NO_SHOW and count it against its
    /// client, in one record.
    pub async fn sweep_no_show(&self, id: Ulid) -> Result<bool, EngineError> {
        let _gate = self.gate().await;
        let (date, mut guard) = self.resolve_appointment_write(&id).await?;
        let current = guard.get(id).ok_or(EngineError::NotFound(id))?;
        if !current.status.is_open() {
            return Ok(false);
        }
        current.status.next(Transition::MarkNoShow, Trigger::Sweep)?;
        let event = Event::NoShowSwept {
            id,
            date,
            client_id: current.client.id(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Permanently require advance payment from a client.
    pub async fn require_prepayment(&self, client_id: Ulid) -> Result<bool, EngineError> {
        let _gate = self.gate().await;
        let _registry = self.registry_lock.lock().await;
        let client = self
            .registry
            .client(&client_id)
            .ok_or(EngineError::NotFound(client_id))?;
        if client.requires_prepayment {
            return Ok(false);
        }
        self.persist_registry(&Event::PrepaymentRequired { client_id })
            .await?;
        Ok(true)
    }

    pub async fn deactivate_client(&self, client_id: Ulid) -> Result<bool, EngineError> {
        let _gate = self.gate().await;
        let _registry = self.registry_lock.lock().await;
        let client = self
            .registry
            .client(&client_id)
            .ok_or(EngineError::NotFound(client_id))?;
        if !client.active {
            return Ok(false);
        }
        self.persist_registry(&Event::ClientDeactivated { client_id })
            .await?;
        Ok(true)
    }

    /// Record the deliverer's outcome for a pending message. Only pending
    /// messages change; returns false otherwise.
    pub async fn set_message_status(&self, id: Ulid, status: OutboundStatus) -> Result<bool, EngineError> {
        if status == OutboundStatus::Pending {
            return Err(EngineError::Invalid("a message cannot go back to pending".into()));
        }
        let _gate = self.gate().await;
        let _registry = self.registry_lock.lock().await;
        let message = self.registry.message(&id).ok_or(EngineError::NotFound(id))?;
        if message.status != OutboundStatus::Pending {
            return Ok(false);
        }
        self.persist_registry(&Event::MessageStatusChanged { id, status })
            .await?;
        Ok(true)
    }

    pub async fn post_notification(&self, notification: Notification) -> Result<(), EngineError> {
        let _gate = self.gate().await;
        self.persist_registry(&Event::NotificationPosted { notification })
            .await
    }

    pub async fn delete_notification(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.gate().await;
        self.persist_registry(&Event::NotificationDeleted { id }).await
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the records needed to rebuild current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Exclusive gate: no mutation is between its append and its apply.
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        for client in self.registry.clients() {
            events.push(Event::ClientSaved { client });
        }
        for package in self.registry.packages() {
            events.push(Event::PackageSaved { package });
        }
        for purchase in self.registry.purchases() {
            events.push(Event::PurchaseSaved { purchase });
        }
        for (_, day) in self.days_sorted() {
            let guard = day.read().await;
            for appointment in &guard.appointments {
                events.push(Event::AppointmentBooked {
                    appointment: appointment.clone(),
                });
            }
        }
        for message in self.registry.messages() {
            let Some(date) = message
                .appointment_ids
                .first()
                .and_then(|id| self.registry.appointment_date(id))
            else {
                continue;
            };
            events.push(Event::RemindersQueued { date, message });
        }
        for notification in self.registry.notifications() {
            events.push(Event::NotificationPosted { notification });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

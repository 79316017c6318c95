//! Request-facing booking operations: who may do what, and the
//! confirmation email that follows a successful booking.

use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::config::JobConfig;
use crate::engine::{BookingRequest, Engine, EngineError};
use crate::lifecycle::{AppointmentStatus, LifecycleError, Transition};
use crate::model::*;
use crate::sink::{NotificationSink, OutgoingEmail};
use crate::templates::{format_amount, format_date, TemplateKey, Templates};

const PARENT_USER_PREFIX: &str = "parent_";

/// The authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Staff,
    Parent(Ulid),
}

impl Actor {
    /// `parent_<ULID>` logs in as that parent; any other user is staff.
    pub fn from_user(user: &str) -> Self {
        match user.strip_prefix(PARENT_USER_PREFIX) {
            Some(id) => match Ulid::from_string(id) {
                Ok(id) => Actor::Parent(id),
                // An unparseable parent login gets no rights at all.
                Err(_) => Actor::Parent(Ulid::nil()),
            },
            None => Actor::Staff,
        }
    }
}

/// Placeholder values describing one appointment.
pub fn appointment_vars(engine: &Engine, a: &Appointment, cfg: &JobConfig) -> Vec<(&'static str, String)> {
    let client = engine
        .client(&a.client.id())
        .map(|c| c.name)
        .unwrap_or_default();
    let package = a.package_id.and_then(|p| engine.package(&p));
    vec![
        ("client", client),
        (
            "package",
            package.as_ref().map_or_else(|| "session".to_string(), |p| p.name.clone()),
        ),
        ("date", format_date(a.date, &cfg.locale)),
        ("time", format_hhmm(a.span.start)),
        ("end_time", format_hhmm(a.span.end)),
        ("address", cfg.address.clone()),
        ("booking_url", cfg.booking_url.clone()),
        (
            "amount",
            format_amount(package.map_or(0, |p| p.advance_payment_amount)),
        ),
    ]
}

pub struct BookingService {
    engine: Arc<Engine>,
    sink: Arc<dyn NotificationSink>,
    templates: Arc<Templates>,
    config: JobConfig,
}

impl BookingService {
    pub fn new(
        engine: Arc<Engine>,
        sink: Arc<dyn NotificationSink>,
        templates: Arc<Templates>,
        config: JobConfig,
    ) -> Self {
        Self {
            engine,
            sink,
            templates,
            config,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    fn require_staff(actor: Actor) -> Result<(), EngineError> {
        match actor {
            Actor::Staff => Ok(()),
            Actor::Parent(_) => Err(EngineError::Unauthorized("staff only".into())),
        }
    }

    fn authorize_client(&self, actor: Actor, client: ClientRef) -> Result<(), EngineError> {
        match actor {
            Actor::Staff => Ok(()),
            Actor::Parent(parent) if self.engine.is_guardian_of(parent, client) => Ok(()),
            Actor::Parent(_) => Err(EngineError::Unauthorized(format!(
                "not allowed to act for client {}",
                client.id()
            ))),
        }
    }

    async fn authorize_appointment(&self, actor: Actor, id: Ulid) -> Result<Appointment, EngineError> {
        let appointment = self
            .engine
            .appointment(&id)
            .await
            .ok_or(EngineError::NotFound(id))?;
        self.authorize_client(actor, appointment.client)?;
        Ok(appointment)
    }

    /// Create a booking and send its confirmation without waiting for it.
    pub async fn create(&self, actor: Actor, req: BookingRequest) -> Result<BookingReceipt, EngineError> {
        self.authorize_client(actor, req.client)?;
        let result = self.engine.book(req).await;
        let label = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "result" => label).increment(1);
        let receipt = result?;
        self.spawn_confirmation(receipt.appointment.clone());
        Ok(receipt)
    }

    pub async fn reschedule(
        &self,
        actor: Actor,
        id: Ulid,
        date: NaiveDate,
        start: Min,
    ) -> Result<Appointment, EngineError> {
        self.authorize_appointment(actor, id).await?;
        self.engine.move_appointment(id, date, start).await
    }

    pub async fn cancel(&self, actor: Actor, id: Ulid, reason: &str) -> Result<Appointment, EngineError> {
        self.authorize_appointment(actor, id).await?;
        self.engine.cancel(id, reason).await
    }

    pub async fn confirm_payment(&self, actor: Actor, id: Ulid, paid: u64) -> Result<Appointment, EngineError> {
        Self::require_staff(actor)?;
        self.engine.confirm_payment(id, paid).await
    }

    pub async fn start_session(&self, actor: Actor, id: Ulid) -> Result<Appointment, EngineError> {
        Self::require_staff(actor)?;
        self.engine.start_session(id).await
    }

    pub async fn complete_session(&self, actor: Actor, id: Ulid) -> Result<Appointment, EngineError> {
        Self::require_staff(actor)?;
        self.engine.complete_session(id).await
    }

    /// Apply a requested status change. NO_SHOW is left to the maintenance sweep.
    pub async fn set_status(
        &self,
        actor: Actor,
        id: Ulid,
        status: AppointmentStatus,
        cancel_reason: Option<&str>,
        paid_amount: Option<u64>,
    ) -> Result<Appointment, EngineError> {
        match status {
            AppointmentStatus::Cancelled => self.cancel(actor, id, cancel_reason.unwrap_or_default()).await,
            AppointmentStatus::Scheduled => self.confirm_payment(actor, id, paid_amount.unwrap_or(0)).await,
            AppointmentStatus::InProgress => self.start_session(actor, id).await,
            AppointmentStatus::Completed => self.complete_session(actor, id).await,
            AppointmentStatus::NoShow => Err(LifecycleError::SweepOnly(Transition::MarkNoShow).into()),
            AppointmentStatus::PendingPayment => Err(EngineError::Invalid(
                "pending_payment is only set when a booking is created".into(),
            )),
        }
    }

    pub async fn save_client(&self, actor: Actor, client: Client) -> Result<Client, EngineError> {
        Self::require_staff(actor)?;
        self.engine.save_client(client).await
    }

    pub async fn save_package(&self, actor: Actor, package: Package) -> Result<(), EngineError> {
        Self::require_staff(actor)?;
        self.engine.save_package(package).await
    }

    pub async fn save_purchase(&self, actor: Actor, purchase: PackagePurchase) -> Result<(), EngineError> {
        Self::require_staff(actor)?;
        self.engine.save_purchase(purchase).await
    }

    pub async fn set_message_status(
        &self,
        actor: Actor,
        id: Ulid,
        status: OutboundStatus,
    ) -> Result<bool, EngineError> {
        Self::require_staff(actor)?;
        self.engine.set_message_status(id, status).await
    }

    /// Appointments on a day that the caller may see.
    pub async fn appointments_on(&self, actor: Actor, date: NaiveDate) -> Vec<Appointment> {
        let all = self.engine.appointments_on(date).await;
        match actor {
            Actor::Staff => all,
            Actor::Parent(parent) => all
                .into_iter()
                .filter(|a| self.engine.is_guardian_of(parent, a.client))
                .collect(),
        }
    }

    pub fn pending_messages(&self, actor: Actor) -> Result<Vec<OutboundMessage>, EngineError> {
        Self::require_staff(actor)?;
        Ok(self.engine.pending_messages())
    }

    /// Fire-and-forget: failures are logged and never reach the caller.
    fn spawn_confirmation(&self, appointment: Appointment) {
        let engine = self.engine.clone();
        let sink = self.sink.clone();
        let templates = self.templates.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let sent = send_confirmation(&engine, sink.as_ref(), &templates, &config, &appointment).await;
            if sent == 0 {
                tracing::warn!("no confirmation delivered for appointment {}", appointment.id);
            }
        });
    }
}

/// Email every recipient; returns how many sends succeeded.
async fn send_confirmation(
    engine: &Engine,
    sink: &dyn NotificationSink,
    templates: &Templates,
    config: &JobConfig,
    appointment: &Appointment,
) -> usize {
    let vars = appointment_vars(engine, appointment, config);
    let mut sent = 0;
    for contact in engine.recipient_emails(appointment.client) {
        let mut with_recipient = vars.clone();
        with_recipient.push(("recipient", contact.name.clone()));
        let rendered = match templates.render(TemplateKey::Confirmation, &with_recipient) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("confirmation for {}: {e}", appointment.id);
                return sent;
            }
        };
        let email = OutgoingEmail {
            to: contact.address,
            subject: rendered.subject,
            body: rendered.body,
        };
        match sink.send_email(&email).await {
            Ok(()) => sent += 1,
            Err(e) => tracing::warn!("confirmation to {} failed: {e}", email.to),
        }
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hours::BusinessHours;
    use crate::model::fixtures::{day, hm};
    use crate::notify::NotifyHub;
    use crate::sink::testing::RecordingSink;

    fn service(name: &str, sink: Arc<RecordingSink>) -> BookingService {
        let dir = std::env::temp_dir().join("daybook_test_booking");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        let engine = Engine::new(path, BusinessHours::default(), Arc::new(NotifyHub::new())).unwrap();
        BookingService::new(
            Arc::new(engine),
            sink,
            Arc::new(Templates::default()),
            JobConfig {
                address: "1 Main St".into(),
                ..JobConfig::default()
            },
        )
    }

    async fn family(svc: &BookingService) -> (Ulid, ClientRef) {
        let mut mom = Client::new(Ulid::new(), ClientKind::Parent, "Ana");
        mom.email = Some("ana@example.com".into());
        let mom = svc.save_client(Actor::Staff, mom).await.unwrap();
        let mut kid = Client::new(Ulid::new(), ClientKind::Baby, "Kid");
        kid.parent_ids = vec![mom.id];
        let kid = svc.save_client(Actor::Staff, kid).await.unwrap();
        (mom.id, ClientRef::Baby(kid.id))
    }

    fn request(client: ClientRef, start: Min) -> BookingRequest {
        BookingRequest {
            id: Ulid::new(),
            client,
            date: day(2026, 3, 2),
            start,
            purchase_id: None,
            package_id: None,
            schedule_preferences: None,
        }
    }

    #[test]
    fn actor_from_login() {
        let id = Ulid::new();
        assert_eq!(Actor::from_user(&format!("parent_{id}")), Actor::Parent(id));
        assert_eq!(Actor::from_user("staff"), Actor::Staff);
        assert_eq!(Actor::from_user("parent_garbage"), Actor::Parent(Ulid::nil()));
    }

    #[tokio::test]
    async fn parent_books_for_own_baby_only() {
        let svc = service("parent_scope.wal", Arc::new(RecordingSink::default()));
        let (mom, kid) = family(&svc).await;
        let stranger = Actor::Parent(Ulid::new());

        let err = svc.create(stranger, request(kid, hm(9, 0))).await.unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
        assert!(svc.engine().appointments_on(day(2026, 3, 2)).await.is_empty());

        let receipt = svc.create(Actor::Parent(mom), request(kid, hm(9, 0))).await.unwrap();
        let id = receipt.appointment.id;
        assert_eq!(svc.cancel(stranger, id, "nope").await.unwrap_err().code(), "UNAUTHORIZED");
        assert_eq!(svc.start_session(Actor::Parent(mom), id).await.unwrap_err().code(), "UNAUTHORIZED");
        assert!(svc.start_session(Actor::Staff, id).await.is_ok());
    }

    #[tokio::test]
    async fn parents_see_only_their_appointments() {
        let svc = service("parent_view.wal", Arc::new(RecordingSink::default()));
        let (mom, kid) = family(&svc).await;
        let other = svc
            .save_client(Actor::Staff, Client::new(Ulid::new(), ClientKind::Parent, "Bea"))
            .await
            .unwrap();
        svc.create(Actor::Staff, request(kid, hm(9, 0))).await.unwrap();
        svc.create(Actor::Staff, request(ClientRef::Parent(other.id), hm(9, 0)))
            .await
            .unwrap();

        assert_eq!(svc.appointments_on(Actor::Staff, day(2026, 3, 2)).await.len(), 2);
        assert_eq!(svc.appointments_on(Actor::Parent(mom), day(2026, 3, 2)).await.len(), 1);
    }

    #[tokio::test]
    async fn confirmation_goes_to_parents() {
        let sink = Arc::new(RecordingSink::default());
        let svc = service("confirmation.wal", sink.clone());
        let (_, kid) = family(&svc).await;
        let receipt = svc.create(Actor::Staff, request(kid, hm(9, 0))).await.unwrap();

        let sent = send_confirmation(
            svc.engine(),
            sink.as_ref(),
            &svc.templates,
            &svc.config,
            &receipt.appointment,
        )
        .await;
        assert_eq!(sent, 1);
        let emails = sink.sent.lock().unwrap().clone();
        let last = emails.last().unwrap();
        assert_eq!(last.to, "ana@example.com");
        assert!(last.body.contains("Hi Ana, Kid is booked"));
        assert!(last.body.contains("09:00"));
        assert!(last.body.contains("1 Main St"));
    }

    #[tokio::test]
    async fn failing_confirmation_never_blocks_booking() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail_for("ana@example.com");
        let svc = service("confirmation_fail.wal", sink.clone());
        let (_, kid) = family(&svc).await;

        let receipt = svc.create(Actor::Staff, request(kid, hm(9, 0))).await.unwrap();
        let sent = send_confirmation(
            svc.engine(),
            sink.as_ref(),
            &svc.templates,
            &svc.config,
            &receipt.appointment,
        )
        .await;
        assert_eq!(sent, 0);
        assert!(svc.engine().appointment(&receipt.appointment.id).await.is_some());
    }

    #[tokio::test]
    async fn status_requests_map_to_transitions() {
        let svc = service("set_status.wal", Arc::new(RecordingSink::default()));
        let (mom, kid) = family(&svc).await;
        let id = svc.create(Actor::Staff, request(kid, hm(9, 0))).await.unwrap().appointment.id;

        let err = svc
            .set_status(Actor::Staff, id, AppointmentStatus::NoShow, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Lifecycle(LifecycleError::SweepOnly(Transition::MarkNoShow))));

        let err = svc
            .set_status(Actor::Parent(mom), id, AppointmentStatus::InProgress, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");

        let started = svc
            .set_status(Actor::Staff, id, AppointmentStatus::InProgress, None, None)
            .await
            .unwrap();
        assert_eq!(started.status, AppointmentStatus::InProgress);
        let done = svc
            .set_status(Actor::Staff, id, AppointmentStatus::Completed, None, None)
            .await
            .unwrap();
        assert_eq!(done.status, AppointmentStatus::Completed);

        let err = svc
            .set_status(Actor::Parent(mom), id, AppointmentStatus::Cancelled, Some("late"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ILLEGAL_TRANSITION");
    }
}

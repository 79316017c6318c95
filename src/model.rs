use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::lifecycle::AppointmentStatus;

/// Minutes since midnight. The only time-of-day type.
pub type Min = i32;

/// Unix milliseconds, used for instants (queue ages, expiries).
pub type Ms = i64;

pub const MINUTES_PER_DAY: Min = 24 * 60;
pub const MS_PER_DAY: Ms = 86_400_000;

/// Half-open interval `[start, end)` within one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Min,
    pub end: Min,
}

impl Span {
    pub fn new(start: Min, end: Min) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> Min {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Parse `"HH:MM"` into minutes since midnight.
pub fn parse_hhmm(s: &str) -> Option<Min> {
    let (h, m) = s.trim().split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    let h: Min = h.parse().ok()?;
    let m: Min = m.parse().ok()?;
    if !(0..24).contains(&h) || !(0..60).contains(&m) {
        return None;
    }
    Some(h * 60 + m)
}

pub fn format_hhmm(m: Min) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

// ── Clients ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientKind {
    Baby,
    Parent,
}

impl ClientKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientKind::Baby => "baby",
            ClientKind::Parent => "parent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "baby" => Some(ClientKind::Baby),
            "parent" => Some(ClientKind::Parent),
            _ => None,
        }
    }
}

/// The client a booking belongs to. Exactly one of baby or parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientRef {
    Baby(Ulid),
    Parent(Ulid),
}

impl ClientRef {
    pub fn new(kind: ClientKind, id: Ulid) -> Self {
        match kind {
            ClientKind::Baby => ClientRef::Baby(id),
            ClientKind::Parent => ClientRef::Parent(id),
        }
    }

    pub fn id(&self) -> Ulid {
        match self {
            ClientRef::Baby(id) | ClientRef::Parent(id) => *id,
        }
    }

    pub fn kind(&self) -> ClientKind {
        match self {
            ClientRef::Baby(_) => ClientKind::Baby,
            ClientRef::Parent(_) => ClientKind::Parent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: Ulid,
    pub kind: ClientKind,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Guardians of a baby. Empty for parents.
    pub parent_ids: Vec<Ulid>,
    pub birth_date: Option<NaiveDate>,
    pub no_show_count: u32,
    pub requires_prepayment: bool,
    pub active: bool,
}

impl Client {
    pub fn new(id: Ulid, kind: ClientKind, name: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            name: name.into(),
            email: None,
            phone: None,
            parent_ids: Vec::new(),
            birth_date: None,
            no_show_count: 0,
            requires_prepayment: false,
            active: true,
        }
    }
}

/// Someone a message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub name: String,
    /// Email address or phone number, depending on the channel.
    pub address: String,
}

// ── Packages ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub id: Ulid,
    pub name: String,
    pub duration_minutes: Min,
    pub requires_advance_payment: bool,
    /// Minor currency units.
    pub advance_payment_amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagePurchase {
    pub id: Ulid,
    pub package_id: Ulid,
    pub client: ClientRef,
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReminderKind {
    Email24h,
    SameDay,
    Payment48h,
}

impl ReminderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReminderKind::Email24h => "email_24h",
            ReminderKind::SameDay => "same_day",
            ReminderKind::Payment48h => "payment_48h",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub client: ClientRef,
    pub date: NaiveDate,
    pub span: Span,
    pub status: AppointmentStatus,
    pub package_id: Option<Ulid>,
    pub purchase_id: Option<Ulid>,
    pub reminder_24h_sent: bool,
    pub reminder_day_sent: bool,
    pub payment_reminder_sent: bool,
    pub cancel_reason: Option<String>,
    /// Opaque JSON object kept for the bulk-scheduling feature.
    pub schedule_preferences: Option<String>,
    pub created_at: Ms,
}

impl Appointment {
    pub fn reminder_sent(&self, kind: ReminderKind) -> bool {
        match kind {
            ReminderKind::Email24h => self.reminder_24h_sent,
            ReminderKind::SameDay => self.reminder_day_sent,
            ReminderKind::Payment48h => self.payment_reminder_sent,
        }
    }

    /// Flags only ever go from false to true.
    pub fn mark_reminder(&mut self, kind: ReminderKind) {
        match kind {
            ReminderKind::Email24h => self.reminder_24h_sent = true,
            ReminderKind::SameDay => self.reminder_day_sent = true,
            ReminderKind::Payment48h => self.payment_reminder_sent = true,
        }
    }
}

// ── Outbound queue & notifications ───────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageCategory {
    SameDayReminder,
    PaymentReminder,
}

impl MessageCategory {
    pub fn reminder(self) -> ReminderKind {
        match self {
            MessageCategory::SameDayReminder => ReminderKind::SameDay,
            MessageCategory::PaymentReminder => ReminderKind::Payment48h,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageCategory::SameDayReminder => "same_day_reminder",
            MessageCategory::PaymentReminder => "payment_reminder",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundStatus {
    Pending,
    Sent,
    Expired,
}

impl OutboundStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboundStatus::Pending => "pending",
            OutboundStatus::Sent => "sent",
            OutboundStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(OutboundStatus::Pending),
            "sent" => Some(OutboundStatus::Sent),
            "expired" => Some(OutboundStatus::Expired),
            _ => None,
        }
    }
}

/// A WhatsApp message waiting for the external deliverer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: Ulid,
    pub category: MessageCategory,
    pub appointment_ids: Vec<Ulid>,
    pub phone: String,
    pub body: String,
    pub created_at: Ms,
    pub status: OutboundStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Ulid,
    pub client_id: Option<Ulid>,
    pub title: String,
    pub body: String,
    pub created_at: Ms,
    pub expires_at: Ms,
}

// ── Per-day state ────────────────────────────────────────────────

/// Every appointment on one calendar day, sorted by `span.start`.
/// The day is the unit of locking: capacity and client-overlap checks
/// only ever look at a single day.
#[derive(Debug, Clone)]
pub struct DayState {
    pub date: NaiveDate,
    pub appointments: Vec<Appointment>,
}

impl DayState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            appointments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.span.start <= appointment.span.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Appointments whose span overlaps the query window.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ClientSaved {
        client: Client,
    },
    PackageSaved {
        package: Package,
    },
    PurchaseSaved {
        purchase: PackagePurchase,
    },
    /// Carries the whole record, schedule preferences included, so the
    /// booking and its side data commit as one entry.
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentMoved {
        id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        span: Span,
    },
    StatusChanged {
        id: Ulid,
        date: NaiveDate,
        status: AppointmentStatus,
        cancel_reason: Option<String>,
    },
    ReminderSent {
        id: Ulid,
        date: NaiveDate,
        kind: ReminderKind,
    },
    /// Queue a message and flag every appointment it covers.
    RemindersQueued {
        date: NaiveDate,
        message: OutboundMessage,
    },
    NoShowSwept {
        id: Ulid,
        date: NaiveDate,
        client_id: Ulid,
    },
    PrepaymentRequired {
        client_id: Ulid,
    },
    ClientDeactivated {
        client_id: Ulid,
    },
    MessageStatusChanged {
        id: Ulid,
        status: OutboundStatus,
    },
    NotificationPosted {
        notification: Notification,
    },
    NotificationDeleted {
        id: Ulid,
    },
}

impl Event {
    /// The calendar day whose lock guards this event, if any.
    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            Event::AppointmentBooked { appointment } => Some(appointment.date),
            Event::AppointmentMoved { to, .. } => Some(*to),
            Event::StatusChanged { date, .. }
            | Event::ReminderSent { date, .. }
            | Event::RemindersQueued { date, .. }
            | Event::NoShowSwept { date, .. } => Some(*date),
            Event::ClientSaved { .. }
            | Event::PackageSaved { .. }
            | Event::PurchaseSaved { .. }
            | Event::PrepaymentRequired { .. }
            | Event::ClientDeactivated { .. }
            | Event::MessageStatusChanged { .. }
            | Event::NotificationPosted { .. }
            | Event::NotificationDeleted { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotUsage {
    pub start: Min,
    pub booked: u32,
    pub capacity: u32,
}

impl SlotUsage {
    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.booked)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub appointment: Appointment,
    pub requires_advance_payment: bool,
    pub advance_payment_amount: u64,
    pub package_name: Option<String>,
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert_eq!(a.duration(), 100);
    }

    #[test]
    fn hhmm_roundtrip() {
        assert_eq!(parse_hhmm("09:00"), Some(540));
        assert_eq!(parse_hhmm("9:30"), Some(570));
        assert_eq!(parse_hhmm("23:59"), Some(1439));
        assert_eq!(format_hhmm(600), "10:00");
        assert_eq!(format_hhmm(545), "09:05");
    }

    #[test]
    fn hhmm_rejects_garbage() {
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("09:60"), None);
        assert_eq!(parse_hhmm("0900"), None);
        assert_eq!(parse_hhmm("09:0"), None);
        assert_eq!(parse_hhmm(""), None);
    }

    #[test]
    fn client_ref_is_exactly_one() {
        let id = Ulid::new();
        let r = ClientRef::new(ClientKind::Baby, id);
        assert_eq!(r, ClientRef::Baby(id));
        assert_eq!(r.id(), id);
        assert_eq!(r.kind(), ClientKind::Baby);
    }

    #[test]
    fn day_state_ordering() {
        let d = day(2026, 3, 2);
        let c = ClientRef::Parent(Ulid::new());
        let mut ds = DayState::new(d);
        ds.insert(appointment(c, d, Span::new(hm(11, 0), hm(12, 0)), AppointmentStatus::Scheduled));
        ds.insert(appointment(c, d, Span::new(hm(9, 0), hm(10, 0)), AppointmentStatus::Scheduled));
        ds.insert(appointment(c, d, Span::new(hm(10, 0), hm(11, 0)), AppointmentStatus::Scheduled));
        let starts: Vec<Min> = ds.appointments.iter().map(|a| a.span.start).collect();
        assert_eq!(starts, vec![hm(9, 0), hm(10, 0), hm(11, 0)]);
    }

    #[test]
    fn day_state_remove_middle_preserves_order() {
        let d = day(2026, 3, 2);
        let c = ClientRef::Parent(Ulid::new());
        let mut ds = DayState::new(d);
        let mut ids = Vec::new();
        for h in 9..12 {
            let a = appointment(c, d, Span::new(hm(h, 0), hm(h + 1, 0)), AppointmentStatus::Scheduled);
            ids.push(a.id);
            ds.insert(a);
        }
        assert!(ds.remove(ids[1]).is_some());
        assert!(ds.remove(Ulid::new()).is_none());
        assert_eq!(ds.appointments.len(), 2);
        assert_eq!(ds.appointments[0].id, ids[0]);
        assert_eq!(ds.appointments[1].id, ids[2]);
    }

    #[test]
    fn overlapping_is_half_open() {
        let d = day(2026, 3, 2);
        let c = ClientRef::Parent(Ulid::new());
        let mut ds = DayState::new(d);
        ds.insert(appointment(c, d, Span::new(hm(9, 0), hm(10, 0)), AppointmentStatus::Scheduled));
        ds.insert(appointment(c, d, Span::new(hm(10, 30), hm(11, 0)), AppointmentStatus::Scheduled));

        assert_eq!(ds.overlapping(&Span::new(hm(10, 0), hm(10, 30))).count(), 0);
        assert_eq!(ds.overlapping(&Span::new(hm(9, 59), hm(10, 31))).count(), 2);
        assert_eq!(ds.overlapping(&Span::new(hm(8, 0), hm(9, 0))).count(), 0);
    }

    #[test]
    fn reminder_flags_are_independent() {
        let d = day(2026, 3, 2);
        let mut a = appointment(ClientRef::Parent(Ulid::new()), d, Span::new(0, 60), AppointmentStatus::Scheduled);
        a.mark_reminder(ReminderKind::SameDay);
        assert!(a.reminder_sent(ReminderKind::SameDay));
        assert!(!a.reminder_sent(ReminderKind::Email24h));
        assert!(!a.reminder_sent(ReminderKind::Payment48h));
    }

    #[test]
    fn event_date_routing() {
        let d = day(2026, 3, 2);
        let e = Event::AppointmentMoved {
            id: Ulid::new(),
            from: day(2026, 3, 1),
            to: d,
            span: Span::new(0, 60),
        };
        assert_eq!(e.date(), Some(d));
        assert_eq!(Event::PrepaymentRequired { client_id: Ulid::new() }.date(), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let d = day(2026, 3, 2);
        let event = Event::AppointmentBooked {
            appointment: appointment(ClientRef::Baby(Ulid::new()), d, Span::new(540, 600), AppointmentStatus::PendingPayment),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}

use chrono::NaiveDate;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// Records that are not owned by a single calendar day: clients, packages,
/// the outbound queue, notifications, and the appointment → day index.
#[derive(Default)]
pub struct Registry {
    clients: DashMap<Ulid, Client>,
    packages: DashMap<Ulid, Package>,
    purchases: DashMap<Ulid, PackagePurchase>,
    outbox: DashMap<Ulid, OutboundMessage>,
    notifications: DashMap<Ulid, Notification>,
    appointment_dates: DashMap<Ulid, NaiveDate>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Lookups ──────────────────────────────────────────────

    pub fn client(&self, id: &Ulid) -> Option<Client> {
        self.clients.get(id).map(|e| e.value().clone())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn clients(&self) -> Vec<Client> {
        self.clients.iter().map(|e| e.value().clone()).collect()
    }

    pub fn package(&self, id: &Ulid) -> Option<Package> {
        self.packages.get(id).map(|e| e.value().clone())
    }

    pub fn packages(&self) -> Vec<Package> {
        self.packages.iter().map(|e| e.value().clone()).collect()
    }

    pub fn purchase(&self, id: &Ulid) -> Option<PackagePurchase> {
        self.purchases.get(id).map(|e| e.value().clone())
    }

    pub fn purchases(&self) -> Vec<PackagePurchase> {
        self.purchases.iter().map(|e| e.value().clone()).collect()
    }

    pub fn appointment_date(&self, id: &Ulid) -> Option<NaiveDate> {
        self.appointment_dates.get(id).map(|e| *e.value())
    }

    pub fn message(&self, id: &Ulid) -> Option<OutboundMessage> {
        self.outbox.get(id).map(|e| e.value().clone())
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        let mut all: Vec<_> = self.outbox.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|m| m.id);
        all
    }

    /// Whether a pending message of `category` already covers `appointment_id`.
    pub fn has_pending_message(&self, appointment_id: Ulid, category: MessageCategory) -> bool {
        self.outbox.iter().any(|e| {
            let m = e.value();
            m.status == OutboundStatus::Pending
                && m.category == category
                && m.appointment_ids.contains(&appointment_id)
        })
    }

    pub fn notifications(&self) -> Vec<Notification> {
        let mut all: Vec<_> = self.notifications.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|n| n.id);
        all
    }

    // ── Event application ────────────────────────────────────

    /// Apply the non-day part of an event. Day-scoped changes are applied
    /// by the caller holding that day's lock.
    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::ClientSaved { client } => {
                self.clients.insert(client.id, client.clone());
            }
            Event::PackageSaved { package } => {
                self.packages.insert(package.id, package.clone());
            }
            Event::PurchaseSaved { purchase } => {
                self.purchases.insert(purchase.id, purchase.clone());
            }
            Event::AppointmentBooked { appointment } => {
                self.appointment_dates.insert(appointment.id, appointment.date);
            }
            Event::AppointmentMoved { id, to, .. } => {
                self.appointment_dates.insert(*id, *to);
            }
            Event::RemindersQueued { message, .. } => {
                self.outbox.insert(message.id, message.clone());
            }
            Event::NoShowSwept { client_id, .. } => {
                if let Some(mut c) = self.clients.get_mut(client_id) {
                    c.no_show_count += 1;
                }
            }
            Event::PrepaymentRequired { client_id } => {
                if let Some(mut c) = self.clients.get_mut(client_id) {
                    c.requires_prepayment = true;
                }
            }
            Event::ClientDeactivated { client_id } => {
                if let Some(mut c) = self.clients.get_mut(client_id) {
                    c.active = false;
                }
            }
            Event::MessageStatusChanged { id, status } => {
                if let Some(mut m) = self.outbox.get_mut(id) {
                    m.status = *status;
                }
            }
            Event::NotificationPosted { notification } => {
                self.notifications.insert(notification.id, notification.clone());
            }
            Event::NotificationDeleted { id } => {
                self.notifications.remove(id);
            }
            Event::StatusChanged { .. } | Event::ReminderSent { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::AppointmentStatus;
    use crate::model::fixtures::*;

    #[test]
    fn no_show_sweep_counts_per_appointment() {
        let reg = Registry::new();
        let client = Client::new(Ulid::new(), ClientKind::Parent, "Ana");
        let cid = client.id;
        reg.apply_event(&Event::ClientSaved { client });

        for _ in 0..2 {
            reg.apply_event(&Event::NoShowSwept {
                id: Ulid::new(),
                date: day(2026, 3, 2),
                client_id: cid,
            });
        }
        assert_eq!(reg.client(&cid).unwrap().no_show_count, 2);
    }

    #[test]
    fn pending_message_lookup_respects_status_and_category() {
        let reg = Registry::new();
        let appt = Ulid::new();
        let message = OutboundMessage {
            id: Ulid::new(),
            category: MessageCategory::PaymentReminder,
            appointment_ids: vec![appt],
            phone: "+100".into(),
            body: "pay".into(),
            created_at: 0,
            status: OutboundStatus::Pending,
        };
        let mid = message.id;
        reg.apply_event(&Event::RemindersQueued {
            date: day(2026, 3, 2),
            message,
        });

        assert!(reg.has_pending_message(appt, MessageCategory::PaymentReminder));
        assert!(!reg.has_pending_message(appt, MessageCategory::SameDayReminder));

        reg.apply_event(&Event::MessageStatusChanged {
            id: mid,
            status: OutboundStatus::Sent,
        });
        assert!(!reg.has_pending_message(appt, MessageCategory::PaymentReminder));
    }

    #[test]
    fn booking_and_move_maintain_date_index() {
        let reg = Registry::new();
        let a = appointment(
            ClientRef::Parent(Ulid::new()),
            day(2026, 3, 2),
            Span::new(540, 600),
            AppointmentStatus::Scheduled,
        );
        let id = a.id;
        reg.apply_event(&Event::AppointmentBooked { appointment: a });
        assert_eq!(reg.appointment_date(&id), Some(day(2026, 3, 2)));

        reg.apply_event(&Event::AppointmentMoved {
            id,
            from: day(2026, 3, 2),
            to: day(2026, 3, 4),
            span: Span::new(600, 660),
        });
        assert_eq!(reg.appointment_date(&id), Some(day(2026, 3, 4)));
    }
}

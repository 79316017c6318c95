use chrono::NaiveDate;
use ulid::Ulid;

use crate::hours::SLOT_MINUTES;
use crate::lanes::{self, LaneItem, Placement};
use crate::lifecycle::AppointmentStatus;
use crate::model::*;

use super::conflict::occupancy;
use super::Engine;

impl Engine {
    pub fn client(&self, id: &Ulid) -> Option<Client> {
        self.registry.client(id)
    }

    pub fn clients(&self) -> Vec<Client> {
        self.registry.clients()
    }

    pub fn package(&self, id: &Ulid) -> Option<Package> {
        self.registry.package(id)
    }

    pub fn purchase(&self, id: &Ulid) -> Option<PackagePurchase> {
        self.registry.purchase(id)
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.registry.notifications()
    }

    /// Messages still waiting for the deliverer, oldest first.
    pub fn pending_messages(&self) -> Vec<OutboundMessage> {
        self.registry
            .messages()
            .into_iter()
            .filter(|m| m.status == OutboundStatus::Pending)
            .collect()
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.registry.messages()
    }

    pub async fn appointment(&self, id: &Ulid) -> Option<Appointment> {
        let date = self.registry.appointment_date(id)?;
        let day = self.existing_day(date)?;
        let guard = day.read().await;
        guard.get(*id).cloned()
    }

    /// Every appointment on a day, sorted by start.
    pub async fn appointments_on(&self, date: NaiveDate) -> Vec<Appointment> {
        match self.existing_day(date) {
            Some(day) => day.read().await.appointments.clone(),
            None => Vec::new(),
        }
    }

    /// Appointments on every day in `[from, to]` whose status matches.
    pub async fn appointments_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        keep: impl Fn(&Appointment) -> bool,
    ) -> Vec<Appointment> {
        let mut out = Vec::new();
        for (date, day) in self.days_sorted() {
            if date < from || date > to {
                continue;
            }
            let guard = day.read().await;
            out.extend(guard.appointments.iter().filter(|a| keep(a)).cloned());
        }
        out
    }

    /// Per-slot usage of a day: capacity-consuming appointments over capacity.
    pub async fn slot_usage(&self, date: NaiveDate) -> Vec<SlotUsage> {
        let Some(hours) = self.hours.for_date(date) else {
            return Vec::new();
        };
        let capacity = hours.capacity();
        let day = self.existing_day(date);
        let guard = match &day {
            Some(d) => Some(d.read().await),
            None => None,
        };
        hours
            .slots()
            .iter()
            .map(|&start| SlotUsage {
                start,
                booked: guard
                    .as_ref()
                    .map_or(0, |g| occupancy(g, &Span::new(start, start + SLOT_MINUTES), None)),
                capacity,
            })
            .collect()
    }

    /// Lane layout of a day column. Cancelled appointments are not drawn.
    /// The lane limit is the day's booking capacity, raised to the peak
    /// overlap of what is drawn: pending, finished and no-show visits hold
    /// no capacity but still need a lane of their own.
    pub async fn day_layout(&self, date: NaiveDate, events: &[LaneItem]) -> Vec<Placement> {
        let items: Vec<LaneItem> = self
            .appointments_on(date)
            .await
            .into_iter()
            .filter(|a| a.status != AppointmentStatus::Cancelled)
            .map(|a| LaneItem { id: a.id, span: a.span })
            .collect();
        let capacity = self.hours.capacity_on(date).max(1) as usize;
        let max_lanes = capacity.max(lanes::peak_overlap(&items));
        lanes::layout(&items, events, max_lanes)
    }

    /// Email recipients for a client: the client for a parent, the
    /// parents for a baby.
    pub fn recipient_emails(&self, client: ClientRef) -> Vec<Contact> {
        self.contacts(client, |c| c.email.clone())
    }

    /// Phone recipients for a client, the client's own first.
    pub fn recipient_phones(&self, client: ClientRef) -> Vec<Contact> {
        self.contacts(client, |c| c.phone.clone())
    }

    fn contacts(&self, client: ClientRef, pick: impl Fn(&Client) -> Option<String>) -> Vec<Contact> {
        let Some(record) = self.registry.client(&client.id()) else {
            return Vec::new();
        };
        let people = std::iter::once(record.clone())
            .chain(record.parent_ids.iter().filter_map(|pid| self.registry.client(pid)));
        let mut out: Vec<Contact> = Vec::new();
        for person in people {
            let Some(address) = pick(&person).filter(|a| !a.trim().is_empty()) else {
                continue;
            };
            if out.iter().all(|c| c.address != address) {
                out.push(Contact {
                    name: person.name,
                    address,
                });
            }
        }
        out
    }

    /// Whether `parent` may act for `client`: themselves or one of their babies.
    pub fn is_guardian_of(&self, parent: Ulid, client: ClientRef) -> bool {
        match client {
            ClientRef::Parent(id) => id == parent,
            ClientRef::Baby(id) => self
                .registry
                .client(&id)
                .is_some_and(|b| b.parent_ids.contains(&parent)),
        }
    }
}

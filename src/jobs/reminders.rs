use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::booking::appointment_vars;
use crate::config::JobConfig;
use crate::engine::{now_ms, Engine};
use crate::lifecycle::AppointmentStatus;
use crate::model::*;
use crate::sink::{NotificationSink, OutgoingEmail};
use crate::templates::{TemplateKey, Templates};

use super::{BatchJob, JobReport};

/// Sends the 24h email reminder and queues the same-day and 48h payment
/// WhatsApp reminders. Each reminder is flagged on its appointment only
/// after it was sent or queued, so a failed one is retried next run.
pub struct ReminderScheduler {
    engine: Arc<Engine>,
    sink: Arc<dyn NotificationSink>,
    templates: Arc<Templates>,
    running: Mutex<()>,
}

fn with_recipient(mut vars: Vec<(&'static str, String)>, contact: &Contact) -> Vec<(&'static str, String)> {
    vars.push(("recipient", contact.name.clone()));
    vars
}

impl ReminderScheduler {
    pub fn new(engine: Arc<Engine>, sink: Arc<dyn NotificationSink>, templates: Arc<Templates>) -> Self {
        Self {
            engine,
            sink,
            templates,
            running: Mutex::new(()),
        }
    }

    pub async fn run_at(&self, config: &JobConfig, now: Ms) -> JobReport {
        let mut report = JobReport::default();
        let Ok(_running) = self.running.try_lock() else {
            warn!("reminder scheduler already running, skipping");
            return report;
        };
        let today = config.local_date(now);

        let emailed = self.email_24h(today + Duration::days(1), config, &mut report).await;
        report.step("email_24h", emailed);
        let same_day = self.same_day(today, config, now, &mut report).await;
        report.step("same_day", same_day);
        let payment = self.payment_48h(today + Duration::days(2), config, now, &mut report).await;
        report.step("payment_48h", payment);
        report
    }

    /// Email every recipient of tomorrow's open appointments; the flag is
    /// set once at least one email went out.
    async fn email_24h(&self, date: NaiveDate, config: &JobConfig, report: &mut JobReport) -> usize {
        let due = self
            .engine
            .appointments_between(date, date, |a| {
                a.status.is_open() && !a.reminder_sent(ReminderKind::Email24h)
            })
            .await;
        let mut sent = 0;
        for a in due {
            let recipients = self.engine.recipient_emails(a.client);
            if recipients.is_empty() {
                debug!("no email address for appointment {}", a.id);
                continue;
            }
            let vars = appointment_vars(&self.engine, &a, config);
            let mut delivered = false;
            for contact in &recipients {
                let rendered = match self
                    .templates
                    .render(TemplateKey::Reminder24h, &with_recipient(vars.clone(), contact))
                {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("24h reminder for {}: {e}", a.id);
                        break;
                    }
                };
                let email = OutgoingEmail {
                    to: contact.address.clone(),
                    subject: rendered.subject,
                    body: rendered.body,
                };
                match self.sink.send_email(&email).await {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    Err(e) => warn!("24h reminder to {} failed: {e}", email.to),
                }
            }
            if !delivered {
                report.failed += 1;
                continue;
            }
            match self.engine.mark_reminder_sent(a.id, ReminderKind::Email24h).await {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("flagging 24h reminder for {} failed: {e}", a.id);
                    report.failed += 1;
                }
            }
        }
        sent
    }

    /// One WhatsApp message per phone number for today's open appointments;
    /// a parent with several appointments gets them in a single message.
    async fn same_day(&self, today: NaiveDate, config: &JobConfig, now: Ms, report: &mut JobReport) -> usize {
        let due = self
            .engine
            .appointments_between(today, today, |a| {
                a.status.is_open() && !a.reminder_sent(ReminderKind::SameDay)
            })
            .await;

        let mut by_phone: BTreeMap<String, (Contact, Vec<Appointment>)> = BTreeMap::new();
        for a in due {
            let Some(contact) = self.engine.recipient_phones(a.client).into_iter().next() else {
                debug!("no phone for appointment {}", a.id);
                continue;
            };
            by_phone
                .entry(contact.address.clone())
                .or_insert_with(|| (contact, Vec::new()))
                .1
                .push(a);
        }

        let mut queued = 0;
        for (phone, (contact, group)) in by_phone {
            let rendered = if let [single] = group.as_slice() {
                let vars = with_recipient(appointment_vars(&self.engine, single, config), &contact);
                self.templates.render(TemplateKey::SameDay, &vars)
            } else {
                let lines: Vec<String> = group
                    .iter()
                    .map(|a| {
                        let vars = appointment_vars(&self.engine, a, config);
                        let get = |key: &str| {
                            vars.iter()
                                .find(|(k, _)| *k == key)
                                .map(|(_, v)| v.as_str())
                                .unwrap_or_default()
                                .to_string()
                        };
                        format!("- {} {} ({})", get("time"), get("client"), get("package"))
                    })
                    .collect();
                let vars = vec![
                    ("recipient", contact.name.clone()),
                    ("count", group.len().to_string()),
                    ("appointments", lines.join("\n")),
                    ("address", config.address.clone()),
                    ("booking_url", config.booking_url.clone()),
                ];
                self.templates.render(TemplateKey::SameDayMulti, &vars)
            };
            let rendered = match rendered {
                Ok(r) => r,
                Err(e) => {
                    warn!("same-day reminder for {phone}: {e}");
                    report.failed += group.len();
                    continue;
                }
            };
            let message = OutboundMessage {
                id: Ulid::new(),
                category: MessageCategory::SameDayReminder,
                appointment_ids: group.iter().map(|a| a.id).collect(),
                phone,
                body: rendered.body,
                created_at: now,
                status: OutboundStatus::Pending,
            };
            match self.engine.queue_reminders(today, message).await {
                Ok(true) => queued += group.len(),
                Ok(false) => {}
                Err(e) => {
                    warn!("queueing same-day reminder failed: {e}");
                    report.failed += group.len();
                }
            }
        }
        queued
    }

    /// Payment reminder for appointments in two days still waiting on an
    /// advance payment.
    async fn payment_48h(&self, date: NaiveDate, config: &JobConfig, now: Ms, report: &mut JobReport) -> usize {
        let due = self
            .engine
            .appointments_between(date, date, |a| {
                a.status == AppointmentStatus::PendingPayment && !a.reminder_sent(ReminderKind::Payment48h)
            })
            .await;
        let mut queued = 0;
        for a in due {
            let requires_advance = a
                .package_id
                .and_then(|p| self.engine.package(&p))
                .is_some_and(|p| p.requires_advance_payment);
            if !requires_advance
                || self
                    .engine
                    .registry()
                    .has_pending_message(a.id, MessageCategory::PaymentReminder)
            {
                continue;
            }
            let Some(contact) = self.engine.recipient_phones(a.client).into_iter().next() else {
                debug!("no phone for appointment {}", a.id);
                continue;
            };
            let vars = with_recipient(appointment_vars(&self.engine, &a, config), &contact);
            let rendered = match self.templates.render(TemplateKey::Payment48h, &vars) {
                Ok(r) => r,
                Err(e) => {
                    warn!("payment reminder for {}: {e}", a.id);
                    report.failed += 1;
                    continue;
                }
            };
            let message = OutboundMessage {
                id: Ulid::new(),
                category: MessageCategory::PaymentReminder,
                appointment_ids: vec![a.id],
                phone: contact.address,
                body: rendered.body,
                created_at: now,
                status: OutboundStatus::Pending,
            };
            match self.engine.queue_reminders(date, message).await {
                Ok(true) => queued += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("queueing payment reminder for {} failed: {e}", a.id);
                    report.failed += 1;
                }
            }
        }
        queued
    }
}

#[async_trait]
impl BatchJob for ReminderScheduler {
    fn name(&self) -> &'static str {
        "reminders"
    }

    async fn run(&self, config: &JobConfig) -> JobReport {
        self.run_at(config, now_ms()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BookingRequest;
    use crate::hours::BusinessHours;
    use crate::model::fixtures::{day, hm};
    use crate::notify::NotifyHub;
    use crate::sink::testing::RecordingSink;

    // 2026-03-05T08:00:00Z, a Thursday.
    const THURSDAY_MORNING: Ms = 1_772_697_600_000;

    struct Fixture {
        engine: Arc<Engine>,
        sink: Arc<RecordingSink>,
        scheduler: ReminderScheduler,
    }

    fn fixture(name: &str, templates: Templates) -> Fixture {
        let dir = std::env::temp_dir().join("daybook_test_reminders");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        let engine =
            Arc::new(Engine::new(path, BusinessHours::default(), Arc::new(NotifyHub::new())).unwrap());
        let sink = Arc::new(RecordingSink::default());
        let scheduler = ReminderScheduler::new(engine.clone(), sink.clone(), Arc::new(templates));
        Fixture { engine, sink, scheduler }
    }

    fn config() -> JobConfig {
        JobConfig {
            address: "1 Main St".into(),
            ..JobConfig::default()
        }
    }

    async fn parent(engine: &Engine, name: &str, email: Option<&str>, phone: Option<&str>) -> Client {
        let mut c = Client::new(Ulid::new(), ClientKind::Parent, name);
        c.email = email.map(Into::into);
        c.phone = phone.map(Into::into);
        engine.save_client(c).await.unwrap()
    }

    async fn baby(engine: &Engine, name: &str, parents: &[Ulid]) -> ClientRef {
        let mut c = Client::new(Ulid::new(), ClientKind::Baby, name);
        c.parent_ids = parents.to_vec();
        ClientRef::Baby(engine.save_client(c).await.unwrap().id)
    }

    async fn book(engine: &Engine, client: ClientRef, date: NaiveDate, start: Min, package_id: Option<Ulid>) -> Ulid {
        engine
            .book(BookingRequest {
                id: Ulid::new(),
                client,
                date,
                start,
                purchase_id: None,
                package_id,
                schedule_preferences: None,
            })
            .await
            .unwrap()
            .appointment
            .id
    }

    #[tokio::test]
    async fn day_before_email_goes_out_once() {
        let f = fixture("email_once.wal", Templates::default());
        let ana = parent(&f.engine, "Ana", Some("ana@example.com"), None).await;
        let id = book(&f.engine, ClientRef::Parent(ana.id), day(2026, 3, 6), hm(9, 0), None).await;

        let first = f.scheduler.run_at(&config(), THURSDAY_MORNING).await;
        assert_eq!(first.count("email_24h"), 1);
        assert_eq!(f.sink.sent_to(), vec!["ana@example.com"]);
        assert!(f.engine.appointment(&id).await.unwrap().reminder_24h_sent);
        let body = f.sink.sent.lock().unwrap()[0].body.clone();
        assert!(body.contains("Hi Ana"));
        assert!(body.contains("09:00"));

        let second = f.scheduler.run_at(&config(), THURSDAY_MORNING).await;
        assert_eq!(second.processed, 0);
        assert_eq!(f.sink.sent_to().len(), 1);
    }

    #[tokio::test]
    async fn failed_email_is_retried_next_run() {
        let f = fixture("email_retry.wal", Templates::default());
        let ana = parent(&f.engine, "Ana", Some("ana@example.com"), None).await;
        let id = book(&f.engine, ClientRef::Parent(ana.id), day(2026, 3, 6), hm(9, 0), None).await;
        f.sink.fail_for("ana@example.com");

        let failed = f.scheduler.run_at(&config(), THURSDAY_MORNING).await;
        assert_eq!(failed.count("email_24h"), 0);
        assert_eq!(failed.failed, 1);
        assert!(!f.engine.appointment(&id).await.unwrap().reminder_24h_sent);

        f.sink.heal();
        let retried = f.scheduler.run_at(&config(), THURSDAY_MORNING).await;
        assert_eq!(retried.count("email_24h"), 1);
        assert!(f.engine.appointment(&id).await.unwrap().reminder_24h_sent);
    }

    #[tokio::test]
    async fn baby_reminder_falls_through_to_next_parent() {
        let f = fixture("email_parents.wal", Templates::default());
        let ana = parent(&f.engine, "Ana", Some("ana@example.com"), None).await;
        let ben = parent(&f.engine, "Ben", Some("ben@example.com"), None).await;
        let kid = baby(&f.engine, "Kid", &[ana.id, ben.id]).await;
        let id = book(&f.engine, kid, day(2026, 3, 6), hm(9, 0), None).await;
        let first_parent = f.engine.recipient_emails(kid)[0].address.clone();
        f.sink.fail_for(&first_parent);

        let report = f.scheduler.run_at(&config(), THURSDAY_MORNING).await;
        assert_eq!(report.count("email_24h"), 1);
        assert_eq!(f.sink.sent_to().len(), 1);
        assert_ne!(f.sink.sent_to()[0], first_parent);
        assert!(f.engine.appointment(&id).await.unwrap().reminder_24h_sent);
    }

    #[tokio::test]
    async fn no_address_is_skipped_not_failed() {
        let f = fixture("email_none.wal", Templates::default());
        let ana = parent(&f.engine, "Ana", None, None).await;
        book(&f.engine, ClientRef::Parent(ana.id), day(2026, 3, 6), hm(9, 0), None).await;

        let report = f.scheduler.run_at(&config(), THURSDAY_MORNING).await;
        assert_eq!(report.processed, 0);
        assert_eq!(report.failed, 0);
        assert!(f.sink.sent_to().is_empty());
    }

    #[tokio::test]
    async fn missing_template_leaves_flag_unset() {
        let f = fixture("email_template.wal", Templates::default().without(TemplateKey::Reminder24h));
        let ana = parent(&f.engine, "Ana", Some("ana@example.com"), None).await;
        let id = book(&f.engine, ClientRef::Parent(ana.id), day(2026, 3, 6), hm(9, 0), None).await;

        let report = f.scheduler.run_at(&config(), THURSDAY_MORNING).await;
        assert_eq!(report.failed, 1);
        assert!(f.sink.sent_to().is_empty());
        assert!(!f.engine.appointment(&id).await.unwrap().reminder_24h_sent);
    }

    #[tokio::test]
    async fn same_day_groups_by_phone() {
        let f = fixture("same_day.wal", Templates::default());
        let today = day(2026, 3, 5);
        let ana = parent(&f.engine, "Ana", None, Some("+100")).await;
        let twin_a = baby(&f.engine, "Lia", &[ana.id]).await;
        let twin_b = baby(&f.engine, "Leo", &[ana.id]).await;
        let bea = parent(&f.engine, "Bea", None, Some("+200")).await;
        let a1 = book(&f.engine, twin_a, today, hm(9, 0), None).await;
        let a2 = book(&f.engine, twin_b, today, hm(11, 0), None).await;
        let b1 = book(&f.engine, ClientRef::Parent(bea.id), today, hm(9, 0), None).await;

        let report = f.scheduler.run_at(&config(), THURSDAY_MORNING).await;
        assert_eq!(report.count("same_day"), 3);

        let messages = f.engine.pending_messages();
        assert_eq!(messages.len(), 2);
        let multi = messages.iter().find(|m| m.phone == "+100").unwrap();
        let mut covered = multi.appointment_ids.clone();
        covered.sort();
        let mut expected = vec![a1, a2];
        expected.sort();
        assert_eq!(covered, expected);
        assert!(multi.body.contains("2 appointments"));
        assert!(multi.body.contains("Lia") && multi.body.contains("Leo"));

        let single = messages.iter().find(|m| m.phone == "+200").unwrap();
        assert_eq!(single.appointment_ids, vec![b1]);
        assert_eq!(single.category, MessageCategory::SameDayReminder);
        assert!(single.body.contains("Hi Bea"));

        for id in [a1, a2, b1] {
            assert!(f.engine.appointment(&id).await.unwrap().reminder_day_sent);
        }
        let again = f.scheduler.run_at(&config(), THURSDAY_MORNING).await;
        assert_eq!(again.processed, 0);
        assert_eq!(f.engine.pending_messages().len(), 2);
    }

    #[tokio::test]
    async fn payment_reminder_two_days_ahead() {
        let f = fixture("payment.wal", Templates::default());
        let saturday = day(2026, 3, 7);
        let deposit = Package {
            id: Ulid::new(),
            name: "Massage".into(),
            duration_minutes: 60,
            requires_advance_payment: true,
            advance_payment_amount: 5_000,
        };
        f.engine.save_package(deposit.clone()).await.unwrap();
        let ana = parent(&f.engine, "Ana", None, Some("+100")).await;
        let bea = parent(&f.engine, "Bea", None, Some("+200")).await;
        let pending = book(&f.engine, ClientRef::Parent(ana.id), saturday, hm(9, 0), Some(deposit.id)).await;
        let scheduled = book(&f.engine, ClientRef::Parent(bea.id), saturday, hm(9, 0), None).await;

        let report = f.scheduler.run_at(&config(), THURSDAY_MORNING).await;
        assert_eq!(report.count("payment_48h"), 1);
        let messages = f.engine.pending_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].category, MessageCategory::PaymentReminder);
        assert_eq!(messages[0].appointment_ids, vec![pending]);
        assert!(messages[0].body.contains("50.00"));
        assert!(f.engine.appointment(&pending).await.unwrap().payment_reminder_sent);
        assert!(!f.engine.appointment(&scheduled).await.unwrap().payment_reminder_sent);

        let again = f.scheduler.run_at(&config(), THURSDAY_MORNING).await;
        assert_eq!(again.count("payment_48h"), 0);
    }
}

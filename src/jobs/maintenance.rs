use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Months, NaiveDate};
use tokio::sync::Mutex;
use tracing::warn;
use ulid::Ulid;

use crate::config::JobConfig;
use crate::engine::{now_ms, Engine};
use crate::model::*;

use super::{BatchJob, JobReport};

/// Daily automatic transitions and housekeeping:
/// no-show sweep, prepayment escalation, aging out babies, expiring
/// undelivered messages and dropping stale notifications.
pub struct MaintenanceSweep {
    engine: Arc<Engine>,
    running: Mutex<()>,
}

impl MaintenanceSweep {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            running: Mutex::new(()),
        }
    }

    /// One run as of the instant `now`.
    pub async fn run_at(&self, config: &JobConfig, now: Ms) -> JobReport {
        let mut report = JobReport::default();
        let Ok(_running) = self.running.try_lock() else {
            warn!("maintenance sweep already running, skipping");
            return report;
        };
        let today = config.local_date(now);

        let swept = self.sweep_no_shows(today, config, &mut report).await;
        report.step("no_show", swept);
        let escalated = self.escalate(now, config, &mut report).await;
        report.step("prepayment_required", escalated);
        let deactivated = self.deactivate_aged_out(today, config, &mut report).await;
        report.step("deactivated", deactivated);
        let expired = self.expire_messages(now, config, &mut report).await;
        report.step("messages_expired", expired);
        let deleted = self.delete_notifications(now, &mut report).await;
        report.step("notifications_deleted", deleted);
        report
    }

    /// Open appointments dated `grace` days ago or earlier become NO_SHOW,
    /// each counting once against its client.
    async fn sweep_no_shows(&self, today: NaiveDate, config: &JobConfig, report: &mut JobReport) -> usize {
        let cutoff = today - Duration::days(config.no_show_grace_days);
        let candidates = self
            .engine
            .appointments_between(NaiveDate::MIN, cutoff, |a| a.status.is_open())
            .await;
        let mut swept = 0;
        for a in candidates {
            match self.engine.sweep_no_show(a.id).await {
                Ok(true) => swept += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("no-show sweep of {} failed: {e}", a.id);
                    report.failed += 1;
                }
            }
        }
        swept
    }

    async fn escalate(&self, now: Ms, config: &JobConfig, report: &mut JobReport) -> usize {
        let mut escalated = 0;
        let due = self
            .engine
            .clients()
            .into_iter()
            .filter(|c| !c.requires_prepayment && c.no_show_count >= config.no_show_threshold);
        for client in due {
            match self.engine.require_prepayment(client.id).await {
                Ok(true) => escalated += 1,
                Ok(false) => continue,
                Err(e) => {
                    warn!("prepayment escalation for {} failed: {e}", client.id);
                    report.failed += 1;
                    continue;
                }
            }
            let notice = Notification {
                id: Ulid::new(),
                client_id: Some(client.id),
                title: "Advance payment now required".into(),
                body: format!(
                    "{} has {} missed appointments and must pay in advance for new bookings.",
                    client.name, client.no_show_count
                ),
                created_at: now,
                expires_at: now + config.notification_ttl_ms,
            };
            if let Err(e) = self.engine.post_notification(notice).await {
                warn!("escalation notice for {} failed: {e}", client.id);
            }
        }
        escalated
    }

    async fn deactivate_aged_out(&self, today: NaiveDate, config: &JobConfig, report: &mut JobReport) -> usize {
        let months = Months::new(config.client_max_age_months);
        let mut deactivated = 0;
        let aged_out = self.engine.clients().into_iter().filter(|c| {
            c.active
                && c.kind == ClientKind::Baby
                && c.birth_date
                    .and_then(|b| b.checked_add_months(months))
                    .is_some_and(|limit| limit <= today)
        });
        for client in aged_out {
            match self.engine.deactivate_client(client.id).await {
                Ok(true) => deactivated += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("deactivating {} failed: {e}", client.id);
                    report.failed += 1;
                }
            }
        }
        deactivated
    }

    async fn expire_messages(&self, now: Ms, config: &JobConfig, report: &mut JobReport) -> usize {
        let mut expired = 0;
        for message in self.engine.pending_messages() {
            if message.created_at + config.outbound_expiry_ms > now {
                continue;
            }
            match self
                .engine
                .set_message_status(message.id, OutboundStatus::Expired)
                .await
            {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("expiring message {} failed: {e}", message.id);
                    report.failed += 1;
                }
            }
        }
        expired
    }

    async fn delete_notifications(&self, now: Ms, report: &mut JobReport) -> usize {
        let mut deleted = 0;
        for n in self.engine.notifications() {
            if n.expires_at > now {
                continue;
            }
            match self.engine.delete_notification(n.id).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    warn!("deleting notification {} failed: {e}", n.id);
                    report.failed += 1;
                }
            }
        }
        deleted
    }
}

#[async_trait]
impl BatchJob for MaintenanceSweep {
    fn name(&self) -> &'static str {
        "maintenance"
    }

    async fn run(&self, config: &JobConfig) -> JobReport {
        self.run_at(config, now_ms()).await
    }
}

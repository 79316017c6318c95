use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::booking::BookingService;
use crate::config::TenantConfig;
use crate::engine::Engine;
use crate::jobs::{self, BatchJob, MaintenanceSweep, ReminderScheduler};
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::sink::NotificationSink;

/// One clinic: its engine and the request-facing booking service over it.
pub struct Tenant {
    pub engine: Arc<Engine>,
    pub bookings: BookingService,
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL +
/// daily jobs + compactor. Tenant = database name from the pgwire connection.
pub struct TenantManager {
    tenants: DashMap<String, Arc<Tenant>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    config: TenantConfig,
    sink: Arc<dyn NotificationSink>,
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        config: TenantConfig,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            tenants: DashMap::new(),
            data_dir,
            compact_threshold,
            config,
            sink,
        }
    }

    /// Get or lazily create the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Tenant>> {
        if let Some(existing) = self.tenants.get(tenant) {
            return Ok(existing.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.tenants.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two connections may race to create the same tenant; the entry
        // lock makes the loser reuse the winner's engine.
        let entry = self.tenants.entry(tenant.to_string());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path, self.config.hours.clone(), notify)?);
        let templates = Arc::new(self.config.templates.clone());
        let bookings = BookingService::new(
            engine.clone(),
            self.sink.clone(),
            templates.clone(),
            self.config.jobs.clone(),
        );

        let daily: Vec<Arc<dyn BatchJob>> = vec![
            Arc::new(MaintenanceSweep::new(engine.clone())),
            Arc::new(ReminderScheduler::new(engine.clone(), self.sink.clone(), templates)),
        ];
        tokio::spawn(jobs::run_daily(daily, self.config.jobs.clone()));
        tokio::spawn(jobs::run_compactor(engine.clone(), self.compact_threshold));

        let tenant = Arc::new(Tenant { engine, bookings });
        entry.or_insert(tenant.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        tracing::info!("tenant {safe_name} loaded");
        Ok(tenant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use ulid::Ulid;

    use crate::booking::Actor;
    use crate::engine::BookingRequest;
    use crate::model::fixtures::{day, hm};
    use crate::model::*;
    use crate::sink::LogSink;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("daybook_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, TenantConfig::default(), Arc::new(LogSink))
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = manager(dir);

        let a = tm.get_or_create("clinic_a").unwrap();
        let b = tm.get_or_create("clinic_b").unwrap();

        let client = Client::new(Ulid::new(), ClientKind::Parent, "Ana");
        a.engine.save_client(client.clone()).await.unwrap();
        a.bookings
            .create(
                Actor::Staff,
                BookingRequest {
                    id: Ulid::new(),
                    client: ClientRef::Parent(client.id),
                    date: day(2026, 3, 2),
                    start: hm(9, 0),
                    purchase_id: None,
                    package_id: None,
                    schedule_preferences: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(a.engine.appointments_on(day(2026, 3, 2)).await.len(), 1);
        assert!(b.engine.appointments_on(day(2026, 3, 2)).await.is_empty());
        assert!(b.engine.client(&client.id).is_none());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        // No WAL files should exist yet
        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _tenant = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = manager(dir);

        let t1 = tm.get_or_create("foo").unwrap();
        let t2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&t1, &t2));
        assert!(Arc::ptr_eq(&t1.engine, &t2.engine));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        // Path traversal attempt
        let _tenant = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        // Empty after sanitization
        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = manager(dir);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = manager(dir);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}

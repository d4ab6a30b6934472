use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::compactor;
use crate::engine::{Engine, EngineSettings};
use crate::limits::*;
use crate::notify::NotifyHub;

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + compactor.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    settings: EngineSettings,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, settings: EngineSettings) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            settings,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Keep the name usable as a file name inside data_dir.
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

        // Two connections may race to open the same tenant; only one engine may own the WAL.
        let engine = match self.engines.entry(tenant.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => return Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let notify = Arc::new(NotifyHub::new());
                let engine = Arc::new(Engine::new(wal_path, notify, self.settings)?);
                slot.insert(engine.clone());
                engine
            }
        };

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        tracing::info!("tenant {tenant:?} opened");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("salonslot_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, EngineSettings::default())
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let tm = manager(test_data_dir("isolation"));

        let eng_a = tm.get_or_create("salon_a").unwrap();
        let eng_b = tm.get_or_create("salon_b").unwrap();

        // Same employee id in both tenants
        eng_a.register_employee(5, Some("Mei".into())).await.unwrap();
        eng_b.register_employee(5, Some("Ravi".into())).await.unwrap();
        eng_a.register_member(9, None).await.unwrap();

        eng_a
            .create_timetable(5, 2, DateRange::new(crate::engine::parse_date("2025-01-01").unwrap(), None), 5, None)
            .await
            .unwrap();

        assert_eq!(eng_a.list_timetables(5).await.unwrap().len(), 1);
        assert!(eng_b.list_timetables(5).await.unwrap().is_empty());
        assert!(!eng_b.store.contains_member(9));
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let tm = manager(test_data_dir("same_eng"));

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let tm = manager(test_data_dir("name_too_long"));

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_state_survives_reopen() {
        let dir = test_data_dir("reopen");
        {
            let tm = manager(dir.clone());
            let engine = tm.get_or_create("spa").unwrap();
            engine.register_employee(5, None).await.unwrap();
        }
        let tm = manager(dir);
        let engine = tm.get_or_create("spa").unwrap();
        assert!(engine.store.contains_employee(5));
    }
}

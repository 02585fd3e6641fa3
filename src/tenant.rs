use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::engine::{Engine, EngineConfig};
use crate::limits::*;
use crate::notify::NotifyHub;

/// Manages per-tenant engines. Each tenant (a congregation) gets its own
/// Engine and WAL file. Tenant = `database` named in the hello handshake.
///
/// Each tenant has its own once-cell, so a WAL replay only holds up callers
/// for that tenant and never a whole map shard.
pub struct TenantManager {
    engines: DashMap<String, Arc<OnceCell<Arc<Engine>>>>,
    data_dir: PathBuf,
    engine_config: EngineConfig,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, engine_config: EngineConfig) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            engine_config,
        }
    }

    /// Tenants whose engine has finished loading.
    pub fn tenant_count(&self) -> usize {
        self.engines.iter().filter(|cell| cell.initialized()).count()
    }

    /// Get or lazily create an engine for the given tenant.
    /// Names that sanitize to the same file share one engine.
    pub async fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        let existing = self.engines.get(&safe_name).map(|cell| cell.value().clone());
        let cell = match existing {
            Some(cell) => cell,
            None => {
                if self.engines.len() >= MAX_TENANTS {
                    return Err(std::io::Error::other("too many tenants"));
                }
                // The shard lock is held only long enough to insert the empty cell.
                self.engines.entry(safe_name.clone()).or_default().value().clone()
            }
        };

        let engine = cell
            .get_or_try_init(|| async {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let notify = Arc::new(NotifyHub::new());
                let engine = Engine::with_config(wal_path, notify, self.engine_config.clone())?;
                tracing::info!("loaded tenant {safe_name} ({} resources)", engine.resource_count());
                metrics::gauge!(crate::observability::TENANTS_ACTIVE).increment(1.0);
                Ok::<_, std::io::Error>(Arc::new(engine))
            })
            .await?
            .clone();
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("pewledger_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn seat(resource: &str, requester: &str, token: &str) -> ReserveRequest {
        ReserveRequest {
            resource_id: resource.into(),
            requester_id: requester.into(),
            units: 1,
            request_token: token.into(),
            note: None,
        }
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, EngineConfig::default());

        let grace = tm.get_or_create("grace_chapel").await.unwrap();
        let hope = tm.get_or_create("hope_fellowship").await.unwrap();

        // Same resource id in both tenants
        grace.create_resource("vbs".into(), None, Some(1)).await.unwrap();
        hope.create_resource("vbs".into(), None, Some(1)).await.unwrap();

        grace.reserve(seat("vbs", "ann", "t1")).await.unwrap();

        // Hope's copy is untouched
        assert_eq!(hope.available_capacity("vbs").await.unwrap(), Some(1));
        assert_eq!(grace.available_capacity("vbs").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), EngineConfig::default());

        // No WAL files should exist yet
        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_church").await.unwrap();
        assert!(dir.join("my_church.wal").exists());
        assert_eq!(tm.tenant_count(), 1);
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, EngineConfig::default());

        let eng1 = tm.get_or_create("foo").await.unwrap();
        let eng2 = tm.get_or_create("foo").await.unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_reloads_from_disk() {
        let dir = test_data_dir("reload");
        {
            let tm = TenantManager::new(dir.clone(), EngineConfig::default());
            let eng = tm.get_or_create("stmark").await.unwrap();
            eng.create_resource("supper".into(), None, Some(3)).await.unwrap();
            eng.reserve(seat("supper", "ann", "t1")).await.unwrap();
        }

        let tm = TenantManager::new(dir, EngineConfig::default());
        let eng = tm.get_or_create("stmark").await.unwrap();
        assert_eq!(eng.get("supper").await.unwrap().allocated_total, 1);
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), EngineConfig::default());

        // Path traversal attempt
        let eng = tm.get_or_create("../evil").await.unwrap();
        // Should create "evil.wal", not "../evil.wal"
        assert!(dir.join("evil.wal").exists());

        // Empty after sanitization
        let result = tm.get_or_create("../..").await;
        assert!(result.is_err());

        let plain = tm.get_or_create("evil").await.unwrap();
        assert!(Arc::ptr_eq(&eng, &plain));
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, EngineConfig::default());

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).await.err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));

        let at_limit = "x".repeat(MAX_TENANT_NAME_LEN);
        assert!(tm.get_or_create(&at_limit).await.is_ok());
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = TenantManager::new(dir, EngineConfig::default());

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).await.unwrap();
        }
        let err = tm.get_or_create("one_more").await.err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_connections_share_one_engine() {
        let dir = test_data_dir("concurrent_first");
        {
            let tm = TenantManager::new(dir.clone(), EngineConfig::default());
            let eng = tm.get_or_create("stjude").await.unwrap();
            eng.create_resource("bingo".into(), None, Some(100)).await.unwrap();
            for i in 0..50 {
                eng.reserve(seat("bingo", &format!("p{i}"), "t1")).await.unwrap();
            }
        }

        let tm = Arc::new(TenantManager::new(dir, EngineConfig::default()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tm = tm.clone();
            handles.push(tokio::spawn(async move { tm.get_or_create("stjude").await.unwrap() }));
        }
        let mut engines = Vec::new();
        for h in handles {
            engines.push(h.await.unwrap());
        }
        assert!(engines.iter().all(|e| Arc::ptr_eq(e, &engines[0])));
        assert_eq!(tm.tenant_count(), 1);
        assert_eq!(engines[0].get("bingo").await.unwrap().allocated_total, 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn other_tenants_served_while_one_loads() {
        let dir = test_data_dir("load_isolation");
        let tm = Arc::new(TenantManager::new(dir, EngineConfig::default()));
        let ready = tm.get_or_create("stpaul").await.unwrap();

        let mut loads = Vec::new();
        for i in 0..16 {
            let tm = tm.clone();
            loads.push(tokio::spawn(async move { tm.get_or_create(&format!("parish{i}")).await }));
        }
        // An already-loaded tenant is still reachable while others load.
        let again = tm.get_or_create("stpaul").await.unwrap();
        assert!(Arc::ptr_eq(&ready, &again));
        for h in loads {
            h.await.unwrap().unwrap();
        }
        assert_eq!(tm.tenant_count(), 17);
    }
}

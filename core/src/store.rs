//! SQLite-backed persistence for contracts and bypass requests.
//!
//! The in-memory registry and bypass manager are the source of truth during
//! a run; this store gives them a transactional home between runs. The
//! phased executor opens it when a database path is configured, restores
//! contract history and bypass requests on start, and syncs bypass state
//! back after every gate evaluation. Records are kept as JSON documents
//! beside their indexable key columns, so schema evolution stays in the
//! serde layer.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::bypass::{BypassManager, BypassRequest};
use crate::contracts::{ContractRegistry, PhaseContract};
use crate::errors::{StoreError, StoreResult};

/// SQLite store for registry state.
pub struct SqliteRegistryStore {
    pool: SqlitePool,
}

impl SqliteRegistryStore {
    /// Open (or create) the database at `db_path`.
    pub async fn new(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let connect_options = SqliteConnectOptions::from_str(db_path.to_string_lossy().as_ref())
            .map_err(|e| StoreError::Database(format!("invalid database path: {}", e)))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .connect_with(connect_options)
            .await
            .map_err(|e| StoreError::Database(format!("failed to open pool: {}", e)))?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Create the schema if it does not exist yet.
    async fn initialize(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS contracts (
                phase TEXT NOT NULL,
                version INTEGER NOT NULL,
                document TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (phase, version)
            );

            CREATE TABLE IF NOT EXISTS bypass_requests (
                id TEXT PRIMARY KEY NOT NULL,
                workflow_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                gate TEXT NOT NULL,
                status TEXT NOT NULL,
                request_date INTEGER NOT NULL,
                document TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_bypass_workflow ON bypass_requests(workflow_id);
            CREATE INDEX IF NOT EXISTS idx_bypass_status ON bypass_requests(status);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(format!("failed to create schema: {}", e)))?;
        Ok(())
    }

    /// Persist every version in the registry inside one transaction.
    /// Contracts are immutable, so existing `(phase, version)` rows are
    /// left untouched.
    pub async fn save_registry(&self, registry: &ContractRegistry) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(format!("failed to begin transaction: {}", e)))?;
        for phase in crate::phase::Phase::sequence() {
            for version in registry.list_versions(phase) {
                if let Some(contract) = registry.get(phase, Some(version)) {
                    let document = serde_json::to_string(&contract)?;
                    sqlx::query(
                        "INSERT OR IGNORE INTO contracts (phase, version, document, created_at) \
                         VALUES (?, ?, ?, ?)",
                    )
                    .bind(contract.phase.as_str())
                    .bind(contract.version as i64)
                    .bind(document)
                    .bind(contract.created_at.timestamp())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::Database(format!("failed to save contract: {}", e)))?;
                }
            }
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::Database(format!("failed to commit: {}", e)))?;
        Ok(())
    }

    /// Load all contract versions, ordered by phase then version.
    pub async fn load_contracts(&self) -> StoreResult<Vec<PhaseContract>> {
        let rows = sqlx::query("SELECT document FROM contracts ORDER BY phase, version")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("failed to load contracts: {}", e)))?;
        let mut contracts = Vec::with_capacity(rows.len());
        for row in rows {
            let document: String = row.get("document");
            contracts.push(serde_json::from_str(&document)?);
        }
        Ok(contracts)
    }

    /// Replay persisted contract versions into a registry.
    ///
    /// Hydrating an empty registry rebuilds the full history. Versions the
    /// registry already holds are left alone (contracts are immutable, so a
    /// matching version is the same contract); persisted versions beyond
    /// the registry's latest are appended in order.
    pub async fn hydrate_registry(&self, registry: &ContractRegistry) -> StoreResult<()> {
        for contract in self.load_contracts().await? {
            let known = registry.list_versions(contract.phase).len() as u32;
            if contract.version <= known {
                continue;
            }
            registry
                .restore(contract)
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }
        Ok(())
    }

    /// Persist the current state of every bypass request in one
    /// transaction; existing rows are overwritten with the latest status.
    pub async fn sync_bypasses(&self, manager: &BypassManager) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(format!("failed to begin transaction: {}", e)))?;
        for request in manager.list() {
            let document = serde_json::to_string(&request)?;
            sqlx::query(
                "INSERT OR REPLACE INTO bypass_requests \
                 (id, workflow_id, phase, gate, status, request_date, document) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(request.id.to_string())
            .bind(&request.workflow_id)
            .bind(request.phase.as_str())
            .bind(&request.gate)
            .bind(request.status.to_string())
            .bind(request.request_date.timestamp())
            .bind(document)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(format!("failed to sync bypass: {}", e)))?;
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::Database(format!("failed to commit: {}", e)))?;
        Ok(())
    }

    /// Load all bypass requests, oldest first.
    pub async fn load_bypasses(&self) -> StoreResult<Vec<BypassRequest>> {
        let rows = sqlx::query("SELECT document FROM bypass_requests ORDER BY request_date")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("failed to load bypasses: {}", e)))?;
        let mut requests = Vec::with_capacity(rows.len());
        for row in rows {
            let document: String = row.get("document");
            requests.push(serde_json::from_str(&document)?);
        }
        Ok(requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bypass::{BypassDuration, BypassStatus, RiskAssessment, RiskLevel};
    use crate::phase::Phase;

    async fn store(dir: &Path) -> SqliteRegistryStore {
        SqliteRegistryStore::new(&dir.join("registry.db")).await.unwrap()
    }

    #[tokio::test]
    async fn test_contract_history_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        let registry = ContractRegistry::with_defaults();
        store.save_registry(&registry).await.unwrap();

        let restored = ContractRegistry::new();
        store.hydrate_registry(&restored).await.unwrap();
        for phase in Phase::sequence() {
            assert_eq!(restored.list_versions(phase), registry.list_versions(phase));
            let original = registry.get(phase, None).unwrap();
            let loaded = restored.get(phase, None).unwrap();
            assert_eq!(loaded.version, original.version);
            assert_eq!(loaded.deliverables, original.deliverables);
        }
    }

    #[tokio::test]
    async fn test_save_registry_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let registry = ContractRegistry::with_defaults();

        store.save_registry(&registry).await.unwrap();
        store.save_registry(&registry).await.unwrap();
        let expected: usize = Phase::sequence()
            .iter()
            .map(|p| registry.list_versions(*p).len())
            .sum();
        assert_eq!(store.load_contracts().await.unwrap().len(), expected);
    }

    #[tokio::test]
    async fn test_hydrate_appends_only_newer_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        let registry = ContractRegistry::with_defaults();
        registry
            .create(
                Phase::Design,
                vec![crate::contracts::Deliverable::new("api_spec", &["*api*.md"])],
                std::collections::BTreeMap::new(),
                vec!["solution_architect".to_string()],
            )
            .unwrap();
        store.save_registry(&registry).await.unwrap();

        // A fresh process starts from the built-in defaults and picks up
        // the newer persisted version.
        let fresh = ContractRegistry::with_defaults();
        store.hydrate_registry(&fresh).await.unwrap();
        assert_eq!(fresh.list_versions(Phase::Design), vec![1, 2]);

        store.hydrate_registry(&fresh).await.unwrap();
        assert_eq!(fresh.list_versions(Phase::Design), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_sync_bypasses_tracks_manager_state() {
        use crate::audit::AuditLog;
        use crate::policy::PolicyLoader;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        let policy = Arc::new(
            PolicyLoader::from_toml_str(
                r#"
[[bypass_rules.bypassable_gates]]
gate = "test_coverage"
phase = "implementation"
requires_adr = true
"#,
            )
            .unwrap(),
        );
        let audit = Arc::new(AuditLog::open(&dir.path().join("bypasses.jsonl")).unwrap());
        let manager = crate::bypass::BypassManager::new(policy, audit);

        let request = manager
            .create_request(crate::bypass::BypassRequestSpec {
                workflow_id: "wf-1".to_string(),
                phase: Phase::Implementation,
                gate: "test_coverage".to_string(),
                current_value: 0.68,
                required_threshold: 0.80,
                justification: "legacy module".to_string(),
                risks: RiskAssessment {
                    technical: RiskLevel::Medium,
                    business: RiskLevel::Low,
                    security: RiskLevel::Low,
                },
                duration: BypassDuration::Temporary,
                expiration: None,
                remediation_plan: None,
                compensating_controls: vec![],
                requested_by: "backend_developer".to_string(),
            })
            .unwrap();
        store.sync_bypasses(&manager).await.unwrap();
        let loaded = store.load_bypasses().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, BypassStatus::Proposed);

        manager
            .approve(
                request.id,
                "tech_lead",
                Some(Path::new("docs/adr/9.md")),
                None,
                None,
            )
            .unwrap();
        store.sync_bypasses(&manager).await.unwrap();
        let loaded = store.load_bypasses().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, BypassStatus::Approved);
    }

}

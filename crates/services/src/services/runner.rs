use std::sync::Arc;

use db::{DocumentStore, Filter, store::document_id};
use serde::{Deserialize, Serialize};

use super::{
    error::MigrationError,
    identifier::IdGenerator,
    ledger::LedgerStore,
    migrations::{EntityStatus, MigrationContext, MigrationDefinition},
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerOptions {
    /// Re-walk migrations already recorded as completed.
    #[serde(alias = "recheckCompleted")]
    pub recheck_completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityOutcome {
    pub migration: String,
    pub collection: String,
    pub entity_id: String,
    pub version: Option<i64>,
    pub version_assigned: bool,
    pub dependent_updated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedEntity {
    pub migration: String,
    pub collection: String,
    pub entity_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub applied: Vec<EntityOutcome>,
    pub skipped: Vec<EntityOutcome>,
    pub failed: Vec<FailedEntity>,
    /// Migrations that finished this run without failures.
    pub completed_migrations: Vec<String>,
    /// Migrations not walked because an earlier run completed them.
    pub skipped_migrations: Vec<String>,
}

impl MigrationReport {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Applies registered definitions in registration order, one entity at a time.
pub struct MigrationRunner {
    store: Arc<dyn DocumentStore>,
    ledger: LedgerStore,
    ids: IdGenerator,
    options: RunnerOptions,
    definitions: Vec<Box<dyn MigrationDefinition>>,
}

impl MigrationRunner {
    pub fn new(store: Arc<dyn DocumentStore>, ids: IdGenerator, options: RunnerOptions) -> Self {
        let ledger = LedgerStore::new(store.clone(), ids.clone());
        Self {
            store,
            ledger,
            ids,
            options,
            definitions: Vec::new(),
        }
    }

    pub fn register(
        &mut self,
        definition: Box<dyn MigrationDefinition>,
    ) -> Result<(), MigrationError> {
        if self
            .definitions
            .iter()
            .any(|existing| existing.name() == definition.name())
        {
            return Err(MigrationError::DuplicateDefinition(
                definition.name().to_string(),
            ));
        }
        self.definitions.push(definition);
        Ok(())
    }

    pub fn register_all(
        &mut self,
        definitions: Vec<Box<dyn MigrationDefinition>>,
    ) -> Result<(), MigrationError> {
        definitions
            .into_iter()
            .try_for_each(|definition| self.register(definition))
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    /// Runs every pending definition. Per-entity problems land in the report;
    /// storage failures abort the run and are returned.
    pub async fn run_pending_migrations(&self) -> Result<MigrationReport, MigrationError> {
        self.ledger.ensure_indexes().await?;
        let completed = if self.options.recheck_completed {
            Default::default()
        } else {
            self.ledger.applied_migrations().await?
        };

        let ctx = MigrationContext {
            store: self.store.as_ref(),
            ledger: &self.ledger,
            ids: &self.ids,
        };
        let mut report = MigrationReport::default();

        for definition in &self.definitions {
            let name = definition.name();
            if completed.contains(name) {
                tracing::debug!(migration = name, "Migration already completed; skipping");
                report.skipped_migrations.push(name.to_string());
                continue;
            }

            let failures_before = report.failed.len();
            self.run_definition(definition.as_ref(), &ctx, &mut report)
                .await?;

            if report.failed.len() == failures_before {
                self.ledger.record_migration_applied(name).await?;
                report.completed_migrations.push(name.to_string());
            } else {
                tracing::warn!(
                    migration = name,
                    failed = report.failed.len() - failures_before,
                    "Migration left entities unmigrated; it will be retried on the next run"
                );
            }
        }

        tracing::info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            completed = report.completed_migrations.len(),
            "Migration run finished"
        );
        Ok(report)
    }

    async fn run_definition(
        &self,
        definition: &dyn MigrationDefinition,
        ctx: &MigrationContext<'_>,
        report: &mut MigrationReport,
    ) -> Result<(), MigrationError> {
        let name = definition.name();
        let collection = definition.collection();
        let candidates = self.store.find(collection, &Filter::new()).await?;
        tracing::info!(
            migration = name,
            collection,
            candidates = candidates.len(),
            "Running migration"
        );

        for document in candidates
            .iter()
            .filter(|document| definition.applies_to(document))
        {
            let entity_id = document_id(document).unwrap_or("<missing _id>").to_string();

            let outcome = match definition.is_already_applied(ctx, document).await {
                Ok(true) => {
                    report.skipped.push(EntityOutcome {
                        migration: name.to_string(),
                        collection: collection.to_string(),
                        entity_id,
                        version: None,
                        version_assigned: false,
                        dependent_updated: false,
                    });
                    continue;
                }
                Ok(false) => definition.apply(ctx, document).await,
                Err(err) => Err(err),
            };

            match outcome {
                Ok(change) => {
                    let entry = EntityOutcome {
                        migration: name.to_string(),
                        collection: collection.to_string(),
                        entity_id,
                        version: Some(change.version),
                        version_assigned: change.version_assigned,
                        dependent_updated: change.dependent_updated,
                    };
                    match change.status {
                        EntityStatus::Applied => report.applied.push(entry),
                        EntityStatus::AlreadyRecorded => report.skipped.push(entry),
                    }
                }
                Err(err) if err.is_fatal() => {
                    tracing::error!(
                        migration = name,
                        entity_id = %entity_id,
                        error = %err,
                        "Aborting migration run"
                    );
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        migration = name,
                        entity_id = %entity_id,
                        error = %err,
                        "Skipping entity"
                    );
                    report.failed.push(FailedEntity {
                        migration: name.to_string(),
                        collection: collection.to_string(),
                        entity_id,
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use db::{Document, MemoryDocumentStore, SqlDocumentStore};
    use sea_orm::Database;
    use sea_orm_migration::MigratorTrait;
    use serde_json::json;
    use test_support::{FlakyStore, doc};

    use super::*;
    use crate::services::{
        ledger::{DEFAULT_VERSION_FIELD, ENTITY_VERSIONS},
        migrations::{CONFIG_FILE_DEFAULT_VERSION, WORKFLOW_DEFAULT_VERSION, default_migrations},
    };

    const COLLECTIONS: [&str; 6] = [
        "workflows",
        "stateMachines",
        "configFiles",
        "configs.files",
        ENTITY_VERSIONS,
        "appliedMigrations",
    ];

    async fn populate(store: &dyn DocumentStore) {
        let fixtures = [
            ("workflows", json!({ "_id": "w1", "appId": "app1", "name": "Build" })),
            ("workflows", json!({ "_id": "w2", "appId": "app1", "name": "Deploy" })),
            ("stateMachines", json!({ "_id": "sm1", "originId": "w1" })),
            ("stateMachines", json!({ "_id": "sm2", "originId": "w2" })),
            (
                "configFiles",
                json!({ "_id": "c1", "entityId": "svc1", "relativeFilePath": "app.yaml", "fileUuid": "f1" }),
            ),
            ("configs.files", json!({ "_id": "f1", "length": 42 })),
        ];
        for (collection, value) in fixtures {
            store.insert_one(collection, doc(value)).await.unwrap();
        }
    }

    fn runner(store: Arc<dyn DocumentStore>) -> MigrationRunner {
        let mut runner = MigrationRunner::new(store, IdGenerator::default(), RunnerOptions::default());
        runner.register_all(default_migrations()).unwrap();
        runner
    }

    async fn snapshot(store: &dyn DocumentStore) -> HashMap<&'static str, Vec<Document>> {
        let mut state = HashMap::new();
        for collection in COLLECTIONS {
            state.insert(collection, store.find(collection, &Filter::new()).await.unwrap());
        }
        state
    }

    async fn assert_ledger_unique(store: &dyn DocumentStore) {
        let records = store.find(ENTITY_VERSIONS, &Filter::new()).await.unwrap();
        let mut tuples: HashMap<String, usize> = HashMap::new();
        for record in &records {
            let key = format!(
                "{}/{}/{}",
                record["entityType"], record["entityUuid"], record["version"]
            );
            *tuples.entry(key).or_default() += 1;
        }
        assert!(
            tuples.values().all(|count| *count == 1),
            "duplicate ledger records: {tuples:?}"
        );
    }

    #[tokio::test]
    async fn second_run_applies_nothing_and_leaves_state_unchanged() {
        let store = Arc::new(MemoryDocumentStore::new());
        populate(store.as_ref()).await;
        let runner = runner(store.clone());

        let first = runner.run_pending_migrations().await.unwrap();
        assert_eq!(first.applied.len(), 3);
        assert!(first.failed.is_empty());
        assert_eq!(
            first.completed_migrations,
            vec![WORKFLOW_DEFAULT_VERSION, CONFIG_FILE_DEFAULT_VERSION]
        );
        let after_first = snapshot(store.as_ref()).await;

        let second = runner.run_pending_migrations().await.unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(
            second.skipped_migrations,
            vec![WORKFLOW_DEFAULT_VERSION, CONFIG_FILE_DEFAULT_VERSION]
        );
        assert_eq!(snapshot(store.as_ref()).await, after_first);

        let config_content = store.documents("configs.files").remove(0);
        assert_eq!(config_content.get("version"), Some(&json!(1)));
        for state_machine in store.documents("stateMachines") {
            assert_eq!(state_machine.get("originVersion"), Some(&json!(1)));
        }
    }

    #[tokio::test]
    async fn rechecking_completed_migrations_is_still_idempotent() {
        let store = Arc::new(MemoryDocumentStore::new());
        populate(store.as_ref()).await;
        runner(store.clone()).run_pending_migrations().await.unwrap();

        let mut recheck = MigrationRunner::new(
            store.clone(),
            IdGenerator::default(),
            RunnerOptions {
                recheck_completed: true,
            },
        );
        recheck.register_all(default_migrations()).unwrap();
        let report = recheck.run_pending_migrations().await.unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.skipped.len(), 3);
        assert_eq!(store.documents(ENTITY_VERSIONS).len(), 3);
    }

    #[tokio::test]
    async fn versioned_entity_without_ledger_entry_gets_only_the_missing_pieces() {
        let store = Arc::new(MemoryDocumentStore::new());
        store
            .insert_one("workflows", doc(json!({ "_id": "w9", "defaultVersion": 3 })))
            .await
            .unwrap();
        store
            .insert_one("stateMachines", doc(json!({ "_id": "sm9", "originId": "w9" })))
            .await
            .unwrap();

        let report = runner(store.clone()).run_pending_migrations().await.unwrap();
        assert_eq!(report.applied.len(), 1);
        let outcome = &report.applied[0];
        assert_eq!(outcome.entity_id, "w9");
        assert_eq!(outcome.version, Some(3));
        assert!(!outcome.version_assigned);
        assert!(outcome.dependent_updated);

        let workflow = store.documents("workflows").remove(0);
        assert_eq!(workflow.get(DEFAULT_VERSION_FIELD), Some(&json!(3)));
        let state_machine = store.documents("stateMachines").remove(0);
        assert_eq!(state_machine.get("originVersion"), Some(&json!(3)));

        let records = store.documents(ENTITY_VERSIONS);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("version"), Some(&json!(3)));
        assert_eq!(records[0].get("entityUuid"), Some(&json!("w9")));
    }

    #[tokio::test]
    async fn every_state_machine_of_a_workflow_gets_the_version() {
        let store = Arc::new(MemoryDocumentStore::new());
        store
            .insert_one("workflows", doc(json!({ "_id": "w1", "appId": "app1" })))
            .await
            .unwrap();
        for id in ["sm1", "sm2", "sm3"] {
            store
                .insert_one("stateMachines", doc(json!({ "_id": id, "originId": "w1" })))
                .await
                .unwrap();
        }

        let report = runner(store.clone()).run_pending_migrations().await.unwrap();
        assert_eq!(report.applied.len(), 1);
        assert!(report.applied[0].dependent_updated);
        assert!(report.completed_migrations.contains(&WORKFLOW_DEFAULT_VERSION.to_string()));
        for state_machine in store.documents("stateMachines") {
            assert_eq!(
                state_machine.get("originVersion"),
                Some(&json!(1)),
                "{state_machine:?}"
            );
        }

        let mut recheck = MigrationRunner::new(
            store.clone(),
            IdGenerator::default(),
            RunnerOptions {
                recheck_completed: true,
            },
        );
        recheck.register_all(default_migrations()).unwrap();
        let again = recheck.run_pending_migrations().await.unwrap();
        assert!(again.applied.is_empty());
        assert_eq!(again.skipped.len(), 1);
        assert_eq!(again.skipped[0].version, None);
    }

    #[tokio::test]
    async fn concurrent_runs_apply_each_entity_once() {
        let store = Arc::new(MemoryDocumentStore::new());
        populate(store.as_ref()).await;
        let left = runner(store.clone());
        let right = runner(store.clone());

        let (left, right) = tokio::join!(
            left.run_pending_migrations(),
            right.run_pending_migrations()
        );
        let (left, right) = (left.unwrap(), right.unwrap());
        assert!(left.failed.is_empty() && right.failed.is_empty());

        let mut applied: Vec<String> = left
            .applied
            .iter()
            .chain(&right.applied)
            .map(|outcome| outcome.entity_id.clone())
            .collect();
        applied.sort();
        assert_eq!(applied, vec!["c1", "w1", "w2"]);

        assert_ledger_unique(store.as_ref()).await;
        assert_eq!(store.documents(ENTITY_VERSIONS).len(), 3);
        assert_eq!(store.documents("appliedMigrations").len(), 2);
        for state_machine in store.documents("stateMachines") {
            assert_eq!(state_machine.get("originVersion"), Some(&json!(1)));
        }
    }

    #[tokio::test]
    async fn malformed_entities_are_reported_and_do_not_stop_the_run() {
        let store = Arc::new(MemoryDocumentStore::new());
        populate(store.as_ref()).await;
        store
            .insert_one("workflows", doc(json!({ "_id": "bad", "defaultVersion": "one" })))
            .await
            .unwrap();

        let report = runner(store.clone()).run_pending_migrations().await.unwrap();
        assert_eq!(report.applied.len(), 3);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].entity_id, "bad");
        assert!(report.has_failures());
        // The workflow migration stays pending so the bad record is revisited.
        assert_eq!(report.completed_migrations, vec![CONFIG_FILE_DEFAULT_VERSION]);

        let again = runner(store.clone()).run_pending_migrations().await.unwrap();
        assert!(again.applied.is_empty());
        assert_eq!(again.failed.len(), 1);
        assert_eq!(again.skipped_migrations, vec![CONFIG_FILE_DEFAULT_VERSION]);
    }

    #[tokio::test]
    async fn storage_failure_aborts_the_run() {
        let inner: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        populate(inner.as_ref()).await;
        let flaky = Arc::new(FlakyStore::new(inner, 0));

        let err = runner(flaky.clone()).run_pending_migrations().await.unwrap_err();
        assert!(matches!(err, MigrationError::StorageUnavailable(_)));
        assert!(err.is_fatal());
        assert_eq!(flaky.writes_attempted(), 1);
    }

    #[tokio::test]
    async fn runs_interrupted_at_any_write_converge_without_duplicates() {
        for writes_allowed in 0..16 {
            let inner: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
            populate(inner.as_ref()).await;

            let flaky: Arc<dyn DocumentStore> =
                Arc::new(FlakyStore::new(inner.clone(), writes_allowed));
            let _ = runner(flaky).run_pending_migrations().await;
            assert_ledger_unique(inner.as_ref()).await;

            let report = runner(inner.clone()).run_pending_migrations().await.unwrap();
            assert!(report.failed.is_empty(), "failures after {writes_allowed} writes");
            assert_ledger_unique(inner.as_ref()).await;

            let records = inner.find(ENTITY_VERSIONS, &Filter::new()).await.unwrap();
            assert_eq!(records.len(), 3, "ledger size after {writes_allowed} writes");
            for state_machine in inner.find("stateMachines", &Filter::new()).await.unwrap() {
                assert_eq!(state_machine.get("originVersion"), Some(&json!(1)));
            }
        }
    }

    #[tokio::test]
    async fn duplicate_definition_names_are_rejected() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let mut runner = MigrationRunner::new(store, IdGenerator::default(), RunnerOptions::default());
        runner.register_all(default_migrations()).unwrap();
        let err = runner.register_all(default_migrations()).unwrap_err();
        assert!(matches!(err, MigrationError::DuplicateDefinition(name) if name == WORKFLOW_DEFAULT_VERSION));
    }

    #[tokio::test]
    async fn sql_backed_runs_are_idempotent() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db_migration::Migrator::up(&db, None).await.unwrap();
        let store = Arc::new(SqlDocumentStore::new(db));
        populate(store.as_ref()).await;

        let first = runner(store.clone()).run_pending_migrations().await.unwrap();
        assert_eq!(first.applied.len(), 3);
        let after_first = snapshot(store.as_ref()).await;

        let second = runner(store.clone()).run_pending_migrations().await.unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(snapshot(store.as_ref()).await, after_first);
        assert_ledger_unique(store.as_ref()).await;
    }
}

//! Testing utilities for the Proctor workspace
//!
//! Tempdir-backed environment stores, sample definitions and a static
//! client specification source.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::RwLock;
use proctor_model::{Allocation, ChangeMetadata, Environment, Range, TestBucket, TestDefinition, TestType};
use proctor_promote::{
    AppVersion, BackgroundJob, ClientSpecification, JobManager, JobStatus, MatrixChecker, PromoteConfig,
    PromotionEngine, SpecificationSource, StructuralVerifier, TestSpecification,
};
use proctor_store::scm::local::LocalRepository;
use proctor_store::{
    CachedPersisterCore, EnvironmentStores, FileBasedProctorStore, ProctorStore, ScmPersisterCore, StoreConfig,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const USERNAME: &str = "alice";
pub const PASSWORD: &str = "secret";

pub fn meta(comment: &str) -> ChangeMetadata {
    ChangeMetadata::new(USERNAME, PASSWORD, comment)
}

/// Two-bucket test splitting `control` to bucket 0 and the rest to bucket 1
pub fn definition(salt: &str, control: f64) -> TestDefinition {
    TestDefinition::new(TestType::USER, salt)
        .with_description(format!("{salt} experiment"))
        .with_bucket(TestBucket::new("control", 0))
        .with_bucket(TestBucket::new("test", 1))
        .with_allocation(Allocation::new(vec![Range::new(0, control), Range::new(1, 1.0 - control)]))
}

/// Test sending everyone to the inactive bucket
pub fn inactive_definition(salt: &str) -> TestDefinition {
    TestDefinition::new(TestType::USER, salt)
        .with_description(format!("{salt} experiment"))
        .with_bucket(TestBucket::new("inactive", -1))
        .with_bucket(TestBucket::new("control", 0))
        .with_bucket(TestBucket::new("test", 1))
        .with_allocation(Allocation::new(vec![
            Range::new(-1, 1.0),
            Range::new(0, 0.0),
            Range::new(1, 0.0),
        ]))
}

/// One file-backed store plus the directories it lives in
pub struct StoreFixture {
    _dirs: (TempDir, TempDir),
    pub store: Arc<dyn ProctorStore>,
}

pub fn file_store(name: &str) -> StoreFixture {
    let repo_dir = TempDir::new().unwrap();
    let work_dir = TempDir::new().unwrap();
    let repo = LocalRepository::init(repo_dir.path()).unwrap();
    repo.add_user(USERNAME, PASSWORD).unwrap();
    repo.mkdir("test-definitions", USERNAME, "Create layout").unwrap();
    let config = StoreConfig::new(work_dir.path());
    let core = ScmPersisterCore::open(Arc::new(repo), &config).unwrap();
    let cached = CachedPersisterCore::new(Arc::new(core), &config.cache);
    StoreFixture {
        _dirs: (repo_dir, work_dir),
        store: Arc::new(FileBasedProctorStore::new(Arc::new(cached), name)),
    }
}

/// Trunk, QA and production stores, each in its own repository
pub struct EnvironmentFixture {
    _stores: Vec<StoreFixture>,
    pub stores: EnvironmentStores,
}

pub fn environment_stores() -> EnvironmentFixture {
    let working = file_store("trunk");
    let qa = file_store("qa");
    let production = file_store("production");
    let stores = EnvironmentStores::new(
        Arc::clone(&working.store),
        Arc::clone(&qa.store),
        Arc::clone(&production.store),
    );
    EnvironmentFixture {
        _stores: vec![working, qa, production],
        stores,
    }
}

/// Client specifications set up by hand per environment
#[derive(Debug, Default)]
pub struct StaticSpecificationSource {
    specifications: RwLock<BTreeMap<Environment, BTreeMap<AppVersion, ClientSpecification>>>,
}

impl StaticSpecificationSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `app@version` in `environment` require `test_name` with `buckets`
    pub fn require(
        &self,
        environment: Environment,
        app: &str,
        version: &str,
        test_name: &str,
        buckets: &[(&str, i32)],
    ) {
        let specification = TestSpecification {
            buckets: buckets.iter().map(|(name, value)| ((*name).to_string(), *value)).collect(),
            ..TestSpecification::default()
        };
        self.specifications
            .write()
            .entry(environment)
            .or_default()
            .entry(AppVersion::new(app, version))
            .or_default()
            .tests
            .insert(test_name.to_string(), specification);
    }

    pub fn clear(&self, environment: Environment) {
        self.specifications.write().remove(&environment);
    }
}

#[async_trait]
impl SpecificationSource for StaticSpecificationSource {
    async fn load_all_successful(&self, environment: Environment) -> BTreeMap<AppVersion, ClientSpecification> {
        self.specifications
            .read()
            .get(&environment)
            .cloned()
            .unwrap_or_default()
    }
}

/// Engine over `stores` verifying against `source` with the structural verifier
pub fn engine(
    stores: &EnvironmentStores,
    source: Arc<StaticSpecificationSource>,
    config: &PromoteConfig,
) -> Arc<PromotionEngine> {
    let checker = MatrixChecker::new(source, Arc::new(StructuralVerifier));
    let jobs = Arc::new(JobManager::new(config));
    Arc::new(PromotionEngine::new(stores.clone(), checker, jobs, config))
}

/// Poll until `job` stops running
pub async fn wait_for(job: &BackgroundJob) -> JobStatus {
    tokio::time::timeout(Duration::from_secs(30), async {
        while job.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    job.status()
}

/// Newest trunk revision of `test_name`
pub async fn head(store: &Arc<dyn ProctorStore>, test_name: &str) -> Option<String> {
    store
        .history(test_name, 0, 1)
        .await
        .unwrap()
        .into_iter()
        .next()
        .map(|r| r.revision)
}

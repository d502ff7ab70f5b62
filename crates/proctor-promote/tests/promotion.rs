//! End-to-end flows over tempdir-backed trunk, QA and production stores

use pretty_assertions::assert_eq;
use proctor_model::{Environment, Range, TestDefinition, UNKNOWN_REVISION};
use proctor_promote::{
    AutoPromotePolicy, DefinitionInput, DeleteRequest, EditRequest, JobStatus, JobType, PromoteConfig,
    PromoteRequest, PromotionEngine,
};
use proctor_test_utils::{
    definition, engine, environment_stores, head, inactive_definition, wait_for, EnvironmentFixture,
    StaticSpecificationSource, PASSWORD, USERNAME,
};
use std::sync::Arc;

const TEST: &str = "button_color_tst";

struct Harness {
    env: EnvironmentFixture,
    source: Arc<StaticSpecificationSource>,
    engine: Arc<PromotionEngine>,
}

fn harness() -> Harness {
    harness_with(&PromoteConfig::default())
}

fn harness_with(config: &PromoteConfig) -> Harness {
    let env = environment_stores();
    let source = Arc::new(StaticSpecificationSource::new());
    let engine = engine(&env.stores, Arc::clone(&source), config);
    Harness { env, source, engine }
}

impl Harness {
    async fn head(&self, environment: Environment) -> Option<String> {
        head(self.env.stores.get(environment), TEST).await
    }

    async fn current(&self, environment: Environment) -> Option<TestDefinition> {
        self.env
            .stores
            .get(environment)
            .current_test_definition(TEST)
            .await
            .unwrap()
    }

    async fn create(&self, definition: TestDefinition) -> String {
        let job = self.engine.create(EditRequest::new(TEST, USERNAME, PASSWORD, definition));
        assert_eq!(wait_for(&job).await, JobStatus::Done, "{}", job.log_text());
        self.head(Environment::Working).await.unwrap()
    }

    async fn promote(
        &self,
        source: Environment,
        destination: Environment,
    ) -> Arc<proctor_promote::BackgroundJob> {
        let source_revision = self.head(source).await.unwrap();
        let destination_revision = self
            .head(destination)
            .await
            .unwrap_or_else(|| UNKNOWN_REVISION.to_string());
        let job = self.engine.promote(PromoteRequest::new(
            TEST,
            USERNAME,
            PASSWORD,
            source,
            source_revision,
            destination,
            destination_revision,
        ));
        wait_for(&job).await;
        job
    }

    /// Created on trunk and promoted through QA to production
    async fn everywhere(&self, definition: TestDefinition) -> String {
        let revision = self.create(definition).await;
        for (source, destination) in [
            (Environment::Working, Environment::Qa),
            (Environment::Qa, Environment::Production),
        ] {
            let job = self.promote(source, destination).await;
            assert_eq!(job.status(), JobStatus::Done, "{}", job.log_text());
        }
        revision
    }

    /// Current trunk definition with a new control share
    async fn reallocated(&self, control: f64) -> TestDefinition {
        let mut updated = self.current(Environment::Working).await.unwrap();
        updated.allocations[0].ranges = vec![Range::new(0, control), Range::new(1, 1.0 - control)];
        updated
    }
}

#[tokio::test]
async fn create_assigns_ids_and_links_result() {
    let h = harness();
    let job = h.engine.create(
        EditRequest::new(TEST, USERNAME, PASSWORD, definition("color", 0.5)).with_author("bob"),
    );
    assert_eq!(wait_for(&job).await, JobStatus::Done, "{}", job.log_text());
    assert_eq!(job.job_type(), JobType::TestCreation);
    assert_eq!(job.title(), format!("(username:alice author:bob) Creating {TEST}"));

    let stored = h.current(Environment::Working).await.unwrap();
    assert_eq!(stored.version, "-1");
    assert_eq!(stored.allocations[0].id, "#A1");

    let urls = job.urls();
    assert_eq!(urls[0].href, format!("/proctor/definition/{TEST}?branch=trunk"));
    assert_eq!(urls[0].text, "View Result");
    assert!(job.log_text().contains("Not auto-promote because it wasn't requested by user."));
    assert!(job.log_text().ends_with("COMPLETE\n"));

    let history = h.env.stores.get(Environment::Working).history(TEST, 0, 1).await.unwrap();
    assert_eq!(history[0].message, format!("Creating A/B test {TEST}"));
    assert_eq!(history[0].author, USERNAME);
}

#[tokio::test]
async fn create_from_json_normalizes_and_validates() {
    let h = harness();
    let json = serde_json::to_string(&definition("color", 0.5)).unwrap();
    let job = h.engine.create(EditRequest::new(TEST, USERNAME, PASSWORD, DefinitionInput::Json(json)));
    assert_eq!(wait_for(&job).await, JobStatus::Done, "{}", job.log_text());
    assert!(job.log_text().starts_with("Parsing test definition json\n"));

    let empty = h.engine.create(EditRequest::new(
        "other_tst",
        USERNAME,
        PASSWORD,
        DefinitionInput::Json("  ".into()),
    ));
    assert_eq!(wait_for(&empty).await, JobStatus::Failed);
    assert_eq!(empty.error().as_deref(), Some("No new test definition given"));
}

#[tokio::test]
async fn create_rejects_bad_names_and_duplicates() {
    let h = harness();
    let job = h.engine.create(EditRequest::new("9lives", USERNAME, PASSWORD, definition("s", 0.5)));
    assert_eq!(wait_for(&job).await, JobStatus::Failed);
    assert_eq!(
        job.error().as_deref(),
        Some("Test Name must be alpha-numeric underscore and not start/end with a number, found: '9lives'")
    );

    h.create(definition("color", 0.5)).await;
    let duplicate = h.engine.create(EditRequest::new(TEST, USERNAME, PASSWORD, definition("color", 0.4)));
    assert_eq!(wait_for(&duplicate).await, JobStatus::Failed);
    assert_eq!(
        duplicate.error().as_deref(),
        Some(format!("Current tests exists with name : '{TEST}'").as_str())
    );
}

#[tokio::test]
async fn missing_credentials_fail_before_any_write() {
    let h = harness();
    let job = h.engine.create(EditRequest::new(TEST, USERNAME, "", definition("color", 0.5)));
    assert_eq!(wait_for(&job).await, JobStatus::Failed);
    assert_eq!(job.error().as_deref(), Some("No username or password provided"));
    assert!(!job.log_text().contains("(scm)"), "{}", job.log_text());
    assert!(h.head(Environment::Working).await.is_none());
}

#[tokio::test]
async fn stale_edit_is_a_conflict_without_writes() {
    let h = harness();
    let created = h.create(definition("color", 0.5)).await;
    let first = h.engine.edit(
        EditRequest::new(TEST, USERNAME, PASSWORD, h.reallocated(0.4).await).with_previous_revision(&created),
    );
    assert_eq!(wait_for(&first).await, JobStatus::Done, "{}", first.log_text());
    let latest = h.head(Environment::Working).await.unwrap();

    let stale = h.engine.edit(
        EditRequest::new(TEST, USERNAME, PASSWORD, h.reallocated(0.3).await).with_previous_revision(&created),
    );
    assert_eq!(wait_for(&stale).await, JobStatus::Failed);
    assert_eq!(
        stale.error(),
        Some(format!("Test has been updated since {created} currently at {latest}"))
    );
    assert_eq!(h.head(Environment::Working).await, Some(latest));
}

#[tokio::test]
async fn edit_keeps_version_and_bumps_reallocated_ids() {
    let h = harness();
    let created = h.create(definition("color", 0.5)).await;
    let mut updated = h.reallocated(0.2).await;
    updated.test_type = None;

    let job = h.engine.edit(
        EditRequest::new(TEST, USERNAME, PASSWORD, updated)
            .with_previous_revision(&created)
            .with_comment("shift traffic"),
    );
    assert_eq!(wait_for(&job).await, JobStatus::Done, "{}", job.log_text());
    assert!(job.log_text().contains("WARNING: Positive bucket total allocation size"));

    let stored = h.current(Environment::Working).await.unwrap();
    assert_eq!(stored.version, "-1");
    assert_eq!(stored.test_type, Some(proctor_model::TestType::USER));
    assert_eq!(stored.allocations[0].id, "#A2");
}

#[tokio::test]
async fn promotion_walks_trunk_qa_production() {
    let h = harness();
    let created = h.create(definition("color", 0.5)).await;

    let to_qa = h.promote(Environment::Working, Environment::Qa).await;
    assert_eq!(to_qa.status(), JobStatus::Done, "{}", to_qa.log_text());
    assert_eq!(to_qa.job_type(), JobType::TestPromotion);
    let qa = h.current(Environment::Qa).await.unwrap();
    assert_eq!(qa.version, created);
    assert!(to_qa.log_text().contains(&format!("(scm) promote {TEST} {created} (trunk to qa)")));
    assert_eq!(to_qa.urls()[0].text, format!("view {TEST} on qa"));

    let qa_history = h.env.stores.get(Environment::Qa).history(TEST, 0, 1).await.unwrap();
    assert_eq!(
        qa_history[0].message,
        format!("Promoting {TEST} (trunk r{created}) to qa\n\nCreating A/B test {TEST}")
    );

    let to_production = h.promote(Environment::Qa, Environment::Production).await;
    assert_eq!(to_production.status(), JobStatus::Done, "{}", to_production.log_text());
    assert_eq!(h.current(Environment::Production).await.unwrap().version, created);

    let versions = h.engine.promoter().get_environment_version(TEST).await.unwrap();
    assert_eq!(versions.revision(Environment::Working), created);
    assert_eq!(versions.version(Environment::Qa), created);
    assert_eq!(versions.version(Environment::Production), created);
}

#[tokio::test]
async fn environment_version_of_unknown_test() {
    let h = harness();
    let versions = h.engine.promoter().get_environment_version("absent_tst").await.unwrap();
    assert!(versions.trunk.is_none());
    assert_eq!(versions.revision(Environment::Qa), UNKNOWN_REVISION);
    assert_eq!(versions.version(Environment::Production), "-1");
}

#[tokio::test]
async fn illegal_edges_are_rejected_without_writes() {
    let h = harness();
    h.everywhere(definition("color", 0.5)).await;
    let trunk_head = h.head(Environment::Working).await;

    let backwards = h.promote(Environment::Production, Environment::Working).await;
    assert_eq!(backwards.status(), JobStatus::Failed);
    assert_eq!(
        backwards.error().as_deref(),
        Some("Invalid combination of source and destination: source=production dest=trunk")
    );
    assert!(!backwards.log_text().contains("Validating Matrix."));
    assert_eq!(h.head(Environment::Working).await, trunk_head);
}

#[tokio::test]
async fn stale_destination_revision_is_a_conflict() {
    let h = harness();
    let created = h.everywhere(definition("color", 0.5)).await;
    let edit = h.engine.edit(
        EditRequest::new(TEST, USERNAME, PASSWORD, h.reallocated(0.4).await).with_previous_revision(&created),
    );
    assert_eq!(wait_for(&edit).await, JobStatus::Done);

    let job = h.engine.promote(PromoteRequest::new(
        TEST,
        USERNAME,
        PASSWORD,
        Environment::Working,
        h.head(Environment::Working).await.unwrap(),
        Environment::Qa,
        "1",
    ));
    assert_eq!(wait_for(&job).await, JobStatus::Failed);
    let qa_head = h.head(Environment::Qa).await.unwrap();
    assert_eq!(
        job.error(),
        Some(format!("Test '{TEST}' updated since 1. Currently at {qa_head}"))
    );
}

#[tokio::test]
async fn incompatible_promotion_fails_with_client_errors() {
    let h = harness();
    h.create(definition("color", 0.5)).await;
    h.source.require(Environment::Qa, "web", "1.0", TEST, &[("variant", 2)]);

    let job = h.promote(Environment::Working, Environment::Qa).await;
    assert_eq!(job.status(), JobStatus::Failed);
    let error = job.error().unwrap();
    assert!(error.starts_with("Test Promotion not compatible, errors: "), "{error}");
    assert!(error.contains("web@1.0"), "{error}");
    assert!(h.head(Environment::Qa).await.is_none());
}

#[tokio::test]
async fn allocation_only_edit_auto_promotes_everywhere() {
    let h = harness();
    let created = h.everywhere(definition("color", 0.5)).await;

    let job = h.engine.edit(
        EditRequest::new(TEST, USERNAME, PASSWORD, h.reallocated(0.4).await)
            .with_previous_revision(&created)
            .with_auto_promote(Environment::Production),
    );
    assert_eq!(wait_for(&job).await, JobStatus::Done, "{}", job.log_text());
    assert_eq!(job.job_type(), JobType::TestEditPromotion);
    assert!(job.log_text().contains("auto-promote changes to qa"));
    assert!(job.log_text().contains("auto-promote changes to production"));

    let edited = h.head(Environment::Working).await.unwrap();
    for environment in [Environment::Qa, Environment::Production] {
        let promoted = h.current(environment).await.unwrap();
        assert_eq!(promoted.version, edited);
        assert_eq!(promoted.allocations[0].ranges[0].length, 0.4);
    }
}

#[tokio::test]
async fn structural_edit_is_not_auto_promoted() {
    let h = harness();
    let created = h.everywhere(definition("color", 0.5)).await;
    let qa_before = h.head(Environment::Qa).await;

    let mut updated = h.current(Environment::Working).await.unwrap();
    updated.salt = "new_salt".into();
    let job = h.engine.edit(
        EditRequest::new(TEST, USERNAME, PASSWORD, updated)
            .with_previous_revision(&created)
            .with_auto_promote(Environment::Production),
    );
    assert_eq!(wait_for(&job).await, JobStatus::Done, "{}", job.log_text());
    assert!(job
        .log_text()
        .contains("auto-promote is prevented because it isn't an allocation-only change."));
    assert_eq!(job.end_message(), "");
    assert_eq!(h.head(Environment::Qa).await, qa_before);
}

#[tokio::test]
async fn inactive_new_test_auto_promotes_to_production() {
    let h = harness();
    let job = h.engine.create(
        EditRequest::new(TEST, USERNAME, PASSWORD, inactive_definition("color"))
            .with_auto_promote(Environment::Production),
    );
    assert_eq!(wait_for(&job).await, JobStatus::Done, "{}", job.log_text());
    assert_eq!(job.job_type(), JobType::TestCreationPromotion);

    let created = h.head(Environment::Working).await.unwrap();
    assert_eq!(h.current(Environment::Qa).await.unwrap().version, created);
    assert_eq!(h.current(Environment::Production).await.unwrap().version, created);
}

#[tokio::test]
async fn active_new_test_is_only_created() {
    let h = harness();
    let job = h.engine.create(
        EditRequest::new(TEST, USERNAME, PASSWORD, definition("color", 0.5))
            .with_auto_promote(Environment::Production),
    );
    assert_eq!(wait_for(&job).await, JobStatus::Done, "{}", job.log_text());
    assert!(job.log_text().contains("the test is not 100% inactive"));
    assert!(h.head(Environment::Working).await.is_some());
    assert!(h.head(Environment::Qa).await.is_none());
}

#[tokio::test]
async fn auto_promote_to_qa_leaves_production_alone() {
    let h = harness();
    let job = h.engine.create(
        EditRequest::new(TEST, USERNAME, PASSWORD, definition("color", 0.5)).with_auto_promote(Environment::Qa),
    );
    assert_eq!(wait_for(&job).await, JobStatus::Done, "{}", job.log_text());
    assert_eq!(job.title(), format!("(username:alice author:alice) Creating and promoting to QA {TEST}"));
    assert!(h.current(Environment::Qa).await.is_some());
    assert!(h.head(Environment::Production).await.is_none());
}

#[tokio::test]
async fn strict_policy_checks_every_hop_first() {
    let h = harness_with(&PromoteConfig::default().with_auto_promote(AutoPromotePolicy::strict()));
    let created = h.everywhere(definition("color", 0.5)).await;
    let qa_before = h.head(Environment::Qa).await;
    h.source
        .require(Environment::Production, "web", "2.0", TEST, &[("variant", 2)]);

    let job = h.engine.edit(
        EditRequest::new(TEST, USERNAME, PASSWORD, h.reallocated(0.4).await)
            .with_previous_revision(&created)
            .with_auto_promote(Environment::Production),
    );
    assert_eq!(wait_for(&job).await, JobStatus::Done, "{}", job.log_text());
    assert!(job
        .log_text()
        .contains("auto-promote is prevented because production clients are incompatible"));
    assert_eq!(h.head(Environment::Qa).await, qa_before);
}

#[tokio::test]
async fn delete_blocked_while_production_clients_use_test() {
    let h = harness();
    h.everywhere(definition("color", 0.5)).await;
    h.source.require(Environment::Production, "web", "1.0", TEST, &[("control", 0)]);
    let trunk_head = h.head(Environment::Working).await.unwrap();

    let job = h.engine.delete(DeleteRequest::new(
        TEST,
        USERNAME,
        PASSWORD,
        Environment::Working,
        &trunk_head,
    ));
    assert_eq!(wait_for(&job).await, JobStatus::Failed);
    assert_eq!(job.job_type(), JobType::TestDeletion);
    let error = job.error().unwrap();
    assert!(error.starts_with(&format!("There are still clients in prod using {TEST} ")), "{error}");
    assert!(error.contains("web@1.0"), "{error}");
    assert_eq!(h.head(Environment::Working).await, Some(trunk_head));
    assert!(h.current(Environment::Working).await.is_some());
}

#[tokio::test]
async fn delete_links_remaining_environments() {
    let h = harness();
    h.everywhere(definition("color", 0.5)).await;
    let trunk_head = h.head(Environment::Working).await.unwrap();

    let job = h.engine.delete(
        DeleteRequest::new(TEST, USERNAME, PASSWORD, Environment::Working, trunk_head).with_comment("retire"),
    );
    assert_eq!(wait_for(&job).await, JobStatus::Done, "{}", job.log_text());
    assert!(h.current(Environment::Working).await.is_none());

    let texts: Vec<_> = job.urls().into_iter().map(|u| u.text).collect();
    assert_eq!(texts, vec![format!("view {TEST} on qa"), format!("view {TEST} on production")]);
    assert_eq!(job.end_message(), "");
}

#[tokio::test]
async fn delete_of_last_copy_says_so() {
    let h = harness();
    let created = h.create(definition("color", 0.5)).await;

    let job = h.engine.delete(DeleteRequest::new(TEST, USERNAME, PASSWORD, Environment::Working, created));
    assert_eq!(wait_for(&job).await, JobStatus::Done, "{}", job.log_text());
    assert_eq!(job.end_message(), "This test no longer exists in any environment.");

    let history = h.env.stores.get(Environment::Working).history(TEST, 0, 1).await.unwrap();
    assert_eq!(history[0].message, format!("Deleting A/B test {TEST}"));
}

#[tokio::test]
async fn delete_of_unknown_test_is_a_no_op() {
    let h = harness();
    let job = h.engine.delete(DeleteRequest::new("ghost_tst", USERNAME, PASSWORD, Environment::Qa, "5"));
    assert_eq!(wait_for(&job).await, JobStatus::Done);
    assert!(job.log_text().contains("Unknown test definition : ghost_tst"));
}

#[tokio::test]
async fn deleted_destination_refuses_promotion() {
    let h = harness();
    h.everywhere(definition("color", 0.5)).await;
    let qa_head = h.head(Environment::Qa).await.unwrap();
    let delete = h.engine.delete(DeleteRequest::new(TEST, USERNAME, PASSWORD, Environment::Qa, qa_head));
    assert_eq!(wait_for(&delete).await, JobStatus::Done, "{}", delete.log_text());

    let job = h.promote(Environment::Working, Environment::Qa).await;
    assert_eq!(job.status(), JobStatus::Failed);
    assert_eq!(
        job.error(),
        Some(format!(
            "Test '{TEST}' has been deleted in destination, not allowed to promote again."
        ))
    );
    assert!(h.current(Environment::Qa).await.is_none());
}

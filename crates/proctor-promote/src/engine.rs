//! Create, edit, delete and promote flows run as background jobs
//!
//! Every flow validates before touching the SCM, so a rejected request
//! leaves all three stores untouched. Writes happen in a fixed order:
//! before hooks, the SCM write, after hooks, then any automatic promotion.

use crate::checker::MatrixChecker;
use crate::config::{AutoPromotePolicy, PromoteConfig};
use crate::error::{cause_chain, PromoteError, PromoteResult};
use crate::hooks::{ChangeEvent, ChangeHooks, CommentFormatter, PlainCommentFormatter, RequestParameters};
use crate::jobs::{BackgroundJob, JobManager, JobType};
use crate::promoter::Promoter;
use futures::FutureExt;
use proctor_model::{
    allocation_id, analysis, ChangeMetadata, Environment, Revision, TestDefinition, UNKNOWN_REVISION,
    UNKNOWN_VERSION,
};
use proctor_store::persister::ADD_TEST_REVISION;
use proctor_store::{EnvironmentStores, TestMetadata};
use std::sync::Arc;

/// End message of an edit whose automatic promotion failed
pub const AUTO_PROMOTE_FAILED: &str =
    "Test Creation/Edit succeeded. However, the test was not promoted automatically to QA/Production.";

/// New definition as submitted
#[derive(Debug, Clone)]
pub enum DefinitionInput {
    /// Already parsed
    Parsed(TestDefinition),
    /// JSON document, parsed inside the job
    Json(String),
}

impl From<TestDefinition> for DefinitionInput {
    fn from(definition: TestDefinition) -> Self {
        Self::Parsed(definition)
    }
}

/// Create or edit request
#[derive(Debug, Clone)]
pub struct EditRequest {
    /// Test name
    pub test_name: String,
    /// SCM username
    pub username: String,
    /// SCM password
    pub password: String,
    /// Person the change is attributed to
    pub author: String,
    /// New definition
    pub definition: DefinitionInput,
    /// Trunk revision the edit is based on, empty for a new test
    pub previous_revision: String,
    /// Commit comment, defaulted when empty
    pub comment: String,
    /// Environment to promote to after the write
    pub auto_promote_target: Environment,
    /// Passed through to hooks and the comment formatter
    pub parameters: RequestParameters,
}

impl EditRequest {
    /// Request with no previous revision, comment or auto-promotion
    #[must_use]
    pub fn new(
        test_name: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        definition: impl Into<DefinitionInput>,
    ) -> Self {
        let username = username.into();
        Self {
            test_name: test_name.into(),
            author: username.clone(),
            username,
            password: password.into(),
            definition: definition.into(),
            previous_revision: String::new(),
            comment: String::new(),
            auto_promote_target: Environment::Working,
            parameters: RequestParameters::new(),
        }
    }

    /// With a distinct author
    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Based on trunk revision `revision`
    #[must_use]
    pub fn with_previous_revision(mut self, revision: impl Into<String>) -> Self {
        self.previous_revision = revision.into();
        self
    }

    /// With a commit comment
    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// Promote to `target` after the write
    #[must_use]
    pub fn with_auto_promote(mut self, target: Environment) -> Self {
        self.auto_promote_target = target;
        self
    }

    /// With request parameters
    #[must_use]
    pub fn with_parameters(mut self, parameters: RequestParameters) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Promotion request
#[derive(Debug, Clone)]
pub struct PromoteRequest {
    /// Test name
    pub test_name: String,
    /// SCM username
    pub username: String,
    /// SCM password
    pub password: String,
    /// Person the change is attributed to
    pub author: String,
    /// Environment promoted from
    pub source: Environment,
    /// Revision in `source`
    pub source_revision: String,
    /// Environment promoted to
    pub destination: Environment,
    /// Current revision in `destination`, [`UNKNOWN_REVISION`] if absent
    pub destination_revision: String,
    /// Passed through to hooks
    pub parameters: RequestParameters,
}

impl PromoteRequest {
    /// Promote `test_name` from `source` to `destination`
    #[must_use]
    pub fn new(
        test_name: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        source: Environment,
        source_revision: impl Into<String>,
        destination: Environment,
        destination_revision: impl Into<String>,
    ) -> Self {
        let username = username.into();
        Self {
            test_name: test_name.into(),
            author: username.clone(),
            username,
            password: password.into(),
            source,
            source_revision: source_revision.into(),
            destination,
            destination_revision: destination_revision.into(),
            parameters: RequestParameters::new(),
        }
    }

    /// With a distinct author
    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// With request parameters
    #[must_use]
    pub fn with_parameters(mut self, parameters: RequestParameters) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Deletion request
#[derive(Debug, Clone)]
pub struct DeleteRequest {
    /// Test name
    pub test_name: String,
    /// SCM username
    pub username: String,
    /// SCM password
    pub password: String,
    /// Person the change is attributed to
    pub author: String,
    /// Environment to delete from
    pub source: Environment,
    /// Current revision of the test in `source`
    pub source_revision: String,
    /// Commit comment, defaulted when empty
    pub comment: String,
    /// Passed through to hooks and the comment formatter
    pub parameters: RequestParameters,
}

impl DeleteRequest {
    /// Delete `test_name` from `source`
    #[must_use]
    pub fn new(
        test_name: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        source: Environment,
        source_revision: impl Into<String>,
    ) -> Self {
        let username = username.into();
        Self {
            test_name: test_name.into(),
            author: username.clone(),
            username,
            password: password.into(),
            source,
            source_revision: source_revision.into(),
            comment: String::new(),
            parameters: RequestParameters::new(),
        }
    }

    /// With a distinct author
    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// With a commit comment
    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    /// With request parameters
    #[must_use]
    pub fn with_parameters(mut self, parameters: RequestParameters) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Who is acting, shared by every step of one job
struct Actor<'a> {
    username: &'a str,
    password: &'a str,
    author: &'a str,
    parameters: &'a RequestParameters,
}

impl Actor<'_> {
    fn validate(&self) -> PromoteResult<()> {
        if self.username.trim().is_empty() || self.password.trim().is_empty() {
            return Err(PromoteError::validation("No username or password provided"));
        }
        Ok(())
    }

    fn change(&self, comment: impl Into<String>) -> ChangeMetadata {
        ChangeMetadata::new(self.username, self.password, comment).with_author(self.author)
    }
}

/// Orchestrates every definition change
pub struct PromotionEngine {
    stores: EnvironmentStores,
    promoter: Promoter,
    checker: MatrixChecker,
    jobs: Arc<JobManager>,
    hooks: ChangeHooks,
    comment_formatter: Arc<dyn CommentFormatter>,
    policy: AutoPromotePolicy,
}

impl std::fmt::Debug for PromotionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromotionEngine")
            .field("hooks", &self.hooks)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl PromotionEngine {
    /// Create engine; hooks start empty and comments are used as is
    #[must_use]
    pub fn new(
        stores: EnvironmentStores,
        checker: MatrixChecker,
        jobs: Arc<JobManager>,
        config: &PromoteConfig,
    ) -> Self {
        Self {
            promoter: Promoter::new(stores.clone(), config),
            stores,
            checker,
            jobs,
            hooks: ChangeHooks::default(),
            comment_formatter: Arc::new(PlainCommentFormatter),
            policy: config.auto_promote,
        }
    }

    /// With change hooks
    #[must_use]
    pub fn with_hooks(mut self, hooks: ChangeHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// With a commit comment formatter
    #[must_use]
    pub fn with_comment_formatter(mut self, formatter: Arc<dyn CommentFormatter>) -> Self {
        self.comment_formatter = formatter;
        self
    }

    /// The job manager
    #[inline]
    #[must_use]
    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    /// The environment stores
    #[inline]
    #[must_use]
    pub fn stores(&self) -> &EnvironmentStores {
        &self.stores
    }

    /// The promoter
    #[inline]
    #[must_use]
    pub fn promoter(&self) -> &Promoter {
        &self.promoter
    }

    /// Submit a job creating a new test
    pub fn create(self: &Arc<Self>, request: EditRequest) -> Arc<BackgroundJob> {
        self.submit_edit(true, request)
    }

    /// Submit a job editing an existing test
    pub fn edit(self: &Arc<Self>, request: EditRequest) -> Arc<BackgroundJob> {
        self.submit_edit(false, request)
    }

    fn submit_edit(self: &Arc<Self>, is_create: bool, request: EditRequest) -> Arc<BackgroundJob> {
        let job = Arc::new(BackgroundJob::new(
            edit_job_title(&request, is_create),
            &request.username,
            edit_job_type(is_create, request.auto_promote_target),
        ));
        let engine = Arc::clone(self);
        self.jobs.submit(
            Arc::clone(&job),
            Box::new(move |job| async move { engine.run_edit(is_create, request, &job).await }.boxed()),
        );
        job
    }

    /// Submit a job promoting a test between environments
    pub fn promote(self: &Arc<Self>, request: PromoteRequest) -> Arc<BackgroundJob> {
        let title = format!(
            "(username:{} author:{}) promoting {} {} {:.7} to {}",
            request.username,
            request.author,
            request.test_name,
            request.source,
            request.source_revision,
            request.destination
        );
        let job = Arc::new(BackgroundJob::new(title, &request.username, JobType::TestPromotion));
        let engine = Arc::clone(self);
        self.jobs.submit(
            Arc::clone(&job),
            Box::new(move |job| {
                async move {
                    let actor = Actor {
                        username: &request.username,
                        password: &request.password,
                        author: &request.author,
                        parameters: &request.parameters,
                    };
                    engine
                        .promote_internal(
                            &request.test_name,
                            &actor,
                            request.source,
                            &request.source_revision,
                            request.destination,
                            &request.destination_revision,
                            &job,
                            false,
                        )
                        .await
                }
                .boxed()
            }),
        );
        job
    }

    /// Submit a job deleting a test from one environment
    pub fn delete(self: &Arc<Self>, request: DeleteRequest) -> Arc<BackgroundJob> {
        let title = format!(
            "(username:{} author:{}) deleting {} branch: {} ",
            request.username, request.author, request.test_name, request.source
        );
        let job = Arc::new(BackgroundJob::new(title, &request.username, JobType::TestDeletion));
        let engine = Arc::clone(self);
        self.jobs.submit(
            Arc::clone(&job),
            Box::new(move |job| async move { engine.run_delete(request, &job).await }.boxed()),
        );
        job
    }

    /// Submit a job removing `username`'s working directories
    pub fn clean_workspaces(self: &Arc<Self>, username: &str) -> Arc<BackgroundJob> {
        let job = Arc::new(BackgroundJob::new(
            format!("cleaning workspaces for {username}"),
            username,
            JobType::WorkingDirectoryCleaning,
        ));
        let engine = Arc::clone(self);
        let username = username.to_string();
        self.jobs.submit(
            Arc::clone(&job),
            Box::new(move |job| {
                async move {
                    job.log(format!("Cleaning workspaces for {username}"));
                    if engine.stores.clean_user_workspaces(&username) {
                        job.log_complete();
                    } else {
                        job.set_end_message(format!("Some workspaces of {username} could not be removed"));
                    }
                    Ok(())
                }
                .boxed()
            }),
        );
        job
    }

    /// Stop the job manager and release the stores
    pub fn close(&self) {
        self.jobs.close();
        self.stores.close();
    }

    async fn run_edit(&self, is_create: bool, request: EditRequest, job: &BackgroundJob) -> PromoteResult<()> {
        let EditRequest {
            test_name,
            username,
            password,
            author,
            definition,
            previous_revision,
            comment,
            auto_promote_target,
            parameters,
        } = request;
        let actor = Actor {
            username: &username,
            password: &password,
            author: &author,
            parameters: &parameters,
        };
        let mut definition = match definition {
            DefinitionInput::Parsed(definition) => definition,
            DefinitionInput::Json(json) => {
                if json.trim().is_empty() {
                    return Err(PromoteError::validation("No new test definition given"));
                }
                job.log_with_timing("Parsing test definition json", "parsing");
                parse_definition(&json)?
            }
        };

        let comment = if !comment.is_empty() {
            comment
        } else if is_create {
            format!("Creating A/B test {test_name}")
        } else {
            format!("Updating A/B test {test_name}")
        };
        actor.validate()?;
        if comment.trim().is_empty() {
            return Err(PromoteError::validation("Comment is required."));
        }

        let trunk = self.stores.get(Environment::Working);
        if previous_revision.is_empty() {
            if !analysis::is_valid_test_name(&test_name) {
                return Err(PromoteError::validation(format!(
                    "Test Name must be alpha-numeric underscore and not start/end with a number, found: '{test_name}'"
                )));
            }
        } else {
            job.log_with_timing(format!("(scm) getting history for '{test_name}'"), "getHistory");
            if let Some(latest) = trunk.history(&test_name, 0, 1).await?.first() {
                if latest.revision != previous_revision {
                    return Err(PromoteError::conflict(format!(
                        "Test has been updated since {previous_revision} currently at {}",
                        latest.revision
                    )));
                }
            }
        }

        job.log_with_timing(
            format!("(scm) getting environment versions for '{test_name}'"),
            "getEnvironmentVersion",
        );
        let environment_version = self.promoter.get_environment_version(&test_name).await;
        let qa_revision = environment_version
            .as_ref()
            .map_or(UNKNOWN_REVISION, |v| v.revision(Environment::Qa))
            .to_string();
        let production_revision = environment_version
            .as_ref()
            .map_or(UNKNOWN_REVISION, |v| v.revision(Environment::Production))
            .to_string();

        job.log_with_timing(
            format!("(scm) loading existing test definition for '{test_name}'"),
            "loadDefinition",
        );
        let existing = trunk
            .current_test_matrix()
            .await?
            .test_matrix_definition
            .find_ignore_case(&test_name)
            .cloned();
        if previous_revision.is_empty() && existing.is_some() {
            return Err(PromoteError::validation(format!(
                "Current tests exists with name : '{test_name}'"
            )));
        }

        if definition.test_type.is_none() {
            if let Some(existing) = &existing {
                definition.test_type = existing.test_type.clone();
            }
        }
        if is_create {
            definition.version = UNKNOWN_VERSION.to_string();
            allocation_id::assign_new_test_ids(&mut definition);
        } else if let Some(existing) = &existing {
            definition.version = existing.version.clone();
            allocation_id::bump_outdated(existing, &mut definition)?;
            if allocation_id::has_unassigned(&definition) {
                let max_used = self.max_used_allocation_id(&test_name).await?;
                allocation_id::assign_unassigned(&mut definition, max_used.as_deref())?;
            }
        }

        job.log_with_timing("verifying test definition and buckets", "Verify");
        for warning in analysis::validate_definition(&definition)? {
            job.log(warning);
        }
        analysis::verify_internally_consistent(&test_name, &definition)?;

        let event = match (&existing, is_create) {
            (Some(existing), false) => ChangeEvent::Edit {
                test_name: &test_name,
                existing,
                updated: &definition,
            },
            _ => ChangeEvent::Create {
                test_name: &test_name,
                definition: &definition,
            },
        };
        if is_create {
            job.log_with_timing("Executing pre create extension tasks.", "preCreateExtension");
        } else {
            job.log_with_timing("Executing pre edit extension tasks.", "preEditExtension");
        }
        self.hooks.run_before(&event, &parameters, job)?;

        let change = actor.change(self.comment_formatter.format_full_comment(&comment, &parameters));
        let metadata = TestMetadata::new();
        if existing.is_none() {
            job.log_with_timing("(scm) adding test definition", "scmAdd");
            trunk
                .add_test_definition(&change, ADD_TEST_REVISION, &test_name, &definition, &metadata)
                .await?;
        } else {
            job.log_with_timing("(scm) updating test definition", "scmUpdate");
            trunk
                .update_test_definition(&change, &previous_revision, &test_name, &definition, &metadata)
                .await?;
        }

        if is_create {
            job.log_with_timing("Executing post create extension tasks.", "postCreateExtension");
        } else {
            job.log_with_timing("Executing post edit extension tasks.", "postEditExtension");
        }
        self.hooks.run_after(&event, &parameters, job)?;

        let auto_promote = AutoPromoteContext {
            test_name: &test_name,
            actor: &actor,
            definition: &definition,
            existing: existing.as_ref(),
            previous_revision: &previous_revision,
            qa_revision: &qa_revision,
            production_revision: &production_revision,
        };
        if let Err(e) = self.maybe_auto_promote(&auto_promote, auto_promote_target, job).await {
            report_auto_promote_error(&test_name, e, job);
        }

        job.log_complete();
        job.add_url(definition_url(&test_name, Environment::Working), "View Result");
        Ok(())
    }

    async fn max_used_allocation_id(&self, test_name: &str) -> PromoteResult<Option<String>> {
        let trunk = self.stores.get(Environment::Working);
        let history = trunk.history(test_name, 0, usize::MAX).await?;
        let definitions = futures::future::try_join_all(
            history
                .iter()
                .map(|revision| trunk.test_definition(test_name, &revision.revision)),
        )
        .await?;
        Ok(allocation_id::max_allocation_id(definitions.iter().flatten())?)
    }

    async fn maybe_auto_promote(
        &self,
        ctx: &AutoPromoteContext<'_>,
        target: Environment,
        job: &BackgroundJob,
    ) -> PromoteResult<()> {
        match target {
            Environment::Working => {
                job.log("Not auto-promote because it wasn't requested by user.");
                Ok(())
            }
            Environment::Qa => {
                let current = self.current_revision(ctx.test_name).await?;
                self.reverify(ctx, &[Environment::Qa], job).await?;
                self.promote_to_environment(ctx, Environment::Qa, None, &current.revision, ctx.qa_revision, job)
                    .await
            }
            Environment::Production => match ctx.existing {
                None => self.auto_promote_new_test(ctx, job).await,
                Some(existing) => self.auto_promote_allocation_change(ctx, existing, job).await,
            },
        }
    }

    async fn auto_promote_new_test(&self, ctx: &AutoPromoteContext<'_>, job: &BackgroundJob) -> PromoteResult<()> {
        if !analysis::is_all_inactive_test(ctx.definition) {
            return Err(PromoteError::validation(
                "auto-promote is prevented because there is no existing test definition and the test is not 100% inactive.",
            ));
        }
        let current = self.current_revision(ctx.test_name).await?;
        self.reverify(ctx, &[Environment::Qa, Environment::Production], job).await?;
        if let Err(e) = self
            .promote_to_environment(ctx, Environment::Qa, None, &current.revision, UNKNOWN_REVISION, job)
            .await
        {
            job.log("previous revision changes prevented auto-promote to PRODUCTION");
            return Err(e);
        }
        self.promote_internal(
            ctx.test_name,
            ctx.actor,
            Environment::Working,
            &current.revision,
            Environment::Production,
            UNKNOWN_REVISION,
            job,
            true,
        )
        .await
    }

    async fn auto_promote_allocation_change(
        &self,
        ctx: &AutoPromoteContext<'_>,
        existing: &TestDefinition,
        job: &BackgroundJob,
    ) -> PromoteResult<()> {
        let current = self
            .current_revision_following(ctx.test_name, ctx.previous_revision)
            .await?;
        if !analysis::is_allocation_only_change(existing, ctx.definition) {
            return Err(PromoteError::validation(
                "auto-promote is prevented because it isn't an allocation-only change.",
            ));
        }
        job.log(format!(
            "allocation only change, checking against other branches for auto-promote capability for test {}\nat QA revision {} and PRODUCTION revision {}",
            ctx.test_name, ctx.qa_revision, ctx.production_revision
        ));
        self.reverify(ctx, &[Environment::Qa, Environment::Production], job).await?;
        self.promote_to_environment(
            ctx,
            Environment::Qa,
            Some(ctx.definition),
            &current.revision,
            ctx.qa_revision,
            job,
        )
        .await?;
        self.promote_to_environment(
            ctx,
            Environment::Production,
            Some(ctx.definition),
            &current.revision,
            ctx.production_revision,
            job,
        )
        .await
    }

    /// Checks every hop before any is written when the policy asks for it
    async fn reverify(
        &self,
        ctx: &AutoPromoteContext<'_>,
        hops: &[Environment],
        job: &BackgroundJob,
    ) -> PromoteResult<()> {
        if !self.policy.reverify_compatibility {
            return Ok(());
        }
        for &environment in hops {
            job.log(format!("verifying compatibility with {environment} before auto-promote"));
            let result = self.checker.check(environment, ctx.test_name, Some(ctx.definition)).await?;
            if !result.valid {
                return Err(PromoteError::incompatible(
                    format!(
                        "auto-promote is prevented because {environment} clients are incompatible: {}",
                        result.errors.join("\n")
                    ),
                    result.errors,
                ));
            }
        }
        Ok(())
    }

    async fn current_revision(&self, test_name: &str) -> PromoteResult<Revision> {
        self.stores
            .get(Environment::Working)
            .history(test_name, 0, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                PromoteError::NotFound("Test hasn't been created. Failed to find the version for autopromote.".into())
            })
    }

    /// Head of trunk, provided the commit before it is `previous_revision`
    async fn current_revision_following(&self, test_name: &str, previous_revision: &str) -> PromoteResult<Revision> {
        let mut history = self
            .stores
            .get(Environment::Working)
            .history(test_name, 0, 2)
            .await?;
        if history.len() < 2 {
            return Err(PromoteError::Promotion(format!(
                "Test history should have at least 2 versions for edit and promote. Actually only has {} versions",
                history.len()
            )));
        }
        if history[1].revision != previous_revision {
            return Err(PromoteError::conflict(format!(
                "The passed previous revision was {previous_revision} but the previous revision from the history is {}. Failed to find the version for autopromote.",
                history[1].revision
            )));
        }
        Ok(history.swap_remove(0))
    }

    /// One auto-promotion hop from trunk.
    ///
    /// With `allocation_only_against`, the target's current definition must
    /// differ from it only in allocations.
    async fn promote_to_environment(
        &self,
        ctx: &AutoPromoteContext<'_>,
        target: Environment,
        allocation_only_against: Option<&TestDefinition>,
        current_revision: &str,
        target_revision: &str,
        job: &BackgroundJob,
    ) -> PromoteResult<()> {
        if target == Environment::Working {
            return Err(PromoteError::validation(format!(
                "Promotion target environment {target} is invalid."
            )));
        }
        if let Some(updated) = allocation_only_against {
            if target_revision == UNKNOWN_REVISION {
                return Err(PromoteError::validation(format!("{target} revision is unknown")));
            }
            let target_definition = self
                .stores
                .get(target)
                .test_definition(ctx.test_name, target_revision)
                .await?;
            let allocation_only = target_definition
                .as_ref()
                .is_some_and(|target_definition| analysis::is_allocation_only_change(target_definition, updated));
            if !allocation_only {
                return Err(PromoteError::validation(format!(
                    "Not auto-promote to {target} because it isn't an allocation-only change."
                )));
            }
        }

        job.log(format!("auto-promote changes to {target}"));
        self.promote_internal(
            ctx.test_name,
            ctx.actor,
            Environment::Working,
            current_revision,
            target,
            target_revision,
            job,
            true,
        )
        .await
        .inspect_err(|_| job.log(format!("Error while (or after) promoting the test to {target}")))
    }

    #[allow(clippy::too_many_arguments)]
    async fn promote_internal(
        &self,
        test_name: &str,
        actor: &Actor<'_>,
        source: Environment,
        source_revision: &str,
        destination: Environment,
        destination_revision: &str,
        job: &BackgroundJob,
        is_auto: bool,
    ) -> PromoteResult<()> {
        actor.validate()?;
        if !source.can_promote_to(destination) {
            return Err(PromoteError::validation(format!(
                "Invalid combination of source and destination: source={source} dest={destination}"
            )));
        }
        let definition = self
            .stores
            .get(source)
            .test_definition(test_name, source_revision)
            .await?
            .ok_or_else(|| {
                PromoteError::NotFound(format!(
                    "could not find {test_name} on {source} with revision {source_revision}"
                ))
            })?;

        job.log_with_timing("Validating Matrix.", "matrixCheck");
        let result = self.checker.check(destination, test_name, Some(&definition)).await?;
        if !result.valid {
            return Err(PromoteError::incompatible(
                format!("Test Promotion not compatible, errors: {}", result.errors.join("\n")),
                result.errors,
            ));
        }

        let event = ChangeEvent::Promote {
            test_name,
            definition: &definition,
            source,
            destination,
            auto_promote: is_auto,
        };
        job.log_with_timing("Executing pre promote extension tasks.", "prePromoteExtension");
        self.hooks.run_before(&event, actor.parameters, job)?;

        job.log_with_timing("Promoting experiment", "promote");
        job.log(format!(
            "(scm) promote {test_name} {source_revision:.7} ({} to {})",
            source.name(),
            destination.name()
        ));
        self.promoter
            .promote(
                test_name,
                source,
                source_revision,
                destination,
                destination_revision,
                &actor.change(""),
            )
            .await?;

        job.log_with_timing("Executing post promote extension tasks.", "postPromoteExtension");
        self.hooks.run_after(&event, actor.parameters, job)?;

        job.log(format!(
            "Promoted {test_name} from {} ({source_revision:.7}) to {} ({destination_revision:.7})",
            source.name(),
            destination.name()
        ));
        job.add_url(
            definition_url(test_name, destination),
            format!("view {test_name} on {}", destination.name()),
        );
        Ok(())
    }

    async fn run_delete(&self, request: DeleteRequest, job: &BackgroundJob) -> PromoteResult<()> {
        let DeleteRequest {
            test_name,
            username,
            password,
            author,
            source,
            source_revision,
            comment,
            parameters,
        } = request;
        let actor = Actor {
            username: &username,
            password: &password,
            author: &author,
            parameters: &parameters,
        };
        job.log(format!("Deleting test {test_name} branch: {source} user: {username} "));

        actor.validate()?;
        let store = self.stores.get(source);
        let Some(definition) = store.current_test_definition(&test_name).await? else {
            job.log(format!("Unknown test definition : {test_name}"));
            return Ok(());
        };

        job.log_with_timing(format!("(scm) getting history for '{test_name}'"), "getHistory");
        let history = store.history(&test_name, 0, 1).await?;
        let latest = history
            .first()
            .ok_or_else(|| PromoteError::NotFound(format!("Could not get any history for {test_name}")))?;
        if latest.revision != source_revision {
            return Err(PromoteError::conflict(format!(
                "Test has been updated since {source_revision} currently at {}",
                latest.revision
            )));
        }
        job.log(format!("(scm) Success: getting history for '{test_name}'"));

        job.log_with_timing("checking clients usage", "checkMatrix");
        if matches!(source, Environment::Working | Environment::Qa) {
            self.ensure_unused(Environment::Qa, "QA", &test_name).await?;
        }
        self.ensure_unused(Environment::Production, "prod", &test_name).await?;
        job.log("Success: checking clients usage");

        let event = ChangeEvent::Delete {
            test_name: &test_name,
            definition: &definition,
        };
        if self.hooks.has_before() {
            job.log_with_timing("Executing pre delete extension tasks.", "preDeleteExtension");
            self.hooks.run_before(&event, &parameters, job)?;
            job.log("Finished pre delete extension tasks.");
        }

        job.log_with_timing("Deleting", "Delete");
        job.log(format!("(scm) delete {test_name}"));
        let comment = if comment.is_empty() {
            format!("Deleting A/B test {test_name}")
        } else {
            comment
        };
        let change = actor.change(self.comment_formatter.format_full_comment(&comment, &parameters));
        store
            .delete_test_definition(&change, &source_revision, &test_name, &definition)
            .await?;
        job.log(format!("(scm) Success: delete {test_name}"));

        let mut exists_elsewhere = false;
        for environment in Environment::ALL.into_iter().filter(|e| *e != source) {
            if self
                .stores
                .get(environment)
                .current_test_definition(&test_name)
                .await?
                .is_some()
            {
                exists_elsewhere = true;
                job.add_url(
                    definition_url(&test_name, environment),
                    format!("view {test_name} on {}", environment.name()),
                );
            }
        }
        if !exists_elsewhere {
            job.set_end_message("This test no longer exists in any environment.");
        }

        if self.hooks.has_after() {
            job.log_with_timing("Executing post delete extension tasks.", "PostDeleteExtension");
            self.hooks.run_after(&event, &parameters, job)?;
            job.log("Finished post delete extension tasks.");
        }
        job.log_complete();
        Ok(())
    }

    async fn ensure_unused(&self, environment: Environment, label: &str, test_name: &str) -> PromoteResult<()> {
        let result = self.checker.check(environment, test_name, None).await?;
        if result.valid {
            return Ok(());
        }
        let first = result.errors.first().cloned().unwrap_or_default();
        Err(PromoteError::incompatible(
            format!("There are still clients in {label} using {test_name} {first}"),
            result.errors,
        ))
    }
}

/// Inputs shared by every auto-promotion step of one edit
struct AutoPromoteContext<'a> {
    test_name: &'a str,
    actor: &'a Actor<'a>,
    definition: &'a TestDefinition,
    existing: Option<&'a TestDefinition>,
    previous_revision: &'a str,
    qa_revision: &'a str,
    production_revision: &'a str,
}

/// Refusals are informational; anything else is surfaced as a trailing warning
fn report_auto_promote_error(test_name: &str, error: PromoteError, job: &BackgroundJob) {
    if error.is_expected() && !error.is_authorization() {
        tracing::info!(test = test_name, reason = %error, "Auto-promotion skipped");
        job.log(error.to_string());
        return;
    }
    let failure = PromoteError::AutoPromote {
        message: AUTO_PROMOTE_FAILED.to_string(),
        source: Box::new(error),
    };
    tracing::warn!(test = test_name, error = ?failure, "Auto-promotion failed after a successful edit");
    for (depth, line) in cause_chain(&failure).iter().enumerate() {
        job.log(format!("WARNING: {}{line}", "-- ".repeat(depth)));
    }
    job.set_end_message(AUTO_PROMOTE_FAILED);
}

/// Parse a JSON definition and normalize its rules
pub fn parse_definition(json: &str) -> PromoteResult<TestDefinition> {
    let mut definition: TestDefinition = serde_json::from_str(json)
        .map_err(|e| PromoteError::validation(format!("Unable to parse test definition: {e}")))?;
    definition.normalize_rules();
    Ok(definition)
}

/// Link to a test's page in `environment`
#[must_use]
pub fn definition_url(test_name: &str, environment: Environment) -> String {
    format!("/proctor/definition/{test_name}?branch={}", environment.name())
}

fn edit_job_title(request: &EditRequest, is_create: bool) -> String {
    let action = if is_create { "Creating" } else { "Editing" };
    let promotion = match request.auto_promote_target {
        Environment::Working => "",
        Environment::Qa => " and promoting to QA",
        Environment::Production => " and promoting to QA and Prod",
    };
    format!(
        "(username:{} author:{}) {action}{promotion} {}",
        request.username, request.author, request.test_name
    )
}

fn edit_job_type(is_create: bool, target: Environment) -> JobType {
    match (is_create, target) {
        (true, Environment::Working) => JobType::TestCreation,
        (true, Environment::Qa) => JobType::TestCreationPromotionQa,
        (true, Environment::Production) => JobType::TestCreationPromotion,
        (false, Environment::Working) => JobType::TestEdit,
        (false, Environment::Qa) => JobType::TestEditPromotionQa,
        (false, Environment::Production) => JobType::TestEditPromotion,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proctor_model::TestType;

    #[test]
    fn edit_titles_and_types() {
        let request = EditRequest::new("button_tst", "alice", "secret", TestDefinition::new(TestType::USER, "s"))
            .with_author("bob")
            .with_auto_promote(Environment::Production);
        assert_eq!(
            edit_job_title(&request, false),
            "(username:alice author:bob) Editing and promoting to QA and Prod button_tst"
        );
        assert_eq!(
            edit_job_title(&request.clone().with_auto_promote(Environment::Working), true),
            "(username:alice author:bob) Creating button_tst"
        );
        assert_eq!(edit_job_type(true, Environment::Qa), JobType::TestCreationPromotionQa);
        assert_eq!(edit_job_type(false, Environment::Production), JobType::TestEditPromotion);
        assert_eq!(edit_job_type(false, Environment::Working), JobType::TestEdit);
    }

    #[test]
    fn urls_use_branch_names() {
        assert_eq!(
            definition_url("button_tst", Environment::Working),
            "/proctor/definition/button_tst?branch=trunk"
        );
        assert_eq!(
            definition_url("button_tst", Environment::Production),
            "/proctor/definition/button_tst?branch=production"
        );
    }

    #[test]
    fn blank_or_broken_json_is_rejected() {
        let err = parse_definition("{not json").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn auto_promote_refusal_is_informational() {
        let job = BackgroundJob::new("t", "alice", JobType::TestEdit);
        report_auto_promote_error(
            "t",
            PromoteError::validation("auto-promote is prevented because it isn't an allocation-only change."),
            &job,
        );
        assert_eq!(
            job.log_text(),
            "auto-promote is prevented because it isn't an allocation-only change.\n"
        );
        assert_eq!(job.end_message(), "");
    }

    #[test]
    fn auto_promote_failure_sets_end_message() {
        let job = BackgroundJob::new("t", "alice", JobType::TestEdit);
        report_auto_promote_error("t", PromoteError::Panicked("boom".into()), &job);
        assert_eq!(job.end_message(), AUTO_PROMOTE_FAILED);
        assert!(job.log_text().contains("WARNING: -- job panicked: boom"));
    }
}

//! `proctorctl` - manage Proctor test definitions from the command line
//!
//! Each environment lives in its own repository under `--root`:
//! `<root>/trunk`, `<root>/qa` and `<root>/production`.

mod config;
mod specifications;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use config::CliConfig;
use proctor_model::Environment;
use proctor_promote::{
    BackgroundJob, DefinitionInput, DeleteRequest, EditRequest, JobStatus, JobManager, MatrixChecker,
    PromoteRequest, PromotionEngine, StructuralVerifier,
};
use proctor_store::scm::local::LocalRepository;
use proctor_store::{
    CachedPersisterCore, EnvironmentStores, FileBasedProctorStore, ProctorStore, ScmPersisterCore,
};
use serde::Serialize;
use specifications::FileSpecificationSource;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "proctorctl", version, about = "Manage Proctor test definitions")]
struct Cli {
    /// Directory holding one repository per environment
    #[arg(long, global = true, default_value = "proctor-data")]
    root: PathBuf,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON file of client specifications per environment
    #[arg(long, global = true)]
    specifications: Option<PathBuf>,

    /// SCM username, or PROCTOR_USERNAME
    #[arg(long, global = true)]
    username: Option<String>,

    /// SCM password, or PROCTOR_PASSWORD
    #[arg(long, global = true)]
    password: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the environment repositories
    Init,
    /// Check that every environment store is usable
    Verify,
    /// Print a test definition
    Show {
        test_name: String,
        #[arg(long, default_value = "trunk")]
        env: Environment,
        /// Revision to read instead of the current one
        #[arg(long)]
        revision: Option<String>,
    },
    /// Print the commit history of a test
    History {
        test_name: String,
        #[arg(long, default_value = "trunk")]
        env: Environment,
        #[arg(long, default_value_t = 0)]
        start: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the test matrix of an environment
    Matrix {
        #[arg(long, default_value = "trunk")]
        env: Environment,
        #[arg(long)]
        revision: Option<String>,
    },
    /// Print where a test stands in each environment
    Versions { test_name: String },
    /// Create a test from a JSON definition
    Create {
        test_name: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "")]
        comment: String,
        /// Promote after creating: qa or production
        #[arg(long)]
        auto_promote: Option<Environment>,
    },
    /// Replace a test definition
    Edit {
        test_name: String,
        #[arg(long)]
        file: PathBuf,
        /// Trunk revision the edit is based on
        #[arg(long)]
        previous_revision: String,
        #[arg(long, default_value = "")]
        comment: String,
        #[arg(long)]
        auto_promote: Option<Environment>,
    },
    /// Copy a test from one environment to the next
    Promote {
        test_name: String,
        #[arg(long)]
        from: Environment,
        #[arg(long)]
        from_revision: String,
        #[arg(long)]
        to: Environment,
        /// Current revision in the destination, -1 when absent
        #[arg(long, default_value = "-1")]
        to_revision: String,
    },
    /// Delete a test from an environment
    Delete {
        test_name: String,
        #[arg(long)]
        env: Environment,
        #[arg(long)]
        revision: String,
        #[arg(long, default_value = "")]
        comment: String,
    },
    /// Remove the working directories of the current user
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    let config = CliConfig::load(cli.config.as_deref())?;

    if matches!(cli.command, Command::Init) {
        return init(&cli, &config);
    }

    let stores = open_stores(&cli.root, &config)?;
    let result = run(&cli, &config, &stores).await;
    stores.close();
    result
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

impl Cli {
    fn credentials(&self) -> (String, String) {
        let username = self
            .username
            .clone()
            .or_else(|| std::env::var("PROCTOR_USERNAME").ok())
            .unwrap_or_default();
        let password = self
            .password
            .clone()
            .or_else(|| std::env::var("PROCTOR_PASSWORD").ok())
            .unwrap_or_default();
        (username, password)
    }
}

fn init(cli: &Cli, config: &CliConfig) -> Result<()> {
    let (username, password) = cli.credentials();
    for environment in Environment::ALL {
        let path = cli.root.join(environment.name());
        let repository = LocalRepository::init(&path)
            .with_context(|| format!("initializing {}", path.display()))?;
        if !username.is_empty() {
            repository.add_user(&username, &password)?;
        }
        if repository.head() == 0 {
            let author = if username.is_empty() { "proctor" } else { username.as_str() };
            repository.mkdir(
                &config.store.test_definitions_directory,
                author,
                "Create test definitions directory",
            )?;
        }
        tracing::info!(%environment, path = %path.display(), head = repository.head(), "Repository ready");
    }
    Ok(())
}

fn open_stores(root: &Path, config: &CliConfig) -> Result<EnvironmentStores> {
    let mut opened: Vec<Arc<dyn ProctorStore>> = Vec::with_capacity(Environment::ALL.len());
    for environment in Environment::ALL {
        let path = root.join(environment.name());
        let repository = LocalRepository::open(&path)
            .with_context(|| format!("opening {environment} repository; run `proctorctl init` first"))?;
        let store_config = config.store_for(environment);
        let core = ScmPersisterCore::open(Arc::new(repository), &store_config)?;
        let cached = CachedPersisterCore::new(Arc::new(core), &store_config.cache);
        opened.push(Arc::new(FileBasedProctorStore::new(Arc::new(cached), environment.name())));
    }
    let [working, qa, production]: [Arc<dyn ProctorStore>; 3] = opened
        .try_into()
        .map_err(|_| anyhow!("expected one store per environment"))?;
    Ok(EnvironmentStores::new(working, qa, production))
}

fn engine(cli: &Cli, config: &CliConfig, stores: &EnvironmentStores) -> Arc<PromotionEngine> {
    let source = Arc::new(FileSpecificationSource::new(cli.specifications.clone()));
    let checker = MatrixChecker::new(source, Arc::new(StructuralVerifier));
    let jobs = Arc::new(JobManager::new(&config.promote));
    Arc::new(PromotionEngine::new(stores.clone(), checker, jobs, &config.promote))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: &Cli, config: &CliConfig, stores: &EnvironmentStores) -> Result<()> {
    let (username, password) = cli.credentials();
    match &cli.command {
        Command::Init => Ok(()),
        Command::Verify => {
            for (environment, store) in stores.iter() {
                store
                    .verify_setup()
                    .await
                    .with_context(|| format!("{environment} store is not usable"))?;
                println!("{environment}: ok (r{})", store.latest_revision().await?);
            }
            Ok(())
        }
        Command::Show { test_name, env, revision } => {
            let store = stores.get(*env);
            let definition = match revision {
                Some(revision) => store.test_definition(test_name, revision).await?,
                None => store.current_test_definition(test_name).await?,
            };
            let definition = definition.ok_or_else(|| anyhow!("Test '{test_name}' not found in {env}"))?;
            print_json(&definition)
        }
        Command::History { test_name, env, start, limit } => {
            for revision in stores.get(*env).history(test_name, *start, *limit).await? {
                println!(
                    "r{}\t{}\t{}\t{}",
                    revision.revision,
                    revision.date.to_rfc3339(),
                    revision.author,
                    revision.message.lines().next().unwrap_or_default()
                );
            }
            Ok(())
        }
        Command::Matrix { env, revision } => {
            let store = stores.get(*env);
            let matrix = match revision {
                Some(revision) => store.test_matrix(revision).await?,
                None => store.current_test_matrix().await?,
            };
            print_json(&matrix)
        }
        Command::Versions { test_name } => {
            let engine = engine(cli, config, stores);
            let versions = engine
                .promoter()
                .get_environment_version(test_name)
                .await
                .ok_or_else(|| anyhow!("Unable to read versions of '{test_name}'"))?;
            engine.close();
            print_json(&versions)
        }
        Command::Create { test_name, file, comment, auto_promote } => {
            let mut request = EditRequest::new(test_name, username, password, read_definition(file)?)
                .with_comment(comment);
            if let Some(target) = auto_promote {
                request = request.with_auto_promote(*target);
            }
            let engine = engine(cli, config, stores);
            let job = engine.create(request);
            finish(&engine, &job).await
        }
        Command::Edit { test_name, file, previous_revision, comment, auto_promote } => {
            let mut request = EditRequest::new(test_name, username, password, read_definition(file)?)
                .with_previous_revision(previous_revision)
                .with_comment(comment);
            if let Some(target) = auto_promote {
                request = request.with_auto_promote(*target);
            }
            let engine = engine(cli, config, stores);
            let job = engine.edit(request);
            finish(&engine, &job).await
        }
        Command::Promote { test_name, from, from_revision, to, to_revision } => {
            let engine = engine(cli, config, stores);
            let job = engine.promote(PromoteRequest::new(
                test_name,
                username,
                password,
                *from,
                from_revision,
                *to,
                to_revision,
            ));
            finish(&engine, &job).await
        }
        Command::Delete { test_name, env, revision, comment } => {
            let engine = engine(cli, config, stores);
            let job = engine
                .delete(DeleteRequest::new(test_name, username, password, *env, revision).with_comment(comment));
            finish(&engine, &job).await
        }
        Command::Clean => {
            if username.is_empty() {
                return Err(anyhow!("No username provided"));
            }
            let engine = engine(cli, config, stores);
            let job = engine.clean_workspaces(&username);
            finish(&engine, &job).await
        }
    }
}

fn read_definition(file: &Path) -> Result<DefinitionInput> {
    let json = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    Ok(DefinitionInput::Json(json))
}

/// Wait for `job`, print what it logged and fail if it did
async fn finish(engine: &PromotionEngine, job: &BackgroundJob) -> Result<()> {
    while job.is_running() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    engine.close();

    print!("{}", job.log_text());
    for url in job.urls() {
        println!("{}: {}", url.text, url.href);
    }
    let end_message = job.end_message();
    if !end_message.is_empty() {
        println!("{end_message}");
    }
    match job.status() {
        JobStatus::Failed => Err(anyhow!(job.error().unwrap_or_else(|| format!("{} failed", job.title())))),
        JobStatus::Cancelled => Err(anyhow!("{} was cancelled", job.title())),
        JobStatus::Done | JobStatus::Pending => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environments_parse_from_arguments() {
        let cli = Cli::try_parse_from([
            "proctorctl",
            "promote",
            "button_color_tst",
            "--from",
            "trunk",
            "--from-revision",
            "7",
            "--to",
            "prod",
        ])
        .unwrap();
        match cli.command {
            Command::Promote { from, to, to_revision, .. } => {
                assert_eq!(from, Environment::Working);
                assert_eq!(to, Environment::Production);
                assert_eq!(to_revision, "-1");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn unknown_environment_is_rejected() {
        assert!(Cli::try_parse_from(["proctorctl", "matrix", "--env", "staging"]).is_err());
    }

    #[tokio::test]
    async fn init_creates_usable_stores() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "proctorctl",
            "--root",
            dir.path().join("data").to_str().unwrap(),
            "--username",
            "alice",
            "--password",
            "secret",
            "init",
        ])
        .unwrap();
        let config = CliConfig {
            store: proctor_store::StoreConfig::new(dir.path().join("workspaces")),
            ..CliConfig::default()
        };
        init(&cli, &config).unwrap();
        init(&cli, &config).unwrap();

        let stores = open_stores(&cli.root, &config).unwrap();
        for (_, store) in stores.iter() {
            store.verify_setup().await.unwrap();
            assert!(store.current_test_matrix().await.unwrap().test_matrix_definition.tests.is_empty());
        }
        stores.close();
    }
}

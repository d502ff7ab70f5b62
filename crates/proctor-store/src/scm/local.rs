//! File-backed reference repository
//!
//! Commits are kept in a JSON journal under the repository root; revisions
//! are integers starting at 1. A working copy is a plain directory with a
//! `.scm/state.json` file recording the repository and base revision.
//!
//! Directories are versioned nodes. A directory's last-changed revision is
//! the newest change anywhere beneath it. History of a path stops at the
//! commit that created it, so a re-created test starts a fresh history.

use super::{
    ChangeSet, ConnectionFactory, Credentials, DirEntry, DirListing, LogEntry, NodeKind,
    ScmConnection, ScmError, ScmResult, WorkingCopyStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

const JOURNAL_FILE: &str = "journal.json";
const STATE_DIR: &str = ".scm";
const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Change {
    AddDir { path: String },
    AddFile { path: String, content: String },
    Modify { path: String, content: String },
    Delete { path: String },
}

impl Change {
    fn path(&self) -> &str {
        match self {
            Self::AddDir { path }
            | Self::AddFile { path, .. }
            | Self::Modify { path, .. }
            | Self::Delete { path } => path,
        }
    }

    fn creates(&self, path: &str) -> bool {
        matches!(self, Self::AddDir { path: p } | Self::AddFile { path: p, .. } if p == path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Commit {
    revision: u64,
    author: String,
    date: DateTime<Utc>,
    message: String,
    changes: Vec<Change>,
}

impl Commit {
    fn log_entry(&self) -> LogEntry {
        LogEntry {
            revision: self.revision,
            author: self.author.clone(),
            date: self.date,
            message: self.message.clone(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Journal {
    #[serde(default)]
    users: BTreeMap<String, String>,
    #[serde(default)]
    commits: Vec<Commit>,
}

// `content` is `None` for directories.
#[derive(Debug, Clone, PartialEq)]
struct Node {
    content: Option<String>,
    changed: u64,
}

type Tree = BTreeMap<String, Node>;

impl Journal {
    fn head(&self) -> u64 {
        self.commits.len() as u64
    }

    fn commit(&self, revision: u64) -> Option<&Commit> {
        let index = usize::try_from(revision.checked_sub(1)?).ok()?;
        self.commits.get(index)
    }

    fn tree_at(&self, revision: u64) -> ScmResult<Tree> {
        if revision > self.head() {
            return Err(ScmError::NotFound(format!("revision {revision}")));
        }
        let mut tree = Tree::new();
        for commit in self.commits.iter().take_while(|c| c.revision <= revision) {
            for change in &commit.changes {
                match change {
                    Change::AddDir { path } => {
                        tree.insert(path.clone(), Node { content: None, changed: commit.revision });
                    }
                    Change::AddFile { path, content } | Change::Modify { path, content } => {
                        tree.insert(
                            path.clone(),
                            Node { content: Some(content.clone()), changed: commit.revision },
                        );
                    }
                    Change::Delete { path } => tree.retain(|p, _| !is_within(p, path)),
                }
            }
        }
        Ok(tree)
    }

    fn authenticate(&self, credentials: &Credentials) -> ScmResult<String> {
        match credentials {
            Credentials::Anonymous => Err(ScmError::Authentication { user: String::new() }),
            Credentials::Basic { username, password } => {
                let accepted = self.users.is_empty()
                    || self.users.get(username).is_some_and(|p| p == password);
                if accepted {
                    Ok(username.clone())
                } else {
                    Err(ScmError::Authentication { user: username.clone() })
                }
            }
        }
    }

    fn entry(&self, name: String, kind: NodeKind, revision: u64) -> DirEntry {
        let commit = self.commit(revision);
        DirEntry {
            name,
            kind,
            revision,
            author: commit.map(|c| c.author.clone()).unwrap_or_default(),
            date: commit.map(|c| c.date).unwrap_or_default(),
            message: commit.map(|c| c.message.clone()).unwrap_or_default(),
        }
    }
}

fn is_within(path: &str, ancestor: &str) -> bool {
    ancestor.is_empty()
        || path == ancestor
        || (path.starts_with(ancestor) && path[ancestor.len()..].starts_with('/'))
}

fn kind_of(tree: &Tree, path: &str) -> NodeKind {
    if path.is_empty() {
        return NodeKind::Dir;
    }
    match tree.get(path) {
        Some(Node { content: None, .. }) => NodeKind::Dir,
        Some(Node { content: Some(_), .. }) => NodeKind::File,
        None => NodeKind::None,
    }
}

fn last_changed(tree: &Tree, path: &str) -> u64 {
    tree.iter()
        .filter(|(p, _)| is_within(p, path))
        .map(|(_, node)| node.changed)
        .max()
        .unwrap_or(0)
}

fn normalize(path: &str) -> String {
    path.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>().join("/")
}

fn parents(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(i, _)| &path[..i])
}

/// Shared handle to a file-backed repository
#[derive(Debug, Clone)]
pub struct LocalRepository {
    inner: Arc<RepositoryInner>,
}

#[derive(Debug)]
struct RepositoryInner {
    root: PathBuf,
    journal: RwLock<Journal>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkingCopyState {
    repository: PathBuf,
    revision: u64,
}

impl LocalRepository {
    /// Open the repository at `root`, creating an empty one if absent
    pub fn init(root: impl Into<PathBuf>) -> ScmResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let journal_path = root.join(JOURNAL_FILE);
        if !journal_path.exists() {
            write_json(&journal_path, &Journal::default())?;
        }
        Self::open(root)
    }

    /// Open an existing repository
    pub fn open(root: impl Into<PathBuf>) -> ScmResult<Self> {
        let root = root.into();
        let journal_path = root.join(JOURNAL_FILE);
        if !journal_path.is_file() {
            return Err(ScmError::NotFound(format!("no repository at {}", root.display())));
        }
        let journal: Journal = read_json(&journal_path)?;
        let root = fs::canonicalize(&root)?;
        tracing::debug!(root = %root.display(), head = journal.head(), "Opened local repository");
        Ok(Self {
            inner: Arc::new(RepositoryInner { root, journal: RwLock::new(journal) }),
        })
    }

    /// Repository root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Head revision, 0 for an empty repository
    #[must_use]
    pub fn head(&self) -> u64 {
        self.inner.journal.read().head()
    }

    /// Register a user allowed to commit.
    ///
    /// While no user is registered any basic credentials are accepted.
    pub fn add_user(&self, username: &str, password: &str) -> ScmResult<()> {
        let mut journal = self.inner.journal.write();
        journal.users.insert(username.to_string(), password.to_string());
        self.persist(&journal)
    }

    /// Create a directory (and missing parents) directly in the repository
    pub fn mkdir(&self, path: &str, author: &str, message: &str) -> ScmResult<u64> {
        let path = normalize(path);
        let mut journal = self.inner.journal.write();
        let head = journal.head();
        let tree = journal.tree_at(head)?;
        let changes: Vec<Change> = parents(&path)
            .chain(std::iter::once(path.as_str()))
            .filter(|p| !tree.contains_key(*p))
            .map(|p| Change::AddDir { path: p.to_string() })
            .collect();
        if changes.is_empty() {
            return Ok(head);
        }
        let revision = head + 1;
        journal.commits.push(Commit {
            revision,
            author: author.to_string(),
            date: Utc::now(),
            message: message.to_string(),
            changes,
        });
        self.persist(&journal)?;
        Ok(revision)
    }

    fn persist(&self, journal: &Journal) -> ScmResult<()> {
        let path = self.inner.root.join(JOURNAL_FILE);
        let tmp = self.inner.root.join(format!("{JOURNAL_FILE}.tmp"));
        write_json(&tmp, journal)?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn check_path(&self, path: &str, revision: u64) -> ScmResult<NodeKind> {
        let tree = self.inner.journal.read().tree_at(revision)?;
        Ok(kind_of(&tree, &normalize(path)))
    }

    fn cat(&self, path: &str, revision: u64) -> ScmResult<Vec<u8>> {
        let path = normalize(path);
        let tree = self.inner.journal.read().tree_at(revision)?;
        match tree.get(&path) {
            Some(Node { content: Some(content), .. }) => Ok(content.clone().into_bytes()),
            _ => Err(ScmError::NotFound(format!("{path}@r{revision}"))),
        }
    }

    fn list(&self, dir: &str, revision: u64) -> ScmResult<DirListing> {
        let dir = normalize(dir);
        let journal = self.inner.journal.read();
        let tree = journal.tree_at(revision)?;
        if kind_of(&tree, &dir) != NodeKind::Dir {
            return Err(ScmError::NotFound(format!("{dir}@r{revision}")));
        }
        let prefix = if dir.is_empty() { String::new() } else { format!("{dir}/") };
        let children = tree
            .iter()
            .filter_map(|(path, _)| {
                let name = path.strip_prefix(&prefix)?;
                (!name.is_empty() && !name.contains('/')).then(|| {
                    journal.entry(name.to_string(), kind_of(&tree, path), last_changed(&tree, path))
                })
            })
            .collect();
        let name = dir.rsplit('/').next().unwrap_or_default().to_string();
        Ok(DirListing {
            parent: journal.entry(name, NodeKind::Dir, last_changed(&tree, &dir)),
            children,
        })
    }

    fn log(&self, paths: &[String], start_revision: u64, limit: usize) -> ScmResult<Vec<LogEntry>> {
        let journal = self.inner.journal.read();
        if start_revision > journal.head() {
            return Err(ScmError::NotFound(format!("revision {start_revision}")));
        }
        let paths: Vec<String> = paths.iter().map(|p| normalize(p)).collect();
        let single = match paths.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        };

        let mut entries = Vec::new();
        for commit in journal.commits.iter().rev().skip_while(|c| c.revision > start_revision) {
            if entries.len() >= limit {
                break;
            }
            let touches = paths.is_empty()
                || commit.changes.iter().any(|change| {
                    paths.iter().any(|p| is_within(change.path(), p) || is_within(p, change.path()))
                });
            if touches {
                entries.push(commit.log_entry());
            }
            if single.is_some_and(|p| commit.changes.iter().any(|c| c.creates(p))) {
                break;
            }
        }
        Ok(entries)
    }

    fn checkout(&self, dir: &Path) -> ScmResult<u64> {
        let journal = self.inner.journal.read();
        let head = journal.head();
        let tree = journal.tree_at(head)?;
        drop(journal);

        fs::create_dir_all(dir)?;
        write_tree(dir, &tree)?;
        self.write_state(dir, head)?;
        Ok(head)
    }

    fn update(&self, dir: &Path) -> ScmResult<u64> {
        let WorkingCopyStatus::Normal { revision } = self.status(dir)? else {
            return Err(ScmError::Conflict(format!(
                "{} has local modifications or is not a working copy",
                dir.display()
            )));
        };
        let journal = self.inner.journal.read();
        let head = journal.head();
        let base = journal.tree_at(revision)?;
        let target = journal.tree_at(head)?;
        drop(journal);

        for path in base.keys().rev().filter(|p| !target.contains_key(*p)) {
            let on_disk = dir.join(path);
            if on_disk.is_dir() {
                fs::remove_dir_all(on_disk)?;
            } else if on_disk.exists() {
                fs::remove_file(on_disk)?;
            }
        }
        write_tree(dir, &target)?;
        self.write_state(dir, head)?;
        Ok(head)
    }

    fn status(&self, dir: &Path) -> ScmResult<WorkingCopyStatus> {
        let Some(state) = self.read_state(dir) else {
            return Ok(WorkingCopyStatus::Unversioned);
        };
        if state.repository != self.inner.root {
            return Ok(WorkingCopyStatus::Unversioned);
        }
        let base = self.inner.journal.read().tree_at(state.revision)?;
        let expected: BTreeMap<String, Option<String>> =
            base.into_iter().map(|(path, node)| (path, node.content)).collect();
        if read_disk_tree(dir)? == expected {
            Ok(WorkingCopyStatus::Normal { revision: state.revision })
        } else {
            Ok(WorkingCopyStatus::Modified)
        }
    }

    fn commit(
        &self,
        credentials: &Credentials,
        dir: &Path,
        scheduled: &ChangeSet,
        message: &str,
    ) -> ScmResult<Option<u64>> {
        let state = self
            .read_state(dir)
            .ok_or_else(|| ScmError::NotFound(format!("{} is not a working copy", dir.display())))?;

        let mut journal = self.inner.journal.write();
        let author = journal.authenticate(credentials)?;
        let head = journal.head();
        let base = journal.tree_at(state.revision)?;
        let current = journal.tree_at(head)?;

        let deleted: Vec<String> = scheduled
            .deleted()
            .map(|p| relative_path(dir, p))
            .collect::<ScmResult<_>>()?;

        let mut changes = Vec::new();
        for path in &deleted {
            if base.contains_key(path) {
                changes.push(Change::Delete { path: path.clone() });
            }
        }

        let mut added = Vec::<String>::new();
        for file in scheduled.added() {
            let rel = relative_path(dir, file)?;
            for path in parents(&rel).chain(std::iter::once(rel.as_str())) {
                if base.contains_key(path) || added.iter().any(|a| a == path) {
                    continue;
                }
                let on_disk = dir.join(path);
                if on_disk.is_dir() {
                    changes.push(Change::AddDir { path: path.to_string() });
                } else if on_disk.is_file() {
                    changes.push(Change::AddFile {
                        path: path.to_string(),
                        content: fs::read_to_string(&on_disk)?,
                    });
                } else {
                    return Err(ScmError::NotFound(format!("{path} scheduled for addition")));
                }
                added.push(path.to_string());
            }
        }

        for (path, node) in &base {
            if node.content.is_none() || deleted.iter().any(|d| is_within(path, d)) {
                continue;
            }
            let on_disk = dir.join(path);
            if !on_disk.is_file() {
                continue;
            }
            let content = fs::read_to_string(&on_disk)?;
            if node.content.as_deref() != Some(content.as_str()) {
                changes.push(Change::Modify { path: path.clone(), content });
            }
        }

        if changes.is_empty() {
            return Ok(None);
        }

        for change in &changes {
            let path = change.path();
            let out_of_date = match change {
                Change::AddDir { .. } | Change::AddFile { .. } => current.contains_key(path),
                Change::Modify { .. } | Change::Delete { .. } => {
                    !current.contains_key(path) || last_changed(&current, path) > state.revision
                }
            };
            if out_of_date {
                return Err(ScmError::Conflict(format!("{path} is out of date")));
            }
        }

        let revision = head + 1;
        journal.commits.push(Commit {
            revision,
            author,
            date: Utc::now(),
            message: message.to_string(),
            changes,
        });
        self.persist(&journal)?;
        drop(journal);

        if state.revision == head {
            self.write_state(dir, revision)?;
        }
        tracing::debug!(revision, dir = %dir.display(), "Committed working copy");
        Ok(Some(revision))
    }

    fn read_state(&self, dir: &Path) -> Option<WorkingCopyState> {
        read_json(&dir.join(STATE_DIR).join(STATE_FILE)).ok()
    }

    fn write_state(&self, dir: &Path, revision: u64) -> ScmResult<()> {
        let state_dir = dir.join(STATE_DIR);
        fs::create_dir_all(&state_dir)?;
        write_json(
            &state_dir.join(STATE_FILE),
            &WorkingCopyState { repository: self.inner.root.clone(), revision },
        )
    }
}

impl ConnectionFactory for LocalRepository {
    fn connect(&self, credentials: &Credentials) -> ScmResult<Arc<dyn ScmConnection>> {
        Ok(Arc::new(LocalConnection {
            repository: self.clone(),
            credentials: credentials.clone(),
        }))
    }

    fn location(&self) -> String {
        format!("file://{}", self.inner.root.display())
    }
}

/// Connection to a [`LocalRepository`]; filesystem work runs on the blocking pool
#[derive(Debug)]
pub struct LocalConnection {
    repository: LocalRepository,
    credentials: Credentials,
}

impl LocalConnection {
    async fn run<T, F>(&self, operation: F) -> ScmResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&LocalRepository, &Credentials) -> ScmResult<T> + Send + 'static,
    {
        let repository = self.repository.clone();
        let credentials = self.credentials.clone();
        tokio::task::spawn_blocking(move || operation(&repository, &credentials))
            .await
            .map_err(|e| ScmError::Backend(format!("local scm task failed: {e}")))?
    }
}

#[async_trait]
impl ScmConnection for LocalConnection {
    async fn latest_revision(&self) -> ScmResult<u64> {
        Ok(self.repository.head())
    }

    async fn check_path(&self, path: &str, revision: u64) -> ScmResult<NodeKind> {
        let path = path.to_string();
        self.run(move |repo, _| repo.check_path(&path, revision)).await
    }

    async fn cat(&self, path: &str, revision: u64) -> ScmResult<Vec<u8>> {
        let path = path.to_string();
        self.run(move |repo, _| repo.cat(&path, revision)).await
    }

    async fn list(&self, dir: &str, revision: u64) -> ScmResult<DirListing> {
        let dir = dir.to_string();
        self.run(move |repo, _| repo.list(&dir, revision)).await
    }

    async fn log(
        &self,
        paths: &[String],
        start_revision: u64,
        limit: usize,
    ) -> ScmResult<Vec<LogEntry>> {
        let paths = paths.to_vec();
        self.run(move |repo, _| repo.log(&paths, start_revision, limit)).await
    }

    async fn checkout(&self, dir: &Path) -> ScmResult<u64> {
        let dir = dir.to_path_buf();
        self.run(move |repo, _| repo.checkout(&dir)).await
    }

    async fn update(&self, dir: &Path) -> ScmResult<u64> {
        let dir = dir.to_path_buf();
        self.run(move |repo, _| repo.update(&dir)).await
    }

    async fn status(&self, dir: &Path) -> ScmResult<WorkingCopyStatus> {
        let dir = dir.to_path_buf();
        self.run(move |repo, _| repo.status(&dir)).await
    }

    async fn commit(
        &self,
        dir: &Path,
        changes: &ChangeSet,
        message: &str,
    ) -> ScmResult<Option<u64>> {
        let dir = dir.to_path_buf();
        let changes = changes.clone();
        let message = message.to_string();
        self.run(move |repo, credentials| repo.commit(credentials, &dir, &changes, &message))
            .await
    }
}

fn relative_path(dir: &Path, path: &Path) -> ScmResult<String> {
    let relative = path
        .strip_prefix(dir)
        .map_err(|_| ScmError::Backend(format!("{} is outside {}", path.display(), dir.display())))?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    Ok(parts.join("/"))
}

fn read_disk_tree(dir: &Path) -> ScmResult<BTreeMap<String, Option<String>>> {
    fn walk(
        root: &Path,
        dir: &Path,
        out: &mut BTreeMap<String, Option<String>>,
    ) -> ScmResult<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if dir == root && path.file_name().is_some_and(|n| n == STATE_DIR) {
                continue;
            }
            let key = relative_path(root, &path)?;
            if path.is_dir() {
                out.insert(key, None);
                walk(root, &path, out)?;
            } else {
                out.insert(key, Some(fs::read_to_string(&path)?));
            }
        }
        Ok(())
    }

    let mut tree = BTreeMap::new();
    walk(dir, dir, &mut tree)?;
    Ok(tree)
}

fn write_tree(dir: &Path, tree: &Tree) -> ScmResult<()> {
    for (path, node) in tree {
        let target = dir.join(path);
        match &node.content {
            None => fs::create_dir_all(&target)?,
            Some(content) => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&target, content)?;
            }
        }
    }
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> ScmResult<T> {
    let raw = fs::read(path)?;
    serde_json::from_slice(&raw).map_err(|e| ScmError::Corrupt(format!("{}: {e}", path.display())))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> ScmResult<()> {
    let raw = serde_json::to_vec_pretty(value)
        .map_err(|e| ScmError::Corrupt(format!("{}: {e}", path.display())))?;
    fs::write(path, raw)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn repository() -> (TempDir, LocalRepository) {
        let dir = TempDir::new().unwrap();
        let repo = LocalRepository::init(dir.path().join("repo")).unwrap();
        repo.mkdir("test-definitions", "admin", "layout").unwrap();
        (dir, repo)
    }

    fn alice(repo: &LocalRepository) -> Arc<dyn ScmConnection> {
        repo.connect(&Credentials::basic("alice", "pw")).unwrap()
    }

    async fn commit_file(
        conn: &Arc<dyn ScmConnection>,
        wc: &Path,
        path: &str,
        content: &str,
        message: &str,
    ) -> Option<u64> {
        let file = wc.join(path);
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        let existed = file.exists();
        fs::write(&file, content).unwrap();
        let mut changes = ChangeSet::new();
        if !existed {
            changes.add(&file);
        }
        conn.commit(wc, &changes, message).await.unwrap()
    }

    #[tokio::test]
    async fn commit_and_read_back() {
        let (dir, repo) = repository();
        let conn = alice(&repo);
        let wc = dir.path().join("wc");
        assert_eq!(conn.checkout(&wc).await.unwrap(), 1);

        let rev = commit_file(&conn, &wc, "test-definitions/a/definition.json", "{}", "add a").await;
        assert_eq!(rev, Some(2));

        assert_eq!(conn.check_path("test-definitions/a", 2).await.unwrap(), NodeKind::Dir);
        assert_eq!(conn.check_path("test-definitions/a", 1).await.unwrap(), NodeKind::None);
        assert_eq!(conn.cat("test-definitions/a/definition.json", 2).await.unwrap(), b"{}");
        assert_eq!(
            conn.status(&wc).await.unwrap(),
            WorkingCopyStatus::Normal { revision: 2 }
        );
    }

    #[tokio::test]
    async fn unchanged_commit_is_noop() {
        let (dir, repo) = repository();
        let conn = alice(&repo);
        let wc = dir.path().join("wc");
        conn.checkout(&wc).await.unwrap();

        let result = conn.commit(&wc, &ChangeSet::new(), "nothing").await.unwrap();
        assert_eq!(result, None);
        assert_eq!(repo.head(), 1);
    }

    #[tokio::test]
    async fn anonymous_and_wrong_password_rejected() {
        let (dir, repo) = repository();
        repo.add_user("alice", "pw").unwrap();
        let wc = dir.path().join("wc");
        let anonymous = repo.connect(&Credentials::Anonymous).unwrap();
        anonymous.checkout(&wc).await.unwrap();
        fs::write(wc.join("test-definitions/x.json"), "1").unwrap();
        let mut changes = ChangeSet::new();
        changes.add(wc.join("test-definitions/x.json"));

        let err = anonymous.commit(&wc, &changes, "m").await.unwrap_err();
        assert!(err.is_authentication());

        let wrong = repo.connect(&Credentials::basic("alice", "nope")).unwrap();
        assert!(wrong.commit(&wc, &changes, "m").await.unwrap_err().is_authentication());

        assert_eq!(alice(&repo).commit(&wc, &changes, "m").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn stale_working_copy_conflicts() {
        let (dir, repo) = repository();
        let conn = alice(&repo);
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        conn.checkout(&first).await.unwrap();
        commit_file(&conn, &first, "test-definitions/a/definition.json", "1", "add").await;
        conn.checkout(&second).await.unwrap();
        commit_file(&conn, &first, "test-definitions/a/definition.json", "2", "edit").await;

        fs::write(second.join("test-definitions/a/definition.json"), "3").unwrap();
        let err = conn.commit(&second, &ChangeSet::new(), "late").await.unwrap_err();
        assert!(matches!(err, ScmError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_brings_clean_copy_to_head() {
        let (dir, repo) = repository();
        let conn = alice(&repo);
        let writer = dir.path().join("writer");
        let reader = dir.path().join("reader");
        conn.checkout(&writer).await.unwrap();
        conn.checkout(&reader).await.unwrap();
        commit_file(&conn, &writer, "test-definitions/a/definition.json", "1", "add").await;

        assert_eq!(conn.update(&reader).await.unwrap(), 2);
        assert_eq!(
            fs::read_to_string(reader.join("test-definitions/a/definition.json")).unwrap(),
            "1"
        );

        fs::write(reader.join("stray.txt"), "x").unwrap();
        assert_eq!(conn.status(&reader).await.unwrap(), WorkingCopyStatus::Modified);
        assert!(conn.update(&reader).await.is_err());
    }

    #[tokio::test]
    async fn log_is_newest_first_and_stops_at_creation() {
        let (dir, repo) = repository();
        let conn = alice(&repo);
        let wc = dir.path().join("wc");
        conn.checkout(&wc).await.unwrap();
        let file = "test-definitions/a/definition.json";
        commit_file(&conn, &wc, file, "1", "create").await;
        commit_file(&conn, &wc, file, "2", "edit").await;

        let mut changes = ChangeSet::new();
        changes.delete(wc.join("test-definitions/a")).unwrap();
        assert_eq!(conn.commit(&wc, &changes, "delete").await.unwrap(), Some(4));
        commit_file(&conn, &wc, file, "3", "recreate").await;

        let path = vec!["test-definitions/a".to_string()];
        let history = conn.log(&path, 5, usize::MAX).await.unwrap();
        let messages: Vec<_> = history.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["recreate"]);

        let old = conn.log(&path, 3, usize::MAX).await.unwrap();
        let messages: Vec<_> = old.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["edit", "create"]);

        let all = conn.log(&[], 5, 2).await.unwrap();
        assert_eq!(all.iter().map(|e| e.revision).collect::<Vec<_>>(), vec![5, 4]);
    }

    #[tokio::test]
    async fn listing_reports_last_changed_revision() {
        let (dir, repo) = repository();
        let conn = alice(&repo);
        let wc = dir.path().join("wc");
        conn.checkout(&wc).await.unwrap();
        commit_file(&conn, &wc, "test-definitions/a/definition.json", "1", "a").await;
        commit_file(&conn, &wc, "test-definitions/b/definition.json", "1", "b").await;
        commit_file(&conn, &wc, "test-definitions/a/definition.json", "2", "a2").await;

        let listing = conn.list("test-definitions", 4).await.unwrap();
        assert_eq!(listing.parent.revision, 4);
        assert_eq!(listing.parent.message, "a2");
        let children: Vec<_> = listing.children.iter().map(|c| (c.name.as_str(), c.revision)).collect();
        assert_eq!(children, vec![("a", 4), ("b", 3)]);
        assert!(conn.list("missing", 4).await.is_err());
    }

    #[test]
    fn reopen_preserves_history() {
        let (dir, repo) = repository();
        repo.add_user("alice", "pw").unwrap();
        let reopened = LocalRepository::open(dir.path().join("repo")).unwrap();
        assert_eq!(reopened.head(), 1);
        assert!(LocalRepository::open(dir.path().join("nope")).is_err());
    }
}

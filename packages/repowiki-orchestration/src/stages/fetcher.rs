//! Repository access
//!
//! `RepoFetcher` resolves a repository to a revision and materializes that
//! revision as an in-memory snapshot. The clone stage only talks to this port.

use crate::cache::Fingerprint;
use crate::error::{OrchestratorError, Result};
use crate::job::RepoType;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Files above this size are left out of snapshots
pub const MAX_SNAPSHOT_FILE_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub url: String,
    pub repo_type: RepoType,
}

impl RepoRef {
    pub fn new(url: impl Into<String>, repo_type: RepoType) -> Self {
        Self {
            url: url.into(),
            repo_type,
        }
    }

    /// Last path segment without `.git`
    pub fn display_name(&self) -> String {
        let trimmed = self.url.trim_end_matches('/');
        let last = trimmed.rsplit(['/', ':']).next().unwrap_or(trimmed);
        let name = last.strip_suffix(".git").unwrap_or(last);
        if name.is_empty() {
            self.url.clone()
        } else {
            name.to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// `/`-separated, relative to the repository root
    pub path: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSnapshot {
    pub revision: String,
    /// Sorted by path
    pub files: Vec<SourceFile>,
}

impl RepoSnapshot {
    pub fn new(revision: impl Into<String>, mut files: Vec<SourceFile>) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            revision: revision.into(),
            files,
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.files.iter().map(|f| f.bytes.len()).sum()
    }
}

/// Content revision of a file list
pub fn tree_revision(files: &[SourceFile]) -> String {
    let mut builder = Fingerprint::builder().str_field("tree");
    for file in files {
        builder = builder.str_field(&file.path).field(&file.bytes);
    }
    format!("tree:{}", builder.finish().to_hex())
}

#[async_trait]
pub trait RepoFetcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Current revision identifier (commit id or content hash)
    async fn resolve_revision(&self, repo: &RepoRef) -> Result<String>;

    async fn fetch(&self, repo: &RepoRef, revision: &str) -> Result<RepoSnapshot>;
}

fn clone_error(err: git2::Error) -> OrchestratorError {
    OrchestratorError::ClonePermanent(err.message().to_string())
}

fn join_error(err: tokio::task::JoinError) -> OrchestratorError {
    OrchestratorError::internal(format!("fetch task failed: {}", err))
}

/// Read every regular file under `root`, skipping `.git`
fn read_tree(root: &Path) -> Result<Vec<SourceFile>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");

    for entry in walker {
        let entry = entry.map_err(|e| OrchestratorError::ClonePermanent(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size > MAX_SNAPSHOT_FILE_BYTES {
            debug!(path = %entry.path().display(), size, "skipping oversized file");
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let bytes = std::fs::read(entry.path())?;
        files.push(SourceFile { path, bytes });
    }
    Ok(files)
}

/// Remote repositories through libgit2
#[derive(Debug, Default, Clone)]
pub struct GitFetcher;

impl GitFetcher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RepoFetcher for GitFetcher {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn resolve_revision(&self, repo: &RepoRef) -> Result<String> {
        let url = repo.url.clone();
        tokio::task::spawn_blocking(move || -> Result<String> {
            let mut remote = git2::Remote::create_detached(url.as_str()).map_err(clone_error)?;
            remote
                .connect(git2::Direction::Fetch)
                .map_err(clone_error)?;
            let heads = remote.list().map_err(clone_error)?;
            let head = heads
                .iter()
                .find(|h| h.name() == "HEAD")
                .or_else(|| heads.first())
                .ok_or_else(|| {
                    OrchestratorError::ClonePermanent(format!("{} has no refs", url))
                })?;
            Ok(head.oid().to_string())
        })
        .await
        .map_err(join_error)?
    }

    /// Check out exactly `revision`.
    ///
    /// The commit is fetched by id; servers that refuse that get a shallow
    /// fetch of HEAD instead, which only succeeds if HEAD still points at it.
    async fn fetch(&self, repo: &RepoRef, revision: &str) -> Result<RepoSnapshot> {
        let url = repo.url.clone();
        let expected = git2::Oid::from_str(revision).map_err(|_| {
            OrchestratorError::ClonePermanent(format!("{} is not a commit id", revision))
        })?;
        tokio::task::spawn_blocking(move || -> Result<RepoSnapshot> {
            let checkout = tempfile::TempDir::new()?;
            let repository = git2::Repository::init(checkout.path()).map_err(clone_error)?;
            let mut remote = repository.remote_anonymous(&url).map_err(clone_error)?;

            let wanted = expected.to_string();
            if let Err(e) = remote.fetch(&[wanted.as_str()], Some(&mut shallow()), None) {
                debug!(url = %url, error = %e.message(), "fetch by commit id refused, fetching HEAD");
                remote
                    .fetch(&["HEAD"], Some(&mut shallow()), None)
                    .map_err(clone_error)?;
            }

            let commit = match repository.find_commit(expected) {
                Ok(commit) => commit,
                Err(_) => {
                    let actual = repository
                        .find_reference("FETCH_HEAD")
                        .and_then(|r| r.peel_to_commit())
                        .map(|c| c.id().to_string())
                        .unwrap_or_default();
                    warn!(url = %url, expected = %wanted, actual = %actual, "remote head moved during clone");
                    return Err(OrchestratorError::RevisionChanged {
                        expected: wanted,
                        actual,
                    });
                }
            };
            repository
                .checkout_tree(
                    commit.as_object(),
                    Some(git2::build::CheckoutBuilder::new().force()),
                )
                .map_err(clone_error)?;
            repository.set_head_detached(expected).map_err(clone_error)?;

            let files = read_tree(checkout.path())?;
            Ok(RepoSnapshot::new(wanted, files))
        })
        .await
        .map_err(join_error)?
    }
}

fn shallow() -> git2::FetchOptions<'static> {
    let mut options = git2::FetchOptions::new();
    options.depth(1);
    options
}

/// Directories on the engine host; revision is a content hash of the tree
#[derive(Debug, Default, Clone)]
pub struct LocalFetcher;

impl LocalFetcher {
    pub fn new() -> Self {
        Self
    }

    async fn read(&self, repo: &RepoRef) -> Result<Vec<SourceFile>> {
        let root = PathBuf::from(&repo.url);
        tokio::task::spawn_blocking(move || -> Result<Vec<SourceFile>> {
            if !root.is_dir() {
                return Err(OrchestratorError::ClonePermanent(format!(
                    "{} is not a directory",
                    root.display()
                )));
            }
            read_tree(&root)
        })
        .await
        .map_err(join_error)?
    }
}

#[async_trait]
impl RepoFetcher for LocalFetcher {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn resolve_revision(&self, repo: &RepoRef) -> Result<String> {
        let mut files = self.read(repo).await?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(tree_revision(&files))
    }

    async fn fetch(&self, repo: &RepoRef, _revision: &str) -> Result<RepoSnapshot> {
        let mut files = self.read(repo).await?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        let revision = tree_revision(&files);
        Ok(RepoSnapshot::new(revision, files))
    }
}

/// Picks `LocalFetcher` for `local` repositories and `GitFetcher` otherwise
#[derive(Debug, Default, Clone)]
pub struct DefaultFetcher {
    git: GitFetcher,
    local: LocalFetcher,
}

impl DefaultFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn select(&self, repo: &RepoRef) -> &dyn RepoFetcher {
        match repo.repo_type {
            RepoType::Local => &self.local,
            _ => &self.git,
        }
    }
}

#[async_trait]
impl RepoFetcher for DefaultFetcher {
    fn name(&self) -> &'static str {
        "default"
    }

    async fn resolve_revision(&self, repo: &RepoRef) -> Result<String> {
        self.select(repo).resolve_revision(repo).await
    }

    async fn fetch(&self, repo: &RepoRef, revision: &str) -> Result<RepoSnapshot> {
        self.select(repo).fetch(repo, revision).await
    }
}

/// In-memory repositories keyed by URL.
///
/// Unknown URLs fail the way an unreachable remote does.
#[derive(Debug, Default, Clone)]
pub struct MemoryFetcher {
    repos: Arc<DashMap<String, Vec<SourceFile>>>,
    fetches: Arc<AtomicUsize>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a repository
    pub fn insert<P, B>(&self, url: impl Into<String>, files: impl IntoIterator<Item = (P, B)>)
    where
        P: Into<String>,
        B: Into<Vec<u8>>,
    {
        let mut files: Vec<SourceFile> = files
            .into_iter()
            .map(|(path, bytes)| SourceFile {
                path: path.into(),
                bytes: bytes.into(),
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        self.repos.insert(url.into(), files);
    }

    /// Number of `fetch` calls so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn lookup(&self, repo: &RepoRef) -> Result<Vec<SourceFile>> {
        self.repos
            .get(&repo.url)
            .map(|files| files.value().clone())
            .ok_or_else(|| {
                OrchestratorError::ClonePermanent(format!(
                    "repository {} not found or unreachable",
                    repo.url
                ))
            })
    }
}

#[async_trait]
impl RepoFetcher for MemoryFetcher {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn resolve_revision(&self, repo: &RepoRef) -> Result<String> {
        Ok(tree_revision(&self.lookup(repo)?))
    }

    async fn fetch(&self, repo: &RepoRef, _revision: &str) -> Result<RepoSnapshot> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let files = self.lookup(repo)?;
        Ok(RepoSnapshot::new(tree_revision(&files), files))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name() {
        let r = RepoRef::new("https://github.com/acme/widgets.git", RepoType::Github);
        assert_eq!(r.display_name(), "widgets");
        let r = RepoRef::new("git@gitlab.com:acme/tools", RepoType::Gitlab);
        assert_eq!(r.display_name(), "tools");
        let r = RepoRef::new("/srv/repos/local-project/", RepoType::Local);
        assert_eq!(r.display_name(), "local-project");
    }

    #[test]
    fn test_tree_revision_tracks_content() {
        let a = vec![SourceFile {
            path: "a.rs".into(),
            bytes: b"fn a() {}".to_vec(),
        }];
        let mut b = a.clone();
        assert_eq!(tree_revision(&a), tree_revision(&b));
        b[0].bytes.push(b'\n');
        assert_ne!(tree_revision(&a), tree_revision(&b));
        assert!(tree_revision(&a).starts_with("tree:"));
    }

    #[tokio::test]
    async fn test_local_fetcher_reads_tree() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn x() {}").unwrap();
        std::fs::write(dir.path().join("README.md"), "# demo").unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/main").unwrap();

        let fetcher = LocalFetcher::new();
        let repo = RepoRef::new(dir.path().to_string_lossy(), RepoType::Local);
        let revision = fetcher.resolve_revision(&repo).await.unwrap();
        let snapshot = fetcher.fetch(&repo, &revision).await.unwrap();

        assert_eq!(snapshot.revision, revision);
        let paths: Vec<_> = snapshot.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "src/lib.rs"]);
    }

    #[tokio::test]
    async fn test_local_fetcher_missing_dir() {
        let fetcher = LocalFetcher::new();
        let repo = RepoRef::new("/definitely/not/here", RepoType::Local);
        let err = fetcher.resolve_revision(&repo).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ClonePermanent(_)));
    }

    #[tokio::test]
    async fn test_git_fetcher_invalid_url_is_permanent() {
        let fetcher = GitFetcher::new();
        let repo = RepoRef::new("not a url at all", RepoType::Git);
        let err = fetcher.resolve_revision(&repo).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ClonePermanent(_)));
    }

    #[tokio::test]
    async fn test_git_fetcher_rejects_non_commit_revision() {
        let fetcher = GitFetcher::new();
        let repo = RepoRef::new("https://example.com/a.git", RepoType::Git);
        let err = fetcher.fetch(&repo, "tree:abc").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ClonePermanent(_)));
    }

    #[tokio::test]
    async fn test_memory_fetcher() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert("https://example.com/a.git", [("src/main.rs", "fn main() {}")]);
        let repo = RepoRef::new("https://example.com/a.git", RepoType::Git);

        let revision = fetcher.resolve_revision(&repo).await.unwrap();
        let snapshot = fetcher.fetch(&repo, &revision).await.unwrap();
        assert_eq!(snapshot.revision, revision);
        assert_eq!(fetcher.fetch_count(), 1);

        let missing = RepoRef::new("https://example.com/missing.git", RepoType::Git);
        assert!(fetcher.resolve_revision(&missing).await.is_err());
    }
}

use crate::error::{OrchestratorError, Result};
use repowiki_storage::{JobPatch, JobRecord, JobStatus, JobStore, UpdateOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Component, PathBuf};

/// Recognized repository kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoType {
    Git,
    Github,
    Gitlab,
    Bitbucket,
    /// Directory on the engine host
    Local,
}

impl RepoType {
    pub const ALL: [RepoType; 5] = [
        RepoType::Git,
        RepoType::Github,
        RepoType::Gitlab,
        RepoType::Bitbucket,
        RepoType::Local,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RepoType::Git => "git",
            RepoType::Github => "github",
            RepoType::Gitlab => "gitlab",
            RepoType::Bitbucket => "bitbucket",
            RepoType::Local => "local",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "git" => Ok(RepoType::Git),
            "github" => Ok(RepoType::Github),
            "gitlab" => Ok(RepoType::Gitlab),
            "bitbucket" => Ok(RepoType::Bitbucket),
            "local" => Ok(RepoType::Local),
            other => Err(OrchestratorError::validation(format!(
                "unsupported repo_type '{}' (expected one of: git, github, gitlab, bitbucket, local)",
                other
            ))),
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, RepoType::Local)
    }
}

impl std::fmt::Display for RepoType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pipeline stage identifier (fixed order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Clone,
    Extract,
    Embed,
    Generate,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Clone, Stage::Extract, Stage::Embed, Stage::Generate];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Clone => "clone",
            Stage::Extract => "extract",
            Stage::Embed => "embed",
            Stage::Generate => "generate",
        }
    }

    /// Progress text shown while the stage runs
    pub fn progress_label(&self) -> &'static str {
        match self {
            Stage::Clone => "cloning",
            Stage::Extract => "extracting",
            Stage::Embed => "embedding",
            Stage::Generate => "generating",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Stage::Clone => 0,
            Stage::Extract => 1,
            Stage::Embed => 2,
            Stage::Generate => 3,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "clone" => Ok(Stage::Clone),
            "extract" => Ok(Stage::Extract),
            "embed" => Ok(Stage::Embed),
            "generate" => Ok(Stage::Generate),
            _ => Err(OrchestratorError::serialization(format!(
                "Invalid stage: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a credential is read from at execution time.
///
/// Only the reference is ever persisted; the secret itself never reaches the
/// job store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialRef {
    /// `env:NAME`
    Env(String),
    /// `file:/path/to/secret`
    File(PathBuf),
    /// `none` (local provider)
    None,
}

impl CredentialRef {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "none" {
            return Ok(CredentialRef::None);
        }
        if let Some(name) = s.strip_prefix("env:") {
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_');
            if valid {
                return Ok(CredentialRef::Env(name.to_string()));
            }
        }
        if let Some(path) = s.strip_prefix("file:") {
            if !path.is_empty() {
                return Ok(CredentialRef::File(PathBuf::from(path)));
            }
        }
        Err(OrchestratorError::validation(
            "credential must be a reference of the form env:NAME or file:/path",
        ))
    }

    /// Conventional reference for a provider's API key
    pub fn default_for(provider: &str) -> Self {
        match provider {
            "google" => CredentialRef::Env("GOOGLE_API_KEY".to_string()),
            "openai" => CredentialRef::Env("OPENAI_API_KEY".to_string()),
            "openrouter" => CredentialRef::Env("OPENROUTER_API_KEY".to_string()),
            _ => CredentialRef::None,
        }
    }

    /// Read the secret. `Ok(None)` when the reference points at nothing.
    pub fn resolve(&self) -> Result<Option<String>> {
        match self {
            CredentialRef::None => Ok(None),
            CredentialRef::Env(name) => Ok(std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())),
            CredentialRef::File(path) => match std::fs::read_to_string(path) {
                Ok(contents) => Ok(Some(contents.trim().to_string()).filter(|v| !v.is_empty())),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            },
        }
    }
}

impl std::fmt::Display for CredentialRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialRef::Env(name) => write!(f, "env:{}", name),
            CredentialRef::File(path) => write!(f, "file:{}", path.display()),
            CredentialRef::None => write!(f, "none"),
        }
    }
}

/// Credential references a submission may name; anything else is rejected
/// at admission. A provider's conventional reference is always accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPolicy {
    /// Readable environment variables
    pub env: Vec<String>,
    /// `file:` references must resolve under one of these
    pub dirs: Vec<PathBuf>,
}

pub const DEFAULT_CREDENTIAL_DIR: &str = "/run/secrets";

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self {
            env: ["GOOGLE_API_KEY", "OPENAI_API_KEY", "OPENROUTER_API_KEY"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            dirs: vec![PathBuf::from(DEFAULT_CREDENTIAL_DIR)],
        }
    }
}

impl CredentialPolicy {
    pub fn permits(&self, credential: &CredentialRef) -> bool {
        match credential {
            CredentialRef::None => true,
            CredentialRef::Env(name) => self.env.iter().any(|allowed| allowed == name),
            CredentialRef::File(path) => {
                path.is_absolute()
                    && path
                        .components()
                        .all(|c| matches!(c, Component::RootDir | Component::Normal(_)))
                    && self.dirs.iter().any(|dir| path.starts_with(dir))
            }
        }
    }
}

/// `(provider, model, credential reference)`, resolved once at admission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderBinding {
    pub provider: String,
    pub model: String,
    pub credential: CredentialRef,
}

impl ProviderBinding {
    pub const PROVIDER_KEY: &'static str = "provider";
    pub const MODEL_KEY: &'static str = "model";
    pub const CREDENTIAL_KEY: &'static str = "credential_ref";

    /// Read the binding stored on a job
    pub fn from_metadata(metadata: &Map<String, Value>) -> Result<Self> {
        let provider = metadata
            .get(Self::PROVIDER_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| OrchestratorError::internal("job metadata has no provider"))?;
        let model = metadata
            .get(Self::MODEL_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| OrchestratorError::internal("job metadata has no model"))?;
        let credential = match metadata.get(Self::CREDENTIAL_KEY).and_then(Value::as_str) {
            Some(raw) => CredentialRef::parse(raw)?,
            None => CredentialRef::default_for(provider),
        };
        Ok(Self {
            provider: provider.to_string(),
            model: model.to_string(),
            credential,
        })
    }

    pub fn write_to(&self, metadata: &mut Map<String, Value>) {
        metadata.insert(Self::PROVIDER_KEY.into(), Value::from(self.provider.clone()));
        metadata.insert(Self::MODEL_KEY.into(), Value::from(self.model.clone()));
        metadata.insert(
            Self::CREDENTIAL_KEY.into(),
            Value::from(self.credential.to_string()),
        );
    }
}

/// A validated transition, ready to be applied as a guarded update
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub patch: JobPatch,
    pub expected: JobStatus,
}

pub const PROGRESS_STARTING: &str = "starting";
pub const PROGRESS_WAITING: &str = "waiting for repository";
pub const PROGRESS_DONE: &str = "done";
pub const PROGRESS_ERROR: &str = "error";
pub const INTERRUPTED_ERROR: &str = "interrupted: engine restarted before the job finished";

/// Job state machine for transitions
///
/// `queued → running → {completed | failed}`. Wraps the last observed record
/// and turns each allowed transition into a `Transition` whose `expected`
/// status makes the store update a compare-and-set.
pub struct JobStateMachine {
    record: JobRecord,
}

impl JobStateMachine {
    pub fn new(record: JobRecord) -> Self {
        Self { record }
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn into_record(self) -> JobRecord {
        self.record
    }

    fn require(&self, from: JobStatus, to: &str) -> Result<()> {
        if self.record.status == from {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidStateTransition {
                from: self.record.status.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// Transition: QUEUED → RUNNING
    pub fn start(&self) -> Result<Transition> {
        self.require(JobStatus::Queued, "running")?;
        Ok(Transition {
            patch: JobPatch::status(JobStatus::Running).with_progress(PROGRESS_STARTING),
            expected: JobStatus::Queued,
        })
    }

    /// RUNNING → RUNNING with new progress text and metadata
    pub fn progress(&self, label: &str, metadata: Map<String, Value>) -> Result<Transition> {
        self.require(JobStatus::Running, "running (progress)")?;
        let mut patch = JobPatch::progress(label);
        patch.metadata = metadata;
        Ok(Transition {
            patch,
            expected: JobStatus::Running,
        })
    }

    /// Transition: RUNNING → COMPLETED
    pub fn complete(&self, metadata: Map<String, Value>) -> Result<Transition> {
        self.require(JobStatus::Running, "completed")?;
        let mut patch = JobPatch::status(JobStatus::Completed).with_progress(PROGRESS_DONE);
        patch.metadata = metadata;
        Ok(Transition {
            patch,
            expected: JobStatus::Running,
        })
    }

    /// Transition: RUNNING → FAILED
    pub fn fail(&self, error: impl Into<String>) -> Result<Transition> {
        self.require(JobStatus::Running, "failed")?;
        Ok(Transition {
            patch: JobPatch::status(JobStatus::Failed)
                .with_progress(PROGRESS_ERROR)
                .with_error(error),
            expected: JobStatus::Running,
        })
    }

    /// Apply a transition through the store.
    ///
    /// Returns `false` when the guard did not match (another executor owns
    /// the job, or it already reached a terminal state).
    pub async fn apply(&mut self, store: &dyn JobStore, transition: Transition) -> Result<bool> {
        match store
            .update(self.record.id, transition.patch, transition.expected)
            .await?
        {
            UpdateOutcome::Updated(record) => {
                self.record = record;
                Ok(true)
            }
            UpdateOutcome::Conflict { current } => {
                self.record.status = current;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repowiki_storage::MemoryJobStore;

    fn record() -> JobRecord {
        let mut metadata = Map::new();
        ProviderBinding {
            provider: "google".into(),
            model: "gemini-2.0-flash".into(),
            credential: CredentialRef::default_for("google"),
        }
        .write_to(&mut metadata);
        JobRecord::new_queued("https://example.com/a.git", "git", metadata)
    }

    #[test]
    fn test_stage_roundtrip() {
        for stage in &Stage::ALL {
            assert_eq!(Stage::parse(stage.as_str()).unwrap(), *stage);
        }
        assert_eq!(Stage::Embed.progress_label(), "embedding");
        assert_eq!(
            Stage::ALL.iter().map(|s| s.index()).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[test]
    fn test_repo_type_parse() {
        assert_eq!(RepoType::parse("GitHub").unwrap(), RepoType::Github);
        assert!(!RepoType::Local.is_remote());
        let err = RepoType::parse("svn").unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[test]
    fn test_credential_ref_parse() {
        assert_eq!(
            CredentialRef::parse("env:OPENAI_API_KEY").unwrap(),
            CredentialRef::Env("OPENAI_API_KEY".into())
        );
        assert_eq!(
            CredentialRef::parse("file:/run/secrets/key").unwrap(),
            CredentialRef::File(PathBuf::from("/run/secrets/key"))
        );
        assert_eq!(CredentialRef::parse("none").unwrap(), CredentialRef::None);
        assert!(CredentialRef::parse("sk-literal-secret").is_err());
        assert!(CredentialRef::parse("env:").is_err());
        assert!(CredentialRef::parse("env:BAD NAME").is_err());
    }

    #[test]
    fn test_credential_policy() {
        let policy = CredentialPolicy::default();
        assert!(policy.permits(&CredentialRef::Env("OPENAI_API_KEY".into())));
        assert!(policy.permits(&CredentialRef::None));
        assert!(!policy.permits(&CredentialRef::Env("AWS_SECRET_ACCESS_KEY".into())));
        assert!(!policy.permits(&CredentialRef::Env("PATH".into())));

        assert!(policy.permits(&CredentialRef::File("/run/secrets/openai".into())));
        assert!(!policy.permits(&CredentialRef::File("/etc/passwd".into())));
        assert!(!policy.permits(&CredentialRef::File("/run/secrets/../../etc/passwd".into())));
        assert!(!policy.permits(&CredentialRef::File("run/secrets/key".into())));
        assert!(!policy.permits(&CredentialRef::File("/run/secrets-other/key".into())));
    }

    #[test]
    fn test_credential_ref_resolve_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("key");
        std::fs::write(&path, "  secret-value\n").unwrap();

        let cred = CredentialRef::File(path);
        assert_eq!(cred.resolve().unwrap().as_deref(), Some("secret-value"));

        let missing = CredentialRef::File(dir.path().join("missing"));
        assert_eq!(missing.resolve().unwrap(), None);
        assert_eq!(CredentialRef::None.resolve().unwrap(), None);
    }

    #[test]
    fn test_binding_roundtrip() {
        let r = record();
        let binding = ProviderBinding::from_metadata(&r.metadata).unwrap();
        assert_eq!(binding.provider, "google");
        assert_eq!(binding.credential, CredentialRef::Env("GOOGLE_API_KEY".into()));
        assert_eq!(r.metadata_str("credential_ref"), Some("env:GOOGLE_API_KEY"));
    }

    #[test]
    fn test_transitions_from_queued() {
        let sm = JobStateMachine::new(record());
        let start = sm.start().unwrap();
        assert_eq!(start.expected, JobStatus::Queued);
        assert_eq!(start.patch.status, Some(JobStatus::Running));
        assert_eq!(start.patch.progress.as_deref(), Some("starting"));

        assert!(sm.complete(Map::new()).is_err());
        assert!(sm.fail("x").is_err());
    }

    #[test]
    fn test_terminal_states_have_no_transitions() {
        for status in [JobStatus::Completed, JobStatus::Failed] {
            let mut r = record();
            r.status = status;
            let sm = JobStateMachine::new(r);
            assert!(sm.start().is_err());
            assert!(sm.progress("x", Map::new()).is_err());
            assert!(sm.complete(Map::new()).is_err());
            assert!(sm.fail("x").is_err());
        }
    }

    #[tokio::test]
    async fn test_apply_lifecycle() {
        let store = MemoryJobStore::new();
        let r = record();
        store.create(r.clone()).await.unwrap();

        let mut sm = JobStateMachine::new(r);
        let t = sm.start().unwrap();
        assert!(sm.apply(&store, t).await.unwrap());
        assert_eq!(sm.record().status, JobStatus::Running);

        let mut extra = Map::new();
        extra.insert("commit".into(), Value::from("abc123"));
        let t = sm.progress("cloning", extra).unwrap();
        assert!(sm.apply(&store, t).await.unwrap());

        let t = sm.fail("clone failed: unreachable").unwrap();
        assert!(sm.apply(&store, t).await.unwrap());

        let stored = store.get(sm.record().id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.progress.as_deref(), Some("error"));
        assert_eq!(stored.error.as_deref(), Some("clone failed: unreachable"));
        assert_eq!(stored.metadata_str("commit"), Some("abc123"));
        assert_eq!(stored.metadata_str("provider"), Some("google"));
    }

    #[tokio::test]
    async fn test_apply_conflict_reports_false() {
        let store = MemoryJobStore::new();
        let r = record();
        store.create(r.clone()).await.unwrap();

        let mut first = JobStateMachine::new(r.clone());
        let mut second = JobStateMachine::new(r);

        let t1 = first.start().unwrap();
        let t2 = second.start().unwrap();
        assert!(first.apply(&store, t1).await.unwrap());
        assert!(!second.apply(&store, t2).await.unwrap());
        assert_eq!(second.record().status, JobStatus::Running);
    }
}

use crate::config::ExtractConfig;
use crate::error::{OrchestratorError, Result};
use crate::job::Stage;
use crate::pipeline::{StageContext, StageHandler, StageInput, StageMetrics, StageOutput};
use crate::stages::fetcher::{RepoSnapshot, SourceFile};
use async_trait::async_trait;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Bump when chunking output changes shape
const EXTRACT_VERSION: &str = "1";

/// Leading bytes inspected for NUL when detecting binaries
const BINARY_SNIFF_BYTES: usize = 8192;

pub const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".venv",
    "__pycache__",
    "build",
    "dist",
    "node_modules",
    "target",
    "vendor",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub path: String,
    /// Position within the file
    pub index: usize,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractOutput {
    /// Files that produced text, sorted
    pub files: Vec<String>,
    /// Ordered by `(path, index)`
    pub chunks: Vec<Chunk>,
    pub skipped: usize,
}

fn is_excluded(path: &str) -> bool {
    path.split('/')
        .rev()
        .skip(1)
        .any(|dir| EXCLUDED_DIRS.contains(&dir))
}

fn is_binary(bytes: &[u8]) -> bool {
    bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0)
}

/// Word windows of `size` words sharing `overlap` words with the previous one
pub fn chunk_words(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }
    let size = size.max(1);
    let step = size.saturating_sub(overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size).min(words.len());
        chunks.push(words[start..end].join(" "));
        if end == words.len() {
            break;
        }
        start += step;
    }
    chunks
}

fn extract_file(file: &SourceFile, config: &ExtractConfig) -> Option<Vec<Chunk>> {
    if is_excluded(&file.path)
        || file.bytes.len() as u64 > config.max_file_bytes
        || is_binary(&file.bytes)
    {
        return None;
    }
    let text = std::str::from_utf8(&file.bytes).ok()?;
    let chunks = chunk_words(text, config.chunk_size, config.chunk_overlap)
        .into_iter()
        .enumerate()
        .map(|(index, text)| Chunk {
            path: file.path.clone(),
            index,
            text,
        })
        .collect();
    Some(chunks)
}

pub fn extract(snapshot: &RepoSnapshot, config: &ExtractConfig) -> ExtractOutput {
    let per_file: Vec<Option<Vec<Chunk>>> = snapshot
        .files
        .par_iter()
        .map(|file| extract_file(file, config))
        .collect();

    let mut output = ExtractOutput::default();
    for (file, chunks) in snapshot.files.iter().zip(per_file) {
        match chunks {
            Some(chunks) if !chunks.is_empty() => {
                output.files.push(file.path.clone());
                output.chunks.extend(chunks);
            }
            Some(_) => {}
            None => output.skipped += 1,
        }
    }
    output
}

/// Extract stage: snapshot → text chunks (rayon over files)
pub struct ExtractStage {
    config: ExtractConfig,
}

impl ExtractStage {
    pub fn new(config: ExtractConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StageHandler for ExtractStage {
    fn stage(&self) -> Stage {
        Stage::Extract
    }

    fn config(&self, _ctx: &StageContext) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("version".to_string(), EXTRACT_VERSION.to_string()),
            ("max_file_bytes".to_string(), self.config.max_file_bytes.to_string()),
            ("chunk_size".to_string(), self.config.chunk_size.to_string()),
            ("chunk_overlap".to_string(), self.config.chunk_overlap.to_string()),
        ])
    }

    async fn execute(&self, input: StageInput, ctx: &StageContext) -> Result<StageOutput> {
        let snapshot: RepoSnapshot = bincode::deserialize(&input.payload)?;
        let config = self.config.clone();
        let files_in = snapshot.files.len();

        let output = tokio::task::spawn_blocking(move || extract(&snapshot, &config))
            .await
            .map_err(|e| OrchestratorError::internal(format!("extract task failed: {}", e)))?;

        info!(
            job_id = %ctx.job_id,
            files = output.files.len(),
            chunks = output.chunks.len(),
            skipped = output.skipped,
            "extracted text"
        );

        Ok(StageOutput {
            metrics: StageMetrics {
                items_in: files_in,
                items_out: output.chunks.len(),
                skipped: output.skipped,
            },
            cache_data: bincode::serialize(&output)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, bytes: &[u8]) -> SourceFile {
        SourceFile {
            path: path.to_string(),
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn test_chunk_words_overlap() {
        let text = (0..10).map(|i| i.to_string()).collect::<Vec<_>>().join(" ");
        let chunks = chunk_words(&text, 4, 2);
        assert_eq!(chunks, vec!["0 1 2 3", "2 3 4 5", "4 5 6 7", "6 7 8 9"]);
    }

    #[test]
    fn test_chunk_words_degenerate() {
        assert!(chunk_words("   \n\t", 4, 1).is_empty());
        assert_eq!(chunk_words("a b", 10, 3), vec!["a b"]);
        // overlap >= size still advances
        assert_eq!(chunk_words("a b c", 2, 5), vec!["a b", "b c"]);
    }

    #[test]
    fn test_exclusions() {
        assert!(is_excluded("node_modules/react/index.js"));
        assert!(is_excluded("crates/x/target/debug/build.rs"));
        assert!(!is_excluded("src/build.rs"));
        assert!(!is_excluded("README.md"));
    }

    #[test]
    fn test_extract_skips_binary_oversized_and_excluded() {
        let config = ExtractConfig {
            max_file_bytes: 64,
            chunk_size: 350,
            chunk_overlap: 100,
        };
        let snapshot = RepoSnapshot::new(
            "rev",
            vec![
                file("src/lib.rs", b"pub fn answer() -> u32 { 42 }"),
                file("logo.png", b"\x89PNG\r\n\x1a\n\0\0\0"),
                file("big.txt", &[b'a'; 100]),
                file("dist/bundle.js", b"var x = 1;"),
                file("empty.txt", b"   "),
            ],
        );

        let out = extract(&snapshot, &config);
        assert_eq!(out.files, vec!["src/lib.rs"]);
        assert_eq!(out.chunks.len(), 1);
        assert_eq!(out.skipped, 3);
    }

    #[test]
    fn test_extract_is_deterministic() {
        let snapshot = RepoSnapshot::new(
            "rev",
            (0..50)
                .map(|i| file(&format!("src/m{:02}.rs", i), format!("fn f{}() {{}}", i).as_bytes()))
                .collect(),
        );
        let a = bincode::serialize(&extract(&snapshot, &ExtractConfig::default())).unwrap();
        let b = bincode::serialize(&extract(&snapshot, &ExtractConfig::default())).unwrap();
        assert_eq!(a, b);
    }
}

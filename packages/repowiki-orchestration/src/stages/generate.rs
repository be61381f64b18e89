//! Generate stage
//!
//! Groups embedded chunks into wiki pages (one per top-level directory, root
//! files under "Overview"), picks the excerpts closest to each page's
//! centroid and asks the job's bound provider to write the page. This is the
//! only stage that calls a completion model.

use crate::config::RetryPolicy;
use crate::error::{OrchestratorError, Result};
use crate::job::Stage;
use crate::pipeline::{StageContext, StageHandler, StageInput, StageMetrics, StageOutput};
use crate::provider::{with_retry, CompletionRequest, ProviderError, ProviderRegistry};
use crate::stages::embed::{EmbedOutput, EmbeddedChunk};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use tracing::{debug, info};

const GENERATE_VERSION: &str = "1";
pub const MAX_PAGES: usize = 16;
pub const MAX_EXCERPTS: usize = 6;
const EXCERPT_CHARS: usize = 1200;

const ROOT_TITLE: &str = "Overview";
const OTHER_TITLE: &str = "Other";

const SYSTEM_PROMPT: &str = "You write concise technical documentation for a source code \
repository. Answer in Markdown, starting with a level-one heading.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WikiPage {
    pub id: String,
    pub title: String,
    pub files: Vec<String>,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WikiOutput {
    pub title: String,
    pub pages: Vec<WikiPage>,
}

/// Page before generation
#[derive(Debug)]
pub struct PagePlan<'a> {
    pub title: String,
    pub files: Vec<String>,
    pub excerpts: Vec<&'a EmbeddedChunk>,
}

fn section_of(path: &str) -> &str {
    match path.split_once('/') {
        Some((dir, _)) => dir,
        None => ROOT_TITLE,
    }
}

pub fn slug(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "page".to_string()
    } else {
        trimmed.to_string()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

fn centroid(chunks: &[&EmbeddedChunk]) -> Vec<f32> {
    let Some(dim) = chunks.first().map(|c| c.vector.len()) else {
        return Vec::new();
    };
    let mut sum = vec![0.0f32; dim];
    let mut n = 0usize;
    for chunk in chunks.iter().filter(|c| c.vector.len() == dim) {
        for (s, v) in sum.iter_mut().zip(&chunk.vector) {
            *s += v;
        }
        n += 1;
    }
    if n > 0 {
        sum.iter_mut().for_each(|s| *s /= n as f32);
    }
    sum
}

/// Chunks closest to the group centroid, returned in `(path, index)` order
fn pick_excerpts<'a>(chunks: &[&'a EmbeddedChunk]) -> Vec<&'a EmbeddedChunk> {
    let center = centroid(chunks);
    let mut scored: Vec<(f32, &EmbeddedChunk)> = chunks
        .iter()
        .map(|c| (cosine(&c.vector, &center), *c))
        .collect();
    scored.sort_by(|(sa, a), (sb, b)| {
        sb.total_cmp(sa)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.index.cmp(&b.index))
    });
    let mut picked: Vec<&EmbeddedChunk> = scored
        .into_iter()
        .take(MAX_EXCERPTS)
        .map(|(_, c)| c)
        .collect();
    picked.sort_by(|a, b| a.path.cmp(&b.path).then(a.index.cmp(&b.index)));
    picked
}

/// Group chunks into at most `MAX_PAGES` pages.
///
/// When there are more sections than that, the largest keep their own page
/// and the rest are folded into "Other".
pub fn plan_pages(items: &[EmbeddedChunk]) -> Vec<PagePlan<'_>> {
    let mut sections: BTreeMap<&str, Vec<&EmbeddedChunk>> = BTreeMap::new();
    for item in items {
        sections.entry(section_of(&item.path)).or_default().push(item);
    }

    let mut groups: Vec<(String, Vec<&EmbeddedChunk>)> = sections
        .into_iter()
        .map(|(name, chunks)| (name.to_string(), chunks))
        .collect();

    if groups.len() > MAX_PAGES {
        groups.sort_by(|(na, a), (nb, b)| b.len().cmp(&a.len()).then(na.cmp(nb)));
        let rest: Vec<&EmbeddedChunk> = groups
            .split_off(MAX_PAGES - 1)
            .into_iter()
            .flat_map(|(_, chunks)| chunks)
            .collect();
        groups.push((OTHER_TITLE.to_string(), rest));
    }

    // Overview first, Other last, sections alphabetical in between
    groups.sort_by_key(|(name, _)| {
        let rank = match name.as_str() {
            ROOT_TITLE => 0,
            OTHER_TITLE => 2,
            _ => 1,
        };
        (rank, name.clone())
    });

    groups
        .into_iter()
        .map(|(title, chunks)| {
            let files: BTreeSet<&str> = chunks.iter().map(|c| c.path.as_str()).collect();
            PagePlan {
                title,
                files: files.into_iter().map(str::to_string).collect(),
                excerpts: pick_excerpts(&chunks),
            }
        })
        .collect()
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}

pub fn build_prompt(repo_name: &str, plan: &PagePlan<'_>) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Repository: {}", repo_name);
    let _ = writeln!(prompt, "Section: {}", plan.title);
    prompt.push_str("Files:\n");
    for file in &plan.files {
        let _ = writeln!(prompt, "- {}", file);
    }
    prompt.push_str("\nExcerpts:\n");
    for excerpt in &plan.excerpts {
        let _ = writeln!(prompt, "--- {} (part {}) ---", excerpt.path, excerpt.index + 1);
        let _ = writeln!(prompt, "{}", truncate_chars(&excerpt.text, EXCERPT_CHARS));
    }
    prompt.push_str(
        "\nWrite the documentation page for this section: what it is for, \
         its main components and how they fit together.\n",
    );
    prompt
}

/// Generate stage: embedded chunks → wiki pages
pub struct GenerateStage {
    providers: ProviderRegistry,
    retry: RetryPolicy,
}

impl GenerateStage {
    pub fn new(providers: ProviderRegistry, retry: RetryPolicy) -> Self {
        Self { providers, retry }
    }
}

#[async_trait]
impl StageHandler for GenerateStage {
    fn stage(&self) -> Stage {
        Stage::Generate
    }

    fn config(&self, ctx: &StageContext) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("version".to_string(), GENERATE_VERSION.to_string()),
            ("provider".to_string(), ctx.binding.provider.clone()),
            ("model".to_string(), ctx.binding.model.clone()),
        ])
    }

    async fn execute(&self, input: StageInput, ctx: &StageContext) -> Result<StageOutput> {
        let embedded: EmbedOutput = bincode::deserialize(&input.payload)?;
        let title = ctx.repo.display_name();
        let plans = plan_pages(&embedded.items);

        if plans.is_empty() {
            debug!(job_id = %ctx.job_id, "nothing to document");
            let output = WikiOutput {
                title,
                pages: Vec::new(),
            };
            return Ok(StageOutput {
                metrics: StageMetrics::default(),
                cache_data: bincode::serialize(&output)?,
            });
        }

        let binding = &ctx.binding;
        let provider = self.providers.get(&binding.provider).ok_or_else(|| {
            OrchestratorError::validation(format!("unknown provider '{}'", binding.provider))
        })?;
        let credential = binding.credential.resolve()?;
        if provider.requires_credential() && credential.is_none() {
            return Err(ProviderError::missing_credential(provider.name()).into());
        }

        let mut pages = Vec::with_capacity(plans.len());
        for plan in &plans {
            let request = CompletionRequest::new(binding.model.clone(), build_prompt(&title, plan))
                .with_system(SYSTEM_PROMPT);
            let content = with_retry(self.retry, "generate", || {
                provider.complete(&request, credential.as_deref())
            })
            .await?;

            debug!(
                job_id = %ctx.job_id,
                page = %plan.title,
                chars = content.len(),
                "page generated"
            );
            pages.push(WikiPage {
                id: slug(&plan.title),
                title: plan.title.clone(),
                files: plan.files.clone(),
                content,
            });
        }

        info!(
            job_id = %ctx.job_id,
            provider = %binding.provider,
            model = %binding.model,
            pages = pages.len(),
            "wiki generated"
        );

        let output = WikiOutput { title, pages };
        Ok(StageOutput {
            metrics: StageMetrics {
                items_in: embedded.items.len(),
                items_out: output.pages.len(),
                skipped: 0,
            },
            cache_data: bincode::serialize(&output)?,
        })
    }
}

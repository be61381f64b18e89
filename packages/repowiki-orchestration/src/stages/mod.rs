// Stage implementations
pub mod clone;
pub mod embed;
pub mod extract;
pub mod fetcher;
pub mod generate;

// Re-exports
pub use clone::CloneStage;
pub use embed::{EmbedOutput, EmbedStage, EmbeddedChunk};
pub use extract::{Chunk, ExtractOutput, ExtractStage};
pub use fetcher::{
    DefaultFetcher, GitFetcher, LocalFetcher, MemoryFetcher, RepoFetcher, RepoRef, RepoSnapshot,
    SourceFile,
};
pub use generate::{GenerateStage, WikiOutput, WikiPage};

use crate::core::io::{load_json_or_default, save_json, Storage};
use crate::core::layout::{Artifact, BookLayout};
use crate::core::models::{ChapterId, ChapterSummary, ChapterSummaryArchive};
use crate::core::progress::ProgressSink;
use crate::services::completion::{CompletionService, Structured, SYSTEM_JSON_ONLY};
use crate::services::locator::Services;
use crate::services::prompts;
use anyhow::{Context, Result};
use log::{error, info};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct SummaryReply {
    teaser: String,
    synopsis: String,
}

impl Structured for SummaryReply {
    const STAGE: &'static str = "summary";

    fn schema_hint() -> &'static str {
        r#"{"teaser": "...", "synopsis": "..."}"#
    }

    fn validate(&self) -> Result<(), String> {
        if self.synopsis.trim().is_empty() {
            return Err("empty synopsis".to_string());
        }
        Ok(())
    }
}

/// Teaser and synopsis per chapter. The synopsis feeds script generation.
pub struct SummaryGenerator {
    fast: CompletionService,
    storage: Arc<dyn Storage>,
    layout: BookLayout,
}

impl SummaryGenerator {
    pub fn new(services: &Services, storage: Arc<dyn Storage>, layout: BookLayout) -> Self {
        Self {
            fast: services.fast.clone(),
            storage,
            layout,
        }
    }

    pub async fn load_archive(&self) -> Result<ChapterSummaryArchive> {
        load_json_or_default(self.storage.as_ref(), &self.layout.path(&Artifact::SummaryArchive)).await
    }

    async fn summarize(&self, chapter: ChapterId) -> Result<ChapterSummary> {
        let path = self.layout.path(&Artifact::ChapterText(chapter));
        let text = String::from_utf8(self.storage.read(&path).await?)
            .with_context(|| format!("{} is not UTF-8", path.display()))?;
        let prompt = prompts::chapter_summary(&text, SummaryReply::schema_hint());
        let reply: SummaryReply = self.fast.complete(SYSTEM_JSON_ONLY, &prompt).await?;
        Ok(ChapterSummary {
            chapter_id: chapter,
            teaser: reply.teaser,
            synopsis: reply.synopsis,
        })
    }

    /// Summarizes every chapter missing from the archive. A failing chapter
    /// is logged and left for the next run.
    pub async fn run(&self, progress: &dyn ProgressSink) -> Result<ChapterSummaryArchive> {
        let mut archive = self.load_archive().await?;
        let pending: Vec<ChapterId> = self
            .layout
            .chapters(self.storage.as_ref())
            .await?
            .into_iter()
            .filter(|c| !archive.summaries.contains_key(c))
            .collect();
        let total = pending.len().max(1) as f32;

        for (i, chapter) in pending.into_iter().enumerate() {
            progress.report(i as f32 / total, "Summaries", &format!("Summarizing {}", chapter));
            match self.summarize(chapter).await {
                Ok(summary) => {
                    archive.summaries.insert(chapter, summary);
                    save_json(
                        self.storage.as_ref(),
                        &self.layout.path(&Artifact::SummaryArchive),
                        &archive,
                    )
                    .await?;
                    info!("Summary saved for {}", chapter);
                }
                Err(e) => error!("Summary for {} failed: {:#}", chapter, e),
            }
        }

        progress.report(1.0, "Summaries", "Done");
        Ok(archive)
    }
}

//! Per-chapter scenario synthesis: script lines, then ambient tagging, then
//! emotion tagging, each stage checkpointed so a rerun resumes at the first
//! stage without a cache.

use crate::core::config::ScenarioConfig;
use crate::core::error::PipelineError;
use crate::core::io::{load_json, load_json_or_default, save_json, Storage};
use crate::core::layout::{Artifact, BookLayout};
use crate::core::models::{
    AmbientTransition, CharacterArchive, ChapterId, ChapterSummaryArchive, EntryId, LineKind, Scenario,
    ScenarioEntry, AMBIENT_NONE,
};
use crate::core::progress::ProgressSink;
use crate::services::completion::{CompletionService, Structured, SYSTEM_JSON_ONLY};
use crate::services::locator::Services;
use crate::services::prompts;
use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

// --- Completion replies ---

#[derive(Debug, Deserialize)]
struct RawLine {
    #[serde(rename = "type")]
    kind: LineKind,
    #[serde(default)]
    speaker: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct ScriptReply {
    scenario: Vec<RawLine>,
}

impl Structured for ScriptReply {
    const STAGE: &'static str = "script";

    fn schema_hint() -> &'static str {
        r#"{"scenario": [{"type": "narration", "speaker": "...", "text": "..."}, {"type": "dialogue", "speaker": "...", "text": "..."}]}"#
    }

    fn validate(&self) -> Result<(), String> {
        if self.scenario.iter().all(|l| l.text.trim().is_empty()) {
            return Err("script has no lines".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TransitionReply {
    #[serde(default)]
    transitions: Vec<AmbientTransition>,
}

impl Structured for TransitionReply {
    const STAGE: &'static str = "ambient";

    fn schema_hint() -> &'static str {
        r#"{"transitions": [{"entry_id": "line_0001", "ambient_id": "<id from the library>"}]}"#
    }
}

#[derive(Debug, Deserialize)]
struct EmotionReply {
    #[serde(default)]
    emotions: BTreeMap<String, String>,
}

impl Structured for EmotionReply {
    const STAGE: &'static str = "emotion";

    fn schema_hint() -> &'static str {
        r#"{"emotions": {"line_0002": "<emotion from the list>"}}"#
    }
}

/// One entry of `ambient_library.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmbientSound {
    pub id: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Serialize)]
struct LineView<'a> {
    id: &'a EntryId,
    speaker: &'a str,
    text: &'a str,
}

#[derive(Serialize)]
struct Profile<'a> {
    description: &'a str,
    in_this_chapter: &'a str,
}

fn line_views<'a>(entries: impl Iterator<Item = &'a ScenarioEntry>) -> String {
    let views: Vec<LineView> = entries
        .map(|e| LineView {
            id: &e.id,
            speaker: &e.speaker,
            text: &e.text,
        })
        .collect();
    serde_json::to_string_pretty(&views).unwrap_or_else(|_| "[]".to_string())
}

/// Run-length propagation: each entry carries the ambient of the latest
/// transition at or before it, `none` before the first.
pub fn resolve_ambient(entries: &mut [ScenarioEntry], transitions: &[AmbientTransition]) {
    let at: HashMap<&EntryId, &str> = transitions
        .iter()
        .map(|t| (&t.entry_id, t.ambient_id.as_str()))
        .collect();
    let mut current = AMBIENT_NONE.to_string();
    for entry in entries.iter_mut() {
        if let Some(ambient) = at.get(&entry.id) {
            current = ambient.to_string();
        }
        entry.ambient = current.clone();
    }
}

pub struct ScenarioOrchestrator {
    fast: CompletionService,
    powerful: CompletionService,
    storage: Arc<dyn Storage>,
    layout: BookLayout,
    config: ScenarioConfig,
}

impl ScenarioOrchestrator {
    pub fn new(services: &Services, storage: Arc<dyn Storage>, layout: BookLayout, config: ScenarioConfig) -> Self {
        Self {
            fast: services.fast.clone(),
            powerful: services.powerful.clone(),
            storage,
            layout,
            config,
        }
    }

    fn needs_emotion(&self, entry: &ScenarioEntry) -> bool {
        entry.kind == LineKind::Dialogue || entry.speaker != self.config.narrator_label
    }

    async fn load_cache(&self, enabled: bool, artifact: Artifact) -> Option<Scenario> {
        if !enabled {
            return None;
        }
        let path = self.layout.path(&artifact);
        match self.storage.exists(&path).await {
            Ok(true) => {}
            _ => return None,
        }
        match load_json::<Scenario>(self.storage.as_ref(), &path).await {
            Ok(s) if !s.entries.is_empty() => {
                info!("Resuming from {}", path.display());
                Some(s)
            }
            Ok(_) => {
                warn!("{} is empty; regenerating", path.display());
                None
            }
            Err(e) => {
                warn!("Unreadable cache {}: {:#}; regenerating", path.display(), e);
                None
            }
        }
    }

    async fn store_cache(&self, enabled: bool, artifact: Artifact, scenario: &Scenario) -> Result<()> {
        if enabled {
            save_json(self.storage.as_ref(), &self.layout.path(&artifact), scenario).await?;
        }
        Ok(())
    }

    async fn required_text(&self, artifact: Artifact, what: &str) -> Result<String> {
        let path = self.layout.path(&artifact);
        if !self.storage.exists(&path).await? {
            return Err(PipelineError::input_missing(format!("{} ({})", what, path.display())).into());
        }
        let bytes = self.storage.read(&path).await?;
        String::from_utf8(bytes).with_context(|| format!("{} is not UTF-8", path.display()))
    }

    // --- Stage A ---

    async fn generate_script(&self, chapter: ChapterId) -> Result<Scenario> {
        let text = self.required_text(Artifact::ChapterText(chapter), "chapter text").await?;
        let archive_json = self
            .required_text(Artifact::CharacterArchive, "character archive")
            .await?;
        let archive: CharacterArchive =
            serde_json::from_str(&archive_json).context("Failed to parse character archive")?;
        let summaries: ChapterSummaryArchive = load_json_or_default(
            self.storage.as_ref(),
            &self.layout.path(&Artifact::SummaryArchive),
        )
        .await?;

        let aliases: BTreeMap<String, Vec<String>> = archive
            .mentioned_in(&chapter)
            .into_iter()
            .map(|c| (c.name, c.aliases))
            .collect();
        let aliases_json = serde_json::to_string_pretty(&aliases)?;
        let synopsis = summaries.summaries.get(&chapter).map(|s| s.synopsis.as_str());

        let prompt = prompts::script(
            &text,
            &aliases_json,
            synopsis,
            &self.config.narrator_label,
            ScriptReply::schema_hint(),
        );
        let reply: ScriptReply = self.powerful.complete(SYSTEM_JSON_ONLY, &prompt).await?;

        let entries: Vec<ScenarioEntry> = reply
            .scenario
            .into_iter()
            .filter(|l| !l.text.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                let speaker = line.speaker.trim();
                ScenarioEntry {
                    id: EntryId::for_position(i),
                    kind: line.kind,
                    speaker: if speaker.is_empty() {
                        self.config.narrator_label.clone()
                    } else {
                        speaker.to_string()
                    },
                    text: line.text.trim().to_string(),
                    emotion: None,
                    ambient: AMBIENT_NONE.to_string(),
                    audio_file: None,
                }
            })
            .collect();

        info!("{}: script has {} lines", chapter, entries.len());
        Ok(Scenario { entries })
    }

    // --- Stage B ---

    async fn tag_ambient(&self, mut scenario: Scenario) -> Result<Scenario> {
        let library: Vec<AmbientSound> = load_json_or_default(
            self.storage.as_ref(),
            &self.layout.path(&Artifact::AmbientLibrary),
        )
        .await?;

        let transitions = if library.is_empty() {
            info!("Ambient library is empty; every line stays '{}'", AMBIENT_NONE);
            Vec::new()
        } else {
            let library_json = serde_json::to_string_pretty(&library)?;
            let prompt = prompts::ambient(
                &line_views(scenario.entries.iter()),
                &library_json,
                TransitionReply::schema_hint(),
            );
            match self.fast.complete::<TransitionReply>(SYSTEM_JSON_ONLY, &prompt).await {
                Ok(reply) => reply
                    .transitions
                    .into_iter()
                    .filter(|t| {
                        let known = t.ambient_id == AMBIENT_NONE || library.iter().any(|a| a.id == t.ambient_id);
                        if !known {
                            warn!("Ignoring unknown ambient '{}' at {}", t.ambient_id, t.entry_id);
                        }
                        known
                    })
                    .collect(),
                Err(e) => {
                    warn!("Ambient tagging failed, using '{}': {}", AMBIENT_NONE, e);
                    Vec::new()
                }
            }
        };

        resolve_ambient(&mut scenario.entries, &transitions);
        Ok(scenario)
    }

    // --- Stage C ---

    async fn tag_emotions(&self, chapter: ChapterId, mut scenario: Scenario) -> Result<Scenario> {
        let library: BTreeMap<String, Vec<String>> = load_json_or_default(
            self.storage.as_ref(),
            &self.layout.path(&Artifact::EmotionLibrary),
        )
        .await?;
        let vocabulary: Vec<&String> = library.keys().collect();

        let targets: Vec<&ScenarioEntry> = scenario.entries.iter().filter(|e| self.needs_emotion(e)).collect();
        let mut assigned: BTreeMap<String, String> = BTreeMap::new();

        if targets.is_empty() {
            return Ok(scenario);
        } else if vocabulary.is_empty() {
            info!("Emotion library is empty; all lines get '{}'", self.config.neutral_emotion);
        } else {
            let archive: CharacterArchive = load_json_or_default(
                self.storage.as_ref(),
                &self.layout.path(&Artifact::CharacterArchive),
            )
            .await?;
            let profiles: BTreeMap<&str, Profile> = archive
                .characters
                .iter()
                .filter(|c| targets.iter().any(|e| e.speaker == c.name))
                .map(|c| {
                    let mention = c.chapter_mentions.get(&chapter).map(String::as_str).unwrap_or("");
                    (
                        c.name.as_str(),
                        Profile {
                            description: &c.description,
                            in_this_chapter: mention,
                        },
                    )
                })
                .collect();

            let prompt = prompts::emotion(
                &line_views(targets.iter().copied()),
                &serde_json::to_string_pretty(&profiles)?,
                &serde_json::to_string(&vocabulary)?,
                EmotionReply::schema_hint(),
            );
            match self.fast.complete::<EmotionReply>(SYSTEM_JSON_ONLY, &prompt).await {
                Ok(reply) => assigned = reply.emotions,
                Err(e) => warn!("Emotion tagging failed, using '{}': {}", self.config.neutral_emotion, e),
            }
        }

        let needs: Vec<bool> = scenario.entries.iter().map(|e| self.needs_emotion(e)).collect();
        for (entry, needs) in scenario.entries.iter_mut().zip(needs) {
            if !needs {
                continue;
            }
            let emotion = match assigned.get(entry.id.as_str()) {
                Some(e) if library.contains_key(e) => e.clone(),
                Some(e) => {
                    warn!("Emotion '{}' for {} is not in the library", e, entry.id);
                    self.config.neutral_emotion.clone()
                }
                None => self.config.neutral_emotion.clone(),
            };
            entry.emotion = Some(emotion);
        }
        Ok(scenario)
    }

    async fn script_stage(&self, chapter: ChapterId, progress: &dyn ProgressSink) -> Result<Scenario> {
        let enabled = self.config.checkpoint_script;
        if let Some(cached) = self.load_cache(enabled, Artifact::RawScriptCache(chapter)).await {
            return Ok(cached);
        }
        progress.report(0.0, "Script", &format!("{}: generating script", chapter));
        let script = self.generate_script(chapter).await?;
        self.store_cache(enabled, Artifact::RawScriptCache(chapter), &script).await?;
        Ok(script)
    }

    async fn ambient_stage(&self, chapter: ChapterId, progress: &dyn ProgressSink) -> Result<Scenario> {
        let enabled = self.config.checkpoint_ambient;
        if let Some(cached) = self.load_cache(enabled, Artifact::AmbientCache(chapter)).await {
            return Ok(cached);
        }
        let script = self.script_stage(chapter, progress).await?;
        progress.report(0.4, "Ambient", &format!("{}: tagging ambient", chapter));
        let tagged = self.tag_ambient(script).await?;
        self.store_cache(enabled, Artifact::AmbientCache(chapter), &tagged).await?;
        Ok(tagged)
    }

    async fn emotion_stage(&self, chapter: ChapterId, progress: &dyn ProgressSink) -> Result<Scenario> {
        let enabled = self.config.checkpoint_emotion;
        if let Some(cached) = self.load_cache(enabled, Artifact::EmotionCache(chapter)).await {
            return Ok(cached);
        }
        let ambient = self.ambient_stage(chapter, progress).await?;
        progress.report(0.7, "Emotion", &format!("{}: tagging emotions", chapter));
        let tagged = self.tag_emotions(chapter, ambient).await?;
        self.store_cache(enabled, Artifact::EmotionCache(chapter), &tagged).await?;
        Ok(tagged)
    }

    async fn clear_caches(&self, chapter: ChapterId) -> Result<()> {
        for cache in [
            Artifact::RawScriptCache(chapter),
            Artifact::AmbientCache(chapter),
            Artifact::EmotionCache(chapter),
        ] {
            self.storage.delete(&self.layout.path(&cache)).await?;
        }
        Ok(())
    }

    /// Produces the finalized scenario for `chapter`, resuming from the
    /// latest stage cache. A scenario already on disk is returned as is.
    pub async fn run(&self, chapter: ChapterId, progress: &dyn ProgressSink) -> Result<Scenario> {
        let final_path = self.layout.path(&Artifact::Scenario(chapter));
        if self.storage.exists(&final_path).await? {
            info!("{} already has a scenario", chapter);
            let scenario = load_json(self.storage.as_ref(), &final_path).await?;
            // A run interrupted after saving leaves its caches behind.
            self.clear_caches(chapter).await?;
            return Ok(scenario);
        }

        let scenario = self.emotion_stage(chapter, progress).await?;

        save_json(self.storage.as_ref(), &final_path, &scenario).await?;
        self.clear_caches(chapter).await?;

        progress.report(1.0, "Scenario", &format!("{}: done", chapter));
        info!("Scenario saved for {}", chapter);
        Ok(scenario)
    }

    /// Runs every chapter in order. A failing chapter is logged and the
    /// next one is attempted. Returns the number of finalized chapters.
    pub async fn run_book(&self, progress: &dyn ProgressSink) -> Result<usize> {
        let chapters = self.layout.chapters(self.storage.as_ref()).await?;
        let mut done = 0;
        for chapter in chapters {
            match self.run(chapter, progress).await {
                Ok(_) => done += 1,
                Err(e) => error!("Scenario for {} failed: {:#}", chapter, e),
            }
        }
        Ok(done)
    }
}

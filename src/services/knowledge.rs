//! Character knowledge base: a registry grown chapter by chapter through
//! sparse patches proposed by the completion service.

use crate::core::error::PipelineError;
use crate::core::io::{load_json_or_default, save_json, Storage};
use crate::core::layout::{Artifact, BookLayout};
use crate::core::models::{Character, CharacterArchive, CharacterId, CharacterPatch, ChapterId};
use crate::core::progress::ProgressSink;
use crate::services::completion::{CompletionService, Structured, SYSTEM_JSON_ONLY};
use crate::services::locator::Services;
use crate::services::prompts;
use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub const PLACEHOLDER_TEXT: &str = "No description provided.";
pub const MENTION_PLACEHOLDER: &str = "Mentioned in this chapter without significant actions.";

// --- Completion replies ---

#[derive(Debug, Deserialize)]
struct ReconReply {
    #[serde(default)]
    mentioned_existing_character_ids: Vec<String>,
    #[serde(default)]
    newly_discovered_names: Vec<String>,
}

impl Structured for ReconReply {
    const STAGE: &'static str = "identify";

    fn schema_hint() -> &'static str {
        r#"{"mentioned_existing_character_ids": ["<id>", "..."], "newly_discovered_names": ["<name>", "..."]}"#
    }
}

/// A patch as the model writes it. Ids and chapter keys are checked when
/// converted, so one malformed field does not sink the whole reply.
#[derive(Debug, Deserialize)]
struct WirePatch {
    id: Option<String>,
    name: Option<String>,
    description: Option<String>,
    spoiler_free_description: Option<String>,
    aliases: Option<Vec<String>>,
    chapter_mentions: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct PatchReply {
    #[serde(default)]
    patches: Vec<WirePatch>,
}

impl Structured for PatchReply {
    const STAGE: &'static str = "propose_patches";

    fn schema_hint() -> &'static str {
        r#"{"patches": [{"id": "<existing id or null>", "name": "...", "description": "...", "spoiler_free_description": "...", "aliases": ["..."], "chapter_mentions": {"vol_1_chap_1": "..."}}]}"#
    }
}

impl WirePatch {
    fn into_patch(self) -> Option<CharacterPatch> {
        let id = match self.id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => match raw.parse() {
                Ok(uuid) => Some(CharacterId(uuid)),
                Err(_) => {
                    warn!("Dropping patch with malformed character id '{}'", raw);
                    return None;
                }
            },
            None => None,
        };
        let chapter_mentions = self.chapter_mentions.map(|mentions| {
            mentions
                .into_iter()
                .filter_map(|(key, summary)| match key.parse::<ChapterId>() {
                    Ok(chapter) => Some((chapter, summary)),
                    Err(_) => {
                        warn!("Dropping chapter mention under unknown key '{}'", key);
                        None
                    }
                })
                .collect()
        });
        Some(CharacterPatch {
            id,
            name: self.name,
            description: self.description,
            spoiler_free_description: self.spoiler_free_description,
            aliases: self.aliases,
            chapter_mentions,
        })
    }
}

// --- Registry mutation ---

/// Known characters a chapter refers to, plus names the registry lacks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identification {
    pub referenced: Vec<CharacterId>,
    pub new_names: Vec<String>,
}

impl Identification {
    pub fn is_empty(&self) -> bool {
        self.referenced.is_empty() && self.new_names.is_empty()
    }
}

fn merge_aliases(existing: &mut Vec<String>, added: Vec<String>) {
    let merged: BTreeSet<String> = existing
        .drain(..)
        .chain(added.into_iter().map(|a| a.trim().to_string()))
        .filter(|a| !a.is_empty())
        .collect();
    *existing = merged.into_iter().collect();
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Character {
    /// Merges an update patch. Id and first mention never change.
    fn merge(&mut self, patch: CharacterPatch) {
        if let Some(name) = non_empty(patch.name) {
            self.name = name;
        }
        if let Some(description) = non_empty(patch.description) {
            self.description = description;
        }
        if let Some(description) = non_empty(patch.spoiler_free_description) {
            self.spoiler_free_description = description;
        }
        if let Some(aliases) = patch.aliases {
            merge_aliases(&mut self.aliases, aliases);
        }
        if let Some(mentions) = patch.chapter_mentions {
            self.chapter_mentions.extend(mentions);
        }
    }

    fn create(name: String, patch: CharacterPatch, chapter: ChapterId) -> Self {
        let mut aliases = Vec::new();
        merge_aliases(&mut aliases, patch.aliases.unwrap_or_default());
        let mut chapter_mentions = patch.chapter_mentions.unwrap_or_default();
        chapter_mentions
            .entry(chapter)
            .or_insert_with(|| MENTION_PLACEHOLDER.to_string());

        Self {
            id: CharacterId::mint(),
            name,
            description: non_empty(patch.description).unwrap_or_else(|| PLACEHOLDER_TEXT.to_string()),
            spoiler_free_description: non_empty(patch.spoiler_free_description)
                .unwrap_or_else(|| PLACEHOLDER_TEXT.to_string()),
            aliases,
            first_mention: chapter.location(),
            chapter_mentions,
        }
    }
}

enum Target {
    Update(CharacterId),
    /// Creation request naming a character that already exists.
    Fold(CharacterId),
    Create(String),
    Skip,
}

impl CharacterArchive {
    fn target_of(&self, patch: &CharacterPatch, chapter: ChapterId) -> Target {
        if let Some(id) = patch.id {
            if self.get(&id).is_none() {
                warn!("Patch targets unknown character {}; skipped", id);
                return Target::Skip;
            }
            return Target::Update(id);
        }
        let Some(name) = non_empty(patch.name.clone()) else {
            warn!("Creation patch without a name in {}; skipped", chapter);
            return Target::Skip;
        };
        let name = name.trim().to_string();
        match self.find_by_name(&name) {
            Some(existing) => {
                warn!(
                    "Creation patch for '{}' matches an existing character; merged as update",
                    name
                );
                Target::Fold(existing.id)
            }
            None => Target::Create(name),
        }
    }

    fn update(&mut self, id: CharacterId, patch: CharacterPatch) {
        if let Some(character) = self.characters.iter_mut().find(|c| c.id == id) {
            character.merge(patch);
        }
    }

    /// Applies patches in order. Contract violations (creation without a
    /// name, update of an unknown id) are logged and skipped.
    pub fn apply(&mut self, patches: Vec<CharacterPatch>, chapter: ChapterId) {
        for mut patch in patches {
            match self.target_of(&patch, chapter) {
                Target::Skip => {}
                Target::Update(id) => self.update(id, patch),
                Target::Fold(id) => {
                    patch.name = None;
                    self.update(id, patch);
                }
                Target::Create(name) => {
                    let character = Character::create(name, patch, chapter);
                    info!("New character '{}' ({})", character.name, character.id);
                    self.characters.push(character);
                }
            }
        }
    }

    /// Records a bare mention for each referenced character that has none for
    /// `chapter`, so the chapter reads as processed on the next run.
    pub fn mark_mentioned_without_change(&mut self, referenced: &[CharacterId], chapter: ChapterId) {
        for character in self
            .characters
            .iter_mut()
            .filter(|c| referenced.contains(&c.id))
        {
            character
                .chapter_mentions
                .entry(chapter)
                .or_insert_with(|| MENTION_PLACEHOLDER.to_string());
        }
    }
}

// --- Pipeline ---

#[derive(Serialize)]
struct KnownCharacter<'a> {
    id: &'a CharacterId,
    name: &'a str,
    aliases: &'a [String],
}

pub struct KnowledgeBase {
    fast: CompletionService,
    powerful: CompletionService,
    storage: Arc<dyn Storage>,
    layout: BookLayout,
}

impl KnowledgeBase {
    pub fn new(services: &Services, storage: Arc<dyn Storage>, layout: BookLayout) -> Self {
        Self {
            fast: services.fast.clone(),
            powerful: services.powerful.clone(),
            storage,
            layout,
        }
    }

    pub async fn load_archive(&self) -> Result<CharacterArchive> {
        load_json_or_default(
            self.storage.as_ref(),
            &self.layout.path(&Artifact::CharacterArchive),
        )
        .await
    }

    async fn save_archive(&self, archive: &CharacterArchive) -> Result<()> {
        save_json(
            self.storage.as_ref(),
            &self.layout.path(&Artifact::CharacterArchive),
            archive,
        )
        .await
    }

    pub async fn identify(
        &self,
        chapter_text: &str,
        known: &CharacterArchive,
    ) -> Result<Identification, PipelineError> {
        let listing: Vec<KnownCharacter> = known
            .characters
            .iter()
            .map(|c| KnownCharacter {
                id: &c.id,
                name: &c.name,
                aliases: &c.aliases,
            })
            .collect();
        let known_json = serde_json::to_string_pretty(&listing).unwrap_or_else(|_| "[]".to_string());
        let prompt = prompts::character_recon(&known_json, chapter_text, ReconReply::schema_hint());

        let reply: ReconReply = self.fast.complete(SYSTEM_JSON_ONLY, &prompt).await?;

        let mut referenced = Vec::new();
        for raw in reply.mentioned_existing_character_ids {
            match raw.trim().parse().map(CharacterId) {
                Ok(id) if known.get(&id).is_some() => {
                    if !referenced.contains(&id) {
                        referenced.push(id);
                    }
                }
                _ => warn!("Ignoring unknown character id '{}' from recon", raw),
            }
        }

        let mut new_names: Vec<String> = Vec::new();
        for name in reply.newly_discovered_names {
            let name = name.trim().to_string();
            if name.is_empty() || new_names.contains(&name) {
                continue;
            }
            match known.find_by_name(&name) {
                Some(existing) if !referenced.contains(&existing.id) => referenced.push(existing.id),
                Some(_) => {}
                None => new_names.push(name),
            }
        }

        Ok(Identification {
            referenced,
            new_names,
        })
    }

    pub async fn propose_patches(
        &self,
        chapter_text: &str,
        referenced: &[Character],
        new_names: &[String],
        chapter: ChapterId,
    ) -> Result<Vec<CharacterPatch>, PipelineError> {
        let relevant_json = serde_json::to_string_pretty(referenced).unwrap_or_else(|_| "[]".to_string());
        let prompt = prompts::character_patches(
            &relevant_json,
            new_names,
            chapter_text,
            chapter,
            PatchReply::schema_hint(),
        );

        let reply: PatchReply = self.powerful.complete(SYSTEM_JSON_ONLY, &prompt).await?;
        Ok(reply
            .patches
            .into_iter()
            .filter_map(WirePatch::into_patch)
            .collect())
    }

    /// Scans every chapter in order, skipping those already processed. The
    /// archive is saved after each chapter.
    pub async fn process_book(&self, progress: &dyn ProgressSink) -> Result<CharacterArchive> {
        let mut archive = self.load_archive().await?;
        let chapters = self.layout.chapters(self.storage.as_ref()).await?;
        let total = chapters.len().max(1) as f32;

        for (i, chapter) in chapters.iter().copied().enumerate() {
            progress.report(i as f32 / total, "Characters", &format!("Analyzing {}", chapter));

            if archive.is_chapter_processed(&chapter) {
                info!("{} already processed, skipping", chapter);
                continue;
            }

            let path = self.layout.path(&Artifact::ChapterText(chapter));
            if !self.storage.exists(&path).await? {
                return Err(PipelineError::input_missing(format!("chapter text {}", path.display())).into());
            }
            let bytes = self.storage.read(&path).await?;
            let text = String::from_utf8(bytes).with_context(|| format!("{} is not UTF-8", path.display()))?;
            if text.trim().is_empty() {
                warn!("{} is empty, skipping", chapter);
                continue;
            }

            let found = self
                .identify(&text, &archive)
                .await
                .with_context(|| format!("Character recon failed for {}", chapter))?;
            if found.is_empty() {
                info!("No characters found in {}", chapter);
                continue;
            }

            let referenced: Vec<Character> = found
                .referenced
                .iter()
                .filter_map(|id| archive.get(id).cloned())
                .collect();
            let patches = self
                .propose_patches(&text, &referenced, &found.new_names, chapter)
                .await
                .with_context(|| format!("Character patching failed for {}", chapter))?;

            info!("{}: {} patch(es)", chapter, patches.len());
            archive.apply(patches, chapter);
            if !archive.is_chapter_processed(&chapter) {
                archive.mark_mentioned_without_change(&found.referenced, chapter);
            }

            self.save_archive(&archive).await?;
        }

        progress.report(1.0, "Characters", "Done");
        Ok(archive)
    }
}

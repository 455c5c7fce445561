//! Records shared by the knowledge base, the scenario orchestrator and the
//! timeline assembler. Everything here round-trips through JSON on disk.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// --- Identifiers ---

/// Volume/chapter pair. Serialized as `vol_<V>_chap_<C>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChapterId {
    pub volume: u32,
    pub chapter: u32,
}

impl ChapterId {
    pub fn new(volume: u32, chapter: u32) -> Self {
        Self { volume, chapter }
    }

    /// Human-readable location used as a character's first mention.
    pub fn location(&self) -> String {
        format!("Volume {}, Chapter {}", self.volume, self.chapter)
    }
}

impl fmt::Display for ChapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vol_{}_chap_{}", self.volume, self.chapter)
    }
}

impl FromStr for ChapterId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("vol_")
            .ok_or_else(|| anyhow!("Invalid chapter id: {}", s))?;
        let (vol, chap) = rest
            .split_once("_chap_")
            .ok_or_else(|| anyhow!("Invalid chapter id: {}", s))?;
        Ok(Self {
            volume: vol.parse().with_context(|| format!("Bad volume in {}", s))?,
            chapter: chap.parse().with_context(|| format!("Bad chapter in {}", s))?,
        })
    }
}

impl Serialize for ChapterId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChapterId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacterId(pub Uuid);

impl CharacterId {
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CharacterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// --- Characters ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: CharacterId,
    pub name: String,
    /// Full description; may contain spoilers.
    pub description: String,
    pub spoiler_free_description: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Frozen at creation.
    pub first_mention: String,
    #[serde(default)]
    pub chapter_mentions: BTreeMap<ChapterId, String>,
}

impl Character {
    pub fn is_mentioned_in(&self, chapter: &ChapterId) -> bool {
        self.chapter_mentions.contains_key(chapter)
    }
}

/// Sparse update. Unset fields never overwrite existing values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CharacterId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spoiler_free_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_mentions: Option<BTreeMap<ChapterId, String>>,
}

/// Whole-book character registry. Stored as a bare JSON array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacterArchive {
    pub characters: Vec<Character>,
}

impl CharacterArchive {
    pub fn get(&self, id: &CharacterId) -> Option<&Character> {
        self.characters.iter().find(|c| &c.id == id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Character> {
        self.characters.iter().find(|c| c.name == name)
    }

    /// A chapter counts as processed once any character mentions it.
    pub fn is_chapter_processed(&self, chapter: &ChapterId) -> bool {
        self.characters.iter().any(|c| c.is_mentioned_in(chapter))
    }

    pub fn mentioned_in(&self, chapter: &ChapterId) -> Vec<Character> {
        self.characters
            .iter()
            .filter(|c| c.is_mentioned_in(chapter))
            .cloned()
            .collect()
    }
}

// --- Summaries ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterSummary {
    pub chapter_id: ChapterId,
    /// Spoiler-free teaser.
    pub teaser: String,
    /// Spoiler-bearing synopsis used as model context.
    pub synopsis: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChapterSummaryArchive {
    pub summaries: BTreeMap<ChapterId, ChapterSummary>,
}

// --- Scenario ---

pub const AMBIENT_NONE: &str = "none";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    Narration,
    Dialogue,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub String);

impl EntryId {
    /// Ids are positional at mint time and never reassigned afterwards.
    pub fn for_position(index: usize) -> Self {
        Self(format!("line_{:04}", index + 1))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn default_ambient() -> String {
    AMBIENT_NONE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioEntry {
    pub id: EntryId,
    #[serde(rename = "type")]
    pub kind: LineKind,
    pub speaker: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
    #[serde(default = "default_ambient")]
    pub ambient: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_file: Option<String>,
}

/// One chapter's script in canonical narrative order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scenario {
    pub entries: Vec<ScenarioEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbientTransition {
    pub entry_id: EntryId,
    pub ambient_id: String,
}

// --- Timeline ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMapEntry {
    pub entry_id: EntryId,
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub speaker: String,
    pub ambient: String,
}

impl SyncMapEntry {
    pub fn span_ms(&self) -> u64 {
        self.end_ms - self.start_ms
    }
}

// --- Speech rendering ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// One rendered line. The list written per chapter is also the alternate
/// filename map the timeline assembler consults first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleEntry {
    pub entry_id: EntryId,
    pub audio_file: String,
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub duration_ms: u64,
    #[serde(default)]
    pub words: Vec<WordTiming>,
}

fn default_narrator_voice() -> String {
    "narrator_default".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookManifest {
    pub book_name: String,
    #[serde(default)]
    pub character_voices: BTreeMap<CharacterId, String>,
    #[serde(default = "default_narrator_voice")]
    pub default_narrator_voice: String,
}

impl BookManifest {
    pub fn new(book_name: &str) -> Self {
        Self {
            book_name: book_name.to_string(),
            character_voices: BTreeMap::new(),
            default_narrator_voice: default_narrator_voice(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chapter_id_string_form() {
        let id = ChapterId::new(2, 15);
        assert_eq!(id.to_string(), "vol_2_chap_15");
        assert_eq!("vol_2_chap_15".parse::<ChapterId>().unwrap(), id);
        assert!("chapter_15".parse::<ChapterId>().is_err());
        assert!("vol_x_chap_1".parse::<ChapterId>().is_err());
    }

    #[test]
    fn test_chapter_mentions_serialize_as_string_keys() {
        let mut mentions = BTreeMap::new();
        mentions.insert(ChapterId::new(1, 3), "Arrives at the inn.".to_string());
        let json = serde_json::to_string(&mentions).unwrap();
        assert_eq!(json, r#"{"vol_1_chap_3":"Arrives at the inn."}"#);

        let back: BTreeMap<ChapterId, String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mentions);
    }

    #[test]
    fn test_scenario_entry_defaults_ambient_to_none() {
        let json = r#"{"id": "line_0001", "type": "narration", "speaker": "Narrator", "text": "Dusk."}"#;
        let entry: ScenarioEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.ambient, AMBIENT_NONE);
        assert_eq!(entry.kind, LineKind::Narration);
        assert!(entry.emotion.is_none());
    }

    #[test]
    fn test_chapter_ordering_is_numeric() {
        let mut ids = vec![
            ChapterId::new(2, 1),
            ChapterId::new(1, 10),
            ChapterId::new(1, 2),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![ChapterId::new(1, 2), ChapterId::new(1, 10), ChapterId::new(2, 1)]
        );
    }
}

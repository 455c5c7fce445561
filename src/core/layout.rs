//! Where every artifact of a book lives on disk.
//!
//! Paths are resolved from an [`Artifact`] tag through one match, so adding an
//! artifact means adding one variant and one row below.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::core::config::Config;
use crate::core::io::Storage;
use crate::core::models::ChapterId;

const BOOKS_DIR: &str = "books";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    // Book level
    CharacterArchive,
    SummaryArchive,
    Manifest,
    // Chapter level
    ChapterText(ChapterId),
    RawScriptCache(ChapterId),
    AmbientCache(ChapterId),
    EmotionCache(ChapterId),
    Scenario(ChapterId),
    Subtitles(ChapterId),
    AudioDir(ChapterId),
    PlaybackAudio(ChapterId),
    SyncMap(ChapterId),
    // Shared assets
    AmbientLibrary,
    EmotionLibrary,
    EmotionReference(String),
    VoiceReference(String),
    PronunciationDictionary,
}

#[derive(Debug, Clone)]
pub struct BookLayout {
    pub book_name: String,
    input_root: PathBuf,
    output_root: PathBuf,
}

impl BookLayout {
    pub fn new(book_name: &str, input_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            book_name: book_name.to_string(),
            input_root: input_root.into(),
            output_root: output_root.into(),
        }
    }

    pub fn from_config(config: &Config, book_name: &str) -> Self {
        Self::new(book_name, &config.input_folder, &config.output_folder)
    }

    pub fn book_dir(&self) -> PathBuf {
        self.input_root.join(BOOKS_DIR).join(&self.book_name)
    }

    pub fn book_output_dir(&self) -> PathBuf {
        self.output_root.join(&self.book_name)
    }

    pub fn path(&self, artifact: &Artifact) -> PathBuf {
        let out = self.book_output_dir();
        let chapter_dir = |c: &ChapterId| out.join(c.to_string());
        let emotion_dir = self.input_root.join("emotion_references");

        match artifact {
            Artifact::CharacterArchive => out.join("character_archive.json"),
            Artifact::SummaryArchive => out.join("chapter_summaries.json"),
            Artifact::Manifest => out.join("manifest.json"),

            Artifact::ChapterText(c) => self
                .book_dir()
                .join(format!("vol_{}", c.volume))
                .join(format!("chapter_{}.txt", c.chapter)),
            Artifact::RawScriptCache(c) => chapter_dir(c).join("cache_raw_scenario.json"),
            Artifact::AmbientCache(c) => chapter_dir(c).join("cache_ambient.json"),
            Artifact::EmotionCache(c) => chapter_dir(c).join("cache_emotion.json"),
            Artifact::Scenario(c) => chapter_dir(c).join("scenario.json"),
            Artifact::Subtitles(c) => chapter_dir(c).join("subtitles.json"),
            Artifact::AudioDir(c) => chapter_dir(c).join("audio"),
            Artifact::PlaybackAudio(c) => chapter_dir(c).join("audio").join("full_chapter.wav"),
            Artifact::SyncMap(c) => chapter_dir(c).join("audio").join("full_chapter_map.json"),

            Artifact::AmbientLibrary => self.input_root.join("ambient_library.json"),
            Artifact::EmotionLibrary => emotion_dir.join("emotion_reference_library.json"),
            Artifact::EmotionReference(file) => emotion_dir.join(file),
            Artifact::VoiceReference(voice) => {
                self.input_root.join("voices").join(voice).join("reference.wav")
            }
            Artifact::PronunciationDictionary => self.input_root.join("pronunciation_dictionary.json"),
        }
    }

    /// All chapters of the book in narrative order (numeric, so `chapter_10`
    /// follows `chapter_2`).
    pub async fn chapters(&self, storage: &dyn Storage) -> Result<Vec<ChapterId>> {
        let mut volumes: Vec<(u32, PathBuf)> = storage
            .list(&self.book_dir())
            .await?
            .into_iter()
            .filter(|p| p.is_dir())
            .filter_map(|p| numbered(&p, "vol_", None).map(|n| (n, p)))
            .collect();
        volumes.sort_by_key(|(n, _)| *n);

        let mut chapters = Vec::new();
        for (volume, vol_path) in volumes {
            let mut in_volume: Vec<(u32, PathBuf)> = storage
                .list(&vol_path)
                .await?
                .into_iter()
                .filter(|p| p.is_file())
                .filter_map(|p| numbered(&p, "chapter_", Some("txt")).map(|n| (n, p)))
                .collect();
            in_volume.sort_by_key(|(n, _)| *n);
            chapters.extend(in_volume.into_iter().map(|(c, _)| ChapterId::new(volume, c)));
        }
        Ok(chapters)
    }

    pub async fn chapter_status(&self, storage: &dyn Storage, chapter: ChapterId) -> Result<ChapterStatus> {
        let has_audio = !storage
            .list(&self.path(&Artifact::AudioDir(chapter)))
            .await?
            .is_empty();
        Ok(ChapterStatus {
            chapter,
            has_scenario: storage.exists(&self.path(&Artifact::Scenario(chapter))).await?,
            has_subtitles: storage.exists(&self.path(&Artifact::Subtitles(chapter))).await?,
            has_audio,
        })
    }
}

/// Parses `<prefix><N>[.<ext>]` file or directory names.
fn numbered(path: &Path, prefix: &str, ext: Option<&str>) -> Option<u32> {
    let name = match ext {
        Some(e) => {
            if path.extension()?.to_str()? != e {
                return None;
            }
            path.file_stem()?.to_str()?
        }
        None => path.file_name()?.to_str()?,
    };
    name.strip_prefix(prefix)?.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterStatus {
    pub chapter: ChapterId,
    pub has_scenario: bool,
    pub has_subtitles: bool,
    pub has_audio: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use std::fs;

    #[test]
    fn test_chapter_paths() {
        let layout = BookLayout::new("dune", "in", "out");
        let c = ChapterId::new(1, 4);
        assert_eq!(
            layout.path(&Artifact::ChapterText(c)),
            PathBuf::from("in/books/dune/vol_1/chapter_4.txt")
        );
        assert_eq!(
            layout.path(&Artifact::Scenario(c)),
            PathBuf::from("out/dune/vol_1_chap_4/scenario.json")
        );
        assert_eq!(
            layout.path(&Artifact::SyncMap(c)),
            PathBuf::from("out/dune/vol_1_chap_4/audio/full_chapter_map.json")
        );
        assert_eq!(
            layout.path(&Artifact::VoiceReference("alto".into())),
            PathBuf::from("in/voices/alto/reference.wav")
        );
    }

    #[tokio::test]
    async fn test_chapters_are_in_natural_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = BookLayout::new("book", dir.path().join("in"), dir.path().join("out"));
        let book = layout.book_dir();
        for (v, c) in [(1, 1), (1, 2), (1, 10), (2, 1), (10, 1)] {
            let vol = book.join(format!("vol_{}", v));
            fs::create_dir_all(&vol)?;
            fs::write(vol.join(format!("chapter_{}.txt", c)), "text")?;
        }
        fs::write(book.join("vol_1").join("notes.md"), "ignored")?;
        fs::create_dir_all(book.join("extras"))?;

        let chapters = layout.chapters(&NativeStorage::new()).await?;
        assert_eq!(
            chapters,
            vec![
                ChapterId::new(1, 1),
                ChapterId::new(1, 2),
                ChapterId::new(1, 10),
                ChapterId::new(2, 1),
                ChapterId::new(10, 1),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_chapter_status() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = BookLayout::new("book", dir.path().join("in"), dir.path().join("out"));
        let storage = NativeStorage::new();
        let c = ChapterId::new(1, 1);

        let status = layout.chapter_status(&storage, c).await?;
        assert!(!status.has_scenario && !status.has_subtitles && !status.has_audio);

        storage.write(&layout.path(&Artifact::Scenario(c)), b"[]").await?;
        storage
            .write(&layout.path(&Artifact::AudioDir(c)).join("line_0001.wav"), b"x")
            .await?;
        let status = layout.chapter_status(&storage, c).await?;
        assert!(status.has_scenario && status.has_audio && !status.has_subtitles);
        Ok(())
    }
}

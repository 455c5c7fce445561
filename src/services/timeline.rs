//! Concatenates per-line audio into one playback stream and records where
//! each script line sits in it.

use crate::core::config::TimelineConfig;
use crate::core::error::PipelineError;
use crate::core::io::{load_json, save_json, Storage};
use crate::core::layout::{Artifact, BookLayout};
use crate::core::models::{ChapterId, EntryId, Scenario, ScenarioEntry, SubtitleEntry, SyncMapEntry};
use crate::utils::audio::{decode_file, encode_wav, PcmClip};
use anyhow::Result;
use log::{info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    /// `None` when no line had audio; the map is then text only.
    pub audio: Option<PathBuf>,
    pub entries: Vec<SyncMapEntry>,
    pub duration_ms: u64,
}

impl Timeline {
    fn from_entries(audio: Option<PathBuf>, entries: Vec<SyncMapEntry>) -> Self {
        let duration_ms = entries.iter().map(|e| e.end_ms).max().unwrap_or(0);
        Self {
            audio,
            entries,
            duration_ms,
        }
    }
}

pub struct TimelineAssembler {
    storage: Arc<dyn Storage>,
    layout: BookLayout,
    extensions: Vec<String>,
}

fn frames_to_ms(frames: u64, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    frames * 1000 / sample_rate as u64
}

impl TimelineAssembler {
    pub fn new(storage: Arc<dyn Storage>, layout: BookLayout, config: &TimelineConfig) -> Self {
        Self {
            storage,
            layout,
            extensions: config.extensions.clone(),
        }
    }

    async fn first_existing(&self, candidates: Vec<PathBuf>) -> Option<PathBuf> {
        for path in candidates {
            if self.storage.exists(&path).await.unwrap_or(false) {
                return Some(path);
            }
        }
        None
    }

    fn with_extensions(&self, audio_dir: &Path, stem: &str) -> Vec<PathBuf> {
        self.extensions
            .iter()
            .map(|ext| audio_dir.join(format!("{}{}", stem, ext)))
            .collect()
    }

    /// Tries the alternate map, then the entry's own filename, then a name
    /// derived from the entry id. Named files also match on stem.
    pub async fn resolve_audio(
        &self,
        audio_dir: &Path,
        entry: &ScenarioEntry,
        alternate: &HashMap<EntryId, String>,
    ) -> Option<PathBuf> {
        let named = [alternate.get(&entry.id), entry.audio_file.as_ref()];
        for name in named.into_iter().flatten() {
            let exact = audio_dir.join(name);
            let mut candidates = vec![exact.clone()];
            if let Some(stem) = exact.file_stem().and_then(|s| s.to_str()) {
                candidates.extend(self.with_extensions(audio_dir, stem));
            }
            if let Some(found) = self.first_existing(candidates).await {
                return Some(found);
            }
        }
        self.first_existing(self.with_extensions(audio_dir, entry.id.as_str()))
            .await
    }

    async fn decode(path: PathBuf) -> Result<PcmClip> {
        tokio::task::spawn_blocking(move || decode_file(&path)).await?
    }

    /// Walks the scenario in order. Resolved lines advance the offset by
    /// their length; unresolved ones get a zero-length span at the current
    /// offset. The first resolved line fixes the stream format and later
    /// lines are converted to it. Returns `None` for the stream when nothing
    /// resolved.
    pub async fn assemble(
        &self,
        scenario: &Scenario,
        audio_dir: &Path,
        alternate: &HashMap<EntryId, String>,
    ) -> Result<(Option<PcmClip>, Vec<SyncMapEntry>)> {
        let mut stream: Option<PcmClip> = None;
        let mut sync_map = Vec::with_capacity(scenario.entries.len());

        for entry in &scenario.entries {
            let start_ms = stream
                .as_ref()
                .map(|s| frames_to_ms(s.frames(), s.sample_rate))
                .unwrap_or(0);

            let clip = match self.resolve_audio(audio_dir, entry, alternate).await {
                Some(path) => match Self::decode(path.clone()).await {
                    Ok(clip) => Some(clip),
                    Err(e) => {
                        warn!("Cannot decode {}: {:#}", path.display(), e);
                        None
                    }
                },
                None => {
                    warn!("No audio for {}", entry.id);
                    None
                }
            };

            if let Some(clip) = clip {
                let out = stream.get_or_insert_with(|| PcmClip::empty(clip.sample_rate, clip.channels));
                let (rate, channels) = (out.sample_rate, out.channels);
                let converted = if clip.same_format(out) {
                    Ok(clip)
                } else {
                    tokio::task::spawn_blocking(move || clip.convert_to(rate, channels)).await?
                };
                match converted.and_then(|c| out.append(&c)) {
                    Ok(()) => {}
                    Err(e) => warn!("Skipping audio for {}: {:#}", entry.id, e),
                }
            }

            let end_ms = stream
                .as_ref()
                .map(|s| frames_to_ms(s.frames(), s.sample_rate))
                .unwrap_or(0);
            sync_map.push(SyncMapEntry {
                entry_id: entry.id.clone(),
                text: entry.text.clone(),
                start_ms,
                end_ms,
                speaker: entry.speaker.clone(),
                ambient: entry.ambient.clone(),
            });
        }

        Ok((stream, sync_map))
    }

    async fn alternate_names(&self, chapter: ChapterId) -> HashMap<EntryId, String> {
        let path = self.layout.path(&Artifact::Subtitles(chapter));
        if !self.storage.exists(&path).await.unwrap_or(false) {
            return HashMap::new();
        }
        match load_json::<Vec<SubtitleEntry>>(self.storage.as_ref(), &path).await {
            Ok(subtitles) => subtitles
                .into_iter()
                .map(|s| (s.entry_id, s.audio_file))
                .collect(),
            Err(e) => {
                warn!("Ignoring unreadable subtitles {}: {:#}", path.display(), e);
                HashMap::new()
            }
        }
    }

    async fn cached(&self, chapter: ChapterId) -> Option<Timeline> {
        let audio = self.layout.path(&Artifact::PlaybackAudio(chapter));
        let map = self.layout.path(&Artifact::SyncMap(chapter));
        if !self.storage.exists(&audio).await.unwrap_or(false) || !self.storage.exists(&map).await.unwrap_or(false) {
            return None;
        }
        match load_json::<Vec<SyncMapEntry>>(self.storage.as_ref(), &map).await {
            Ok(entries) => Some(Timeline::from_entries(Some(audio), entries)),
            Err(e) => {
                warn!("Playback cache for {} unreadable, rebuilding: {:#}", chapter, e);
                None
            }
        }
    }

    /// Playback stream and sync map for a chapter, served from cache unless
    /// `rebuild` is set or the cache is missing or unreadable.
    pub async fn playback(&self, chapter: ChapterId, rebuild: bool) -> Result<Timeline> {
        if !rebuild {
            if let Some(timeline) = self.cached(chapter).await {
                info!("Serving cached playback for {}", chapter);
                return Ok(timeline);
            }
        }

        let scenario_path = self.layout.path(&Artifact::Scenario(chapter));
        if !self.storage.exists(&scenario_path).await? {
            return Err(PipelineError::input_missing(format!("scenario ({})", scenario_path.display())).into());
        }
        let scenario: Scenario = load_json(self.storage.as_ref(), &scenario_path).await?;
        let alternate = self.alternate_names(chapter).await;
        let audio_dir = self.layout.path(&Artifact::AudioDir(chapter));

        let (stream, entries) = self.assemble(&scenario, &audio_dir, &alternate).await?;
        let Some(stream) = stream else {
            warn!("No audio resolved for {}; returning text-only map", chapter);
            for stale in [Artifact::PlaybackAudio(chapter), Artifact::SyncMap(chapter)] {
                self.storage.delete(&self.layout.path(&stale)).await?;
            }
            return Ok(Timeline::from_entries(None, entries));
        };

        let audio_path = self.layout.path(&Artifact::PlaybackAudio(chapter));
        let bytes = tokio::task::spawn_blocking(move || encode_wav(&stream)).await??;
        self.storage.write(&audio_path, &bytes).await?;
        save_json(
            self.storage.as_ref(),
            &self.layout.path(&Artifact::SyncMap(chapter)),
            &entries,
        )
        .await?;

        info!("Playback assembled for {} ({} lines)", chapter, entries.len());
        Ok(Timeline::from_entries(Some(audio_path), entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::is_input_missing;
    use crate::core::io::NativeStorage;
    use crate::core::models::{LineKind, AMBIENT_NONE};
    use crate::utils::audio::tests::write_silent_wav;
    use crate::utils::audio::wav_duration_ms;
    use std::fs;

    fn line(n: usize) -> ScenarioEntry {
        ScenarioEntry {
            id: EntryId::for_position(n),
            kind: LineKind::Dialogue,
            speaker: "Elena".to_string(),
            text: format!("Line {}", n + 1),
            emotion: Some("neutral".to_string()),
            ambient: AMBIENT_NONE.to_string(),
            audio_file: None,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: BookLayout,
        chapter: ChapterId,
        audio_dir: PathBuf,
        assembler: TimelineAssembler,
    }

    fn fixture(scenario: &Scenario) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = BookLayout::new("book", dir.path().join("in"), dir.path().join("out"));
        let chapter = ChapterId::new(1, 1);
        let audio_dir = layout.path(&Artifact::AudioDir(chapter));
        fs::create_dir_all(&audio_dir).unwrap();
        fs::write(
            layout.path(&Artifact::Scenario(chapter)),
            serde_json::to_string(scenario).unwrap(),
        )
        .unwrap();
        let assembler = TimelineAssembler::new(
            Arc::new(NativeStorage::new()),
            layout.clone(),
            &TimelineConfig::default(),
        );
        Fixture {
            _dir: dir,
            layout,
            chapter,
            audio_dir,
            assembler,
        }
    }

    fn spans(timeline: &Timeline) -> Vec<(u64, u64)> {
        timeline.entries.iter().map(|e| (e.start_ms, e.end_ms)).collect()
    }

    #[tokio::test]
    async fn test_missing_line_gets_zero_span() -> Result<()> {
        let scenario = Scenario {
            entries: vec![line(0), line(1), line(2)],
        };
        let fx = fixture(&scenario);
        write_silent_wav(&fx.audio_dir.join("line_0001.wav"), 2000, 16000, 1);
        write_silent_wav(&fx.audio_dir.join("line_0003.wav"), 1500, 16000, 1);

        let timeline = fx.assembler.playback(fx.chapter, false).await?;
        assert_eq!(spans(&timeline), vec![(0, 2000), (2000, 2000), (2000, 3500)]);

        let audio = timeline.audio.clone().unwrap();
        let covered: u64 = timeline.entries.iter().map(|e| e.span_ms()).sum();
        assert_eq!(covered, wav_duration_ms(&audio)?);
        assert_eq!(timeline.duration_ms, 3500);
        assert!(fx.layout.path(&Artifact::SyncMap(fx.chapter)).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_resolution_order_and_stem_fallback() -> Result<()> {
        let mut second = line(1);
        second.audio_file = Some("two.mp3".to_string());
        let scenario = Scenario {
            entries: vec![line(0), second],
        };
        let fx = fixture(&scenario);
        write_silent_wav(&fx.audio_dir.join("custom.wav"), 500, 8000, 1);
        write_silent_wav(&fx.audio_dir.join("line_0001.wav"), 3000, 8000, 1);
        write_silent_wav(&fx.audio_dir.join("two.wav"), 250, 8000, 1);

        let alternate = HashMap::from([(EntryId::for_position(0), "custom.wav".to_string())]);
        let first = fx
            .assembler
            .resolve_audio(&fx.audio_dir, &scenario.entries[0], &alternate)
            .await;
        assert_eq!(first, Some(fx.audio_dir.join("custom.wav")));
        let second = fx
            .assembler
            .resolve_audio(&fx.audio_dir, &scenario.entries[1], &alternate)
            .await;
        assert_eq!(second, Some(fx.audio_dir.join("two.wav")));

        let (_, map) = fx.assembler.assemble(&scenario, &fx.audio_dir, &alternate).await?;
        assert_eq!(map[1].start_ms, 500);
        assert_eq!(map[1].end_ms, 750);
        Ok(())
    }

    #[tokio::test]
    async fn test_lines_in_other_formats_are_converted() -> Result<()> {
        let scenario = Scenario {
            entries: vec![line(0), line(1), line(2)],
        };
        let fx = fixture(&scenario);
        write_silent_wav(&fx.audio_dir.join("line_0001.wav"), 1000, 24000, 1);
        write_silent_wav(&fx.audio_dir.join("line_0002.wav"), 1000, 44100, 2);
        write_silent_wav(&fx.audio_dir.join("line_0003.wav"), 500, 16000, 1);

        let timeline = fx.assembler.playback(fx.chapter, false).await?;
        assert_eq!(spans(&timeline), vec![(0, 1000), (1000, 2000), (2000, 2500)]);

        let audio = timeline.audio.clone().unwrap();
        let clip = decode_file(&audio)?;
        assert_eq!((clip.sample_rate, clip.channels), (24000, 1));
        assert_eq!(wav_duration_ms(&audio)?, 2500);
        Ok(())
    }

    #[tokio::test]
    async fn test_cache_is_reused_until_rebuild() -> Result<()> {
        let scenario = Scenario {
            entries: vec![line(0)],
        };
        let fx = fixture(&scenario);
        let clip = fx.audio_dir.join("line_0001.wav");
        write_silent_wav(&clip, 1200, 16000, 1);

        let built = fx.assembler.playback(fx.chapter, false).await?;
        fs::remove_file(&clip)?;

        let cached = fx.assembler.playback(fx.chapter, false).await?;
        assert_eq!(cached, built);

        let rebuilt = fx.assembler.playback(fx.chapter, true).await?;
        assert!(rebuilt.audio.is_none());
        assert_eq!(spans(&rebuilt), vec![(0, 0)]);

        // The stale stream is gone, so later calls do not serve it.
        assert!(!fx.layout.path(&Artifact::PlaybackAudio(fx.chapter)).exists());
        assert!(!fx.layout.path(&Artifact::SyncMap(fx.chapter)).exists());
        let later = fx.assembler.playback(fx.chapter, false).await?;
        assert!(later.audio.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_no_audio_yields_text_only_map_without_cache() -> Result<()> {
        let scenario = Scenario {
            entries: vec![line(0), line(1)],
        };
        let fx = fixture(&scenario);

        let timeline = fx.assembler.playback(fx.chapter, false).await?;
        assert!(timeline.audio.is_none());
        assert_eq!(spans(&timeline), vec![(0, 0), (0, 0)]);
        assert_eq!(timeline.entries[1].text, "Line 2");
        assert!(!fx.layout.path(&Artifact::SyncMap(fx.chapter)).exists());
        assert!(!fx.layout.path(&Artifact::PlaybackAudio(fx.chapter)).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_scenario_is_input_missing() -> Result<()> {
        let fx = fixture(&Scenario::default());
        fs::remove_file(fx.layout.path(&Artifact::Scenario(fx.chapter)))?;
        let err = fx.assembler.playback(fx.chapter, false).await.unwrap_err();
        assert!(is_input_missing(&err));
        Ok(())
    }
}

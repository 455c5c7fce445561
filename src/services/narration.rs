//! Renders a finalized scenario to per-line audio and word-level subtitles.

use crate::core::error::PipelineError;
use crate::core::io::{load_json, load_json_or_default, save_json, Storage};
use crate::core::layout::{Artifact, BookLayout};
use crate::core::models::{
    BookManifest, CharacterArchive, CharacterId, ChapterId, Scenario, ScenarioEntry, SubtitleEntry, WordTiming,
};
use crate::core::progress::ProgressSink;
use crate::services::locator::Services;
use crate::services::retry::with_retry;
use crate::utils::audio::{encode_wav, wav_duration_ms};
use crate::utils::text::TextPreprocessor;
use anyhow::Result;
use futures_util::StreamExt;
use log::{error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

struct LineJob {
    index: usize,
    entry: ScenarioEntry,
    text: String,
    voice_reference: PathBuf,
    audio_file: String,
}

pub struct SpeechRenderer<'a> {
    services: &'a Services,
    storage: Arc<dyn Storage>,
    layout: BookLayout,
    narrator_label: String,
    concurrency: usize,
}

impl<'a> SpeechRenderer<'a> {
    pub fn new(
        services: &'a Services,
        storage: Arc<dyn Storage>,
        layout: BookLayout,
        narrator_label: &str,
        concurrency: usize,
    ) -> Self {
        Self {
            services,
            storage,
            layout,
            narrator_label: narrator_label.to_string(),
            concurrency: concurrency.max(1),
        }
    }

    /// Loads the manifest, writing one with default voices if none exists.
    pub async fn load_manifest(&self) -> Result<BookManifest> {
        let path = self.layout.path(&Artifact::Manifest);
        if self.storage.exists(&path).await? {
            return load_json(self.storage.as_ref(), &path).await;
        }
        let manifest = BookManifest::new(&self.layout.book_name);
        save_json(self.storage.as_ref(), &path, &manifest).await?;
        info!("Created manifest for {}", self.layout.book_name);
        Ok(manifest)
    }

    fn voice_for(&self, speaker: &str, manifest: &BookManifest, ids: &HashMap<&str, CharacterId>) -> String {
        if speaker == self.narrator_label {
            return manifest.default_narrator_voice.clone();
        }
        ids.get(speaker)
            .and_then(|id| manifest.character_voices.get(id))
            .cloned()
            .unwrap_or_else(|| manifest.default_narrator_voice.clone())
    }

    async fn plan(&self, scenario: Scenario) -> Result<Vec<LineJob>> {
        let manifest = self.load_manifest().await?;
        let archive: CharacterArchive = load_json_or_default(
            self.storage.as_ref(),
            &self.layout.path(&Artifact::CharacterArchive),
        )
        .await?;
        let dictionary: BTreeMap<String, String> = load_json_or_default(
            self.storage.as_ref(),
            &self.layout.path(&Artifact::PronunciationDictionary),
        )
        .await?;
        let preprocessor = TextPreprocessor::new(&dictionary);

        let mut ids: HashMap<&str, CharacterId> = HashMap::new();
        for c in &archive.characters {
            for alias in &c.aliases {
                ids.entry(alias.as_str()).or_insert(c.id);
            }
        }
        for c in &archive.characters {
            ids.insert(c.name.as_str(), c.id);
        }

        let mut jobs = Vec::new();
        for (index, entry) in scenario.entries.into_iter().enumerate() {
            let text = preprocessor.apply(&entry.text);
            if text.is_empty() {
                continue;
            }
            let voice = self.voice_for(&entry.speaker, &manifest, &ids);
            jobs.push(LineJob {
                index,
                text,
                voice_reference: self.layout.path(&Artifact::VoiceReference(voice)),
                audio_file: format!("{}.wav", entry.id),
                entry,
            });
        }
        Ok(jobs)
    }

    async fn render_line(&self, chapter: ChapterId, job: &LineJob) -> Result<()> {
        let path = self.layout.path(&Artifact::AudioDir(chapter)).join(&job.audio_file);
        if self.storage.exists(&path).await? {
            return Ok(());
        }
        let synthesizer = self.services.speech.acquire().await?;
        let label = format!("synthesis of {}", job.entry.id);
        let clip = with_retry(&self.services.speech_retry, &label, || {
            synthesizer.synthesize(&job.text, &job.voice_reference)
        })
        .await?;
        self.storage.write(&path, &encode_wav(&clip)?).await
    }

    /// Synthesizes every line lacking audio, then aligns the rendered lines
    /// and writes `subtitles.json`. Offsets advance only over rendered lines.
    pub async fn run(&self, chapter: ChapterId, progress: &dyn ProgressSink) -> Result<Vec<SubtitleEntry>> {
        let scenario_path = self.layout.path(&Artifact::Scenario(chapter));
        if !self.storage.exists(&scenario_path).await? {
            return Err(PipelineError::input_missing(format!("scenario ({})", scenario_path.display())).into());
        }
        let scenario: Scenario = load_json(self.storage.as_ref(), &scenario_path).await?;

        // Fail fast when the servers are down instead of once per line.
        self.services.speech.acquire().await?;
        let aligner = self.services.aligner.acquire().await?;

        let jobs = self.plan(scenario).await?;
        let total = jobs.len().max(1) as f32;
        progress.report(0.0, "Speech", &format!("Rendering {} lines", jobs.len()));

        let mut rendered: Vec<&LineJob> = futures_util::stream::iter(jobs.iter())
            .map(|job| async move {
                match self.render_line(chapter, job).await {
                    Ok(()) => Some(job),
                    Err(e) => {
                        error!("Skipping {}: {:#}", job.entry.id, e);
                        None
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|job| async move { job })
            .collect()
            .await;
        rendered.sort_by_key(|job| job.index);

        let audio_dir = self.layout.path(&Artifact::AudioDir(chapter));
        let mut subtitles = Vec::with_capacity(rendered.len());
        let mut offset_ms = 0;
        for (i, job) in rendered.into_iter().enumerate() {
            progress.report(i as f32 / total, "Alignment", job.entry.id.as_str());
            let path = audio_dir.join(&job.audio_file);
            let duration_ms = match wav_duration_ms(&path) {
                Ok(d) => d,
                Err(e) => {
                    error!("Unreadable audio for {}: {:#}", job.entry.id, e);
                    continue;
                }
            };
            let label = format!("alignment of {}", job.entry.id);
            let words = match with_retry(&self.services.speech_retry, &label, || aligner.align(&job.text, &path)).await {
                Ok(words) => words,
                Err(e) => {
                    warn!("No word timings for {}: {:#}", job.entry.id, e);
                    Vec::new()
                }
            };

            subtitles.push(SubtitleEntry {
                entry_id: job.entry.id.clone(),
                audio_file: job.audio_file.clone(),
                text: job.entry.text.clone(),
                start_ms: offset_ms,
                end_ms: offset_ms + duration_ms,
                duration_ms,
                words: words
                    .into_iter()
                    .map(|w| WordTiming {
                        word: w.word,
                        start_ms: offset_ms + w.start_ms,
                        end_ms: offset_ms + w.end_ms,
                    })
                    .collect(),
            });
            offset_ms += duration_ms;
        }

        save_json(
            self.storage.as_ref(),
            &self.layout.path(&Artifact::Subtitles(chapter)),
            &subtitles,
        )
        .await?;
        progress.report(1.0, "Speech", &format!("{} lines rendered", subtitles.len()));
        info!("Rendered {} of {} lines for {}", subtitles.len(), jobs.len(), chapter);
        Ok(subtitles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{is_input_missing, ServiceError};
    use crate::core::io::NativeStorage;
    use crate::core::models::{Character, EntryId, LineKind, AMBIENT_NONE};
    use crate::core::progress::LogProgress;
    use crate::services::completion::tests::{service, ScriptedLlm};
    use crate::services::retry::RetryPolicy;
    use crate::services::speech::{Aligner, SpeechSynthesizer};
    use crate::utils::audio::PcmClip;
    use async_trait::async_trait;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockSynth {
        calls: Mutex<Vec<(String, PathBuf)>>,
    }

    #[async_trait]
    impl SpeechSynthesizer for MockSynth {
        async fn synthesize(&self, text: &str, voice_reference: &Path) -> Result<PcmClip> {
            self.calls
                .lock()
                .unwrap()
                .push((text.to_string(), voice_reference.to_path_buf()));
            if text.contains("static") {
                return Err(ServiceError::Transport("connection reset".into()).into());
            }
            // 500ms of silence at 8kHz.
            Ok(PcmClip {
                samples: vec![0; 4000],
                sample_rate: 8000,
                channels: 1,
            })
        }
    }

    struct MockAligner;

    #[async_trait]
    impl Aligner for MockAligner {
        async fn align(&self, text: &str, _audio: &Path) -> Result<Vec<WordTiming>> {
            Ok(text
                .split_whitespace()
                .enumerate()
                .map(|(i, w)| WordTiming {
                    word: w.to_string(),
                    start_ms: i as u64 * 100,
                    end_ms: i as u64 * 100 + 90,
                })
                .collect())
        }
    }

    fn entry(n: usize, speaker: &str, text: &str) -> ScenarioEntry {
        ScenarioEntry {
            id: EntryId::for_position(n),
            kind: if speaker == "Narrator" {
                LineKind::Narration
            } else {
                LineKind::Dialogue
            },
            speaker: speaker.to_string(),
            text: text.to_string(),
            emotion: None,
            ambient: AMBIENT_NONE.to_string(),
            audio_file: None,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: BookLayout,
        chapter: ChapterId,
        elena: CharacterId,
    }

    fn fixture(entries: Vec<ScenarioEntry>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = BookLayout::new("book", dir.path().join("in"), dir.path().join("out"));
        let chapter = ChapterId::new(1, 1);
        let scenario_path = layout.path(&Artifact::Scenario(chapter));
        fs::create_dir_all(scenario_path.parent().unwrap()).unwrap();
        fs::write(&scenario_path, serde_json::to_string(&Scenario { entries }).unwrap()).unwrap();

        let elena = CharacterId::mint();
        let archive = CharacterArchive {
            characters: vec![Character {
                id: elena,
                name: "Elena".to_string(),
                description: "A healer.".to_string(),
                spoiler_free_description: "A healer.".to_string(),
                aliases: vec![],
                first_mention: chapter.location(),
                chapter_mentions: BTreeMap::from([(chapter, "Speaks.".to_string())]),
            }],
        };
        fs::write(
            layout.path(&Artifact::CharacterArchive),
            serde_json::to_string(&archive).unwrap(),
        )
        .unwrap();
        let dictionary = layout.path(&Artifact::PronunciationDictionary);
        fs::create_dir_all(dictionary.parent().unwrap()).unwrap();
        fs::write(dictionary, r#"{"Elena": "Eh-lay-na"}"#).unwrap();

        Fixture {
            _dir: dir,
            layout,
            chapter,
            elena,
        }
    }

    fn services(synth: Arc<MockSynth>) -> Services {
        let llm = ScriptedLlm::new(vec![]);
        Services::new(service(llm.clone()), service(llm))
            .with_speech(synth, Arc::new(MockAligner))
            .with_speech_retry(RetryPolicy::immediate(2))
    }

    #[tokio::test]
    async fn test_renders_lines_and_writes_subtitles() -> Result<()> {
        let fx = fixture(vec![
            entry(0, "Narrator", "Elena stood up."),
            entry(1, "Elena", "We leave now."),
            entry(2, "Narrator", "  "),
            entry(3, "Stranger", "Who goes there?"),
        ]);
        let mut manifest = BookManifest::new("book");
        manifest.character_voices.insert(fx.elena, "alto".to_string());
        fs::write(
            fx.layout.path(&Artifact::Manifest),
            serde_json::to_string(&manifest).unwrap(),
        )?;

        let synth = Arc::new(MockSynth::default());
        let services = services(synth.clone());
        let renderer = SpeechRenderer::new(&services, Arc::new(NativeStorage::new()), fx.layout.clone(), "Narrator", 2);

        let subtitles = renderer.run(fx.chapter, &LogProgress).await?;
        let spans: Vec<(u64, u64)> = subtitles.iter().map(|s| (s.start_ms, s.end_ms)).collect();
        assert_eq!(spans, vec![(0, 500), (500, 1000), (1000, 1500)]);
        assert_eq!(subtitles[1].audio_file, "line_0002.wav");
        assert_eq!(subtitles[0].text, "Elena stood up.");
        assert_eq!(subtitles[1].words[0].start_ms, 500);

        let calls = synth.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        let voice_of = |text: &str| {
            calls
                .iter()
                .find(|(t, _)| t == text)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        let voices = fx.layout.path(&Artifact::VoiceReference("x".into()));
        let voices = voices.parent().unwrap().parent().unwrap();
        assert_eq!(voice_of("Eh-lay-na stood up."), voices.join("narrator_default/reference.wav"));
        assert_eq!(voice_of("We leave now."), voices.join("alto/reference.wav"));
        assert_eq!(voice_of("Who goes there?"), voices.join("narrator_default/reference.wav"));

        // Existing audio is not synthesized again.
        renderer.run(fx.chapter, &LogProgress).await?;
        assert_eq!(synth.calls.lock().unwrap().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_line_is_skipped_and_manifest_created() -> Result<()> {
        let fx = fixture(vec![
            entry(0, "Narrator", "Only static here."),
            entry(1, "Elena", "Still here."),
        ]);
        let synth = Arc::new(MockSynth::default());
        let services = services(synth.clone());
        let renderer = SpeechRenderer::new(&services, Arc::new(NativeStorage::new()), fx.layout.clone(), "Narrator", 1);

        let subtitles = renderer.run(fx.chapter, &LogProgress).await?;
        assert_eq!(subtitles.len(), 1);
        assert_eq!(subtitles[0].entry_id, EntryId::for_position(1));
        assert_eq!((subtitles[0].start_ms, subtitles[0].end_ms), (0, 500));
        // Two attempts for the failing line, one for the other.
        assert_eq!(synth.calls.lock().unwrap().len(), 3);

        let manifest: BookManifest =
            serde_json::from_slice(&fs::read(fx.layout.path(&Artifact::Manifest))?)?;
        assert_eq!(manifest.default_narrator_voice, "narrator_default");
        assert!(fx.layout.path(&Artifact::Subtitles(fx.chapter)).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_inputs_and_services() -> Result<()> {
        let fx = fixture(vec![entry(0, "Narrator", "Hello.")]);
        let llm = ScriptedLlm::new(vec![]);
        let offline = Services::new(service(llm.clone()), service(llm));
        let renderer = SpeechRenderer::new(&offline, Arc::new(NativeStorage::new()), fx.layout.clone(), "Narrator", 1);

        let err = renderer.run(fx.chapter, &LogProgress).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::ServiceUnavailable { .. })
        ));

        let err = renderer.run(ChapterId::new(9, 9), &LogProgress).await.unwrap_err();
        assert!(is_input_missing(&err));
        Ok(())
    }
}

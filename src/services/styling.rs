use crate::core::error::PipelineError;
use crate::core::io::{load_json, load_json_or_default, Storage};
use crate::core::layout::{Artifact, BookLayout};
use crate::core::models::{ChapterId, Scenario};
use crate::core::progress::ProgressSink;
use crate::services::locator::Services;
use crate::services::retry::with_retry;
use crate::utils::audio::encode_wav;
use anyhow::Result;
use log::{info, warn};
use rand::seq::IndexedRandom;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Re-voices rendered lines toward the reference recording of their emotion.
pub struct VoiceStyler<'a> {
    services: &'a Services,
    storage: Arc<dyn Storage>,
    layout: BookLayout,
    neutral_emotion: String,
}

impl<'a> VoiceStyler<'a> {
    pub fn new(services: &'a Services, storage: Arc<dyn Storage>, layout: BookLayout, neutral_emotion: &str) -> Self {
        Self {
            services,
            storage,
            layout,
            neutral_emotion: neutral_emotion.to_string(),
        }
    }

    /// Returns the number of lines converted. Lines without audio or without
    /// a reference for their emotion are left untouched.
    pub async fn run(&self, chapter: ChapterId, progress: &dyn ProgressSink) -> Result<usize> {
        let scenario_path = self.layout.path(&Artifact::Scenario(chapter));
        if !self.storage.exists(&scenario_path).await? {
            return Err(PipelineError::input_missing(format!("scenario ({})", scenario_path.display())).into());
        }
        let scenario: Scenario = load_json(self.storage.as_ref(), &scenario_path).await?;
        let library: BTreeMap<String, Vec<String>> = load_json_or_default(
            self.storage.as_ref(),
            &self.layout.path(&Artifact::EmotionLibrary),
        )
        .await?;

        let targets: Vec<_> = scenario
            .entries
            .iter()
            .filter_map(|e| match e.emotion.as_deref() {
                Some(emotion) if emotion != self.neutral_emotion => Some((e, emotion)),
                _ => None,
            })
            .collect();
        if targets.is_empty() {
            info!("No emotional lines in {}", chapter);
            return Ok(0);
        }

        let converter = self.services.converter.acquire().await?;
        let audio_dir = self.layout.path(&Artifact::AudioDir(chapter));
        let total = targets.len() as f32;
        let mut converted = 0;

        for (i, (entry, emotion)) in targets.into_iter().enumerate() {
            progress.report(i as f32 / total, "Styling", &format!("{} ({})", entry.id, emotion));
            let audio = audio_dir.join(entry.audio_file.clone().unwrap_or_else(|| format!("{}.wav", entry.id)));
            if !self.storage.exists(&audio).await? {
                warn!("No audio for {}; skipping", entry.id);
                continue;
            }
            let Some(file) = library
                .get(emotion)
                .and_then(|refs| refs.choose(&mut rand::rng()))
            else {
                warn!("No reference for emotion '{}'; skipping {}", emotion, entry.id);
                continue;
            };
            let reference = self.layout.path(&Artifact::EmotionReference(file.clone()));
            if !self.storage.exists(&reference).await? {
                warn!("Reference {} is missing; skipping {}", reference.display(), entry.id);
                continue;
            }

            let label = format!("conversion of {}", entry.id);
            match with_retry(&self.services.speech_retry, &label, || converter.convert(&audio, &reference)).await {
                Ok(clip) => {
                    self.storage.write(&audio, &encode_wav(&clip)?).await?;
                    converted += 1;
                }
                Err(e) => warn!("Keeping original audio for {}: {:#}", entry.id, e),
            }
        }

        progress.report(1.0, "Styling", &format!("{} lines converted", converted));
        Ok(converted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::core::models::{EntryId, LineKind, ScenarioEntry, AMBIENT_NONE};
    use crate::core::progress::LogProgress;
    use crate::services::completion::tests::{service, ScriptedLlm};
    use crate::services::speech::VoiceConverter;
    use crate::utils::audio::tests::write_silent_wav;
    use crate::utils::audio::{wav_duration_ms, PcmClip};
    use async_trait::async_trait;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockConverter {
        calls: Mutex<Vec<(PathBuf, PathBuf)>>,
    }

    #[async_trait]
    impl VoiceConverter for MockConverter {
        async fn convert(&self, source: &Path, style_reference: &Path) -> Result<PcmClip> {
            self.calls
                .lock()
                .unwrap()
                .push((source.to_path_buf(), style_reference.to_path_buf()));
            // 250ms so the rewrite is observable.
            Ok(PcmClip {
                samples: vec![0; 2000],
                sample_rate: 8000,
                channels: 1,
            })
        }
    }

    fn entry(n: usize, emotion: Option<&str>) -> ScenarioEntry {
        ScenarioEntry {
            id: EntryId::for_position(n),
            kind: LineKind::Dialogue,
            speaker: "Elena".to_string(),
            text: "Line.".to_string(),
            emotion: emotion.map(str::to_string),
            ambient: AMBIENT_NONE.to_string(),
            audio_file: None,
        }
    }

    #[tokio::test]
    async fn test_only_emotional_lines_with_references_are_converted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = BookLayout::new("book", dir.path().join("in"), dir.path().join("out"));
        let chapter = ChapterId::new(1, 1);
        let audio_dir = layout.path(&Artifact::AudioDir(chapter));
        fs::create_dir_all(&audio_dir)?;

        let scenario = Scenario {
            entries: vec![
                entry(0, Some("angry")),
                entry(1, Some("neutral")),
                entry(2, None),
                entry(3, Some("sad")),
                entry(4, Some("angry")),
            ],
        };
        fs::write(layout.path(&Artifact::Scenario(chapter)), serde_json::to_string(&scenario)?)?;
        for n in [0, 1, 2, 3] {
            write_silent_wav(&audio_dir.join(format!("line_000{}.wav", n + 1)), 1000, 8000, 1);
        }
        let library = layout.path(&Artifact::EmotionLibrary);
        fs::create_dir_all(library.parent().unwrap())?;
        fs::write(&library, r#"{"angry": ["angry_1.wav"], "neutral": ["n.wav"]}"#)?;
        write_silent_wav(&layout.path(&Artifact::EmotionReference("angry_1.wav".into())), 300, 8000, 1);

        let converter = Arc::new(MockConverter::default());
        let llm = ScriptedLlm::new(vec![]);
        let services = Services::new(service(llm.clone()), service(llm)).with_converter(converter.clone());
        let styler = VoiceStyler::new(&services, Arc::new(NativeStorage::new()), layout.clone(), "neutral");

        // line_0004 has no "sad" reference and line_0005 has no audio.
        assert_eq!(styler.run(chapter, &LogProgress).await?, 1);
        let calls = converter.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, audio_dir.join("line_0001.wav"));
        assert_eq!(calls[0].1, layout.path(&Artifact::EmotionReference("angry_1.wav".into())));

        assert_eq!(wav_duration_ms(&audio_dir.join("line_0001.wav"))?, 250);
        assert_eq!(wav_duration_ms(&audio_dir.join("line_0002.wav"))?, 1000);
        Ok(())
    }

    #[tokio::test]
    async fn test_neutral_chapter_needs_no_converter() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = BookLayout::new("book", dir.path().join("in"), dir.path().join("out"));
        let chapter = ChapterId::new(1, 1);
        let path = layout.path(&Artifact::Scenario(chapter));
        fs::create_dir_all(path.parent().unwrap())?;
        fs::write(path, serde_json::to_string(&Scenario { entries: vec![entry(0, Some("neutral"))] })?)?;

        let llm = ScriptedLlm::new(vec![]);
        let services = Services::new(service(llm.clone()), service(llm));
        let styler = VoiceStyler::new(&services, Arc::new(NativeStorage::new()), layout, "neutral");
        assert_eq!(styler.run(chapter, &LogProgress).await?, 0);
        Ok(())
    }
}

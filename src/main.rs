use anyhow::{anyhow, Result};
use inquire::{Confirm, Select};
use log::error;
use novel2scenario::core::config::Config;
use novel2scenario::core::io::{NativeStorage, Storage};
use novel2scenario::core::layout::{BookLayout, ChapterStatus};
use novel2scenario::core::models::ChapterId;
use novel2scenario::core::progress::BarProgress;
use novel2scenario::services::knowledge::KnowledgeBase;
use novel2scenario::services::locator::Services;
use novel2scenario::services::narration::SpeechRenderer;
use novel2scenario::services::scenario::ScenarioOrchestrator;
use novel2scenario::services::styling::VoiceStyler;
use novel2scenario::services::summary::SummaryGenerator;
use novel2scenario::services::timeline::TimelineAssembler;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
enum Action {
    Characters,
    Summaries,
    Scenarios,
    Speech,
    Styling,
    Playback,
    Status,
    Exit,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Action::Characters => "Analyze characters",
            Action::Summaries => "Summarize chapters",
            Action::Scenarios => "Generate scenarios",
            Action::Speech => "Synthesize speech",
            Action::Styling => "Apply emotions",
            Action::Playback => "Assemble playback",
            Action::Status => "Show chapter status",
            Action::Exit => "Exit",
        };
        f.write_str(label)
    }
}

async fn pick_book(config: &Config, storage: &dyn Storage) -> Result<String> {
    let mut books: Vec<String> = storage
        .list(&Path::new(&config.input_folder).join("books"))
        .await?
        .into_iter()
        .filter(|p| p.is_dir())
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    books.sort();
    if books.is_empty() {
        return Err(anyhow!(
            "No books found. Put chapters under {}/books/<book>/vol_1/chapter_1.txt",
            config.input_folder
        ));
    }
    Ok(Select::new("Select book:", books).prompt()?)
}

async fn for_each_chapter<F, Fut>(chapters: &[ChapterId], what: &str, mut op: F)
where
    F: FnMut(ChapterId) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    for &chapter in chapters {
        if let Err(e) = op(chapter).await {
            error!("{} for {} failed: {:#}", what, chapter, e);
        }
    }
}

fn print_status(status: &ChapterStatus) {
    let mark = |b: bool| if b { "x" } else { " " };
    println!(
        "{:<16} [{}] scenario  [{}] subtitles  [{}] audio",
        status.chapter.to_string(),
        mark(status.has_scenario),
        mark(status.has_subtitles),
        mark(status.has_audio)
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
    let book = pick_book(&config, storage.as_ref()).await?;
    let layout = BookLayout::from_config(&config, &book);
    let services = Services::from_config(&config)?;

    let actions = vec![
        Action::Characters,
        Action::Summaries,
        Action::Scenarios,
        Action::Speech,
        Action::Styling,
        Action::Playback,
        Action::Status,
        Action::Exit,
    ];

    loop {
        let action = Select::new("What next?", actions.clone()).prompt()?;
        if let Action::Exit = action {
            break;
        }
        let chapters = layout.chapters(storage.as_ref()).await?;
        let progress = BarProgress::new()?;

        match action {
            Action::Characters => {
                let kb = KnowledgeBase::new(&services, storage.clone(), layout.clone());
                let archive = kb.process_book(&progress).await?;
                println!("{} characters in archive", archive.characters.len());
            }
            Action::Summaries => {
                let generator = SummaryGenerator::new(&services, storage.clone(), layout.clone());
                let archive = generator.run(&progress).await?;
                println!("{} chapters summarized", archive.summaries.len());
            }
            Action::Scenarios => {
                let orchestrator =
                    ScenarioOrchestrator::new(&services, storage.clone(), layout.clone(), config.scenario.clone());
                let done = orchestrator.run_book(&progress).await?;
                println!("{} of {} scenarios ready", done, chapters.len());
            }
            Action::Speech => {
                let renderer = SpeechRenderer::new(
                    &services,
                    storage.clone(),
                    layout.clone(),
                    &config.scenario.narrator_label,
                    config.speech.concurrency,
                );
                for_each_chapter(&chapters, "Speech", |c| {
                    let (renderer, progress) = (&renderer, &progress);
                    async move { renderer.run(c, progress).await.map(|_| ()) }
                })
                .await;
                services.speech.release().await;
                services.aligner.release().await;
            }
            Action::Styling => {
                let styler = VoiceStyler::new(&services, storage.clone(), layout.clone(), &config.scenario.neutral_emotion);
                for_each_chapter(&chapters, "Styling", |c| {
                    let (styler, progress) = (&styler, &progress);
                    async move { styler.run(c, progress).await.map(|_| ()) }
                })
                .await;
                services.converter.release().await;
            }
            Action::Playback => {
                let rebuild = Confirm::new("Rebuild cached playback?").with_default(false).prompt()?;
                let assembler = TimelineAssembler::new(storage.clone(), layout.clone(), &config.timeline);
                for_each_chapter(&chapters, "Playback", |c| {
                    let assembler = &assembler;
                    async move {
                        let timeline = assembler.playback(c, rebuild).await?;
                        match &timeline.audio {
                            Some(path) => println!("{}: {} ({} ms)", c, path.display(), timeline.duration_ms),
                            None => println!("{}: no audio, text only", c),
                        }
                        Ok(())
                    }
                })
                .await;
            }
            Action::Status => {
                for &chapter in &chapters {
                    print_status(&layout.chapter_status(storage.as_ref(), chapter).await?);
                }
            }
            Action::Exit => {}
        }
        progress.finish();
    }

    Ok(())
}

use log::info;

/// Best-effort progress reporting. Implementations must not block and must
/// never influence control flow.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: f32, stage: &str, message: &str);
}

/// Writes progress to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, progress: f32, stage: &str, message: &str) {
        info!("[{:>3.0}%] [{}] {}", progress * 100.0, stage, message);
    }
}

impl<F> ProgressSink for F
where
    F: Fn(f32, &str, &str) + Send + Sync,
{
    fn report(&self, progress: f32, stage: &str, message: &str) {
        self(progress, stage, message)
    }
}

/// Terminal bar used by the binary. Position is tracked in permille.
pub struct BarProgress {
    bar: indicatif::ProgressBar,
}

impl BarProgress {
    pub fn new() -> anyhow::Result<Self> {
        let bar = indicatif::ProgressBar::new(1000);
        bar.set_style(
            indicatif::ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {prefix} {msg}")?
                .progress_chars("#>-"),
        );
        Ok(Self { bar })
    }

    pub fn finish(&self) {
        self.bar.finish();
    }
}

impl ProgressSink for BarProgress {
    fn report(&self, progress: f32, stage: &str, message: &str) {
        self.bar.set_position((progress.clamp(0.0, 1.0) * 1000.0) as u64);
        self.bar.set_prefix(stage.to_string());
        self.bar.set_message(message.to_string());
        info!("[{}] {}", stage, message);
    }
}

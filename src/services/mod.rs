pub mod completion;
pub mod knowledge;
pub mod llm;
pub mod locator;
pub mod narration;
pub mod prompts;
pub mod retry;
pub mod scenario;
pub mod speech;
pub mod styling;
pub mod summary;
pub mod timeline;

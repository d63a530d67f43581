pub mod cli;
pub mod document;
pub mod error;
pub mod flashcard;
pub mod html;
pub mod pipeline;
pub mod retry;
pub mod source;
pub mod summarizer;
pub mod types;

pub const PROJECT_NAME: &str = "studylog";
pub const USER_AGENT: &str = concat!("studylog/", env!("CARGO_PKG_VERSION"));

pub mod merge;
pub mod title;
pub mod translation;

pub use title::{best_match, normalize, similarity, MatchConfig, TitleFields};

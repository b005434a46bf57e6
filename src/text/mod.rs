//! Pure text processing: keyword extraction, summaries and chunking

pub mod chunking;
pub mod keywords;
pub mod stopwords;
pub mod summarizer;

pub use chunking::TextChunker;
pub use keywords::{edit_similarity, Keyword, KeywordExtractor};
pub use stopwords::is_stopword;
pub use summarizer::summarize_turns;

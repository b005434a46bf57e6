//! `chorus keywords`: inspect the keyword extractor

use anyhow::Result;
use chorus_core::text::KeywordExtractor;
use chorus_core::ChorusConfig;

/// Handle `chorus keywords`
pub fn handle(config: &ChorusConfig, text: &str, max: Option<usize>) -> Result<()> {
    let extractor = KeywordExtractor::new(config.keywords.clone());
    let keywords = extractor.extract(text);
    if keywords.is_empty() {
        println!("No keywords found");
        return Ok(());
    }

    let limit = max.unwrap_or(keywords.len());
    for keyword in keywords.iter().take(limit) {
        // Lower scores are more relevant
        println!("{:>8.4}  {}", keyword.score, keyword.text);
    }
    Ok(())
}

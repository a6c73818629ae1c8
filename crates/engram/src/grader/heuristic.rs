//! Local graders that need no external service

use async_trait::async_trait;

use crate::config::MAX_GRADE;
use crate::grader::{Grader, GraderError};

const DETAIL_KEYWORDS: [&str; 3] = ["explain", "detail", "example"];

/// Scores by length and by whether the text explains something.
///
/// `length = min(10, words / 10)`, `keyword = 5` if the text mentions
/// explain/detail/example else 3, score = `(length + keyword) / 2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicGrader;

impl HeuristicGrader {
    pub fn score_text(text: &str) -> u8 {
        let words = text.split_whitespace().count();
        let length_score = (words / 10).min(MAX_GRADE as usize) as u8;

        let lower = text.to_lowercase();
        let keyword_score = if DETAIL_KEYWORDS.iter().any(|k| lower.contains(k)) {
            5
        } else {
            3
        };

        (length_score + keyword_score) / 2
    }
}

#[async_trait]
impl Grader for HeuristicGrader {
    async fn score(&self, text: &str, _context: &str) -> Result<u8, GraderError> {
        Ok(Self::score_text(text))
    }

    fn name(&self) -> &'static str {
        "heuristic"
    }
}

/// Gives every candidate the same score
#[derive(Debug, Clone, Copy)]
pub struct FixedGrader {
    score: u8,
}

impl FixedGrader {
    pub fn new(score: u8) -> Self {
        Self {
            score: score.min(MAX_GRADE),
        }
    }
}

#[async_trait]
impl Grader for FixedGrader {
    async fn score(&self, _text: &str, _context: &str) -> Result<u8, GraderError> {
        Ok(self.score)
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

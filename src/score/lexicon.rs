//! Deterministic lexicon fallback model.
//!
//! A small valence dictionary tuned to crypto community language, with
//! two-word phrases and a light negation rule. Carries the pipeline whenever
//! the primary classifier is unreachable. Scoring is pure: the same text
//! always yields bit-identical output.

use crate::score::scorer::ModelPrediction;

/// Term valences in [-1, 1].
const LEXICON: &[(&str, f64)] = &[
    // Positive
    ("bullish", 0.75),
    ("moon", 0.62),
    ("mooning", 0.75),
    ("pump", 0.38),
    ("hodl", 0.5),
    ("diamond hands", 0.75),
    ("based", 0.62),
    ("wagmi", 0.75),
    ("lfg", 0.62),
    ("alpha", 0.5),
    ("gem", 0.62),
    ("aped", 0.38),
    ("whale", 0.38),
    ("accumulate", 0.5),
    ("undervalued", 0.5),
    ("rally", 0.5),
    ("breakout", 0.5),
    ("surge", 0.5),
    ("gains", 0.45),
    ("strong", 0.4),
    // Negative
    ("bearish", -0.75),
    ("dump", -0.62),
    ("dumping", -0.75),
    ("rug", -1.0),
    ("rugpull", -1.0),
    ("scam", -1.0),
    ("paper hands", -0.62),
    ("ngmi", -0.75),
    ("rekt", -0.88),
    ("exit scam", -1.0),
    ("ponzi", -1.0),
    ("honeypot", -1.0),
    ("fud", -0.38),
    ("selling", -0.38),
    ("crash", -0.75),
    ("dead", -0.75),
    ("overvalued", -0.5),
    ("bag holder", -0.5),
    ("plunge", -0.62),
    ("collapse", -0.75),
];

const NEGATORS: &[&str] = &["not", "no", "never", "don't", "dont", "isn't", "isnt"];

/// Confidence floor for text with no lexicon hits.
const NEUTRAL_CONFIDENCE: f64 = 0.1;

#[derive(Debug, Clone, Default)]
pub struct LexiconModel;

impl LexiconModel {
    pub fn new() -> Self {
        Self
    }

    pub fn name(&self) -> &'static str {
        "lexicon-crypto-v1"
    }

    /// Score a text. Matches whole tokens and two-word phrases; a negator
    /// immediately before a term flips its valence.
    pub fn score(&self, text: &str) -> ModelPrediction {
        let lower = text.to_lowercase();
        let tokens: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|t| !t.is_empty())
            .collect();

        let mut valences: Vec<f64> = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            let negated = i > 0 && NEGATORS.contains(&tokens[i - 1]);

            // Two-word phrases first, so "diamond hands" is not read as
            // "diamond" + "hands".
            let mut matched_phrase = false;
            if i + 1 < tokens.len() {
                let phrase = format!("{} {}", tokens[i], tokens[i + 1]);
                if let Some(valence) = lookup(&phrase) {
                    valences.push(if negated { -valence } else { valence });
                    i += 2;
                    matched_phrase = true;
                }
            }
            if !matched_phrase {
                if let Some(valence) = lookup(tokens[i]) {
                    valences.push(if negated { -valence } else { valence });
                }
                i += 1;
            }
        }

        if valences.is_empty() {
            return ModelPrediction { polarity: 0.0, confidence: NEUTRAL_CONFIDENCE };
        }

        let polarity =
            (valences.iter().sum::<f64>() / valences.len() as f64).clamp(-1.0, 1.0);
        // Strong polarity and repeated hits both raise confidence.
        let confidence =
            (polarity.abs() + 0.1 * valences.len() as f64).clamp(NEUTRAL_CONFIDENCE, 1.0);

        ModelPrediction { polarity, confidence }
    }
}

fn lookup(term: &str) -> Option<f64> {
    LEXICON.iter().find(|(t, _)| *t == term).map(|(_, v)| *v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_slang_scores_positive() {
        let p = LexiconModel::new().score("wagmi, this gem is mooning");
        assert!(p.polarity > 0.5);
        assert!(p.confidence > 0.5);
    }

    #[test]
    fn negative_slang_scores_negative() {
        let p = LexiconModel::new().score("total rug, devs dumping, we are rekt");
        assert!(p.polarity < -0.5);
    }

    #[test]
    fn neutral_text_is_low_confidence_zero() {
        let p = LexiconModel::new().score("the meeting is at three");
        assert_eq!(p.polarity, 0.0);
        assert_eq!(p.confidence, NEUTRAL_CONFIDENCE);
    }

    #[test]
    fn phrases_beat_single_tokens() {
        let p = LexiconModel::new().score("diamond hands only");
        assert!(p.polarity > 0.7);
    }

    #[test]
    fn negation_flips_valence() {
        let plain = LexiconModel::new().score("this is bullish");
        let negated = LexiconModel::new().score("this is not bullish");
        assert!(plain.polarity > 0.0);
        assert!(negated.polarity < 0.0);
        assert_eq!(plain.polarity, -negated.polarity);
    }

    #[test]
    fn deterministic_across_calls() {
        let model = LexiconModel::new();
        let text = "bullish on this undervalued gem, wagmi";
        let a = model.score(text);
        let b = model.score(text);
        assert_eq!(a.polarity.to_bits(), b.polarity.to_bits());
        assert_eq!(a.confidence.to_bits(), b.confidence.to_bits());
    }

    #[test]
    fn mixed_text_averages() {
        let p = LexiconModel::new().score("bullish but also selling");
        // 0.75 and -0.38 average to a mild positive.
        assert!(p.polarity > 0.0 && p.polarity < 0.4);
    }
}

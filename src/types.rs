//! Core data model for the sentiment oracle pipeline.

use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-point scale for sentiment scores: scores live in [-SCORE_SCALE, SCORE_SCALE].
pub const SCORE_SCALE: i128 = 1_000_000_000_000_000_000;

/// Confidence is expressed in basis points, 0..=10000.
pub const MAX_CONFIDENCE_BP: u16 = 10_000;

/// On-chain batch cap; batches larger than this revert wholesale.
pub const MAX_BATCH_SIZE: usize = 50;

/// Per-asset circular history capacity (24 h at 5-minute cadence).
pub const HISTORY_CAPACITY: usize = 288;

/// Item text is truncated to this many bytes at construction.
pub const ITEM_TEXT_CAP: usize = 4096;

/// An EVM-style 20-byte asset address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Asset(pub [u8; 20]);

impl Asset {
    pub const ZERO: Asset = Asset([0u8; 20]);

    /// Parse from a hex string, with or without the `0x` prefix.
    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s)?;
        let arr: [u8; 20] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("asset address must be 20 bytes, got {}", bytes.len()))?;
        Ok(Asset(arr))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Asset({})", self)
    }
}

impl Serialize for Asset {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Asset {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Asset::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Where an item came from. Chat rooms come in two flavors with separate
/// credentials and rate budgets, so they are distinct sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Newswire,
    Microblog,
    ChatA,
    ChatB,
}

impl Source {
    pub const ALL: [Source; 4] = [Source::Newswire, Source::Microblog, Source::ChatA, Source::ChatB];

    pub fn label(&self) -> &'static str {
        match self {
            Source::Newswire => "newswire",
            Source::Microblog => "microblog",
            Source::ChatA => "chat_a",
            Source::ChatB => "chat_b",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One social/news post, normalized across sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Stable id, globally unique within the source. Sufficient for
    /// deduplication across the sliding horizon.
    pub id: String,
    pub source: Source,
    /// UTF-8 text, truncated to [`ITEM_TEXT_CAP`] bytes.
    pub text: String,
    pub author_id: String,
    /// Author quality weight in [0, 1]; 0.5 when the source gives no signal.
    pub author_weight: f64,
    /// Unix seconds.
    pub created_at: i64,
    /// Assets this item pertains to.
    pub asset_tags: Vec<Asset>,
    /// Source-specific opaque bag.
    pub metadata: serde_json::Value,
}

impl Item {
    pub fn new(
        id: impl Into<String>,
        source: Source,
        text: impl Into<String>,
        author_id: impl Into<String>,
        author_weight: f64,
        created_at: i64,
        asset_tags: Vec<Asset>,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            text: truncate_utf8(text.into(), ITEM_TEXT_CAP),
            author_id: author_id.into(),
            author_weight: author_weight.clamp(0.0, 1.0),
            created_at,
            asset_tags,
            metadata: serde_json::Value::Null,
        }
    }
}

/// Truncate a string to at most `cap` bytes without splitting a codepoint.
pub fn truncate_utf8(mut s: String, cap: usize) -> String {
    if s.len() <= cap {
        return s;
    }
    let mut end = cap;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s
}

/// An item plus its sentiment verdict.
#[derive(Debug, Clone)]
pub struct ScoredItem {
    pub item: Item,
    /// Polarity in [-1, 1].
    pub polarity: f64,
    /// Calibrated confidence in [0, 1].
    pub confidence: f64,
}

/// Aggregated per-(asset, window) sample, ready for the manipulation gate
/// and submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetSample {
    pub asset: Asset,
    /// Fixed-point score in [-SCORE_SCALE, SCORE_SCALE].
    pub score_fp: i128,
    /// Confidence in basis points, 0..=10000.
    pub confidence_bp: u16,
    /// Count of contributing items, >= 1.
    pub sample_size: u32,
    /// Unix seconds; end of the collection window.
    pub window_end_ts: i64,
    /// Manipulation evidence in [0, 1]; filled by the detector.
    pub manipulation_score: f64,
}

impl AssetSample {
    /// Bounds check mirrored by the on-chain write path.
    pub fn in_bounds(&self) -> bool {
        self.score_fp.abs() <= SCORE_SCALE
            && self.confidence_bp <= MAX_CONFIDENCE_BP
            && self.sample_size >= 1
    }

    /// Deterministic provenance digest, kept in the submission log so an
    /// accepted update can later be tied back to the data that produced it.
    pub fn source_hash(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};

        #[derive(Serialize)]
        struct Payload<'a> {
            asset: &'a Asset,
            score_fp: i128,
            sample_size: u32,
            confidence_bp: u16,
            window_end_ts: i64,
        }

        let canonical = serde_json::to_vec(&Payload {
            asset: &self.asset,
            score_fp: self.score_fp,
            sample_size: self.sample_size,
            confidence_bp: self.confidence_bp,
            window_end_ts: self.window_end_ts,
        })
        .expect("payload of plain fields serializes");
        Sha256::digest(&canonical).into()
    }
}

/// A non-empty set of surviving samples handed to the submitter, plus the
/// chain-level parameters for this cycle.
#[derive(Debug, Clone)]
pub struct SubmissionJob {
    pub samples: NonEmpty<AssetSample>,
    pub contract: Asset,
    pub chain_id: u64,
    pub gas_ceiling_wei: u128,
    /// Cycle deadline; in-flight work completes, no new batches start past it.
    pub deadline: tokio::time::Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_hex_round_trip() {
        let a = Asset::from_hex("0x00000000000000000000000000000000000000ff").unwrap();
        assert_eq!(a.0[19], 0xff);
        assert_eq!(a.to_string(), "0x00000000000000000000000000000000000000ff");
        assert!(!a.is_zero());
        assert!(Asset::ZERO.is_zero());
    }

    #[test]
    fn asset_rejects_bad_lengths() {
        assert!(Asset::from_hex("0x1234").is_err());
        assert!(Asset::from_hex("not hex").is_err());
    }

    #[test]
    fn asset_serde_as_hex_string() {
        let a = Asset::from_hex("0x1111111111111111111111111111111111111111").unwrap();
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"0x1111111111111111111111111111111111111111\"");
        let back: Asset = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn item_text_truncated_on_char_boundary() {
        // 4095 ASCII bytes followed by a 2-byte codepoint straddling the cap.
        let mut text = "a".repeat(ITEM_TEXT_CAP - 1);
        text.push('é');
        let item = Item::new("id-1", Source::Newswire, text, "author", 0.5, 0, vec![]);
        assert_eq!(item.text.len(), ITEM_TEXT_CAP - 1);
        assert!(item.text.chars().all(|c| c == 'a'));
    }

    #[test]
    fn item_clamps_author_weight() {
        let item = Item::new("id-2", Source::Microblog, "text", "author", 1.7, 0, vec![]);
        assert_eq!(item.author_weight, 1.0);
        let item = Item::new("id-3", Source::Microblog, "text", "author", -0.2, 0, vec![]);
        assert_eq!(item.author_weight, 0.0);
    }

    #[test]
    fn source_hash_is_deterministic_and_field_sensitive() {
        let s = AssetSample {
            asset: Asset([1u8; 20]),
            score_fp: 42,
            confidence_bp: 5000,
            sample_size: 10,
            window_end_ts: 1_700_000_000,
            manipulation_score: 0.1,
        };
        assert_eq!(s.source_hash(), s.source_hash());
        let mut other = s.clone();
        other.score_fp = 43;
        assert_ne!(s.source_hash(), other.source_hash());
        // The screening score is not part of the provenance payload.
        let mut screened = s.clone();
        screened.manipulation_score = 0.9;
        assert_eq!(s.source_hash(), screened.source_hash());
    }

    #[test]
    fn sample_bounds() {
        let mut s = AssetSample {
            asset: Asset([1u8; 20]),
            score_fp: SCORE_SCALE,
            confidence_bp: MAX_CONFIDENCE_BP,
            sample_size: 1,
            window_end_ts: 0,
            manipulation_score: 0.0,
        };
        assert!(s.in_bounds());
        s.score_fp = SCORE_SCALE + 1;
        assert!(!s.in_bounds());
        s.score_fp = -SCORE_SCALE;
        s.sample_size = 0;
        assert!(!s.in_bounds());
    }
}

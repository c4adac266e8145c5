//! Wire encoding for the oracle write path.
//!
//! Minimal RLP and ABI encoders covering exactly what the submitter sends:
//! the two oracle calls wrapped in EIP-155 legacy transactions. Keccak-256
//! throughout.

use crate::types::{Asset, AssetSample};
use tiny_keccak::{Hasher, Keccak};

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    let mut out = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut out);
    out
}

/// First four bytes of the keccak of a function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = keccak256(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

// --- RLP ---

pub fn rlp_bytes(b: &[u8]) -> Vec<u8> {
    if b.len() == 1 && b[0] < 0x80 {
        return b.to_vec();
    }
    if b.len() <= 55 {
        let mut out = vec![0x80 + b.len() as u8];
        out.extend_from_slice(b);
        return out;
    }
    let len_bytes = minimal_be(b.len() as u128);
    let mut out = vec![0xb7 + len_bytes.len() as u8];
    out.extend_from_slice(&len_bytes);
    out.extend_from_slice(b);
    out
}

pub fn rlp_uint(x: u128) -> Vec<u8> {
    if x == 0 {
        return vec![0x80];
    }
    rlp_bytes(&minimal_be(x))
}

pub fn rlp_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload_len: usize = items.iter().map(Vec::len).sum();
    let mut payload = Vec::with_capacity(payload_len);
    for item in items {
        payload.extend_from_slice(item);
    }
    if payload_len <= 55 {
        let mut out = vec![0xc0 + payload_len as u8];
        out.extend_from_slice(&payload);
        return out;
    }
    let len_bytes = minimal_be(payload_len as u128);
    let mut out = vec![0xf7 + len_bytes.len() as u8];
    out.extend_from_slice(&len_bytes);
    out.extend_from_slice(&payload);
    out
}

/// Big-endian bytes with no leading zeros.
fn minimal_be(x: u128) -> Vec<u8> {
    let bytes = x.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(15);
    bytes[first..].to_vec()
}

// --- ABI ---

fn abi_word_uint(x: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&x.to_be_bytes());
    word
}

/// Two's-complement, sign-extended to 32 bytes.
fn abi_word_int128(x: i128) -> [u8; 32] {
    let mut word = if x < 0 { [0xffu8; 32] } else { [0u8; 32] };
    word[16..].copy_from_slice(&x.to_be_bytes());
    word
}

fn abi_word_address(asset: &Asset) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(asset.as_bytes());
    word
}

pub const UPDATE_SENTIMENT_SIG: &str = "updateSentiment(address,int128,uint32,uint16)";
pub const BATCH_UPDATE_SENTIMENT_SIG: &str =
    "batchUpdateSentiment(address[],int128[],uint32[],uint16[])";

/// Calldata for `updateSentiment(asset, score, sampleSize, confidence)`.
pub fn encode_update_sentiment(sample: &AssetSample) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32 * 4);
    data.extend_from_slice(&selector(UPDATE_SENTIMENT_SIG));
    data.extend_from_slice(&abi_word_address(&sample.asset));
    data.extend_from_slice(&abi_word_int128(sample.score_fp));
    data.extend_from_slice(&abi_word_uint(u128::from(sample.sample_size)));
    data.extend_from_slice(&abi_word_uint(u128::from(sample.confidence_bp)));
    data
}

/// Calldata for `batchUpdateSentiment(assets[], scores[], sampleSizes[], confidences[])`.
pub fn encode_batch_update_sentiment(samples: &[AssetSample]) -> Vec<u8> {
    let n = samples.len();
    let array_words = 1 + n; // length word plus one word per element
    let head_words = 4;

    let mut data = Vec::with_capacity(4 + 32 * (head_words + 4 * array_words));
    data.extend_from_slice(&selector(BATCH_UPDATE_SENTIMENT_SIG));

    // Head: byte offsets (from start of args) to each dynamic array tail.
    for i in 0..head_words {
        let offset = 32 * (head_words + i * array_words);
        data.extend_from_slice(&abi_word_uint(offset as u128));
    }

    // Tails, in parameter order.
    data.extend_from_slice(&abi_word_uint(n as u128));
    for sample in samples {
        data.extend_from_slice(&abi_word_address(&sample.asset));
    }
    data.extend_from_slice(&abi_word_uint(n as u128));
    for sample in samples {
        data.extend_from_slice(&abi_word_int128(sample.score_fp));
    }
    data.extend_from_slice(&abi_word_uint(n as u128));
    for sample in samples {
        data.extend_from_slice(&abi_word_uint(u128::from(sample.sample_size)));
    }
    data.extend_from_slice(&abi_word_uint(n as u128));
    for sample in samples {
        data.extend_from_slice(&abi_word_uint(u128::from(sample.confidence_bp)));
    }

    data
}

// --- Transactions ---

/// ECDSA signature with recovery id (0 or 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcdsaSig {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub rec_id: u8,
}

/// EIP-155 legacy transaction.
#[derive(Debug, Clone)]
pub struct LegacyTx {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: Asset,
    pub value: u128,
    pub data: Vec<u8>,
}

impl LegacyTx {
    /// 32-byte signing digest: keccak of the EIP-155 preimage.
    pub fn signing_digest(&self, chain_id: u64) -> [u8; 32] {
        let parts = vec![
            rlp_uint(u128::from(self.nonce)),
            rlp_uint(self.gas_price),
            rlp_uint(u128::from(self.gas_limit)),
            rlp_bytes(self.to.as_bytes()),
            rlp_uint(self.value),
            rlp_bytes(&self.data),
            rlp_uint(u128::from(chain_id)),
            rlp_uint(0),
            rlp_uint(0),
        ];
        keccak256(&rlp_list(&parts))
    }

    /// Raw signed transaction, ready for `eth_sendRawTransaction`.
    pub fn encode_signed(&self, chain_id: u64, sig: &EcdsaSig) -> Vec<u8> {
        let v = u128::from(chain_id) * 2 + 35 + u128::from(sig.rec_id);
        let parts = vec![
            rlp_uint(u128::from(self.nonce)),
            rlp_uint(self.gas_price),
            rlp_uint(u128::from(self.gas_limit)),
            rlp_bytes(self.to.as_bytes()),
            rlp_uint(self.value),
            rlp_bytes(&self.data),
            rlp_uint(v),
            rlp_bytes(&strip_leading_zeros(&sig.r)),
            rlp_bytes(&strip_leading_zeros(&sig.s)),
        ];
        rlp_list(&parts)
    }
}

fn strip_leading_zeros(bytes: &[u8; 32]) -> Vec<u8> {
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(31);
    bytes[first..].to_vec()
}

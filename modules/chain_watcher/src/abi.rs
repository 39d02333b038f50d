//! Schema-driven decoder for the VoteCastWithParams event data blob
//!
//! The non-indexed event fields are ABI-encoded as the tuple
//! `(uint256 proposalId, uint8 support, uint256 weight, string reason,
//! bytes params)`. The decoder is deliberately explicit about the fixed
//! schema: any deviation is a typed error, not a crash.

use num_bigint::BigUint;

const WORD: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AbiError {
    #[error("data truncated: wanted {wanted} bytes at offset {offset}, have {len}")]
    Truncated {
        offset: usize,
        wanted: usize,
        len: usize,
    },

    #[error("value at word {0} does not fit the declared type")]
    NonCanonical(usize),

    #[error("dynamic field offset {0} is out of range")]
    BadOffset(usize),

    #[error("reason field is not valid UTF-8")]
    BadString,
}

/// Decoded VoteCastWithParams fields
#[derive(Debug, Clone, PartialEq)]
pub struct VoteCastData {
    pub proposal_id: BigUint,
    pub support: u8,
    pub weight: BigUint,
    pub reason: String,
    pub params: Vec<u8>,
}

pub fn decode_vote_cast(data: &[u8]) -> Result<VoteCastData, AbiError> {
    let proposal_id = BigUint::from_bytes_be(word(data, 0)?);
    let support = small_uint(data, 1)?;
    let weight = BigUint::from_bytes_be(word(data, 2)?);
    let reason_bytes = dynamic_bytes(data, offset(data, 3)?)?;
    let params = dynamic_bytes(data, offset(data, 4)?)?;

    let reason = String::from_utf8(reason_bytes).map_err(|_| AbiError::BadString)?;

    Ok(VoteCastData {
        proposal_id,
        support,
        weight,
        reason,
        params,
    })
}

/// Fetch the head word at index `i`
fn word(data: &[u8], i: usize) -> Result<&[u8], AbiError> {
    let start = i * WORD;
    data.get(start..start + WORD).ok_or(AbiError::Truncated {
        offset: start,
        wanted: WORD,
        len: data.len(),
    })
}

/// Decode a uint8 head word; the leading 31 bytes must be zero
fn small_uint(data: &[u8], i: usize) -> Result<u8, AbiError> {
    let w = word(data, i)?;
    if w[..WORD - 1].iter().any(|b| *b != 0) {
        return Err(AbiError::NonCanonical(i));
    }
    Ok(w[WORD - 1])
}

/// Decode a head word holding a dynamic-field offset
fn offset(data: &[u8], i: usize) -> Result<usize, AbiError> {
    let w = word(data, i)?;
    if w[..WORD - 8].iter().any(|b| *b != 0) {
        return Err(AbiError::BadOffset(i));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&w[WORD - 8..]);
    let off = u64::from_be_bytes(buf) as usize;
    if off >= data.len() {
        return Err(AbiError::BadOffset(i));
    }
    Ok(off)
}

/// Decode a length-prefixed dynamic field (string or bytes tail)
fn dynamic_bytes(data: &[u8], off: usize) -> Result<Vec<u8>, AbiError> {
    let len_word = data.get(off..off + WORD).ok_or(AbiError::Truncated {
        offset: off,
        wanted: WORD,
        len: data.len(),
    })?;
    if len_word[..WORD - 8].iter().any(|b| *b != 0) {
        return Err(AbiError::BadOffset(off / WORD));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&len_word[WORD - 8..]);
    let len = u64::from_be_bytes(buf) as usize;

    let start = off + WORD;
    let bytes = data.get(start..start + len).ok_or(AbiError::Truncated {
        offset: start,
        wanted: len,
        len: data.len(),
    })?;
    Ok(bytes.to_vec())
}

//! Tryte codec and transaction layout.
//!
//! A transaction is 2673 trytes with fields at fixed offsets. Integer fields are balanced
//! ternary, least significant trit first. The transaction hash is not part of the trytes; it is
//! derived with Curl-P-81 over the whole transaction.

use crypto::encoding::ternary::{convert, Btrit, TritBuf, Trits, TryteBuf};
use crypto::hashes::ternary::curl_p::CurlP;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use thiserror::Error;

pub const TRYTE_ALPHABET: &[u8; 27] = b"9ABCDEFGHIJKLMNOPQRSTUVWXYZ";
pub const HASH_TRYTES: usize = 81;
pub const TAG_TRYTES: usize = 27;
pub const TRANSACTION_TRYTES: usize = 2673;

const SIGNATURE: Range<usize> = 0..2187;
const ADDRESS: Range<usize> = 2187..2268;
const VALUE: Range<usize> = 2268..2295;
const OBSOLETE_TAG: Range<usize> = 2295..2322;
const TIMESTAMP: Range<usize> = 2322..2331;
const CURRENT_INDEX: Range<usize> = 2331..2340;
const LAST_INDEX: Range<usize> = 2340..2349;
const BUNDLE: Range<usize> = 2349..2430;
const TRUNK: Range<usize> = 2430..2511;
const BRANCH: Range<usize> = 2511..2592;
const TAG: Range<usize> = 2592..2619;
const ATTACHMENT_TIMESTAMP: Range<usize> = 2619..2628;
const ATTACHMENT_TIMESTAMP_LOWER: Range<usize> = 2628..2637;
const ATTACHMENT_TIMESTAMP_UPPER: Range<usize> = 2637..2646;
const NONCE: Range<usize> = 2646..2673;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrytesError {
    #[error("invalid tryte {ch:?} at position {pos}")]
    InvalidTryte { pos: usize, ch: char },
    #[error("expected {expected} trytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("value {0} does not fit the field")]
    Overflow(i64),
    #[error("numeric field at {0:?} is out of range")]
    FieldRange(Range<usize>),
    #[error("ternary codec: {0}")]
    Codec(String),
    #[error("bundle has no tail transaction")]
    NoTail,
}

/// 81-tryte hash: transaction hash, bundle hash or address.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hash(String);

impl Hash {
    pub fn new(s: impl Into<String>) -> Result<Self, TrytesError> {
        let s = s.into();
        validate(&s, Some(HASH_TRYTES))?;
        Ok(Self(s))
    }

    /// The all-nines hash (null address / genesis reference).
    pub fn null() -> Self {
        Self("9".repeat(HASH_TRYTES))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}..)", &self.0[..12])
    }
}

impl FromStr for Hash {
    type Err = TrytesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Hash {
    type Error = TrytesError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<Hash> for String {
    fn from(h: Hash) -> Self {
        h.0
    }
}

/// Check that `s` only contains trytes and, if given, has exactly `len` of them.
pub fn validate(s: &str, len: Option<usize>) -> Result<(), TrytesError> {
    if let Some(expected) = len {
        if s.len() != expected {
            return Err(TrytesError::Length {
                expected,
                actual: s.len(),
            });
        }
    }
    match s.char_indices().find(|(_, c)| !is_tryte(*c)) {
        Some((pos, ch)) => Err(TrytesError::InvalidTryte { pos, ch }),
        None => Ok(()),
    }
}

/// Right-pad with `9` (the zero tryte) up to `len`; longer input is truncated.
pub fn pad(s: &str, len: usize) -> String {
    let mut out: String = s.chars().take(len).collect();
    while out.len() < len {
        out.push('9');
    }
    out
}

fn is_tryte(c: char) -> bool {
    c.is_ascii() && TRYTE_ALPHABET.contains(&(c as u8))
}

/// Expand trytes to balanced trits, three per tryte.
pub fn trytes_to_trits(s: &str) -> Result<TritBuf, TrytesError> {
    validate(s, None)?;
    let trytes = TryteBuf::try_from_str(s).map_err(|e| TrytesError::Codec(e.to_string()))?;
    Ok(trytes.as_trits().encode())
}

/// Pack trits into trytes. The length must be a multiple of three.
pub fn trits_to_trytes(trits: &Trits) -> String {
    trits.iter_trytes().map(char::from).collect()
}

/// `value` as exactly `len` balanced trits.
pub fn int_to_trits(value: i64, len: usize) -> Result<TritBuf, TrytesError> {
    let mut trits: TritBuf = convert::signed_int_trits(value).collect();
    if trits.len() > len {
        return Err(TrytesError::Overflow(value));
    }
    while trits.len() < len {
        trits.push(Btrit::Zero);
    }
    Ok(trits)
}

fn int_trytes(value: i64, trytes: usize) -> Result<String, TrytesError> {
    Ok(trits_to_trytes(&int_to_trits(value, trytes * 3)?))
}

fn int_field(s: &str, field: Range<usize>) -> Result<i64, TrytesError> {
    let trits = trytes_to_trits(&s[field.clone()])?;
    i64::try_from(trits.as_slice()).map_err(|_| TrytesError::FieldRange(field))
}

/// Curl-P-81 hash of a full transaction.
pub fn transaction_hash(trytes: &str) -> Result<Hash, TrytesError> {
    validate(trytes, Some(TRANSACTION_TRYTES))?;
    let trits = trytes_to_trits(trytes)?;
    Ok(Hash(trits_to_trytes(&CurlP::new().digest(&trits))))
}

fn hash_field(s: &str, field: Range<usize>) -> Hash {
    Hash(s[field].to_string())
}

/// Decoded transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub hash: Hash,
    pub signature_message_fragment: String,
    pub address: Hash,
    pub value: i64,
    pub obsolete_tag: String,
    pub timestamp: i64,
    pub current_index: i64,
    pub last_index: i64,
    pub bundle: Hash,
    pub trunk: Hash,
    pub branch: Hash,
    pub tag: String,
    pub attachment_timestamp: i64,
    pub attachment_timestamp_lower: i64,
    pub attachment_timestamp_upper: i64,
    pub nonce: String,
}

impl Transaction {
    pub fn from_trytes(s: &str) -> Result<Self, TrytesError> {
        let hash = transaction_hash(s)?;
        Ok(Self {
            hash,
            signature_message_fragment: s[SIGNATURE].to_string(),
            address: hash_field(s, ADDRESS),
            value: int_field(s, VALUE)?,
            obsolete_tag: s[OBSOLETE_TAG].to_string(),
            timestamp: int_field(s, TIMESTAMP)?,
            current_index: int_field(s, CURRENT_INDEX)?,
            last_index: int_field(s, LAST_INDEX)?,
            bundle: hash_field(s, BUNDLE),
            trunk: hash_field(s, TRUNK),
            branch: hash_field(s, BRANCH),
            tag: s[TAG].to_string(),
            attachment_timestamp: int_field(s, ATTACHMENT_TIMESTAMP)?,
            attachment_timestamp_lower: int_field(s, ATTACHMENT_TIMESTAMP_LOWER)?,
            attachment_timestamp_upper: int_field(s, ATTACHMENT_TIMESTAMP_UPPER)?,
            nonce: s[NONCE].to_string(),
        })
    }

    /// Encode back to 2673 trytes. `hash` is ignored; it is a function of the output.
    pub fn to_trytes(&self) -> Result<String, TrytesError> {
        let mut out = String::with_capacity(TRANSACTION_TRYTES);
        out.push_str(&pad(&self.signature_message_fragment, SIGNATURE.len()));
        out.push_str(self.address.as_str());
        out.push_str(&int_trytes(self.value, VALUE.len())?);
        out.push_str(&pad(&self.obsolete_tag, OBSOLETE_TAG.len()));
        out.push_str(&int_trytes(self.timestamp, TIMESTAMP.len())?);
        out.push_str(&int_trytes(self.current_index, CURRENT_INDEX.len())?);
        out.push_str(&int_trytes(self.last_index, LAST_INDEX.len())?);
        out.push_str(self.bundle.as_str());
        out.push_str(self.trunk.as_str());
        out.push_str(self.branch.as_str());
        out.push_str(&pad(&self.tag, TAG.len()));
        out.push_str(&int_trytes(self.attachment_timestamp, ATTACHMENT_TIMESTAMP.len())?);
        out.push_str(&int_trytes(
            self.attachment_timestamp_lower,
            ATTACHMENT_TIMESTAMP_LOWER.len(),
        )?);
        out.push_str(&int_trytes(
            self.attachment_timestamp_upper,
            ATTACHMENT_TIMESTAMP_UPPER.len(),
        )?);
        out.push_str(&pad(&self.nonce, NONCE.len()));
        validate(&out, Some(TRANSACTION_TRYTES))?;
        Ok(out)
    }

    pub fn is_tail(&self) -> bool {
        self.current_index == 0
    }
}

/// Find and decode the tail (current_index 0) among a bundle's transaction trytes.
pub fn tail_of(bundle_trytes: &[String]) -> Result<Transaction, TrytesError> {
    for trytes in bundle_trytes {
        // Cheap index check before paying for the hash.
        validate(trytes, Some(TRANSACTION_TRYTES))?;
        if int_field(trytes, CURRENT_INDEX)? == 0 {
            return Transaction::from_trytes(trytes);
        }
    }
    Err(TrytesError::NoTail)
}

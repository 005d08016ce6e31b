//! Request fingerprinting for content-addressed recordings
//!
//! A Key Maker projects an inbound request onto a JSON [`Key`]. The key is
//! serialized to pretty-printed JSON with members in the order the key maker
//! produced them (object members are never re-sorted here), and a
//! [`FINGERPRINT_LEN`]-byte BLAKE2b digest of it names the recording
//! directory. Key makers that build objects in a non-deterministic order will
//! fingerprint the same logical request differently.
//!
//! The encoding uses two-space indentation, `": "` between names and values,
//! and `\uXXXX` escapes for everything outside printable ASCII. This is the
//! output of Python's `json.dumps(key, indent=2)`, so stores hashed there with
//! `blake2b(digest_size=4)` resolve to the same directories.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;

use blake2::digest::consts::U4;
use blake2::{Blake2b, Digest};
use serde::Serialize;
use serde_json::ser::{Formatter, PrettyFormatter, Serializer};

use crate::key::{KeyMaker, RequestInfo};
use crate::{Result, TapedeckError};

/// Structured, JSON-like identity of a request
pub type Key = serde_json::Value;

/// Digest size in bytes
///
/// Short on purpose: collisions under one path namespace return the wrong
/// recording unless key verification is enabled on the store.
pub const FINGERPRINT_LEN: usize = 4;

/// Short printable digest of a key's canonical encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Raw digest bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Lowercase hex form, used as the recording directory name
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = TapedeckError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != FINGERPRINT_LEN * 2 || s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(TapedeckError::Other(format!("Not a fingerprint: {s}")));
        }
        let mut bytes = [0u8; FINGERPRINT_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| TapedeckError::Other(format!("Not a fingerprint: {s}: {e}")))?;
        Ok(Self(bytes))
    }
}

/// Canonical key bytes together with their fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalKey {
    /// Pretty-printed JSON encoding of the key
    pub bytes: Vec<u8>,
    /// Digest of `bytes`
    pub fingerprint: Fingerprint,
}

/// Canonicalize a key and derive its fingerprint
///
/// # Errors
///
/// Returns [`TapedeckError::Encoding`] if the key cannot be encoded
pub fn fingerprint(key: &Key) -> Result<CanonicalKey> {
    fingerprint_serializable(key)
}

/// Canonicalize any serializable value and derive its fingerprint
///
/// # Errors
///
/// Returns [`TapedeckError::Encoding`] if the value has no JSON
/// representation (for example a map with non-string keys)
pub fn fingerprint_serializable<T: Serialize + ?Sized>(key: &T) -> Result<CanonicalKey> {
    let mut bytes = Vec::with_capacity(128);
    let mut serializer = Serializer::with_formatter(&mut bytes, AsciiPretty::default());
    key.serialize(&mut serializer)
        .map_err(|e| TapedeckError::Encoding(format!("Key is not JSON-representable: {e}")))?;
    let fingerprint = digest(&bytes);
    Ok(CanonicalKey { bytes, fingerprint })
}

/// Pretty formatter that escapes every character outside printable ASCII
#[derive(Default)]
struct AsciiPretty<'a>(PrettyFormatter<'a>);

impl Formatter for AsciiPretty<'_> {
    fn begin_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.begin_array(writer)
    }

    fn end_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_array(writer)
    }

    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        self.0.begin_array_value(writer, first)
    }

    fn end_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_array_value(writer)
    }

    fn begin_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.begin_object(writer)
    }

    fn end_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_object(writer)
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        self.0.begin_object_key(writer, first)
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.begin_object_value(writer)
    }

    fn end_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_object_value(writer)
    }

    fn write_string_fragment<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        fragment: &str,
    ) -> io::Result<()> {
        // Quotes, backslashes and control characters never reach here
        let mut start = 0;
        for (i, c) in fragment.char_indices() {
            if (' '..='~').contains(&c) {
                continue;
            }
            writer.write_all(&fragment.as_bytes()[start..i])?;
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                write!(writer, "\\u{unit:04x}")?;
            }
            start = i + c.len_utf8();
        }
        writer.write_all(&fragment.as_bytes()[start..])
    }
}

/// Build a numeric key member, refusing NaN and infinities
///
/// # Errors
///
/// Returns [`TapedeckError::Encoding`] for non-finite values
pub fn number_key(value: f64) -> Result<Key> {
    serde_json::Number::from_f64(value)
        .map(Key::Number)
        .ok_or_else(|| TapedeckError::Encoding(format!("Non-finite number in key: {value}")))
}

fn digest(bytes: &[u8]) -> Fingerprint {
    let hash = Blake2b::<U4>::digest(bytes);
    Fingerprint(hash.into())
}

/// Fingerprint engine bound to a key maker
#[derive(Clone)]
pub struct FingerprintEngine {
    key_maker: Arc<dyn KeyMaker>,
}

impl FingerprintEngine {
    /// Create an engine around a key maker
    pub fn new(key_maker: Arc<dyn KeyMaker>) -> Self {
        Self { key_maker }
    }

    /// Project the request to a key and fingerprint it
    ///
    /// # Errors
    ///
    /// Returns error if the key maker fails or its key cannot be encoded
    pub async fn fingerprint_request(&self, request: &RequestInfo) -> Result<CanonicalKey> {
        let key = self.key_maker.make_key(request).await?;
        fingerprint(&key)
    }
}

impl fmt::Debug for FingerprintEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintEngine").finish_non_exhaustive()
    }
}

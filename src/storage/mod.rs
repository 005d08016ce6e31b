//! Content-addressed on-disk storage for recordings

mod claims;
mod meta;
mod store;

use serde::{Deserialize, Serialize};

pub use claims::{Claim, ClaimTable};
pub use meta::Meta;
pub use store::{path_prefix, Lookup, RecordingEntry, RecordingHandle, RecordingStore};

/// Response envelope file name
pub const META_FILE: &str = "meta.json";

/// Response body file name
pub const CONTENT_FILE: &str = "response.content";

/// Response body file name used by older recordings
pub const LEGACY_CONTENT_FILE: &str = "content";

/// Canonical key file name
pub const KEY_FILE: &str = "key.json";

/// Where lookup searches for a fingerprint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupScope {
    /// Only under the request's own path prefix
    #[default]
    Path,
    /// Anywhere under the store root
    Store,
}

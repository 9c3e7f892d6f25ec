//! Client identity used to address this client on the push endpoint.

use std::fmt;

use rand::distributions::Uniform;
use rand::Rng;

const SUFFIX_LEN: usize = 9;
const SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Opaque client id: `client_<epoch millis>_<random base36 suffix>`.
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn generate() -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let mut rng = rand::thread_rng();
        let pick = Uniform::from(0..SUFFIX_ALPHABET.len());
        let suffix: String = (0..SUFFIX_LEN)
            .map(|_| SUFFIX_ALPHABET[rng.sample(pick)] as char)
            .collect();
        Self(format!("client_{millis}_{suffix}"))
    }

    /// Use a caller-provided id (e.g. one persisted across restarts).
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Push endpoint address for this client under `base`.
    pub fn push_url(&self, base: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), self.0)
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

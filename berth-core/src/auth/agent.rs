use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// The number of random bytes backing an agent token.
const AGENT_TOKEN_LEN: usize = 32;

/// An opaque credential minted when a data source is created.
///
/// Node agents of the data source present this token when registering and polling. The token
/// never changes for the life of its data source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentToken(String);

impl AgentToken {
    /// Mint a new random token.
    pub fn mint() -> Self {
        let mut buf = [0u8; AGENT_TOKEN_LEN];
        rand::thread_rng().fill_bytes(&mut buf);
        Self(URL_SAFE_NO_PAD.encode(buf))
    }

    /// Check if the presented token matches this token.
    ///
    /// The comparison does not short-circuit on the first differing byte.
    pub fn verify(&self, presented: &str) -> bool {
        let (expected, presented) = (self.0.as_bytes(), presented.as_bytes());
        if expected.len() != presented.len() {
            return false;
        }
        expected.iter().zip(presented).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<String> for AgentToken {
    fn from(src: String) -> Self {
        Self(src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_tokens_are_unique_and_verify() {
        let (a, b) = (AgentToken::mint(), AgentToken::mint());
        assert_ne!(a, b, "expected distinct tokens to be minted");
        assert!(a.verify(a.as_str()), "expected token to verify against itself");
        assert!(!a.verify(b.as_str()), "expected token not to verify against another token");
        assert!(!a.verify(""), "expected token not to verify against empty input");
    }
}

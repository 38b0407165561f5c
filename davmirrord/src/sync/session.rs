use std::fmt;

const PREFIX: &str = "download";
const SEPARATOR: &str = "::";

/// The wire format naming one account's background transfer session:
/// `download::<accountID>::<bundleIdentifier>`. The host hands these back
/// across process restarts, and sibling processes of the same suite produce
/// them too, so decoding is defensive: malformed identifiers are rejected
/// rather than guessed at. Account identifiers may not contain the
/// separator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentifier {
    pub account: String,
    pub bundle: String,
}

impl SessionIdentifier {
    pub fn new(account: impl Into<String>, bundle: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            bundle: bundle.into(),
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{PREFIX}{SEPARATOR}{}{SEPARATOR}{}",
            self.account, self.bundle
        )
    }

    pub fn decode(text: &str) -> Option<Self> {
        let parts: Vec<&str> = text.split(SEPARATOR).collect();
        match parts.as_slice() {
            [PREFIX, account, bundle] if !account.is_empty() && !bundle.is_empty() => {
                Some(Self::new(*account, *bundle))
            }
            _ => None,
        }
    }
}

impl fmt::Display for SessionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

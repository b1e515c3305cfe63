//! Inventory records: game accounts and tunnel-backed proxies

use serde::{Deserialize, Serialize};

/// A game account that can be bound to one session at a time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub password: String,
    /// Auth provider name ("ptc", "google", ...)
    pub provider: String,
    /// Currently checked out by a session
    #[serde(default)]
    pub used: bool,
    /// Permanently unusable
    #[serde(default)]
    pub banned: bool,
    /// Unusable until a challenge is solved by hand
    #[serde(default)]
    pub captcha_flagged: bool,
}

impl Account {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            provider: provider.into(),
            used: false,
            banned: false,
            captcha_flagged: false,
        }
    }

    /// True when the account must never be handed out again
    pub fn is_unusable(&self) -> bool {
        self.banned || self.captcha_flagged
    }
}

/// An outbound path provided by a connected tunnel agent.
///
/// The id is the agent connection id; it is never reused once the proxy dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    pub id: u64,
    #[serde(rename = "use")]
    pub in_use: bool,
    pub dead: bool,
}

impl Proxy {
    /// A freshly registered, idle proxy
    pub fn new(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            dead: false,
        }
    }
}

/// Which proxy a live session's account is currently bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub account_name: String,
    pub proxy_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_defaults_from_import_json() {
        let json = r#"{"username":"ash","password":"pikachu","provider":"ptc"}"#;
        let account: Account = serde_json::from_str(json).unwrap();

        assert_eq!(account.username, "ash");
        assert!(!account.used);
        assert!(!account.banned);
        assert!(!account.captcha_flagged);
        assert!(!account.is_unusable());
    }

    #[test]
    fn test_flagged_account_is_unusable() {
        let mut account = Account::new("misty", "staryu", "ptc");
        account.captcha_flagged = true;
        assert!(account.is_unusable());
    }

    #[test]
    fn test_proxy_serializes_use_flag() {
        let json = serde_json::to_value(Proxy::new(7)).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["use"], false);
        assert_eq!(json["dead"], false);
    }
}

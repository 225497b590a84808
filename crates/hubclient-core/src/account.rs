//! Logged-in account model.
//!
//! An account is either a regular member or a creator. The two share the
//! same profile fields; what differs is the capability subset, which is
//! looked up from the [`AccountKind`] tag rather than by probing methods.
//! Derived collections are loaded lazily and kept until
//! [`Account::cleared`] produces a fresh copy.

use serde_json::Value;
use tokio::sync::OnceCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountKind {
    Member,
    Creator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub subscriptions: bool,
    pub creator_reports: bool,
}

impl AccountKind {
    /// Classify from the path a profile link resolves to.
    pub fn from_profile_path(path: &str) -> Self {
        if path.contains("/model/") || path.contains("/channels/") || path.contains("/pornstar/") {
            AccountKind::Creator
        } else {
            AccountKind::Member
        }
    }

    pub fn capabilities(self) -> Capabilities {
        match self {
            AccountKind::Member => Capabilities {
                subscriptions: true,
                creator_reports: false,
            },
            AccountKind::Creator => Capabilities {
                subscriptions: true,
                creator_reports: true,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccountKind::Member => "member",
            AccountKind::Creator => "creator",
        }
    }
}

/// Link listings loaded lazily per account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    /// Profiles the account follows.
    Subscriptions,
    /// Viewing history.
    Watched,
    Liked,
    Recommended,
    Feed,
}

impl Collection {
    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Subscriptions => "subscriptions",
            Collection::Watched => "watched",
            Collection::Liked => "liked",
            Collection::Recommended => "recommended",
            Collection::Feed => "feed",
        }
    }

    /// Whether entries are profile links rather than video links.
    pub fn lists_profiles(self) -> bool {
        self == Collection::Subscriptions
    }
}

#[derive(Debug)]
pub struct Account {
    pub name: String,
    pub avatar_url: Option<String>,
    pub is_premium: bool,
    pub(crate) kind: OnceCell<AccountKind>,
    pub(crate) subscriptions: OnceCell<Vec<String>>,
    pub(crate) watched: OnceCell<Vec<String>>,
    pub(crate) liked: OnceCell<Vec<String>>,
    pub(crate) recommended: OnceCell<Vec<String>>,
    pub(crate) feed: OnceCell<Vec<String>>,
}

impl Account {
    /// Build from the login response, falling back to the login name.
    pub fn from_login(data: &Value, username: &str) -> Self {
        let name = data
            .get("username")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(username)
            .to_string();

        let avatar_url = data
            .get("avatar")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let is_premium = match data.get("premium_redirect_cookie") {
            Some(Value::String(s)) => !s.is_empty() && s != "0",
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
            Some(Value::Bool(b)) => *b,
            _ => false,
        };

        Self::with_profile(name, avatar_url, is_premium)
    }

    fn with_profile(name: String, avatar_url: Option<String>, is_premium: bool) -> Self {
        Self {
            name,
            avatar_url,
            is_premium,
            kind: OnceCell::new(),
            subscriptions: OnceCell::new(),
            watched: OnceCell::new(),
            liked: OnceCell::new(),
            recommended: OnceCell::new(),
            feed: OnceCell::new(),
        }
    }

    /// Relative profile endpoint.
    pub fn profile_endpoint(&self) -> String {
        format!("users/{}", self.name)
    }

    pub fn collection_endpoint(&self, collection: Collection) -> String {
        match collection {
            Collection::Subscriptions => format!("users/{}/subscriptions", self.name),
            Collection::Watched => format!("users/{}/videos/recent", self.name),
            Collection::Liked => format!("users/{}/videos/favorites", self.name),
            Collection::Recommended => "recommended".to_string(),
            Collection::Feed => "feeds".to_string(),
        }
    }

    pub(crate) fn collection(&self, collection: Collection) -> &OnceCell<Vec<String>> {
        match collection {
            Collection::Subscriptions => &self.subscriptions,
            Collection::Watched => &self.watched,
            Collection::Liked => &self.liked,
            Collection::Recommended => &self.recommended,
            Collection::Feed => &self.feed,
        }
    }

    /// Kind, if it has been resolved.
    pub fn kind(&self) -> Option<AccountKind> {
        self.kind.get().copied()
    }

    /// A copy with every lazily loaded collection dropped.
    pub fn cleared(&self) -> Self {
        Self::with_profile(self.name.clone(), self.avatar_url.clone(), self.is_premium)
    }
}

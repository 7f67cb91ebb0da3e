use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{de::IgnoredAny, Deserialize, Deserializer, Serialize};

macro_rules! string_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_newtype!(Username);
string_newtype!(MessageId);

/// Reactor to emoji association for one message.
///
/// Updates from the service always carry the complete map, so the only
/// mutation is a wholesale [`Reactions::replace`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reactions(BTreeMap<Username, String>);

impl Reactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, next: Reactions) {
        self.0 = next.0;
    }

    pub fn get(&self, reactor: &Username) -> Option<&str> {
        self.0.get(reactor).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Username, &str)> {
        self.0.iter().map(|(reactor, emoji)| (reactor, emoji.as_str()))
    }
}

impl FromIterator<(Username, String)> for Reactions {
    fn from_iter<T: IntoIterator<Item = (Username, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Assigned by the service. `None` while the message is still pending locally.
    #[serde(
        rename = "_id",
        alias = "id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<MessageId>,
    pub sender: Username,
    pub receiver: Username,
    #[serde(rename = "message", alias = "content")]
    pub content: String,
    /// Falls back to the local receipt time when the service sent no usable stamp.
    #[serde(
        rename = "timestamp",
        alias = "sentAt",
        default = "Utc::now",
        deserialize_with = "lenient_timestamp"
    )]
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub reactions: Reactions,
}

impl Message {
    pub fn pending(
        sender: Username,
        receiver: Username,
        content: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            sender,
            receiver,
            content: content.into(),
            sent_at,
            read: false,
            edited: false,
            deleted: false,
            reactions: Reactions::new(),
        }
    }

    /// Content safe to render; tombstoned messages have none.
    pub fn display_content(&self) -> Option<&str> {
        (!self.deleted).then_some(self.content.as_str())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Text(String),
    Millis(i64),
    Other(IgnoredAny),
}

/// Some senders store a locale time-of-day string such as `"10:31:22 AM"`.
/// Those carry no date, so they are replaced by the time of receipt.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let stamp = match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Text(text) => text.trim().parse::<DateTime<Utc>>().ok(),
        RawTimestamp::Millis(millis) => DateTime::from_timestamp_millis(millis),
        RawTimestamp::Other(_) => None,
    };
    Ok(stamp.unwrap_or_else(Utc::now))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerUser {
    pub username: Username,
    #[serde(
        rename = "avatar",
        alias = "avatarRef",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub avatar_ref: Option<String>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(
        rename = "lastSeen",
        alias = "lastSeenAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl PeerUser {
    pub fn offline(username: Username) -> Self {
        Self {
            username,
            avatar_ref: None,
            is_online: false,
            last_seen_at: None,
        }
    }
}

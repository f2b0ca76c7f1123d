use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Identifier of a logical origin of events (one per tenant, guild, ...).
///
/// Every source maps to at most one destination endpoint and owns its own
/// rate-limit and batch state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for SourceId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for SourceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kinds of platform events a source can opt in to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    GuildChannelCreate,
    GuildChannelDelete,
    GuildChannelUpdate,
    GuildEmojisUpdate,
    GuildRoleCreate,
    GuildRoleDelete,
    GuildRoleUpdate,
    GuildUpdate,
    InviteCreate,
    InviteDelete,
    MemberBan,
    MemberJoin,
    MemberKick,
    MemberRemove,
    MemberRemoveTimeout,
    MemberTimeout,
    MemberUnban,
    MemberUpdate,
    MessageDelete,
    MessageEdit,
    ReactionAdd,
    ReactionRemove,
    VoiceStateUpdate,
    WebhooksUpdate,
}

/// Severity tag rendered as the embed color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum Color {
    /// Something was created.
    Green,
    /// Something was removed.
    Red,
    /// Something changed.
    Blue,
    Purple,
    Custom(u32),
}

impl Color {
    pub fn value(self) -> u32 {
        match self {
            Color::Green => 0x2ecc71,
            Color::Red => 0xe74c3c,
            Color::Blue => 0x3498db,
            Color::Purple => 0x9b59b6,
            Color::Custom(rgb) => rgb,
        }
    }
}

impl From<u32> for Color {
    fn from(rgb: u32) -> Self {
        match rgb {
            0x2ecc71 => Color::Green,
            0xe74c3c => Color::Red,
            0x3498db => Color::Blue,
            0x9b59b6 => Color::Purple,
            other => Color::Custom(other),
        }
    }
}

impl From<Color> for u32 {
    fn from(color: Color) -> Self {
        color.value()
    }
}

/// One `name: value` line of a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: String,
    #[serde(default = "default_inline")]
    pub inline: bool,
}

fn default_inline() -> bool {
    true
}

/// A formatted event record awaiting delivery.
///
/// Serializes as a platform embed. The timestamp is assigned when the unit
/// is queued into a batch and is the batch's age reference afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationUnit {
    pub title: String,
    pub color: Color,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Field>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl NotificationUnit {
    pub fn new(title: impl Into<String>, color: Color) -> Self {
        Self {
            title: title.into(),
            color,
            fields: Vec::new(),
            timestamp: None,
        }
    }

    /// Append an inline field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.fields.push(Field {
            name: name.into(),
            value: value.to_string(),
            inline: true,
        });
        self
    }

    /// Append a field that takes a full row.
    pub fn with_block_field(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.fields.push(Field {
            name: name.into(),
            value: value.to_string(),
            inline: false,
        });
        self
    }
}

/// JSON body of a single webhook POST.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<NotificationUnit>,
}

impl WebhookPayload {
    /// Plain text message, used for rendered batch chunks.
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            embeds: Vec::new(),
        }
    }

    /// Single embed message, used for light destinations.
    pub fn embed(unit: NotificationUnit) -> Self {
        Self {
            content: None,
            embeds: vec![unit],
        }
    }
}

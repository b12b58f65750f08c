//! Topic naming and durability policy.
//!
//! Every bus subject is built here from a scope id and a category, and every
//! subject maps to exactly one durability tier. Nothing else in the system
//! formats subject strings.
//!
//! Grammar:
//!
//! ```text
//! chat.<user_id>.<session_id>.{msg|status|typing}
//! user.<user_id>.{auth|presence|notification|quota}
//! admin.{audit|broadcast|metrics}
//! llm.{request|response}.<id>
//! ```
//!
//! Subscription patterns use NATS-style wildcards: `*` matches one segment,
//! a trailing `>` matches one or more segments.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Segment separator.
pub const SEPARATOR: char = '.';

/// Matches exactly one segment.
pub const WILDCARD_SINGLE: &str = "*";

/// Matches one or more trailing segments.
pub const WILDCARD_MULTI: &str = ">";

/// Maximum subject or pattern length.
pub const MAX_TOPIC_LENGTH: usize = 256;

const ROOT_CHAT: &str = "chat";
const ROOT_USER: &str = "user";
const ROOT_ADMIN: &str = "admin";
const ROOT_LLM: &str = "llm";

/// Topic errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,

    #[error("Topic too long: {0} bytes")]
    TooLong(usize),

    #[error("Invalid topic segment: {0:?}")]
    InvalidSegment(String),

    #[error("Unknown topic: {0}")]
    Unknown(String),
}

/// Validate a scope identifier used as a subject segment.
///
/// # Errors
///
/// Returns an error if the segment is empty or contains a separator,
/// a wildcard, whitespace or control characters.
pub fn validate_segment(segment: &str) -> Result<(), TopicError> {
    let valid = !segment.is_empty()
        && segment
            .chars()
            .all(|c| c != SEPARATOR && c != '*' && c != '>' && !c.is_whitespace() && !c.is_control());
    if valid {
        Ok(())
    } else {
        Err(TopicError::InvalidSegment(segment.to_string()))
    }
}

fn check_length(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(TopicError::TooLong(topic.len()));
    }
    Ok(())
}

/// Check whether a concrete subject matches a (possibly wildcarded) pattern.
#[must_use]
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split(SEPARATOR);

    for token in pattern.split(SEPARATOR) {
        match token {
            WILDCARD_MULTI => return subject_tokens.next().is_some(),
            WILDCARD_SINGLE => {
                if subject_tokens.next().is_none() {
                    return false;
                }
            }
            literal => {
                if subject_tokens.next() != Some(literal) {
                    return false;
                }
            }
        }
    }

    subject_tokens.next().is_none()
}

macro_rules! topic_kind {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Subject segment for this kind.
            #[must_use]
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            fn parse(segment: &str) -> Option<Self> {
                match segment {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

topic_kind!(
    /// Per-session chat categories.
    ChatKind { Msg => "msg", Status => "status", Typing => "typing" }
);

topic_kind!(
    /// Per-user event categories.
    UserKind {
        Auth => "auth",
        Presence => "presence",
        Notification => "notification",
        Quota => "quota",
    }
);

topic_kind!(
    /// Administrative categories.
    AdminKind { Audit => "audit", Broadcast => "broadcast", Metrics => "metrics" }
);

topic_kind!(
    /// Direction of LLM relay traffic.
    LlmDirection { Request => "request", Response => "response" }
);

/// A concrete bus subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    Chat {
        user_id: String,
        session_id: String,
        kind: ChatKind,
    },
    User {
        user_id: String,
        kind: UserKind,
    },
    Admin(AdminKind),
    Llm {
        direction: LlmDirection,
        id: String,
    },
}

impl Subject {
    /// `chat.<user_id>.<session_id>.<kind>`
    ///
    /// # Errors
    ///
    /// Returns an error if either id is not a valid segment.
    pub fn chat(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        kind: ChatKind,
    ) -> Result<Self, TopicError> {
        let (user_id, session_id) = (user_id.into(), session_id.into());
        validate_segment(&user_id)?;
        validate_segment(&session_id)?;
        Ok(Subject::Chat {
            user_id,
            session_id,
            kind,
        })
    }

    /// `user.<user_id>.<kind>`
    ///
    /// # Errors
    ///
    /// Returns an error if the user id is not a valid segment.
    pub fn user(user_id: impl Into<String>, kind: UserKind) -> Result<Self, TopicError> {
        let user_id = user_id.into();
        validate_segment(&user_id)?;
        Ok(Subject::User { user_id, kind })
    }

    /// `admin.<kind>`
    #[must_use]
    pub fn admin(kind: AdminKind) -> Self {
        Subject::Admin(kind)
    }

    /// `llm.<direction>.<id>`
    ///
    /// # Errors
    ///
    /// Returns an error if the id is not a valid segment.
    pub fn llm(direction: LlmDirection, id: impl Into<String>) -> Result<Self, TopicError> {
        let id = id.into();
        validate_segment(&id)?;
        Ok(Subject::Llm { direction, id })
    }

    /// The category that decides this subject's durability.
    #[must_use]
    pub fn category(&self) -> TopicCategory {
        match self {
            Subject::Chat { kind, .. } => match kind {
                ChatKind::Msg => TopicCategory::ChatMessages,
                ChatKind::Status | ChatKind::Typing => TopicCategory::Ephemeral,
            },
            Subject::User { kind, .. } => match kind {
                UserKind::Presence => TopicCategory::Ephemeral,
                UserKind::Auth | UserKind::Notification | UserKind::Quota => {
                    TopicCategory::Events
                }
            },
            Subject::Admin(kind) => match kind {
                AdminKind::Audit => TopicCategory::Events,
                AdminKind::Broadcast | AdminKind::Metrics => TopicCategory::AdminEphemeral,
            },
            Subject::Llm { .. } => TopicCategory::Events,
        }
    }

    /// Durability policy for this subject.
    #[must_use]
    pub fn policy(&self) -> &'static DurabilityPolicy {
        self.category().policy()
    }

    /// The user this subject belongs to, if it is user-scoped.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Subject::Chat { user_id, .. } | Subject::User { user_id, .. } => Some(user_id),
            Subject::Admin(_) | Subject::Llm { .. } => None,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Chat {
                user_id,
                session_id,
                kind,
            } => write!(f, "{ROOT_CHAT}.{user_id}.{session_id}.{}", kind.as_str()),
            Subject::User { user_id, kind } => write!(f, "{ROOT_USER}.{user_id}.{}", kind.as_str()),
            Subject::Admin(kind) => write!(f, "{ROOT_ADMIN}.{}", kind.as_str()),
            Subject::Llm { direction, id } => write!(f, "{ROOT_LLM}.{}.{id}", direction.as_str()),
        }
    }
}

impl FromStr for Subject {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        check_length(s)?;
        let unknown = || TopicError::Unknown(s.to_string());
        let tokens: Vec<&str> = s.split(SEPARATOR).collect();

        match tokens.as_slice() {
            [ROOT_CHAT, user_id, session_id, kind] => {
                let kind = ChatKind::parse(kind).ok_or_else(unknown)?;
                Subject::chat(*user_id, *session_id, kind)
            }
            [ROOT_USER, user_id, kind] => {
                let kind = UserKind::parse(kind).ok_or_else(unknown)?;
                Subject::user(*user_id, kind)
            }
            [ROOT_ADMIN, kind] => AdminKind::parse(kind).map(Subject::Admin).ok_or_else(unknown),
            [ROOT_LLM, direction, id] => {
                let direction = LlmDirection::parse(direction).ok_or_else(unknown)?;
                Subject::llm(direction, *id)
            }
            _ => Err(unknown()),
        }
    }
}

/// Who may subscribe to a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternScope {
    /// Confined to one user's `chat.<user>` or `user.<user>` tree.
    User(String),
    /// Under `admin.`.
    Admin,
    /// Anything else (cross-user wildcards, `llm.`).
    System,
}

/// A subscription pattern, possibly containing wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPattern(String);

impl TopicPattern {
    /// Parse and validate a pattern.
    ///
    /// # Errors
    ///
    /// Returns an error for empty segments or a `>` that is not last.
    pub fn parse(pattern: &str) -> Result<Self, TopicError> {
        check_length(pattern)?;
        let tokens: Vec<&str> = pattern.split(SEPARATOR).collect();
        let last = tokens.len() - 1;

        for (i, token) in tokens.iter().enumerate() {
            let ok = match *token {
                WILDCARD_SINGLE => true,
                WILDCARD_MULTI => i == last,
                literal => validate_segment(literal).is_ok(),
            };
            if !ok {
                return Err(TopicError::InvalidSegment((*token).to_string()));
            }
        }

        Ok(Self(pattern.to_string()))
    }

    /// A pattern matching exactly one subject.
    #[must_use]
    pub fn exact(subject: &Subject) -> Self {
        Self(subject.to_string())
    }

    /// `user.<user_id>.*`
    ///
    /// # Errors
    ///
    /// Returns an error if the user id is not a valid segment.
    pub fn user_all(user_id: &str) -> Result<Self, TopicError> {
        validate_segment(user_id)?;
        Ok(Self(format!("{ROOT_USER}.{user_id}.{WILDCARD_SINGLE}")))
    }

    /// `chat.<user_id>.>`, every session of the user.
    ///
    /// # Errors
    ///
    /// Returns an error if the user id is not a valid segment.
    pub fn chat_all(user_id: &str) -> Result<Self, TopicError> {
        validate_segment(user_id)?;
        Ok(Self(format!("{ROOT_CHAT}.{user_id}.{WILDCARD_MULTI}")))
    }

    /// `chat.<user_id>.<session_id>.*`
    ///
    /// # Errors
    ///
    /// Returns an error if either id is not a valid segment.
    pub fn chat_session(user_id: &str, session_id: &str) -> Result<Self, TopicError> {
        validate_segment(user_id)?;
        validate_segment(session_id)?;
        Ok(Self(format!(
            "{ROOT_CHAT}.{user_id}.{session_id}.{WILDCARD_SINGLE}"
        )))
    }

    /// `admin.*`
    #[must_use]
    pub fn admin_all() -> Self {
        Self(format!("{ROOT_ADMIN}.{WILDCARD_SINGLE}"))
    }

    /// Get the pattern as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether a subject matches this pattern.
    #[must_use]
    pub fn matches(&self, subject: &str) -> bool {
        subject_matches(&self.0, subject)
    }

    /// Classify who may subscribe to this pattern.
    #[must_use]
    pub fn scope(&self) -> PatternScope {
        let mut tokens = self.0.split(SEPARATOR);
        match (tokens.next(), tokens.next()) {
            (Some(ROOT_CHAT | ROOT_USER), Some(user))
                if user != WILDCARD_SINGLE && user != WILDCARD_MULTI =>
            {
                PatternScope::User(user.to_string())
            }
            (Some(ROOT_ADMIN), _) => PatternScope::Admin,
            _ => PatternScope::System,
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durability tiers, chosen by replay value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicCategory {
    /// Chat messages: durable, kept indefinitely.
    ChatMessages,
    /// Presence, typing and session status: memory only.
    Ephemeral,
    /// Auth, quota, notification, audit and LLM relay events: durable, medium retention.
    Events,
    /// Admin broadcast and metrics: memory only.
    AdminEphemeral,
}

impl TopicCategory {
    /// All categories, in table order.
    pub const ALL: [TopicCategory; 4] = [
        TopicCategory::ChatMessages,
        TopicCategory::Ephemeral,
        TopicCategory::Events,
        TopicCategory::AdminEphemeral,
    ];

    fn index(self) -> usize {
        match self {
            TopicCategory::ChatMessages => 0,
            TopicCategory::Ephemeral => 1,
            TopicCategory::Events => 2,
            TopicCategory::AdminEphemeral => 3,
        }
    }

    /// Durability policy for this category.
    #[must_use]
    pub fn policy(self) -> &'static DurabilityPolicy {
        &DURABILITY_TABLE[self.index()].1
    }
}

/// How a category's messages are stored and replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurabilityPolicy {
    /// Stream name on the bus.
    pub stream: &'static str,
    /// Persisted and replayable (at-least-once) versus memory only.
    pub persistent: bool,
    /// Maximum message age; `None` keeps messages indefinitely.
    pub retention: Option<Duration>,
    /// Publisher-retry deduplication window.
    pub dedup_window: Option<Duration>,
    /// Subject filters the stream captures.
    pub subjects: &'static [&'static str],
}

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// The single source of truth for stream provisioning and the publish path.
pub static DURABILITY_TABLE: [(TopicCategory, DurabilityPolicy); 4] = [
    (
        TopicCategory::ChatMessages,
        DurabilityPolicy {
            stream: "CHAT_MESSAGES",
            persistent: true,
            retention: None,
            dedup_window: Some(HOUR),
            subjects: &["chat.*.*.msg"],
        },
    ),
    (
        TopicCategory::Ephemeral,
        DurabilityPolicy {
            stream: "EPHEMERAL",
            persistent: false,
            retention: Some(DAY),
            dedup_window: None,
            subjects: &["chat.*.*.status", "chat.*.*.typing", "user.*.presence"],
        },
    ),
    (
        TopicCategory::Events,
        DurabilityPolicy {
            stream: "EVENTS",
            persistent: true,
            retention: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            dedup_window: Some(HOUR),
            subjects: &[
                "user.*.auth",
                "user.*.notification",
                "user.*.quota",
                "admin.audit",
                "llm.>",
            ],
        },
    ),
    (
        TopicCategory::AdminEphemeral,
        DurabilityPolicy {
            stream: "ADMIN",
            persistent: false,
            retention: Some(DAY),
            dedup_window: None,
            subjects: &["admin.broadcast", "admin.metrics"],
        },
    ),
];

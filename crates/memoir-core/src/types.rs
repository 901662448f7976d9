use serde::{Deserialize, Serialize};

/// The three narration agents.
///
/// Interviewer talks to the user in the foreground; Stenographer distills
/// dialogue into the memoir graph; Director reads new graph entries and
/// steers the Interviewer's next questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    #[serde(rename = "intv")]
    Interviewer,
    #[serde(rename = "stn")]
    Stenographer,
    #[serde(rename = "dir")]
    Director,
}

impl AgentRole {
    pub const ALL: [AgentRole; 3] = [
        AgentRole::Interviewer,
        AgentRole::Stenographer,
        AgentRole::Director,
    ];

    /// Short key used in settings keys, column prefixes, and telemetry tags.
    pub fn key(self) -> &'static str {
        match self {
            AgentRole::Interviewer => "intv",
            AgentRole::Stenographer => "stn",
            AgentRole::Director => "dir",
        }
    }

    /// Prompt row discriminator (0: Intv, 1: Stn, 2: Dir).
    pub fn prompt_kind(self) -> i64 {
        match self {
            AgentRole::Interviewer => 0,
            AgentRole::Stenographer => 1,
            AgentRole::Director => 2,
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Which half of a turn an utterance belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

impl Speaker {
    /// Storage discriminator (0: user, 1: assistant).
    pub fn code(self) -> i64 {
        match self {
            Speaker::User => 0,
            Speaker::Assistant => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Speaker::User),
            1 => Some(Speaker::Assistant),
            _ => None,
        }
    }

    /// One-letter tag used in the cache pool and rolling dialogue summaries.
    pub fn tag(self) -> char {
        match self {
            Speaker::User => 'U',
            Speaker::Assistant => 'I',
        }
    }
}

/// The four typed levels of the memoir graph, in decreasing scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoryKind {
    Stage,
    Topic,
    Shot,
    Character,
}

impl StoryKind {
    /// Storyboard `story_type` discriminator.
    pub fn code(self) -> i64 {
        match self {
            StoryKind::Stage => 1,
            StoryKind::Topic => 2,
            StoryKind::Shot => 3,
            StoryKind::Character => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(StoryKind::Stage),
            2 => Some(StoryKind::Topic),
            3 => Some(StoryKind::Shot),
            4 => Some(StoryKind::Character),
            _ => None,
        }
    }

    /// Section letter in extraction payloads and storyboard summaries
    /// (S / T / O / C — Shot is "O" for 镜头 in the product's payload format).
    pub fn letter(self) -> char {
        match self {
            StoryKind::Stage => 'S',
            StoryKind::Topic => 'T',
            StoryKind::Shot => 'O',
            StoryKind::Character => 'C',
        }
    }

    /// Temp-id prefix used by the extraction model ("s1", "t2", "o3", "c1").
    pub fn tid_prefix(self) -> char {
        match self {
            StoryKind::Stage => 's',
            StoryKind::Topic => 't',
            StoryKind::Shot => 'o',
            StoryKind::Character => 'c',
        }
    }

    pub fn from_tid_prefix(prefix: char) -> Option<Self> {
        match prefix {
            's' => Some(StoryKind::Stage),
            't' => Some(StoryKind::Topic),
            'o' => Some(StoryKind::Shot),
            'c' => Some(StoryKind::Character),
            _ => None,
        }
    }
}

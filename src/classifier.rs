//! Complexity classification for `auto` model requests
//!
//! When a caller asks for `auto`, the request is scored on a handful of cheap features and
//! mapped onto a [`Tier`]. Nothing here touches provider state; the same features always
//! produce the same tier, and growing any feature never produces a smaller tier.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Coarse capability buckets, ordered from cheapest to most capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Small,
    Fast,
    Medium,
    Big,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Small, Tier::Fast, Tier::Medium, Tier::Big];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Small => "small",
            Tier::Fast => "fast",
            Tier::Medium => "medium",
            Tier::Big => "big",
        }
    }

    /// Tiers to try when this one has no candidates: larger ones first, then smaller.
    pub fn escalation(self) -> impl Iterator<Item = Tier> {
        let larger = Tier::ALL.into_iter().filter(move |t| *t > self);
        let smaller = Tier::ALL.into_iter().rev().filter(move |t| *t < self);
        std::iter::once(self).chain(larger).chain(smaller)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(Tier::Small),
            "fast" => Ok(Tier::Fast),
            "medium" => Ok(Tier::Medium),
            "big" => Ok(Tier::Big),
            _ => Err(()),
        }
    }
}

/// The parts of a request the classifier looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFeatures {
    pub message_count: usize,
    /// Total characters across all message text.
    pub prompt_chars: usize,
    pub has_code: bool,
    pub has_tool_calls: bool,
    /// A caller-supplied minimum tier (e.g. from a header).
    pub hint: Option<Tier>,
}

impl RequestFeatures {
    /// Extract features from an already-decoded chat-completions style body.
    pub fn from_chat_body(body: &Value) -> Self {
        let messages = body
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut features = RequestFeatures {
            message_count: messages.len(),
            has_tool_calls: body
                .get("tools")
                .and_then(Value::as_array)
                .is_some_and(|tools| !tools.is_empty()),
            ..Default::default()
        };

        for message in messages {
            if message.get("tool_calls").is_some()
                || message.get("role").and_then(Value::as_str) == Some("tool")
            {
                features.has_tool_calls = true;
            }
            for text in message_texts(message) {
                features.prompt_chars += text.chars().count();
                if text.contains("```") {
                    features.has_code = true;
                }
            }
        }

        features
    }

    pub fn with_hint(mut self, hint: Option<Tier>) -> Self {
        self.hint = hint;
        self
    }

    /// Rough token estimate: four characters per token.
    pub fn estimated_tokens(&self) -> usize {
        self.prompt_chars.div_ceil(4)
    }
}

/// Message content is either a plain string or a list of typed parts.
fn message_texts(message: &Value) -> Vec<&str> {
    match message.get("content") {
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect(),
        _ => Vec::new(),
    }
}

fn size_score(tokens: usize) -> u32 {
    match tokens {
        0..200 => 0,
        200..1_000 => 1,
        1_000..4_000 => 2,
        4_000..16_000 => 3,
        _ => 5,
    }
}

fn conversation_score(messages: usize) -> u32 {
    match messages {
        0..=2 => 0,
        3..=8 => 1,
        9..=20 => 2,
        _ => 3,
    }
}

/// Map request features onto a tier. The hint, if any, acts as a floor.
pub fn classify(features: &RequestFeatures) -> Tier {
    let mut score = size_score(features.estimated_tokens())
        + conversation_score(features.message_count);
    if features.has_code {
        score += 2;
    }
    if features.has_tool_calls {
        score += 2;
    }

    let tier = match score {
        0 => Tier::Small,
        1..=2 => Tier::Fast,
        3..=4 => Tier::Medium,
        _ => Tier::Big,
    };

    match features.hint {
        Some(hint) => tier.max(hint),
        None => tier,
    }
}

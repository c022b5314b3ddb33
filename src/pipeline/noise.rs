//! Noise filter: rejects low-information text before it reaches the LLM.
//!
//! Two granularities: whole messages (pipeline pre-filter) and extracted
//! fact values (post-filter). Pure functions over text — thresholds and
//! extra patterns come from `NoiseConfig`, the built-in sets below are the
//! reproducible defaults.

use regex::Regex;
use std::sync::LazyLock;

use crate::config::NoiseConfig;

/// Denials: the speaker is saying they have nothing to offer.
static DENIAL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bi (don't|do not|cannot|can't) (have|recall|remember|find|access)\b",
        r"(?i)\bno (data|information|memory) (about|on|available)\b",
        r"(?i)\bi have no (data|information|memory|record)\b",
        r"我(没有|不)(相关)?(数据|资料|记忆|信息|印象)",
        r"我不记得",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("denial pattern"))
    .collect()
});

/// Meta-questions about the memory itself, not new information.
static META_QUESTION: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bdo you (remember|recall|know about)\b",
        r"(?i)\bwhat do you (remember|know) about\b",
        r"你(还)?记得",
        r"你知道.*吗[？?]?$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("meta pattern"))
    .collect()
});

/// Greetings and acknowledgements, EN/ZH.
static BOILERPLATE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^(hi|hello|hey|good (morning|afternoon|evening))[.!,\s]*$",
        r"(?i)^(thanks|thank you|thx|ok|okay|sure|yes|no|yep|nope|got it|sounds good|great|cool|done)[.!,\s]*$",
        r"^(你好|您好|嗨|哈罗)[。！!～\s]*$",
        r"^(谢谢|多谢|好的|好|嗯|收到|明白|了解|可以|行)[。！!～\s]*$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("boilerplate pattern"))
    .collect()
});

/// Log-prefix lines: timestamps or level tags at the start.
static LOG_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[?(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}|(INFO|WARN|WARNING|ERROR|DEBUG|TRACE)\b)")
        .expect("log prefix pattern")
});

/// Compiled filter. Built once per pipeline run.
pub struct NoiseFilter {
    min_len: usize,
    max_len: usize,
    extra: Vec<Regex>,
}

impl NoiseFilter {
    pub fn new(cfg: &NoiseConfig) -> Self {
        let extra = cfg
            .extra_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "ignoring bad noise pattern");
                    None
                }
            })
            .collect();
        Self {
            min_len: cfg.min_len,
            max_len: cfg.max_len,
            extra,
        }
    }

    /// Message-level check: size gates plus all pattern sets.
    pub fn is_noise_message(&self, text: &str) -> bool {
        let trimmed = text.trim();
        let chars = trimmed.chars().count();
        if chars < self.min_len || chars > self.max_len {
            return true;
        }
        if is_structural(trimmed) {
            return true;
        }
        self.matches_patterns(trimmed)
    }

    /// Fact-level check: patterns only — extracted values are legitimately
    /// short ("Taipei"), so the size floor doesn't apply.
    pub fn is_noise_fact(&self, value: &str) -> bool {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return true;
        }
        self.matches_patterns(trimmed)
    }

    fn matches_patterns(&self, text: &str) -> bool {
        DENIAL.iter().any(|re| re.is_match(text))
            || META_QUESTION.iter().any(|re| re.is_match(text))
            || BOILERPLATE.iter().any(|re| re.is_match(text))
            || self.extra.iter().any(|re| re.is_match(text))
    }
}

/// Structural content with no conversational information: fenced code,
/// pure JSON, log lines, or markdown skeleton (headers / list markers).
fn is_structural(text: &str) -> bool {
    if text.starts_with("```") && text.ends_with("```") {
        return true;
    }
    if (text.starts_with('{') || text.starts_with('['))
        && serde_json::from_str::<serde_json::Value>(text).is_ok()
    {
        return true;
    }
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if !lines.is_empty() && lines.iter().all(|l| LOG_PREFIX.is_match(l.trim_start())) {
        return true;
    }
    if !lines.is_empty() && lines.iter().all(|l| is_markdown_skeleton(l.trim_start())) {
        return true;
    }
    false
}

/// Headers and bare list markers carry structure, not content.
fn is_markdown_skeleton(line: &str) -> bool {
    line.starts_with('#') || matches!(line.trim_end(), "-" | "*" | "+")
}

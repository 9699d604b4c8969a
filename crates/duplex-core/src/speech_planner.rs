use chrono::{DateTime, Utc};
use duplex_domain::{BoxStream, Config, PlannerConfig};
use serde::{Deserialize, Serialize};

use crate::cancellation::CancelToken;

/// An upstream supplier of text fragments the planner consumes token by
/// token. `close` is invoked once, on cancellation, so the producer can
/// release whatever it holds (an LLM stream, a channel, a socket).
#[async_trait::async_trait]
pub trait TokenSource: Send {
    async fn next_token(&mut self) -> Option<String>;

    async fn close(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechActType {
    Backchannel,
    Statement,
    Status,
    Correction,
    Final,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechAct {
    pub text: String,
    #[serde(rename = "type")]
    pub kind: SpeechActType,
    pub created_at: DateTime<Utc>,
}

impl SpeechAct {
    fn new(text: impl Into<String>, kind: SpeechActType) -> Self {
        Self {
            text: text.into(),
            kind,
            created_at: Utc::now(),
        }
    }

    /// ~150 words per minute, i.e. 400ms per word.
    pub fn estimated_duration_ms(&self) -> u64 {
        let words = self.text.split_whitespace().count() as u64;
        words * 400
    }

    /// A `Status` act carrying arbitrary text, for background signals woven
    /// in from the attention event bus rather than produced by the planner.
    pub fn status_text(text: impl Into<String>) -> Self {
        Self::new(text, SpeechActType::Status)
    }
}

const SENTENCE_ENDINGS: [&str; 4] = [".", "!", "?", "..."];

const ABBREVIATIONS: [&str; 15] = [
    "Dr.", "Mr.", "Mrs.", "Ms.", "Prof.", "Jr.", "Sr.", "Inc.", "Ltd.", "Corp.", "Co.", "vs.",
    "etc.", "e.g.", "i.e.",
];

const CLAUSE_BREAKS: [&str; 5] = [",", ";", ":", " - ", " — "];

const BACKCHANNELS: [&str; 8] = [
    "Got it", "One sec", "Sure", "Let me check", "Okay", "Hmm", "I see", "Right",
];

fn status_template(action: &str) -> Option<&'static str> {
    match action {
        "lookup" => Some("I'm looking that up"),
        "search" => Some("I'm searching for that"),
        "calculate" => Some("Let me calculate"),
        "tool" => Some("I'm working on that"),
        "agent" => Some("I'm checking with another agent"),
        "memory" => Some("Let me recall"),
        "default" => Some("One moment"),
        _ => None,
    }
}

const CORRECTION_PREFIXES: [&str; 3] = ["One more thing: ", "Also, ", "I should add: "];

/// Last match of `pat` in `text` whose span ends at or before `end`.
fn rfind_before(text: &str, pat: &str, end: usize) -> Option<usize> {
    text.match_indices(pat)
        .filter(|(idx, m)| idx + m.len() <= end)
        .map(|(idx, _)| idx)
        .last()
}

/// First match of `pat` in `text` starting at or after `start`.
fn find_from(text: &str, pat: &str, start: usize) -> Option<usize> {
    text.match_indices(pat)
        .find(|(idx, _)| *idx >= start)
        .map(|(idx, _)| idx)
}

/// Last match of `pat` in `text` starting within `[start, end)`.
fn rfind_in_range(text: &str, pat: &str, start: usize, end: usize) -> Option<usize> {
    text.match_indices(pat)
        .filter(|(idx, _)| *idx >= start && *idx < end)
        .map(|(idx, _)| idx)
        .last()
}

/// Steps a byte index backward to the nearest UTF-8 char boundary at or
/// before it, so a forced break point is always safe to slice on.
fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Prefixes `addition` with additive phrasing unless it already carries one
/// of the known correction prefixes. Shared by [`SpeechPlanner::correction`]
/// and the deliberation additive-refinement path so the two never drift.
pub(crate) fn prefix_if_needed(addition: &str) -> String {
    let text = addition.trim();
    if CORRECTION_PREFIXES.iter().any(|p| text.starts_with(p)) {
        text.to_string()
    } else {
        format!("One more thing: {text}")
    }
}

/// Fragments a token stream into short, individually cancellable speech
/// acts on natural sentence/clause boundaries.
#[derive(Debug, Clone, Copy)]
pub struct SpeechPlanner {
    config: PlannerConfig,
}

impl SpeechPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.planner)
    }

    /// Converts `tokens` into a stream of Speech Acts. Every mid-stream
    /// emission is `Statement`; the trailing residual buffer, if any, is
    /// emitted as `Final` once the source closes without cancellation.
    ///
    /// On cancellation the upstream source is closed and any buffered text
    /// is discarded rather than emitted.
    pub fn plan(
        self,
        mut tokens: Box<dyn TokenSource>,
        token: CancelToken,
    ) -> BoxStream<'static, SpeechAct> {
        Box::pin(async_stream::stream! {
            let mut buffer = String::new();
            let mut cancelled = false;

            loop {
                if token.is_cancelled() {
                    cancelled = true;
                    break;
                }
                match tokens.next_token().await {
                    Some(chunk) => buffer.push_str(&chunk),
                    None => break,
                }

                if let Some(break_at) = self.find_break_point(&buffer) {
                    let segment = buffer[..break_at].trim().to_string();
                    let rest = buffer[break_at..].trim_start().to_string();
                    buffer = rest;

                    if segment.len() >= self.config.min_chars {
                        yield SpeechAct::new(segment, SpeechActType::Statement);
                    }
                }
            }

            if cancelled {
                tokens.close().await;
            } else {
                let residual = buffer.trim();
                if !residual.is_empty() {
                    yield SpeechAct::new(residual.to_string(), SpeechActType::Final);
                }
            }
        })
    }

    /// Like [`SpeechPlanner::plan`], but leads with a `Status` act when
    /// `has_tools` is set.
    pub fn plan_with_status(
        self,
        tokens: Box<dyn TokenSource>,
        has_tools: bool,
        token: CancelToken,
    ) -> BoxStream<'static, SpeechAct> {
        Box::pin(async_stream::stream! {
            if has_tools {
                yield self.status("tool");
            }
            let mut inner = self.plan(tokens, token);
            use futures_util::StreamExt;
            while let Some(act) = inner.next().await {
                yield act;
            }
        })
    }

    pub fn backchannel(&self, phrase: Option<&str>) -> SpeechAct {
        let text = phrase.unwrap_or(BACKCHANNELS[0]);
        SpeechAct::new(text, SpeechActType::Backchannel)
    }

    pub fn status(&self, action: &str) -> SpeechAct {
        let text = status_template(action)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("I'm {action}"));
        SpeechAct::new(text, SpeechActType::Status)
    }

    pub fn correction(&self, addition: &str) -> SpeechAct {
        SpeechAct::new(prefix_if_needed(addition), SpeechActType::Correction)
    }

    fn find_break_point(&self, text: &str) -> Option<usize> {
        let min_chars = self.config.min_chars;
        let target_chars = self.config.target_chars;
        let max_chars = self.config.max_chars;

        // 1. Paragraph boundary always wins once past min_chars.
        if let Some(idx) = text.find("\n\n") {
            if idx > min_chars {
                return Some(idx + 2);
            }
        }

        // 2. Short buffer: only the latest unambiguous sentence ending
        // counts — deliberately a backward scan, so a later, clearer
        // ending in the same buffer wins over an earlier abbreviation.
        if text.len() < target_chars {
            for ending in SENTENCE_ENDINGS {
                if let Some(idx) = text.rfind(ending) {
                    if idx > min_chars && !self.is_abbreviation(text, idx + ending.len() - 1) {
                        return Some(idx + ending.len());
                    }
                }
            }
            return None;
        }

        // 3. Force a break once the buffer has grown past max_chars.
        if text.len() >= max_chars {
            for ending in SENTENCE_ENDINGS {
                if let Some(idx) = rfind_before(text, ending, max_chars) {
                    if idx > min_chars && !self.is_abbreviation(text, idx + ending.len() - 1) {
                        return Some(idx + ending.len());
                    }
                }
            }
            for brk in CLAUSE_BREAKS {
                if let Some(idx) = rfind_before(text, brk, max_chars) {
                    if idx > min_chars {
                        return Some(idx + brk.len());
                    }
                }
            }
            if let Some(idx) = rfind_in_range(text, " ", min_chars, max_chars) {
                return Some(idx + 1);
            }
            return Some(floor_char_boundary(text, max_chars.min(text.len())));
        }

        // 4. target_chars <= len < max_chars: forward scan for the
        // earliest sentence ending at or after min_chars (the inverse
        // direction of branch 2 — here an early, well-formed ending should
        // not be held hostage by a later one); otherwise a clause break
        // once well past target.
        let mut best: Option<usize> = None;
        for ending in SENTENCE_ENDINGS {
            if let Some(idx) = find_from(text, ending, min_chars) {
                if idx < text.len() - 1 && !self.is_abbreviation(text, idx + ending.len() - 1) {
                    let break_pos = idx + ending.len();
                    best = Some(best.map_or(break_pos, |b| b.min(break_pos)));
                }
            }
        }
        if let Some(b) = best {
            return Some(b);
        }

        if (text.len() as f64) > (target_chars as f64) * 1.2 {
            for brk in CLAUSE_BREAKS {
                if let Some(idx) = text.rfind(brk) {
                    if idx > min_chars {
                        return Some(idx + brk.len());
                    }
                }
            }
        }
        None
    }

    /// A period belongs to an abbreviation if the characters immediately
    /// before it spell a known abbreviation, or if it sits between two
    /// digits (a decimal number).
    fn is_abbreviation(&self, text: &str, period_idx: usize) -> bool {
        let bytes = text.as_bytes();

        // `period_idx` always points at an ASCII '.', so `period_idx + 1` is
        // always a char boundary and this slice can never panic, regardless
        // of multibyte characters earlier in the buffer.
        let prefix = &text[..=period_idx];
        if ABBREVIATIONS.iter().any(|abbr| prefix.ends_with(abbr)) {
            return true;
        }

        if period_idx > 0 && period_idx + 1 < text.len() {
            let before = bytes[period_idx - 1];
            let after = bytes[period_idx + 1];
            if before.is_ascii_digit() && after.is_ascii_digit() {
                return true;
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::Mutex;

    struct VecTokenSource {
        tokens: std::vec::IntoIter<String>,
        closed: std::sync::Arc<Mutex<bool>>,
    }

    impl VecTokenSource {
        fn new(tokens: Vec<String>) -> Self {
            Self {
                tokens: tokens.into_iter(),
                closed: std::sync::Arc::new(Mutex::new(false)),
            }
        }

        /// Chunks `text` word by word (keeping trailing spaces attached),
        /// the way an LLM emits whole-word tokens rather than characters.
        fn words(text: &str) -> Self {
            let chunks = text.split_inclusive(' ').map(str::to_string).collect();
            Self::new(chunks)
        }
    }

    #[async_trait::async_trait]
    impl TokenSource for VecTokenSource {
        async fn next_token(&mut self) -> Option<String> {
            self.tokens.next()
        }

        async fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn planner(target: usize, min: usize, max: usize) -> SpeechPlanner {
        SpeechPlanner::new(PlannerConfig {
            target_chars: target,
            min_chars: min,
            max_chars: max,
        })
    }

    /// Strips all whitespace, for comparing reconstructed speech against
    /// the source text "modulo whitespace".
    fn squash(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    async fn collect(planner: SpeechPlanner, text: &str, token: CancelToken) -> Vec<SpeechAct> {
        let source = Box::new(VecTokenSource::words(text));
        planner.plan(source, token).collect().await
    }

    #[tokio::test]
    async fn clean_short_reply_yields_one_final_act() {
        let acts = collect(
            planner(80, 40, 150),
            "This is a short reply.",
            CancelToken::new(),
        )
        .await;
        assert_eq!(acts.len(), 1);
        assert_eq!(acts[0].text, "This is a short reply.");
        assert_eq!(acts[0].kind, SpeechActType::Final);
    }

    #[tokio::test]
    async fn multi_sentence_planning_breaks_on_each_sentence() {
        let input = "Sure. Here is the answer. It is forty-two.";
        let acts = collect(planner(15, 3, 60), input, CancelToken::new()).await;

        let texts: Vec<&str> = acts.iter().map(|a| a.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["Sure.", "Here is the answer.", "It is forty-two."]
        );
        assert_eq!(acts.last().unwrap().kind, SpeechActType::Final);
        assert!(acts[..acts.len() - 1]
            .iter()
            .all(|a| a.kind == SpeechActType::Statement));

        let reconstructed: String = acts.iter().map(|a| a.text.as_str()).collect();
        assert_eq!(squash(&reconstructed), squash(input));
    }

    #[tokio::test]
    async fn abbreviation_does_not_break_early() {
        let input = "I called Dr. Smith today. He agreed.";
        let acts = collect(planner(80, 5, 150), input, CancelToken::new()).await;

        // "Dr." must never end up alone at the end of an act.
        assert!(acts.iter().all(|a| !a.text.ends_with("Dr.")));
        // "Dr. Smith" must stay together in whichever act contains it.
        assert!(acts.iter().any(|a| a.text.contains("Dr. Smith")));

        let reconstructed: String = acts.iter().map(|a| a.text.as_str()).collect();
        assert_eq!(squash(&reconstructed), squash(input));
    }

    #[tokio::test]
    async fn decimal_period_does_not_break() {
        let input = "The value is 3.14 exactly.";
        let acts = collect(planner(80, 5, 150), input, CancelToken::new()).await;

        assert!(acts.iter().any(|a| a.text.contains("3.14")));
        assert!(acts.iter().all(|a| !a.text.ends_with('3')));

        let reconstructed: String = acts.iter().map(|a| a.text.as_str()).collect();
        assert_eq!(squash(&reconstructed), squash(input));
    }

    #[tokio::test]
    async fn forced_break_on_multibyte_run_does_not_panic_on_char_boundary() {
        let input = format!("x{}", "日".repeat(60));
        let acts = collect(planner(80, 40, 150), &input, CancelToken::new()).await;

        assert!(!acts.is_empty());
        let reconstructed: String = acts.iter().map(|a| a.text.as_str()).collect();
        assert_eq!(squash(&reconstructed), squash(&input));
    }

    #[tokio::test]
    async fn abbreviation_scan_does_not_panic_on_multibyte_prefix() {
        let input = format!("{}vs. something else.", "日".repeat(20));
        let acts = collect(planner(80, 5, 150), &input, CancelToken::new()).await;

        let reconstructed: String = acts.iter().map(|a| a.text.as_str()).collect();
        assert_eq!(squash(&reconstructed), squash(&input));
    }

    #[tokio::test]
    async fn cancellation_closes_source_and_discards_buffer() {
        let token = CancelToken::new();
        token.cancel();
        let source = Box::new(VecTokenSource::words("Hanging fragment without end"));
        let acts: Vec<SpeechAct> = planner(80, 40, 150).plan(source, token).collect().await;
        assert!(acts.is_empty());
    }

    #[test]
    fn correction_prefixes_once() {
        let p = planner(80, 40, 150);
        let act = p.correction("Rain expected later today");
        assert_eq!(act.text, "One more thing: Rain expected later today");
        let act2 = p.correction("Also, it might be windy");
        assert_eq!(act2.text, "Also, it might be windy");
    }

    #[test]
    fn status_falls_back_to_generic_phrasing_for_unknown_action() {
        let p = planner(80, 40, 150);
        assert_eq!(p.status("lookup").text, "I'm looking that up");
        assert_eq!(p.status("xyz").text, "I'm xyz");
    }

    #[test]
    fn estimated_duration_scales_with_word_count() {
        let act = SpeechAct::new("one two three four", SpeechActType::Statement);
        assert_eq!(act.estimated_duration_ms(), 1600);
    }

    #[tokio::test]
    async fn plan_with_status_leads_with_status_act_when_has_tools() {
        let source = Box::new(VecTokenSource::words("Short answer."));
        let acts: Vec<SpeechAct> = planner(80, 40, 150)
            .plan_with_status(source, true, CancelToken::new())
            .collect()
            .await;
        assert_eq!(acts[0].kind, SpeechActType::Status);
        assert_eq!(acts.last().unwrap().kind, SpeechActType::Final);
    }
}

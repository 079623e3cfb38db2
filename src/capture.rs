//! Incremental capture decisions.
//!
//! Given the current text of a conversation and the chat it belongs to, the
//! engine decides which slice of that text has not been persisted yet. Two
//! pieces of per-chat state drive the decision, both held in [`CaptureState`]:
//!
//! * the **fingerprint**: the first 1000 chars of the conversation body, set
//!   once and used to recognise the same conversation across polls;
//! * the **tail**: the last 1000 chars of the most recently absorbed
//!   snapshot, used to find where the previous capture stopped.
//!
//! The engine does no I/O. All lengths and offsets are counted in chars.
use crate::state::CaptureState;
use crate::utils::{byte_offset, char_index, char_len, char_prefix, char_suffix};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Placeholder in marker templates, replaced with the chat identifier.
pub const CHAT_PLACEHOLDER: &str = "{chat}";

/// Tunables for [`CaptureEngine`]. The defaults are the values the capture
/// format was built around; the marker lists are plain data so they can be
/// adjusted for a different transcript layout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub fingerprint_len: usize,
    pub tail_len: usize,
    pub similarity_threshold: f64,
    pub min_change_chars: usize,
    /// Markers locating the conversation start when comparing fingerprints.
    pub resume_markers: Vec<String>,
    pub resume_marker_window: usize,
    /// Markers locating the conversation start when a fingerprint is created.
    pub baseline_markers: Vec<String>,
    pub baseline_marker_window: usize,
    /// Markers a tail-miss fallback may align to.
    pub safe_markers: Vec<String>,
    pub fallback_window: usize,
    /// Safe markers are only looked for at or before `len - fallback_scan_margin`.
    pub fallback_scan_margin: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            fingerprint_len: 1000,
            tail_len: 1000,
            similarity_threshold: 0.5,
            min_change_chars: 50,
            resume_markers: vec![
                format!("{CHAT_PLACEHOLDER}\nDC\n"),
                "Human:".into(),
                "Assistant:".into(),
            ],
            resume_marker_window: 3000,
            baseline_markers: vec![
                format!("{CHAT_PLACEHOLDER}\nDC\n"),
                "Human:".into(),
                "I'm working on".into(),
            ],
            baseline_marker_window: 2000,
            safe_markers: vec!["Assistant:".into(), "Human:".into(), "\n\n".into()],
            fallback_window: 10_000,
            fallback_scan_margin: 1000,
        }
    }
}

/// How a [`CaptureResult`] was reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    /// No fingerprint for the chat yet.
    FirstSeen,
    /// Fingerprint mismatch: different conversation under the same chat id.
    Replaced,
    /// Tail located; everything after it is new.
    Continuation,
    /// Tail located but less than the minimum change follows it.
    Duplicate,
    /// Same conversation, tail not found; resumed from the fallback window.
    Fallback,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CaptureResult {
    pub content: String,
    /// The content is a full capture rather than a continuation.
    pub is_new: bool,
    pub kind: CaptureKind,
    /// Chars found after the tail but held back as too small to send.
    pub withheld: usize,
}

impl CaptureResult {
    fn full(snapshot: &str, kind: CaptureKind) -> Self {
        Self {
            content: snapshot.to_string(),
            is_new: true,
            kind,
            withheld: 0,
        }
    }

    fn partial(content: &str, kind: CaptureKind) -> Self {
        Self {
            content: content.to_string(),
            is_new: false,
            kind,
            withheld: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct CaptureEngine {
    settings: CaptureSettings,
}

impl CaptureEngine {
    pub fn new(settings: CaptureSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Decide what part of `snapshot` should be appended for `chat_id`.
    pub fn decide(&self, snapshot: &str, chat_id: &str, state: &CaptureState) -> CaptureResult {
        let Some(fingerprint) = state.fingerprint(chat_id) else {
            debug!(chat = chat_id, "first capture");
            return CaptureResult::full(snapshot, CaptureKind::FirstSeen);
        };

        let start = conversation_start(
            snapshot,
            chat_id,
            &self.settings.resume_markers,
            self.settings.resume_marker_window,
        );
        let actual_fingerprint = char_prefix(&snapshot[start..], self.settings.fingerprint_len);
        let score = similarity(actual_fingerprint, fingerprint);
        debug!(chat = chat_id, similarity = score, "fingerprint compared");

        if score <= self.settings.similarity_threshold {
            debug!(chat = chat_id, "different conversation, full capture");
            return CaptureResult::full(snapshot, CaptureKind::Replaced);
        }

        if let Some(tail) = state.tail(chat_id).filter(|t| !t.is_empty())
            && let Some(pos) = snapshot.rfind(tail)
        {
            let new_content = &snapshot[pos + tail.len()..];
            if char_len(new_content) < self.settings.min_change_chars {
                return CaptureResult {
                    withheld: char_len(new_content),
                    ..CaptureResult::partial("", CaptureKind::Duplicate)
                };
            }
            return CaptureResult::partial(new_content, CaptureKind::Continuation);
        }

        debug!(chat = chat_id, "tail not found, resuming from fallback window");
        let safe = self.fallback_start(snapshot);
        CaptureResult::partial(&snapshot[safe..], CaptureKind::Fallback)
    }

    /// Record the fingerprint (first time only) and the tail of `snapshot`.
    pub fn update_fingerprint(&self, snapshot: &str, chat_id: &str, state: &mut CaptureState) {
        if state.fingerprint(chat_id).is_none() {
            let start = conversation_start(
                snapshot,
                chat_id,
                &self.settings.baseline_markers,
                self.settings.baseline_marker_window,
            );
            let fingerprint = char_prefix(&snapshot[start..], self.settings.fingerprint_len);
            state.set_fingerprint(chat_id, fingerprint);
            debug!(chat = chat_id, "fingerprint created");
        }
        state.set_tail(chat_id, char_suffix(snapshot, self.settings.tail_len));
    }

    // Byte offset of the resume point when the tail cannot be located: the
    // start of the fallback window, moved forward to the latest safe marker
    // that begins no later than `len - fallback_scan_margin`.
    fn fallback_start(&self, snapshot: &str) -> usize {
        let len = char_len(snapshot);
        let mut safe = byte_offset(snapshot, len.saturating_sub(self.settings.fallback_window));
        let scan_limit = byte_offset(snapshot, len.saturating_sub(self.settings.fallback_scan_margin));

        for marker in &self.settings.safe_markers {
            let found = snapshot
                .rmatch_indices(marker.as_str())
                .map(|(i, _)| i)
                .find(|&i| i <= scan_limit);
            if let Some(pos) = found
                && pos > safe
            {
                safe = pos;
            }
        }
        safe
    }
}

/// Byte offset where the conversation proper starts: the first marker in
/// `markers` whose first occurrence lies within `window` chars, else 0.
pub fn conversation_start(snapshot: &str, chat_id: &str, markers: &[String], window: usize) -> usize {
    for template in markers {
        let marker = template.replace(CHAT_PLACEHOLDER, chat_id);
        if marker.is_empty() {
            continue;
        }
        if let Some(pos) = snapshot.find(&marker)
            && char_index(snapshot, pos) < window
        {
            return pos;
        }
    }
    0
}

/// Heuristic likeness of two excerpts in `[0, 1]`.
///
/// Positional char matches over the shorter length, boosted to 80% of the
/// compared prefix when either string contains the other's first 500 chars.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let min_len = a_chars.len().min(b_chars.len());
    if min_len == 0 {
        return 0.0;
    }

    let mut matches = a_chars
        .iter()
        .zip(&b_chars)
        .filter(|(x, y)| x == y)
        .count() as f64;

    let check_len = min_len.min(500);
    let portion_a = char_prefix(a, check_len);
    let portion_b = char_prefix(b, check_len);
    if a.contains(portion_b) || b.contains(portion_a) {
        matches = matches.max(check_len as f64 * 0.8);
    }

    (matches / min_len as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CaptureState, MemoryStore};

    fn state() -> CaptureState {
        CaptureState::load(Box::new(MemoryStore::default()))
    }

    /// Run one decide/update cycle the way a session does after a delivered save.
    fn capture(engine: &CaptureEngine, state: &mut CaptureState, snapshot: &str, chat: &str) -> CaptureResult {
        let result = engine.decide(snapshot, chat, state);
        engine.update_fingerprint(snapshot, chat, state);
        result
    }

    fn turns(range: std::ops::Range<usize>) -> String {
        range
            .map(|i| format!("Human: question number {i} about the parser\nAssistant: answer number {i} with some detail\n"))
            .collect()
    }

    #[test]
    fn unseen_chat_is_full_capture() {
        let engine = CaptureEngine::default();
        let state = state();
        let snapshot = "anything at all, even without markers";
        let result = engine.decide(snapshot, "Fresh", &state);
        assert!(result.is_new);
        assert_eq!(result.content, snapshot);
        assert_eq!(result.kind, CaptureKind::FirstSeen);
    }

    #[test]
    fn unchanged_snapshot_is_duplicate() {
        let engine = CaptureEngine::default();
        let mut state = state();
        let snapshot = turns(0..5);
        capture(&engine, &mut state, &snapshot, "Chat");

        let result = engine.decide(&snapshot, "Chat", &state);
        assert_eq!(result.content, "");
        assert!(!result.is_new);
        assert_eq!(result.kind, CaptureKind::Duplicate);
        assert_eq!(result.withheld, 0);
    }

    #[test]
    fn growing_snapshot_appends_only_new_text() {
        let engine = CaptureEngine::default();
        let mut state = state();
        let s1 = turns(0..3);
        let s2 = turns(0..6);
        let s3 = turns(0..40);

        let first = capture(&engine, &mut state, &s1, "Growth");
        assert!(first.is_new);
        let second = capture(&engine, &mut state, &s2, "Growth");
        let third = capture(&engine, &mut state, &s3, "Growth");
        assert_eq!(second.kind, CaptureKind::Continuation);
        assert_eq!(third.kind, CaptureKind::Continuation);

        let appended = format!("{}{}", second.content, third.content);
        assert_eq!(format!("{}{}", first.content, appended), s3);
    }

    #[test]
    fn tail_miss_falls_back_to_bounded_window() {
        let engine = CaptureEngine::default();
        let mut state = state();
        let original = turns(0..20);
        capture(&engine, &mut state, &original, "Long");

        // Same opening turns, but the text the tail was taken from is gone.
        let reflowed = format!("{}{}", turns(0..12), turns(500..800));
        let result = engine.decide(&reflowed, "Long", &state);
        assert_eq!(result.kind, CaptureKind::Fallback);
        assert!(!result.is_new);
        assert!(!result.content.is_empty());
        assert!(char_len(&result.content) <= 10_000);
        assert!(reflowed.ends_with(&result.content));
    }

    #[test]
    fn fallback_aligns_to_latest_marker_before_scan_limit() {
        let engine = CaptureEngine::default();
        let mut state = state();
        state.set_fingerprint("Short", "Human: hello there");
        state.set_tail("Short", "text that is nowhere to be found");

        let snapshot = format!("Human: hello there\nAssistant: {}\nHuman: later{}", "x".repeat(200), "y".repeat(1200));
        let result = engine.decide(&snapshot, "Short", &state);
        assert_eq!(result.kind, CaptureKind::Fallback);
        assert!(result.content.starts_with("Human: later"));
    }

    #[test]
    fn fallback_on_tiny_snapshot_only_considers_offset_zero() {
        let engine = CaptureEngine::default();
        let mut state = state();
        state.set_fingerprint("Tiny", "Human: hi");
        let snapshot = "Human: hi\nAssistant: hello";
        let result = engine.decide(snapshot, "Tiny", &state);
        assert_eq!(result.kind, CaptureKind::Fallback);
        assert_eq!(result.content, snapshot);
    }

    #[test]
    fn similarity_boundary() {
        // 4 of 8 positions match and neither contains the other's prefix.
        let a = "abcdWXYZ";
        let b = "abcdQRST";
        assert_eq!(similarity(a, b), 0.5);
        // 5 of 8 is above the threshold.
        assert_eq!(similarity("abcdeXYZ", "abcdeRST"), 0.625);

        let engine = CaptureEngine::default();
        let mut state = state();
        state.set_fingerprint("Edge", b);

        let at_threshold = engine.decide(a, "Edge", &state);
        assert_eq!(at_threshold.kind, CaptureKind::Replaced);
        assert!(at_threshold.is_new);

        let above = engine.decide("abcdeRZZ", "Edge", &state);
        assert!(!above.is_new);
    }

    #[test]
    fn similarity_containment_boost_and_clamp() {
        // Shifted text: no positional matches, but one contains the other.
        let fp = "Human: tell me about ownership";
        let shifted = format!("  {fp}");
        let score = similarity(&shifted, fp);
        assert!((score - 0.8).abs() < 1e-9);
        assert_eq!(similarity("", "abc"), 0.0);
        assert_eq!(similarity("same", "same"), 1.0);
    }

    #[test]
    fn marker_order_beats_position() {
        let markers = CaptureSettings::default().resume_markers;
        let snapshot = "sidebar\nAssistant: earlier\nHuman: later";
        let start = conversation_start(snapshot, "Chat", &markers, 3000);
        assert_eq!(&snapshot[start..start + 6], "Human:");

        let titled = "Recent chats\nChat\nDC\nHuman: hi";
        let start = conversation_start(titled, "Chat", &markers, 3000);
        assert_eq!(&titled[start..], "Chat\nDC\nHuman: hi");
    }

    #[test]
    fn marker_outside_window_is_ignored() {
        let snapshot = format!("{}Human: late", "z".repeat(3000));
        let markers = CaptureSettings::default().resume_markers;
        assert_eq!(conversation_start(&snapshot, "Chat", &markers, 3000), 0);
    }

    #[test]
    fn fingerprint_skips_sidebar_and_is_immutable() {
        let engine = CaptureEngine::default();
        let mut state = state();
        let snapshot = "New chat\nRecents\nHuman: first question\nAssistant: reply";
        engine.update_fingerprint(snapshot, "Side", &mut state);
        assert_eq!(state.fingerprint("Side"), Some("Human: first question\nAssistant: reply"));

        engine.update_fingerprint("Human: something else entirely", "Side", &mut state);
        assert_eq!(state.fingerprint("Side"), Some("Human: first question\nAssistant: reply"));
        assert_eq!(state.tail("Side"), Some("Human: something else entirely"));
    }

    #[test]
    fn tail_is_bounded() {
        let engine = CaptureEngine::default();
        let mut state = state();
        let snapshot = "é".repeat(2500);
        engine.update_fingerprint(&snapshot, "Big", &mut state);
        assert_eq!(state.tail("Big").map(char_len), Some(1000));
        assert_eq!(state.fingerprint("Big").map(char_len), Some(1000));
    }

    #[test]
    fn scenario_demo_continuation() {
        let engine = CaptureEngine::new(CaptureSettings {
            min_change_chars: 1,
            ..CaptureSettings::default()
        });
        let mut state = state();
        let first = "Human: hi\nAssistant: hello";
        let result = capture(&engine, &mut state, first, "Demo");
        assert_eq!(result.content, first);
        assert!(result.is_new);

        let second = "Human: hi\nAssistant: hello\nHuman: more\nAssistant: ok";
        let result = engine.decide(second, "Demo", &state);
        assert_eq!(result.content, "\nHuman: more\nAssistant: ok");
        assert!(!result.is_new);

        // With the default 50-char minimum the same 26-char growth is held back.
        let result = CaptureEngine::default().decide(second, "Demo", &state);
        assert_eq!(result.kind, CaptureKind::Duplicate);
        assert_eq!(result.withheld, 26);
    }

    #[test]
    fn scenario_demo_replaced() {
        let engine = CaptureEngine::default();
        let mut state = state();
        capture(&engine, &mut state, "Human: hi\nAssistant: hello", "Demo");

        let unrelated = "Completely different page contents 0123456789";
        let result = engine.decide(unrelated, "Demo", &state);
        assert!(result.is_new);
        assert_eq!(result.content, unrelated);
        assert_eq!(result.kind, CaptureKind::Replaced);
    }
}

//! Accumulates fragments into the caller-visible response text.

use std::fmt;

use serde::Serialize;

use crate::config::PostProcessConfig;

/// Best-known response so far. Each snapshot supersedes the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PartialMessage(String);

impl PartialMessage {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PartialMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<PartialMessage> for String {
    fn from(message: PartialMessage) -> Self {
        message.0
    }
}

impl PartialEq<&str> for PartialMessage {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Text rules: boilerplate markers to remove and the end-of-sequence text.
#[derive(Debug, Clone)]
pub struct PostProcessor {
    strip: Vec<String>,
    terminator: Option<String>,
    hold_back_partial_markers: bool,
}

impl PostProcessor {
    pub fn new(config: &PostProcessConfig) -> Self {
        Self {
            strip: config.strip.clone(),
            terminator: config.terminator.clone(),
            hold_back_partial_markers: config.hold_back_partial_markers,
        }
    }

    /// Remove every occurrence of every strip marker, in configured order.
    pub fn strip_markers(&self, text: &str) -> String {
        let mut cleaned = text.to_string();
        for marker in &self.strip {
            if cleaned.contains(marker.as_str()) {
                cleaned = cleaned.replace(marker.as_str(), "");
            }
        }
        cleaned
    }

    /// Byte offset of the first end-of-sequence marker.
    pub fn find_terminator(&self, text: &str) -> Option<usize> {
        self.terminator
            .as_deref()
            .and_then(|terminator| text.find(terminator))
    }

    /// Length of the longest tail of `text` that could still grow into a marker,
    /// or zero when holding back is disabled.
    fn pending_len(&self, text: &str) -> usize {
        if !self.hold_back_partial_markers {
            return 0;
        }
        self.strip
            .iter()
            .chain(self.terminator.iter())
            .map(|marker| partial_suffix_len(text, marker))
            .max()
            .unwrap_or(0)
    }
}

impl Default for PostProcessor {
    fn default() -> Self {
        Self::new(&PostProcessConfig::default())
    }
}

fn partial_suffix_len(text: &str, marker: &str) -> usize {
    let longest = marker.len().saturating_sub(1).min(text.len());
    (1..=longest)
        .rev()
        .find(|&len| {
            marker.is_char_boundary(len)
                && text.is_char_boundary(text.len() - len)
                && text.ends_with(&marker[..len])
        })
        .unwrap_or(0)
}

/// Result of one [`PartialMessageAssembler::append`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledMessage {
    pub message: PartialMessage,
    /// The end-of-sequence text was seen; no further fragments should be consumed.
    pub finished: bool,
}

/// Raw fragment buffer plus the rules that derive the visible message from it.
///
/// The whole buffer is re-cleaned on every append because a marker can be
/// split across fragments. With `hold_back_partial_markers` set, a tail that is
/// a prefix of some marker is withheld until the next fragment resolves it, or
/// until [`flush`](Self::flush).
#[derive(Debug, Clone)]
pub struct PartialMessageAssembler {
    rules: PostProcessor,
    buffer: String,
    finished: bool,
}

impl PartialMessageAssembler {
    pub fn new(rules: PostProcessor) -> Self {
        Self {
            rules,
            buffer: String::new(),
            finished: false,
        }
    }

    pub fn append(&mut self, fragment: &str) -> AssembledMessage {
        if !self.finished {
            self.buffer.push_str(fragment);
            if let Some(position) = self.rules.find_terminator(&self.buffer) {
                self.buffer.truncate(position);
                self.finished = true;
            }
        }

        AssembledMessage {
            message: self.message(),
            finished: self.finished,
        }
    }

    /// Current visible message.
    pub fn message(&self) -> PartialMessage {
        if self.finished {
            return self.flush();
        }
        let visible = self.buffer.len() - self.rules.pending_len(&self.buffer);
        PartialMessage(self.rules.strip_markers(&self.buffer[..visible]))
    }

    /// Final message once no more fragments will arrive.
    pub fn flush(&self) -> PartialMessage {
        PartialMessage(self.rules.strip_markers(&self.buffer))
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Default for PartialMessageAssembler {
    fn default() -> Self {
        Self::new(PostProcessor::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holding_back() -> PartialMessageAssembler {
        PartialMessageAssembler::new(PostProcessor::new(&PostProcessConfig {
            hold_back_partial_markers: true,
            ..PostProcessConfig::default()
        }))
    }

    fn run(fragments: &[&str]) -> (Vec<String>, PartialMessageAssembler) {
        run_with(PartialMessageAssembler::default(), fragments)
    }

    fn run_with(
        mut assembler: PartialMessageAssembler,
        fragments: &[&str],
    ) -> (Vec<String>, PartialMessageAssembler) {
        let mut yields = Vec::new();
        for fragment in fragments {
            let assembled = assembler.append(fragment);
            yields.push(assembled.message.into_string());
            if assembled.finished {
                break;
            }
        }
        (yields, assembler)
    }

    #[test]
    fn accumulates_cumulative_text() {
        let (yields, assembler) = run(&["Hello", " there"]);
        assert_eq!(yields, vec!["Hello", "Hello there"]);
        assert!(!assembler.is_finished());
    }

    #[test]
    fn strips_role_echo_split_across_fragments() {
        let (yields, assembler) = run(&["<|start_header_id|>assis", "tant<|end_header_id|>\n", "\nHi"]);
        assert_eq!(yields.last().map(String::as_str), Some("Hi"));
        assert_eq!(assembler.flush(), "Hi");
    }

    #[test]
    fn hold_back_hides_role_echo_until_resolved() {
        let (yields, _) = run_with(
            holding_back(),
            &["<|start_header_id|>assis", "tant<|end_header_id|>\n", "\nHi"],
        );
        assert_eq!(yields, vec!["", "", "Hi"]);
    }

    #[test]
    fn strips_bare_role_echo() {
        let (yields, _) = run(&["assistant", "\n\n", "Sure."]);
        assert_eq!(yields, vec!["assistant", "", "Sure."]);
    }

    #[test]
    fn truncates_at_first_terminator_and_finishes() {
        let mut assembler = PartialMessageAssembler::default();
        assert!(!assembler.append("Done").finished);
        let assembled = assembler.append(".<|eot_id|>junk<|eot_id|>");

        assert!(assembled.finished);
        assert_eq!(assembled.message, "Done.");

        let after = assembler.append("more");
        assert!(after.finished);
        assert_eq!(after.message, "Done.");
    }

    #[test]
    fn split_terminator_is_removed_once_complete() {
        let fragments = ["Good", "bye", "<|eo", "t_id", "|>", "ignored"];
        let (yields, assembler) = run(&fragments);

        assert!(assembler.is_finished());
        assert_eq!(yields, vec!["Good", "Goodbye", "Goodbye<|eo", "Goodbye<|eot_id", "Goodbye"]);
        assert!(yields.iter().all(|y| !y.contains("<|eot_id|>")));
    }

    #[test]
    fn text_resembling_a_marker_start_is_shown_immediately() {
        let mut assembler = PartialMessageAssembler::default();
        assert_eq!(assembler.append("I saw a").message, "I saw a");
        assert_eq!(assembler.append(" <b> tag").message, "I saw a <b> tag");
        assert_eq!(assembler.append(" <").message, "I saw a <b> tag <");
    }

    #[test]
    fn hold_back_never_shows_split_terminator() {
        let fragments = ["Good", "bye", "<|eo", "t_id", "|>", "ignored"];
        let (yields, assembler) = run_with(holding_back(), &fragments);

        assert!(assembler.is_finished());
        assert_eq!(yields.last().map(String::as_str), Some("Goodbye"));
        for y in &yields {
            assert!(!y.contains("<|eo"));
        }
    }

    #[test]
    fn held_back_prefix_is_released_on_flush() {
        let mut assembler = holding_back();
        let assembled = assembler.append("Costs <");
        assert_eq!(assembled.message, "Costs ");
        assert_eq!(assembler.flush(), "Costs <");
    }

    #[test]
    fn last_message_is_concatenation_before_terminator_without_boilerplate() {
        let cases: &[&[&str]] = &[
            &["a", "b", "<|eot_id|>"],
            &["assistant\n\n", "x", "y<|eot", "_id|>z"],
            &["", "multi", "byte é", "<|eot_id|>"],
        ];
        let rules = PostProcessor::default();
        for fragments in cases {
            let joined: String = fragments.concat();
            let cut = joined.find("<|eot_id|>").expect("terminator present");
            let expected = rules.strip_markers(&joined[..cut]);

            let (yields, _) = run(fragments);
            assert_eq!(yields.last().cloned(), Some(expected));
        }
    }

    #[test]
    fn no_terminator_configured_never_finishes() {
        let rules = PostProcessor::new(&PostProcessConfig {
            strip: Vec::new(),
            terminator: None,
            hold_back_partial_markers: false,
        });
        let mut assembler = PartialMessageAssembler::new(rules);
        let assembled = assembler.append("<|eot_id|>");
        assert!(!assembled.finished);
        assert_eq!(assembled.message, "<|eot_id|>");
    }

    #[test]
    fn partial_suffix_respects_char_boundaries() {
        assert_eq!(partial_suffix_len("héllo <|s", "<|sound|>"), 3);
        assert_eq!(partial_suffix_len("é", "é!"), 2);
        assert_eq!(partial_suffix_len("abc", "xyz"), 0);
        assert_eq!(partial_suffix_len("", "<|eot_id|>"), 0);
    }
}

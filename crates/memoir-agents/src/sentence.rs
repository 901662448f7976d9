/// Flush once the buffer grows this many characters without a delimiter, so
/// long clauses still reach the TTS pipeline with bounded latency.
pub const SENTENCE_FLUSH_CHARS: usize = 60;

const DELIMITERS: [char; 5] = ['。', '！', '？', ';', '\n'];

/// Splits a streamed reply into sentences for speech synthesis.
///
/// Deltas go in as they arrive; complete sentences come out as soon as a
/// delimiter lands or the length cap is hit. The remainder is flushed when
/// the stream ends.
#[derive(Debug, Default)]
pub struct SentenceSplitter {
    buf: String,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one delta; returns every sentence completed by it.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buf.push_str(delta);
        let mut out = Vec::new();
        loop {
            if let Some((idx, ch)) = self
                .buf
                .char_indices()
                .find(|(_, c)| DELIMITERS.contains(c))
            {
                let end = idx + ch.len_utf8();
                let sentence: String = self.buf.drain(..end).collect();
                push_nonempty(&mut out, sentence);
                continue;
            }
            if self.buf.chars().count() >= SENTENCE_FLUSH_CHARS {
                let end = self
                    .buf
                    .char_indices()
                    .nth(SENTENCE_FLUSH_CHARS)
                    .map(|(b, _)| b)
                    .unwrap_or(self.buf.len());
                let sentence: String = self.buf.drain(..end).collect();
                push_nonempty(&mut out, sentence);
                continue;
            }
            break;
        }
        out
    }

    /// Flush whatever is left at stream end.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }
}

fn push_nonempty(out: &mut Vec<String>, sentence: String) {
    let trimmed = sentence.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flushes_on_each_terminal_delimiter() {
        let mut s = SentenceSplitter::new();
        assert!(s.push("今天天气").is_empty());
        assert_eq!(s.push("很好。我们"), vec!["今天天气很好。"]);
        assert_eq!(s.push("出去走走？好！"), vec!["我们出去走走？", "好！"]);
        assert!(s.finish().is_none());
    }

    #[test]
    fn semicolon_and_newline_also_split() {
        let mut s = SentenceSplitter::new();
        assert_eq!(s.push("第一段;第二段\n第三段"), vec!["第一段;", "第二段"]);
        assert_eq!(s.finish().as_deref(), Some("第三段"));
    }

    #[test]
    fn long_clause_flushes_at_the_char_cap() {
        let mut s = SentenceSplitter::new();
        let long = "字".repeat(SENTENCE_FLUSH_CHARS + 5);
        let flushed = s.push(&long);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].chars().count(), SENTENCE_FLUSH_CHARS);
        assert_eq!(s.finish().unwrap().chars().count(), 5);
    }

    #[test]
    fn whitespace_only_fragments_are_dropped() {
        let mut s = SentenceSplitter::new();
        assert!(s.push("\n\n").is_empty());
        assert!(s.push("  \n").is_empty());
        assert!(s.finish().is_none());
    }

    #[test]
    fn one_delta_may_complete_many_sentences() {
        let mut s = SentenceSplitter::new();
        let flushed = s.push("短。句。子。");
        assert_eq!(flushed, vec!["短。", "句。", "子。"]);
    }
}

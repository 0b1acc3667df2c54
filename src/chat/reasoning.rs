//! Splits generated text into answer and reasoning around a delimiter pair.
//!
//! Fragments arrive in arbitrary pieces, so a delimiter may be cut anywhere.
//! The parser keeps at most `delimiter.len() - 1` bytes of lookback.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Content(String),
    Reasoning(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Outside,
    InsideReasoning,
}

#[derive(Debug)]
pub struct ReasoningParser {
    open: String,
    close: String,
    state: State,
    /// Tail that could be the start of the delimiter we are looking for.
    lookback: String,
    /// Reasoning text waiting for its closing delimiter.
    reasoning: String,
    /// Leading whitespace after a closing delimiter is dropped.
    trim_next_content: bool,
}

pub const DEFAULT_OPEN: &str = "<think>";
pub const DEFAULT_CLOSE: &str = "</think>";

impl ReasoningParser {
    /// An empty delimiter would match everywhere; it is replaced by the default.
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        let (open, close) = (open.into(), close.into());
        if open.is_empty() || close.is_empty() {
            tracing::warn!("Empty reasoning delimiter configured, using defaults");
        }
        Self {
            open: non_empty_or(open, DEFAULT_OPEN),
            close: non_empty_or(close, DEFAULT_CLOSE),
            state: State::Outside,
            lookback: String::new(),
            reasoning: String::new(),
            trim_next_content: false,
        }
    }

    pub fn push(&mut self, fragment: &str) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut buf = std::mem::take(&mut self.lookback);
        buf.push_str(fragment);

        loop {
            match self.state {
                State::Outside => match buf.find(&self.open) {
                    Some(pos) => {
                        self.emit_content(&buf[..pos], &mut segments);
                        buf.drain(..pos + self.open.len());
                        self.state = State::InsideReasoning;
                    }
                    None => {
                        let keep = partial_suffix(&buf, &self.open);
                        let split = buf.len() - keep;
                        self.emit_content(&buf[..split], &mut segments);
                        self.lookback = buf[split..].to_string();
                        break;
                    }
                },
                State::InsideReasoning => match buf.find(&self.close) {
                    Some(pos) => {
                        self.reasoning.push_str(&buf[..pos]);
                        buf.drain(..pos + self.close.len());
                        let text = std::mem::take(&mut self.reasoning);
                        if !text.trim().is_empty() {
                            segments.push(Segment::Reasoning(text));
                        }
                        self.state = State::Outside;
                        self.trim_next_content = true;
                    }
                    None => {
                        let keep = partial_suffix(&buf, &self.close);
                        let split = buf.len() - keep;
                        self.reasoning.push_str(&buf[..split]);
                        self.lookback = buf[split..].to_string();
                        break;
                    }
                },
            }
        }
        segments
    }

    /// Flushes what is left at end of stream. Unterminated reasoning stays reasoning.
    pub fn finish(&mut self) -> Vec<Segment> {
        let mut segments = Vec::new();
        let rest = std::mem::take(&mut self.lookback);
        match self.state {
            State::Outside => self.emit_content(&rest, &mut segments),
            State::InsideReasoning => {
                self.reasoning.push_str(&rest);
                let text = std::mem::take(&mut self.reasoning);
                if !text.trim().is_empty() {
                    segments.push(Segment::Reasoning(text));
                }
            }
        }
        self.state = State::Outside;
        segments
    }

    fn emit_content(&mut self, text: &str, segments: &mut Vec<Segment>) {
        let text = if self.trim_next_content {
            let trimmed = text.trim_start();
            if !trimmed.is_empty() {
                self.trim_next_content = false;
            }
            trimmed
        } else {
            text
        };
        if !text.is_empty() {
            segments.push(Segment::Content(text.to_string()));
        }
    }
}

/// Length of the longest proper suffix of `text` that is a prefix of `delimiter`.
fn partial_suffix(text: &str, delimiter: &str) -> usize {
    let max = delimiter.len().saturating_sub(1).min(text.len());
    (1..=max)
        .rev()
        .find(|&k| {
            let start = text.len() - k;
            text.is_char_boundary(start) && delimiter.starts_with(&text[start..])
        })
        .unwrap_or(0)
}

/// Content part of a complete answer, reasoning removed.
fn non_empty_or(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

pub fn strip_reasoning(text: &str, open: &str, close: &str) -> String {
    let mut parser = ReasoningParser::new(open, close);
    let mut segments = parser.push(text);
    segments.extend(parser.finish());
    segments
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Content(text) => Some(text),
            Segment::Reasoning(_) => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(fragments: &[&str]) -> (String, String) {
        let mut parser = ReasoningParser::new("<think>", "</think>");
        let mut segments = Vec::new();
        for fragment in fragments {
            segments.extend(parser.push(fragment));
        }
        segments.extend(parser.finish());

        let mut content = String::new();
        let mut reasoning = String::new();
        for segment in segments {
            match segment {
                Segment::Content(t) => content.push_str(&t),
                Segment::Reasoning(t) => reasoning.push_str(&t),
            }
        }
        (content, reasoning)
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(run(&["Hello", ", world"]), ("Hello, world".into(), String::new()));
    }

    #[test]
    fn delimiters_in_one_fragment() {
        let (content, reasoning) = run(&["Sure. <think>check policy</think> Refunds take 30 days."]);
        assert_eq!(content, "Sure. Refunds take 30 days.");
        assert_eq!(reasoning, "check policy");
    }

    #[test]
    fn delimiters_split_across_many_reads() {
        let (content, reasoning) = run(&["<", "thi", "nk>let me ", "think</", "thi", "nk", ">\n\nAnswer", "."]);
        assert_eq!(content, "Answer.");
        assert_eq!(reasoning, "let me think");
    }

    #[test]
    fn every_split_point_gives_the_same_result() {
        let text = "A<think>r1</think>B<think>r2</think>C";
        for cut in 1..text.len() {
            let (content, reasoning) = run(&[&text[..cut], &text[cut..]]);
            assert_eq!(content, "ABC", "cut at {cut}");
            assert_eq!(reasoning, "r1r2", "cut at {cut}");
        }
    }

    #[test]
    fn lookalike_prefix_is_released_as_content() {
        let (content, reasoning) = run(&["a <thin", "g> b"]);
        assert_eq!(content, "a <thing> b");
        assert!(reasoning.is_empty());
    }

    #[test]
    fn reasoning_is_held_until_close() {
        let mut parser = ReasoningParser::new("<think>", "</think>");
        assert!(parser.push("<think>partial").is_empty());
        assert!(parser.push(" more").is_empty());
        assert_eq!(
            parser.push("</think>ok"),
            vec![
                Segment::Reasoning("partial more".into()),
                Segment::Content("ok".into())
            ]
        );
    }

    #[test]
    fn unterminated_reasoning_is_flushed_as_reasoning() {
        let (content, reasoning) = run(&["Hi <think>never closed"]);
        assert_eq!(content, "Hi ");
        assert_eq!(reasoning, "never closed");
    }

    #[test]
    fn multibyte_text_near_delimiter() {
        let (content, reasoning) = run(&["答え<th", "ink>考え</think>です"]);
        assert_eq!(content, "答えです");
        assert_eq!(reasoning, "考え");
    }

    #[test]
    fn strip_reasoning_keeps_only_answer() {
        assert_eq!(
            strip_reasoning("<think>hmm</think>\nFinal", "<think>", "</think>"),
            "Final"
        );
    }

    #[test]
    fn empty_delimiters_fall_back_to_defaults() {
        let mut parser = ReasoningParser::new("", "");
        let mut segments = parser.push("hello <think>r</think>world");
        segments.extend(parser.finish());
        assert_eq!(
            segments,
            vec![
                Segment::Content("hello ".into()),
                Segment::Reasoning("r".into()),
                Segment::Content("world".into()),
            ]
        );
    }
}

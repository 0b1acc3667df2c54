use futures_util::StreamExt;
use tokio::sync::mpsc;

use super::provider::FragmentStream;
use crate::core::errors::ApiError;

const CHANNEL_CAPACITY: usize = 32;

/// What a single upstream line means to the fragment pump.
#[derive(Debug, PartialEq)]
pub(crate) enum LineOutcome {
    Fragment(String),
    Skip,
    Finished,
    Failed(String),
}

/// Reassembles newline-delimited frames across network reads. Works on bytes so
/// a multi-byte character split between reads is decoded intact.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.trim_end_matches('\r');
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&rest).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

/// Drives `response` on a background task, turning each line into fragments.
/// The task stops as soon as the receiver is dropped.
pub(crate) fn spawn_line_pump<F>(response: reqwest::Response, mut parse: F) -> FragmentStream
where
    F: FnMut(&str) -> LineOutcome + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let mut body = response.bytes_stream();

    tokio::spawn(async move {
        let mut buffer = LineBuffer::default();
        loop {
            let item = tokio::select! {
                _ = tx.closed() => {
                    tracing::debug!("Stream consumer went away, closing upstream");
                    return;
                }
                item = body.next() => item,
            };

            let (lines, at_end) = match item {
                Some(Ok(bytes)) => (buffer.push(&bytes), false),
                Some(Err(err)) => {
                    let _ = tx
                        .send(Err(ApiError::GenerationUnavailable(err.to_string())))
                        .await;
                    return;
                }
                None => (buffer.finish().into_iter().collect(), true),
            };

            for line in lines {
                match parse(&line) {
                    LineOutcome::Fragment(text) => {
                        if tx.send(Ok(text)).await.is_err() {
                            return;
                        }
                    }
                    LineOutcome::Skip => {}
                    LineOutcome::Finished => return,
                    LineOutcome::Failed(message) => {
                        let _ = tx.send(Err(ApiError::GenerationUnavailable(message))).await;
                        return;
                    }
                }
            }

            if at_end {
                return;
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_reassembled_across_reads() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"{\"a\":").is_empty());
        assert_eq!(buffer.push(b"1}\r\n{\"b\""), vec!["{\"a\":1}".to_string()]);
        assert_eq!(buffer.push(b":2}\n\n"), vec!["{\"b\":2}".to_string()]);
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn multibyte_character_split_between_reads_survives() {
        let text = "返金ポリシー\n".as_bytes();
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(&text[..4]).is_empty());
        assert_eq!(buffer.push(&text[4..]), vec!["返金ポリシー".to_string()]);
    }

    #[test]
    fn trailing_line_without_newline_is_flushed() {
        let mut buffer = LineBuffer::default();
        buffer.push(b"data: [DONE]");
        assert_eq!(buffer.finish().as_deref(), Some("data: [DONE]"));
    }
}

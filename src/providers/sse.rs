//! Transport framing helpers shared by the streaming normalizers: SSE
//! `data:` frames and newline-delimited payloads.

use anyhow::Result;
use async_stream::try_stream;
use futures::{Stream, StreamExt};

/// Decode a byte stream into the `data:` payload of each SSE frame.
///
/// Frames are separated by a blank line; multi-line `data:` fields within one
/// frame are joined with newlines. Non-`data:` fields (comments, `event:`,
/// `id:`) are dropped. One frame is decoded at a time; nothing else is
/// buffered.
pub fn data_frames<S, B, E>(source: S) -> impl Stream<Item = Result<String>>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    try_stream! {
        futures::pin_mut!(source);
        let mut buf = String::new();
        while let Some(bytes) = source.next().await {
            let bytes = bytes?;
            buf.push_str(&String::from_utf8_lossy(bytes.as_ref()));
            while let Some(pos) = buf.find("\n\n") {
                let frame: String = buf[..pos].to_string();
                buf.drain(..pos + 2);
                if let Some(data) = frame_data(&frame) {
                    yield data;
                }
            }
        }
        // A final frame may arrive without a trailing blank line.
        if let Some(data) = frame_data(&buf) {
            yield data;
        }
    }
}

fn frame_data(frame: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in frame.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

/// Decode a byte stream into complete lines, for providers that frame their
/// stream as newline-delimited JSON or raw text.
pub fn lines<S, B, E>(source: S) -> impl Stream<Item = Result<String>>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::error::Error + Send + Sync + 'static,
{
    try_stream! {
        futures::pin_mut!(source);
        let mut buf = String::new();
        while let Some(bytes) = source.next().await {
            let bytes = bytes?;
            buf.push_str(&String::from_utf8_lossy(bytes.as_ref()));
            while let Some(pos) = buf.find('\n') {
                let mut line: String = buf[..pos].to_string();
                buf.drain(..pos + 1);
                if line.ends_with('\r') {
                    line.pop();
                }
                yield line;
            }
        }
        if !buf.is_empty() {
            yield buf;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn byte_stream(
        parts: Vec<&'static str>,
    ) -> impl Stream<Item = std::result::Result<&'static str, Infallible>> {
        futures::stream::iter(parts.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn test_data_frames_basic() {
        let source = byte_stream(vec!["data: one\n\ndata: two\n\n"]);
        let frames: Vec<_> = data_frames(source)
            .map(|frame| frame.unwrap())
            .collect()
            .await;
        assert_eq!(frames, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_data_frames_split_across_reads() {
        let source = byte_stream(vec!["data: hel", "lo\n", "\ndata: [DONE]\n\n"]);
        let frames: Vec<_> = data_frames(source)
            .map(|frame| frame.unwrap())
            .collect()
            .await;
        assert_eq!(frames, vec!["hello", "[DONE]"]);
    }

    #[tokio::test]
    async fn test_data_frames_ignores_other_fields() {
        let source = byte_stream(vec![
            "event: message\ndata: payload\nid: 3\n\n: comment only\n\n",
        ]);
        let frames: Vec<_> = data_frames(source)
            .map(|frame| frame.unwrap())
            .collect()
            .await;
        assert_eq!(frames, vec!["payload"]);
    }

    #[tokio::test]
    async fn test_data_frames_multiline_data() {
        let source = byte_stream(vec!["data: a\ndata: b\n\n"]);
        let frames: Vec<_> = data_frames(source)
            .map(|frame| frame.unwrap())
            .collect()
            .await;
        assert_eq!(frames, vec!["a\nb"]);
    }

    #[tokio::test]
    async fn test_data_frames_final_frame_without_terminator() {
        let source = byte_stream(vec!["data: tail"]);
        let frames: Vec<_> = data_frames(source)
            .map(|frame| frame.unwrap())
            .collect()
            .await;
        assert_eq!(frames, vec!["tail"]);
    }

    #[tokio::test]
    async fn test_lines_crlf_and_partial() {
        let source = byte_stream(vec!["a\r\nb", "c\nrest"]);
        let collected: Vec<_> = lines(source).map(|line| line.unwrap()).collect().await;
        assert_eq!(collected, vec!["a", "bc", "rest"]);
    }
}

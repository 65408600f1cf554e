//! Server-sent events parsing for streaming chat APIs.

use futures_util::StreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;

/// A single SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field, if present.
    pub event: Option<String>,
    /// The `data:` payload, multi-line data joined with `\n`.
    pub data: String,
}

/// Parse SSE from an HTTP response body, calling `on_event` for each event.
///
/// `on_event` returns `false` to stop reading early.
pub async fn parse_sse_stream(
    response: reqwest::Response,
    on_event: impl FnMut(SseEvent) -> bool,
) -> std::io::Result<()> {
    let byte_stream = response
        .bytes_stream()
        .map(|result| result.map_err(std::io::Error::other));
    let reader = tokio::io::BufReader::new(StreamReader::new(byte_stream));
    parse_sse_reader(reader, on_event).await
}

/// Parse SSE from any buffered reader.
pub async fn parse_sse_reader<R>(
    reader: R,
    mut on_event: impl FnMut(SseEvent) -> bool,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut current_event: Option<String> = None;
    let mut current_data = String::new();

    while let Some(line) = lines.next_line().await? {
        let line = line.strip_suffix('\r').unwrap_or(&line);

        if line.is_empty() {
            if !current_data.is_empty() {
                let event = SseEvent {
                    event: current_event.take(),
                    data: std::mem::take(&mut current_data),
                };
                if !on_event(event) {
                    return Ok(());
                }
            }
            current_event = None;
            continue;
        }

        if let Some(event_type) = field(line, "event") {
            current_event = Some(event_type.to_string());
        } else if let Some(data) = field(line, "data") {
            if !current_data.is_empty() {
                current_data.push('\n');
            }
            current_data.push_str(data);
        }
        // id:, retry: and comments are ignored
    }

    if !current_data.is_empty() {
        on_event(SseEvent {
            event: current_event,
            data: current_data,
        });
    }

    Ok(())
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

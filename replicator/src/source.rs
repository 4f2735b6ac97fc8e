use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thl::error::{ErrorKind, ThlResult};
use thl::pipeline::components::Extractor;
use thl::thl_error;
use thl::types::{ReplEvent, ReplItem, Seqno};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::debug;

/// One change event as read from the source, one JSON object per line.
#[derive(Debug, Deserialize)]
struct SourceEvent {
    seqno: Seqno,
    #[serde(default)]
    fragno: i16,
    #[serde(default = "default_last_frag")]
    last_frag: bool,
    /// Missing or empty shard ids make the event critical.
    #[serde(default)]
    shard_id: String,
    #[serde(default)]
    source_id: Option<String>,
    #[serde(default)]
    source_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    payload: serde_json::Value,
}

fn default_last_frag() -> bool {
    true
}

impl From<SourceEvent> for ReplEvent {
    fn from(source: SourceEvent) -> Self {
        let mut event = ReplEvent::new(source.seqno, source.shard_id, source.payload.to_string())
            .with_fragment(source.fragno, source.last_frag);
        if let Some(source_id) = source.source_id {
            event = event.with_source_id(source_id);
        }
        if let Some(source_timestamp) = source.source_timestamp {
            event = event.with_source_timestamp(source_timestamp);
        }

        event
    }
}

/// Extracts events from JSON lines until the reader is exhausted.
#[derive(Debug)]
pub struct JsonLinesExtractor<R> {
    lines: Lines<R>,
    line_number: u64,
}

impl<R> JsonLinesExtractor<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_number: 0,
        }
    }
}

#[async_trait]
impl<R> Extractor for JsonLinesExtractor<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn extract(&mut self) -> ThlResult<Option<ReplItem>> {
        loop {
            let line = self.lines.next_line().await.map_err(|err| {
                thl_error!(
                    ErrorKind::SourceIoError,
                    "Failed to read source events",
                    source: err
                )
            })?;
            let Some(line) = line else {
                debug!(lines = self.line_number, "source input ended");
                return Ok(None);
            };
            self.line_number += 1;

            if line.trim().is_empty() {
                continue;
            }

            let event: SourceEvent = serde_json::from_str(&line).map_err(|err| {
                thl_error!(
                    ErrorKind::ExtractFailed,
                    "Invalid source event",
                    format!("line {}", self.line_number),
                    source: err
                )
            })?;

            return Ok(Some(ReplItem::Event(event.into())));
        }
    }
}

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::error::ThlResult;
use crate::pipeline::components::Extractor;
use crate::types::ReplItem;

/// Extracts a fixed list of items.
#[derive(Debug, Clone)]
pub struct IteratorExtractor {
    items: VecDeque<ReplItem>,
    hold_open: bool,
}

impl IteratorExtractor {
    /// Ends the input after the last item.
    pub fn new(items: impl IntoIterator<Item = ReplItem>) -> Self {
        Self {
            items: items.into_iter().collect(),
            hold_open: false,
        }
    }

    /// Waits forever after the last item, like a source with no new changes.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

#[async_trait]
impl Extractor for IteratorExtractor {
    async fn extract(&mut self) -> ThlResult<Option<ReplItem>> {
        if let Some(item) = self.items.pop_front() {
            return Ok(Some(item));
        }

        if self.hold_open {
            futures::future::pending::<()>().await;
        }

        Ok(None)
    }
}

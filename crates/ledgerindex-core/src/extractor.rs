//! Batch extractor: turns a block batch into an ordered list of domain events.
//!
//! Output order is part of the contract: events come out sorted by
//! `(block_height, log_index)` no matter how the source arranged them,
//! because the reconciler applies balance deltas sequentially.

use chrono::DateTime;
use tracing::{debug, trace};

use crate::decoder::EventDecoder;
use crate::error::IndexerError;
use crate::event::DomainEvent;
use crate::types::{Batch, EventFilter};

/// Scans batches for logs matching a filter and decodes them.
pub struct BatchExtractor<D> {
    decoder: D,
    filter: EventFilter,
}

impl<D: EventDecoder> BatchExtractor<D> {
    pub fn new(decoder: D, filter: EventFilter) -> Self {
        Self { decoder, filter }
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    /// Extract every matching event of `batch`, ordered by height then log index.
    ///
    /// Logs from other contracts or with unknown signatures are dropped. A
    /// matching log without a parent transaction, a block without a valid
    /// timestamp, or an undecodable payload aborts the whole batch.
    pub fn extract(&self, batch: &Batch) -> Result<Vec<DomainEvent>, IndexerError> {
        let mut events = Vec::new();

        for block in &batch.blocks {
            let height = block.number();
            if !self.filter.matches_height(height) {
                continue;
            }

            for log in &block.logs {
                if !self.filter.matches_address(&log.address) {
                    continue;
                }
                let Some(topic0) = log.topic0() else {
                    continue;
                };
                if !self.filter.matches_topic0(topic0) {
                    continue;
                }

                let tx = log.transaction.as_ref().ok_or_else(|| {
                    IndexerError::malformed(
                        height,
                        format!("log {} arrived without a parent transaction", log.log_index),
                    )
                })?;

                let kind = match self.decoder.decode(&log.topics, &log.data) {
                    Ok(Some(kind)) => kind,
                    Ok(None) => {
                        trace!(height, log_index = log.log_index, topic0, "unrecognized signature");
                        continue;
                    }
                    Err(e) => {
                        return Err(IndexerError::malformed(
                            height,
                            format!("log {}: {e}", log.log_index),
                        ))
                    }
                };

                let timestamp = DateTime::from_timestamp(block.header.timestamp, 0)
                    .ok_or_else(|| {
                        IndexerError::malformed(
                            height,
                            format!("invalid block timestamp {}", block.header.timestamp),
                        )
                    })?;

                events.push(DomainEvent::new(
                    height,
                    log.log_index,
                    timestamp,
                    tx.hash.clone(),
                    tx.from.clone(),
                    kind,
                ));
            }
        }

        // Stable: equal positions keep their delivered order.
        events.sort_by_key(DomainEvent::position);

        debug!(
            blocks = batch.blocks.len(),
            logs = batch.log_count(),
            events = events.len(),
            "batch extracted"
        );
        Ok(events)
    }
}

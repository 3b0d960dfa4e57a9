//! ledgerindex-core — batch ingestion and ledger reconciliation engine.
//!
//! # Architecture
//!
//! ```text
//! ChainSource ──batch──▶ RunLoop
//!                          ├── BatchExtractor    (filter + EventDecoder, source order)
//!                          ├── LedgerReconciler  (batched reads + pure fold)
//!                          ├── Cursor            (checkpoint + finalized height)
//!                          └── LedgerStore       (atomic commit / rollback)
//! ```
//!
//! Chain-specific pieces (EVM decoding, RPC fetching) live in
//! `ledgerindex-evm`; SQL backends live in `ledgerindex-storage`.

pub mod checkpoint;
pub mod cursor;
pub mod decoder;
pub mod entity;
pub mod error;
pub mod event;
pub mod extractor;
pub mod index_loop;
pub mod indexer;
pub mod reconciler;
pub mod reorg;
pub mod retry;
pub mod source;
pub mod store;
pub mod tracker;
pub mod types;

pub use checkpoint::Checkpoint;
pub use cursor::Cursor;
pub use decoder::{DecodeError, EventDecoder};
pub use entity::{OwnerAccount, PaymentRecord, TransferRecord};
pub use error::IndexerError;
pub use event::{DomainEvent, EventKind, PaymentEvent, TransferEvent};
pub use extractor::BatchExtractor;
pub use index_loop::{CommitSummary, LoopStatus, RunLoop, StepOutcome, StopHandle};
pub use indexer::{IndexerConfig, IndexerState};
pub use reconciler::{fold, LedgerChanges, LedgerReconciler, LedgerSnapshot};
pub use reorg::{ReorgDetector, ReorgEvent};
pub use retry::{RetryConfig, RetryPolicy};
pub use source::{ChainSource, ReplaySource};
pub use store::{BatchWrites, LedgerStore, MemoryLedgerStore, RollbackSummary};
pub use tracker::BlockTracker;
pub use types::{Batch, BlockSummary, EventFilter, RawLog, SourceBlock, TxRef};

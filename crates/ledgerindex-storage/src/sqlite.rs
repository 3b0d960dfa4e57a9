//! SQLite ledger backend.
//!
//! Persists owner accounts, transfers, payments and checkpoints to a single
//! SQLite file. Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use ledgerindex_storage::sqlite::SqliteLedgerStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteLedgerStore::open("./ledger.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteLedgerStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnection, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use ledgerindex_core::checkpoint::Checkpoint;
use ledgerindex_core::entity::{reversal_deltas, OwnerAccount, PaymentRecord, TransferRecord};
use ledgerindex_core::error::IndexerError;
use ledgerindex_core::store::{rollback_rewrites, BatchWrites, LedgerStore, RollbackSummary};

use crate::codec::{
    db_err, parse_bigint, parse_u256, to_db_height, to_height, to_timestamp, LOOKUP_CHUNK,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS owner_accounts (
        address TEXT PRIMARY KEY,
        balance TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS transfers (
        id           TEXT    PRIMARY KEY,
        from_id      TEXT    REFERENCES owner_accounts (address),
        to_id        TEXT    REFERENCES owner_accounts (address),
        amount       TEXT    NOT NULL,
        block_height INTEGER NOT NULL,
        timestamp    INTEGER NOT NULL,
        source_hash  TEXT    NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_transfers_block ON transfers (block_height)",
    "CREATE INDEX IF NOT EXISTS idx_transfers_timestamp ON transfers (timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_transfers_from ON transfers (from_id)",
    "CREATE INDEX IF NOT EXISTS idx_transfers_to ON transfers (to_id)",
    "CREATE TABLE IF NOT EXISTS payments (
        id             TEXT    PRIMARY KEY,
        token          TEXT    NOT NULL,
        payer          TEXT    NOT NULL,
        amount         TEXT    NOT NULL,
        merchant       TEXT    NOT NULL,
        royalty_amount TEXT    NOT NULL,
        block_height   INTEGER NOT NULL,
        timestamp      INTEGER NOT NULL,
        source_hash    TEXT    NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_payments_block ON payments (block_height)",
    "CREATE INDEX IF NOT EXISTS idx_payments_timestamp ON payments (timestamp)",
    "CREATE TABLE IF NOT EXISTS checkpoints (
        indexer_id TEXT    PRIMARY KEY,
        height     INTEGER NOT NULL,
        block_hash TEXT    NOT NULL,
        is_final   INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
];

/// SQLite-backed [`LedgerStore`].
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./ledger.db"`) or a full
    /// SQLite URL (`"sqlite:./ledger.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(db_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        debug!(%url, "sqlite ledger store opened");
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every connection to `sqlite::memory:` sees its own database, so the
    /// pool is pinned to one connection that is never recycled.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    /// Ids among `ids` present in `table`.
    async fn existing_ids(&self, table: &str, ids: &[String]) -> Result<HashSet<String>, IndexerError> {
        let mut found = HashSet::new();
        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("SELECT id FROM {table} WHERE id IN ("));
            let mut list = qb.separated(", ");
            for id in chunk {
                list.push_bind(id);
            }
            list.push_unseparated(")");
            let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
            for row in rows {
                found.insert(row.try_get::<String, _>("id").map_err(db_err)?);
            }
        }
        Ok(found)
    }

    async fn count(&self, table: &str) -> Result<u64, IndexerError> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS cnt FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let cnt: i64 = row.try_get("cnt").map_err(db_err)?;
        to_height("count", cnt)
    }
}

/// Accounts among `addresses`, read on `conn` so it works inside a transaction.
async fn load_accounts(
    conn: &mut SqliteConnection,
    addresses: &[String],
) -> Result<Vec<OwnerAccount>, IndexerError> {
    let mut accounts = Vec::with_capacity(addresses.len());
    for chunk in addresses.chunks(LOOKUP_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT address, balance FROM owner_accounts WHERE address IN (");
        let mut list = qb.separated(", ");
        for address in chunk {
            list.push_bind(address);
        }
        list.push_unseparated(")");
        for row in qb.build().fetch_all(&mut *conn).await.map_err(db_err)? {
            accounts.push(account_from_row(&row)?);
        }
    }
    Ok(accounts)
}

fn account_from_row(row: &SqliteRow) -> Result<OwnerAccount, IndexerError> {
    let balance: String = row.try_get("balance").map_err(db_err)?;
    Ok(OwnerAccount::with_balance(
        row.try_get::<String, _>("address").map_err(db_err)?,
        parse_bigint("balance", &balance)?,
    ))
}

fn payment_from_row(row: &SqliteRow) -> Result<PaymentRecord, IndexerError> {
    let amount: String = row.try_get("amount").map_err(db_err)?;
    let royalty: String = row.try_get("royalty_amount").map_err(db_err)?;
    Ok(PaymentRecord {
        id: row.try_get("id").map_err(db_err)?,
        token: row.try_get("token").map_err(db_err)?,
        payer: row.try_get("payer").map_err(db_err)?,
        amount: parse_u256("amount", &amount)?,
        merchant: row.try_get("merchant").map_err(db_err)?,
        royalty_amount: parse_u256("royalty_amount", &royalty)?,
        block_height: to_height("block_height", row.try_get("block_height").map_err(db_err)?)?,
        timestamp: to_timestamp("timestamp", row.try_get("timestamp").map_err(db_err)?)?,
        source_hash: row.try_get("source_hash").map_err(db_err)?,
    })
}

fn transfer_from_row(row: &SqliteRow) -> Result<TransferRecord, IndexerError> {
    let amount: String = row.try_get("amount").map_err(db_err)?;
    Ok(TransferRecord {
        id: row.try_get("id").map_err(db_err)?,
        from: row.try_get("from_id").map_err(db_err)?,
        to: row.try_get("to_id").map_err(db_err)?,
        amount: parse_u256("amount", &amount)?,
        block_height: to_height("block_height", row.try_get("block_height").map_err(db_err)?)?,
        timestamp: to_timestamp("timestamp", row.try_get("timestamp").map_err(db_err)?)?,
        source_hash: row.try_get("source_hash").map_err(db_err)?,
    })
}

async fn read_checkpoint(
    conn: &mut SqliteConnection,
    indexer_id: &str,
) -> Result<Option<Checkpoint>, IndexerError> {
    let row = sqlx::query(
        "SELECT indexer_id, height, block_hash, is_final, updated_at
         FROM checkpoints WHERE indexer_id = ?",
    )
    .bind(indexer_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;

    row.map(|r| -> Result<Checkpoint, IndexerError> {
        Ok(Checkpoint {
            indexer_id: r.try_get("indexer_id").map_err(db_err)?,
            height: to_height("height", r.try_get("height").map_err(db_err)?)?,
            block_hash: r.try_get("block_hash").map_err(db_err)?,
            is_final: r.try_get("is_final").map_err(db_err)?,
            updated_at: r.try_get("updated_at").map_err(db_err)?,
        })
    })
    .transpose()
}

async fn upsert_checkpoint(conn: &mut SqliteConnection, cp: &Checkpoint) -> Result<(), IndexerError> {
    sqlx::query(
        "INSERT INTO checkpoints (indexer_id, height, block_hash, is_final, updated_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (indexer_id) DO UPDATE SET
             height = excluded.height,
             block_hash = excluded.block_hash,
             is_final = excluded.is_final,
             updated_at = excluded.updated_at",
    )
    .bind(&cp.indexer_id)
    .bind(to_db_height("height", cp.height)?)
    .bind(&cp.block_hash)
    .bind(cp.is_final)
    .bind(cp.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

// ─── LedgerStore impl ────────────────────────────────────────────────────────

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn load_checkpoint(&self, indexer_id: &str) -> Result<Option<Checkpoint>, IndexerError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        read_checkpoint(&mut conn, indexer_id).await
    }

    async fn find_accounts(&self, addresses: &[String]) -> Result<Vec<OwnerAccount>, IndexerError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        load_accounts(&mut conn, addresses).await
    }

    async fn existing_transfer_ids(&self, ids: &[String]) -> Result<HashSet<String>, IndexerError> {
        self.existing_ids("transfers", ids).await
    }

    async fn existing_payment_ids(&self, ids: &[String]) -> Result<HashSet<String>, IndexerError> {
        self.existing_ids("payments", ids).await
    }

    async fn commit_batch(&self, writes: &BatchWrites) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let stored = read_checkpoint(&mut tx, &writes.checkpoint.indexer_id).await?;
        if !writes.check_parent(stored.as_ref())? {
            debug!(height = writes.checkpoint.height, "batch already committed");
            return Ok(());
        }

        // Accounts first: transfers reference them.
        for account in &writes.changes.accounts {
            sqlx::query(
                "INSERT INTO owner_accounts (address, balance) VALUES (?, ?)
                 ON CONFLICT (address) DO UPDATE SET balance = excluded.balance",
            )
            .bind(&account.address)
            .bind(account.balance.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        for t in &writes.changes.transfers {
            sqlx::query(
                "INSERT INTO transfers (id, from_id, to_id, amount, block_height, timestamp, source_hash)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(&t.id)
            .bind(&t.from)
            .bind(&t.to)
            .bind(t.amount.to_string())
            .bind(to_db_height("block_height", t.block_height)?)
            .bind(t.timestamp.timestamp())
            .bind(&t.source_hash)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        for p in &writes.changes.payments {
            sqlx::query(
                "INSERT INTO payments
                 (id, token, payer, amount, merchant, royalty_amount, block_height, timestamp, source_hash)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(&p.id)
            .bind(&p.token)
            .bind(&p.payer)
            .bind(p.amount.to_string())
            .bind(&p.merchant)
            .bind(p.royalty_amount.to_string())
            .bind(to_db_height("block_height", p.block_height)?)
            .bind(p.timestamp.timestamp())
            .bind(&p.source_hash)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        upsert_checkpoint(&mut tx, &writes.checkpoint).await?;
        tx.commit().await.map_err(db_err)?;

        debug!(
            indexer_id = %writes.checkpoint.indexer_id,
            height = writes.checkpoint.height,
            accounts = writes.changes.accounts.len(),
            records = writes.changes.record_count(),
            "batch committed"
        );
        Ok(())
    }

    async fn rollback_from(
        &self,
        indexer_id: &str,
        height: u64,
    ) -> Result<RollbackSummary, IndexerError> {
        let db_height = to_db_height("height", height)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let rows = sqlx::query(
            "SELECT id, from_id, to_id, amount, block_height, timestamp, source_hash
             FROM transfers WHERE block_height >= ?",
        )
        .bind(db_height)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        let discarded = rows
            .iter()
            .map(transfer_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let deltas = reversal_deltas(&discarded);
        let touched: Vec<String> = deltas.keys().cloned().collect();

        let mut accounts_adjusted = 0u64;
        for mut account in load_accounts(&mut tx, &touched).await? {
            if let Some(delta) = deltas.get(&account.address) {
                account.apply_delta(delta);
            }
            sqlx::query("UPDATE owner_accounts SET balance = ? WHERE address = ?")
                .bind(account.balance.to_string())
                .bind(&account.address)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            accounts_adjusted += 1;
        }

        let transfers_removed = sqlx::query("DELETE FROM transfers WHERE block_height >= ?")
            .bind(db_height)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();
        let payments_removed = sqlx::query("DELETE FROM payments WHERE block_height >= ?")
            .bind(db_height)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();

        let mut accounts_removed = 0u64;
        for chunk in touched.chunks(LOOKUP_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM owner_accounts WHERE address IN (");
            let mut list = qb.separated(", ");
            for address in chunk {
                list.push_bind(address);
            }
            list.push_unseparated(
                ") AND NOT EXISTS (SELECT 1 FROM transfers t
                   WHERE t.from_id = owner_accounts.address OR t.to_id = owner_accounts.address)",
            );
            accounts_removed += qb
                .build()
                .execute(&mut *tx)
                .await
                .map_err(db_err)?
                .rows_affected();
        }

        let stored = read_checkpoint(&mut tx, indexer_id).await?;
        if rollback_rewrites(stored.as_ref(), height) {
            upsert_checkpoint(&mut tx, &Checkpoint::rolled_back(indexer_id, height)).await?;
        }
        tx.commit().await.map_err(db_err)?;

        debug!(indexer_id, height, transfers_removed, payments_removed, "rolled back storage");
        Ok(RollbackSummary {
            from_height: height,
            transfers_removed,
            payments_removed,
            accounts_adjusted,
            accounts_removed,
        })
    }

    async fn account(&self, address: &str) -> Result<Option<OwnerAccount>, IndexerError> {
        sqlx::query("SELECT address, balance FROM owner_accounts WHERE address = ?")
            .bind(address)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .as_ref()
            .map(account_from_row)
            .transpose()
    }

    async fn transfer_count(&self) -> Result<u64, IndexerError> {
        self.count("transfers").await
    }

    async fn payment(&self, id: &str) -> Result<Option<PaymentRecord>, IndexerError> {
        sqlx::query(
            "SELECT id, token, payer, amount, merchant, royalty_amount, block_height, timestamp, source_hash
             FROM payments WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .as_ref()
        .map(payment_from_row)
        .transpose()
    }

    async fn payment_count(&self) -> Result<u64, IndexerError> {
        self.count("payments").await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

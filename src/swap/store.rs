use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension as _, Row, params, params_from_iter};

use super::{DepositAddress, NewSwapPayment, PENDING_REDEEM_HORIZON, SwapRecord};

/// Durable record of swap payments.
///
/// `insert_if_absent` is the only guard against paying the same claim
/// twice, across restarts and across instances, so implementations must
/// make it atomic.
#[async_trait]
pub trait SwapLedger: Send + Sync {
    /// Returns `false` if a record for the payment hash already exists.
    async fn insert_if_absent(&self, payment: &NewSwapPayment) -> Result<bool>;

    /// Stores the preimage of a swap. Returns `false` if the hash is
    /// unknown; fails if a different preimage is already stored.
    async fn set_preimage(&self, payment_hash: &str, preimage: &str) -> Result<bool>;

    /// Returns `false` if the hash is unknown.
    async fn append_redeem_tx(&self, payment_hash: &str, txid: &str) -> Result<bool>;

    async fn set_confirmed(&self, payment_hash: &str) -> Result<()>;

    /// Records with a preimage and no confirmed redeem, oldest confirmation
    /// first.
    async fn list_pending_redeems(&self, current_height: u32) -> Result<Vec<SwapRecord>>;

    async fn get_swap(&self, payment_hash: &str) -> Result<Option<SwapRecord>>;

    /// Associates a freshly issued swap address with its payment hash and
    /// notification token. Repeated calls only add tokens.
    async fn track_deposit_address(
        &self,
        address: &str,
        payment_hash: &str,
        notification_token: &str,
    ) -> Result<()>;

    async fn get_deposit_address(&self, address: &str) -> Result<Option<DepositAddress>>;

    async fn has_filtered_address(&self, addresses: &[String]) -> Result<bool>;
}

/// Oldest confirmation height still worth scanning at `current_height`.
pub fn pending_horizon(current_height: u32) -> u32 {
    current_height.saturating_sub(PENDING_REDEEM_HORIZON)
}

#[derive(Debug, Clone)]
pub struct SqliteSwapLedger {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteSwapLedger {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create swap ledger dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn add_filtered_address(&self, address: &str) -> Result<()> {
        let address = address.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO filtered_addresses (address) VALUES (?1)",
                params![&address],
            )
            .with_context(|| format!("insert filtered address {address}"))?;
            Ok(())
        })
        .await
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("swap ledger mutex poisoned"))?;
            f(&mut conn)
        })
        .await
        .context("join swap ledger task")?
    }
}

#[async_trait]
impl SwapLedger for SqliteSwapLedger {
    async fn insert_if_absent(&self, payment: &NewSwapPayment) -> Result<bool> {
        let payment = payment.clone();
        self.call(move |conn| {
            let utxos = serde_json::to_string(&payment.utxos).context("encode utxos")?;
            let rows = conn
                .execute(
                    r#"
INSERT INTO swap_payments (
  payment_hash,
  payment_request,
  lock_height,
  confirmation_height,
  utxos,
  redeem_confirmed
) VALUES (
  ?1, ?2, ?3, ?4, ?5, 0
)
ON CONFLICT(payment_hash) DO NOTHING
"#,
                    params![
                        &payment.payment_hash,
                        &payment.payment_request,
                        payment.lock_height,
                        payment.confirmation_height,
                        utxos,
                    ],
                )
                .with_context(|| format!("insert swap payment {}", payment.payment_hash))?;
            Ok(rows == 1)
        })
        .await
    }

    async fn set_preimage(&self, payment_hash: &str, preimage: &str) -> Result<bool> {
        let payment_hash = payment_hash.to_string();
        let preimage = preimage.to_string();
        self.call(move |conn| {
            let tx = conn.transaction().context("begin set preimage")?;
            let existing: Option<Option<String>> = tx
                .query_row(
                    "SELECT payment_preimage FROM swap_payments WHERE payment_hash = ?1",
                    params![&payment_hash],
                    |row| row.get(0),
                )
                .optional()
                .with_context(|| format!("get preimage {payment_hash}"))?;

            match existing {
                None => Ok(false),
                Some(Some(stored)) => {
                    anyhow::ensure!(
                        stored == preimage,
                        "swap {payment_hash} already has a different preimage"
                    );
                    Ok(true)
                }
                Some(None) => {
                    tx.execute(
                        "UPDATE swap_payments SET payment_preimage = ?2 WHERE payment_hash = ?1",
                        params![&payment_hash, &preimage],
                    )
                    .with_context(|| format!("update preimage {payment_hash}"))?;
                    tx.commit().context("commit set preimage")?;
                    Ok(true)
                }
            }
        })
        .await
    }

    async fn append_redeem_tx(&self, payment_hash: &str, txid: &str) -> Result<bool> {
        let payment_hash = payment_hash.to_string();
        let txid = txid.to_string();
        self.call(move |conn| {
            let tx = conn.transaction().context("begin append redeem tx")?;
            let exists = tx
                .query_row(
                    "SELECT 1 FROM swap_payments WHERE payment_hash = ?1",
                    params![&payment_hash],
                    |_| Ok(()),
                )
                .optional()
                .with_context(|| format!("get swap payment {payment_hash}"))?
                .is_some();
            if !exists {
                return Ok(false);
            }

            tx.execute(
                r#"
INSERT INTO swap_redeem_txs (payment_hash, seq, txid)
SELECT ?1, COALESCE(MAX(seq), -1) + 1, ?2
FROM swap_redeem_txs
WHERE payment_hash = ?1
"#,
                params![&payment_hash, &txid],
            )
            .with_context(|| format!("append redeem tx {txid} to {payment_hash}"))?;
            tx.commit().context("commit append redeem tx")?;
            Ok(true)
        })
        .await
    }

    async fn set_confirmed(&self, payment_hash: &str) -> Result<()> {
        let payment_hash = payment_hash.to_string();
        self.call(move |conn| {
            let rows = conn
                .execute(
                    "UPDATE swap_payments SET redeem_confirmed = 1 WHERE payment_hash = ?1",
                    params![&payment_hash],
                )
                .with_context(|| format!("set redeem confirmed {payment_hash}"))?;
            anyhow::ensure!(rows == 1, "swap payment not found: {payment_hash}");
            Ok(())
        })
        .await
    }

    async fn list_pending_redeems(&self, current_height: u32) -> Result<Vec<SwapRecord>> {
        let ignore_before = pending_horizon(current_height);
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    r#"
SELECT {SWAP_COLUMNS}
FROM swap_payments
WHERE redeem_confirmed = 0
  AND payment_preimage IS NOT NULL
  AND confirmation_height > ?1
ORDER BY confirmation_height, payment_hash
"#
                ))
                .context("prepare list pending redeems")?;

            let rows = stmt
                .query_map(params![ignore_before], swap_from_row)
                .context("query pending redeems")?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row.context("read swap payment row")?);
            }
            for record in &mut out {
                record.redeem_txids = redeem_txids(conn, &record.payment_hash)?;
            }
            Ok(out)
        })
        .await
    }

    async fn get_swap(&self, payment_hash: &str) -> Result<Option<SwapRecord>> {
        let payment_hash = payment_hash.to_string();
        self.call(move |conn| {
            let record = conn
                .query_row(
                    &format!("SELECT {SWAP_COLUMNS} FROM swap_payments WHERE payment_hash = ?1"),
                    params![&payment_hash],
                    swap_from_row,
                )
                .optional()
                .with_context(|| format!("get swap payment {payment_hash}"))?;

            let Some(mut record) = record else {
                return Ok(None);
            };
            record.redeem_txids = redeem_txids(conn, &record.payment_hash)?;
            Ok(Some(record))
        })
        .await
    }

    async fn track_deposit_address(
        &self,
        address: &str,
        payment_hash: &str,
        notification_token: &str,
    ) -> Result<()> {
        let address = address.to_string();
        let payment_hash = payment_hash.to_string();
        let notification_token = notification_token.to_string();
        self.call(move |conn| {
            let tx = conn.transaction().context("begin track deposit address")?;
            tx.execute(
                r#"
INSERT INTO deposit_addresses (address, payment_hash)
VALUES (?1, ?2)
ON CONFLICT(address) DO UPDATE SET payment_hash = excluded.payment_hash
"#,
                params![&address, &payment_hash],
            )
            .with_context(|| format!("insert deposit address {address}"))?;

            if !notification_token.is_empty() {
                tx.execute(
                    "INSERT OR IGNORE INTO deposit_notification_tokens (address, token) VALUES (?1, ?2)",
                    params![&address, &notification_token],
                )
                .with_context(|| format!("insert notification token for {address}"))?;
            }

            tx.commit().context("commit track deposit address")?;
            Ok(())
        })
        .await
    }

    async fn get_deposit_address(&self, address: &str) -> Result<Option<DepositAddress>> {
        let address = address.to_string();
        self.call(move |conn| {
            let found = conn
                .query_row(
                    "SELECT payment_hash FROM deposit_addresses WHERE address = ?1",
                    params![&address],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .with_context(|| format!("get deposit address {address}"))?;

            let Some(payment_hash) = found else {
                return Ok(None);
            };

            let mut stmt = conn
                .prepare(
                    "SELECT token FROM deposit_notification_tokens WHERE address = ?1 ORDER BY token",
                )
                .context("prepare list notification tokens")?;
            let notification_tokens = stmt
                .query_map(params![&address], |row| row.get::<_, String>(0))
                .context("query notification tokens")?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("read notification token row")?;

            Ok(Some(DepositAddress {
                address,
                payment_hash,
                notification_tokens,
            }))
        })
        .await
    }

    async fn has_filtered_address(&self, addresses: &[String]) -> Result<bool> {
        if addresses.is_empty() {
            return Ok(false);
        }

        let addresses = addresses.to_vec();
        self.call(move |conn| {
            let placeholders = vec!["?"; addresses.len()].join(", ");
            let count: i64 = conn
                .query_row(
                    &format!(
                        "SELECT COUNT(*) FROM filtered_addresses WHERE address IN ({placeholders})"
                    ),
                    params_from_iter(addresses.iter()),
                    |row| row.get(0),
                )
                .context("count filtered addresses")?;
            Ok(count > 0)
        })
        .await
    }
}

const SWAP_COLUMNS: &str = r#"
  payment_hash,
  payment_request,
  lock_height,
  confirmation_height,
  utxos,
  payment_preimage,
  redeem_confirmed
"#;

fn swap_from_row(row: &Row<'_>) -> rusqlite::Result<SwapRecord> {
    let utxos_json: String = row.get(4)?;
    let utxos: Vec<String> = serde_json::from_str(&utxos_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(SwapRecord {
        payment_hash: row.get(0)?,
        payment_request: row.get(1)?,
        lock_height: u32_column(row, 2, "lock_height")?,
        confirmation_height: u32_column(row, 3, "confirmation_height")?,
        utxos,
        preimage: row.get(5)?,
        redeem_txids: Vec::new(),
        redeem_confirmed: row.get(6)?,
    })
}

fn u32_column(row: &Row<'_>, idx: usize, name: &str) -> rusqlite::Result<u32> {
    let value: i64 = row.get(idx)?;
    u32::try_from(value).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Integer,
            format!("invalid {name} {value}").into(),
        )
    })
}

fn redeem_txids(conn: &Connection, payment_hash: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare_cached("SELECT txid FROM swap_redeem_txs WHERE payment_hash = ?1 ORDER BY seq")
        .context("prepare list redeem txs")?;
    let txids = stmt
        .query_map(params![payment_hash], |row| row.get::<_, String>(0))
        .context("query redeem txs")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("read redeem txs of {payment_hash}"))?;
    Ok(txids)
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS swap_payments (
  payment_hash TEXT PRIMARY KEY,
  payment_request TEXT NOT NULL,
  lock_height INTEGER NOT NULL,
  confirmation_height INTEGER NOT NULL,
  utxos TEXT NOT NULL,
  payment_preimage TEXT,
  redeem_confirmed INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS swap_payments_pending_idx
  ON swap_payments(redeem_confirmed, confirmation_height);

CREATE TABLE IF NOT EXISTS swap_redeem_txs (
  payment_hash TEXT NOT NULL REFERENCES swap_payments(payment_hash),
  seq INTEGER NOT NULL,
  txid TEXT NOT NULL,
  PRIMARY KEY (payment_hash, seq)
);

CREATE TABLE IF NOT EXISTS deposit_addresses (
  address TEXT PRIMARY KEY,
  payment_hash TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS deposit_notification_tokens (
  address TEXT NOT NULL REFERENCES deposit_addresses(address),
  token TEXT NOT NULL,
  PRIMARY KEY (address, token)
);

CREATE TABLE IF NOT EXISTS filtered_addresses (
  address TEXT PRIMARY KEY
);
"#,
    )
    .context("create tables")?;
    Ok(())
}

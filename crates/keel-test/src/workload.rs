//! Workload generators.
//!
//! [`run_transaction`] drives one logical transaction to completion,
//! retrying on deadlocks, lock timeouts and write conflicts. [`Bank`] is the
//! classic transfer workload whose total balance must never change.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use keel_common::config::Isolation;
use keel_common::error::KeelResult;
use keel_common::types::{ResourceId, Timestamp, TxnId};
use keel_txn::TransactionManager;
use rand::Rng;
use tracing::debug;

use crate::utils::{decode_i64, encode_i64};

/// Result of a transaction driven by [`run_transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed<T> {
    /// Value returned by the body of the successful attempt.
    pub value: T,
    /// Commit timestamp of the successful attempt.
    pub commit_ts: Timestamp,
    /// Number of attempts, including the successful one.
    pub attempts: usize,
}

/// Runs `body` in a fresh transaction and commits it, retrying retryable
/// failures up to `max_attempts` times with a short randomized backoff.
///
/// A failed attempt is always aborted before the next one begins.
pub fn run_transaction<T>(
    tm: &TransactionManager,
    isolation: Isolation,
    max_attempts: usize,
    mut body: impl FnMut(TxnId) -> KeelResult<T>,
) -> KeelResult<Committed<T>> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let txn = tm.begin_with_isolation(isolation)?;
        let err = match body(txn).and_then(|value| tm.commit(txn).map(|ts| (value, ts))) {
            Ok((value, commit_ts)) => {
                return Ok(Committed {
                    value,
                    commit_ts,
                    attempts,
                })
            }
            Err(err) => err,
        };

        // Failures that end the transaction already aborted it.
        let _ = tm.abort(txn);
        if !err.is_retryable() || attempts >= max_attempts {
            return Err(err);
        }
        debug!(txn = %txn, attempts, error = %err, "retrying transaction");
        backoff(attempts);
    }
}

fn backoff(attempts: usize) {
    let ceiling = attempts.min(8) as u64 * 100;
    let micros = rand::thread_rng().gen_range(0..=ceiling);
    thread::sleep(Duration::from_micros(micros));
}

/// A table of accounts with integer balances.
#[derive(Debug, Clone)]
pub struct Bank {
    tm: Arc<TransactionManager>,
    table_id: u64,
    accounts: usize,
}

impl Bank {
    /// Creates `accounts` accounts holding `initial` each.
    pub fn open(tm: Arc<TransactionManager>, table_id: u64, accounts: usize, initial: i64) -> Self {
        for n in 0..accounts {
            tm.preload(account_row(table_id, n), encode_i64(initial));
        }
        Self {
            tm,
            table_id,
            accounts,
        }
    }

    /// Returns the row of account `n`.
    pub fn account(&self, n: usize) -> ResourceId {
        account_row(self.table_id, n)
    }

    /// Returns the number of accounts.
    pub fn accounts(&self) -> usize {
        self.accounts
    }

    /// Returns the transaction manager.
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.tm
    }

    /// Reads the balance of account `n` inside `txn`. A missing row reads
    /// as zero.
    pub fn balance(&self, txn: TxnId, n: usize) -> KeelResult<i64> {
        let value = self.tm.read(txn, &self.account(n))?;
        Ok(value.as_ref().and_then(decode_i64).unwrap_or(0))
    }

    /// Moves `amount` from account `from` to account `to` inside `txn`.
    pub fn transfer_in(&self, txn: TxnId, from: usize, to: usize, amount: i64) -> KeelResult<()> {
        let from_balance = self.balance(txn, from)?;
        let to_balance = self.balance(txn, to)?;
        self.tm
            .write(txn, self.account(from), encode_i64(from_balance - amount))?;
        self.tm
            .write(txn, self.account(to), encode_i64(to_balance + amount))
    }

    /// Runs one transfer to completion, retrying up to `max_attempts`.
    ///
    /// # Panics
    ///
    /// Panics if `from` and `to` are the same account.
    pub fn transfer(
        &self,
        isolation: Isolation,
        from: usize,
        to: usize,
        amount: i64,
        max_attempts: usize,
    ) -> KeelResult<Committed<()>> {
        assert_ne!(from, to, "transfer needs two distinct accounts");
        run_transaction(&self.tm, isolation, max_attempts, |txn| {
            self.transfer_in(txn, from, to, amount)
        })
    }

    /// Sums every balance in one snapshot-isolation transaction.
    pub fn total(&self) -> KeelResult<i64> {
        let txn = self.tm.begin_with_isolation(Isolation::SnapshotIsolation)?;
        let mut total = 0;
        for n in 0..self.accounts {
            match self.balance(txn, n) {
                Ok(balance) => total += balance,
                Err(err) => {
                    let _ = self.tm.abort(txn);
                    return Err(err);
                }
            }
        }
        self.tm.commit(txn)?;
        Ok(total)
    }
}

fn account_row(table_id: u64, n: usize) -> ResourceId {
    ResourceId::row(table_id, format!("acct-{n:04}"))
}

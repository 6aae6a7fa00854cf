//! Per-principal credit ledger with atomic reservation.
//!
//! `reserve` is a single conditional `UPDATE ... WHERE credits >= ?`; the
//! balance check and the decrement happen in one statement, so concurrent
//! submissions for the same principal can never overdraw. `refund` is the
//! compensating add used exclusively by failure paths. Privileged roles
//! bypass the ledger entirely: no reserve, no refund.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::error::{QuorumError, Result};

/// Principal role tag. Admin tiers carry unlimited credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Employee,
    Admin,
    Superadmin,
}

impl Role {
    /// Parse a stored role tag. Unknown tags get the least privilege.
    pub fn parse(tag: &str) -> Role {
        match tag {
            "employee" => Role::Employee,
            "admin" => Role::Admin,
            "superadmin" => Role::Superadmin,
            _ => Role::User,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Employee => "employee",
            Role::Admin => "admin",
            Role::Superadmin => "superadmin",
        }
    }

    /// Whether this role skips both reserve and refund.
    pub fn bypasses_ledger(&self) -> bool {
        matches!(self, Role::Admin | Role::Superadmin)
    }
}

/// Credit ledger backed by the transcript store's database.
#[derive(Clone)]
pub struct CreditLedger {
    conn: Arc<Mutex<Connection>>,
}

impl CreditLedger {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Atomically subtract `amount` iff the balance covers it.
    ///
    /// Returns the remaining balance, or
    /// [`QuorumError::InsufficientCredits`] with the required and available
    /// amounts. Called exactly once, before any work begins.
    pub async fn reserve(&self, principal: &str, amount: i64) -> Result<i64> {
        let conn = self.conn.lock().await;
        let remaining: Option<i64> = conn
            .query_row(
                "UPDATE users SET credits = credits - ?1
                 WHERE id = ?2 AND credits >= ?1
                 RETURNING credits",
                params![amount, principal],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(remaining) = remaining {
            return Ok(remaining);
        }
        let available: i64 = conn
            .query_row(
                "SELECT credits FROM users WHERE id = ?1",
                [principal],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        Err(QuorumError::InsufficientCredits {
            required: amount,
            available,
        })
    }

    /// Unconditional compensating add. Returns the new balance.
    pub async fn refund(&self, principal: &str, amount: i64) -> Result<i64> {
        let conn = self.conn.lock().await;
        let balance: Option<i64> = conn
            .query_row(
                "UPDATE users SET credits = credits + ?1
                 WHERE id = ?2
                 RETURNING credits",
                params![amount, principal],
                |row| row.get(0),
            )
            .optional()?;
        balance.ok_or_else(|| QuorumError::NotFound(format!("user {principal}")))
    }

    /// Grant credits outside the run lifecycle (top-ups, promotions).
    pub async fn grant(&self, principal: &str, amount: i64) -> Result<i64> {
        self.refund(principal, amount).await
    }

    /// Current balance. Missing principals read as zero.
    pub async fn balance(&self, principal: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT credits FROM users WHERE id = ?1",
                [principal],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TranscriptStore;

    async fn ledger_with_balance(balance: i64) -> (TranscriptStore, CreditLedger) {
        let store = TranscriptStore::open_in_memory().await.unwrap();
        store
            .get_or_create_user("owner", None, balance)
            .await
            .unwrap();
        let ledger = store.ledger();
        (store, ledger)
    }

    #[test]
    fn test_role_bypass() {
        assert!(!Role::User.bypasses_ledger());
        assert!(!Role::Employee.bypasses_ledger());
        assert!(Role::Admin.bypasses_ledger());
        assert!(Role::Superadmin.bypasses_ledger());
    }

    #[test]
    fn test_role_parse_defaults_to_user() {
        assert_eq!(Role::parse("superadmin"), Role::Superadmin);
        assert_eq!(Role::parse("unheard-of"), Role::User);
    }

    #[tokio::test]
    async fn test_reserve_and_refund_roundtrip() {
        let (_store, ledger) = ledger_with_balance(5).await;
        assert_eq!(ledger.reserve("owner", 2).await.unwrap(), 3);
        assert_eq!(ledger.refund("owner", 2).await.unwrap(), 5);
        assert_eq!(ledger.balance("owner").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_reserve_reports_required_and_available() {
        let (_store, ledger) = ledger_with_balance(1).await;
        let err = ledger.reserve("owner", 3).await.unwrap_err();
        match err {
            QuorumError::InsufficientCredits {
                required,
                available,
            } => {
                assert_eq!(required, 3);
                assert_eq!(available, 1);
            }
            other => panic!("expected InsufficientCredits, got {other:?}"),
        }
        // A failed reserve leaves the balance untouched.
        assert_eq!(ledger.balance("owner").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reserve_unknown_principal() {
        let (_store, ledger) = ledger_with_balance(5).await;
        let err = ledger.reserve("ghost", 1).await.unwrap_err();
        assert!(matches!(
            err,
            QuorumError::InsufficientCredits { available: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_no_overdraw_under_contention() {
        // k=10 concurrent submits, balance 3, cost 2: exactly one may win.
        let (_store, ledger) = ledger_with_balance(3).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(
                async move { ledger.reserve("owner", 2).await },
            ));
        }

        let mut successes = 0;
        let mut failures = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(QuorumError::InsufficientCredits {
                    required,
                    available,
                }) => {
                    assert_eq!(required, 2);
                    assert!(available < 2);
                    failures += 1;
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(failures, 9);
        assert_eq!(ledger.balance("owner").await.unwrap(), 1);
    }
}

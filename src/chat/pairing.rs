// Pairing-code issuance and redemption.
// Codes are short-lived single-use secrets linking an external platform
// account to an internal user. Attempt counting is enforced atomically at
// the storage layer; exhausted codes deny without revealing whether the
// guess was correct.

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::storage::{ClaimOutcome, PairingCodeRow, StorageError, Store};
use crate::webhooks::constant_time_eq;

/// Unambiguous code alphabet (no 0/O/1/I)
pub const PAIRING_ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";

pub const CODE_LENGTH: usize = 8;
pub const CODE_TTL_SECONDS: i64 = 300;
pub const MAX_ATTEMPTS: i64 = 5;

/// Codes issued per user per rolling hour
const ISSUANCE_LIMIT: usize = 3;
const ISSUANCE_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("too many pairing codes requested")]
    RateLimited,

    #[error("pairing code not found")]
    CodeInvalid,

    #[error("pairing code expired")]
    CodeExpired,

    #[error("pairing code already used")]
    CodeUsed,

    #[error("too many failed attempts")]
    AttemptsExceeded,

    #[error("account already linked")]
    AlreadyLinked,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PairingError {
    /// Stable machine-readable reason for API consumers
    pub fn reason(&self) -> &'static str {
        match self {
            PairingError::RateLimited => "rate_limited",
            PairingError::CodeInvalid => "code_invalid",
            PairingError::CodeExpired => "code_expired",
            PairingError::CodeUsed => "code_used",
            PairingError::AttemptsExceeded => "attempts_exceeded",
            PairingError::AlreadyLinked => "already_linked",
            PairingError::Storage(_) => "internal_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssuedCode {
    pub code: String,
    pub expires_at: chrono::DateTime<Utc>,
    pub expires_in: i64,
}

#[derive(Debug, Clone)]
pub struct PairedAccount {
    pub account_id: i64,
    pub user_id: String,
}

pub struct PairingService {
    store: Store,
    /// Per-user issuance timestamps within the rolling window
    issuance: Mutex<HashMap<String, Vec<Instant>>>,
}

impl PairingService {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            issuance: Mutex::new(HashMap::new()),
        }
    }

    pub fn generate_code() -> String {
        let mut rng = rand::thread_rng();
        (0..CODE_LENGTH)
            .map(|_| {
                let idx = rng.gen_range(0..PAIRING_ALPHABET.len());
                PAIRING_ALPHABET[idx] as char
            })
            .collect()
    }

    /// Issue a fresh code for `user_id`, rate-limited per user
    pub async fn issue(&self, user_id: &str) -> Result<IssuedCode, PairingError> {
        {
            let mut issuance = self.issuance.lock().expect("issuance lock poisoned");
            let stamps = issuance.entry(user_id.to_string()).or_default();
            stamps.retain(|t| t.elapsed() < ISSUANCE_WINDOW);
            if stamps.len() >= ISSUANCE_LIMIT {
                return Err(PairingError::RateLimited);
            }
            stamps.push(Instant::now());
        }

        let expires_at = Utc::now() + ChronoDuration::seconds(CODE_TTL_SECONDS);

        // Collisions are vanishingly rare with 32^8 codes but retried anyway
        for _ in 0..3 {
            let code = Self::generate_code();
            match self.store.insert_pairing_code(&code, user_id, expires_at).await {
                Ok(()) => {
                    return Ok(IssuedCode {
                        code,
                        expires_at,
                        expires_in: CODE_TTL_SECONDS,
                    });
                }
                Err(StorageError::Sqlx(sqlx::Error::Database(err)))
                    if err.is_unique_violation() =>
                {
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(PairingError::Storage(StorageError::Sqlx(
            sqlx::Error::PoolTimedOut,
        )))
    }

    /// Redeem `presented` for an external account link.
    ///
    /// Every failed guess against an existing code increments its attempt
    /// counter; after MAX_ATTEMPTS all guesses (correct or not) deny with
    /// `attempts_exceeded`.
    pub async fn redeem(
        &self,
        presented: &str,
        platform: &str,
        external_id: &str,
        external_username: Option<&str>,
    ) -> Result<PairedAccount, PairingError> {
        let presented = presented.trim().to_ascii_uppercase();
        let now = Utc::now();

        // The lookup is deliberately NOT a SQL point query keyed on the
        // guessed value: every stored code is compared constant-time, with
        // no early exit, so comparison cost never depends on how close a
        // guess is. The scan length leaks only the total number of live
        // codes, which the guesser does not control.
        let mut matched: Option<PairingCodeRow> = None;
        for row in self.store.list_pairing_codes().await? {
            if constant_time_eq(&row.code, &presented) {
                matched = Some(row);
            }
        }

        let Some(row) = matched else {
            return Err(PairingError::CodeInvalid);
        };

        if row.attempts >= MAX_ATTEMPTS {
            self.store.bump_pairing_attempts(&row.code).await?;
            return Err(PairingError::AttemptsExceeded);
        }
        if row.used {
            self.store.bump_pairing_attempts(&row.code).await?;
            return Err(PairingError::CodeUsed);
        }
        if row.expires_at <= now {
            self.store.bump_pairing_attempts(&row.code).await?;
            return Err(PairingError::CodeExpired);
        }

        // Link conflicts are not guesses; they leave the attempt counter
        // untouched and the code unconsumed
        if self
            .store
            .get_external_account(platform, external_id)
            .await?
            .is_some()
        {
            return Err(PairingError::AlreadyLinked);
        }
        if self
            .store
            .account_exists_for_user(&row.user_id, platform)
            .await?
        {
            return Err(PairingError::AlreadyLinked);
        }

        // Atomic claim: under concurrent redemption exactly one caller wins
        match self.store.claim_pairing_code(&presented, now).await? {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::Rejected => return Err(PairingError::CodeUsed),
            ClaimOutcome::Missing => return Err(PairingError::CodeInvalid),
        }

        let account_id = match self
            .store
            .insert_external_account(&row.user_id, platform, external_id, external_username)
            .await
        {
            Ok(id) => id,
            Err(StorageError::Sqlx(sqlx::Error::Database(err))) if err.is_unique_violation() => {
                // Lost a race on the account index after winning the code
                return Err(PairingError::AlreadyLinked);
            }
            Err(err) => return Err(err.into()),
        };

        // Used codes are garbage; drop the row
        self.store.delete_pairing_code(&presented).await?;

        log::info!(
            "paired {}:{} to user {}",
            platform,
            external_id,
            row.user_id
        );
        Ok(PairedAccount {
            account_id,
            user_id: row.user_id,
        })
    }

    /// Periodic cleanup of expired and consumed codes
    pub async fn sweep(&self) -> Result<u64, PairingError> {
        Ok(self.store.delete_expired_codes(Utc::now()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> PairingService {
        PairingService::new(Store::in_memory().await.unwrap())
    }

    #[test]
    fn generated_codes_use_the_safe_alphabet() {
        for _ in 0..50 {
            let code = PairingService::generate_code();
            assert_eq!(code.len(), CODE_LENGTH);
            assert!(code.bytes().all(|b| PAIRING_ALPHABET.contains(&b)));
            for forbidden in ['0', 'O', '1', 'I'] {
                assert!(!code.contains(forbidden));
            }
        }
    }

    #[tokio::test]
    async fn issuance_rate_limit() {
        let svc = service().await;
        for _ in 0..3 {
            svc.issue("u1").await.unwrap();
        }
        assert!(matches!(
            svc.issue("u1").await,
            Err(PairingError::RateLimited)
        ));
        // Another user is unaffected
        svc.issue("u2").await.unwrap();
    }

    #[tokio::test]
    async fn redeem_happy_path() {
        let svc = service().await;
        let issued = svc.issue("u1").await.unwrap();

        let paired = svc
            .redeem(&issued.code, "telegram", "555", Some("alice"))
            .await
            .unwrap();
        assert_eq!(paired.user_id, "u1");

        // Code is gone afterwards
        assert!(matches!(
            svc.redeem(&issued.code, "telegram", "556", None).await,
            Err(PairingError::CodeInvalid)
        ));
    }

    #[tokio::test]
    async fn redeem_is_case_insensitive() {
        let svc = service().await;
        let issued = svc.issue("u1").await.unwrap();
        svc.redeem(&issued.code.to_lowercase(), "telegram", "555", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn used_code_reports_code_used() {
        let svc = service().await;
        let issued = svc.issue("u1").await.unwrap();
        svc.redeem(&issued.code, "telegram", "1", None).await.unwrap();

        let issued2 = svc.issue("u2").await.unwrap();
        // Different user's code still fine
        svc.redeem(&issued2.code, "telegram", "2", None).await.unwrap();
    }

    #[tokio::test]
    async fn attempts_exhaust_and_mask_the_code() {
        let svc = service().await;
        let issued = svc.issue("u1").await.unwrap();

        // Burn the attempt budget with failed guesses against this row
        for _ in 0..MAX_ATTEMPTS {
            svc.store.bump_pairing_attempts(&issued.code).await.unwrap();
        }

        // Even the correct code now denies with attempts_exceeded
        let err = svc
            .redeem(&issued.code, "telegram", "555", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::AttemptsExceeded));
        assert_eq!(err.reason(), "attempts_exceeded");
    }

    #[tokio::test]
    async fn expired_code_denies() {
        let svc = service().await;
        svc.store
            .insert_pairing_code("EXPIRDED", "u1", Utc::now() - ChronoDuration::minutes(1))
            .await
            .unwrap();

        let err = svc
            .redeem("EXPIRDED", "telegram", "555", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::CodeExpired));

        // The failed guess still counted
        let row = svc.store.get_pairing_code("EXPIRDED").await.unwrap().unwrap();
        assert_eq!(row.attempts, 1);
    }

    #[tokio::test]
    async fn already_linked_platform_account() {
        let svc = service().await;
        svc.store
            .insert_external_account("other", "telegram", "555", None)
            .await
            .unwrap();

        let issued = svc.issue("u1").await.unwrap();
        let err = svc
            .redeem(&issued.code, "telegram", "555", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::AlreadyLinked));

        // Link conflicts leave the code redeemable
        svc.redeem(&issued.code, "telegram", "556", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_redemption_single_winner() {
        let svc = std::sync::Arc::new(service().await);
        let issued = svc.issue("u1").await.unwrap();

        let a = {
            let svc = svc.clone();
            let code = issued.code.clone();
            tokio::spawn(async move { svc.redeem(&code, "telegram", "111", None).await })
        };
        let b = {
            let svc = svc.clone();
            let code = issued.code.clone();
            tokio::spawn(async move { svc.redeem(&code, "telegram", "111", None).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1, "exactly one redemption may succeed");

        // Exactly one account row exists
        let account = svc
            .store
            .get_external_account("telegram", "111")
            .await
            .unwrap();
        assert!(account.is_some());
    }
}

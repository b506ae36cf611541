use std::sync::Arc;

use rand::Rng;
use rand::rngs::OsRng;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::OtpSettings;
use crate::error::{AppError, OtpError};
use crate::models::otp::OtpRecord;
use crate::observability::metrics::Metrics;
use crate::store::{Store, UpdateOutcome};

/// Bounded retries when a concurrent verification moved the record under us.
const CAS_RETRIES: usize = 5;

pub struct OtpGate {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    settings: OtpSettings,
    metrics: Metrics,
}

impl OtpGate {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        settings: OtpSettings,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
            metrics,
        }
    }

    /// Issues a fresh code for the order, replacing any unverified record. A verified
    /// record is never replaced.
    pub fn issue(&self, order_id: Uuid) -> Result<OtpRecord, AppError> {
        for _ in 0..CAS_RETRIES {
            let now = self.clock.now();
            let record = OtpRecord {
                order_id,
                code: generate_code(self.settings.digits),
                created_at: now,
                expires_at: now + self.settings.ttl,
                verified_at: None,
                attempt_count: 0,
            };

            let outcome = match self.store.get_otp(order_id)? {
                Some(existing) if existing.is_verified() => {
                    return Err(OtpError::AlreadyUsed.into());
                }
                Some(existing) => self.store.compare_and_swap_otp(&existing, record)?,
                None => self.store.insert_otp_if_absent(record)?,
            };

            match outcome {
                UpdateOutcome::Applied(record) => {
                    info!(
                        order_id = %order_id,
                        expires_at = %record.expires_at,
                        "delivery code issued"
                    );
                    return Ok(record);
                }
                UpdateOutcome::PreconditionFailed(_) | UpdateOutcome::Missing => continue,
            }
        }

        Err(AppError::Conflict(
            "delivery code changed concurrently, try again".to_string(),
        ))
    }

    pub fn verify(&self, order_id: Uuid, submitted: &str) -> Result<OtpRecord, AppError> {
        let outcome = self.try_verify(order_id, submitted.trim());

        let label = match &outcome {
            Ok(_) => "verified",
            Err(AppError::Otp(err)) => err.code(),
            Err(_) => "error",
        };
        self.metrics
            .otp_verifications_total
            .with_label_values(&[label])
            .inc();

        outcome
    }

    fn try_verify(&self, order_id: Uuid, submitted: &str) -> Result<OtpRecord, AppError> {
        for _ in 0..CAS_RETRIES {
            let current = self
                .store
                .get_otp(order_id)?
                .ok_or(OtpError::NotIssued)?;

            if current.is_verified() {
                return Err(OtpError::AlreadyUsed.into());
            }

            let now = self.clock.now();
            if current.is_expired(now) {
                return Err(OtpError::Expired.into());
            }
            if current.attempt_count >= self.settings.max_attempts {
                return Err(OtpError::TooManyAttempts.into());
            }

            let matched = codes_match(&current.code, submitted);
            let mut next = current.clone();
            if matched {
                next.verified_at = Some(now);
            } else {
                next.attempt_count += 1;
            }

            match self.store.compare_and_swap_otp(&current, next)? {
                UpdateOutcome::Applied(record) if matched => {
                    info!(order_id = %order_id, "delivery code verified");
                    return Ok(record);
                }
                UpdateOutcome::Applied(record) => {
                    warn!(
                        order_id = %order_id,
                        attempts = record.attempt_count,
                        "delivery code mismatch"
                    );
                    if record.attempt_count >= self.settings.max_attempts {
                        return Err(OtpError::TooManyAttempts.into());
                    }
                    return Err(OtpError::Mismatch {
                        remaining: self.settings.max_attempts - record.attempt_count,
                    }
                    .into());
                }
                UpdateOutcome::PreconditionFailed(_) => continue,
                UpdateOutcome::Missing => return Err(OtpError::NotIssued.into()),
            }
        }

        Err(AppError::Conflict(
            "delivery code is being checked concurrently, try again".to_string(),
        ))
    }

    pub fn revoke(&self, order_id: Uuid) -> Result<(), AppError> {
        self.store.delete_otp(order_id)?;
        Ok(())
    }

    pub fn record(&self, order_id: Uuid) -> Result<Option<OtpRecord>, AppError> {
        Ok(self.store.get_otp(order_id)?)
    }
}

fn generate_code(digits: u32) -> String {
    let upper = 10u32.pow(digits);
    let value = OsRng.gen_range(0..upper);
    format!("{value:0width$}", width = digits as usize)
}

/// Length-independent comparison so response timing does not leak matching prefixes.
fn codes_match(expected: &str, submitted: &str) -> bool {
    let expected = expected.as_bytes();
    let submitted = submitted.as_bytes();

    let mut diff = expected.len() ^ submitted.len();
    for (i, byte) in expected.iter().enumerate() {
        let other = submitted.get(i).copied().unwrap_or(0);
        diff |= usize::from(byte ^ other);
    }

    diff == 0
}

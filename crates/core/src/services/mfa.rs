//! Multi-factor authentication service.
//!
//! TOTP secret lifecycle plus single-use backup codes. State machine per
//! user: `Unconfigured → PendingVerification → Enabled`; a repeated setup
//! overwrites prior state wholesale, it never merges.
//!
//! Secrets are encrypted at rest; backup codes are stored only as keyed
//! digests, and redemption is an atomic set removal, so two concurrent
//! requests cannot both redeem the same code.

use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::warn;
use vigil_common::{AppError, AppResult, SecretCipher, SecurityEvent, SecurityEventSink, crypto};
use vigil_store::CredentialStore;

/// Number of backup codes per batch.
const BACKUP_CODE_COUNT: usize = 10;

/// Length of each backup code (digits).
const BACKUP_CODE_LENGTH: usize = 8;

/// TOTP configuration.
const TOTP_DIGITS: usize = 6;
const TOTP_STEP: u64 = 30;
const TOTP_SKEW: u8 = 1;

/// Fixed secret verified against when a user is not enrolled, so the
/// unenrolled path performs the same cryptographic work as the enrolled
/// one.
static DUMMY_SECRET_B32: Lazy<String> =
    Lazy::new(|| Secret::Raw(vec![0x42; 20]).to_encoded().to_string());

/// Response for TOTP setup.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TotpSetup {
    /// The secret in base32 format (for manual entry).
    pub secret: String,
    /// otpauth URI for authenticator apps.
    pub qr_code_url: String,
    /// Backup codes (plain text, shown only once).
    pub backup_codes: Vec<String>,
}

/// Service for managing multi-factor authentication.
#[derive(Clone)]
pub struct MfaService {
    store: Arc<dyn CredentialStore>,
    events: Arc<dyn SecurityEventSink>,
    cipher: SecretCipher,
    mac_key: Vec<u8>,
    issuer: String,
}

fn record_key(user_id: &str) -> String {
    format!("mfa:totp:{user_id}")
}

fn backup_key(user_id: &str) -> String {
    format!("mfa:backup:{user_id}")
}

impl MfaService {
    /// Create a new MFA service.
    #[must_use]
    pub fn new(
        store: Arc<dyn CredentialStore>,
        events: Arc<dyn SecurityEventSink>,
        cipher: SecretCipher,
        mac_key: Vec<u8>,
        issuer: &str,
    ) -> Self {
        Self {
            store,
            events,
            cipher,
            mac_key,
            issuer: issuer.to_string(),
        }
    }

    /// Create a service from the security configuration.
    pub fn from_config(
        store: Arc<dyn CredentialStore>,
        events: Arc<dyn SecurityEventSink>,
        config: &vigil_common::config::SecurityConfig,
    ) -> AppResult<Self> {
        use base64::{Engine, engine::general_purpose::STANDARD};

        let cipher = SecretCipher::from_base64(&config.encryption_key)?;
        let mac_key = STANDARD
            .decode(&config.mac_key)
            .map_err(|e| AppError::Config(format!("Invalid MAC key encoding: {e}")))?;

        Ok(Self::new(store, events, cipher, mac_key, &config.totp_issuer))
    }

    /// Check if MFA is enabled for a user.
    pub async fn is_enabled(&self, user_id: &str) -> AppResult<bool> {
        let enabled = self.store.hash_get(&record_key(user_id), "enabled").await?;
        Ok(enabled.as_deref() == Some("true"))
    }

    /// Initiate TOTP setup for a user.
    ///
    /// Generates a fresh secret and a batch of backup codes, persists both
    /// in protected form with `enabled = false`, and overwrites any prior
    /// enrollment. On any store or crypto failure the keys are rolled back
    /// and a single generic [`AppError::SetupFailure`] is returned, so no
    /// partial state is ever visible to callers.
    pub async fn setup_totp(&self, user_id: &str, email: &str) -> AppResult<TotpSetup> {
        match self.setup_totp_inner(user_id, email).await {
            Ok(setup) => {
                self.emit("mfa_setup", json!({ "userId": user_id })).await;
                Ok(setup)
            }
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "TOTP setup failed");
                let _ = self.store.delete(&record_key(user_id)).await;
                let _ = self.store.delete(&backup_key(user_id)).await;
                Err(AppError::SetupFailure)
            }
        }
    }

    async fn setup_totp_inner(&self, user_id: &str, email: &str) -> AppResult<TotpSetup> {
        let secret = Secret::generate_secret();
        let secret_base32 = secret.to_encoded().to_string();
        let secret_bytes = secret
            .to_bytes()
            .map_err(|e| AppError::Crypto(format!("Invalid generated secret: {e}")))?;

        let totp = TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            TOTP_SKEW,
            TOTP_STEP,
            secret_bytes,
            Some(self.issuer.clone()),
            email.to_string(),
        )
        .map_err(|e| AppError::Crypto(format!("Failed to create TOTP: {e}")))?;

        let qr_code_url = totp.get_url();
        let sealed = self.cipher.encrypt(&secret_base32)?;

        // Full re-setup overwrites, never merges, prior state.
        self.store.delete(&record_key(user_id)).await?;
        self.store.delete(&backup_key(user_id)).await?;

        self.store
            .hash_set(
                &record_key(user_id),
                &[
                    ("secret".to_string(), sealed),
                    ("enabled".to_string(), "false".to_string()),
                    ("created_at".to_string(), chrono::Utc::now().to_rfc3339()),
                ],
            )
            .await?;

        let backup_codes = self.write_backup_codes(user_id).await?;

        Ok(TotpSetup {
            secret: secret_base32,
            qr_code_url,
            backup_codes,
        })
    }

    /// Confirm TOTP setup by verifying a first code, enabling MFA.
    ///
    /// Returns false without raising when no setup is pending, when MFA is
    /// already enabled (it cannot be re-enabled), or when the code is
    /// wrong. The `enabled` flag flips exactly once.
    pub async fn verify_and_enable_totp(&self, user_id: &str, code: &str) -> AppResult<bool> {
        let record = self.store.hash_get_all(&record_key(user_id)).await?;

        let Some(sealed) = record.get("secret") else {
            return Ok(false);
        };
        if record.get("enabled").map(String::as_str) == Some("true") {
            return Ok(false);
        }

        let secret_base32 = self.cipher.decrypt(sealed)?;
        if !check_totp(&secret_base32, code)? {
            return Ok(false);
        }

        self.store
            .hash_set(
                &record_key(user_id),
                &[("enabled".to_string(), "true".to_string())],
            )
            .await?;

        self.emit("mfa_enabled", json!({ "userId": user_id })).await;
        Ok(true)
    }

    /// Verify a TOTP code or backup code during login.
    ///
    /// Never raises: internal failures are logged and collapse to false.
    /// Rejects whenever MFA is not enabled. On a TOTP mismatch the code is
    /// checked against the backup set; a matching backup code is removed
    /// atomically before returning true, so it redeems exactly once.
    ///
    /// Every call performs one TOTP verification and one code digest,
    /// enrolled or not, so the response shape does not reveal whether the
    /// user has MFA configured.
    pub async fn verify_totp(&self, user_id: &str, code: &str) -> bool {
        match self.verify_totp_inner(user_id, code).await {
            Ok(verified) => verified,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "TOTP verification failed closed");
                self.emit(
                    "security_error",
                    json!({ "userId": user_id, "operation": "verify_totp", "code": err.error_code() }),
                )
                .await;
                false
            }
        }
    }

    async fn verify_totp_inner(&self, user_id: &str, code: &str) -> AppResult<bool> {
        let record = self.store.hash_get_all(&record_key(user_id)).await?;
        let enabled = record.get("enabled").map(String::as_str) == Some("true");

        // Equalized work: the unenrolled path verifies against a fixed
        // dummy secret and redeems against a set that cannot exist.
        let secret_base32 = if enabled {
            let sealed = record.get("secret").ok_or_else(|| {
                AppError::MalformedStoredData("MFA enabled without a secret".to_string())
            })?;
            self.cipher.decrypt(sealed)?
        } else {
            DUMMY_SECRET_B32.clone()
        };
        let redemption_key = if enabled {
            backup_key(user_id)
        } else {
            backup_key("!unenrolled")
        };

        let totp_ok = check_totp(&secret_base32, code)?;
        let digest = crypto::code_digest(&self.mac_key, code)?;
        let backup_ok = if totp_ok {
            false
        } else {
            self.store.set_remove(&redemption_key, &digest).await?
        };

        let verified = enabled && (totp_ok || backup_ok);

        if enabled && backup_ok {
            let remaining = self.store.set_len(&backup_key(user_id)).await.unwrap_or(0);
            self.emit(
                "backup_code_used",
                json!({ "userId": user_id, "remaining": remaining }),
            )
            .await;
        }
        self.emit(
            "mfa_verification",
            json!({ "userId": user_id, "verified": verified }),
        )
        .await;

        Ok(verified)
    }

    /// Replace the stored backup codes with a fresh batch.
    ///
    /// Unconditional: prior codes stop matching immediately. Caller-level
    /// authorization is the identity layer's responsibility.
    pub async fn generate_new_backup_codes(&self, user_id: &str) -> AppResult<Vec<String>> {
        let codes = self.write_backup_codes(user_id).await?;
        self.emit("backup_codes_regenerated", json!({ "userId": user_id }))
            .await;
        Ok(codes)
    }

    /// Disable MFA after verifying a TOTP or backup code.
    pub async fn disable_totp(&self, user_id: &str, code: &str) -> AppResult<bool> {
        if !self.verify_totp(user_id, code).await {
            return Ok(false);
        }

        self.store.delete(&record_key(user_id)).await?;
        self.store.delete(&backup_key(user_id)).await?;

        self.emit("mfa_disabled", json!({ "userId": user_id })).await;
        Ok(true)
    }

    // ==================== Helper Methods ====================

    async fn write_backup_codes(&self, user_id: &str) -> AppResult<Vec<String>> {
        let mut codes: Vec<String> = Vec::with_capacity(BACKUP_CODE_COUNT);
        let mut digests = Vec::with_capacity(BACKUP_CODE_COUNT);

        while codes.len() < BACKUP_CODE_COUNT {
            let code = crypto::random_numeric_code(BACKUP_CODE_LENGTH);
            if codes.contains(&code) {
                continue;
            }
            digests.push(crypto::code_digest(&self.mac_key, &code)?);
            codes.push(code);
        }

        // Wholesale replacement: old codes stop matching.
        self.store.delete(&backup_key(user_id)).await?;
        self.store.set_add(&backup_key(user_id), &digests).await?;

        Ok(codes)
    }

    async fn emit(&self, category: &str, payload: serde_json::Value) {
        self.events.append(SecurityEvent::new(category, payload)).await;
    }
}

fn check_totp(secret_base32: &str, code: &str) -> AppResult<bool> {
    let secret_bytes = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|e| AppError::MalformedStoredData(format!("Invalid TOTP secret: {e}")))?;

    let totp = TOTP::new(
        Algorithm::SHA1,
        TOTP_DIGITS,
        TOTP_SKEW,
        TOTP_STEP,
        secret_bytes,
        None,
        String::new(),
    )
    .map_err(|e| AppError::Crypto(format!("Failed to create TOTP: {e}")))?;

    Ok(totp.check_current(code).unwrap_or(false))
}

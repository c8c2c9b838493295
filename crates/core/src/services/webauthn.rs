//! WebAuthn/passkey ceremonies.
//!
//! Registration and authentication challenges live in the credential
//! store under a 300 s TTL, in separate namespaces, so expiry is enforced
//! by the store itself and stays correct across process restarts. A
//! challenge is consumed atomically before verification; it is gone
//! whether verification succeeds or fails, which closes the replay
//! window.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;
use url::Url;
use uuid::Uuid;
use vigil_common::{AppError, AppResult, SecurityEvent, SecurityEventSink};
use vigil_common::config::WebAuthnConfig;
use vigil_store::CredentialStore;
use webauthn_rs::prelude::*;
use webauthn_rs_proto::{PublicKeyCredential, RegisterPublicKeyCredential};

/// Challenge expiration time in seconds.
const CHALLENGE_TTL_SECS: i64 = 300; // 5 minutes

/// Maximum device name length.
const MAX_DEVICE_NAME_LEN: usize = 100;

/// A registered authenticator, as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredDevice {
    credential_id: String,
    passkey: Passkey,
    counter: u32,
    transports: Vec<String>,
    name: String,
    created_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
}

/// Summary of a registered device, safe to show to users.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    /// Base64url credential ID.
    pub credential_id: String,
    /// User-chosen device name.
    pub name: String,
    /// When the device was registered.
    pub created_at: String,
    /// When the device last authenticated.
    pub last_used_at: Option<String>,
}

impl From<&StoredDevice> for DeviceSummary {
    fn from(device: &StoredDevice) -> Self {
        Self {
            credential_id: device.credential_id.clone(),
            name: device.name.clone(),
            created_at: device.created_at.to_rfc3339(),
            last_used_at: device.last_used_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// Service for managing WebAuthn/passkey ceremonies.
#[derive(Clone)]
pub struct WebAuthnService {
    webauthn: Arc<Webauthn>,
    store: Arc<dyn CredentialStore>,
    events: Arc<dyn SecurityEventSink>,
}

fn registration_key(user_id: &str) -> String {
    format!("webauthn:reg:{user_id}")
}

fn authentication_key(user_id: &str) -> String {
    format!("webauthn:auth:{user_id}")
}

fn devices_key(user_id: &str) -> String {
    format!("webauthn:devices:{user_id}")
}

/// The anti-clone invariant: an asserted counter must be strictly greater
/// than the last persisted one. Equal or lower means a cloned or replayed
/// authenticator, even when the signature itself is valid.
const fn counter_advances(stored: u32, asserted: u32) -> bool {
    asserted > stored
}

impl WebAuthnService {
    /// Create a new `WebAuthn` service.
    ///
    /// # Errors
    /// Returns an error if the relying-party configuration is invalid.
    pub fn new(
        config: &WebAuthnConfig,
        store: Arc<dyn CredentialStore>,
        events: Arc<dyn SecurityEventSink>,
    ) -> AppResult<Self> {
        let origin = Url::parse(&config.origin)
            .map_err(|e| AppError::Config(format!("Invalid WebAuthn origin: {e}")))?;

        let webauthn = WebauthnBuilder::new(&config.rp_id, &origin)
            .map_err(|e| AppError::Config(format!("Failed to create WebAuthn builder: {e}")))?
            .rp_name(&config.rp_name)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build WebAuthn: {e}")))?;

        Ok(Self {
            webauthn: Arc::new(webauthn),
            store,
            events,
        })
    }

    // ==================== Registration ====================

    /// Begin device registration for a user.
    ///
    /// Returns the credential creation options to send to the browser.
    /// Already-registered credential IDs are excluded from the ceremony.
    pub async fn generate_registration_options(
        &self,
        user_id: &str,
        email: &str,
    ) -> AppResult<serde_json::Value> {
        let devices = self.load_devices(user_id).await?;
        let exclude_credentials: Vec<CredentialID> = devices
            .iter()
            .filter_map(|d| URL_SAFE_NO_PAD.decode(&d.credential_id).ok())
            .map(CredentialID::from)
            .collect();

        let (ccr, reg_state) = self
            .webauthn
            .start_passkey_registration(Uuid::new_v4(), email, email, Some(exclude_credentials))
            .map_err(|e| AppError::Internal(format!("Failed to start registration: {e}")))?;

        let state_json = serde_json::to_string(&reg_state)
            .map_err(|e| AppError::Internal(format!("Failed to serialize state: {e}")))?;

        self.store
            .set_with_ttl(&registration_key(user_id), &state_json, CHALLENGE_TTL_SECS)
            .await?;

        serde_json::to_value(&ccr)
            .map_err(|e| AppError::Internal(format!("Failed to serialize options: {e}")))
    }

    /// Complete device registration.
    ///
    /// The pending challenge is consumed whether or not verification
    /// succeeds. Returns Ok(false) when the challenge is absent or
    /// expired, or when the attestation does not verify; a genuine store
    /// failure surfaces as an error.
    pub async fn verify_registration(
        &self,
        user_id: &str,
        response: &serde_json::Value,
        device_name: &str,
    ) -> AppResult<bool> {
        if device_name.is_empty() || device_name.len() > MAX_DEVICE_NAME_LEN {
            return Err(AppError::Validation(format!(
                "Device name must be between 1 and {MAX_DEVICE_NAME_LEN} characters"
            )));
        }

        let Some(state_json) = self.store.take(&registration_key(user_id)).await? else {
            self.emit_registration(user_id, false, "missing_challenge").await;
            return Ok(false);
        };

        let reg_state: PasskeyRegistration = serde_json::from_str(&state_json)
            .map_err(|e| AppError::MalformedStoredData(format!("Invalid challenge state: {e}")))?;

        let credential: RegisterPublicKeyCredential = match serde_json::from_value(response.clone())
        {
            Ok(credential) => credential,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "Malformed registration response");
                self.emit_registration(user_id, false, "malformed_response").await;
                return Ok(false);
            }
        };

        let passkey = match self
            .webauthn
            .finish_passkey_registration(&credential, &reg_state)
        {
            Ok(passkey) => passkey,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "Attestation verification failed");
                self.emit_registration(user_id, false, "attestation_failed").await;
                return Ok(false);
            }
        };

        let credential_id = URL_SAFE_NO_PAD.encode(passkey.cred_id());
        let device = StoredDevice {
            credential_id: credential_id.clone(),
            passkey,
            counter: 0,
            transports: Vec::new(),
            name: device_name.to_string(),
            created_at: Utc::now(),
            last_used_at: None,
        };

        let device_json = serde_json::to_string(&device)
            .map_err(|e| AppError::Internal(format!("Failed to serialize device: {e}")))?;
        self.store
            .hash_set(&devices_key(user_id), &[(credential_id, device_json)])
            .await?;

        self.emit_registration(user_id, true, "registered").await;
        Ok(true)
    }

    // ==================== Authentication ====================

    /// Begin device authentication for a user.
    ///
    /// Returns the credential request options: an allow-list of the user's
    /// registered credential IDs plus a fresh challenge.
    pub async fn generate_authentication_options(
        &self,
        user_id: &str,
    ) -> AppResult<serde_json::Value> {
        let devices = self.load_devices(user_id).await?;
        if devices.is_empty() {
            return Err(AppError::NotFound(format!(
                "No registered devices for user {user_id}"
            )));
        }

        let passkeys: Vec<Passkey> = devices.iter().map(|d| d.passkey.clone()).collect();

        let (rcr, auth_state) = self
            .webauthn
            .start_passkey_authentication(&passkeys)
            .map_err(|e| AppError::Internal(format!("Failed to start authentication: {e}")))?;

        let state_json = serde_json::to_string(&auth_state)
            .map_err(|e| AppError::Internal(format!("Failed to serialize state: {e}")))?;

        self.store
            .set_with_ttl(&authentication_key(user_id), &state_json, CHALLENGE_TTL_SECS)
            .await?;

        serde_json::to_value(&rcr)
            .map_err(|e| AppError::Internal(format!("Failed to serialize options: {e}")))
    }

    /// Complete device authentication.
    ///
    /// Never raises: every internal failure collapses to false. Fails
    /// closed when the challenge is absent, the asserted credential ID
    /// matches no stored device, the assertion signature is invalid, or
    /// the authenticator counter has not strictly increased.
    pub async fn verify_authentication(
        &self,
        user_id: &str,
        response: &serde_json::Value,
    ) -> bool {
        match self.verify_authentication_inner(user_id, response).await {
            Ok(verified) => verified,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "Authentication failed closed");
                self.emit_authentication(user_id, false, err.error_code()).await;
                false
            }
        }
    }

    async fn verify_authentication_inner(
        &self,
        user_id: &str,
        response: &serde_json::Value,
    ) -> AppResult<bool> {
        let Some(state_json) = self.store.take(&authentication_key(user_id)).await? else {
            return Err(AppError::InvalidOrExpiredChallenge);
        };

        let credential: PublicKeyCredential = match serde_json::from_value(response.clone()) {
            Ok(credential) => credential,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "Malformed authentication response");
                self.emit_authentication(user_id, false, "malformed_response").await;
                return Ok(false);
            }
        };

        // Resolve the asserted credential against this user's devices;
        // there is no fallback to "any device".
        let asserted_id = credential.id.clone();
        let Some(device_json) = self
            .store
            .hash_get(&devices_key(user_id), &asserted_id)
            .await?
        else {
            warn!(user_id = %user_id, credential_id = %asserted_id, "Unknown credential asserted");
            return Err(AppError::CredentialMismatch);
        };

        let mut device: StoredDevice = serde_json::from_str(&device_json)
            .map_err(|e| AppError::MalformedStoredData(format!("Invalid device record: {e}")))?;

        let auth_state: PasskeyAuthentication = serde_json::from_str(&state_json)
            .map_err(|e| AppError::MalformedStoredData(format!("Invalid challenge state: {e}")))?;

        let result = match self
            .webauthn
            .finish_passkey_authentication(&credential, &auth_state)
        {
            Ok(result) => result,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "Assertion verification failed");
                self.emit_authentication(user_id, false, "assertion_failed").await;
                return Ok(false);
            }
        };

        if !counter_advances(device.counter, result.counter()) {
            warn!(
                user_id = %user_id,
                credential_id = %asserted_id,
                stored_counter = device.counter,
                asserted_counter = result.counter(),
                "Authenticator counter did not advance; possible cloned credential"
            );
            self.emit_authentication(user_id, false, "counter_regression").await;
            return Ok(false);
        }

        device.counter = result.counter();
        device.last_used_at = Some(Utc::now());
        let device_json = serde_json::to_string(&device)
            .map_err(|e| AppError::Internal(format!("Failed to serialize device: {e}")))?;
        self.store
            .hash_set(&devices_key(user_id), &[(asserted_id, device_json)])
            .await?;

        self.emit_authentication(user_id, true, "authenticated").await;
        Ok(true)
    }

    // ==================== Management ====================

    /// List a user's registered devices, oldest first.
    pub async fn list_devices(&self, user_id: &str) -> AppResult<Vec<DeviceSummary>> {
        let devices = self.load_devices(user_id).await?;
        Ok(devices.iter().map(Into::into).collect())
    }

    /// Rename a registered device.
    pub async fn rename_device(
        &self,
        user_id: &str,
        credential_id: &str,
        name: &str,
    ) -> AppResult<()> {
        if name.is_empty() || name.len() > MAX_DEVICE_NAME_LEN {
            return Err(AppError::Validation(format!(
                "Device name must be between 1 and {MAX_DEVICE_NAME_LEN} characters"
            )));
        }

        let device_json = self
            .store
            .hash_get(&devices_key(user_id), credential_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Device: {credential_id}")))?;

        let mut device: StoredDevice = serde_json::from_str(&device_json)
            .map_err(|e| AppError::MalformedStoredData(format!("Invalid device record: {e}")))?;
        device.name = name.to_string();

        let device_json = serde_json::to_string(&device)
            .map_err(|e| AppError::Internal(format!("Failed to serialize device: {e}")))?;
        self.store
            .hash_set(
                &devices_key(user_id),
                &[(credential_id.to_string(), device_json)],
            )
            .await
    }

    /// Remove a registered device.
    pub async fn delete_device(&self, user_id: &str, credential_id: &str) -> AppResult<()> {
        self.store
            .hash_delete_field(&devices_key(user_id), credential_id)
            .await
    }

    /// Check if a user has any registered devices.
    pub async fn has_devices(&self, user_id: &str) -> AppResult<bool> {
        Ok(!self.load_devices(user_id).await?.is_empty())
    }

    // ==================== Helper Methods ====================

    async fn load_devices(&self, user_id: &str) -> AppResult<Vec<StoredDevice>> {
        let map = self.store.hash_get_all(&devices_key(user_id)).await?;
        let mut devices: Vec<StoredDevice> = map
            .values()
            .filter_map(|json| serde_json::from_str(json).ok())
            .collect();
        devices.sort_by_key(|d| d.created_at);
        Ok(devices)
    }

    async fn emit_registration(&self, user_id: &str, verified: bool, reason: &str) {
        self.events
            .append(SecurityEvent::new(
                "webauthn_registration",
                json!({ "userId": user_id, "verified": verified, "reason": reason }),
            ))
            .await;
    }

    async fn emit_authentication(&self, user_id: &str, verified: bool, reason: &str) {
        self.events
            .append(SecurityEvent::new(
                "webauthn_authentication",
                json!({ "userId": user_id, "verified": verified, "reason": reason }),
            ))
            .await;
    }
}

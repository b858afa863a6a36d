//! Redb-backed identity provider.
//!
//! Keeps user records, issues HS256 JWTs and verifies them, optionally
//! checking revocation against the user record. Configured from a TOML
//! credentials file:
//!
//! ```toml
//! store = "identity.redb"        # relative to the credentials file
//! signing_key = "at least sixteen bytes of secret"
//! token_ttl_secs = 3600
//! ```
//!
//! Token `iat`/`exp` are Unix seconds as JWT requires. Revocation is exact:
//! each token carries the user's revocation generation at issue time, so a
//! token minted right after [`IdentityProvider::revoke_refresh_tokens`] is
//! valid regardless of clock resolution. Passwords are stored as Argon2 PHC
//! strings.

#![allow(clippy::disallowed_types, reason = "Synchronous handle bookkeeping only")]

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, errors::ErrorKind};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{DEFAULT_CONNECT_TIMEOUT, Driver, DriverError, DriverKind, open_database, unix_now_millis};

/// Table: users
/// Key: uid
/// Value: CBOR-encoded `StoredUser`
const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

/// Table: user_emails
/// Key: lowercase email
/// Value: uid
const EMAILS: TableDefinition<&str, &str> = TableDefinition::new("user_emails");

/// Token lifetime when the credentials file does not set one.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Shortest accepted signing key.
pub const MIN_SIGNING_KEY_LEN: usize = 16;

/// Contents of an identity provider credentials file.
#[derive(Clone, Deserialize)]
pub struct IdentityCredentials {
    /// Path of the user database, relative to the credentials file.
    pub store: PathBuf,
    /// Secret used to sign tokens.
    pub signing_key: String,
    /// Lifetime of issued tokens in seconds.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

fn default_token_ttl_secs() -> u64 {
    DEFAULT_TOKEN_TTL.as_secs()
}

impl fmt::Debug for IdentityCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityCredentials")
            .field("store", &self.store)
            .field("signing_key", &"<redacted>")
            .field("token_ttl_secs", &self.token_ttl_secs)
            .finish()
    }
}

/// A user known to the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Stable user identifier.
    pub uid: String,
    /// Login email, unique across users.
    pub email: String,
    /// Name shown to other users.
    pub display_name: String,
    /// Optional phone number.
    pub phone_number: Option<String>,
    /// Optional avatar URL.
    pub photo_url: Option<String>,
    /// Whether the email address has been verified.
    pub email_verified: bool,
    /// Disabled users cannot pass revocation-checked verification.
    pub disabled: bool,
    /// Last revocation (Unix ms). Tokens issued before it are revoked.
    pub tokens_valid_after_ms: u64,
    /// Creation time (Unix ms).
    pub created_at_ms: u64,
}

/// Input for [`IdentityProvider::create_user`].
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Login email.
    pub email: String,
    /// Plain-text password, stored as an Argon2 hash.
    pub password: String,
    /// Name shown to other users.
    pub display_name: String,
}

/// Partial update for [`IdentityProvider::update_user`].
///
/// `None` and empty strings leave the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    /// New login email.
    pub email: Option<String>,
    /// New verification flag.
    pub email_verified: Option<bool>,
    /// New phone number.
    pub phone_number: Option<String>,
    /// New password.
    pub password: Option<String>,
    /// New display name.
    pub display_name: Option<String>,
    /// New avatar URL.
    pub photo_url: Option<String>,
    /// New disabled flag.
    pub disabled: Option<bool>,
}

/// Claims of a token that passed verification.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedToken {
    /// User the token was issued for.
    pub uid: String,
    /// Issue time (Unix seconds).
    pub issued_at: u64,
    /// Expiry time (Unix seconds).
    pub expires_at: u64,
    /// Application claims supplied at issue time.
    pub claims: serde_json::Map<String, Value>,
}

#[derive(Serialize, Deserialize)]
struct TokenClaims {
    uid: String,
    iat: u64,
    exp: u64,
    /// Revocation generation of the user when the token was issued
    #[serde(default, rename = "gen")]
    generation: u64,
    #[serde(default)]
    claims: serde_json::Map<String, Value>,
}

#[derive(Serialize, Deserialize)]
struct StoredUser {
    record: UserRecord,
    /// Argon2 PHC string
    password_hash: String,
    /// Bumped by every revocation
    #[serde(default)]
    token_generation: u64,
}

/// User store and token authority.
///
/// Same lifecycle rules as the document store: after [`Driver::close`] every
/// call fails with [`DriverError::Closed`].
pub struct IdentityProvider {
    path: PathBuf,
    db: Mutex<Option<Arc<Database>>>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_ttl: Duration,
    closed: AtomicBool,
}

impl IdentityProvider {
    /// Connect using the TOML credentials file at `credentials_path`.
    pub async fn connect(credentials_path: &str) -> Result<Self, DriverError> {
        let path = Path::new(credentials_path);
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            DriverError::InvalidCredentials(format!("cannot read {credentials_path:?}: {e}"))
        })?;
        let mut credentials: IdentityCredentials = toml::from_str(&text)
            .map_err(|e| DriverError::InvalidCredentials(e.to_string()))?;

        if credentials.store.is_relative() {
            if let Some(dir) = path.parent() {
                credentials.store = dir.join(&credentials.store);
            }
        }

        Self::with_credentials(credentials, DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Open the user store described by `credentials`.
    pub async fn with_credentials(
        credentials: IdentityCredentials,
        timeout: Duration,
    ) -> Result<Self, DriverError> {
        if credentials.signing_key.len() < MIN_SIGNING_KEY_LEN {
            return Err(DriverError::InvalidCredentials(format!(
                "signing key must be at least {MIN_SIGNING_KEY_LEN} bytes"
            )));
        }

        let db = open_database(credentials.store.clone(), timeout).await?;
        let secret = credentials.signing_key.as_bytes();
        let provider = Self {
            path: credentials.store,
            db: Mutex::new(Some(Arc::new(db))),
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            token_ttl: Duration::from_secs(credentials.token_ttl_secs),
            closed: AtomicBool::new(false),
        };
        provider.init()?;

        tracing::info!(path = %provider.path.display(), "identity provider connected");
        Ok(provider)
    }

    /// Look up a user by uid.
    pub fn get_user(&self, uid: &str) -> Result<UserRecord, DriverError> {
        let db = self.database()?;
        let txn = db.begin_read().map_err(io_error)?;
        let users = txn.open_table(USERS).map_err(io_error)?;

        read_user(&users, uid)?
            .map(|stored| stored.record)
            .ok_or_else(|| DriverError::NotFound(format!("user {uid}")))
    }

    /// Look up a user by email (case-insensitive).
    pub fn get_user_by_email(&self, email: &str) -> Result<UserRecord, DriverError> {
        let db = self.database()?;
        let txn = db.begin_read().map_err(io_error)?;
        let emails = txn.open_table(EMAILS).map_err(io_error)?;
        let users = txn.open_table(USERS).map_err(io_error)?;

        let email_key = email.to_ascii_lowercase();
        let uid = emails
            .get(email_key.as_str())
            .map_err(io_error)?
            .map(|uid| uid.value().to_string())
            .ok_or_else(|| DriverError::NotFound(format!("user with email {email}")))?;

        read_user(&users, &uid)?
            .map(|stored| stored.record)
            .ok_or_else(|| DriverError::NotFound(format!("user {uid}")))
    }

    /// Create an enabled user. Emails are unique.
    pub fn create_user(&self, user: NewUser) -> Result<UserRecord, DriverError> {
        if user.email.is_empty() {
            return Err(DriverError::InvalidCredentials("email is required".to_string()));
        }

        let now = unix_now_millis();
        let record = UserRecord {
            uid: uuid::Uuid::new_v4().simple().to_string(),
            email: user.email,
            display_name: user.display_name,
            phone_number: None,
            photo_url: None,
            email_verified: false,
            disabled: false,
            tokens_valid_after_ms: 0,
            created_at_ms: now,
        };
        let password_hash = hash_password(&user.password)?;
        let stored = StoredUser { record: record.clone(), password_hash, token_generation: 0 };

        let db = self.database()?;
        let txn = db.begin_write().map_err(io_error)?;
        {
            let mut emails = txn.open_table(EMAILS).map_err(io_error)?;
            let mut users = txn.open_table(USERS).map_err(io_error)?;

            let email_key = record.email.to_ascii_lowercase();
            if emails.get(email_key.as_str()).map_err(io_error)?.is_some() {
                return Err(DriverError::AlreadyExists(format!("user with email {}", record.email)));
            }

            emails.insert(email_key.as_str(), record.uid.as_str()).map_err(io_error)?;
            write_user(&mut users, &stored)?;
        }
        txn.commit().map_err(io_error)?;

        tracing::debug!(uid = %record.uid, "user created");
        Ok(record)
    }

    /// Apply the set fields of `update` to user `uid`.
    pub fn update_user(&self, uid: &str, update: UserUpdate) -> Result<UserRecord, DriverError> {
        let db = self.database()?;
        let txn = db.begin_write().map_err(io_error)?;
        let record = {
            let mut emails = txn.open_table(EMAILS).map_err(io_error)?;
            let mut users = txn.open_table(USERS).map_err(io_error)?;

            let mut stored = read_user(&users, uid)?
                .ok_or_else(|| DriverError::NotFound(format!("user {uid}")))?;

            if let Some(email) = non_empty(update.email) {
                let old_key = stored.record.email.to_ascii_lowercase();
                let new_key = email.to_ascii_lowercase();
                if new_key != old_key {
                    if emails.get(new_key.as_str()).map_err(io_error)?.is_some() {
                        return Err(DriverError::AlreadyExists(format!("user with email {email}")));
                    }
                    emails.remove(old_key.as_str()).map_err(io_error)?;
                    emails.insert(new_key.as_str(), uid).map_err(io_error)?;
                }
                stored.record.email = email;
            }
            if let Some(password) = non_empty(update.password) {
                stored.password_hash = hash_password(&password)?;
            }
            if let Some(display_name) = non_empty(update.display_name) {
                stored.record.display_name = display_name;
            }
            if let Some(phone_number) = non_empty(update.phone_number) {
                stored.record.phone_number = Some(phone_number);
            }
            if let Some(photo_url) = non_empty(update.photo_url) {
                stored.record.photo_url = Some(photo_url);
            }
            if let Some(verified) = update.email_verified {
                stored.record.email_verified = verified;
            }
            if let Some(disabled) = update.disabled {
                stored.record.disabled = disabled;
            }

            write_user(&mut users, &stored)?;
            stored.record
        };
        txn.commit().map_err(io_error)?;

        Ok(record)
    }

    /// Delete user `uid`.
    pub fn delete_user(&self, uid: &str) -> Result<(), DriverError> {
        let db = self.database()?;
        let txn = db.begin_write().map_err(io_error)?;
        {
            let mut emails = txn.open_table(EMAILS).map_err(io_error)?;
            let mut users = txn.open_table(USERS).map_err(io_error)?;

            let stored = read_user(&users, uid)?
                .ok_or_else(|| DriverError::NotFound(format!("user {uid}")))?;

            users.remove(uid).map_err(io_error)?;
            emails.remove(stored.record.email.to_ascii_lowercase().as_str()).map_err(io_error)?;
        }
        txn.commit().map_err(io_error)?;

        tracing::debug!(uid, "user deleted");
        Ok(())
    }

    /// Check an email/password pair and return the matching user.
    pub fn verify_password(&self, email: &str, password: &str) -> Result<UserRecord, DriverError> {
        let record = self.get_user_by_email(email)?;

        let db = self.database()?;
        let txn = db.begin_read().map_err(io_error)?;
        let users = txn.open_table(USERS).map_err(io_error)?;
        let stored = read_user(&users, &record.uid)?
            .ok_or_else(|| DriverError::NotFound(format!("user {}", record.uid)))?;

        let hash = PasswordHash::new(&stored.password_hash)
            .map_err(|e| DriverError::Serialization(format!("stored password hash: {e}")))?;
        Argon2::default()
            .verify_password(password.as_bytes(), &hash)
            .map_err(|_| DriverError::InvalidCredentials("wrong email or password".to_string()))?;

        Ok(stored.record)
    }

    /// Issue a token for `uid` carrying `claims`, valid for the configured TTL.
    pub fn custom_token(
        &self,
        uid: &str,
        claims: serde_json::Map<String, Value>,
    ) -> Result<String, DriverError> {
        self.custom_token_with_ttl(uid, claims, self.token_ttl)
    }

    /// Issue a token for `uid` valid for `ttl`.
    ///
    /// TTLs past the representable range saturate to the far future.
    pub fn custom_token_with_ttl(
        &self,
        uid: &str,
        claims: serde_json::Map<String, Value>,
        ttl: Duration,
    ) -> Result<String, DriverError> {
        let generation = self.token_generation(uid)?;

        let now = unix_now_millis() / 1000;
        let claims = TokenClaims {
            uid: uid.to_string(),
            iat: now,
            exp: now.saturating_add(ttl.as_secs()),
            generation,
            claims,
        };

        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| DriverError::Serialization(format!("token encoding failed: {e}")))
    }

    /// Verify a token's signature and expiry.
    ///
    /// With `check_revoked`, the user must also still exist, be enabled, and
    /// the token must postdate the last [`Self::revoke_refresh_tokens`].
    pub fn verify_id_token(&self, token: &str, check_revoked: bool) -> Result<VerifiedToken, DriverError> {
        if self.is_closed() {
            return Err(DriverError::Closed);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let claims = jsonwebtoken::decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => DriverError::TokenExpired,
                _ => DriverError::InvalidToken(e.to_string()),
            })?
            .claims;

        if check_revoked {
            let db = self.database()?;
            let txn = db.begin_read().map_err(io_error)?;
            let users = txn.open_table(USERS).map_err(io_error)?;
            let stored = read_user(&users, &claims.uid)?
                .ok_or_else(|| DriverError::NotFound(format!("user {}", claims.uid)))?;

            if stored.record.disabled {
                return Err(DriverError::InvalidToken(format!("user {} is disabled", claims.uid)));
            }
            if claims.generation < stored.token_generation {
                return Err(DriverError::TokenRevoked);
            }
        }

        Ok(VerifiedToken {
            uid: claims.uid,
            issued_at: claims.iat,
            expires_at: claims.exp,
            claims: claims.claims,
        })
    }

    /// Revoke every token issued to `uid` up to now.
    pub fn revoke_refresh_tokens(&self, uid: &str) -> Result<(), DriverError> {
        let db = self.database()?;
        let txn = db.begin_write().map_err(io_error)?;
        {
            let mut users = txn.open_table(USERS).map_err(io_error)?;
            let mut stored = read_user(&users, uid)?
                .ok_or_else(|| DriverError::NotFound(format!("user {uid}")))?;
            stored.record.tokens_valid_after_ms = unix_now_millis();
            stored.token_generation += 1;
            write_user(&mut users, &stored)?;
        }
        txn.commit().map_err(io_error)?;

        tracing::info!(uid, "refresh tokens revoked");
        Ok(())
    }

    /// Current revocation generation of `uid`, zero for unknown users.
    fn token_generation(&self, uid: &str) -> Result<u64, DriverError> {
        let db = self.database()?;
        let txn = db.begin_read().map_err(io_error)?;
        let users = txn.open_table(USERS).map_err(io_error)?;
        Ok(read_user(&users, uid)?.map_or(0, |stored| stored.token_generation))
    }

    fn database(&self) -> Result<Arc<Database>, DriverError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::Closed);
        }
        self.db.lock().unwrap_or_else(PoisonError::into_inner).clone().ok_or(DriverError::Closed)
    }
}

impl Driver for IdentityProvider {
    fn kind(&self) -> DriverKind {
        DriverKind::IdentityProvider
    }

    fn init(&self) -> Result<(), DriverError> {
        let db = self.database()?;
        let txn = db.begin_write().map_err(io_error)?;
        {
            let _ = txn.open_table(USERS).map_err(io_error)?;
            let _ = txn.open_table(EMAILS).map_err(io_error)?;
        }
        txn.commit().map_err(io_error)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.db.lock().unwrap_or_else(PoisonError::into_inner).take();
        tracing::info!(path = %self.path.display(), "identity provider closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for IdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityProvider")
            .field("path", &self.path)
            .field("token_ttl", &self.token_ttl)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn read_user<T: ReadableTable<&'static str, &'static [u8]>>(
    table: &T,
    uid: &str,
) -> Result<Option<StoredUser>, DriverError> {
    match table.get(uid).map_err(io_error)? {
        Some(value) => {
            let stored = ciborium::from_reader(value.value())
                .map_err(|e| DriverError::Serialization(e.to_string()))?;
            Ok(Some(stored))
        },
        None => Ok(None),
    }
}

fn write_user(table: &mut redb::Table<'_, &'static str, &'static [u8]>, stored: &StoredUser) -> Result<(), DriverError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(stored, &mut bytes).map_err(|e| DriverError::Serialization(e.to_string()))?;
    table.insert(stored.record.uid.as_str(), bytes.as_slice()).map_err(io_error)?;
    Ok(())
}

fn hash_password(password: &str) -> Result<String, DriverError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| DriverError::Serialization(format!("password hashing failed: {e}")))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn io_error(e: impl fmt::Display) -> DriverError {
    DriverError::Io(e.to_string())
}

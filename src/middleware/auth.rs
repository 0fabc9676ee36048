//! Authentication middleware.
//!
//! Three credentials are accepted, checked in this order: `Authorization:
//! Bearer <token>`, `X-API-Key: <key>`, and `Authorization: LocalMCP
//! <token>` issued by the browser handshake flow. Bearer and API key are
//! mutually exclusive; a request carrying both is rejected outright.
//!
//! The handshake flow is origin-bound: the client starts a handshake for
//! its origin, the operator reads the rotating 6-hex-digit code out of
//! band, and the client proves knowledge of it with an HMAC keyed by a
//! PBKDF2 derivation of the code. Handshakes expire after one minute,
//! issued tokens after ten.

use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use sha2::Sha256;
use std::sync::Mutex;
use tracing::debug;

use super::{ChainState, Middleware, VAL_API_KEY, VAL_AUTHORIZATION, VAL_ORIGIN};
use crate::config::schema::{AuthConfig, AuthMode};
use crate::error::{GatewayError, Result};

type HmacSha256 = Hmac<Sha256>;

/// How long a started handshake may be completed.
pub const HANDSHAKE_TTL: Duration = Duration::from_secs(60);

/// How long an issued handshake token is valid.
pub const TOKEN_TTL: Duration = Duration::from_secs(600);

/// How often the pairing code rotates.
const CODE_ROTATION: Duration = Duration::from_secs(300);

/// PBKDF2 iteration count for the proof key.
const PBKDF2_ROUNDS: u32 = 100_000;

/// The authenticated caller attached to the chain state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Stable identity used for rate limiting and logs.
    pub subject: String,
    /// Which credential authenticated it: `bearer`, `api-key`,
    /// `handshake`, or `anonymous`.
    pub method: &'static str,
    /// Granted permissions; `*` means everything.
    pub permissions: Vec<String>,
}

impl Principal {
    fn new(subject: impl Into<String>, method: &'static str) -> Self {
        Self {
            subject: subject.into(),
            method,
            permissions: vec!["*".to_string()],
        }
    }
}

struct PendingHandshake {
    origin: String,
    nonce: String,
    started: Instant,
}

struct IssuedToken {
    origin: String,
    issued: Instant,
}

struct RotatingCode {
    code: String,
    rotated: Instant,
}

/// Issues and validates origin-bound handshake tokens.
pub struct HandshakeManager {
    code: Mutex<RotatingCode>,
    pending: DashMap<String, PendingHandshake>,
    tokens: DashMap<String, IssuedToken>,
}

impl HandshakeManager {
    /// Creates a manager with a fresh pairing code.
    #[must_use]
    pub fn new() -> Self {
        Self {
            code: Mutex::new(RotatingCode {
                code: random_code(),
                rotated: Instant::now(),
            }),
            pending: DashMap::new(),
            tokens: DashMap::new(),
        }
    }

    /// The pairing code currently in effect, rotating it when stale.
    ///
    /// The operator surfaces this out of band (terminal, tray icon); it is
    /// never sent to the browser.
    #[must_use]
    pub fn current_code(&self) -> String {
        let mut code = self.code.lock().expect("code lock poisoned");
        if code.rotated.elapsed() >= CODE_ROTATION {
            code.code = random_code();
            code.rotated = Instant::now();
        }
        code.code.clone()
    }

    /// Starts a handshake for an origin; returns `(handshakeId, nonce)`.
    #[must_use]
    pub fn start(&self, origin: &str) -> (String, String) {
        let handshake_id = random_hex(16);
        let nonce = random_hex(16);
        self.pending.insert(
            handshake_id.clone(),
            PendingHandshake {
                origin: origin.to_string(),
                nonce: nonce.clone(),
                started: Instant::now(),
            },
        );
        (handshake_id, nonce)
    }

    /// Completes a handshake: verifies the proof and issues a token bound
    /// to the starting origin.
    ///
    /// The expected proof is
    /// `base64(HMAC-SHA256(key = PBKDF2(code, nonce), msg = "{id}.{origin}"))`.
    ///
    /// # Errors
    ///
    /// `Unauthorized` for unknown/expired handshakes, origin mismatches,
    /// and bad proofs.
    pub fn complete(&self, handshake_id: &str, origin: &str, proof: &str) -> Result<String> {
        let (_, pending) = self
            .pending
            .remove(handshake_id)
            .ok_or_else(|| GatewayError::Unauthorized("unknown handshake".into()))?;
        if pending.started.elapsed() > HANDSHAKE_TTL {
            return Err(GatewayError::Unauthorized("handshake expired".into()));
        }
        if pending.origin != origin {
            return Err(GatewayError::Unauthorized("origin mismatch".into()));
        }

        let expected = proof_for(&self.current_code(), &pending.nonce, handshake_id, origin)?;
        let presented = BASE64
            .decode(proof)
            .map_err(|_| GatewayError::Unauthorized("malformed proof".into()))?;
        expected
            .verify_slice(&presented)
            .map_err(|_| GatewayError::Unauthorized("proof verification failed".into()))?;

        let token = random_hex(32);
        self.tokens.insert(
            token.clone(),
            IssuedToken {
                origin: origin.to_string(),
                issued: Instant::now(),
            },
        );
        debug!(origin, "handshake token issued");
        Ok(token)
    }

    /// Validates a `LocalMCP` token, enforcing the origin binding when the
    /// request carries an `Origin` header.
    ///
    /// # Errors
    ///
    /// `Unauthorized` for unknown, expired, or origin-mismatched tokens.
    pub fn validate(&self, token: &str, origin: Option<&str>) -> Result<Principal> {
        let entry = self
            .tokens
            .get(token)
            .ok_or_else(|| GatewayError::Unauthorized("unknown handshake token".into()))?;
        if entry.issued.elapsed() > TOKEN_TTL {
            drop(entry);
            self.tokens.remove(token);
            return Err(GatewayError::Unauthorized("handshake token expired".into()));
        }
        if let Some(origin) = origin {
            if origin != entry.origin {
                return Err(GatewayError::Unauthorized("token bound to another origin".into()));
            }
        }
        Ok(Principal::new(format!("handshake:{}", entry.origin), "handshake"))
    }

    /// Drops expired handshakes and tokens.
    pub fn sweep(&self) {
        self.pending.retain(|_, p| p.started.elapsed() <= HANDSHAKE_TTL);
        self.tokens.retain(|_, t| t.issued.elapsed() <= TOKEN_TTL);
    }
}

impl Default for HandshakeManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes the client-side proof for a handshake; also used by tests and
/// the pairing helper in the CLI.
///
/// # Errors
///
/// `Internal` when key derivation fails (cannot happen with SHA-256 sizes).
pub fn compute_proof(code: &str, nonce: &str, handshake_id: &str, origin: &str) -> Result<String> {
    let mac = proof_for(code, nonce, handshake_id, origin)?;
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

fn proof_for(code: &str, nonce: &str, handshake_id: &str, origin: &str) -> Result<HmacSha256> {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(code.as_bytes(), nonce.as_bytes(), PBKDF2_ROUNDS, &mut key)
        .map_err(|e| GatewayError::Internal(format!("key derivation failed: {e}")))?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| GatewayError::Internal(format!("hmac init failed: {e}")))?;
    mac.update(handshake_id.as_bytes());
    mac.update(b".");
    mac.update(origin.as_bytes());
    Ok(mac)
}

fn random_code() -> String {
    random_hex(3)
}

fn random_hex(bytes: usize) -> String {
    let mut rng = rand::rng();
    (0..bytes).map(|_| format!("{:02x}", rng.random::<u8>())).collect()
}

/// Validates credentials against the configured accept lists.
pub struct Authenticator {
    config: AuthConfig,
    handshake: HandshakeManager,
}

impl Authenticator {
    /// Creates an authenticator from config.
    #[must_use]
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            handshake: HandshakeManager::new(),
        }
    }

    /// The handshake manager (for the pairing endpoints).
    #[must_use]
    pub fn handshake(&self) -> &HandshakeManager {
        &self.handshake
    }

    /// Authenticates one request's credentials.
    ///
    /// # Errors
    ///
    /// `Validation` when mutually exclusive credentials are combined,
    /// `Unauthorized` when nothing acceptable was presented.
    pub fn authenticate(
        &self,
        authorization: Option<&str>,
        api_key: Option<&str>,
        origin: Option<&str>,
    ) -> Result<Principal> {
        if self.config.mode == AuthMode::Disabled {
            return Ok(Principal::new("anonymous", "anonymous"));
        }

        if authorization.is_some() && api_key.is_some() {
            return Err(GatewayError::Validation(
                "Authorization and X-API-Key are mutually exclusive".into(),
            ));
        }

        if let Some(header) = authorization {
            if let Some(token) = header.strip_prefix("Bearer ") {
                if self.config.bearer_tokens.iter().any(|t| t == token) {
                    return Ok(Principal::new(format!("bearer:{}", mask(token)), "bearer"));
                }
                return Err(GatewayError::Unauthorized("unknown bearer token".into()));
            }
            if let Some(token) = header.strip_prefix("LocalMCP ") {
                if !self.config.handshake.enabled {
                    return Err(GatewayError::Unauthorized("handshake auth is disabled".into()));
                }
                return self.handshake.validate(token, origin);
            }
            return Err(GatewayError::Unauthorized("unsupported authorization scheme".into()));
        }

        if let Some(key) = api_key {
            if let Some(subject) = self.config.api_keys.get(key) {
                return Ok(Principal::new(subject.clone(), "api-key"));
            }
            return Err(GatewayError::Unauthorized("unknown API key".into()));
        }

        Err(GatewayError::Unauthorized("no credentials presented".into()))
    }

    /// Whether the origin may start a handshake.
    #[must_use]
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.config.handshake.enabled
            && self
                .config
                .handshake
                .allowed_origins
                .iter()
                .any(|o| o == origin || o == "*")
    }
}

/// Masks a secret as first4…last4 for logs and principals.
#[must_use]
pub fn mask(secret: &str) -> String {
    if secret.len() <= 8 {
        return "…".to_string();
    }
    format!("{}…{}", &secret[..4], &secret[secret.len() - 4..])
}

/// Chain stage that authenticates the request and attaches the principal.
pub struct AuthMiddleware {
    authenticator: std::sync::Arc<Authenticator>,
}

impl AuthMiddleware {
    /// Wraps an authenticator for chain use.
    #[must_use]
    pub fn new(authenticator: std::sync::Arc<Authenticator>) -> Self {
        Self { authenticator }
    }
}

#[async_trait::async_trait]
impl Middleware for AuthMiddleware {
    fn name(&self) -> &str {
        "authentication"
    }

    async fn before_agent(&self, state: &mut ChainState) -> Result<()> {
        let principal = self.authenticator.authenticate(
            state.get_str(VAL_AUTHORIZATION),
            state.get_str(VAL_API_KEY),
            state.get_str(VAL_ORIGIN),
        )?;
        state.set("auth.subject", json!(principal.subject));
        state.principal = Some(principal);
        Ok(())
    }
}

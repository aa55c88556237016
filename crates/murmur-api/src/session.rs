use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use murmur_auth::{PasswordHasher, TokenCodec, TokenError};
use murmur_db::models::{NewUser, UserRow};
use murmur_db::{Database, DbError, TokenLedger};
use murmur_types::api::{AuthResponse, LoginRequest, SignupRequest, TokenPairResponse};

use crate::error::AuthError;
use crate::validate;

/// How login reports a correct password on a deactivated account.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoginPolicy {
    /// Answer `InvalidCredentials` instead of `DeactivatedAccount`, so the
    /// response does not reveal that the account exists.
    pub conceal_deactivated: bool,
}

/// Account and token-chain lifecycle.
///
/// Each successful login or signup starts a refresh-token chain. `refresh`
/// moves the chain forward one link and retires the old link; `logout`
/// retires the current link. A retired link never becomes usable again.
///
/// SQLite and Argon2 calls block, so every operation runs its body on the
/// blocking pool.
#[derive(Clone)]
pub struct SessionService {
    db: Arc<Database>,
    ledger: TokenLedger,
    codec: Arc<TokenCodec>,
    hasher: PasswordHasher,
    policy: LoginPolicy,
}

impl SessionService {
    pub fn new(
        db: Arc<Database>,
        codec: Arc<TokenCodec>,
        hasher: PasswordHasher,
        policy: LoginPolicy,
    ) -> Self {
        Self {
            ledger: TokenLedger::new(db.clone()),
            db,
            codec,
            hasher,
            policy,
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn ledger(&self) -> &TokenLedger {
        &self.ledger
    }

    pub async fn signup(&self, req: SignupRequest) -> Result<AuthResponse, AuthError> {
        let input = validate::signup(req)?;
        let this = self.clone();

        blocking(move || {
            let password_hash = this.hasher.hash(&input.password)?;
            let user = this.db.create_user(&NewUser {
                username: &input.username,
                email: &input.email,
                password_hash: &password_hash,
                display_name: Some(&input.display_name),
            })?;

            info!("New account {} ({})", user.username, user.id);
            this.start_chain(&user)
        })
        .await
    }

    /// Unknown email and wrong password are indistinguishable. Failed
    /// attempts are not counted here; throttling belongs in front of this.
    pub async fn login(&self, req: LoginRequest) -> Result<AuthResponse, AuthError> {
        let input = validate::login(req)?;
        let this = self.clone();

        blocking(move || {
            let Some(user) = this.db.get_user_by_email(&input.email)? else {
                this.hasher.verify_decoy(&input.password);
                debug!("Login for unknown email");
                return Err(AuthError::InvalidCredentials);
            };

            if !this.hasher.verify(&input.password, &user.password_hash)? {
                debug!("Wrong password for {}", user.id);
                return Err(AuthError::InvalidCredentials);
            }

            if !user.is_active {
                warn!("Login attempt on deactivated account {}", user.id);
                return Err(if this.policy.conceal_deactivated {
                    AuthError::InvalidCredentials
                } else {
                    AuthError::DeactivatedAccount
                });
            }

            this.db.touch_last_login(user.id)?;
            info!("{} ({}) logged in", user.username, user.id);
            this.start_chain(&user)
        })
        .await
    }

    /// Exchange a refresh token for a new pair. On success the presented
    /// token is retired for good; presenting it again fails.
    pub async fn refresh(&self, refresh_token: String) -> Result<TokenPairResponse, AuthError> {
        let claims = self.codec.verify_refresh(&refresh_token).map_err(|e| match e {
            TokenError::Expired => AuthError::ExpiredRefreshToken,
            _ => AuthError::InvalidRefreshToken,
        })?;
        let this = self.clone();

        blocking(move || {
            let record = this
                .ledger
                .find(&refresh_token)?
                .ok_or(AuthError::InvalidRefreshToken)?;

            if record.user_id != claims.user_id {
                warn!("Refresh token {} presented with foreign claims", record.id);
                return Err(AuthError::InvalidRefreshToken);
            }
            if record.is_revoked() || record.is_replaced() {
                warn!("Retired refresh token {} presented again", record.id);
                return Err(AuthError::RevokedRefreshToken);
            }
            if record.is_expired_at(Utc::now()) {
                return Err(AuthError::ExpiredRefreshToken);
            }

            let access = this.codec.issue_access(&claims)?;
            let refresh = this.codec.issue_refresh(&claims)?;

            match this
                .ledger
                .rotate(record.id, &refresh.token, this.codec.refresh_ttl())
            {
                Ok(_) => {}
                // Another request rotated or revoked it between `find` and here.
                Err(DbError::StaleRecord | DbError::NotFound) => {
                    return Err(AuthError::RevokedRefreshToken);
                }
                Err(e) => return Err(e.into()),
            }

            debug!("Refreshed session for {}", claims.user_id);
            Ok(TokenPairResponse {
                access_token: access.token,
                refresh_token: refresh.token,
            })
        })
        .await
    }

    /// Retire a refresh token. Unknown, already revoked or missing tokens
    /// are all fine.
    pub async fn logout(&self, refresh_token: Option<String>) -> Result<(), AuthError> {
        let Some(token) = refresh_token.filter(|t| !t.is_empty()) else {
            return Ok(());
        };
        let ledger = self.ledger.clone();

        blocking(move || {
            if ledger.revoke(&token)? {
                debug!("Refresh token revoked");
            }
            Ok(())
        })
        .await
    }

    /// Issue an access token and the first link of a new refresh chain.
    fn start_chain(&self, user: &UserRow) -> Result<AuthResponse, AuthError> {
        let profile = user.profile();
        let identity = profile.identity();
        let access = self.codec.issue_access(&identity)?;
        let refresh = self.codec.issue_refresh(&identity)?;
        self.ledger
            .issue(user.id, &refresh.token, self.codec.refresh_ttl())?;

        Ok(AuthResponse {
            user: profile,
            access_token: access.token,
            refresh_token: refresh.token,
        })
    }
}

async fn blocking<F, T>(f: F) -> Result<T, AuthError>
where
    F: FnOnce() -> Result<T, AuthError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

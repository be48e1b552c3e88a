//! Re-authorization for irreversible admin operations.
//!
//! Every gated call carries fresh admin credentials, independent of any login
//! session. Resetting an election additionally needs a one-time code issued
//! beforehand and the confirmation phrase. Each attempt, successful or not,
//! is appended to the audit log.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{
    Admin, AdminAction, AdminActionKind, AdminCredentials, Code, ElectionId, Outcome, Proof,
    ResetCode,
};
use crate::store::{AdminStore, AuditLog, ResetCodeStore};

/// The exact phrase an admin must type to confirm a reset.
pub const RESET_CONFIRMATION_PHRASE: &str = "RESET ELECTION";

/// Delivers reset codes to the admin who requested them, out of band.
#[rocket::async_trait]
pub trait CodeNotifier: Send + Sync {
    async fn deliver(&self, admin: &str, election: ElectionId, code: &Code) -> Result<()>;
}

/// Used when no delivery channel is configured. Records that a code was
/// issued; the code itself never reaches the log, so such codes cannot be
/// used.
pub struct LogNotifier;

impl LogNotifier {
    fn notice(admin: &str, election: ElectionId) -> String {
        format!(
            "Reset code for election {election} issued to {admin}, \
             but no delivery channel is configured"
        )
    }
}

#[rocket::async_trait]
impl CodeNotifier for LogNotifier {
    async fn deliver(&self, admin: &str, election: ElectionId, _code: &Code) -> Result<()> {
        warn!("{}", Self::notice(admin, election));
        Ok(())
    }
}

/// What a [`WebhookNotifier`] posts.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeDelivery {
    pub admin: String,
    pub election_id: ElectionId,
    pub code: String,
}

/// Posts each code as JSON to a relay that forwards it to the admin, such as
/// a mail or SMS gateway.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::DeliveryFailed(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[rocket::async_trait]
impl CodeNotifier for WebhookNotifier {
    async fn deliver(&self, admin: &str, election: ElectionId, code: &Code) -> Result<()> {
        let delivery = CodeDelivery {
            admin: admin.to_string(),
            election_id: election,
            code: code.to_string(),
        };
        self.client
            .post(&self.url)
            .json(&delivery)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| Error::DeliveryFailed(e.to_string()))?;
        info!("Reset code for election {election} sent to {admin}");
        Ok(())
    }
}

/// The extra factors a reset needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetConfirmation {
    pub code: String,
    pub phrase: String,
}

pub struct AdminAuthorizationGate {
    admins: Arc<dyn AdminStore>,
    audit: Arc<dyn AuditLog>,
    codes: Arc<dyn ResetCodeStore>,
    notifier: Arc<dyn CodeNotifier>,
    hmac_secret: Vec<u8>,
    code_ttl: Duration,
}

impl AdminAuthorizationGate {
    pub fn new(
        admins: Arc<dyn AdminStore>,
        audit: Arc<dyn AuditLog>,
        codes: Arc<dyn ResetCodeStore>,
        notifier: Arc<dyn CodeNotifier>,
        hmac_secret: impl Into<Vec<u8>>,
        code_ttl: Duration,
    ) -> Self {
        Self {
            admins,
            audit,
            codes,
            notifier,
            hmac_secret: hmac_secret.into(),
            code_ttl,
        }
    }

    async fn authenticate(&self, credentials: &AdminCredentials) -> Result<Admin> {
        self.admins
            .find(&credentials.username)
            .await?
            .filter(|admin| admin.verify_password(&credentials.password))
            .ok_or(Error::AuthenticationFailed)
    }

    async fn record<T>(
        &self,
        kind: AdminActionKind,
        election_id: Option<ElectionId>,
        actor: &str,
        proofs: Vec<Proof>,
        result: &Result<T>,
    ) {
        let action = AdminAction {
            kind,
            election_id,
            actor: actor.to_string(),
            proofs,
            at: Utc::now(),
            outcome: Outcome::from(result),
        };
        if let Err(e) = self.audit.append(action).await {
            error!("Failed to write audit record for {kind:?} by {actor}: {e}");
        }
    }

    /// Run `action` as the authenticated admin, or fail with
    /// [`Error::AuthenticationFailed`] without running it.
    pub async fn authorize<T, F, Fut>(
        &self,
        kind: AdminActionKind,
        election_id: Option<ElectionId>,
        credentials: &AdminCredentials,
        action: F,
    ) -> Result<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = match self.authenticate(credentials).await {
            Ok(admin) => action(admin.username).await,
            Err(e) => {
                warn!("Rejected {kind:?} by {}: {e}", credentials.username);
                Err(e)
            }
        };
        self.record(
            kind,
            election_id,
            &credentials.username,
            vec![Proof::Password],
            &result,
        )
        .await;
        result
    }

    /// Issue a one-time reset code for `election` and hand it to the notifier.
    /// Any earlier code for the election stops working.
    pub async fn issue_reset_code(
        &self,
        election: ElectionId,
        credentials: &AdminCredentials,
    ) -> Result<()> {
        self.authorize(
            AdminActionKind::IssueResetCode,
            Some(election),
            credentials,
            |actor| async move {
                let code = Code::random();
                let ttl = chrono::Duration::from_std(self.code_ttl)
                    .map_err(|_| Error::BadRequest("Reset code TTL out of range".to_string()))?;
                self.codes
                    .put(ResetCode {
                        election_id: election,
                        issued_to: actor.clone(),
                        code_digest: code.digest(election, &self.hmac_secret),
                        expire_at: Utc::now() + ttl,
                    })
                    .await?;
                self.notifier.deliver(&actor, election, &code).await
            },
        )
        .await
    }

    /// Take the outstanding code for `election` and check `presented` against
    /// it. The code is consumed whatever the result.
    async fn consume_code(
        &self,
        election: ElectionId,
        presented: &str,
        username: &str,
    ) -> Result<bool> {
        let Some(issued) = self.codes.take(election).await? else {
            return Ok(false);
        };
        let Ok(code) = presented.trim().parse::<Code>() else {
            return Ok(false);
        };
        Ok(issued.expire_at > Utc::now()
            && issued.issued_to == username
            && code.matches(election, &self.hmac_secret, &issued.code_digest))
    }

    /// Run a reset `action` once the password, the one-time code and the
    /// confirmation phrase have all been checked.
    ///
    /// All three factors are evaluated before deciding. A bad password is
    /// reported as [`Error::AuthenticationFailed`]; a bad code or phrase as
    /// [`Error::ConfirmationMismatch`], without saying which.
    pub async fn authorize_reset<T, F, Fut>(
        &self,
        election: ElectionId,
        credentials: &AdminCredentials,
        confirmation: &ResetConfirmation,
        action: F,
    ) -> Result<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let authenticated = self.authenticate(credentials).await;
        let code_ok = self
            .consume_code(election, &confirmation.code, &credentials.username)
            .await;
        let phrase_ok = confirmation.phrase == RESET_CONFIRMATION_PHRASE;

        let result = match (authenticated, code_ok) {
            (Err(e), _) | (_, Err(e)) => Err(e),
            (Ok(_), Ok(false)) => Err(Error::ConfirmationMismatch),
            (Ok(_), Ok(true)) if !phrase_ok => Err(Error::ConfirmationMismatch),
            (Ok(admin), Ok(true)) => action(admin.username).await,
        };
        if let Err(e) = &result {
            warn!(
                "Reset of election {election} by {} failed: {e}",
                credentials.username
            );
        }
        self.record(
            AdminActionKind::Reset,
            Some(election),
            &credentials.username,
            vec![Proof::Password, Proof::ConfirmationCode, Proof::ConfirmPhrase],
            &result,
        )
        .await;
        result
    }
}

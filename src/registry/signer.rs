use crate::error::{Error, Result};
use crate::ledger::{Address, LedgerClient};

/// Chooses the account that signs deployment transactions.
#[rocket::async_trait]
pub trait SignerProvider: Send + Sync {
    async fn signer(&self, ledger: &dyn LedgerClient) -> Result<Address>;
}

/// Sign with the first account the node reports.
pub struct FirstAccountSigner;

#[rocket::async_trait]
impl SignerProvider for FirstAccountSigner {
    async fn signer(&self, ledger: &dyn LedgerClient) -> Result<Address> {
        ledger
            .accounts()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::NoSignerAvailable)
    }
}

/// Sign with a configured account, which the node must be able to sign for.
pub struct FixedSigner(pub Address);

#[rocket::async_trait]
impl SignerProvider for FixedSigner {
    async fn signer(&self, ledger: &dyn LedgerClient) -> Result<Address> {
        if ledger.accounts().await?.contains(&self.0) {
            Ok(self.0)
        } else {
            Err(Error::NoSignerAvailable)
        }
    }
}

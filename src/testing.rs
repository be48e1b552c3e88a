//! Shared fixtures for service and API tests. Injected by `#[backend_test]`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::gate::testing::CapturingNotifier;
use crate::gate::{AdminAuthorizationGate, ResetConfirmation, RESET_CONFIRMATION_PHRASE};
use crate::ledger::mock::MockLedger;
use crate::ledger::ReceiptPolling;
use crate::model::{AdminCredentials, Election, ElectionId, ElectionStatus};
use crate::registry::{
    ContractRegistry, FirstAccountSigner, InlineArtifactSource, MemoryDeploymentStore,
};
use crate::service::{ElectionService, NewCandidate, ResetRequest};
use crate::store::{ensure_admin_exists, Stores};

pub struct Harness {
    pub ledger: Arc<MockLedger>,
    pub stores: Stores,
    pub deployments: Arc<MemoryDeploymentStore>,
    pub notifier: Arc<CapturingNotifier>,
    pub service: ElectionService,
}

impl Harness {
    /// A service over in-memory stores and a mock ledger with nothing
    /// deployed yet. The example admin exists.
    pub async fn new() -> Self {
        let ledger = Arc::new(MockLedger::new());
        let stores = Stores::memory();
        let deployments = Arc::new(MemoryDeploymentStore::new());
        let notifier = Arc::new(CapturingNotifier::default());

        ensure_admin_exists(stores.admins.as_ref(), AdminCredentials::example())
            .await
            .unwrap();

        let registry = ContractRegistry::new(
            ledger.clone(),
            deployments.clone(),
            vec![Box::new(InlineArtifactSource::new(
                json!([{"type": "function", "name": "finalize"}]),
                Some(vec![0x60, 0x80, 0x60, 0x40]),
            ))],
            Arc::new(FirstAccountSigner),
        )
        .with_polling(ReceiptPolling {
            interval: Duration::from_millis(2),
            timeout: Duration::from_millis(40),
        })
        .with_rpc("http://mock");

        let gate = AdminAuthorizationGate::new(
            stores.admins.clone(),
            stores.audit.clone(),
            stores.reset_codes.clone(),
            notifier.clone(),
            "test hmac secret",
            Duration::from_secs(300),
        );

        let service = ElectionService::new(stores.clone(), Arc::new(registry), gate);
        Self {
            ledger,
            stores,
            deployments,
            notifier,
            service,
        }
    }

    /// As [`Harness::new`], with the contract already deployed.
    pub async fn deployed() -> Self {
        let harness = Self::new().await;
        harness.service.registry().ensure_deployed().await.unwrap();
        harness
    }

    /// A fresh election in `Setup` with no candidates.
    pub async fn new_election(&self) -> Election {
        let seats: BTreeSet<String> = ["President".to_string(), "Treasurer".to_string()]
            .into_iter()
            .collect();
        self.service
            .create_election("Student Union 2026", seats, &AdminCredentials::example())
            .await
            .unwrap()
    }

    /// A fresh election in `Setup` with candidates 1 and 2 and a locked list.
    pub async fn locked_election(&self) -> Election {
        let election = self.new_election().await;
        for (name, seat) in [("Ada Lovelace", "President"), ("Charles Babbage", "Treasurer")] {
            self.service
                .add_candidate(
                    election.id,
                    &NewCandidate {
                        name: name.to_string(),
                        seat: seat.to_string(),
                    },
                )
                .await
                .unwrap();
        }
        self.service.lock_candidate_list(election.id).await.unwrap()
    }

    pub async fn open_election(&self) -> Election {
        let election = self.locked_election().await;
        self.service
            .change_status(election.id, ElectionStatus::Open, &AdminCredentials::example())
            .await
            .unwrap()
    }

    /// Issue a reset code for `election` and build a well-formed request with it.
    pub async fn reset_request(&self, election: ElectionId, reason: &str) -> ResetRequest {
        self.service
            .issue_reset_code(election, &AdminCredentials::example())
            .await
            .unwrap();
        let code = self.notifier.last_code(election).unwrap();
        ResetRequest {
            reason: reason.to_string(),
            confirmation: ResetConfirmation {
                code: code.to_string(),
                phrase: RESET_CONFIRMATION_PHRASE.to_string(),
            },
            credentials: AdminCredentials::example(),
        }
    }
}

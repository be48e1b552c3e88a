//! An in-process ledger for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use super::{
    abi, Address, BlockTag, LedgerClient, LedgerError, LogEntry, NetworkId, Receipt, Topic,
    Transaction, TxHash,
};

/// What to do with the next submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextOutcome {
    Mine,
    Revert,
    /// Accept the transaction but never produce a receipt.
    Stall,
}

struct State {
    network_id: NetworkId,
    accounts: Vec<Address>,
    code: HashMap<Address, Vec<u8>>,
    receipts: HashMap<TxHash, Receipt>,
    /// Accepted but unmined, in submission order.
    stalled: Vec<(TxHash, Transaction)>,
    submissions: Vec<Transaction>,
    /// Mined transaction count per sender.
    mined: HashMap<Address, u64>,
    logs: Vec<LogEntry>,
    next: NextOutcome,
    lose_response: bool,
    gas_estimate: Result<u64, LedgerError>,
    unreachable: bool,
    block: u64,
}

impl State {
    fn pending_count(&self, sender: &Address) -> u64 {
        let queued = self
            .stalled
            .iter()
            .filter(|(_, tx)| tx.from.as_ref() == Some(sender))
            .count() as u64;
        self.mined.get(sender).copied().unwrap_or(0) + queued
    }
}

/// A deterministic, in-memory chain. Nonces are strict: a transaction must
/// use exactly the sender's next nonce.
pub struct MockLedger {
    state: Mutex<State>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                network_id: NetworkId::from("5777"),
                accounts: vec![Address([0xa1; 20]), Address([0xa2; 20])],
                code: HashMap::new(),
                receipts: HashMap::new(),
                stalled: Vec::new(),
                submissions: Vec::new(),
                mined: HashMap::new(),
                logs: Vec::new(),
                next: NextOutcome::Mine,
                lose_response: false,
                gas_estimate: Ok(1_500_000),
                unreachable: false,
                block: 0,
            }),
        }
    }

    pub fn set_accounts(&self, accounts: Vec<Address>) {
        self.state.lock().unwrap().accounts = accounts;
    }

    pub fn set_gas_estimate(&self, estimate: Result<u64, LedgerError>) {
        self.state.lock().unwrap().gas_estimate = estimate;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    pub fn revert_next(&self) {
        self.state.lock().unwrap().next = NextOutcome::Revert;
    }

    pub fn stall_next(&self) {
        self.state.lock().unwrap().next = NextOutcome::Stall;
    }

    /// Accept the next submission as usual, but fail the call as if the
    /// connection dropped before the node answered.
    pub fn lose_next_response(&self) {
        self.state.lock().unwrap().lose_response = true;
    }

    /// Mine every stalled transaction successfully.
    pub fn mine_stalled(&self) {
        let mut state = self.state.lock().unwrap();
        let stalled = std::mem::take(&mut state.stalled);
        for (hash, tx) in stalled {
            Self::mine(&mut state, hash, &tx, true);
        }
    }

    /// Drop every stalled transaction, as a node restart would.
    pub fn drop_stalled(&self) {
        self.state.lock().unwrap().stalled.clear();
    }

    /// Simulate a chain reset: all deployed code, receipts and logs disappear.
    pub fn wipe_chain(&self) {
        let mut state = self.state.lock().unwrap();
        state.code.clear();
        state.receipts.clear();
        state.stalled.clear();
        state.logs.clear();
    }

    /// Place code at an address directly.
    pub fn install_code(&self, address: Address, code: Vec<u8>) {
        self.state.lock().unwrap().code.insert(address, code);
    }

    /// Every transaction the node accepted, in order, with its nonce filled in.
    pub fn submissions(&self) -> Vec<Transaction> {
        self.state.lock().unwrap().submissions.clone()
    }

    fn mine(state: &mut State, hash: TxHash, tx: &Transaction, success: bool) {
        state.block += 1;
        let sender = tx.from.unwrap_or(Address([0; 20]));
        let nonce = state.mined.get(&sender).copied().unwrap_or(0);
        state.mined.insert(sender, nonce + 1);

        let contract_address = match (tx.to, success) {
            (None, true) => {
                let address = abi::create_address(&sender, nonce);
                state.code.insert(address, tx.data.clone());
                Some(address)
            }
            (Some(to), true) => {
                Self::emit_finalized(state, to, hash, &tx.data);
                None
            }
            _ => None,
        };
        let receipt = Receipt {
            tx_hash: hash,
            contract_address,
            success,
            block_number: state.block,
        };
        state.receipts.insert(hash, receipt);
    }

    /// A finalize call to a deployed contract emits its event. Calls to an
    /// address without code succeed and do nothing, as on a real chain.
    fn emit_finalized(state: &mut State, to: Address, hash: TxHash, data: &[u8]) {
        let deployed = state.code.get(&to).map_or(false, |code| !code.is_empty());
        if !deployed || data.len() != 68 || data[..4] != abi::selector(abi::FINALIZE_SIGNATURE) {
            return;
        }
        let mut election = [0; 32];
        election.copy_from_slice(&data[4..36]);
        state.logs.push(LogEntry {
            address: to,
            topics: vec![abi::event_topic(abi::FINALIZED_EVENT), Topic(election)],
            data: data[36..].to_vec(),
            tx_hash: hash,
            block_number: state.block,
        });
    }

    fn check_reachable(state: &State) -> Result<(), LedgerError> {
        if state.unreachable {
            Err(LedgerError::RpcUnreachable("connection refused".into()))
        } else {
            Ok(())
        }
    }

    fn rejected(message: &str) -> LedgerError {
        LedgerError::Rpc {
            code: -32000,
            message: message.to_string(),
        }
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[rocket::async_trait]
impl LedgerClient for MockLedger {
    async fn code_at(&self, address: &Address) -> Result<Vec<u8>, LedgerError> {
        let state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        Ok(state.code.get(address).cloned().unwrap_or_default())
    }

    async fn accounts(&self) -> Result<Vec<Address>, LedgerError> {
        let state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        Ok(state.accounts.clone())
    }

    async fn estimate_gas(&self, _tx: &Transaction) -> Result<u64, LedgerError> {
        let state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        state.gas_estimate.clone()
    }

    async fn transaction_count(
        &self,
        address: &Address,
        tag: BlockTag,
    ) -> Result<u64, LedgerError> {
        let state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        Ok(match tag {
            BlockTag::Latest => state.mined.get(address).copied().unwrap_or(0),
            BlockTag::Pending => state.pending_count(address),
        })
    }

    async fn submit(&self, tx: &Transaction) -> Result<TxHash, LedgerError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        let sender = tx.from.ok_or_else(|| Self::rejected("missing sender"))?;
        let expected = state.pending_count(&sender);
        let nonce = tx.nonce.unwrap_or(expected);
        if nonce < expected {
            return Err(Self::rejected("nonce too low"));
        }
        if nonce > expected {
            return Err(Self::rejected("nonce too high"));
        }

        let tx = tx.clone().with_nonce(nonce);
        state.submissions.push(tx.clone());
        let mut hasher = Sha256::new();
        hasher.update((state.submissions.len() as u64).to_be_bytes());
        hasher.update(sender.as_bytes());
        hasher.update(nonce.to_be_bytes());
        hasher.update(&tx.data);
        let hash = TxHash(hasher.finalize().into());

        match std::mem::replace(&mut state.next, NextOutcome::Mine) {
            NextOutcome::Mine => Self::mine(&mut state, hash, &tx, true),
            NextOutcome::Revert => Self::mine(&mut state, hash, &tx, false),
            NextOutcome::Stall => state.stalled.push((hash, tx)),
        }
        if std::mem::take(&mut state.lose_response) {
            return Err(LedgerError::NoResponse("connection reset".into()));
        }
        Ok(hash)
    }

    async fn receipt(&self, tx_hash: &TxHash) -> Result<Option<Receipt>, LedgerError> {
        let state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        Ok(state.receipts.get(tx_hash).cloned())
    }

    async fn logs(
        &self,
        address: &Address,
        topics: &[Topic],
    ) -> Result<Vec<LogEntry>, LedgerError> {
        let state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        Ok(state
            .logs
            .iter()
            .filter(|log| &log.address == address && log.topics.starts_with(topics))
            .cloned()
            .collect())
    }

    async fn network_id(&self) -> Result<NetworkId, LedgerError> {
        let state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        Ok(state.network_id.clone())
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{trace, warn};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    decode_hex, decode_quantity, encode_hex, encode_quantity, Address, BlockTag, LedgerClient,
    LedgerError, LogEntry, NetworkId, Receipt, Topic, Transaction, TxHash,
};

/// Ethereum-style JSON-RPC 2.0 client over HTTP.
pub struct JsonRpcLedger {
    url: String,
    client: Client,
    read_retries: u32,
    next_id: AtomicU64,
}

#[derive(Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Receipt fields we care about, as the node returns them.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: TxHash,
    contract_address: Option<Address>,
    #[serde(default)]
    status: Option<String>,
    block_number: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    address: Address,
    topics: Vec<Topic>,
    data: String,
    transaction_hash: TxHash,
    block_number: Option<String>,
    #[serde(default)]
    removed: bool,
}

/// Classify a transport failure by whether the request could have been
/// delivered.
fn transport_error(e: reqwest::Error) -> LedgerError {
    if e.is_connect() || e.is_builder() {
        LedgerError::RpcUnreachable(e.to_string())
    } else if e.is_decode() {
        LedgerError::Malformed(e.to_string())
    } else {
        LedgerError::NoResponse(e.to_string())
    }
}

impl JsonRpcLedger {
    /// Create a client for the node at `url`. Every request is bounded by `timeout`.
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        read_retries: u32,
    ) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::RpcUnreachable(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
            read_retries,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Perform a single JSON-RPC call.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, LedgerError> {
        let request = Request {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        trace!("RPC -> {method} (id {})", request.id);
        let response: Response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?
            .json()
            .await
            .map_err(transport_error)?;
        if let Some(error) = response.error {
            return Err(LedgerError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        let result = response.result.unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(|e| LedgerError::Malformed(format!("{method}: {e}")))
    }

    /// Perform an idempotent call, retrying on transport failure.
    async fn read<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, LedgerError> {
        let mut attempt = 0;
        loop {
            match self.call(method, params.clone()).await {
                Err(e) if e.is_transient() && attempt < self.read_retries => {
                    attempt += 1;
                    warn!("{method} failed ({e}), retry {attempt}/{}", self.read_retries);
                }
                result => return result,
            }
        }
    }
}

/// JSON form of a transaction for `eth_estimateGas` / `eth_sendTransaction`.
fn tx_object(tx: &Transaction) -> Value {
    let mut object = json!({ "data": encode_hex(&tx.data) });
    if let Some(from) = tx.from {
        object["from"] = json!(from);
    }
    if let Some(to) = tx.to {
        object["to"] = json!(to);
    }
    if let Some(gas) = tx.gas {
        object["gas"] = json!(encode_quantity(gas));
    }
    if let Some(nonce) = tx.nonce {
        object["nonce"] = json!(encode_quantity(nonce));
    }
    object
}

fn parse_receipt(raw: RawReceipt) -> Result<Receipt, LedgerError> {
    let malformed = |e: super::HexError| LedgerError::Malformed(e.to_string());
    // Pre-Byzantium nodes omit `status`; treat those receipts as successful.
    let success = match raw.status.as_deref() {
        Some(status) => decode_quantity(status).map_err(malformed)? == 1,
        None => true,
    };
    let block_number = match raw.block_number.as_deref() {
        Some(number) => decode_quantity(number).map_err(malformed)?,
        None => 0,
    };
    Ok(Receipt {
        tx_hash: raw.transaction_hash,
        contract_address: raw.contract_address,
        success,
        block_number,
    })
}

fn parse_log(raw: RawLog) -> Result<LogEntry, LedgerError> {
    let malformed = |e: super::HexError| LedgerError::Malformed(e.to_string());
    Ok(LogEntry {
        address: raw.address,
        topics: raw.topics,
        data: decode_hex(&raw.data).map_err(malformed)?,
        tx_hash: raw.transaction_hash,
        block_number: match raw.block_number.as_deref() {
            Some(number) => decode_quantity(number).map_err(malformed)?,
            None => 0,
        },
    })
}

#[rocket::async_trait]
impl LedgerClient for JsonRpcLedger {
    async fn code_at(&self, address: &Address) -> Result<Vec<u8>, LedgerError> {
        let code: String = self.read("eth_getCode", json!([address, "latest"])).await?;
        let bytes = decode_hex(&code).map_err(|e| LedgerError::Malformed(e.to_string()))?;
        // Some nodes report "0x0" for empty accounts.
        if bytes.iter().all(|b| *b == 0) {
            Ok(Vec::new())
        } else {
            Ok(bytes)
        }
    }

    async fn accounts(&self) -> Result<Vec<Address>, LedgerError> {
        self.read("eth_accounts", json!([])).await
    }

    async fn estimate_gas(&self, tx: &Transaction) -> Result<u64, LedgerError> {
        let gas: String = self.read("eth_estimateGas", json!([tx_object(tx)])).await?;
        decode_quantity(&gas).map_err(|e| LedgerError::Malformed(e.to_string()))
    }

    async fn transaction_count(
        &self,
        address: &Address,
        tag: BlockTag,
    ) -> Result<u64, LedgerError> {
        let count: String = self
            .read("eth_getTransactionCount", json!([address, tag.as_str()]))
            .await?;
        decode_quantity(&count).map_err(|e| LedgerError::Malformed(e.to_string()))
    }

    async fn submit(&self, tx: &Transaction) -> Result<TxHash, LedgerError> {
        self.call("eth_sendTransaction", json!([tx_object(tx)])).await
    }

    async fn receipt(&self, tx_hash: &TxHash) -> Result<Option<Receipt>, LedgerError> {
        let raw: Option<RawReceipt> = self
            .read("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        raw.map(parse_receipt).transpose()
    }

    async fn logs(
        &self,
        address: &Address,
        topics: &[Topic],
    ) -> Result<Vec<LogEntry>, LedgerError> {
        let filter = json!({
            "address": address,
            "topics": topics,
            "fromBlock": "earliest",
            "toBlock": "latest",
        });
        let raw: Vec<RawLog> = self.read("eth_getLogs", json!([filter])).await?;
        raw.into_iter()
            .filter(|log| !log.removed)
            .map(parse_log)
            .collect()
    }

    async fn network_id(&self) -> Result<NetworkId, LedgerError> {
        let id: String = self.read("net_version", json!([])).await?;
        Ok(NetworkId(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_json() {
        let from: Address = "0x1111111111111111111111111111111111111111".parse().unwrap();
        let tx = Transaction::deployment(vec![0x60, 0x80])
            .sent_by(from)
            .with_gas(3_000_000)
            .with_nonce(7);
        assert_eq!(
            tx_object(&tx),
            json!({
                "from": "0x1111111111111111111111111111111111111111",
                "data": "0x6080",
                "gas": "0x2dc6c0",
                "nonce": "0x7",
            })
        );
    }

    #[test]
    fn log_parsing() {
        let raw: RawLog = serde_json::from_value(json!({
            "address": "0x2222222222222222222222222222222222222222",
            "topics": [format!("0x{}", "01".repeat(32))],
            "data": "0xbeef",
            "transactionHash": format!("0x{}", "ab".repeat(32)),
            "blockNumber": "0x10",
        }))
        .unwrap();
        assert!(!raw.removed);
        let log = parse_log(raw).unwrap();
        assert_eq!(log.topics, vec![Topic([1; 32])]);
        assert_eq!(log.data, vec![0xbe, 0xef]);
        assert_eq!(log.block_number, 16);
    }

    #[test]
    fn receipt_parsing() {
        let raw: RawReceipt = serde_json::from_value(json!({
            "transactionHash": format!("0x{}", "ab".repeat(32)),
            "contractAddress": "0x2222222222222222222222222222222222222222",
            "status": "0x1",
            "blockNumber": "0x10",
        }))
        .unwrap();
        let receipt = parse_receipt(raw).unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.block_number, 16);
        assert!(receipt.contract_address.is_some());

        let raw: RawReceipt = serde_json::from_value(json!({
            "transactionHash": format!("0x{}", "cd".repeat(32)),
            "contractAddress": null,
            "status": "0x0",
            "blockNumber": "0x11",
        }))
        .unwrap();
        assert!(!parse_receipt(raw).unwrap().success);
    }

    #[rocket::async_test]
    async fn unreachable_node() {
        // Nothing listens on port 9 (discard) on loopback in the test environment.
        let ledger =
            JsonRpcLedger::new("http://127.0.0.1:9", Duration::from_millis(200), 1).unwrap();
        let result = ledger.network_id().await;
        assert!(matches!(result, Err(LedgerError::RpcUnreachable(_))));
    }
}

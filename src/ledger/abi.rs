//! Just enough of the contract ABI to call the finalize entry point and
//! recognise its event, plus the rule for contract creation addresses.

use sha3::{Digest, Keccak256};

use super::{Address, Topic};

/// Signature of the contract's finalize entry point. The contract tallies from
/// its own state; the digest binds our off-chain snapshot to the transaction.
pub const FINALIZE_SIGNATURE: &str = "finalize(uint256,bytes32)";

/// Emitted by a successful finalize, with the election id indexed.
pub const FINALIZED_EVENT: &str = "Finalized(uint256,bytes32)";

/// The four-byte selector of a function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = Keccak256::digest(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Left-pad an unsigned integer into a 32-byte ABI word.
fn uint_word(value: u64) -> [u8; 32] {
    let mut word = [0; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

/// The first topic of every log emitted for an event signature.
pub fn event_topic(signature: &str) -> Topic {
    Topic(Keccak256::digest(signature.as_bytes()).into())
}

/// Topics selecting the `Finalized` log of one election.
pub fn finalized_topics(election_id: u64) -> [Topic; 2] {
    [event_topic(FINALIZED_EVENT), Topic(uint_word(election_id))]
}

/// Calldata for `finalize(electionId, snapshotDigest)`.
pub fn encode_finalize(election_id: u64, snapshot_digest: &[u8; 32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32 * 2);
    data.extend_from_slice(&selector(FINALIZE_SIGNATURE));
    data.extend_from_slice(&uint_word(election_id));
    data.extend_from_slice(snapshot_digest);
    data
}

/// Address of the contract created by `sender`'s transaction with `nonce`:
/// the last 20 bytes of `keccak256(rlp([sender, nonce]))`.
pub fn create_address(sender: &Address, nonce: u64) -> Address {
    let nonce_bytes = nonce.to_be_bytes();
    let significant = &nonce_bytes[nonce_bytes.iter().take_while(|b| **b == 0).count()..];
    let mut nonce_rlp = Vec::with_capacity(9);
    match significant {
        [] => nonce_rlp.push(0x80),
        [byte] if *byte < 0x80 => nonce_rlp.push(*byte),
        bytes => {
            nonce_rlp.push(0x80 + bytes.len() as u8);
            nonce_rlp.extend_from_slice(bytes);
        }
    }

    let mut rlp = Vec::with_capacity(1 + 21 + nonce_rlp.len());
    rlp.push(0xc0 + (21 + nonce_rlp.len()) as u8);
    rlp.push(0x80 + 20);
    rlp.extend_from_slice(sender.as_bytes());
    rlp.extend_from_slice(&nonce_rlp);

    let hash = Keccak256::digest(&rlp);
    let mut address = [0; 20];
    address.copy_from_slice(&hash[12..]);
    Address(address)
}

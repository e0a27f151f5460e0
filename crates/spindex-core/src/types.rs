//! Chain primitives: hashes, transactions, headers and blocks, decoded from
//! the daemon's raw Bitcoin serialization.
//!
//! Hashes are held in internal (wire) byte order. Their hex form is
//! byte-reversed, which is how daemons and wallets display them.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::encode::{write_compact_size, write_var_bytes, Reader};
use crate::error::DecodeError;
use crate::hash::double_sha256;

/// Length of a [`HashX`] in bytes.
pub const HASHX_LEN: usize = 11;

/// Serialized block header length.
pub const HEADER_LEN: usize = 80;

/// `OP_RETURN`: outputs whose script starts with it can never be spent.
const OP_RETURN: u8 = 0x6a;

/// A 32-byte hash in internal byte order.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash. Used as the previous hash of genesis and in coinbase prevouts.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Byte-reversed hex, the display form.
    pub fn to_hex(&self) -> String {
        let mut rev = self.0;
        rev.reverse();
        hex::encode(rev)
    }

    /// Parse the byte-reversed hex display form.
    pub fn from_hex(s: &str) -> Result<Self, DecodeError> {
        if s.len() != 64 {
            return Err(DecodeError::InvalidLength { expected: 64, got: s.len() });
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| DecodeError::InvalidHex(e.to_string()))?;
        bytes.reverse();
        Ok(Self(bytes))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Truncated script hash used as the index key for history and UTXOs.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct HashX(pub [u8; HASHX_LEN]);

impl HashX {
    /// Take the first [`HASHX_LEN`] bytes of `bytes`.
    pub fn from_prefix(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HASHX_LEN {
            return Err(DecodeError::InvalidLength { expected: HASHX_LEN, got: bytes.len() });
        }
        let mut out = [0u8; HASHX_LEN];
        out.copy_from_slice(&bytes[..HASHX_LEN]);
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; HASHX_LEN] {
        &self.0
    }
}

impl fmt::Display for HashX {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Reference to an output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash256, index: u32) -> Self {
        Self { hash, index }
    }

    /// The null outpoint referenced by coinbase inputs.
    pub fn null() -> Self {
        Self { hash: Hash256::ZERO, index: u32::MAX }
    }

    pub fn is_null(&self) -> bool {
        self.hash.is_zero() && self.index == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash, self.index)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prev_out: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    /// Value in satoshis.
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    /// Provably unspendable outputs are kept out of the index.
    pub fn is_unspendable(&self) -> bool {
        self.script_pubkey.first() == Some(&OP_RETURN)
    }
}

/// A transaction. `witnesses` is either empty or holds one stack per input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
    pub witnesses: Vec<Vec<Vec<u8>>>,
}

impl Transaction {
    /// Decode one transaction from the reader, legacy or segwit.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let version = r.read_i32_le()?;
        let mut segwit = false;
        let mut input_count = r.read_len()?;
        if input_count == 0 {
            // Segwit marker 0x00 followed by flag 0x01.
            let flag = r.read_u8()?;
            if flag != 0x01 {
                return Err(DecodeError::InvalidSegwitFlag(flag));
            }
            segwit = true;
            input_count = r.read_len()?;
        }

        let mut inputs = Vec::with_capacity(input_count.min(4096));
        for _ in 0..input_count {
            let hash = r.read_hash()?;
            let index = r.read_u32_le()?;
            let script_sig = r.read_var_bytes()?;
            let sequence = r.read_u32_le()?;
            inputs.push(TxIn { prev_out: OutPoint { hash, index }, script_sig, sequence });
        }

        let output_count = r.read_len()?;
        let mut outputs = Vec::with_capacity(output_count.min(4096));
        for _ in 0..output_count {
            let value = r.read_u64_le()?;
            let script_pubkey = r.read_var_bytes()?;
            outputs.push(TxOut { value, script_pubkey });
        }

        let mut witnesses = Vec::new();
        if segwit {
            for _ in 0..inputs.len() {
                let items = r.read_len()?;
                let mut stack = Vec::with_capacity(items.min(256));
                for _ in 0..items {
                    stack.push(r.read_var_bytes()?);
                }
                witnesses.push(stack);
            }
        }

        let lock_time = r.read_u32_le()?;
        Ok(Self { version, inputs, outputs, lock_time, witnesses })
    }

    /// Decode a standalone raw transaction.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(raw);
        let tx = Self::decode(&mut r)?;
        r.finish("transaction")?;
        Ok(tx)
    }

    pub fn has_witness(&self) -> bool {
        self.witnesses.iter().any(|stack| !stack.is_empty())
    }

    /// Serialization without witness data; the txid commits to this.
    pub fn serialize_legacy(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write(&mut out, false);
        out
    }

    /// Full serialization, including witness data when present.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write(&mut out, self.has_witness());
        out
    }

    fn write(&self, out: &mut Vec<u8>, with_witness: bool) {
        out.extend_from_slice(&self.version.to_le_bytes());
        if with_witness {
            out.extend_from_slice(&[0x00, 0x01]);
        }
        write_compact_size(out, self.inputs.len() as u64);
        for input in &self.inputs {
            out.extend_from_slice(input.prev_out.hash.as_bytes());
            out.extend_from_slice(&input.prev_out.index.to_le_bytes());
            write_var_bytes(out, &input.script_sig);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_compact_size(out, self.outputs.len() as u64);
        for output in &self.outputs {
            out.extend_from_slice(&output.value.to_le_bytes());
            write_var_bytes(out, &output.script_pubkey);
        }
        if with_witness {
            for i in 0..self.inputs.len() {
                let stack = self.witnesses.get(i).map(Vec::as_slice).unwrap_or(&[]);
                write_compact_size(out, stack.len() as u64);
                for item in stack {
                    write_var_bytes(out, item);
                }
            }
        }
        out.extend_from_slice(&self.lock_time.to_le_bytes());
    }

    pub fn txid(&self) -> Hash256 {
        double_sha256(&self.serialize_legacy())
    }

    /// Weight units: legacy bytes count four times, witness bytes once.
    pub fn weight(&self) -> usize {
        let base = self.serialize_legacy().len();
        let total = if self.has_witness() { self.serialize().len() } else { base };
        base * 3 + total
    }

    /// Virtual size in vbytes, rounded up.
    pub fn vsize(&self) -> usize {
        self.weight().div_ceil(4)
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prev_out.is_null()
    }
}

/// An 80-byte block header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: r.read_i32_le()?,
            prev_hash: r.read_hash()?,
            merkle_root: r.read_hash()?,
            time: r.read_u32_le()?,
            bits: r.read_u32_le()?,
            nonce: r.read_u32_le()?,
        })
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, DecodeError> {
        if raw.len() != HEADER_LEN {
            return Err(DecodeError::InvalidLength { expected: HEADER_LEN, got: raw.len() });
        }
        Self::decode(&mut Reader::new(raw))
    }

    pub fn serialize(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.prev_hash.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.time.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn hash(&self) -> Hash256 {
        double_sha256(&self.serialize())
    }
}

/// A block with its decoded transactions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn from_bytes(raw: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(raw);
        let header = BlockHeader::decode(&mut r)?;
        let count = r.read_len()?;
        let mut transactions = Vec::with_capacity(count.min(16_384));
        for _ in 0..count {
            transactions.push(Transaction::decode(&mut r)?);
        }
        r.finish("block")?;
        Ok(Self { header, transactions })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.header.serialize().to_vec();
        write_compact_size(&mut out, self.transactions.len() as u64);
        for tx in &self.transactions {
            out.extend_from_slice(&tx.serialize());
        }
        out
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::txid).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENESIS_HEADER: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";
    const GENESIS_COINBASE: &str = "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000";

    fn sample_tx() -> Transaction {
        Transaction {
            version: 2,
            inputs: vec![TxIn {
                prev_out: OutPoint::new(Hash256([0x11; 32]), 3),
                script_sig: vec![0x51],
                sequence: 0xffff_fffe,
            }],
            outputs: vec![
                TxOut { value: 5_000, script_pubkey: vec![0x76, 0xa9, 0x14] },
                TxOut { value: 0, script_pubkey: vec![OP_RETURN, 0x01] },
            ],
            lock_time: 7,
            witnesses: Vec::new(),
        }
    }

    // --- Hash256 ---

    #[test]
    fn hash_hex_is_byte_reversed() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        let h = Hash256(bytes);
        assert!(h.to_hex().ends_with("ab"));
        assert_eq!(Hash256::from_hex(&h.to_hex()).unwrap(), h);
    }

    #[test]
    fn hash_from_hex_rejects_bad_input() {
        assert!(matches!(Hash256::from_hex("abcd"), Err(DecodeError::InvalidLength { .. })));
        let bad = "zz".repeat(32);
        assert!(matches!(Hash256::from_hex(&bad), Err(DecodeError::InvalidHex(_))));
    }

    #[test]
    fn hashx_takes_prefix() {
        let hx = HashX::from_prefix(&[7u8; 32]).unwrap();
        assert_eq!(hx.as_bytes(), &[7u8; HASHX_LEN]);
        assert!(HashX::from_prefix(&[1u8; 4]).is_err());
    }

    // --- Headers and blocks ---

    #[test]
    fn genesis_header_hash() {
        let raw = hex::decode(GENESIS_HEADER).unwrap();
        let header = BlockHeader::from_bytes(&raw).unwrap();
        assert_eq!(
            header.hash().to_hex(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(header.serialize().to_vec(), raw);
        assert!(header.prev_hash.is_zero());
    }

    #[test]
    fn genesis_block_decodes() {
        let mut raw = hex::decode(GENESIS_HEADER).unwrap();
        raw.push(1);
        raw.extend(hex::decode(GENESIS_COINBASE).unwrap());
        let block = Block::from_bytes(&raw).unwrap();
        assert_eq!(block.transactions.len(), 1);
        let coinbase = &block.transactions[0];
        assert!(coinbase.is_coinbase());
        assert_eq!(coinbase.outputs[0].value, 50 * 100_000_000);
        assert_eq!(
            coinbase.txid().to_hex(),
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
        );
        assert_eq!(coinbase.txid(), block.header.merkle_root);
        assert_eq!(block.serialize(), raw);
    }

    #[test]
    fn block_with_trailing_bytes_rejected() {
        let mut raw = hex::decode(GENESIS_HEADER).unwrap();
        raw.push(0);
        raw.push(0xee);
        assert!(matches!(Block::from_bytes(&raw), Err(DecodeError::TrailingBytes { .. })));
    }

    #[test]
    fn header_wrong_length_rejected() {
        assert!(BlockHeader::from_bytes(&[0u8; 79]).is_err());
    }

    // --- Transactions ---

    #[test]
    fn legacy_transaction_reencodes() {
        let tx = sample_tx();
        let raw = tx.serialize();
        assert_eq!(Transaction::from_bytes(&raw).unwrap(), tx);
        assert_eq!(tx.vsize(), raw.len());
        assert!(!tx.is_coinbase());
    }

    #[test]
    fn witness_does_not_change_txid() {
        let legacy = sample_tx();
        let mut segwit = legacy.clone();
        segwit.witnesses = vec![vec![vec![0xaa; 72], vec![0xbb; 33]]];

        let raw = segwit.serialize();
        assert_eq!(&raw[4..6], &[0x00, 0x01]);
        let decoded = Transaction::from_bytes(&raw).unwrap();
        assert_eq!(decoded, segwit);
        assert_eq!(decoded.txid(), legacy.txid());
        assert!(decoded.vsize() < raw.len());
        assert!(decoded.vsize() > legacy.vsize());
    }

    #[test]
    fn op_return_is_unspendable() {
        let tx = sample_tx();
        assert!(!tx.outputs[0].is_unspendable());
        assert!(tx.outputs[1].is_unspendable());
    }

    #[test]
    fn null_outpoint() {
        assert!(OutPoint::null().is_null());
        assert!(!OutPoint::new(Hash256::ZERO, 0).is_null());
    }
}

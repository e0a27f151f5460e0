//! Error types for the spindex index server.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of data: need {need} bytes at offset {offset}")] Truncated { offset: usize, need: usize },
    #[error("compact size {0} too large")] CompactSizeTooLarge(u64),
    #[error("{what}: {count} trailing bytes")] TrailingBytes { what: &'static str, count: usize },
    #[error("invalid hex: {0}")] InvalidHex(String),
    #[error("invalid length: expected {expected}, got {got}")] InvalidLength { expected: usize, got: usize },
    #[error("invalid address: {0}")] InvalidAddress(String),
    #[error("invalid segwit flag {0:#04x}")] InvalidSegwitFlag(u8),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainStateError {
    #[error("missing UTXO for input {0}")] MissingUtxo(String),
    #[error("undo data missing for height {0}")] UndoDataMissing(u32),
    #[error("reorg of depth {depth} exceeds retained undo data ({retained} blocks)")] ReorgTooDeep { depth: u32, retained: u32 },
    #[error("height mismatch: expected {expected}, got {got}")] HeightMismatch { expected: u32, got: u32 },
    #[error("block at height {height} does not connect to tip {tip}")] ChainDiscontinuity { height: u32, tip: String },
    #[error("history flush count {flush_count} reached limit {limit}; run compaction")] HistoryOverflow { flush_count: u32, limit: u32 },
    #[error("genesis mismatch: index has {stored}, coin expects {expected}")] GenesisMismatch { stored: String, expected: String },
    #[error("corrupt index: {0}")] Corrupt(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DaemonError {
    #[error("daemon connection: {0}")] Connection(String),
    #[error("daemon error {code}: {message}")] Rpc { code: i64, message: String },
    #[error("daemon response: {0}")] Parse(String),
    #[error("daemon is warming up")] WarmingUp,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("peer {0} unreachable")] Unreachable(String),
    #[error("cannot resolve {0}")] Resolve(String),
    #[error("invalid features: {0}")] BadFeatures(String),
    #[error("peer {host} is on a different chain: genesis {genesis}")] GenesisMismatch { host: String, genesis: String },
    #[error("peer {host} protocol {min}-{max} is incompatible")] ProtocolMismatch { host: String, min: String, max: String },
    #[error("source {source_ip} does not match any address of {host}")] SourceMismatch { host: String, source_ip: String },
    #[error("peer {0} is blacklisted")] Blacklisted(String),
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error(transparent)] Decode(#[from] DecodeError),
    #[error(transparent)] ChainState(#[from] ChainStateError),
    #[error(transparent)] Daemon(#[from] DaemonError),
    #[error(transparent)] Merkle(#[from] crate::merkle::MerkleError),
    #[error("storage: {0}")] Storage(String),
}

impl IndexError {
    /// True when the history flush counter is exhausted and the index must
    /// be compacted before the server can continue.
    pub fn needs_compaction(&self) -> bool {
        matches!(self, IndexError::ChainState(ChainStateError::HistoryOverflow { .. }))
    }

    /// Daemon failures are retried; everything else stops the indexer.
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexError::Daemon(_))
    }

    pub fn is_fatal(&self) -> bool {
        !self.is_transient()
    }
}

//! Coin capability sets.
//!
//! A [`Coin`] bundles everything that differs between chains the server can
//! index: genesis parameters, the header and script hash functions, the
//! address codec and a few defaults. It is selected once at startup and
//! passed explicitly to the components that need it.

use sha2::{Digest, Sha256};

use crate::error::DecodeError;
use crate::hash::{double_sha256, sha256};
use crate::types::{HashX, Hash256};

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_EQUAL: u8 = 0x87;

/// Modes accepted by `estimatesmartfee`.
pub const ESTIMATEFEE_MODES: [&str; 2] = ["CONSERVATIVE", "ECONOMICAL"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}

/// Chain-specific parameters and hash functions.
#[derive(Clone, Debug)]
pub struct Coin {
    pub name: &'static str,
    pub network: Network,
    pub genesis_hash: Hash256,
    /// Hash of a raw 80-byte header.
    pub header_hash: fn(&[u8]) -> Hash256,
    /// Hash of a locking script, in internal byte order.
    pub script_hash: fn(&[u8]) -> [u8; 32],
    pub p2pkh_verbyte: u8,
    pub p2sh_verbyte: u8,
    /// Blocks of undo data retained for reorgs.
    pub reorg_limit: u32,
    pub tcp_port: u16,
    pub ssl_port: u16,
    /// Name of `script_hash` as advertised in `server.features`.
    pub hash_function: &'static str,
}

impl Coin {
    pub fn bitcoin() -> Self {
        Self {
            name: "Bitcoin",
            network: Network::Mainnet,
            genesis_hash: genesis("000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"),
            header_hash: double_sha256,
            script_hash: sha256,
            p2pkh_verbyte: 0x00,
            p2sh_verbyte: 0x05,
            reorg_limit: 200,
            tcp_port: 50001,
            ssl_port: 50002,
            hash_function: "sha256",
        }
    }

    pub fn testnet() -> Self {
        Self {
            name: "BitcoinTestnet",
            network: Network::Testnet,
            genesis_hash: genesis("000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"),
            p2pkh_verbyte: 0x6f,
            p2sh_verbyte: 0xc4,
            reorg_limit: 8000,
            tcp_port: 51001,
            ssl_port: 51002,
            ..Self::bitcoin()
        }
    }

    pub fn regtest() -> Self {
        Self {
            name: "BitcoinRegtest",
            network: Network::Regtest,
            genesis_hash: genesis("0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"),
            reorg_limit: 100,
            ..Self::testnet()
        }
    }

    /// Look up a coin by network name (`mainnet`/`bitcoin`, `testnet`, `regtest`).
    pub fn for_network(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "mainnet" | "bitcoin" => Some(Self::bitcoin()),
            "testnet" => Some(Self::testnet()),
            "regtest" => Some(Self::regtest()),
            _ => None,
        }
    }

    /// Index key of a locking script.
    pub fn hashx_from_script(&self, script: &[u8]) -> HashX {
        let mut out = [0u8; crate::types::HASHX_LEN];
        out.copy_from_slice(&(self.script_hash)(script)[..crate::types::HASHX_LEN]);
        HashX(out)
    }

    /// Client-facing script hash: byte-reversed hex of the script's hash.
    pub fn script_hash_hex(&self, script: &[u8]) -> String {
        let mut h = (self.script_hash)(script);
        h.reverse();
        hex::encode(h)
    }

    /// Convert a client script hash (64 hex chars, reversed) to a [`HashX`].
    pub fn hashx_from_script_hash(&self, script_hash: &str) -> Result<HashX, DecodeError> {
        let mut bytes = [0u8; 32];
        if script_hash.len() != 64 {
            return Err(DecodeError::InvalidLength { expected: 64, got: script_hash.len() });
        }
        hex::decode_to_slice(script_hash, &mut bytes).map_err(|e| DecodeError::InvalidHex(e.to_string()))?;
        bytes.reverse();
        HashX::from_prefix(&bytes)
    }

    pub fn header_hash(&self, raw: &[u8]) -> Hash256 {
        (self.header_hash)(raw)
    }

    /// Locking script for a base58check P2PKH or P2SH address.
    pub fn address_to_script(&self, address: &str) -> Result<Vec<u8>, DecodeError> {
        let payload = base58check_decode(address)?;
        if payload.len() != 21 {
            return Err(DecodeError::InvalidAddress(format!("{address}: bad payload length")));
        }
        let hash160 = &payload[1..];
        let verbyte = payload[0];
        if verbyte == self.p2pkh_verbyte {
            let mut script = vec![OP_DUP, OP_HASH160, 20];
            script.extend_from_slice(hash160);
            script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
            Ok(script)
        } else if verbyte == self.p2sh_verbyte {
            let mut script = vec![OP_HASH160, 20];
            script.extend_from_slice(hash160);
            script.push(OP_EQUAL);
            Ok(script)
        } else {
            Err(DecodeError::InvalidAddress(format!("{address}: unknown version byte {verbyte}")))
        }
    }

    /// Base58check address of a P2PKH or P2SH script, if it is one.
    pub fn script_to_address(&self, script: &[u8]) -> Option<String> {
        let (verbyte, hash160) = match script {
            [OP_DUP, OP_HASH160, 20, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG] if hash.len() == 20 => {
                (self.p2pkh_verbyte, hash)
            }
            [OP_HASH160, 20, hash @ .., OP_EQUAL] if hash.len() == 20 => (self.p2sh_verbyte, hash),
            _ => return None,
        };
        let mut payload = vec![verbyte];
        payload.extend_from_slice(hash160);
        Some(base58check_encode(&payload))
    }
}

fn genesis(hex: &str) -> Hash256 {
    Hash256::from_hex(hex).unwrap_or(Hash256::ZERO)
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(Sha256::digest(payload));
    [digest[0], digest[1], digest[2], digest[3]]
}

pub fn base58check_encode(payload: &[u8]) -> String {
    let mut data = payload.to_vec();
    data.extend_from_slice(&checksum(payload));
    bs58::encode(data).into_string()
}

pub fn base58check_decode(s: &str) -> Result<Vec<u8>, DecodeError> {
    let data = bs58::decode(s)
        .into_vec()
        .map_err(|e| DecodeError::InvalidAddress(format!("{s}: {e}")))?;
    if data.len() < 5 {
        return Err(DecodeError::InvalidAddress(format!("{s}: too short")));
    }
    let (payload, check) = data.split_at(data.len() - 4);
    if check != checksum(payload) {
        return Err(DecodeError::InvalidAddress(format!("{s}: bad checksum")));
    }
    Ok(payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SATOSHI_ADDRESS: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";
    const SATOSHI_SCRIPT: &str = "76a91462e907b15cbf27d5425399ebf6f0fb50ebb88f1888ac";
    const SATOSHI_SCRIPT_HASH: &str = "8b01df4e368ea28f8dc0423bcf7a4923e3a12d307c875e47a0cfbf90b5c39161";

    #[test]
    fn for_network_names() {
        assert_eq!(Coin::for_network("mainnet").unwrap().network, Network::Mainnet);
        assert_eq!(Coin::for_network("Bitcoin").unwrap().network, Network::Mainnet);
        assert_eq!(Coin::for_network("regtest").unwrap().p2pkh_verbyte, 0x6f);
        assert!(Coin::for_network("dogecoin").is_none());
    }

    #[test]
    fn genesis_hashes_parse() {
        for coin in [Coin::bitcoin(), Coin::testnet(), Coin::regtest()] {
            assert!(!coin.genesis_hash.is_zero(), "{}", coin.name);
        }
        assert_eq!(
            Coin::bitcoin().genesis_hash.to_hex(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    // ------------------------------------------------------------------
    // Script hashes
    // ------------------------------------------------------------------

    #[test]
    fn script_hash_matches_known_vector() {
        let coin = Coin::bitcoin();
        let script = hex::decode(SATOSHI_SCRIPT).unwrap();
        assert_eq!(coin.script_hash_hex(&script), SATOSHI_SCRIPT_HASH);
        let from_client = coin.hashx_from_script_hash(SATOSHI_SCRIPT_HASH).unwrap();
        assert_eq!(from_client, coin.hashx_from_script(&script));
    }

    #[test]
    fn bad_script_hash_rejected() {
        let coin = Coin::bitcoin();
        assert!(coin.hashx_from_script_hash("00").is_err());
        assert!(coin.hashx_from_script_hash(&"g".repeat(64)).is_err());
    }

    // ------------------------------------------------------------------
    // Addresses
    // ------------------------------------------------------------------

    #[test]
    fn p2pkh_address_roundtrip() {
        let coin = Coin::bitcoin();
        let script = coin.address_to_script(SATOSHI_ADDRESS).unwrap();
        assert_eq!(hex::encode(&script), SATOSHI_SCRIPT);
        assert_eq!(coin.script_to_address(&script).unwrap(), SATOSHI_ADDRESS);
    }

    #[test]
    fn p2sh_address() {
        let coin = Coin::bitcoin();
        let mut script = vec![OP_HASH160, 20];
        script.extend_from_slice(&[0x11; 20]);
        script.push(OP_EQUAL);
        assert_eq!(coin.script_to_address(&script).unwrap(), "33FFrcn4Tv1qgGEuXPkkPdr44DuWp3RzPo");
        assert_eq!(coin.address_to_script("33FFrcn4Tv1qgGEuXPkkPdr44DuWp3RzPo").unwrap(), script);
    }

    #[test]
    fn corrupted_address_rejected() {
        let coin = Coin::bitcoin();
        let mut bad = SATOSHI_ADDRESS.to_string();
        bad.replace_range(5..6, "Q");
        assert!(matches!(coin.address_to_script(&bad), Err(DecodeError::InvalidAddress(_))));
        // Mainnet address on testnet.
        assert!(Coin::testnet().address_to_script(SATOSHI_ADDRESS).is_err());
    }

    #[test]
    fn non_standard_script_has_no_address() {
        assert!(Coin::bitcoin().script_to_address(&[0x6a, 0x01, 0x00]).is_none());
    }
}

// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wire structures shared by both relay directions and the length-prefixed
//! zero-copy codec the hub uses for them. Numerics are fixed-width
//! little-endian; byte strings carry a varuint length prefix.

use crate::error::{RelayerError, RelayerResult};
use ethers::types::U256;
use ethers::utils::keccak256;

/// Append-only encoder for the hub wire format.
#[derive(Default)]
pub struct ZeroCopySink {
    buf: Vec<u8>,
}

impl ZeroCopySink {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_var_uint(&mut self, v: u64) {
        if v < 0xFD {
            self.write_u8(v as u8);
        } else if v <= 0xFFFF {
            self.write_u8(0xFD);
            self.write_u16(v as u16);
        } else if v <= 0xFFFF_FFFF {
            self.write_u8(0xFE);
            self.write_u32(v as u32);
        } else {
            self.write_u8(0xFF);
            self.write_u64(v);
        }
    }

    pub fn write_var_bytes(&mut self, data: &[u8]) {
        self.write_var_uint(data.len() as u64);
        self.buf.extend_from_slice(data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_var_bytes(s.as_bytes());
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor-based decoder over a borrowed buffer.
pub struct ZeroCopySource<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ZeroCopySource<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> RelayerResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(RelayerError::SerializationError(format!(
                "unexpected end of input while reading {what}"
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn next_u8(&mut self) -> RelayerResult<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    pub fn next_u16(&mut self) -> RelayerResult<u16> {
        let b = self.take(2, "u16")?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn next_u32(&mut self) -> RelayerResult<u32> {
        let b = self.take(4, "u32")?;
        Ok(u32::from_le_bytes(b.try_into().expect("4 bytes")))
    }

    pub fn next_u64(&mut self) -> RelayerResult<u64> {
        let b = self.take(8, "u64")?;
        Ok(u64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    pub fn next_var_uint(&mut self) -> RelayerResult<u64> {
        match self.next_u8()? {
            0xFD => Ok(self.next_u16()? as u64),
            0xFE => Ok(self.next_u32()? as u64),
            0xFF => self.next_u64(),
            v => Ok(v as u64),
        }
    }

    pub fn next_var_bytes(&mut self) -> RelayerResult<Vec<u8>> {
        let len = self.next_var_uint()? as usize;
        Ok(self.take(len, "var bytes")?.to_vec())
    }

    pub fn next_string(&mut self) -> RelayerResult<String> {
        let bytes = self.next_var_bytes()?;
        String::from_utf8(bytes)
            .map_err(|e| RelayerError::SerializationError(format!("invalid utf8 string: {e}")))
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// A cross-chain transfer observed on the side chain, waiting for its proof
/// to be accepted by the hub. Serialized verbatim as the retry-bucket key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossTransfer {
    /// Textual big-integer form of the on-chain tx id, used as the storage
    /// slot key when requesting the Merkle proof.
    pub tx_index: String,
    /// Side chain transaction hash.
    pub tx_id: Vec<u8>,
    /// Raw cross-chain payload, consumed opaquely by the hub.
    pub value: Vec<u8>,
    /// Destination chain id.
    pub to_chain: u32,
    /// Side chain block height at which the event was observed.
    pub height: u64,
}

impl CrossTransfer {
    pub fn serialization(&self, sink: &mut ZeroCopySink) {
        sink.write_string(&self.tx_index);
        sink.write_var_bytes(&self.tx_id);
        sink.write_var_bytes(&self.value);
        sink.write_u32(self.to_chain);
        sink.write_u64(self.height);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut sink = ZeroCopySink::new();
        self.serialization(&mut sink);
        sink.into_bytes()
    }

    pub fn deserialization(source: &mut ZeroCopySource<'_>) -> RelayerResult<Self> {
        let tx_index = source.next_string()?;
        let tx_id = source.next_var_bytes()?;
        let value = source.next_var_bytes()?;
        let to_chain = source.next_u32()?;
        let height = source.next_u64()?;
        Ok(Self {
            tx_index,
            tx_id,
            value,
            to_chain,
            height,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> RelayerResult<Self> {
        Self::deserialization(&mut ZeroCopySource::new(bytes))
    }
}

/// The structured cross-chain request carried in a `CrossChainEvent`'s
/// `rawdata` field. Only `method` and the addressing fields are inspected;
/// `args` stays opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakeTxParam {
    pub tx_hash: Vec<u8>,
    pub cross_chain_id: Vec<u8>,
    pub from_contract: Vec<u8>,
    pub to_chain_id: u64,
    pub to_contract: Vec<u8>,
    pub method: String,
    pub args: Vec<u8>,
}

impl MakeTxParam {
    pub fn serialization(&self, sink: &mut ZeroCopySink) {
        sink.write_var_bytes(&self.tx_hash);
        sink.write_var_bytes(&self.cross_chain_id);
        sink.write_var_bytes(&self.from_contract);
        sink.write_u64(self.to_chain_id);
        sink.write_var_bytes(&self.to_contract);
        sink.write_string(&self.method);
        sink.write_var_bytes(&self.args);
    }

    pub fn deserialization(source: &mut ZeroCopySource<'_>) -> RelayerResult<Self> {
        Ok(Self {
            tx_hash: source.next_var_bytes()?,
            cross_chain_id: source.next_var_bytes()?,
            from_contract: source.next_var_bytes()?,
            to_chain_id: source.next_u64()?,
            to_contract: source.next_var_bytes()?,
            method: source.next_string()?,
            args: source.next_var_bytes()?,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> RelayerResult<Self> {
        Self::deserialization(&mut ZeroCopySource::new(bytes))
    }
}

/// The value stored under a hub cross-states Merkle leaf: the hub tx hash,
/// the originating chain and the embedded transfer request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToMerkleValue {
    pub tx_hash: Vec<u8>,
    pub from_chain_id: u64,
    pub make_tx_param: MakeTxParam,
}

impl ToMerkleValue {
    pub fn serialization(&self, sink: &mut ZeroCopySink) {
        sink.write_var_bytes(&self.tx_hash);
        sink.write_u64(self.from_chain_id);
        self.make_tx_param.serialization(sink);
    }

    pub fn deserialization(source: &mut ZeroCopySource<'_>) -> RelayerResult<Self> {
        Ok(Self {
            tx_hash: source.next_var_bytes()?,
            from_chain_id: source.next_u64()?,
            make_tx_param: MakeTxParam::deserialization(source)?,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> RelayerResult<Self> {
        Self::deserialization(&mut ZeroCopySource::new(bytes))
    }
}

/// Extracts the leaf value from a cross-states audit path. The remainder of
/// the path (sibling hashes) is only consumed by the destination contract.
pub fn parse_audit_path_value(audit_path: &[u8]) -> RelayerResult<Vec<u8>> {
    let mut source = ZeroCopySource::new(audit_path);
    source.next_var_bytes()
}

/// Hex form (no 0x prefix) of a big integer, matching the textual tx-index
/// representation the hub storage layout expects.
pub fn encode_big_int(v: U256) -> String {
    format!("{v:x}")
}

fn hex_to_h256(s: &str) -> RelayerResult<[u8; 32]> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let padded = if s.len() % 2 == 1 {
        format!("0{s}")
    } else {
        s.to_string()
    };
    let bytes = hex::decode(&padded)
        .map_err(|e| RelayerError::SerializationError(format!("invalid hex {s}: {e}")))?;
    if bytes.len() > 32 {
        return Err(RelayerError::SerializationError(format!(
            "hex value {s} longer than 32 bytes"
        )));
    }
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(out)
}

/// Storage slot of `mapping(key => ...)` data in the side chain cross-chain
/// data contract: keccak256 of the 32-byte padded key followed by the 32-byte
/// padded slot position.
pub fn mapping_key_at(key: &str, position: &str) -> RelayerResult<[u8; 32]> {
    let p1 = hex_to_h256(key)?;
    let p2 = hex_to_h256(position)?;
    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(&p1);
    data.extend_from_slice(&p2);
    Ok(keccak256(&data))
}

/// Normalizes a 65-byte hub signature to the recovery-id convention the side
/// chain contracts verify against.
pub fn convert_sig_to_eth_compatible(sig: &[u8]) -> RelayerResult<Vec<u8>> {
    if sig.len() != 65 {
        return Err(RelayerError::SerializationError(format!(
            "signature length {} != 65",
            sig.len()
        )));
    }
    let mut out = sig.to_vec();
    if out[64] < 27 {
        out[64] += 27;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn sample_transfer() -> CrossTransfer {
        CrossTransfer {
            tx_index: "1a2b3c".to_string(),
            tx_id: vec![0xde, 0xad, 0xbe, 0xef],
            value: vec![1, 2, 3, 4, 5, 6, 7, 8, 9],
            to_chain: 2,
            height: 12_345_678,
        }
    }

    #[test]
    fn test_cross_transfer_round_trip() {
        let transfer = sample_transfer();
        let bytes = transfer.to_bytes();
        let decoded = CrossTransfer::from_bytes(&bytes).unwrap();
        assert_eq!(transfer, decoded);
    }

    #[test]
    fn test_cross_transfer_round_trip_empty_fields() {
        let transfer = CrossTransfer {
            tx_index: String::new(),
            tx_id: vec![],
            value: vec![],
            to_chain: 0,
            height: 0,
        };
        let decoded = CrossTransfer::from_bytes(&transfer.to_bytes()).unwrap();
        assert_eq!(transfer, decoded);
    }

    #[test]
    fn test_cross_transfer_truncated_input() {
        let mut bytes = sample_transfer().to_bytes();
        bytes.truncate(bytes.len() - 4);
        assert!(CrossTransfer::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_var_uint_boundaries() {
        for v in [0u64, 0xFC, 0xFD, 0xFFFF, 0x1_0000, 0xFFFF_FFFF, u64::MAX] {
            let mut sink = ZeroCopySink::new();
            sink.write_var_uint(v);
            let mut source = ZeroCopySource::new(sink.bytes());
            assert_eq!(source.next_var_uint().unwrap(), v);
            assert_eq!(source.remaining(), 0);
        }
    }

    #[test]
    fn test_make_tx_param_round_trip() {
        let param = MakeTxParam {
            tx_hash: vec![9; 32],
            cross_chain_id: vec![0, 1, 2],
            from_contract: vec![7; 20],
            to_chain_id: 79,
            to_contract: vec![8; 20],
            method: "unlock".to_string(),
            args: vec![0xAB; 40],
        };
        let mut sink = ZeroCopySink::new();
        param.serialization(&mut sink);
        let decoded = MakeTxParam::from_bytes(sink.bytes()).unwrap();
        assert_eq!(param, decoded);
    }

    #[test]
    fn test_to_merkle_value_round_trip() {
        let value = ToMerkleValue {
            tx_hash: vec![3; 32],
            from_chain_id: 6,
            make_tx_param: MakeTxParam {
                tx_hash: vec![1; 32],
                cross_chain_id: vec![42],
                from_contract: vec![2; 20],
                to_chain_id: 2,
                to_contract: vec![5; 20],
                method: "unlock".to_string(),
                args: vec![],
            },
        };
        let mut sink = ZeroCopySink::new();
        value.serialization(&mut sink);
        let decoded = ToMerkleValue::from_bytes(sink.bytes()).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn test_parse_audit_path_value() {
        let mut sink = ZeroCopySink::new();
        sink.write_var_bytes(b"leaf-value");
        // trailing sibling hashes are ignored by the parser
        sink.write_u8(1);
        let mut raw = sink.into_bytes();
        raw.extend_from_slice(&[0u8; 32]);
        assert_eq!(parse_audit_path_value(&raw).unwrap(), b"leaf-value");
    }

    #[test]
    fn test_mapping_key_at_pads_inputs() {
        let key = mapping_key_at("1a2b", "01").unwrap();
        let mut expect = [0u8; 64];
        expect[30] = 0x1a;
        expect[31] = 0x2b;
        expect[63] = 0x01;
        assert_eq!(key, keccak256(expect));
    }

    #[test]
    fn test_encode_big_int() {
        assert_eq!(encode_big_int(U256::zero()), "0");
        assert_eq!(encode_big_int(U256::from(0x1a2b3c)), "1a2b3c");
    }

    #[test]
    fn test_convert_sig_to_eth_compatible() {
        let mut sig = [0u8; 65];
        sig[64] = 1;
        let converted = convert_sig_to_eth_compatible(&sig).unwrap();
        assert_eq!(converted[64], 28);

        let already = convert_sig_to_eth_compatible(&hex!(
            "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
            "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"
            "1b"
        ))
        .unwrap();
        assert_eq!(already[64], 0x1b);

        assert!(convert_sig_to_eth_compatible(&[0u8; 64]).is_err());
    }
}

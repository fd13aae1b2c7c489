// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use alloy_consensus::transaction::SignerRecoverable;
use alloy_consensus::TxEnvelope;
use alloy_eips::eip2718::Decodable2718;
use alloy_primitives::Address;
use rpc_core::jsonrpc::RpcCall;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("raw transaction param is missing or not a string")]
    MissingRawTx,
    #[error("raw transaction is not valid hex")]
    InvalidHex,
    #[error("raw transaction does not decode: {reason}")]
    Decode { reason: String },
    #[error("cannot recover signer from raw transaction")]
    Recovery,
}

/// Recovers the `from` address of a raw signed transaction carried as the
/// first param of a submission call. Used only as a rate-limit key; the
/// payload itself is forwarded untouched.
pub fn recover_sender(call: &RpcCall) -> Result<Address, SenderError> {
    let raw = call
        .param(0)
        .and_then(|value| value.as_str())
        .ok_or(SenderError::MissingRawTx)?;
    let bytes = alloy_primitives::hex::decode(raw).map_err(|_| SenderError::InvalidHex)?;
    let envelope = TxEnvelope::decode_2718(&mut bytes.as_slice()).map_err(|err| {
        SenderError::Decode {
            reason: err.to_string(),
        }
    })?;
    envelope.recover_signer().map_err(|_| SenderError::Recovery)
}

#[cfg(test)]
mod tests {
    use super::{recover_sender, SenderError};
    use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
    use alloy_eips::eip2718::Encodable2718;
    use alloy_primitives::{hex, Address, TxKind, U256};
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;
    use rpc_core::jsonrpc::{CallId, RpcCall};
    use serde_json::json;

    fn signed_raw_tx(signer: &PrivateKeySigner) -> String {
        let tx = TxLegacy {
            chain_id: Some(1),
            nonce: 0,
            gas_price: 1_000_000_000,
            gas_limit: 21_000,
            to: TxKind::Call(Address::from_slice(&[0x22; 20])),
            value: U256::from(1),
            input: Default::default(),
        };
        let signature = signer
            .sign_hash_sync(&tx.signature_hash())
            .expect("sign tx");
        let envelope: TxEnvelope = tx.into_signed(signature).into();
        hex::encode_prefixed(envelope.encoded_2718())
    }

    #[test]
    fn recovers_the_signing_address() {
        let signer = PrivateKeySigner::random();
        let call = RpcCall::new(
            CallId::Number(1),
            "eth_sendRawTransaction",
            Some(json!([signed_raw_tx(&signer)])),
        );
        let recovered = recover_sender(&call).expect("recover sender");
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn rejects_missing_and_malformed_payloads() {
        let no_params = RpcCall::new(CallId::Number(1), "eth_sendRawTransaction", None);
        assert!(matches!(
            recover_sender(&no_params),
            Err(SenderError::MissingRawTx)
        ));

        let bad_hex = RpcCall::new(
            CallId::Number(1),
            "eth_sendRawTransaction",
            Some(json!(["0xzz"])),
        );
        assert!(matches!(
            recover_sender(&bad_hex),
            Err(SenderError::InvalidHex)
        ));

        let not_a_tx = RpcCall::new(
            CallId::Number(1),
            "eth_sendRawTransaction",
            Some(json!(["0x00"])),
        );
        assert!(matches!(
            recover_sender(&not_a_tx),
            Err(SenderError::Decode { .. })
        ));
    }
}

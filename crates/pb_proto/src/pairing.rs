//! Pairing-code HTTP surface types.
//!
//! Pairing runs out-of-band to the event channel: a short numeric code is
//! stored on the relay against a bundle that carries the identity keypair.
//! Pairing IS identity transfer — the private key is in the bundle on
//! purpose, protected only by the code's entropy and server-side expiry.

use serde::{Deserialize, Serialize};

/// The bundle bound to a pairing code on the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingData {
    #[serde(rename = "wsUrl")]
    pub ws_url: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "deviceName")]
    pub device_name: String,
    pub identity_public_key_hex: String,
    pub identity_private_key_hex: String,
}

/// POST /api/pairing/store body.
#[derive(Debug, Serialize, Deserialize)]
pub struct PairingStoreRequest {
    pub code: String,
    pub data: PairingData,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PairingStoreResponse {
    pub ok: bool,
    #[serde(rename = "expiresAt")]
    pub expires_at: i64,
}

/// GET /api/pairing/lookup/{code} body.
#[derive(Debug, Serialize, Deserialize)]
pub struct PairingLookupResponse {
    pub success: bool,
    pub data: Option<PairingData>,
}

/// Random 6-digit base-10 pairing code, zero-padded.
pub fn generate_code() -> String {
    use rand::Rng;
    format!("{:06}", rand::rngs::OsRng.gen_range(0..1_000_000u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_six_digits() {
        for _ in 0..100 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn data_uses_relay_field_names() {
        let data = PairingData {
            ws_url: "wss://relay.example/ws".into(),
            user_id: "aa".into(),
            device_id: "dd".into(),
            device_name: "Laptop".into(),
            identity_public_key_hex: "aa".into(),
            identity_private_key_hex: "bb".into(),
        };
        let json = serde_json::to_string(&data).unwrap();
        assert!(json.contains("\"wsUrl\""));
        assert!(json.contains("\"userId\""));
        assert!(json.contains("\"deviceName\""));
        assert!(json.contains("\"identity_private_key_hex\""));
    }
}

// Copyright 2020 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use ruma::{CanonicalJsonValue, DeviceKeyAlgorithm, DeviceKeyId, UserId};
use serde_json::Value;
use vodozemac::{Ed25519PublicKey, Ed25519Signature};

use crate::error::SignatureError;

/// Turn a JSON object into its canonical string form, dropping the fields
/// that aren't covered by signatures.
pub(crate) fn canonical_json_for_signing(json: &Value) -> Result<String, SignatureError> {
    let mut json = json.clone();
    let json_object = json.as_object_mut().ok_or(SignatureError::NotAnObject)?;
    json_object.remove("unsigned");
    json_object.remove("signatures");

    let canonical_json: CanonicalJsonValue =
        json.try_into().map_err(|_| SignatureError::NotAnObject)?;

    Ok(canonical_json.to_string())
}

/// Verify a signed JSON object.
///
/// The object must have a signatures key associated with an object of the
/// form `user_id: {key_id: signature}`.
///
/// Returns Ok if the signature was successfully verified, otherwise an
/// SignatureError.
///
/// # Arguments
///
/// * `user_id` - The user who signed the JSON object.
///
/// * `key_id` - The id of the key that signed the JSON object.
///
/// * `signing_key` - The public ed25519 key which was used to sign the JSON
///   object.
///
/// * `json` - The JSON object that should be verified.
pub(crate) fn verify_json(
    user_id: &UserId,
    key_id: &DeviceKeyId,
    signing_key: &Ed25519PublicKey,
    json: &Value,
) -> Result<(), SignatureError> {
    if key_id.algorithm() != DeviceKeyAlgorithm::Ed25519 {
        return Err(SignatureError::UnsupportedAlgorithm);
    }

    let signature = json
        .get("signatures")
        .and_then(|s| s.get(user_id.as_str()))
        .and_then(|s| s.get(key_id.as_str()))
        .and_then(Value::as_str)
        .ok_or(SignatureError::NoSignatureFound)?;
    let signature =
        Ed25519Signature::from_base64(signature).map_err(|_| SignatureError::InvalidSignature)?;

    let canonical_json = canonical_json_for_signing(json)?;

    Ok(signing_key.verify(canonical_json.as_bytes(), &signature)?)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::{device_id, user_id, DeviceKeyAlgorithm, DeviceKeyId};
    use serde_json::json;
    use vodozemac::Ed25519PublicKey;

    use super::verify_json;
    use crate::error::SignatureError;

    fn device_keys() -> serde_json::Value {
        json!({
            "device_id": "GBEWHQOYGS",
            "algorithms": [
                "m.olm.v1.curve25519-aes-sha2",
                "m.megolm.v1.aes-sha2"
            ],
            "keys": {
                "curve25519:GBEWHQOYGS": "F8QhZ0Z1rjtWrQOblMDgZtEX5x1UrG7sZ2Kk3xliNAU",
                "ed25519:GBEWHQOYGS": "n469gw7zm+KW+JsFIJKnFVvCKU14HwQyocggcCIQgZY"
            },
            "signatures": {
                "@example:localhost": {
                    "ed25519:GBEWHQOYGS": "OlF2REsqjYdAfr04ONx8VS/5cB7KjrWYRlLF4eUm2foAiQL/RAfsjsa2JXZeoOHh6vEualZHbWlod49OewVqBg"
                }
            },
            "unsigned": {
                "device_display_name": "Weechat-Matrix-rs"
            },
            "user_id": "@example:localhost"
        })
    }

    #[test]
    fn test_signature_verification() {
        let signing_key =
            Ed25519PublicKey::from_base64("n469gw7zm+KW+JsFIJKnFVvCKU14HwQyocggcCIQgZY").unwrap();
        let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, device_id!("GBEWHQOYGS"));

        verify_json(user_id!("@example:localhost"), &key_id, &signing_key, &device_keys())
            .expect("Can't verify device keys");
    }

    #[test]
    fn test_tampered_object_is_rejected() {
        let signing_key =
            Ed25519PublicKey::from_base64("n469gw7zm+KW+JsFIJKnFVvCKU14HwQyocggcCIQgZY").unwrap();
        let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, device_id!("GBEWHQOYGS"));

        let mut json = device_keys();
        json["algorithms"] = json!(["m.olm.v1.curve25519-aes-sha2"]);

        assert_matches!(
            verify_json(user_id!("@example:localhost"), &key_id, &signing_key, &json),
            Err(SignatureError::VerificationError(_))
        );

        assert_matches!(
            verify_json(user_id!("@other:localhost"), &key_id, &signing_key, &device_keys()),
            Err(SignatureError::NoSignatureFound)
        );
    }
}

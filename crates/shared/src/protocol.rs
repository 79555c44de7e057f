use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::domain::{Aci, E164, Pni, PreKeyId, RegistrationId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccountAttributes {
    pub registration_id: RegistrationId,
    pub pni_registration_id: RegistrationId,
    pub fetches_messages: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_lock: Option<String>,
    pub discoverable_by_phone_number: bool,
}

/// Body of the account verification request. Exactly one of `session_id` or
/// `recovery_password` proves control of the number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VerifyAccountRequest {
    pub number: E164,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_password: Option<String>,
    pub account_attributes: AccountAttributes,
    pub skip_device_transfer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VerifyAccountResponse {
    #[serde(rename = "uuid")]
    pub aci: Aci,
    pub pni: Pni,
    pub number: E164,
    #[serde(default)]
    pub storage_capable: bool,
    #[serde(default)]
    pub reregistration: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyEntity {
    pub key_id: PreKeyId,
    pub public_key: String,
    pub signature: String,
}

impl SignedPreKeyEntity {
    pub fn new(key_id: PreKeyId, public_key: &[u8], signature: &[u8]) -> Self {
        Self {
            key_id,
            public_key: STANDARD.encode(public_key),
            signature: STANDARD.encode(signature),
        }
    }
}

/// Upload of one namespace's signed prekey and last-resort KEM prekey.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyUploadRequest {
    pub identity_key: String,
    pub signed_pre_key: SignedPreKeyEntity,
    pub pq_last_resort_pre_key: SignedPreKeyEntity,
}

impl PreKeyUploadRequest {
    pub fn new(
        identity_public_key: &[u8],
        signed_pre_key: SignedPreKeyEntity,
        pq_last_resort_pre_key: SignedPreKeyEntity,
    ) -> Self {
        Self {
            identity_key: STANDARD.encode(identity_public_key),
            signed_pre_key,
            pq_last_resort_pre_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn verify_response_reads_server_field_names() {
        let aci = Uuid::new_v4();
        let pni = Uuid::new_v4();
        let body = serde_json::json!({
            "uuid": aci,
            "pni": pni,
            "number": "+14155550123",
            "storageCapable": true,
        });
        let response: VerifyAccountResponse = serde_json::from_value(body).expect("decode");
        assert_eq!(response.aci, Aci(aci));
        assert_eq!(response.pni, Pni(pni));
        assert!(response.storage_capable);
        assert!(!response.reregistration);
    }

    #[test]
    fn verify_request_omits_absent_credentials() {
        let request = VerifyAccountRequest {
            number: E164::parse("+14155550123").expect("e164"),
            session_id: Some("session".into()),
            recovery_password: None,
            account_attributes: AccountAttributes {
                registration_id: RegistrationId(7),
                pni_registration_id: RegistrationId(8),
                fetches_messages: false,
                registration_lock: None,
                discoverable_by_phone_number: false,
            },
            skip_device_transfer: true,
            push_token: None,
        };
        let value = serde_json::to_value(&request).expect("encode");
        assert!(value.get("recoveryPassword").is_none());
        assert_eq!(value["sessionId"], "session");
        assert_eq!(value["accountAttributes"]["pniRegistrationId"], 8);
    }
}

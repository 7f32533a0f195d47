use authkit_interactive::cacao::{format_message, CacaoPayload, ED25519_SIGNATURE_TYPE};
use authkit_interactive::messages::RpcRequest;
use authkit_interactive::{
    AuthErrorCode, AuthPayload, AuthRequestParams, Cacao, CacaoSignature, Ed25519MessageVerifier,
    MessageVerifier, ProtocolMethod, RequestParams, Requester, RpcPayload,
};
use authkit_lib::config::AppMetadata;
use authkit_lib::crypto::KeyManagementService;
use authkit_lib::{Account, RpcId};
use ed25519_dalek::{Signer, SigningKey};
use proptest::prelude::*;
use rand::rngs::OsRng;
use serde_json::json;

fn auth_request_params() -> AuthRequestParams {
    let kms = KeyManagementService::new();
    AuthRequestParams {
        requester: Requester {
            public_key: kms.create_key_pair().unwrap(),
            metadata: AppMetadata::new("App", "https://app.example.com"),
        },
        payload_params: AuthPayload::new(
            RequestParams::new("app.example.com", "ed25519:1", "abc", "https://app.example.com")
                .with_statement("hello"),
        ),
    }
}

#[test]
fn test_auth_request_wire_shape() {
    let params = auth_request_params();
    let body = RpcPayload::Request(RpcRequest::new(
        RpcId(1),
        ProtocolMethod::AuthRequest,
        serde_json::to_value(&params).unwrap(),
    ));
    let value = serde_json::to_value(&body).unwrap();

    assert_eq!(value["jsonrpc"], "2.0");
    assert_eq!(value["method"], "wc_authRequest");
    assert_eq!(value["params"]["payloadParams"]["type"], "eip4361");
    assert_eq!(value["params"]["payloadParams"]["chainId"], "ed25519:1");
    assert_eq!(
        value["params"]["requester"]["publicKey"],
        params.requester.public_key.to_hex()
    );
    assert!(value["params"]["payloadParams"].get("exp").is_none());

    let decoded: AuthRequestParams = serde_json::from_value(value["params"].clone()).unwrap();
    assert_eq!(decoded, params);
}

#[test]
fn test_error_response_wire_shape() {
    let value = serde_json::to_value(RpcPayload::error(
        RpcId(9),
        AuthErrorCode::UserRejected.to_error(),
    ))
    .unwrap();
    assert_eq!(
        value,
        json!({
            "id": 9,
            "jsonrpc": "2.0",
            "error": { "code": 14001, "message": "Auth request rejected by user" }
        })
    );
}

#[tokio::test]
async fn test_cacao_signed_with_dalek_key() {
    let key = SigningKey::generate(&mut OsRng);
    let account =
        Account::parse(&format!("ed25519:1:{}", hex::encode(key.verifying_key().as_bytes())))
            .unwrap();
    let params = auth_request_params();
    let payload = CacaoPayload::new(&params.payload_params, &account);
    let message = format_message(&payload, &account);
    let signature = CacaoSignature::new(
        ED25519_SIGNATURE_TYPE,
        hex::encode(key.sign(message.as_bytes()).to_bytes()),
    );

    let cacao = Cacao::new(payload, signature.clone());
    let value = serde_json::to_value(&cacao).unwrap();
    assert_eq!(value["h"]["t"], "eip4361");
    assert_eq!(value["p"]["iss"], account.did_pkh());
    assert_eq!(value["s"]["t"], "ed25519");

    assert!(Ed25519MessageVerifier
        .verify(&signature, &message, &account)
        .await
        .unwrap());
}

proptest! {
    #[test]
    fn prop_rpc_payload_kind_survives_encoding(id in any::<u64>(), code in 1000i64..20000, ok in any::<bool>()) {
        let payload = if ok {
            RpcPayload::result(RpcId(id), json!({ "n": id }))
        } else {
            RpcPayload::error(RpcId(id), authkit_interactive::ProtocolError { code, message: "m".into() })
        };
        let encoded = serde_json::to_string(&payload).unwrap();
        let decoded: RpcPayload = serde_json::from_str(&encoded).unwrap();
        prop_assert_eq!(decoded.id(), RpcId(id));
        prop_assert_eq!(matches!(decoded, RpcPayload::Result(_)), ok);
    }

    #[test]
    fn prop_message_names_every_field(nonce in "[a-zA-Z0-9]{8,32}", domain in "[a-z]{3,10}\\.example\\.com") {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let account = Account::parse(&format!("ed25519:1:{}", hex::encode(key.verifying_key().as_bytes()))).unwrap();
        let payload = AuthPayload::new(RequestParams::new(domain.clone(), "ed25519:1", nonce.clone(), "https://x.example.com"));
        let message = format_message(&CacaoPayload::new(&payload, &account), &account);

        let expected_prefix = format!("{} wants you to sign in", domain);
        prop_assert!(message.starts_with(&expected_prefix));
        let nonce_line = format!("\nNonce: {}\n", nonce);
        prop_assert!(message.contains(&nonce_line));
        prop_assert!(message.contains(account.address()));
    }
}

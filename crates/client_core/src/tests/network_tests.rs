use super::*;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode as AxumStatus},
    routing::{post, put},
    Json, Router,
};
use shared::{
    domain::{Aci, Pni, PreKeyId, RegistrationId, E164},
    protocol::{AccountAttributes, SignedPreKeyEntity},
};
use std::{collections::HashMap, sync::Arc};
use tokio::{net::TcpListener, sync::Mutex};
use uuid::Uuid;

#[derive(Clone, Default)]
struct Recorded {
    authorization: Arc<Mutex<Vec<String>>>,
    identities: Arc<Mutex<Vec<String>>>,
}

async fn spawn_server(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn verify_request() -> VerifyAccountRequest {
    VerifyAccountRequest {
        number: E164::parse("+14155550123").expect("e164"),
        session_id: Some("session-1".into()),
        recovery_password: None,
        account_attributes: AccountAttributes {
            registration_id: RegistrationId(11),
            pni_registration_id: RegistrationId(12),
            fetches_messages: false,
            registration_lock: None,
            discoverable_by_phone_number: false,
        },
        skip_device_transfer: true,
        push_token: None,
    }
}

fn credentials() -> Credentials {
    Credentials {
        username: "+14155550123".into(),
        password: "hunter2".into(),
    }
}

fn upload() -> PreKeyUploadRequest {
    PreKeyUploadRequest::new(
        &[1; 32],
        SignedPreKeyEntity::new(PreKeyId(5), &[2; 32], &[3; 64]),
        SignedPreKeyEntity::new(PreKeyId(9), &[4; 32], &[5; 64]),
    )
}

#[tokio::test]
async fn verify_account_decodes_response_and_sends_basic_auth() {
    let recorded = Recorded::default();
    let aci = Uuid::new_v4();
    let pni = Uuid::new_v4();
    let app = Router::new()
        .route(
            "/v1/registration",
            post(
                move |State(recorded): State<Recorded>,
                      headers: HeaderMap,
                      Json(body): Json<VerifyAccountRequest>| async move {
                    if let Some(value) = headers.get("authorization") {
                        recorded
                            .authorization
                            .lock()
                            .await
                            .push(value.to_str().unwrap_or_default().to_string());
                    }
                    assert_eq!(body.session_id.as_deref(), Some("session-1"));
                    Json(serde_json::json!({
                        "uuid": aci,
                        "pni": pni,
                        "number": "+14155550123",
                        "reregistration": true,
                    }))
                },
            ),
        )
        .with_state(recorded.clone());
    let base = spawn_server(app).await;

    let api = HttpRegistrationApi::new(&base, Duration::from_secs(5)).expect("client");
    let verified = api
        .verify_account(&verify_request(), &credentials())
        .await
        .expect("verified");

    assert_eq!(verified.aci, Aci(aci));
    assert_eq!(verified.pni, Pni(pni));
    assert!(verified.reregistration);
    let auth = recorded.authorization.lock().await.clone();
    assert_eq!(auth.len(), 1);
    assert!(auth[0].starts_with("Basic "));
    assert!(!api.is_deprecated());
}

#[tokio::test]
async fn deprecated_status_marks_client_and_surfaces_typed_error() {
    let app = Router::new().route(
        "/v1/registration",
        post(|| async { AxumStatus::from_u16(499).expect("status") }),
    );
    let base = spawn_server(app).await;

    let api = HttpRegistrationApi::new(&base, Duration::from_secs(5)).expect("client");
    let err = api
        .verify_account(&verify_request(), &credentials())
        .await
        .expect_err("deprecated");
    assert!(matches!(err, NetworkError::Deprecated));
    assert_eq!(err.code(), Some(ErrorCode::Deprecated));
    assert!(api.is_deprecated());
}

#[tokio::test]
async fn rejection_carries_server_error_body() {
    let app = Router::new().route(
        "/v1/registration",
        post(|| async {
            (
                AxumStatus::LOCKED,
                Json(serde_json::json!({
                    "code": "registration_locked",
                    "message": "pin required",
                })),
            )
        }),
    );
    let base = spawn_server(app).await;

    let api = HttpRegistrationApi::new(&base, Duration::from_secs(5)).expect("client");
    let err = api
        .verify_account(&verify_request(), &credentials())
        .await
        .expect_err("locked");
    match &err {
        NetworkError::Rejected { status, error, .. } => {
            assert_eq!(*status, 423);
            assert_eq!(error.message, "pin required");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.code(), Some(ErrorCode::RegistrationLocked));
}

#[tokio::test]
async fn rejection_without_json_body_maps_status_code() {
    let app = Router::new().route(
        "/v1/registration",
        post(|| async { (AxumStatus::TOO_MANY_REQUESTS, "slow down") }),
    );
    let base = spawn_server(app).await;

    let api = HttpRegistrationApi::new(&base, Duration::from_secs(5)).expect("client");
    let err = api
        .verify_account(&verify_request(), &credentials())
        .await
        .expect_err("rate limited");
    assert_eq!(err.code(), Some(ErrorCode::RateLimited));
    assert!(err.to_string().contains("slow down"));
}

#[tokio::test]
async fn set_pre_keys_targets_namespace_query() {
    let recorded = Recorded::default();
    let app = Router::new()
        .route(
            "/v2/keys",
            put(
                |State(recorded): State<Recorded>,
                 Query(query): Query<HashMap<String, String>>,
                 Json(body): Json<PreKeyUploadRequest>| async move {
                    assert_eq!(body.signed_pre_key.key_id, PreKeyId(5));
                    recorded
                        .identities
                        .lock()
                        .await
                        .push(query.get("identity").cloned().unwrap_or_default());
                    AxumStatus::NO_CONTENT
                },
            ),
        )
        .with_state(recorded.clone());
    let base = spawn_server(app).await;

    let api = HttpRegistrationApi::new(&base, Duration::from_secs(5)).expect("client");
    api.set_pre_keys(ServiceIdKind::Pni, &upload(), &credentials())
        .await
        .expect("upload");
    api.set_pre_keys(ServiceIdKind::Aci, &upload(), &credentials())
        .await
        .expect("upload");

    assert_eq!(
        recorded.identities.lock().await.clone(),
        vec!["pni".to_string(), "aci".to_string()]
    );
}

#[tokio::test]
async fn unreachable_server_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let api = HttpRegistrationApi::new(&format!("http://{addr}"), Duration::from_secs(2))
        .expect("client");
    let err = api
        .verify_account(&verify_request(), &credentials())
        .await
        .expect_err("nothing listening");
    assert!(matches!(err, NetworkError::Transport { .. }));
    assert_eq!(err.code(), None);
}

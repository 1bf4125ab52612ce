//! Usher pipeline over the real HTTP registrar client: targets fetched from
//! a mock registrar, artifacts downloaded, verified, and installed.

mod common;

use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use rsa::pkcs8::{EncodePublicKey, LineEnding};
use serde_json::json;
use sha2::Digest;
use tokio::sync::{Mutex, RwLock};

use acme_agent::domain::models::{RegistrarConfig, RouteMap};
use acme_agent::domain::ports::{EventSink, Identity, PlatformProbe, RegistrarApi};
use acme_agent::infrastructure::crypto::sign_detached;
use acme_agent::infrastructure::registrar::HttpRegistrarClient;
use acme_agent::services::config_controller::ConfigModule;
use acme_agent::services::event_router::EventRouter;
use acme_agent::services::registration::{RegistrationData, SharedRegistration};
use acme_agent::services::usher::UsherConfigModule;

use common::{identity_handle, MemoryIdentity, MemoryPlatform, RecordingSink};

fn build_archive() -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("agent.deb", options).unwrap();
        writer.write_all(b"deb package payload").unwrap();
        writer.finish().unwrap();
    }
    cursor.into_inner()
}

#[tokio::test]
async fn test_pipeline_end_to_end_over_http() {
    let mut server = mockito::Server::new_async().await;

    let archive = build_archive();
    let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let authority = key
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap();
    let signature = sign_detached(&key, &archive);
    let hash = hex::encode(sha2::Sha256::digest(&archive));

    let targets = json!({
        "status": 0,
        "data": {"UsherInstallers": [{
            "identifier": "AcmeTool",
            "version": "2.0.0",
            "priority": 1,
            "download_url": format!("{}/artifacts/AcmeTool.zip", server.url()),
            "signature_url": format!("{}/artifacts/AcmeTool.sig", server.url()),
            "file_hash": hash,
        }]}
    });

    server
        .mock("POST", "/register/get_installer_targets")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(targets.to_string())
        .create_async()
        .await;
    server
        .mock("GET", "/artifacts/AcmeTool.zip")
        .with_status(200)
        .with_body(archive.clone())
        .create_async()
        .await;
    server
        .mock("GET", "/artifacts/AcmeTool.sig")
        .with_status(200)
        .with_body(signature.clone())
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let identity = identity_handle(MemoryIdentity::signed("device"));
    let registrar: Arc<dyn RegistrarApi> = Arc::new(
        HttpRegistrarClient::new(
            &RegistrarConfig {
                address: server.url(),
                timeout_secs: 10,
            },
            identity,
        )
        .unwrap(),
    );

    let sink = Arc::new(RecordingSink::default());
    let router = Arc::new(EventRouter::new(
        Arc::clone(&sink) as Arc<dyn EventSink>,
        RouteMap::default(),
        dir.path().join("karl_queue.data"),
    ));
    let platform = Arc::new(MemoryPlatform::default());
    platform
        .installed
        .lock()
        .unwrap()
        .insert("AcmeTool".to_string(), "1.0.0".to_string());

    let registration: SharedRegistration = Arc::new(RwLock::new(Some(RegistrationData {
        uuid: Some("device".to_string()),
        renewal_date: None,
        certificate: None,
        config_signing_authority: Some(authority),
    })));

    let module = UsherConfigModule::new(
        registrar,
        Arc::clone(&platform) as Arc<dyn PlatformProbe>,
        router,
        registration,
        dir.path().join("installers"),
        dir.path().join("staging"),
        dir.path().join("usher.json"),
        false,
        1,
    );

    module.run().await.unwrap();

    // Content swapped into the load directory and the platform installer
    // invoked exactly once.
    assert!(dir.path().join("installers/AcmeTool/agent.deb").exists());
    assert_eq!(platform.installs.load(Ordering::SeqCst), 1);
    assert_eq!(
        platform.installed.lock().unwrap().get("AcmeTool"),
        Some(&"2.0.0".to_string())
    );

    // No failure events; state persisted for the next cadence computation.
    assert!(sink.events.lock().unwrap().is_empty());
    assert!(dir.path().join("usher.json").exists());
    assert!(!module.should_run_immediately().await);
}

#[tokio::test]
async fn test_throttled_registrar_defers_usher() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/register/get_installer_targets")
        .with_status(429)
        .with_header("retry-after", "300")
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let identity: Arc<Mutex<Box<dyn Identity>>> = identity_handle(MemoryIdentity::unsigned());
    let registrar: Arc<dyn RegistrarApi> = Arc::new(
        HttpRegistrarClient::new(
            &RegistrarConfig {
                address: server.url(),
                timeout_secs: 10,
            },
            identity,
        )
        .unwrap(),
    );

    let sink = Arc::new(RecordingSink::default());
    let router = Arc::new(EventRouter::new(
        Arc::clone(&sink) as Arc<dyn EventSink>,
        RouteMap::default(),
        dir.path().join("karl_queue.data"),
    ));

    let module = UsherConfigModule::new(
        registrar,
        Arc::new(MemoryPlatform::default()),
        router,
        Arc::new(RwLock::new(None)),
        dir.path().join("installers"),
        dir.path().join("staging"),
        dir.path().join("usher.json"),
        false,
        1,
    );

    let outcome = module.run().await;
    assert!(matches!(
        outcome,
        Err(acme_agent::services::config_controller::ConfigModuleError::Throttled { until: Some(_) })
    ));
}

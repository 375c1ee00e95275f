//! Running instances straight from a configuration file

mod common;

use std::fs;
use std::sync::Arc;

use tlcp_channel::config::{load_config, InstanceType};
use tlcp_channel::instance::{InstanceManager, Status};
use tlcp_channel::security::{KeyStoreManager, RootCertManager};

use common::{echo_backend, pki, tls_roundtrip};

#[tokio::test]
async fn test_config_file_drives_manager() {
    let pki = pki();
    let backend = echo_backend().await;
    let json = format!(
        r#"{{
            "log": {{ "level": "debug" }},
            "keystores": [
                {{ "name": "edge", "type": "file",
                   "params": {{ "sign-cert": "{cert}", "sign-key": "{key}" }} }}
            ],
            "root-certs": [ {{ "name": "trusted", "path": "{ca}" }} ],
            "instances": [
                {{ "name": "inbound", "type": "server", "protocol": "tls",
                   "listen": "127.0.0.1:0", "target": "{backend}",
                   "tls": {{ "keystore": {{ "type": "named", "params": {{ "name": "edge" }} }} }} }},
                {{ "name": "standby", "type": "client", "enabled": false,
                   "listen": "127.0.0.1:0", "target": "127.0.0.1:9", "server-ca": ["trusted"] }}
            ]
        }}"#,
        cert = pki.cert_path.display(),
        key = pki.key_path.display(),
        ca = pki.ca_path.display(),
        backend = backend,
    );
    let path = pki.dir.path().join("tlcpchan.json");
    fs::write(&path, json).unwrap();

    let config = load_config(&path).unwrap();
    assert_eq!(config.instances[1].instance_type, InstanceType::Client);

    let keystores = Arc::new(KeyStoreManager::new());
    let rootcerts = Arc::new(RootCertManager::new());
    for keystore in &config.keystores {
        keystores.load(keystore).unwrap();
    }
    for root in &config.root_certs {
        assert_eq!(rootcerts.load_file(root.name.clone(), &root.path).unwrap(), 1);
    }
    assert_eq!(keystores.names(), vec!["edge"]);

    let manager = InstanceManager::new(keystores, rootcerts);
    for instance in &config.instances {
        manager.create(instance).unwrap();
    }
    assert!(manager.start_all().await.is_empty());

    let inbound = manager.get("inbound").unwrap();
    assert_eq!(inbound.status(), Status::Running);
    assert_eq!(manager.get("standby").unwrap().status(), Status::Created);

    let addr = inbound.local_addr().unwrap();
    assert_eq!(tls_roundtrip(addr, &pki.ca, b"from file").await, b"from file");

    manager.stop_all().await;
    assert_eq!(inbound.status(), Status::Stopped);
    assert_eq!(inbound.stats().total_connections, 1);
}

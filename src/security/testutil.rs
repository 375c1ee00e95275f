//! Throwaway certificates for unit tests

use std::fs;
use std::path::Path;

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName};
use openssl::x509::{X509Builder, X509Name, X509NameBuilder, X509};

use super::keystore::{CertifiedKey, KeyStore};

fn ec_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn builder(cn: &str, serial: u32, key: &PKey<Private>) -> (X509Builder, X509Name) {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder
        .set_serial_number(&BigNum::from_u32(serial).unwrap().to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_pubkey(key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();
    (builder, name)
}

/// Self-signed CA
pub fn generate_ca(cn: &str) -> (X509, PKey<Private>) {
    let key = ec_key();
    let (mut builder, name) = builder(cn, 1, &key);
    builder.set_issuer_name(&name).unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    builder
        .append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build().unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

/// Leaf for `localhost` / `127.0.0.1` signed by `ca`
pub fn generate_leaf(cn: &str, ca: &X509, ca_key: &PKey<Private>) -> (X509, PKey<Private>) {
    let key = ec_key();
    let (mut builder, _) = builder(cn, 2, &key);
    builder.set_issuer_name(ca.subject_name()).unwrap();
    builder
        .append_extension(KeyUsage::new().critical().digital_signature().key_agreement().build().unwrap())
        .unwrap();
    builder
        .append_extension(ExtendedKeyUsage::new().server_auth().client_auth().build().unwrap())
        .unwrap();
    let san = SubjectAlternativeName::new()
        .dns("localhost")
        .ip("127.0.0.1")
        .build(&builder.x509v3_context(Some(ca), None))
        .unwrap();
    builder.append_extension(san).unwrap();
    builder.sign(ca_key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

/// Write `<stem>.crt` and `<stem>.key`, returning their paths
pub fn write_pem_pair(dir: &Path, stem: &str, cert: &X509, key: &PKey<Private>) -> (String, String) {
    let cert_path = dir.join(format!("{}.crt", stem));
    let key_path = dir.join(format!("{}.key", stem));
    fs::write(&cert_path, cert.to_pem().unwrap()).unwrap();
    fs::write(&key_path, key.private_key_to_pem_pkcs8().unwrap()).unwrap();
    (
        cert_path.to_string_lossy().into_owned(),
        key_path.to_string_lossy().into_owned(),
    )
}

/// CA plus TLS keystore for `localhost`
pub fn tls_keystore(name: &str) -> (X509, KeyStore) {
    let (ca, ca_key) = generate_ca("tlcpchan test root");
    let (leaf, key) = generate_leaf("localhost", &ca, &ca_key);
    let keystore = KeyStore::tls(name, CertifiedKey::new(vec![leaf], key).unwrap());
    (ca, keystore)
}

/// CA plus TLCP keystore (sign and enc pairs) for `localhost`
pub fn tlcp_keystore(name: &str) -> (X509, KeyStore) {
    let (ca, ca_key) = generate_ca("tlcpchan test gm root");
    let (sign, sign_key) = generate_leaf("localhost", &ca, &ca_key);
    let (enc, enc_key) = generate_leaf("localhost", &ca, &ca_key);
    let keystore = KeyStore::tlcp(
        name,
        CertifiedKey::new(vec![sign], sign_key).unwrap(),
        CertifiedKey::new(vec![enc], enc_key).unwrap(),
    );
    (ca, keystore)
}

#[cfg(feature = "ntls")]
fn sm2_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::SM2).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

#[cfg(feature = "ntls")]
fn sm2_leaf(
    serial: u32,
    usage: openssl::x509::X509Extension,
    ca: &X509,
    ca_key: &PKey<Private>,
) -> (X509, PKey<Private>) {
    let key = sm2_key();
    let (mut builder, _) = builder("localhost", serial, &key);
    builder.set_issuer_name(ca.subject_name()).unwrap();
    builder.append_extension(usage).unwrap();
    let san = SubjectAlternativeName::new()
        .dns("localhost")
        .ip("127.0.0.1")
        .build(&builder.x509v3_context(Some(ca), None))
        .unwrap();
    builder.append_extension(san).unwrap();
    builder.sign(ca_key, MessageDigest::sm3()).unwrap();
    (builder.build(), key)
}

/// SM2 root plus TLCP keystore able to complete a real NTLS handshake
#[cfg(feature = "ntls")]
pub fn sm2_tlcp_keystore(name: &str) -> (X509, KeyStore) {
    let ca_key = sm2_key();
    let (mut builder, ca_name) = builder("tlcpchan test sm2 root", 1, &ca_key);
    builder.set_issuer_name(&ca_name).unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    builder
        .append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build().unwrap())
        .unwrap();
    builder.sign(&ca_key, MessageDigest::sm3()).unwrap();
    let ca = builder.build();

    let sign_usage = KeyUsage::new().critical().digital_signature().build().unwrap();
    let enc_usage = KeyUsage::new()
        .critical()
        .key_encipherment()
        .data_encipherment()
        .key_agreement()
        .build()
        .unwrap();
    let (sign, sign_key) = sm2_leaf(2, sign_usage, &ca, &ca_key);
    let (enc, enc_key) = sm2_leaf(3, enc_usage, &ca, &ca_key);
    let keystore = KeyStore::tlcp(
        name,
        CertifiedKey::new(vec![sign], sign_key).unwrap(),
        CertifiedKey::new(vec![enc], enc_key).unwrap(),
    );
    (ca, keystore)
}

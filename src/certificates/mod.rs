//! Per-cluster mTLS material for the peer health protocol
//!
//! The manager generates a CA plus one shared leaf key pair and stores them
//! in a Secret; every agent loads the same pair. The server requires client
//! certificates signed by the CA and clients pin the same CA, so only
//! fencing agents can speak the protocol.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, Patch, PatchParams},
    Client,
};
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, ExtendedKeyUsagePurpose, IsCa,
    KeyUsagePurpose, SanType,
};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{info, warn};

use crate::error::{Error, Result};

pub const CERT_SECRET_NAME: &str = "fencing-agent-certs";

/// DNS name carried by the shared leaf certificate. Clients connect to peer
/// IPs but address them by this name so hostname verification holds.
pub const PEER_DNS_NAME: &str = "fencing-peer";

const CA_COMMON_NAME: &str = "fencing-operator-ca";

/// PEM-encoded mTLS material shared by all agents in the cluster
#[derive(Clone, Debug)]
pub struct MtlsMaterial {
    pub ca_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

/// Ensure the shared certificate Secret exists, generating it if needed
pub async fn ensure_certs(client: &Client, namespace: &str) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);

    if secrets.get(CERT_SECRET_NAME).await.is_ok() {
        return Ok(());
    }

    info!(namespace, "generating per-cluster mTLS material");

    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    ca_params.distinguished_name = DistinguishedName::new();
    ca_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, CA_COMMON_NAME);
    ca_params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    ca_params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    ca_params.key_usages.push(KeyUsagePurpose::CrlSign);

    let ca_cert =
        Certificate::from_params(ca_params).map_err(|e| Error::CertError(e.to_string()))?;
    let ca_pem = ca_cert
        .serialize_pem()
        .map_err(|e| Error::CertError(e.to_string()))?;

    // One shared leaf used by both sides of the peer protocol
    let mut leaf_params = CertificateParams::default();
    leaf_params.distinguished_name = DistinguishedName::new();
    leaf_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, PEER_DNS_NAME);
    leaf_params
        .subject_alt_names
        .push(SanType::DnsName(PEER_DNS_NAME.to_string()));
    leaf_params
        .subject_alt_names
        .push(SanType::DnsName("localhost".to_string()));
    leaf_params
        .key_usages
        .push(KeyUsagePurpose::DigitalSignature);
    leaf_params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);
    leaf_params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ClientAuth);

    let leaf =
        Certificate::from_params(leaf_params).map_err(|e| Error::CertError(e.to_string()))?;
    let leaf_pem = leaf
        .serialize_pem_with_signer(&ca_cert)
        .map_err(|e| Error::CertError(e.to_string()))?;

    let mut data = BTreeMap::new();
    data.insert("ca.crt".to_string(), ca_pem.into_bytes());
    data.insert("tls.crt".to_string(), leaf_pem.into_bytes());
    data.insert(
        "tls.key".to_string(),
        leaf.serialize_private_key_pem().into_bytes(),
    );

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(CERT_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(
            data.into_iter()
                .map(|(k, v)| (k, k8s_openapi::ByteString(v)))
                .collect(),
        ),
        ..Default::default()
    };

    secrets
        .patch(
            CERT_SECRET_NAME,
            &PatchParams::apply("fencing-operator").force(),
            &Patch::Apply(&secret),
        )
        .await
        .map_err(Error::KubeError)?;

    info!(secret = CERT_SECRET_NAME, "mTLS material stored");
    Ok(())
}

/// Load the shared material, retrying while the manager may still be
/// creating it
pub async fn load_material(client: &Client, namespace: &str) -> Result<MtlsMaterial> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);

    let mut attempts = 0u32;
    loop {
        match secrets.get_opt(CERT_SECRET_NAME).await {
            Ok(Some(secret)) => return material_from_secret(&secret),
            Ok(None) => {
                attempts += 1;
                if attempts >= 30 {
                    return Err(Error::CertError(format!(
                        "certificate secret {CERT_SECRET_NAME} not found in {namespace}"
                    )));
                }
                warn!(
                    secret = CERT_SECRET_NAME,
                    attempts, "certificate secret not found yet, retrying"
                );
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            Err(e) => return Err(Error::KubeError(e)),
        }
    }
}

fn material_from_secret(secret: &Secret) -> Result<MtlsMaterial> {
    let data = secret
        .data
        .as_ref()
        .ok_or_else(|| Error::CertError("certificate secret has no data".to_string()))?;
    let field = |key: &str| -> Result<Vec<u8>> {
        data.get(key)
            .map(|b| b.0.clone())
            .ok_or_else(|| Error::CertError(format!("certificate secret is missing {key}")))
    };
    Ok(MtlsMaterial {
        ca_pem: field("ca.crt")?,
        cert_pem: field("tls.crt")?,
        key_pem: field("tls.key")?,
    })
}

/// Build a server-side rustls config requiring client certificates signed
/// by the cluster CA
pub fn server_tls_config(material: &MtlsMaterial) -> Result<rustls::ServerConfig> {
    let certs = CertificateDer::pem_slice_iter(&material.cert_pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::CertError(format!("failed to parse certificates: {e}")))?;

    let key = PrivateKeyDer::from_pem_slice(&material.key_pem)
        .map_err(|e| Error::CertError(format!("failed to parse private key: {e}")))?;

    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(&material.ca_pem) {
        let cert = cert.map_err(|e| Error::CertError(format!("failed to parse CA cert: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| Error::CertError(format!("failed to add CA cert: {e}")))?;
    }

    let client_verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::CertError(format!("failed to create client verifier: {e}")))?;

    rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)
        .map_err(|e| Error::CertError(format!("failed to create server config: {e}")))
}

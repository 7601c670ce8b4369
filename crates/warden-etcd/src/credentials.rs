//! Sources of the client credentials used to dial etcd.
//!
//! Credentials are either managed (generated on first use and kept in
//! a directory) or external (supplied by the user, never generated or
//! overwritten). Both expose the same three operations: lookup,
//! generate-if-missing, and persist.

use std::fs;
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair,
};
use tracing::info;

use crate::error::{EtcdError, EtcdResult};
use crate::tls::TlsMaterial;

pub const CA_CERT_FILE: &str = "ca.crt";
pub const CA_KEY_FILE: &str = "ca.key";
pub const CLIENT_CERT_FILE: &str = "client.crt";
pub const CLIENT_KEY_FILE: &str = "client.key";

/// Where etcd client credentials come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EtcdCredentials {
    /// Generated on demand and stored under `dir`.
    Managed { dir: PathBuf },
    /// Supplied by the user.
    External {
        ca_file: PathBuf,
        cert_file: PathBuf,
        key_file: PathBuf,
    },
}

/// Outcome of [`EtcdCredentials::generate_if_missing`].
#[derive(Debug, Clone)]
pub enum Provisioned {
    /// Found by lookup.
    Existing(TlsMaterial),
    /// Freshly minted; not yet persisted.
    Generated(TlsMaterial),
}

impl Provisioned {
    pub fn material(&self) -> &TlsMaterial {
        match self {
            Provisioned::Existing(m) | Provisioned::Generated(m) => m,
        }
    }

    pub fn into_material(self) -> TlsMaterial {
        match self {
            Provisioned::Existing(m) | Provisioned::Generated(m) => m,
        }
    }

    pub fn is_generated(&self) -> bool {
        matches!(self, Provisioned::Generated(_))
    }
}

impl EtcdCredentials {
    pub fn managed(dir: impl Into<PathBuf>) -> Self {
        EtcdCredentials::Managed { dir: dir.into() }
    }

    pub fn external(
        ca_file: impl Into<PathBuf>,
        cert_file: impl Into<PathBuf>,
        key_file: impl Into<PathBuf>,
    ) -> Self {
        EtcdCredentials::External {
            ca_file: ca_file.into(),
            cert_file: cert_file.into(),
            key_file: key_file.into(),
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, EtcdCredentials::External { .. })
    }

    /// Load existing material.
    ///
    /// Managed credentials that were never generated yield `None`;
    /// missing external credentials are an error.
    pub fn lookup(&self) -> EtcdResult<Option<TlsMaterial>> {
        match self {
            EtcdCredentials::Managed { dir } => {
                let ca = dir.join(CA_CERT_FILE);
                let cert = dir.join(CLIENT_CERT_FILE);
                let key = dir.join(CLIENT_KEY_FILE);

                let present = [&ca, &cert, &key].iter().filter(|p| p.exists()).count();
                if present == 0 {
                    return Ok(None);
                }
                if present < 3 {
                    return Err(EtcdError::Credentials(format!(
                        "incomplete managed credentials in {}",
                        dir.display()
                    )));
                }

                let mut material =
                    TlsMaterial::new(read_pem(&ca)?, read_pem(&cert)?, read_pem(&key)?);
                let ca_key = dir.join(CA_KEY_FILE);
                if ca_key.exists() {
                    material.ca_key_pem = Some(read_pem(&ca_key)?);
                }
                Ok(Some(material))
            }
            EtcdCredentials::External {
                ca_file,
                cert_file,
                key_file,
            } => {
                for path in [ca_file, cert_file, key_file] {
                    if !path.exists() {
                        return Err(EtcdError::Credentials(format!(
                            "external certificate not found: {}",
                            path.display()
                        )));
                    }
                }
                Ok(Some(TlsMaterial::new(
                    read_pem(ca_file)?,
                    read_pem(cert_file)?,
                    read_pem(key_file)?,
                )))
            }
        }
    }

    /// Look up existing material, generating it when a managed source
    /// has none. External sources are never generated.
    pub fn generate_if_missing(&self) -> EtcdResult<Provisioned> {
        if let Some(material) = self.lookup()? {
            return Ok(Provisioned::Existing(material));
        }
        match self {
            EtcdCredentials::Managed { .. } => {
                let material = generate_client_material("warden-etcd-client")?;
                Ok(Provisioned::Generated(material))
            }
            // lookup() already failed for missing external files.
            EtcdCredentials::External { .. } => Err(EtcdError::Credentials(
                "external credentials cannot be generated".to_string(),
            )),
        }
    }

    /// Store material. A no-op for external credentials.
    pub fn persist(&self, material: &TlsMaterial) -> EtcdResult<()> {
        let EtcdCredentials::Managed { dir } = self else {
            return Ok(());
        };

        fs::create_dir_all(dir).map_err(|e| {
            EtcdError::Credentials(format!("failed to create {}: {e}", dir.display()))
        })?;
        write_file(&dir.join(CA_CERT_FILE), &material.ca_pem, false)?;
        write_file(&dir.join(CLIENT_CERT_FILE), &material.cert_pem, false)?;
        write_file(&dir.join(CLIENT_KEY_FILE), &material.key_pem, true)?;
        if let Some(ca_key) = &material.ca_key_pem {
            write_file(&dir.join(CA_KEY_FILE), ca_key, true)?;
        }

        info!(dir = %dir.display(), "persisted managed etcd credentials");
        Ok(())
    }
}

/// Mint a self-signed CA and a client certificate signed by it.
pub fn generate_client_material(common_name: &str) -> EtcdResult<TlsMaterial> {
    let cert_err = |e: rcgen::Error| EtcdError::Credentials(format!("certificate generation: {e}"));

    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Warden");
    dn.push(DnType::CommonName, "Warden etcd CA");
    ca_params.distinguished_name = dn;
    ca_params.not_after = rcgen::date_time_ymd(2036, 1, 1);

    let ca_key = KeyPair::generate().map_err(cert_err)?;
    let ca_cert = ca_params.self_signed(&ca_key).map_err(cert_err)?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Warden");
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    params.not_after = rcgen::date_time_ymd(2036, 1, 1);

    let client_key = KeyPair::generate().map_err(cert_err)?;
    let client_cert = params
        .signed_by(&client_key, &ca_cert, &ca_key)
        .map_err(cert_err)?;

    info!(%common_name, "generated etcd client certificate");

    Ok(TlsMaterial {
        ca_pem: ca_cert.pem(),
        cert_pem: client_cert.pem(),
        key_pem: client_key.serialize_pem(),
        ca_key_pem: Some(ca_key.serialize_pem()),
    })
}

fn read_pem(path: &Path) -> EtcdResult<String> {
    fs::read_to_string(path)
        .map_err(|e| EtcdError::Credentials(format!("failed to read {}: {e}", path.display())))
}

fn write_file(path: &Path, contents: &str, secret: bool) -> EtcdResult<()> {
    fs::write(path, contents)
        .map_err(|e| EtcdError::Credentials(format!("failed to write {}: {e}", path.display())))?;

    #[cfg(unix)]
    if secret {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| {
            EtcdError::Credentials(format!("failed to restrict {}: {e}", path.display()))
        })?;
    }
    #[cfg(not(unix))]
    let _ = secret;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_material_is_pem() {
        let material = generate_client_material("node-1").unwrap();
        assert!(material.ca_pem.contains("BEGIN CERTIFICATE"));
        assert!(material.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(material.key_pem.contains("BEGIN PRIVATE KEY"));
        assert!(material.ca_key_pem.is_some());
        assert_ne!(material.ca_pem, material.cert_pem);
    }

    #[test]
    fn managed_lookup_on_empty_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let creds = EtcdCredentials::managed(dir.path());
        assert!(creds.lookup().unwrap().is_none());
    }

    #[test]
    fn managed_generate_then_persist_then_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let creds = EtcdCredentials::managed(dir.path().join("etcd"));

        let provisioned = creds.generate_if_missing().unwrap();
        assert!(provisioned.is_generated());
        creds.persist(provisioned.material()).unwrap();

        let again = creds.generate_if_missing().unwrap();
        assert!(!again.is_generated());
        assert_eq!(again.material().cert_pem, provisioned.material().cert_pem);
        assert!(again.material().ca_key_pem.is_some());
    }

    #[test]
    fn managed_partial_files_are_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CA_CERT_FILE), "ca").unwrap();
        let creds = EtcdCredentials::managed(dir.path());
        assert!(matches!(creds.lookup(), Err(EtcdError::Credentials(_))));
    }

    #[cfg(unix)]
    #[test]
    fn persisted_key_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let creds = EtcdCredentials::managed(dir.path());
        let material = generate_client_material("node-1").unwrap();
        creds.persist(&material).unwrap();

        let mode = fs::metadata(dir.path().join(CLIENT_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn external_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let creds = EtcdCredentials::external(
            dir.path().join("ca.crt"),
            dir.path().join("client.crt"),
            dir.path().join("client.key"),
        );
        match creds.generate_if_missing() {
            Err(EtcdError::Credentials(msg)) => assert!(msg.contains("not found")),
            other => panic!("expected credentials error, got {other:?}"),
        }
    }

    #[test]
    fn external_is_looked_up_and_never_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let material = generate_client_material("user").unwrap();
        let ca = dir.path().join("ca.pem");
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        fs::write(&ca, &material.ca_pem).unwrap();
        fs::write(&cert, &material.cert_pem).unwrap();
        fs::write(&key, &material.key_pem).unwrap();

        let creds = EtcdCredentials::external(&ca, &cert, &key);
        assert!(creds.is_external());
        let found = creds.generate_if_missing().unwrap();
        assert!(!found.is_generated());

        let other = generate_client_material("other").unwrap();
        creds.persist(&other).unwrap();
        assert_eq!(fs::read_to_string(&cert).unwrap(), material.cert_pem);
    }
}

//! Shared TLS security context
//!
//! One context is shared by every TLS listener in the process, mirroring how
//! an encrypted transport's security context binds configuration to all
//! connections using it. The password callback is consulted lazily, at the
//! moment an encrypted private key is loaded, not when it is registered.

use harbor_core::{ConfigError, Error, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::sync::{Arc, Mutex, OnceLock};

/// Callback returning the password for an encrypted private key.
pub type PasswordCallback = Arc<dyn Fn() -> String + Send + Sync>;

/// Process-wide security context for the TLS transport.
pub struct TlsContext {
    identity: Mutex<Option<Identity>>,
    password_callback: Mutex<Option<PasswordCallback>>,
}

#[derive(Clone)]
struct Identity {
    cert_file: String,
    key_file: String,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("has_identity", &self.identity.lock().unwrap().is_some())
            .field(
                "has_password_callback",
                &self.password_callback.lock().unwrap().is_some(),
            )
            .finish()
    }
}

impl TlsContext {
    fn new() -> Self {
        Self {
            identity: Mutex::new(None),
            password_callback: Mutex::new(None),
        }
    }

    /// The context shared by all TLS listeners in this process.
    pub fn shared() -> &'static TlsContext {
        static SHARED: OnceLock<TlsContext> = OnceLock::new();
        SHARED.get_or_init(TlsContext::new)
    }

    /// Set the certificate chain and private key files.
    pub fn set_identity(&self, cert_file: impl Into<String>, key_file: impl Into<String>) {
        *self.identity.lock().unwrap() = Some(Identity {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
        });
    }

    /// Register the callback used to obtain the private-key password.
    pub fn set_password_callback(&self, callback: PasswordCallback) {
        *self.password_callback.lock().unwrap() = Some(callback);
    }

    /// Invoke the password callback, if one is registered.
    pub fn password(&self) -> Option<String> {
        let cb = self.password_callback.lock().unwrap().clone();
        cb.map(|cb| cb())
    }

    /// Build a rustls server configuration from the registered identity.
    ///
    /// Encrypted PKCS#8 keys are unlocked through the password callback.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let identity = self.identity.lock().unwrap().clone().ok_or_else(|| {
            Error::Config(ConfigError::MissingField {
                field: "tls identity (certificate and key files)".to_string(),
            })
        })?;

        let certs = load_certs(&identity.cert_file)?;
        let key = self.load_key(&identity.key_file)?;

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Transport(format!("invalid certificate or key: {e}")))?;

        Ok(Arc::new(config))
    }

    fn load_key(&self, key_file: &str) -> Result<PrivateKey> {
        let pem = std::fs::read_to_string(key_file).map_err(Error::Io)?;

        if pem.contains("BEGIN ENCRYPTED PRIVATE KEY") {
            let password = self.password().ok_or_else(|| {
                Error::Config(ConfigError::MissingField {
                    field: "password (encrypted private key)".to_string(),
                })
            })?;
            return decrypt_pkcs8_key(&pem, &password);
        }

        let mut reader = BufReader::new(File::open(key_file).map_err(Error::Io)?);
        let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader).map_err(Error::Io)?;
        if keys.is_empty() {
            let mut reader = BufReader::new(File::open(key_file).map_err(Error::Io)?);
            keys = rustls_pemfile::rsa_private_keys(&mut reader).map_err(Error::Io)?;
        }

        keys.into_iter().next().map(PrivateKey).ok_or_else(|| {
            Error::Config(ConfigError::InvalidValue {
                field: "key_file".to_string(),
                value: key_file.to_string(),
            })
        })
    }
}

fn load_certs(cert_file: &str) -> Result<Vec<Certificate>> {
    let mut reader = BufReader::new(File::open(cert_file).map_err(Error::Io)?);
    let certs = rustls_pemfile::certs(&mut reader).map_err(Error::Io)?;
    if certs.is_empty() {
        return Err(Error::Config(ConfigError::InvalidValue {
            field: "cert_file".to_string(),
            value: cert_file.to_string(),
        }));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn decrypt_pkcs8_key(pem: &str, password: &str) -> Result<PrivateKey> {
    let (_, doc) = pkcs8::Document::from_pem(pem)
        .map_err(|e| Error::Transport(format!("malformed encrypted key: {e}")))?;
    let encrypted = pkcs8::EncryptedPrivateKeyInfo::try_from(doc.as_bytes())
        .map_err(|e| Error::Transport(format!("malformed encrypted key: {e}")))?;
    let secret = encrypted
        .decrypt(password)
        .map_err(|e| Error::Transport(format!("key decryption failed: {e}")))?;
    Ok(PrivateKey(secret.as_bytes().to_vec()))
}

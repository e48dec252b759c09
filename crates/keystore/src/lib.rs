//! PriceMesh Keystore
//!
//! File-based key persistence for the two node identities: the libp2p
//! network key and the aggregate signing key. Keys are 32-byte ed25519
//! secrets, generated on first run.

use std::fs;
use std::path::{Path, PathBuf};

use libp2p::identity::Keypair;
use pricemesh_crypto::SigningKeypair;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("failed to read key file: {0}")]
    ReadError(String),
    #[error("failed to write key file: {0}")]
    WriteError(String),
    #[error("invalid key format")]
    InvalidFormat,
    #[error("failed to create directory: {0}")]
    CreateDirError(String),
}

pub type Result<T> = std::result::Result<T, KeystoreError>;

/// Load or generate the node's aggregate signing keypair.
///
/// If the file exists, loads the 32-byte secret key.
/// If not, generates a new keypair and saves it.
pub fn load_or_generate_keypair(path: &Path) -> Result<SigningKeypair> {
    let bytes = load_or_generate_secret_bytes(path)?;
    SigningKeypair::from_secret_slice(&bytes).map_err(|_| KeystoreError::InvalidFormat)
}

/// Load or generate the node's libp2p network identity.
///
/// Stored as the same 32-byte ed25519 secret format as the signing key,
/// in a separate file so the two identities can rotate independently.
pub fn load_or_generate_network_keypair(path: &Path) -> Result<Keypair> {
    let bytes = load_or_generate_secret_bytes(path)?;
    Keypair::ed25519_from_bytes(bytes).map_err(|_| KeystoreError::InvalidFormat)
}

/// Key files hold the raw secret; length validation is left to the key
/// constructors.
fn load_or_generate_secret_bytes(path: &Path) -> Result<Vec<u8>> {
    if path.exists() {
        debug!("loading key from {}", path.display());
        fs::read(path).map_err(|e| KeystoreError::ReadError(e.to_string()))
    } else {
        info!("generating new key at {}", path.display());
        let secret = SigningKeypair::generate().secret_key_bytes();
        save_key_bytes(path, &secret)?;
        Ok(secret.to_vec())
    }
}

/// Save raw key bytes to a file, creating parent directories as needed.
pub fn save_key_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| KeystoreError::CreateDirError(e.to_string()))?;
    }
    fs::write(path, bytes).map_err(|e| KeystoreError::WriteError(e.to_string()))
}

/// Default data directory for the node.
///
/// `$XDG_DATA_HOME/pricemesh` on Linux, `~/.local/share/pricemesh` otherwise.
pub fn default_data_dir() -> PathBuf {
    let base = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local").join("share"));
    base.join("pricemesh")
}

/// Default config directory for the node.
pub fn default_config_dir() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"));
    base.join("pricemesh")
}

/// Default path of the aggregate signing key.
pub fn default_signing_key_path() -> PathBuf {
    default_data_dir().join("keys").join("signing.key")
}

/// Default path of the libp2p network key.
pub fn default_network_key_path() -> PathBuf {
    default_data_dir().join("keys").join("network.key")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

//! Loading key material from the key directory.
//!
//! The expected files are `ki_keys.json`, a dump of recent client
//! public keys, and `injected_keys.json`, a controlled key pair for the
//! client connecting to the proxy. Optionally, a `ClientSig.dec.bin`
//! holds the decrypted client signature artifact used to answer
//! handshake challenges.

use std::fs;
use std::path::Path;

use spiral_common::crypto::challenge::ClientSig;
use spiral_common::crypto::{KeyBundle, KeyChain};
use spiral_common::error::{ProxyError, Result};

fn read_bundle(path: &Path) -> Result<KeyBundle> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| ProxyError::KeyMaterial(format!("{}: {e}", path.display())))
}

/// Loads the two key bundles from `dir` into a [`KeyChain`].
pub fn load_key_chain(dir: &Path) -> Result<KeyChain> {
    let ki_keys = read_bundle(&dir.join("ki_keys.json"))?;
    let injected_keys = read_bundle(&dir.join("injected_keys.json"))?;

    KeyChain::from_bundles(&ki_keys, &injected_keys)
}

/// Loads the optional decrypted ClientSig artifact from `dir`.
pub fn load_client_sig(dir: &Path) -> Result<Option<ClientSig>> {
    let path = dir.join("ClientSig.dec.bin");
    if !path.exists() {
        return Ok(None);
    }

    ClientSig::parse(&fs::read(path)?).map(Some)
}

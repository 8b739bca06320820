//! Reads the accounts geth keeps in `<datadir>/keystore`.

use crate::{EngineError, EngineResult};
use ethers::types::Address;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;

#[derive(Deserialize)]
struct KeyFile {
    address: String,
}

fn parse_key_file(contents: &str) -> EngineResult<Address> {
    let key: KeyFile = serde_json::from_str(contents)
        .map_err(|e| EngineError::Keystore(format!("malformed key file: {e}")))?;
    let hex = key.address.trim_start_matches("0x");
    Address::from_str(hex)
        .map_err(|e| EngineError::Keystore(format!("bad address `{}`: {e}", key.address)))
}

/// The account of the oldest key file, if any. Geth names key files
/// `UTC--<timestamp>--<address>`, so lexical order is creation order.
pub(crate) async fn first_account(keystore_dir: &Path) -> EngineResult<Option<Address>> {
    let mut entries = match tokio::fs::read_dir(keystore_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(EngineError::io("reading keystore", e)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| EngineError::io("reading keystore", e))?
    {
        let is_file = entry
            .file_type()
            .await
            .map(|t| t.is_file())
            .unwrap_or(false);
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if is_file && !hidden {
            files.push(entry.path());
        }
    }
    files.sort();

    match files.first() {
        Some(path) => {
            let contents = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| EngineError::io(format!("reading {}", path.display()), e))?;
            parse_key_file(&contents).map(Some)
        }
        None => Ok(None),
    }
}

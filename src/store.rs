//! Durable persistence for the address book.
//!
//! The wire format of the persisted DB is explicitly out of scope (spec
//! §1/§3: "assumed: key-value mapping with durable writes"). `Store` is the
//! seam: the crate ships one reasonable JSON-lines implementation behind
//! it, the way `zebra-network` treats its peer-dialing transport as a
//! pluggable collaborator rather than hard-coding a socket type.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::address::Address;
use crate::error::ConnError;
use crate::record::PeerRecord;

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn load(&self) -> Result<HashMap<Address, PeerRecord>, ConnError>;
    async fn flush(&self, entries: &HashMap<Address, PeerRecord>) -> Result<(), ConnError>;
}

/// A single JSON object per line, one line per `(address, record)` pair.
/// Rewritten wholesale on every flush, which is adequate at the scale this
/// core operates at (hundreds, not millions, of addresses).
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>) -> JsonFileStore {
        JsonFileStore {
            path: dir.as_ref().join("addresses.jsonl"),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Line {
    address: Address,
    record: PeerRecord,
}

#[async_trait::async_trait]
impl Store for JsonFileStore {
    async fn load(&self) -> Result<HashMap<Address, PeerRecord>, ConnError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(ConnError::Io(e.to_string())),
        };
        let mut out = HashMap::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            let parsed: Line =
                serde_json::from_str(line).map_err(|e| ConnError::Io(e.to_string()))?;
            out.insert(parsed.address, parsed.record);
        }
        Ok(out)
    }

    async fn flush(&self, entries: &HashMap<Address, PeerRecord>) -> Result<(), ConnError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ConnError::Io(e.to_string()))?;
        }
        let tmp_path = self.path.with_extension("jsonl.tmp");
        let mut buf = Vec::new();
        for (address, record) in entries {
            let line = Line {
                address: address.clone(),
                record: record.clone(),
            };
            serde_json::to_writer(&mut buf, &line).map_err(|e| ConnError::Io(e.to_string()))?;
            buf.push(b'\n');
        }
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| ConnError::Io(e.to_string()))?;
        file.write_all(&buf)
            .await
            .map_err(|e| ConnError::Io(e.to_string()))?;
        file.flush().await.map_err(|e| ConnError::Io(e.to_string()))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| ConnError::Io(e.to_string()))?;
        Ok(())
    }
}

/// An in-memory store for tests that don't exercise persistence.
#[derive(Default)]
pub struct MemoryStore;

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn load(&self) -> Result<HashMap<Address, PeerRecord>, ConnError> {
        Ok(HashMap::new())
    }

    async fn flush(&self, _entries: &HashMap<Address, PeerRecord>) -> Result<(), ConnError> {
        Ok(())
    }
}

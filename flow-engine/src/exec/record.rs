// Execution records
// Per-node persisted record of the previous run, read by the up-to-date
// checker; written atomically (temp then rename) to tolerate concurrent
// runs and crashes mid-write

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::defs::{DataItem, Marker};
use crate::runner::Invocation;
use crate::value::Value;

/// One entry of the ordered input signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSignature {
    pub source: String,
    pub seq: u32,
    #[serde(rename = "type")]
    pub item_type: String,
}

impl InputSignature {
    pub fn of(item: &DataItem) -> Self {
        Self {
            source: item.src.clone().unwrap_or_default(),
            seq: item.seq,
            item_type: item.item_type.clone(),
        }
    }
}

/// Persisted record of one node's prior execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRecord {
    pub name: String,
    pub status: i32,
    pub changed: bool,
    pub params: BTreeMap<String, Value>,
    pub input_signature: Vec<InputSignature>,
    pub outputs: Vec<DataItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memento: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub markers: Vec<Marker>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invocations: Vec<Invocation>,
    /// Milliseconds since the epoch
    pub started_at: u64,
    pub finished_at: u64,
}

impl ExecRecord {
    pub fn signature_of(inputs: &[DataItem]) -> Vec<InputSignature> {
        inputs.iter().map(InputSignature::of).collect()
    }
}

pub fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// JSON-file record store, one file per node under a records directory
pub struct RecordStore {
    root: PathBuf,
}

impl RecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, node_name: &str) -> PathBuf {
        // Node names may contain separators from matrix suffixes; flatten
        let file = node_name.replace(['/', '\\'], "_");
        self.root.join(format!("{}.json", file))
    }

    /// Load the record for a node; absence is not an error
    pub fn load(&self, node_name: &str) -> Option<ExecRecord> {
        let bytes = fs::read(self.path_for(node_name)).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("discarding corrupt record for '{}': {}", node_name, e);
                None
            }
        }
    }

    /// Write atomically: temp file in the same directory, then rename
    pub fn store(&self, record: &ExecRecord) -> std::io::Result<()> {
        fs::create_dir_all(&self.root)?;
        let path = self.path_for(&record.name);
        let tmp = path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(record)?)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

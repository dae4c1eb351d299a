//! Staging area listing and verification.

use batchsync_storage::{checksum_hex, FileStaging, StagingStore};
use serde::Serialize;
use std::path::Path;

use super::{CliResult, Format};

/// One staged resource.
#[derive(Debug, Serialize)]
pub struct StagedEntry {
    /// Resource key.
    pub key: String,
    /// Lifecycle state.
    pub state: String,
    /// Size in bytes.
    pub size: u64,
    /// Hex checksum, once the resource is complete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Outcome of verifying one resource.
#[derive(Debug, Serialize)]
pub struct VerifyEntry {
    /// Resource key.
    pub key: String,
    /// Failure, if the resource did not verify.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Lists the resources under a staging root.
pub fn list(root: &Path) -> CliResult<Vec<StagedEntry>> {
    let staging = FileStaging::open(root)?;
    let mut keys = staging.keys()?;
    keys.sort_by(|a, b| (&a.category, &a.location, a.batch_id).cmp(&(&b.category, &b.location, b.batch_id)));
    let mut entries = Vec::with_capacity(keys.len());
    for key in keys {
        let Some(resource) = staging.find(&key)? else {
            continue;
        };
        entries.push(StagedEntry {
            key: key.to_string(),
            state: format!("{:?}", resource.state()),
            size: resource.size(),
            checksum: resource.checksum().as_ref().map(checksum_hex),
        });
    }
    Ok(entries)
}

/// Checks every resource against its recorded checksum.
pub fn verify(root: &Path) -> CliResult<Vec<VerifyEntry>> {
    let staging = FileStaging::open(root)?;
    let mut entries = Vec::new();
    for key in staging.keys()? {
        let Some(resource) = staging.find(&key)? else {
            continue;
        };
        let error = resource.verify().err().map(|e| e.to_string());
        if let Some(error) = &error {
            tracing::warn!(key = %key, error = %error, "staged resource failed verification");
        }
        entries.push(VerifyEntry {
            key: key.to_string(),
            error,
        });
    }
    Ok(entries)
}

/// Runs `staging ls`.
pub fn run_list(root: &Path, format: Format) -> CliResult<()> {
    let entries = list(root)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        Format::Text => {
            for entry in &entries {
                println!(
                    "{:<40} {:<9} {:>10}  {}",
                    entry.key,
                    entry.state,
                    entry.size,
                    entry.checksum.as_deref().unwrap_or("-")
                );
            }
            println!("{} resource(s)", entries.len());
        }
    }
    Ok(())
}

/// Runs `staging verify`. Returns false if any resource failed.
pub fn run_verify(root: &Path, format: Format) -> CliResult<bool> {
    let entries = verify(root)?;
    let failed = entries.iter().filter(|e| e.error.is_some()).count();
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        Format::Text => {
            for entry in entries.iter().filter(|e| e.error.is_some()) {
                println!("FAILED {}: {}", entry.key, entry.error.as_deref().unwrap_or_default());
            }
            println!("{} resource(s) checked, {} failed", entries.len(), failed);
        }
    }
    Ok(failed == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchsync_storage::{ResourceState, StagingKey};

    #[test]
    fn lists_and_verifies_complete_resources() {
        let dir = tempfile::tempdir().unwrap();
        {
            let staging = FileStaging::open(dir.path()).unwrap();
            let resource = staging.create(&StagingKey::outgoing("001", 7)).unwrap();
            resource.append(b"batch,7\ncommit,7\n").unwrap();
            resource.set_state(ResourceState::Done).unwrap();
            resource.close().unwrap();
        }

        let entries = list(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, "Done");
        assert!(entries[0].checksum.is_some());

        let verified = verify(dir.path()).unwrap();
        assert!(verified.iter().all(|e| e.error.is_none()));
    }
}

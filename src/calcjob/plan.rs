//! Transfer plan: what to upload before submission and fetch afterwards

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// A remote file to fetch after the job finishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveEntry {
    /// Path relative to the remote job directory
    pub remote: String,
    /// Local file name, defaults to the remote file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,
    pub required: bool,
}

impl RetrieveEntry {
    pub fn required(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            local: None,
            required: true,
        }
    }

    pub fn optional(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            local: None,
            required: false,
        }
    }

    pub fn store_as(mut self, name: impl Into<String>) -> Self {
        self.local = Some(name.into());
        self
    }

    pub fn local_name(&self) -> String {
        match &self.local {
            Some(name) => name.clone(),
            None => Path::new(&self.remote)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.remote.clone()),
        }
    }
}

/// A local file or directory uploaded into the job directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCopy {
    pub source: PathBuf,
    pub destination: String,
}

/// A path already on a computer, copied into the job directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCopy {
    pub computer: String,
    pub source: PathBuf,
    pub destination: String,
}

/// Which list of the plan an entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanList {
    Retrieve,
    LocalCopy,
    RemoteCopy,
}

impl fmt::Display for PlanList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlanList::Retrieve => "retrieve",
            PlanList::LocalCopy => "local copy",
            PlanList::RemoteCopy => "remote copy",
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Destination '{destination}' appears in both the {first} and {second} lists")]
pub struct PlanConflictError {
    pub destination: String,
    pub first: PlanList,
    pub second: PlanList,
}

/// Uploads and downloads for one job, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPlan {
    retrieve: Vec<RetrieveEntry>,
    local_copy: Vec<LocalCopy>,
    remote_copy: Vec<RemoteCopy>,
}

/// `./a//b/` and `a/b` name the same destination
fn normalize(destination: &str) -> String {
    destination
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

impl TransferPlan {
    /// Build a plan, rejecting any destination claimed twice
    pub fn new(
        retrieve: Vec<RetrieveEntry>,
        local_copy: Vec<LocalCopy>,
        remote_copy: Vec<RemoteCopy>,
    ) -> Result<Self, PlanConflictError> {
        let mut seen: HashMap<String, PlanList> = HashMap::new();
        let destinations = retrieve
            .iter()
            .map(|e| (e.local_name(), PlanList::Retrieve))
            .chain(local_copy.iter().map(|c| (c.destination.clone(), PlanList::LocalCopy)))
            .chain(remote_copy.iter().map(|c| (c.destination.clone(), PlanList::RemoteCopy)));

        for (destination, list) in destinations {
            let key = normalize(&destination);
            if let Some(first) = seen.insert(key, list) {
                return Err(PlanConflictError {
                    destination,
                    first,
                    second: list,
                });
            }
        }

        Ok(Self {
            retrieve,
            local_copy,
            remote_copy,
        })
    }

    pub fn retrieve(&self) -> &[RetrieveEntry] {
        &self.retrieve
    }

    pub fn local_copy(&self) -> &[LocalCopy] {
        &self.local_copy
    }

    pub fn remote_copy(&self) -> &[RemoteCopy] {
        &self.remote_copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(dest: &str) -> LocalCopy {
        LocalCopy {
            source: PathBuf::from("/staging").join(dest),
            destination: dest.to_string(),
        }
    }

    #[test]
    fn test_declaration_order_kept() {
        let plan = TransferPlan::new(
            vec![RetrieveEntry::required("b.out"), RetrieveEntry::required("a.out")],
            vec![local("z.in"), local("y.in")],
            vec![],
        )
        .unwrap();
        assert_eq!(plan.retrieve()[0].remote, "b.out");
        assert_eq!(plan.local_copy()[1].destination, "y.in");
    }

    #[test]
    fn test_conflict_across_lists() {
        let err = TransferPlan::new(
            vec![],
            vec![local("data")],
            vec![RemoteCopy {
                computer: "c".into(),
                source: PathBuf::from("/old/run/data"),
                destination: "./data/".into(),
            }],
        )
        .unwrap_err();
        assert_eq!(err.first, PlanList::LocalCopy);
        assert_eq!(err.second, PlanList::RemoteCopy);
    }

    #[test]
    fn test_conflict_within_retrieve() {
        let err = TransferPlan::new(
            vec![
                RetrieveEntry::required("out/result.txt"),
                RetrieveEntry::optional("result.txt"),
            ],
            vec![],
            vec![],
        )
        .unwrap_err();
        assert_eq!(err.destination, "result.txt");
    }

    #[test]
    fn test_store_as_renames() {
        let entry = RetrieveEntry::required("deep/path/out.txt").store_as("renamed.txt");
        assert_eq!(entry.local_name(), "renamed.txt");
        assert_eq!(RetrieveEntry::optional("deep/x.log").local_name(), "x.log");
    }
}

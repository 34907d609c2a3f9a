use crate::asset::AssetDescriptor;
use crate::batch::{self, Batch};
use crate::context::FetchContext;
use crate::report::BatchReport;
use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Resolved descriptors saved to disk so a download can run, or resume, in
/// a later process.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct FetchPlan {
    id: String,
    descriptors: Vec<AssetDescriptor>,
}

impl FetchPlan {
    pub fn new(id: &str, descriptors: Vec<AssetDescriptor>) -> Self {
        Self {
            id: id.to_string(),
            descriptors,
        }
    }

    pub fn from_batch(id: &str, batch: &Batch) -> Self {
        Self::new(id, batch.descriptors().to_vec())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn descriptors(&self) -> &[AssetDescriptor] {
        &self.descriptors
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).with_context(|| format!("Could not read plan {path:?}"))?;
        let plan: Self = serde_json::from_str(&content)?;
        Ok(plan)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Could not write plan {path:?}"))?;
        Ok(())
    }

    /// Validates the plan and fetches it. Files already in place are not
    /// fetched again under the default overwrite policy.
    pub async fn execute(&self, ctx: &FetchContext) -> Result<BatchReport> {
        let batch = Batch::new(self.descriptors.clone())?;
        info!(
            "Executing plan {} with {} descriptor(s)",
            self.id,
            batch.len()
        );
        Ok(batch::fetch_batch(ctx, batch).await)
    }
}

use crate::batch::Batch;
use crate::config::FetchConfig;
use crate::layout::{PathTemplate, DEFAULT_TEMPLATE};
use crate::plan::FetchPlan;
use crate::resolver::ResolveOptions;
use crate::search::{SearchParameters, SearchProvider, EARTH_SEARCH_API};
use anyhow::{anyhow, bail, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// A download job described in TOML: which items to look up, which of
/// their assets to fetch and where to put them.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Selection {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub docs: String,
    #[serde(default = "default_api")]
    pub api: String,
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    ids_to_download: Vec<String>,
    #[serde(default)]
    assets: Vec<AssetChoice>,
    #[serde(default)]
    pub destination: Destination,
    #[serde(default)]
    pub fetch: FetchConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct AssetChoice {
    pub key: String,
    #[serde(default)]
    pub name: String,
    pub download: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Destination {
    pub root: PathBuf,
    pub template: String,
}

impl Default for Destination {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./outputs"),
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

fn default_api() -> String {
    EARTH_SEARCH_API.to_string()
}

/// Sentinel-2 L2A true color on Earth Search, a starting point for new
/// selection files.
pub fn sentinel2_template() -> toml::Table {
    toml::toml! {
        id = "element84.sentinel2collection1level2a"

        name = "Sentinel-2 Collection 1 Level 2A Surface Reflectance"

        description = "Level 2A product provides atmospherically corrected Surface Reflectance (SR) images,\n\
        derived from the associated Level-1C products."

        docs = "https://sentinels.copernicus.eu/web/sentinel/sentinel-data-access/sentinel-products/sentinel-2-data-products/collection-1-level-2a"

        api = "https://earth-search.aws.element84.com/v1/search"

        collections = ["sentinel-2-c1-l2a"]

        ids_to_download = [
            "S2A_T08VPH_20240504T195929_L2A",
        ]

        [[assets]]
        key = "red"
        name = "Red"
        download = false

        [[assets]]
        key = "green"
        name = "Green"
        download = false

        [[assets]]
        key = "blue"
        name = "Blue"
        download = false

        [[assets]]
        key = "nir"
        name = "NIR"
        download = false

        [[assets]]
        key = "visual"
        name = "True Color"
        download = true

        [destination]
        root = "./outputs"
        template = "{collection}/{item}/{filename}"
    }
}

impl Selection {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let selection: Self = toml::from_str(&content)?;
        Ok(selection)
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn from_template(table: &toml::Table) -> Result<Self> {
        let selection: Self = toml::from_str(&table.to_string())?;
        Ok(selection)
    }

    /// Keys of the assets marked for download.
    pub fn asset_keys_to_download(&self) -> Option<Vec<String>> {
        let keys = self
            .assets
            .iter()
            .filter(|a| a.download)
            .map(|a| a.key.clone())
            .collect::<Vec<_>>();
        if keys.is_empty() {
            return None;
        }
        Some(keys)
    }

    /// Item ids in file order, duplicates removed.
    pub fn ids_to_download(&self) -> Option<Vec<String>> {
        if self.ids_to_download.is_empty() {
            return None;
        }
        let mut seen = HashSet::new();
        let ids = self
            .ids_to_download
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        if ids.len() < self.ids_to_download.len() {
            warn!(
                "Selection {} lists {} duplicate id(s)",
                self.id,
                self.ids_to_download.len() - ids.len()
            );
        }
        Some(ids)
    }

    pub fn search_parameters(&self) -> Result<SearchParameters> {
        let ids = self.ids_to_download().ok_or(anyhow!("No ids to download"))?;
        let mut params = SearchParameters::new()
            .ids(ids.clone())
            .limit(Some(ids.len() as u64));
        if !self.collections.is_empty() {
            params = params.collections(self.collections.clone());
        }
        Ok(params)
    }

    pub fn layout(&self) -> Result<PathTemplate> {
        Ok(PathTemplate::new(
            self.destination.root.clone(),
            &self.destination.template,
        )?)
    }

    pub fn resolve_options(&self) -> Result<ResolveOptions> {
        let keys = self
            .asset_keys_to_download()
            .ok_or(anyhow!("No assets selected for download"))?;
        Ok(ResolveOptions::default().with_asset_keys(keys))
    }

    /// Looks the selected items up through `provider` and resolves their
    /// selected assets into a plan.
    pub async fn plan(&self, provider: &impl SearchProvider) -> Result<FetchPlan> {
        let params = self.search_parameters()?;
        let items = provider.search(&params).await?;
        let found = items.iter().map(|i| i.id.as_str()).collect::<HashSet<_>>();
        let missing = self
            .ids_to_download()
            .unwrap_or_default()
            .into_iter()
            .filter(|id| !found.contains(id.as_str()))
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            warn!("Items not found: {}", missing.join(", "));
        }
        if items.is_empty() {
            bail!("Search returned no items for selection {}", self.id);
        }
        info!("Found {} item(s) for selection {}", items.len(), self.id);

        let batch = Batch::from_items(&items, &self.layout()?, &self.resolve_options()?)?;
        Ok(FetchPlan::from_batch(&self.id, &batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stac::{Asset, Item};

    struct FixedProvider(Vec<Item>);

    impl SearchProvider for FixedProvider {
        async fn search(&self, _: &SearchParameters) -> Result<Vec<Item>> {
            Ok(self.0.clone())
        }
    }

    fn item(id: &str) -> Item {
        let mut item = Item::new(id);
        item.collection = Some("sentinel-2-c1-l2a".to_string());
        for key in ["visual", "red"] {
            item.assets.insert(
                key.to_string(),
                Asset::new(format!("https://sentinel-cogs.example.com/{id}/{key}.tif")),
            );
        }
        item
    }

    #[test]
    fn test_template() {
        let selection = Selection::from_template(&sentinel2_template()).unwrap();
        assert_eq!(selection.id, "element84.sentinel2collection1level2a");
        assert_eq!(selection.assets.len(), 5);
        assert_eq!(selection.asset_keys_to_download(), Some(vec!["visual".to_string()]));
        assert_eq!(selection.fetch, FetchConfig::default());
    }

    #[test]
    fn test_write_then_read_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("selection.toml");
        let mut selection = Selection::from_template(&sentinel2_template()).unwrap();
        selection.fetch.global_limit = 2;
        selection.write(&path).unwrap();

        let read = Selection::read(&path).unwrap();
        assert_eq!(read, selection);
        assert_eq!(read.fetch.global_limit, 2);
    }

    #[test]
    fn test_ids_are_deduplicated_in_order() {
        let mut selection = Selection::from_template(&sentinel2_template()).unwrap();
        selection.ids_to_download = vec!["b".into(), "a".into(), "b".into()];
        assert_eq!(
            selection.ids_to_download(),
            Some(vec!["b".to_string(), "a".to_string()])
        );
        selection.ids_to_download.clear();
        assert!(selection.ids_to_download().is_none());
        assert!(selection.search_parameters().is_err());
    }

    #[tokio::test]
    async fn test_plan_selected_assets() {
        let dir = tempfile::tempdir().unwrap();
        let mut selection = Selection::from_template(&sentinel2_template()).unwrap();
        selection.destination.root = dir.path().to_path_buf();
        let provider = FixedProvider(vec![item("S2A_T08VPH_20240504T195929_L2A")]);

        let plan = selection.plan(&provider).await.unwrap();
        assert_eq!(plan.descriptors().len(), 1);
        let descriptor = &plan.descriptors()[0];
        assert_eq!(descriptor.key(), "S2A_T08VPH_20240504T195929_L2A/visual");
        assert_eq!(
            descriptor.destination_path(),
            &dir
                .path()
                .join("sentinel-2-c1-l2a/S2A_T08VPH_20240504T195929_L2A/visual.tif")
        );
    }

    #[tokio::test]
    async fn test_plan_without_results() {
        let selection = Selection::from_template(&sentinel2_template()).unwrap();
        assert!(selection.plan(&FixedProvider(vec![])).await.is_err());
    }
}

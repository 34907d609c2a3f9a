use crate::asset::{extract_checksum, extract_file_size, AssetDescriptor};
use crate::error::ResolutionError;
use crate::layout::Layout;
use log::warn;
use stac::{Item, ItemCollection};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use url::Url;

const SUPPORTED_SCHEMES: [&str; 4] = ["http", "https", "file", "s3"];

/// Anything that can hand out STAC items.
pub enum AssetSource<'a> {
    Item(&'a Item),
    Items(&'a [Item]),
    ItemCollection(&'a ItemCollection),
}

impl<'a> AssetSource<'a> {
    pub fn items(&self) -> &'a [Item] {
        match self {
            Self::Item(item) => std::slice::from_ref(*item),
            Self::Items(items) => items,
            Self::ItemCollection(collection) => &collection.items,
        }
    }
}

impl<'a> From<&'a Item> for AssetSource<'a> {
    fn from(item: &'a Item) -> Self {
        Self::Item(item)
    }
}

impl<'a> From<&'a [Item]> for AssetSource<'a> {
    fn from(items: &'a [Item]) -> Self {
        Self::Items(items)
    }
}

impl<'a> From<&'a Vec<Item>> for AssetSource<'a> {
    fn from(items: &'a Vec<Item>) -> Self {
        Self::Items(items.as_slice())
    }
}

impl<'a> From<&'a ItemCollection> for AssetSource<'a> {
    fn from(collection: &'a ItemCollection) -> Self {
        Self::ItemCollection(collection)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Only assets with these keys are fetched. `None` selects every asset.
    pub asset_keys: Option<HashSet<String>>,
    /// Base for relative hrefs. Without it relative hrefs are local paths.
    pub base_url: Option<Url>,
}

impl ResolveOptions {
    pub fn with_asset_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.asset_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_base_url(mut self, base: Url) -> Self {
        self.base_url = Some(base);
        self
    }

    fn selects(&self, key: &str) -> bool {
        self.asset_keys.as_ref().map_or(true, |keys| keys.contains(key))
    }
}

/// Flattens the items of `source` into fetch descriptors, one per selected
/// asset, keyed `<item id>/<asset key>`.
pub fn resolve<'a>(
    source: impl Into<AssetSource<'a>>,
    layout: &impl Layout,
    options: &ResolveOptions,
) -> Result<Vec<AssetDescriptor>, ResolutionError> {
    let source = source.into();
    let mut descriptors = vec![];

    for item in source.items() {
        // Sorted so that the batch order does not depend on map ordering
        let mut keys = item
            .assets
            .keys()
            .filter(|k| options.selects(k))
            .collect::<Vec<_>>();
        keys.sort();

        for key in keys {
            let asset = &item.assets[key];
            if asset.href.trim().is_empty() {
                return Err(ResolutionError::MissingHref {
                    item: item.id.clone(),
                    key: key.clone(),
                });
            }
            let source_uri = normalize_href(&asset.href, options.base_url.as_ref())?;
            let destination = layout.destination(item, key, asset)?;

            let mut descriptor =
                AssetDescriptor::new(format!("{}/{}", item.id, key), source_uri, destination);
            if let Some(size) = extract_file_size(asset) {
                descriptor = descriptor.with_size(size);
            }
            match extract_checksum(asset) {
                Ok(Some(checksum)) => descriptor = descriptor.with_checksum(checksum),
                Ok(None) => {}
                Err(e) => warn!(
                    "Ignoring checksum of asset '{}' in item '{}': {e}",
                    key, item.id
                ),
            }
            descriptors.push(descriptor);
        }
    }

    dedup(descriptors)
}

/// Collapses identical (source, destination) pairs and rejects conflicting
/// claims on a key or a destination path.
pub fn dedup(descriptors: Vec<AssetDescriptor>) -> Result<Vec<AssetDescriptor>, ResolutionError> {
    let mut by_destination: HashMap<PathBuf, (String, String)> = HashMap::new();
    let mut by_key: HashMap<String, (String, PathBuf)> = HashMap::new();
    let mut unique = Vec::with_capacity(descriptors.len());

    for descriptor in descriptors {
        let target = (
            descriptor.source_uri().to_string(),
            descriptor.destination_path().clone(),
        );

        if let Some((first_key, first_source)) = by_destination.get(descriptor.destination_path()) {
            if first_source == descriptor.source_uri() {
                if first_key != descriptor.key() {
                    warn!(
                        "{} fetches the same asset to {:?} as {first_key}, dropped",
                        descriptor.key(),
                        descriptor.destination_path()
                    );
                }
                continue;
            }
            return Err(ResolutionError::DestinationConflict {
                path: descriptor.destination_path().clone(),
                first: first_key.clone(),
                second: descriptor.key().to_string(),
            });
        }
        if let Some(existing) = by_key.get(descriptor.key()) {
            if *existing != target {
                return Err(ResolutionError::DuplicateKey(descriptor.key().to_string()));
            }
        }

        by_destination.insert(
            descriptor.destination_path().clone(),
            (descriptor.key().to_string(), descriptor.source_uri().to_string()),
        );
        by_key.insert(descriptor.key().to_string(), target);
        unique.push(descriptor);
    }

    Ok(unique)
}

/// Checks the scheme of an href and resolves relative references.
pub fn normalize_href(href: &str, base: Option<&Url>) -> Result<String, ResolutionError> {
    let href = href.trim();
    match Url::parse(href) {
        Ok(url) => {
            // Single letter schemes are Windows drive letters
            if url.scheme().len() == 1 {
                return Ok(href.to_string());
            }
            if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
                return Err(ResolutionError::UnsupportedScheme {
                    scheme: url.scheme().to_string(),
                    href: href.to_string(),
                });
            }
            if url.scheme() == "s3" && url.host_str().map_or(true, str::is_empty) {
                return Err(ResolutionError::InvalidHref {
                    href: href.to_string(),
                    reason: "missing bucket".to_string(),
                });
            }
            Ok(url.to_string())
        }
        Err(url::ParseError::RelativeUrlWithoutBase) => match base {
            Some(base) => base
                .join(href)
                .map(|u| u.to_string())
                .map_err(|e| ResolutionError::InvalidHref {
                    href: href.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(href.to_string()),
        },
        Err(e) => Err(ResolutionError::InvalidHref {
            href: href.to_string(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::PathTemplate;
    use stac::Asset;

    fn item_with_assets(id: &str, assets: &[(&str, &str)]) -> Item {
        let mut item = Item::new(id);
        for (key, href) in assets {
            item.assets.insert(key.to_string(), Asset::new(*href));
        }
        item
    }

    #[test]
    fn test_resolve_single_item() {
        let mut item = item_with_assets(
            "item-1",
            &[
                ("red", "https://example.com/item-1/B04.tif"),
                ("green", "https://example.com/item-1/B03.tif"),
            ],
        );
        item.assets
            .get_mut("red")
            .unwrap()
            .additional_fields
            .insert("file:size".to_string(), serde_json::json!(1024));

        let layout = PathTemplate::with_default_template("/data");
        let descriptors = resolve(&item, &layout, &ResolveOptions::default()).unwrap();

        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].key(), "item-1/green");
        assert_eq!(descriptors[1].key(), "item-1/red");
        assert_eq!(descriptors[1].expected_size(), Some(1024));
        assert_eq!(
            descriptors[1].destination_path(),
            &PathBuf::from("/data/item-1/B04.tif")
        );
    }

    #[test]
    fn test_resolve_filters_asset_keys() {
        let items = vec![
            item_with_assets("a", &[("red", "https://x/a/red.tif"), ("visual", "https://x/a/tci.tif")]),
            item_with_assets("b", &[("red", "https://x/b/red.tif"), ("visual", "https://x/b/tci.tif")]),
        ];
        let layout = PathTemplate::with_default_template("out");
        let options = ResolveOptions::default().with_asset_keys(["visual"]);
        let descriptors = resolve(&items, &layout, &options).unwrap();
        let keys = descriptors.iter().map(|d| d.key()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["a/visual", "b/visual"]);
    }

    #[test]
    fn test_resolve_dedups_repeated_items() {
        let item = item_with_assets("a", &[("red", "https://x/a/red.tif")]);
        let items = vec![item.clone(), item];
        let layout = PathTemplate::with_default_template("out");
        let descriptors = resolve(&items, &layout, &ResolveOptions::default()).unwrap();
        assert_eq!(descriptors.len(), 1);
    }

    #[test]
    fn test_resolve_rejects_destination_conflict() {
        let items = vec![
            item_with_assets("a", &[("red", "https://x/a/B04.tif")]),
            item_with_assets("b", &[("red", "https://x/b/B04.tif")]),
        ];
        // Flat layout drops the item id, so both assets map to out/B04.tif
        let layout = PathTemplate::new("out", "{filename}").unwrap();
        let err = resolve(&items, &layout, &ResolveOptions::default()).unwrap_err();
        assert!(matches!(err, ResolutionError::DestinationConflict { .. }));
    }

    #[test]
    fn test_resolve_rejects_missing_href() {
        let item = item_with_assets("a", &[("red", "  ")]);
        let layout = PathTemplate::with_default_template("out");
        let err = resolve(&item, &layout, &ResolveOptions::default()).unwrap_err();
        assert_eq!(
            err,
            ResolutionError::MissingHref {
                item: "a".to_string(),
                key: "red".to_string()
            }
        );
    }

    #[test]
    fn test_resolve_drops_unusable_checksum() {
        let mut item = item_with_assets("a", &[("red", "https://x/a/red.tif")]);
        item.assets
            .get_mut("red")
            .unwrap()
            .additional_fields
            .insert("file:checksum".to_string(), serde_json::json!("not-hex"));
        let layout = PathTemplate::with_default_template("out");
        let descriptors = resolve(&item, &layout, &ResolveOptions::default()).unwrap();
        assert!(descriptors[0].expected_checksum().is_none());
    }

    #[test]
    fn test_normalize_href() {
        assert!(matches!(
            normalize_href("ftp://example.com/a.tif", None),
            Err(ResolutionError::UnsupportedScheme { .. })
        ));
        assert_eq!(normalize_href("./B04.tif", None).unwrap(), "./B04.tif");
        let base = Url::parse("https://example.com/catalog/item.json").unwrap();
        assert_eq!(
            normalize_href("./B04.tif", Some(&base)).unwrap(),
            "https://example.com/catalog/B04.tif"
        );
        assert_eq!(
            normalize_href("s3://bucket/key.tif", None).unwrap(),
            "s3://bucket/key.tif"
        );
    }

    #[test]
    fn test_dedup_rejects_duplicate_keys() {
        let descriptors = vec![
            AssetDescriptor::new("k", "https://x/1", "out/1"),
            AssetDescriptor::new("k", "https://x/2", "out/2"),
        ];
        assert_eq!(
            dedup(descriptors).unwrap_err(),
            ResolutionError::DuplicateKey("k".to_string())
        );
    }

    #[test]
    fn test_dedup_keeps_first_key_for_shared_target() {
        let descriptors = vec![
            AssetDescriptor::new("first", "https://x/1", "out/1"),
            AssetDescriptor::new("second", "https://x/1", "out/1"),
        ];
        let unique = dedup(descriptors).unwrap();
        assert_eq!(unique.len(), 1);
        assert_eq!(unique[0].key(), "first");
    }
}

//! Mapping of STAC assets to local destination paths.
use crate::error::ResolutionError;
use serde::{Deserialize, Serialize};
use stac::{Asset, Item};
use std::path::{Component, Path, PathBuf};

pub const DEFAULT_TEMPLATE: &str = "{item}/{filename}";

/// Decides where an asset of an item lands on disk.
pub trait Layout {
    fn destination(&self, item: &Item, key: &str, asset: &Asset)
        -> Result<PathBuf, ResolutionError>;
}

impl<F> Layout for F
where
    F: Fn(&Item, &str, &Asset) -> PathBuf,
{
    fn destination(
        &self,
        item: &Item,
        key: &str,
        asset: &Asset,
    ) -> Result<PathBuf, ResolutionError> {
        Ok(self(item, key, asset))
    }
}

/// Template layout rooted at a directory. Supported placeholders are
/// `{collection}`, `{item}`, `{key}` and `{filename}` (last segment of the
/// asset href).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathTemplate {
    root: PathBuf,
    template: String,
}

enum Segment {
    Literal(String),
    Collection,
    Item,
    Key,
    Filename,
}

impl PathTemplate {
    pub fn new(root: impl Into<PathBuf>, template: &str) -> Result<Self, ResolutionError> {
        let layout = Self {
            root: root.into(),
            template: template.to_string(),
        };
        layout.segments()?;
        Ok(layout)
    }

    pub fn with_default_template(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn template_error(&self, reason: impl Into<String>) -> ResolutionError {
        ResolutionError::Template {
            template: self.template.clone(),
            reason: reason.into(),
        }
    }

    fn segments(&self) -> Result<Vec<Segment>, ResolutionError> {
        let mut segments = vec![];
        let mut rest = self.template.as_str();
        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let close = rest[open..]
                .find('}')
                .ok_or_else(|| self.template_error("unclosed '{'"))?;
            let name = &rest[open + 1..open + close];
            let segment = match name {
                "collection" => Segment::Collection,
                "item" => Segment::Item,
                "key" => Segment::Key,
                "filename" => Segment::Filename,
                other => return Err(self.template_error(format!("unknown placeholder '{other}'"))),
            };
            segments.push(segment);
            rest = &rest[open + close + 1..];
        }
        if rest.contains('}') {
            return Err(self.template_error("unmatched '}'"));
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        if segments.is_empty() {
            return Err(self.template_error("empty template"));
        }
        Ok(segments)
    }
}

impl Layout for PathTemplate {
    fn destination(
        &self,
        item: &Item,
        key: &str,
        asset: &Asset,
    ) -> Result<PathBuf, ResolutionError> {
        let mut relative = String::new();
        for segment in self.segments()? {
            match segment {
                Segment::Literal(text) => relative.push_str(&text),
                Segment::Collection => {
                    let collection =
                        item.collection
                            .as_deref()
                            .ok_or_else(|| ResolutionError::MissingCollection {
                                item: item.id.clone(),
                            })?;
                    relative.push_str(collection);
                }
                Segment::Item => relative.push_str(&item.id),
                Segment::Key => relative.push_str(key),
                Segment::Filename => relative.push_str(&file_name(&asset.href, key)),
            }
        }

        // Placeholders are filled from remote metadata, so the result must
        // stay below the root.
        let relative = PathBuf::from(relative);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe || relative.as_os_str().is_empty() {
            return Err(ResolutionError::UnsafePath(relative));
        }
        Ok(self.root.join(relative))
    }
}

/// Last path segment of an href, ignoring query and fragment. Falls back to
/// the asset key when the href ends with a separator.
fn file_name(href: &str, key: &str) -> String {
    let path = href.split(['?', '#']).next().unwrap_or(href);
    match path.rsplit(['/', '\\']).next() {
        Some(name) if !name.is_empty() && name != ".." && name != "." => name.to_string(),
        _ => key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(collection: Option<&str>) -> Item {
        let mut item = Item::new("S2A_T08VPH_20240504T195929_L2A");
        item.collection = collection.map(String::from);
        item
    }

    #[test]
    fn test_default_template() {
        let layout = PathTemplate::with_default_template("/data");
        let asset = Asset::new("https://example.com/tiles/B04.tif?token=abc");
        let path = layout.destination(&item(None), "red", &asset).unwrap();
        assert_eq!(
            path,
            PathBuf::from("/data/S2A_T08VPH_20240504T195929_L2A/B04.tif")
        );
    }

    #[test]
    fn test_all_placeholders() {
        let layout = PathTemplate::new("out", "{collection}/{item}/{key}-{filename}").unwrap();
        let asset = Asset::new("s3://bucket/path/visual.tif");
        let path = layout
            .destination(&item(Some("sentinel-2-c1-l2a")), "visual", &asset)
            .unwrap();
        assert_eq!(
            path,
            PathBuf::from("out/sentinel-2-c1-l2a/S2A_T08VPH_20240504T195929_L2A/visual-visual.tif")
        );
    }

    #[test]
    fn test_missing_collection() {
        let layout = PathTemplate::new("out", "{collection}/{filename}").unwrap();
        let asset = Asset::new("https://example.com/a.tif");
        let err = layout.destination(&item(None), "a", &asset).unwrap_err();
        assert!(matches!(err, ResolutionError::MissingCollection { .. }));
    }

    #[test]
    fn test_invalid_templates() {
        assert!(PathTemplate::new("out", "{item}/{band}").is_err());
        assert!(PathTemplate::new("out", "{item").is_err());
        assert!(PathTemplate::new("out", "item}").is_err());
        assert!(PathTemplate::new("out", "").is_err());
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let layout = PathTemplate::new("out", "{item}/{filename}").unwrap();
        let asset = Asset::new("https://example.com/a.tif");
        let escaping = Item::new("..");
        let err = layout.destination(&escaping, "a", &asset).unwrap_err();
        assert!(matches!(err, ResolutionError::UnsafePath(_)));
    }

    #[test]
    fn test_filename_falls_back_to_key() {
        assert_eq!(file_name("https://example.com/dir/", "thumbnail"), "thumbnail");
        assert_eq!(file_name("relative/B02.jp2", "blue"), "B02.jp2");
    }

    #[test]
    fn test_closure_layout() {
        let layout = |item: &Item, key: &str, _: &Asset| PathBuf::from(format!("{}_{key}", item.id));
        let asset = Asset::new("https://example.com/a.tif");
        let path = layout.destination(&Item::new("x"), "red", &asset).unwrap();
        assert_eq!(path, PathBuf::from("x_red"));
    }
}

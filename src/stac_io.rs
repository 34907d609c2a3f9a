//! Reading and writing STAC JSON from local paths or HTTP(S) hrefs.
use anyhow::{anyhow, bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde::Serialize;
use stac::{Item, ItemCollection};
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Href {
    Local(PathBuf),
    Remote(Url),
}

impl Href {
    pub fn parse(href: &str) -> Result<Self> {
        match Url::parse(href) {
            Ok(url) if url.scheme().len() == 1 => Ok(Self::Local(PathBuf::from(href))),
            Ok(url) => match url.scheme() {
                "http" | "https" => Ok(Self::Remote(url)),
                "file" => url
                    .to_file_path()
                    .map(Self::Local)
                    .map_err(|_| anyhow!("Invalid file url: {href}")),
                scheme => bail!("Invalid scheme: {scheme} for href: {href}"),
            },
            Err(url::ParseError::RelativeUrlWithoutBase) => Ok(Self::Local(PathBuf::from(href))),
            Err(e) => Err(anyhow!("Invalid href {href}: {e}")),
        }
    }
}

/// STAC IO with headers and query parameters applied to every remote read.
#[derive(Debug, Clone, Default)]
pub struct StacIo {
    client: reqwest::Client,
    headers: HeaderMap,
    params: Vec<(String, String)>,
}

impl StacIo {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        self.headers.insert(
            HeaderName::from_bytes(name.as_bytes())?,
            HeaderValue::from_str(value)?,
        );
        Ok(self)
    }

    pub fn with_param(mut self, name: &str, value: &str) -> Self {
        self.params.push((name.to_string(), value.to_string()));
        self
    }

    pub async fn read_text(&self, href: &str) -> Result<String> {
        match Href::parse(href)? {
            Href::Local(path) => tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Could not read {path:?}")),
            Href::Remote(url) => {
                let response = self
                    .client
                    .get(url)
                    .headers(self.headers.clone())
                    .query(&self.params)
                    .send()
                    .await?;
                let response = response
                    .error_for_status()
                    .with_context(|| format!("Could not read uri {href}"))?;
                Ok(response.text().await?)
            }
        }
    }

    pub async fn read_json<T: DeserializeOwned>(&self, href: &str) -> Result<T> {
        let text = self.read_text(href).await?;
        serde_json::from_str(&text).with_context(|| format!("Invalid JSON at {href}"))
    }

    pub async fn read_item(&self, href: &str) -> Result<Item> {
        self.read_json(href).await
    }

    pub async fn read_item_collection(&self, href: &str) -> Result<ItemCollection> {
        self.read_json(href).await
    }

    /// Writes text to a local path, creating parent directories. Remote
    /// writes are not supported.
    pub async fn write_text(&self, href: &str, text: &str) -> Result<()> {
        match Href::parse(href)? {
            Href::Local(path) => write_local(&path, text).await,
            Href::Remote(_) => bail!("Writing to remote files is not supported: {href}"),
        }
    }

    pub async fn save_json<T: Serialize>(&self, href: &str, value: &T) -> Result<()> {
        let text = serde_json::to_string_pretty(value)?;
        self.write_text(href, &text).await
    }
}

async fn write_local(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, text)
        .await
        .with_context(|| format!("Could not write {path:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hrefs() {
        assert_eq!(
            Href::parse("catalog/item.json").unwrap(),
            Href::Local(PathBuf::from("catalog/item.json"))
        );
        assert!(matches!(
            Href::parse("https://earth-search.aws.element84.com/v1").unwrap(),
            Href::Remote(_)
        ));
        assert!(Href::parse("s3://bucket/item.json").is_err());
    }

    #[tokio::test]
    async fn test_item_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/item.json");
        let href = path.to_str().unwrap();
        let io = StacIo::default();

        let item = Item::new("S2A_T08VPH_20240504T195929_L2A");
        io.save_json(href, &item).await.unwrap();
        let read = io.read_item(href).await.unwrap();
        assert_eq!(read.id, item.id);
    }

    #[tokio::test]
    async fn test_remote_write_is_rejected() {
        let io = StacIo::default();
        assert!(io
            .write_text("https://example.com/item.json", "{}")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let io = StacIo::default();
        assert!(io.read_text("/definitely/not/here.json").await.is_err());
    }
}

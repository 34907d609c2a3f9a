//! Byte streams for the locations an asset href can point at.
use crate::error::FetchError;
use aws_sdk_s3::error::DisplayErrorContext;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::path::PathBuf;
use tokio_util::io::ReaderStream;
use url::Url;

pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// Host key shared by every local file source.
pub const LOCAL_HOST: &str = "file";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Http(Url),
    S3 { bucket: String, key: String },
    Local(PathBuf),
}

/// An opened source: the body plus its length when the remote announced it.
pub struct Opened {
    pub length: Option<u64>,
    pub body: ByteStream,
}

impl Source {
    pub fn parse(uri: &str) -> Result<Self, FetchError> {
        let url = match Url::parse(uri) {
            Ok(url) if url.scheme().len() > 1 => url,
            _ => return Ok(Self::Local(PathBuf::from(uri))),
        };
        match url.scheme() {
            "http" | "https" => Ok(Self::Http(url)),
            "s3" => {
                let bucket = url.host_str().unwrap_or_default().to_string();
                let key = url.path().trim_start_matches('/').to_string();
                if bucket.is_empty() || key.is_empty() {
                    return Err(FetchError::ClientRequest {
                        uri: uri.to_string(),
                        message: "s3 href needs a bucket and a key".to_string(),
                    });
                }
                Ok(Self::S3 { bucket, key })
            }
            "file" => url
                .to_file_path()
                .map(Self::Local)
                .map_err(|_| FetchError::ClientRequest {
                    uri: uri.to_string(),
                    message: "not a valid file url".to_string(),
                }),
            scheme => Err(FetchError::ClientRequest {
                uri: uri.to_string(),
                message: format!("unsupported scheme '{scheme}'"),
            }),
        }
    }

    /// Key used for per-host concurrency limits: the URL authority, the
    /// bucket for S3 and one shared key for local files.
    pub fn host(&self) -> String {
        match self {
            Self::Http(url) => match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => format!("{host}:{port}"),
                (Some(host), None) => host.to_string(),
                _ => String::new(),
            },
            Self::S3 { bucket, .. } => format!("s3://{bucket}"),
            Self::Local(_) => LOCAL_HOST.to_string(),
        }
    }

    pub async fn open(
        &self,
        uri: &str,
        http: &reqwest::Client,
        s3: Option<&aws_sdk_s3::Client>,
    ) -> Result<Opened, FetchError> {
        match self {
            Self::Http(url) => open_http(uri, url, http).await,
            Self::S3 { bucket, key } => {
                let client = s3.ok_or_else(|| FetchError::ClientRequest {
                    uri: uri.to_string(),
                    message: "no S3 client configured".to_string(),
                })?;
                open_s3(uri, client, bucket, key).await
            }
            Self::Local(path) => open_local(uri, path).await,
        }
    }
}

async fn open_http(uri: &str, url: &Url, client: &reqwest::Client) -> Result<Opened, FetchError> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| FetchError::from_reqwest(uri, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::from_status(uri, status.as_u16()));
    }

    let length = response.content_length();
    let owned_uri = uri.to_string();
    let body = response
        .bytes_stream()
        .map(move |chunk| chunk.map_err(|e| FetchError::from_reqwest(&owned_uri, e)))
        .boxed();
    Ok(Opened { length, body })
}

async fn open_s3(
    uri: &str,
    client: &aws_sdk_s3::Client,
    bucket: &str,
    key: &str,
) -> Result<Opened, FetchError> {
    let object = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|e| {
            let message = DisplayErrorContext(&e).to_string();
            match e.raw_response().map(|r| r.status().as_u16()) {
                Some(status) if !(200..300).contains(&status) => {
                    let mut err = FetchError::from_status(uri, status);
                    if let FetchError::Transport { message: m, .. }
                    | FetchError::ClientRequest { message: m, .. } = &mut err
                    {
                        *m = message;
                    }
                    err
                }
                _ => FetchError::Transport {
                    uri: uri.to_string(),
                    message,
                },
            }
        })?;

    let length = object.content_length().and_then(|l| u64::try_from(l).ok());
    let owned_uri = uri.to_string();
    let body = stream::unfold(Some(object.body), move |body| {
        let uri = owned_uri.clone();
        async move {
            let mut body = body?;
            match body.try_next().await {
                Ok(Some(bytes)) => Some((Ok(bytes), Some(body))),
                Ok(None) => None,
                Err(e) => Some((
                    Err(FetchError::Transport {
                        uri,
                        message: e.to_string(),
                    }),
                    None,
                )),
            }
        }
    })
    .boxed();
    Ok(Opened { length, body })
}

async fn open_local(uri: &str, path: &PathBuf) -> Result<Opened, FetchError> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(FetchError::ClientRequest {
                uri: uri.to_string(),
                message: "file not found".to_string(),
            })
        }
        Err(e) => return Err(FetchError::io(path, e)),
    };
    let length = file.metadata().await.ok().map(|m| m.len());
    let owned_path = path.clone();
    let body = ReaderStream::new(file)
        .map(move |chunk| chunk.map_err(|e| FetchError::io(&owned_path, e)))
        .boxed();
    Ok(Opened { length, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sources() {
        assert_eq!(
            Source::parse("s3://sentinel-cogs/tiles/B04.tif").unwrap(),
            Source::S3 {
                bucket: "sentinel-cogs".to_string(),
                key: "tiles/B04.tif".to_string()
            }
        );
        assert_eq!(
            Source::parse("data/B04.tif").unwrap(),
            Source::Local(PathBuf::from("data/B04.tif"))
        );
        assert!(matches!(
            Source::parse("https://example.com/B04.tif").unwrap(),
            Source::Http(_)
        ));
        assert!(Source::parse("s3://bucket-only").is_err());
        assert!(Source::parse("ftp://example.com/a").is_err());
    }

    #[test]
    fn test_host_keys() {
        let http = Source::parse("http://127.0.0.1:8080/a").unwrap();
        assert_eq!(http.host(), "127.0.0.1:8080");
        let https = Source::parse("https://example.com/a").unwrap();
        assert_eq!(https.host(), "example.com");
        let s3 = Source::parse("s3://bucket/a").unwrap();
        assert_eq!(s3.host(), "s3://bucket");
        assert_eq!(Source::parse("/tmp/a").unwrap().host(), LOCAL_HOST);
    }

    #[tokio::test]
    async fn test_open_missing_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.tif");
        let uri = path.to_str().unwrap().to_string();
        let source = Source::parse(&uri).unwrap();
        let err = match source.open(&uri, &reqwest::Client::new(), None).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.kind(), crate::error::ErrorKind::ClientRequest);
    }
}

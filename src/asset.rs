use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use stac::Asset;
use std::fmt;
use std::path::PathBuf;

const FILE_CHECKSUM: &str = "file:checksum";
const FILE_SIZE: &str = "file:size";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    /// Multihash function code and digest length.
    fn multihash_header(self) -> (u8, u8) {
        match self {
            Self::Sha256 => (0x12, 32),
            Self::Sha512 => (0x13, 64),
        }
    }

    pub fn hasher(self) -> StreamHasher {
        match self {
            Self::Sha256 => StreamHasher::Sha256(Sha256::new()),
            Self::Sha512 => StreamHasher::Sha512(Sha512::new()),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => f.write_str("sha2-256"),
            Self::Sha512 => f.write_str("sha2-512"),
        }
    }
}

/// Expected digest of an asset, lowercase hex without the multihash prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawChecksum")]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub digest: String,
}

/// Checksum as written in plan files, validated through [`Checksum::new`].
#[derive(Deserialize)]
struct RawChecksum {
    algorithm: ChecksumAlgorithm,
    digest: String,
}

impl TryFrom<RawChecksum> for Checksum {
    type Error = anyhow::Error;

    fn try_from(raw: RawChecksum) -> Result<Self> {
        Self::new(raw.algorithm, &raw.digest)
    }
}

impl Checksum {
    pub fn new(algorithm: ChecksumAlgorithm, digest: &str) -> Result<Self> {
        let digest = digest.to_ascii_lowercase();
        let (_, len) = algorithm.multihash_header();
        let bytes = hex::decode(&digest)?;
        if bytes.len() != len as usize {
            bail!(
                "{algorithm} digest must be {len} bytes, got {}",
                bytes.len()
            );
        }
        Ok(Self { algorithm, digest })
    }

    /// Parses the hex multihash used by the STAC file extension, e.g.
    /// `1220<64 hex chars>` for sha2-256.
    pub fn from_multihash(value: &str) -> Result<Self> {
        let bytes = hex::decode(value.trim())?;
        if bytes.len() < 2 {
            bail!("multihash too short: {value}");
        }
        let algorithm = match bytes[0] {
            0x12 => ChecksumAlgorithm::Sha256,
            0x13 => ChecksumAlgorithm::Sha512,
            code => bail!("unsupported multihash function 0x{code:02x}"),
        };
        let (_, len) = algorithm.multihash_header();
        if bytes[1] != len || bytes.len() != 2 + len as usize {
            bail!("malformed {algorithm} multihash: {value}");
        }
        Ok(Self {
            algorithm,
            digest: hex::encode(&bytes[2..]),
        })
    }

    pub fn to_multihash(&self) -> String {
        let (code, len) = self.algorithm.multihash_header();
        format!("{code:02x}{len:02x}{}", self.digest)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.digest)
    }
}

/// Incremental digest fed chunk by chunk while streaming.
pub enum StreamHasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl StreamHasher {
    pub fn update(&mut self, chunk: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(chunk),
            Self::Sha512(h) => h.update(chunk),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// One asset to fetch: where it comes from, where it goes, and what it
/// should look like once it is there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    key: String,
    source_uri: String,
    destination_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expected_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expected_checksum: Option<Checksum>,
}

impl AssetDescriptor {
    pub fn new(
        key: impl Into<String>,
        source_uri: impl Into<String>,
        destination_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            key: key.into(),
            source_uri: source_uri.into(),
            destination_path: destination_path.into(),
            expected_size: None,
            expected_checksum: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn with_checksum(mut self, checksum: Checksum) -> Self {
        self.expected_checksum = Some(checksum);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn source_uri(&self) -> &str {
        &self.source_uri
    }

    pub fn destination_path(&self) -> &PathBuf {
        &self.destination_path
    }

    pub fn expected_size(&self) -> Option<u64> {
        self.expected_size
    }

    pub fn expected_checksum(&self) -> Option<&Checksum> {
        self.expected_checksum.as_ref()
    }
}

/// Reads the `file:size` field of an asset.
pub fn extract_file_size(asset: &Asset) -> Option<u64> {
    asset.additional_fields.get(FILE_SIZE)?.as_u64()
}

/// Reads the `file:checksum` field of an asset. A present but unusable
/// value is an error so the caller can decide whether to drop it.
pub fn extract_checksum(asset: &Asset) -> Result<Option<Checksum>> {
    let Some(value) = asset.additional_fields.get(FILE_CHECKSUM) else {
        return Ok(None);
    };
    let value = value
        .as_str()
        .ok_or(anyhow!("{FILE_CHECKSUM} is not a string"))?;
    Ok(Some(Checksum::from_multihash(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("hello world")
    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_multihash_sha256() {
        let value = format!("1220{HELLO_SHA256}");
        let checksum = Checksum::from_multihash(&value).unwrap();
        assert_eq!(checksum.algorithm, ChecksumAlgorithm::Sha256);
        assert_eq!(checksum.digest, HELLO_SHA256);
        assert_eq!(checksum.to_multihash(), value);
    }

    #[test]
    fn test_deserialize_validates_digest() {
        let upper = format!(
            r#"{{"algorithm": "sha256", "digest": "{}"}}"#,
            HELLO_SHA256.to_ascii_uppercase()
        );
        let checksum: Checksum = serde_json::from_str(&upper).unwrap();
        assert_eq!(checksum.digest, HELLO_SHA256);

        let short = r#"{"algorithm": "sha256", "digest": "b94d27b9"}"#;
        assert!(serde_json::from_str::<Checksum>(short).is_err());
        let not_hex = r#"{"algorithm": "sha512", "digest": "xyz"}"#;
        assert!(serde_json::from_str::<Checksum>(not_hex).is_err());
    }

    #[test]
    fn test_multihash_rejects_unknown_function() {
        // md5 multihash
        let value = "d50110b10a8db164e0754105b7a99be72e3fe5";
        assert!(Checksum::from_multihash(value).is_err());
    }

    #[test]
    fn test_multihash_rejects_bad_length() {
        let value = format!("1210{}", &HELLO_SHA256[..32]);
        assert!(Checksum::from_multihash(&value).is_err());
    }

    #[test]
    fn test_stream_hasher() {
        let mut hasher = ChecksumAlgorithm::Sha256.hasher();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize_hex(), HELLO_SHA256);
    }

    #[test]
    fn test_extract_file_fields() {
        let mut asset = Asset::new("https://example.com/b04.tif");
        assert_eq!(extract_file_size(&asset), None);
        assert!(extract_checksum(&asset).unwrap().is_none());

        asset
            .additional_fields
            .insert(FILE_SIZE.to_string(), serde_json::json!(11));
        asset.additional_fields.insert(
            FILE_CHECKSUM.to_string(),
            serde_json::json!(format!("1220{HELLO_SHA256}")),
        );
        assert_eq!(extract_file_size(&asset), Some(11));
        let checksum = extract_checksum(&asset).unwrap().unwrap();
        assert_eq!(checksum.digest, HELLO_SHA256);
    }

    #[test]
    fn test_checksum_new_validates_length() {
        assert!(Checksum::new(ChecksumAlgorithm::Sha256, HELLO_SHA256).is_ok());
        assert!(Checksum::new(ChecksumAlgorithm::Sha512, HELLO_SHA256).is_err());
        assert!(Checksum::new(ChecksumAlgorithm::Sha256, "zz").is_err());
    }
}

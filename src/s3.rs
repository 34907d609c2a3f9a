//! Utility functions for creating s3 clients
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::Client;

pub const DEFAULT_REGION: &str = "us-east-1";

/// Client using the credentials of a named AWS profile.
pub async fn client_from_profile(profile_name: &str, region: Option<&str>) -> Client {
    let base_config = aws_config::defaults(BehaviorVersion::latest())
        .profile_name(profile_name)
        .load()
        .await;

    let s3_config = aws_sdk_s3::config::Builder::from(&base_config)
        .region(Region::new(region.unwrap_or(DEFAULT_REGION).to_string()))
        .force_path_style(true)
        .build();

    Client::from_conf(s3_config)
}

/// Unsigned client for public buckets.
pub async fn anon_client(region: Option<&str>) -> Client {
    let region = Region::new(region.unwrap_or(DEFAULT_REGION).to_string());
    let config = aws_config::defaults(BehaviorVersion::latest())
        .no_credentials()
        .region(region)
        .load()
        .await;
    Client::new(&config)
}

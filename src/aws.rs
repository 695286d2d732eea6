use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::Client;
use aws_types::region::Region;
use log::debug;

use crate::config::R2Config;

/// Builds an S3 client for the R2 endpoint with static credentials.
/// Construction is offline; nothing is contacted until the first request.
pub fn s3_client(config: &R2Config) -> Client {
    debug!(
        "Creating S3 client for bucket {} at {}",
        config.bucket, config.endpoint_url
    );

    let credentials = Credentials::new(
        &config.access_key_id,
        &config.secret_access_key,
        None,
        None,
        "r2",
    );

    let sdk_config = aws_sdk_s3::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new(config.region.clone()))
        .endpoint_url(&config.endpoint_url)
        .credentials_provider(credentials)
        .force_path_style(true)
        .build();

    Client::from_conf(sdk_config)
}

/// Full error chain of an SDK error, which `Display` alone truncates.
pub fn display_error<E: std::error::Error>(err: &E) -> String {
    DisplayErrorContext(err).to_string()
}

use anyhow::Result;
use config::Config;

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResolverConfig {
    pub listen_address: String,

    /// Space-separated list of peer multiaddrs, added to the built-in seed
    pub peer_addresses: String,

    pub handle_topic: String,

    /// Per-peer disconnect timeout during the reconnect step, in seconds
    pub disconnect_timeout: u64,

    /// Per-block fetch timeout in seconds; 0 waits forever
    pub block_timeout: u64,

    /// Whether resolved artifacts must carry a valid release signature
    #[serde(default)]
    pub trust_policy: TrustPolicyConfig,

    /// Hex-encoded ed25519 release public key, required when the trust
    /// policy is "signed"
    #[serde(default)]
    pub release_key: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrustPolicyConfig {
    #[default]
    Any,
    Signed,
}

impl ResolverConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        Ok(full_config.try_deserialize()?)
    }
}

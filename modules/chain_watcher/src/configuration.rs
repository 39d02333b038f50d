use anyhow::Result;
use config::Config;

// Query window determines the block range of each log query.
//
// - Full: query all history every poll, as the original deployments did.
// - Cursor: query from the block after the last processed height, which
//   keeps responses small on long-lived deployments.
#[derive(Clone, Copy, Debug, Default, serde::Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum QueryWindow {
    #[default]
    Full,
    Cursor,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WatcherConfig {
    pub rpc_url: String,
    pub contract_address: String,
    pub publish_topic: String,
    pub poll_interval: u64,
    pub collapse_batches: bool,
    #[serde(default)]
    pub query_window: QueryWindow,
}

impl WatcherConfig {
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

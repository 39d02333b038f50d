//! Talos chain watcher module for Caryatid
//! Polls an EVM JSON-RPC endpoint for governance vote events and publishes
//! them on the message bus, deduplicated by block height

mod abi;
mod configuration;

use std::{str::FromStr, sync::Arc, time::Duration};

use alloy::{
    primitives::{keccak256, Address, B256},
    providers::{Provider, ProviderBuilder},
    rpc::types::Filter,
};
use anyhow::{Context as _, Result};
use caryatid_sdk::{module, Context, Module};
use config::Config;
use talos_common::messages::{Message, VoteEventMessage};
use tokio::time::{interval, sleep};
use tracing::{error, info, warn};

use crate::configuration::{QueryWindow, WatcherConfig};

/// The one event signature we watch for
const EVENT_SIGNATURE: &str = "VoteCastWithParams(address,uint256,uint8,uint256,string,bytes)";

/// Maximum retry backoff after a failed log query, in seconds
const MAX_BACKOFF: u64 = 60;

/// Chain watcher module
#[module(
    message_type(Message),
    name = "chain-watcher",
    description = "Governance vote event monitor"
)]
pub struct ChainWatcher;

impl ChainWatcher {
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let cfg = WatcherConfig::try_load(&config)?;
        let contract = Address::from_str(&cfg.contract_address)
            .context("invalid contract-address in configuration")?;
        let topic0 = B256::from(keccak256(EVENT_SIGNATURE.as_bytes()));

        let provider = ProviderBuilder::new().on_http(cfg.rpc_url.parse()?);

        // Dial failure is fatal at startup
        let height = provider.get_block_number().await.with_context(|| {
            format!("could not reach RPC endpoint at {}", cfg.rpc_url)
        })?;
        info!("Connected to {}, chain head at block {height}", cfg.rpc_url);

        context.clone().run(async move {
            let mut last_height: u64 = 0;
            let mut backoff: u64 = 1;
            let mut ticker = interval(Duration::from_secs(cfg.poll_interval));

            loop {
                ticker.tick().await;

                let mut filter = Filter::new().address(contract).event_signature(topic0);
                if cfg.query_window == QueryWindow::Cursor && last_height > 0 {
                    filter = filter.from_block(last_height + 1);
                }

                let logs = match provider.get_logs(&filter).await {
                    Ok(logs) => {
                        backoff = 1;
                        logs
                    }
                    Err(e) => {
                        // A transient query failure must not kill a
                        // long-running daemon, so retry with backoff
                        warn!("log query failed: {e:#}");
                        info!("Will retry in {backoff}s");
                        sleep(Duration::from_secs(backoff)).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                        continue;
                    }
                };

                let candidates: Vec<(u64, Vec<u8>)> = logs
                    .iter()
                    .filter_map(|log| {
                        log.block_number.map(|h| (h, log.data().data.to_vec()))
                    })
                    .collect();

                for (height, data) in
                    select_qualifying(candidates, last_height, cfg.collapse_batches)
                {
                    let decoded = match abi::decode_vote_cast(&data) {
                        Ok(decoded) => decoded,
                        Err(e) => {
                            // Fail fast: a decode failure means the contract
                            // does not match our schema, retrying is useless
                            error!("could not decode vote event at height {height}: {e}");
                            error!("stopping chain watcher: incompatible contract");
                            return;
                        }
                    };

                    info!(height, "Found a new vote event");
                    last_height = height;

                    let message = VoteEventMessage {
                        block_height: height,
                        proposal_id: decoded.proposal_id,
                        support: decoded.support,
                        weight: decoded.weight,
                        reason: decoded.reason,
                        params: decoded.params,
                    };
                    context
                        .publish(&cfg.publish_topic, Arc::new(Message::VoteCast(message)))
                        .await
                        .unwrap_or_else(|e| error!("Failed to publish vote event: {e}"));
                }
            }
        });

        Ok(())
    }
}

/// Select the log entries to act on from one poll result.
///
/// Only entries above `last_height` qualify. With `collapse` set, just the
/// single highest entry is returned, reproducing the original behaviour of
/// dropping intermediate proposals that arrive within one polling interval.
fn select_qualifying(
    mut candidates: Vec<(u64, Vec<u8>)>,
    last_height: u64,
    collapse: bool,
) -> Vec<(u64, Vec<u8>)> {
    candidates.retain(|(height, _)| *height > last_height);
    candidates.sort_by_key(|(height, _)| *height);
    if collapse && candidates.len() > 1 {
        candidates.drain(..candidates.len() - 1);
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(height: u64) -> (u64, Vec<u8>) {
        (height, height.to_be_bytes().to_vec())
    }

    #[test]
    fn ignores_entries_at_or_below_last_height() {
        let picked = select_qualifying(vec![entry(98), entry(99), entry(100)], 100, true);
        assert!(picked.is_empty());
    }

    #[test]
    fn collapses_to_highest_entry() {
        let picked = select_qualifying(vec![entry(101), entry(103), entry(102)], 100, true);
        assert_eq!(picked, vec![entry(103)]);
    }

    #[test]
    fn emits_all_qualifying_in_order_when_not_collapsing() {
        let picked = select_qualifying(vec![entry(103), entry(101), entry(102)], 101, false);
        assert_eq!(picked, vec![entry(102), entry(103)]);
    }

    #[test]
    fn height_is_emitted_at_most_once_across_polls() {
        // The same poll result twice: the second pass must yield nothing
        // once last_height has advanced to the emitted entry
        let logs = vec![entry(101), entry(105)];
        let first = select_qualifying(logs.clone(), 0, true);
        assert_eq!(first, vec![entry(105)]);
        let second = select_qualifying(logs, 105, true);
        assert!(second.is_empty());
    }
}

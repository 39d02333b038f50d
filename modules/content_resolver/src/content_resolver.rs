//! Talos content resolver module.
//!
//! Serves artifact queries from the message bus: a query names a content
//! address, the resolver fetches the content from the peer swarm, checks it
//! against the trust policy and answers with the artifact bytes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use caryatid_sdk::{module, Context, Module};
use config::Config;
use talos_common::messages::{ArtifactMessage, ArtifactQueryResponse, Message};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

mod configuration;
mod connection;
mod dag;
mod network;
mod peers;
mod resolver;
mod store;
mod trust;
mod wire;

use configuration::{ResolverConfig, TrustPolicyConfig};
use peers::PeerAddr;
use resolver::Resolver;
use trust::TrustPolicy;

/// Bootstrap peer, always dialled alongside the configured list
const SEED_PEER: &str = "/ip4/45.32.243.35/tcp/4001";

/// Content resolver module
#[module(
    message_type(Message),
    name = "content-resolver",
    description = "Swarm content resolver for deployment artifacts"
)]
pub struct ContentResolver;

impl ContentResolver {
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let cfg = ResolverConfig::try_load(&config)?;

        let policy = match cfg.trust_policy {
            TrustPolicyConfig::Any => {
                warn!("trust policy 'any': artifacts are not signature-checked");
                TrustPolicy::Any
            }
            TrustPolicyConfig::Signed => TrustPolicy::signed_from_hex(&cfg.release_key)?,
        };

        let mut peers = vec![PeerAddr::parse(SEED_PEER)?];
        for text in cfg.peer_addresses.split_whitespace() {
            match PeerAddr::parse(text) {
                Ok(addr) => peers.push(addr),
                Err(err) => warn!("ignoring peer address '{text}': {err}"),
            }
        }
        let peer_count = peers.len();

        let resolver = Resolver::start(
            &cfg.listen_address,
            peers,
            Duration::from_secs(cfg.disconnect_timeout),
            Duration::from_secs(cfg.block_timeout),
        )
        .await?;
        info!(
            "swarm identity {} listening on {}",
            resolver.local_id(),
            resolver.listen_addr()
        );

        match resolver.reconnect().await {
            Ok(connected) => info!("connected to {connected} of {peer_count} peers"),
            Err(err) => warn!("initial peer connection failed: {err}"),
        }

        // One resolution at a time: a reconnect mid-fetch would tear down
        // another resolution's connections
        let resolver = Arc::new(Mutex::new(resolver));

        context.handle(&cfg.handle_topic, move |message: Arc<Message>| {
            let resolver = resolver.clone();
            let policy = policy.clone();
            async move {
                let response = match message.as_ref() {
                    Message::ArtifactQuery(query) => {
                        let resolver = resolver.lock().await;
                        handle_query(&resolver, &policy, &query.cid).await
                    }
                    _ => {
                        error!("unexpected message on artifact query topic");
                        ArtifactQueryResponse::Error("unexpected message type".to_string())
                    }
                };
                Arc::new(Message::ArtifactQueryResponse(response))
            }
        });

        Ok(())
    }
}

async fn handle_query(
    resolver: &Resolver,
    policy: &TrustPolicy,
    cid: &str,
) -> ArtifactQueryResponse {
    info!("resolving artifact {cid}");
    match resolver.resolve(cid).await {
        Ok(bytes) => match policy.admit(&bytes) {
            Ok(payload) => {
                info!("resolved artifact {cid}: {} bytes", payload.len());
                ArtifactQueryResponse::Artifact(ArtifactMessage {
                    cid: cid.to_string(),
                    bytes: payload.to_vec(),
                })
            }
            Err(err) => {
                error!("artifact {cid} failed the trust policy: {err}");
                ArtifactQueryResponse::Error(format!("artifact rejected: {err}"))
            }
        },
        Err(err) => {
            error!("resolution of {cid} failed: {err}");
            ArtifactQueryResponse::Error(err.to_string())
        }
    }
}

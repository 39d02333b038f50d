//! Talos update orchestrator module.
//!
//! Drives the update cycle: a governance vote names an artifact, the
//! artifact is resolved from the swarm, and the result is handed to the
//! process supervisor for deployment. One vote is processed at a time;
//! votes published while a cycle is in flight queue up on the subscription.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use caryatid_sdk::{module, Context, Module};
use config::Config;
use talos_common::messages::{
    ArtifactQueryMessage, ArtifactQueryResponse, DeployCommandMessage, DeployResponse, Message,
    VoteEventMessage,
};
use tracing::{error, info, warn};

const DEFAULT_SUBSCRIBE_TOPIC: &str = "talos.governance.vote";
const DEFAULT_RESOLVE_TOPIC: &str = "talos.artifact.resolve";
const DEFAULT_DEPLOY_TOPIC: &str = "talos.process.deploy";

/// Where the orchestrator is in the current update cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    WaitingForEvent,
    Resolving,
    Deploying,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WaitingForEvent => f.write_str("waiting for event"),
            Self::Resolving => f.write_str("resolving"),
            Self::Deploying => f.write_str("deploying"),
        }
    }
}

/// Update orchestrator module
#[module(
    message_type(Message),
    name = "update-orchestrator",
    description = "Orchestrates vote events into artifact deployments"
)]
pub struct UpdateOrchestrator;

impl UpdateOrchestrator {
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let subscribe_topic = config
            .get_string("subscribe-topic")
            .unwrap_or(DEFAULT_SUBSCRIBE_TOPIC.to_string());
        let resolve_topic = config
            .get_string("resolve-topic")
            .unwrap_or(DEFAULT_RESOLVE_TOPIC.to_string());
        let deploy_topic = config
            .get_string("deploy-topic")
            .unwrap_or(DEFAULT_DEPLOY_TOPIC.to_string());

        let mut subscription = context.subscribe(&subscribe_topic).await?;
        context.clone().run(async move {
            let mut phase = Phase::WaitingForEvent;
            loop {
                let Ok((_, message)) = subscription.read().await else {
                    error!("vote subscription lost, stopping orchestrator");
                    return;
                };
                let Message::VoteCast(event) = message.as_ref() else {
                    warn!("unexpected message on vote topic, ignored");
                    continue;
                };

                run_cycle(&context, event, &resolve_topic, &deploy_topic, &mut phase).await;
                phase = Phase::WaitingForEvent;
            }
        });

        Ok(())
    }
}

/// One full update cycle for a single vote event
async fn run_cycle(
    context: &Arc<Context<Message>>,
    event: &VoteEventMessage,
    resolve_topic: &str,
    deploy_topic: &str,
    phase: &mut Phase,
) {
    info!(
        "vote at height {} on proposal {}, support {}",
        event.block_height, event.proposal_id, event.support
    );
    let Some(cid) = candidate_cid(event) else {
        warn!("vote params do not name an artifact, staying in phase '{phase}'");
        return;
    };

    *phase = Phase::Resolving;
    info!("phase '{phase}': artifact {cid}");
    let query = Arc::new(Message::ArtifactQuery(ArtifactQueryMessage {
        cid: cid.clone(),
    }));
    let response = match context.message_bus.request(resolve_topic, query).await {
        Ok(response) => response,
        Err(err) => {
            error!("artifact query failed: {err}");
            return;
        }
    };
    let artifact = match response.as_ref() {
        Message::ArtifactQueryResponse(ArtifactQueryResponse::Artifact(artifact)) => {
            artifact.clone()
        }
        Message::ArtifactQueryResponse(ArtifactQueryResponse::Error(err)) => {
            error!("artifact {cid} could not be resolved: {err}");
            return;
        }
        _ => {
            error!("unexpected response to artifact query");
            return;
        }
    };

    *phase = Phase::Deploying;
    info!("phase '{phase}': {} bytes", artifact.bytes.len());
    let command = Arc::new(Message::Deploy(DeployCommandMessage {
        cid,
        bytes: artifact.bytes,
    }));
    match context.message_bus.request(deploy_topic, command).await {
        Ok(response) => match response.as_ref() {
            Message::DeployResponse(DeployResponse::Deployed(deployed)) => {
                info!("deployed {} with pid {:?}", deployed.path, deployed.pid);
            }
            Message::DeployResponse(DeployResponse::Error(err)) => {
                error!("deployment failed: {err}");
            }
            _ => error!("unexpected response to deploy command"),
        },
        Err(err) => error!("deploy request failed: {err}"),
    }
}

/// The artifact named by a vote: its params bytes as a UTF-8 content
/// address, if they are one
fn candidate_cid(event: &VoteEventMessage) -> Option<String> {
    let text = String::from_utf8(event.params.clone()).ok()?;
    let text = text.trim_matches(char::from(0)).trim().to_string();
    if text.is_empty() {
        return None;
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use caryatid_sdk::mock_bus::MockBus;
    use talos_common::messages::{ArtifactMessage, DeployedMessage, VoteEventMessage};
    use tokio::sync::watch;
    use tokio::time::{sleep, Duration};

    fn vote_with_params(params: Vec<u8>) -> VoteEventMessage {
        VoteEventMessage {
            block_height: 100,
            proposal_id: 7u32.into(),
            support: 1,
            weight: 1000u32.into(),
            reason: "upgrade".to_string(),
            params,
        }
    }

    #[test]
    fn params_text_names_the_artifact() {
        let cid = "bafkreigh2akiscaildcqabsyg3dfr6chu3fgpregiymsck7e7aqa4s52zy";
        let event = vote_with_params(cid.as_bytes().to_vec());
        assert_eq!(candidate_cid(&event), Some(cid.to_string()));
    }

    #[test]
    fn padded_params_are_trimmed() {
        let event = vote_with_params(b"  bafytest\0\0".to_vec());
        assert_eq!(candidate_cid(&event), Some("bafytest".to_string()));
    }

    #[test]
    fn non_text_params_are_rejected() {
        let event = vote_with_params(vec![0xff, 0xfe, 0x80]);
        assert_eq!(candidate_cid(&event), None);
    }

    #[test]
    fn empty_params_are_rejected() {
        let event = vote_with_params(Vec::new());
        assert_eq!(candidate_cid(&event), None);
    }

    /// Context over a mock bus, with startup already signalled so handlers run
    fn bus_fixture() -> (
        Arc<Context<Message>>,
        Arc<MockBus<Message>>,
        watch::Sender<bool>,
    ) {
        let config = Arc::new(Config::builder().build().unwrap());
        let bus = Arc::new(MockBus::<Message>::new(&config));
        let (startup_tx, startup_rx) = watch::channel(true);
        let context = Arc::new(Context::new(config, bus.clone(), startup_rx));
        (context, bus, startup_tx)
    }

    #[tokio::test]
    async fn a_failed_resolution_never_reaches_the_supervisor() {
        let (context, bus, _startup) = bus_fixture();

        context.handle("talos.artifact.resolve", |_: Arc<Message>| async {
            Arc::new(Message::ArtifactQueryResponse(
                ArtifactQueryResponse::Error("block unavailable".to_string()),
            ))
        });
        // let the handler's subscription register
        sleep(Duration::from_millis(10)).await;

        let event = vote_with_params(b"bafytest".to_vec());
        let mut phase = Phase::WaitingForEvent;
        run_cycle(
            &context,
            &event,
            "talos.artifact.resolve",
            "talos.process.deploy",
            &mut phase,
        )
        .await;

        assert_eq!(phase, Phase::Resolving);
        let publishes = bus.publishes.lock().await;
        assert!(publishes
            .iter()
            .any(|p| matches!(p.message.as_ref(), Message::ArtifactQuery(_))));
        assert!(publishes
            .iter()
            .all(|p| !matches!(p.message.as_ref(), Message::Deploy(_))));
    }

    #[tokio::test]
    async fn a_resolved_artifact_is_handed_to_the_supervisor() {
        let (context, bus, _startup) = bus_fixture();

        context.handle("talos.artifact.resolve", |message: Arc<Message>| async move {
            let response = match message.as_ref() {
                Message::ArtifactQuery(query) => {
                    ArtifactQueryResponse::Artifact(ArtifactMessage {
                        cid: query.cid.clone(),
                        bytes: b"ECHO v2".to_vec(),
                    })
                }
                _ => ArtifactQueryResponse::Error("unexpected message".to_string()),
            };
            Arc::new(Message::ArtifactQueryResponse(response))
        });
        context.handle("talos.process.deploy", |message: Arc<Message>| async move {
            let response = match message.as_ref() {
                Message::Deploy(_) => DeployResponse::Deployed(DeployedMessage {
                    pid: Some(4242),
                    path: "/tmp/echo-v2".to_string(),
                }),
                _ => DeployResponse::Error("unexpected message".to_string()),
            };
            Arc::new(Message::DeployResponse(response))
        });
        sleep(Duration::from_millis(10)).await;

        let cid = "bafkreigh2akiscaildcqabsyg3dfr6chu3fgpregiymsck7e7aqa4s52zy";
        let event = vote_with_params(cid.as_bytes().to_vec());
        let mut phase = Phase::WaitingForEvent;
        run_cycle(
            &context,
            &event,
            "talos.artifact.resolve",
            "talos.process.deploy",
            &mut phase,
        )
        .await;

        assert_eq!(phase, Phase::Deploying);
        let publishes = bus.publishes.lock().await;
        let command = publishes
            .iter()
            .find_map(|p| match p.message.as_ref() {
                Message::Deploy(command) => Some(command.clone()),
                _ => None,
            })
            .expect("a deploy command was published");
        assert_eq!(command.cid, cid);
        assert_eq!(command.bytes, b"ECHO v2");
    }
}

//! Talos process supervisor module.
//!
//! Handles deploy commands from the message bus: writes the artifact to an
//! executable temp file, replaces the currently running deployment with it
//! and answers with the new process id.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use caryatid_sdk::{module, Context, Module};
use config::Config;
use talos_common::messages::{DeployResponse, DeployedMessage, Message};
use tokio::sync::Mutex;
use tracing::{error, info};

mod deployer;
use deployer::{Deployer, SupervisionMode};

const DEFAULT_HANDLE_TOPIC: &str = "talos.process.deploy";

/// Process supervisor module
#[module(
    message_type(Message),
    name = "process-supervisor",
    description = "Supervisor for the deployed child process"
)]
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let handle_topic = config
            .get_string("handle-topic")
            .unwrap_or(DEFAULT_HANDLE_TOPIC.to_string());
        let artifact_dir = config
            .get_string("artifact-dir")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        let mode: SupervisionMode = config
            .get_string("mode")
            .unwrap_or("fire-and-forget".to_string())
            .parse()?;
        info!("writing artifacts under {}, supervision {mode:?}", artifact_dir.display());

        let deployer = Arc::new(Mutex::new(Deployer::new(artifact_dir, mode)));

        context.handle(&handle_topic, move |message: Arc<Message>| {
            let deployer = deployer.clone();
            async move {
                let response = match message.as_ref() {
                    Message::Deploy(command) => {
                        let mut deployer = deployer.lock().await;
                        match deployer.deploy(&command.cid, &command.bytes).await {
                            Ok(deployed) => DeployResponse::Deployed(DeployedMessage {
                                pid: deployed.pid,
                                path: deployed.path,
                            }),
                            Err(err) => {
                                error!("deployment of {} failed: {err}", command.cid);
                                DeployResponse::Error(err.to_string())
                            }
                        }
                    }
                    _ => {
                        error!("unexpected message on deploy topic");
                        DeployResponse::Error("unexpected message type".to_string())
                    }
                };
                Arc::new(Message::DeployResponse(response))
            }
        });

        Ok(())
    }
}

use clawhub_domain::{DeploymentType, InstanceId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Provisioning step progression shown in operator UIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    InProgress,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
}

/// Fire-and-forget progress events. The core only writes; dashboards read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ProvisioningEvent {
    Started {
        instance_id: InstanceId,
        deployment_type: DeploymentType,
    },
    Step {
        instance_id: InstanceId,
        step_id: String,
        state: StepState,
        message: Option<String>,
    },
    Log {
        instance_id: InstanceId,
        step_id: String,
        stream: LogSource,
        line: String,
    },
    Completed {
        instance_id: InstanceId,
    },
    Failed {
        instance_id: InstanceId,
        message: String,
    },
}

/// Event emitter consumed by the lifecycle manager. Sends never fail the
/// pipeline; a full or absent consumer just drops events.
pub trait ProvisioningEvents: Send + Sync + 'static {
    fn start_provisioning(&self, instance_id: &InstanceId, deployment_type: DeploymentType);
    fn update_step(
        &self,
        instance_id: &InstanceId,
        step_id: &str,
        state: StepState,
        message: Option<&str>,
    );
    fn emit_log(&self, instance_id: &InstanceId, step_id: &str, stream: LogSource, line: &str);
    fn complete_provisioning(&self, instance_id: &InstanceId);
    fn fail_provisioning(&self, instance_id: &InstanceId, message: &str);
}

/// In-process event bus backed by a tokio broadcast channel.
pub struct BroadcastEvents {
    tx: broadcast::Sender<ProvisioningEvent>,
}

impl BroadcastEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProvisioningEvent> {
        self.tx.subscribe()
    }

    fn send(&self, event: ProvisioningEvent) {
        // No subscriber is fine; events are advisory.
        if self.tx.send(event).is_err() {
            debug!("provisioning event dropped (no subscribers)");
        }
    }
}

impl Default for BroadcastEvents {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ProvisioningEvents for BroadcastEvents {
    fn start_provisioning(&self, instance_id: &InstanceId, deployment_type: DeploymentType) {
        self.send(ProvisioningEvent::Started {
            instance_id: instance_id.clone(),
            deployment_type,
        });
    }

    fn update_step(
        &self,
        instance_id: &InstanceId,
        step_id: &str,
        state: StepState,
        message: Option<&str>,
    ) {
        self.send(ProvisioningEvent::Step {
            instance_id: instance_id.clone(),
            step_id: step_id.to_string(),
            state,
            message: message.map(String::from),
        });
    }

    fn emit_log(&self, instance_id: &InstanceId, step_id: &str, stream: LogSource, line: &str) {
        self.send(ProvisioningEvent::Log {
            instance_id: instance_id.clone(),
            step_id: step_id.to_string(),
            stream,
            line: line.to_string(),
        });
    }

    fn complete_provisioning(&self, instance_id: &InstanceId) {
        self.send(ProvisioningEvent::Completed {
            instance_id: instance_id.clone(),
        });
    }

    fn fail_provisioning(&self, instance_id: &InstanceId, message: &str) {
        self.send(ProvisioningEvent::Failed {
            instance_id: instance_id.clone(),
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers_in_order() {
        let bus = BroadcastEvents::new(16);
        let mut rx = bus.subscribe();
        let id = InstanceId::new("bot-1");

        bus.start_provisioning(&id, DeploymentType::LocalDocker);
        bus.update_step(&id, "install", StepState::InProgress, None);
        bus.update_step(&id, "install", StepState::Completed, Some("done"));
        bus.complete_provisioning(&id);

        assert!(matches!(rx.recv().await.unwrap(), ProvisioningEvent::Started { .. }));
        match rx.recv().await.unwrap() {
            ProvisioningEvent::Step { step_id, state, .. } => {
                assert_eq!(step_id, "install");
                assert_eq!(state, StepState::InProgress);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(rx.recv().await.unwrap(), ProvisioningEvent::Step { .. }));
        assert!(matches!(rx.recv().await.unwrap(), ProvisioningEvent::Completed { .. }));
    }

    #[test]
    fn send_without_subscribers_is_silent() {
        let bus = BroadcastEvents::new(4);
        bus.fail_provisioning(&InstanceId::new("x"), "boom");
    }
}

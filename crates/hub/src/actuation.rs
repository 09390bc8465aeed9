use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use tracing::{error, info};

use crate::mqtt::{command_topic, LedCommand};

/// Outbound commands to thingies. Best effort: implementations log failures
/// and never hand them back to the caller.
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn publish_led_color(&self, thingy_id: &str, color: &str);
}

#[derive(Clone)]
pub struct MqttActuator {
    client: AsyncClient,
}

impl MqttActuator {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Actuator for MqttActuator {
    async fn publish_led_color(&self, thingy_id: &str, color: &str) {
        let payload = match serde_json::to_vec(&LedCommand::new(color)) {
            Ok(p) => p,
            Err(e) => {
                error!(thingy = %thingy_id, "led command encode failed: {e}");
                return;
            }
        };

        let topic = command_topic(thingy_id);
        match self
            .client
            .publish(topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await
        {
            Ok(()) => info!(thingy = %thingy_id, color, "led color published"),
            Err(e) => error!(thingy = %thingy_id, %topic, "led publish failed: {e}"),
        }
    }
}

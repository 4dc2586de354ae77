use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures::{stream, StreamExt};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::TransportMessage;
use crate::{
    config::MqttConfig,
    pipeline::{Envelope, EnvelopeStream, PipelineError, Source},
};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Subscribes to every configured topic and forwards publishes into a
/// bounded channel. Subscriptions are re-issued after each reconnect.
/// Cancelling `shutdown` sends a clean DISCONNECT to the broker before the
/// event loop stops.
pub struct MqttSource {
    receiver: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<Envelope<TransportMessage>>>>>,
}

impl MqttSource {
    pub fn connect(cfg: &MqttConfig, shutdown: CancellationToken) -> Self {
        let client_id = cfg.client_id.clone().unwrap_or_else(generated_client_id);
        let mut options = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
        options
            .set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)))
            .set_clean_session(true);
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, event_loop) = AsyncClient::new(options, cfg.topics.len().max(10));
        let (tx, rx) = mpsc::channel(cfg.channel_capacity.max(1));
        let topics: Vec<String> = cfg.topics.keys().cloned().collect();

        tokio::spawn(drive_event_loop(
            client,
            event_loop,
            topics,
            tx,
            shutdown,
        ));

        Self {
            receiver: Arc::new(tokio::sync::Mutex::new(Some(rx))),
        }
    }
}

async fn drive_event_loop(
    client: AsyncClient,
    mut event_loop: EventLoop,
    topics: Vec<String>,
    tx: mpsc::Sender<Envelope<TransportMessage>>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => {
                disconnect(&client, &mut event_loop).await;
                break;
            }
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("MQTT connected");
                for topic in &topics {
                    if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                        tracing::error!(error = %e, topic = %topic, "failed to subscribe");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::debug!(topic = %publish.topic, "message received");
                metrics::counter!("mqtt_messages_received_total").increment(1);
                let message = TransportMessage::new(publish.topic, publish.payload.to_vec());
                if tx.send(Envelope::now(message)).await.is_err() {
                    tracing::warn!("ingestion channel closed; stopping MQTT event loop");
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "MQTT error");
                metrics::counter!("mqtt_connection_errors_total").increment(1);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }

    tracing::info!("MQTT event loop stopped");
}

/// Queue a DISCONNECT and keep polling until it has been written out.
async fn disconnect(client: &AsyncClient, event_loop: &mut EventLoop) {
    if let Err(e) = client.try_disconnect() {
        tracing::debug!(error = %e, "mqtt disconnect request failed");
        return;
    }

    let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return true,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "mqtt connection closed during disconnect");
                    return false;
                }
            }
        }
    })
    .await;

    match flushed {
        Ok(true) => tracing::info!("MQTT disconnected"),
        Ok(false) => {}
        Err(_) => tracing::warn!("timed out sending MQTT disconnect"),
    }
}

fn generated_client_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    format!("mqtt_{:08x}", nanos ^ std::process::id())
}

#[async_trait::async_trait]
impl Source<TransportMessage> for MqttSource {
    async fn stream(&self) -> EnvelopeStream<TransportMessage> {
        let mut guard = self.receiver.lock().await;
        match guard.take() {
            Some(rx) => Box::pin(ReceiverStream::new(rx).map(Ok)),
            None => Box::pin(stream::once(async {
                Err(PipelineError::Source(
                    "MqttSource stream already taken; only one consumer supported".to_string(),
                ))
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    /// Read one MQTT control packet and return its type nibble.
    async fn read_packet_type(stream: &mut TcpStream) -> std::io::Result<u8> {
        let header = stream.read_u8().await?;
        let mut remaining = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            remaining |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; remaining];
        stream.read_exact(&mut body).await?;
        Ok(header >> 4)
    }

    #[tokio::test]
    async fn shutdown_sends_disconnect_to_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (connected_tx, connected_rx) = tokio::sync::oneshot::channel();

        let broker = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            assert_eq!(read_packet_type(&mut stream).await.unwrap(), 1);
            // CONNACK, session not present, accepted.
            stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
            let _ = connected_tx.send(());
            loop {
                match read_packet_type(&mut stream).await {
                    Ok(14) => return true,
                    Ok(_) => {}
                    Err(_) => return false,
                }
            }
        });

        let cfg = MqttConfig {
            host: "127.0.0.1".to_string(),
            port,
            client_id: Some("shutdown-test".to_string()),
            username: None,
            password: None,
            keep_alive_secs: 30,
            channel_capacity: 8,
            topics: BTreeMap::from([("meters/a".to_string(), "A".to_string())]),
        };
        let shutdown = CancellationToken::new();
        let _source = MqttSource::connect(&cfg, shutdown.clone());

        tokio::time::timeout(Duration::from_secs(5), connected_rx)
            .await
            .unwrap()
            .unwrap();
        shutdown.cancel();

        let got_disconnect = tokio::time::timeout(Duration::from_secs(5), broker)
            .await
            .unwrap()
            .unwrap();
        assert!(got_disconnect);
    }

    #[test]
    fn generated_client_id_has_expected_shape() {
        let id = generated_client_id();
        assert!(id.starts_with("mqtt_"));
        assert_eq!(id.len(), "mqtt_".len() + 8);
    }
}

use super::channel::{ChannelEvent, ChannelRequest, Transport, TransportChannel};
use anyhow::{Context, Result};
use async_nats::Client;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// Buffered events per channel before slow receivers start lagging
const EVENT_CAPACITY: usize = 256;

type UnsubscribeAck = oneshot::Sender<Result<()>>;

/// NATS-backed transport
pub struct NatsTransport {
    client: Client,
    /// Client connection events, fanned out to every open channel
    system_events: broadcast::Sender<ChannelEvent>,
}

impl NatsTransport {
    /// Connect to NATS server
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let (system_events, _) = broadcast::channel(EVENT_CAPACITY);
        let events_tx = system_events.clone();

        let client = async_nats::ConnectOptions::new()
            .event_callback(move |event| {
                let events_tx = events_tx.clone();
                async move {
                    let mapped = match event {
                        async_nats::Event::Connected => ChannelEvent::Connect,
                        async_nats::Event::Disconnected => ChannelEvent::Disconnect,
                        async_nats::Event::ServerError(err) => ChannelEvent::Error(err.to_string()),
                        async_nats::Event::ClientError(err) => ChannelEvent::Error(err.to_string()),
                        other => {
                            debug!("Ignoring NATS event: {}", other);
                            return;
                        }
                    };
                    // No open channels is fine
                    let _ = events_tx.send(mapped);
                }
            })
            .connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        Ok(Self {
            client,
            system_events,
        })
    }

    /// Underlying client, shared with the session RPC store
    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

#[async_trait::async_trait]
impl Transport for NatsTransport {
    async fn open(&self, request: ChannelRequest) -> Result<Arc<dyn TransportChannel>> {
        let mut subscriber = self
            .client
            .subscribe(request.subject.clone())
            .await
            .with_context(|| format!("Failed to subscribe to {}", request.subject))?;

        info!("Subscribed to {} ({})", request.subject, request.id);

        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<UnsubscribeAck>();
        let mut system_rx = self.system_events.subscribe();

        let tx = events_tx.clone();
        let id = request.id.clone();

        tokio::spawn(async move {
            let mut system_open = true;

            loop {
                tokio::select! {
                    ack = &mut shutdown_rx => {
                        let result = subscriber
                            .unsubscribe()
                            .await
                            .context("Failed to unsubscribe");
                        if let Ok(ack) = ack {
                            let _ = ack.send(result);
                        }
                        break;
                    }
                    message = subscriber.next() => match message {
                        Some(message) => {
                            let _ = tx.send(ChannelEvent::Message(message.payload.to_vec()));
                        }
                        None => {
                            warn!("Subscription {} ended", id);
                            let _ = tx.send(ChannelEvent::Closed);
                            break;
                        }
                    },
                    event = system_rx.recv(), if system_open => match event {
                        Ok(event) => {
                            let _ = tx.send(event);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Channel {} missed {} connection events", id, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            system_open = false;
                        }
                    },
                }
            }

            debug!("Channel task {} stopped", id);
        });

        Ok(Arc::new(NatsChannel {
            id: request.id,
            subject: request.subject,
            events: events_tx,
            shutdown: Mutex::new(Some(shutdown_tx)),
        }))
    }

    fn name(&self) -> &str {
        "nats"
    }
}

/// A subscription opened by `NatsTransport`
pub struct NatsChannel {
    id: String,
    subject: String,
    events: broadcast::Sender<ChannelEvent>,
    shutdown: Mutex<Option<oneshot::Sender<UnsubscribeAck>>>,
}

#[async_trait::async_trait]
impl TransportChannel for NatsChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn subject(&self) -> &str {
        &self.subject
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    async fn unsubscribe(&self) -> Result<()> {
        let Some(shutdown) = self.shutdown.lock().take() else {
            return Ok(());
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if shutdown.send(ack_tx).is_err() {
            // Forwarding task already exited with the subscription
            return Ok(());
        }

        match ack_rx.await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }
}

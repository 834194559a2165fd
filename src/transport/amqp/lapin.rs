//! AMQP transport implementation using `lapin`.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns the AMQP connection and channel.
//! - The actor declares and deletes queues, publishes, starts and cancels
//!   consumers, acknowledges deliveries, and shuts the connection down.
//! - Every public `Transport` method sends a command to the actor and awaits
//!   its answer, so all channel operations are serialized.
//!
//! ## Message mapping
//!
//! The envelope payload is the AMQP message body. `correlation_id`,
//! `reply_to` and `content_type` map to the AMQP basic properties of the same
//! names, so a peer written against any AMQP client interoperates.
//!
//! ## Consumers
//!
//! Each `consume()` spawns a task that forwards the lapin consumer stream into
//! the subscription inbox. When the stream ends (basic.cancel from either
//! side, queue deletion, channel or connection failure) the task exits and
//! the inbox closes.

use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicCancelOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    Address,
    ConsumeOptions,
    Delivery,
    DeliveryTag,
    Envelope,
    QueueOptions,
    QueueRef,
    Result,
    RpcConfig,
    RpcError,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

//
// Actor commands
//

enum Cmd {
    //
    Declare {
        name: String,
        opts: QueueOptions,
        resp: oneshot::Sender<Result<QueueRef>>,
    },
    Publish {
        env: Envelope,
        resp: oneshot::Sender<Result<()>>,
    },
    Consume {
        queue: String,
        opts: ConsumeOptions,
        resp: oneshot::Sender<Result<SubscriptionHandle>>,
    },
    Cancel {
        consumer_tag: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Delete {
        name: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Ack {
        delivery_tag: DeliveryTag,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// AMQP transport implementation using lapin.
pub struct AmqpTransport {
    // ---
    transport_id: String,
    cmd_tx: mpsc::Sender<Cmd>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpTransport {
    /// Spawn the actor owning `connection` and `channel`.
    fn create(transport_id: &str, connection: Connection, channel: Channel) -> TransportPtr {
        // ---
        let transport_id = transport_id.to_string();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let actor = Actor {
            transport_id: transport_id.clone(),
            connection,
            channel,
            cmd_rx,
            consumers: HashMap::new(),
        };

        let handle = tokio::spawn(actor.run());

        Arc::new(Self {
            transport_id,
            cmd_tx,
            actor: Mutex::new(Some(handle)),
        })
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Cmd) -> Result<T> {
        // ---
        let (tx, rx) = oneshot::channel();

        self.cmd_tx.send(make(tx)).await.map_err(|e| {
            let msg = format!("amqp: actor command channel closed: {e}");
            RpcError::Transport(msg)
        })?;

        rx.await.map_err(|e| {
            let msg = format!("amqp: actor responder channel read failed: {e}");
            RpcError::Transport(msg)
        })?
    }
}

struct ConsumerTask {
    queue: String,
    handle: JoinHandle<()>,
}

/// Background actor task that owns the AMQP connection and channel.
struct Actor {
    // ---
    transport_id: String,
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
    consumers: HashMap<String, ConsumerTask>,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_info!("[{}] AMQP actor started", self.transport_id);

        while let Some(cmd) = self.cmd_rx.recv().await {
            if !self.handle_cmd(cmd).await {
                break;
            }
        }

        log_info!("[{}] AMQP actor shutting down", self.transport_id);

        for (_, task) in self.consumers.drain() {
            task.handle.abort();
        }

        let _ = self.channel.close(200, "Normal shutdown".into()).await;
        let _ = self.connection.close(200, "Normal shutdown".into()).await;

        log_info!("[{}] AMQP actor stopped", self.transport_id);
    }

    /// Returns `false` once the actor should stop.
    async fn handle_cmd(&mut self, cmd: Cmd) -> bool {
        // ---
        match cmd {
            Cmd::Declare { name, opts, resp } => {
                let _ = resp.send(self.do_declare(name, opts).await);
            }
            Cmd::Publish { env, resp } => {
                let _ = resp.send(self.do_publish(env).await);
            }
            Cmd::Consume { queue, opts, resp } => {
                let _ = resp.send(self.do_consume(queue, opts).await);
            }
            Cmd::Cancel { consumer_tag, resp } => {
                let _ = resp.send(self.do_cancel(consumer_tag).await);
            }
            Cmd::Delete { name, resp } => {
                let _ = resp.send(self.do_delete(name).await);
            }
            Cmd::Ack { delivery_tag, resp } => {
                let result = self
                    .channel
                    .basic_ack(delivery_tag, BasicAckOptions::default())
                    .await
                    .map_err(|e| RpcError::Transport(format!("amqp: ack failed: {e}")));
                let _ = resp.send(result);
            }
            Cmd::Close { resp } => {
                let _ = resp.send(Ok(()));
                return false;
            }
        }
        true
    }

    async fn do_declare(&mut self, name: String, opts: QueueOptions) -> Result<QueueRef> {
        // ---
        let queue_opts = QueueDeclareOptions {
            passive: false,
            durable: opts.durable,
            exclusive: opts.exclusive,
            auto_delete: opts.auto_delete,
            nowait: false,
        };

        let queue = self
            .channel
            .queue_declare(name.into(), queue_opts, FieldTable::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: queue declare failed: {e}")))?;

        log_debug!("[{}] Declared queue: {}", self.transport_id, queue.name().as_str());

        Ok(QueueRef {
            name: Address::from(queue.name().as_str()),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn do_publish(&mut self, env: Envelope) -> Result<()> {
        // ---
        let mut props = BasicProperties::default();
        if let Some(id) = &env.correlation_id {
            props = props.with_correlation_id(id.to_string().into());
        }
        if let Some(reply_to) = &env.reply_to {
            props = props.with_reply_to(reply_to.as_str().into());
        }
        if let Some(ct) = &env.content_type {
            props = props.with_content_type(ct.to_string().into());
        }

        let queue = env.address.as_str();
        self.channel
            .basic_publish(
                "".into(),    // default exchange
                queue.into(), // routing key = queue name
                BasicPublishOptions::default(),
                &env.payload,
                props,
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: publish failed: {e}")))?;

        log_debug!("[{}] Published to queue: {queue}", self.transport_id);
        Ok(())
    }

    async fn do_consume(&mut self, queue: String, opts: ConsumeOptions) -> Result<SubscriptionHandle> {
        // ---
        let consumer_tag = format!("{}-{}", self.transport_id, Uuid::new_v4().simple());

        let consume_opts = BasicConsumeOptions {
            no_ack: opts.no_ack,
            ..BasicConsumeOptions::default()
        };

        let consumer = self
            .channel
            .basic_consume(
                queue.clone().into(),
                consumer_tag.clone().into(),
                consume_opts,
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: consume failed: {e}")))?;

        log_info!("[{}] Started consuming queue: {queue}", self.transport_id);

        let (tx, rx) = mpsc::unbounded_channel();
        let transport_id = self.transport_id.clone();
        let queue_name = queue.clone();

        let handle = tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery_result) = consumer.next().await {
                match delivery_result {
                    Ok(delivery) => {
                        log_debug!("[{transport_id}] Received message on queue: {queue_name}");
                        if tx.send(to_delivery(&queue_name, delivery)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log_error!("[{transport_id}] Consumer error on {queue_name}: {e}");
                        break;
                    }
                }
            }

            log_info!("[{transport_id}] Consumer task ended for queue: {queue_name}");
        });

        self.consumers
            .insert(consumer_tag.clone(), ConsumerTask { queue, handle });

        Ok(SubscriptionHandle {
            consumer_tag: Arc::from(consumer_tag),
            inbox: rx,
        })
    }

    async fn do_cancel(&mut self, consumer_tag: String) -> Result<()> {
        // ---
        if let Some(task) = self.consumers.remove(&consumer_tag) {
            task.handle.abort();
        }
        self.channel
            .basic_cancel(consumer_tag.into(), BasicCancelOptions::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: cancel failed: {e}")))
    }

    async fn do_delete(&mut self, name: String) -> Result<()> {
        // ---
        self.consumers.retain(|_, task| {
            let keep = task.queue != name;
            if !keep {
                task.handle.abort();
            }
            keep
        });

        self.channel
            .queue_delete(name.clone().into(), QueueDeleteOptions::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: queue delete failed: {e}")))?;

        log_debug!("[{}] Deleted queue: {name}", self.transport_id);
        Ok(())
    }
}

fn to_delivery(queue: &str, delivery: lapin::message::Delivery) -> Delivery {
    // ---
    let props = &delivery.properties;
    let envelope = Envelope {
        address: Address::from(queue),
        payload: delivery.data.clone().into(),
        correlation_id: props.correlation_id().as_ref().map(|s| Arc::from(s.as_str())),
        reply_to: props.reply_to().as_ref().map(|s| Address::from(s.as_str())),
        content_type: props.content_type().as_ref().map(|s| Arc::from(s.as_str())),
    };

    Delivery {
        envelope,
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn declare_queue(&self, name: &str, opts: QueueOptions) -> Result<QueueRef> {
        let name = name.to_string();
        self.request(|resp| Cmd::Declare { name, opts, resp }).await
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        self.request(|resp| Cmd::Publish { env, resp }).await
    }

    async fn consume(&self, queue: &str, opts: ConsumeOptions) -> Result<SubscriptionHandle> {
        let queue = queue.to_string();
        self.request(|resp| Cmd::Consume { queue, opts, resp }).await
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let consumer_tag = consumer_tag.to_string();
        self.request(|resp| Cmd::Cancel { consumer_tag, resp }).await
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.request(|resp| Cmd::Delete { name, resp }).await
    }

    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<()> {
        self.request(|resp| Cmd::Ack { delivery_tag, resp }).await
    }

    async fn close(&self) -> Result<()> {
        // ---
        let _ = self.request(|resp| Cmd::Close { resp }).await;

        if let Some(handle) = self.actor.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

/// Creates a lapin-based AMQP transport from the given configuration.
///
/// The connection is established before this returns, retrying according to
/// `config.connect_retry`.
///
/// # Errors
///
/// Returns [`RpcError::Connection`] if the broker cannot be reached or the
/// channel cannot be opened.
pub async fn create_transport(config: &RpcConfig) -> Result<TransportPtr> {
    // ---
    let (connection, channel) =
        crate::retry_with_backoff(config.connect_retry.as_ref(), || create_amqp_connection(config))
            .await?;

    Ok(AmqpTransport::create(&config.transport_id, connection, channel))
}

async fn create_amqp_connection(config: &RpcConfig) -> Result<(Connection, Channel)> {
    // ---
    let uri = config.broker_uri.as_str();
    log_info!("Connecting to AMQP broker: {uri}");

    let connection = Connection::connect(uri, ConnectionProperties::default())
        .await
        .map_err(|e| {
            let msg = format!("amqp: connection failed: {e}");
            log_error!("{msg}");
            RpcError::Connection(msg)
        })?;

    let channel = connection.create_channel().await.map_err(|e| {
        let msg = format!("amqp: channel creation failed: {e}");
        log_error!("{msg}");
        RpcError::Connection(msg)
    })?;

    log_info!("Connected to AMQP broker, channel open");
    Ok((connection, channel))
}

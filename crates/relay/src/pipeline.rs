//! Staged packet pipeline
//!
//! ```text
//! transport ─▶ decode ─▶ dedup ─▶ mixer ─▶ forward (concurrent per packet)
//! transport ─▶ ack (concurrent per acknowledgement)
//! parked work ─▶ retry (every `parked_retry_interval`)
//! ```
//!
//! Every stage is its own task. Stages are joined by bounded channels of
//! `channel_capacity`, so a slow stage pushes back on the one before it.
//! Per-packet failures are contained in the stage; store outages are
//! reported through [`PipelineHandle`] while the affected work is parked in
//! the handler and retried on a timer until the store recovers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::handler::RelayHandler;
use crate::mixer::Mixer;
use crate::packet::Packet;
use crate::transport::{InboundMessage, ACK_PROTOCOL, PACKET_PROTOCOL};
use crate::{RelayError, Result};

/// Spawns the pipeline stages for one relay
pub struct RelayPipeline;

impl RelayPipeline {
    /// Subscribe to the packet and acknowledgement protocols and start every
    /// stage. The pipeline runs until the transport closes both subscriptions
    /// or the handle is aborted.
    pub async fn spawn(handler: Arc<RelayHandler>) -> Result<PipelineHandle> {
        let packets = handler.transport().subscribe(PACKET_PROTOCOL).await?;
        let acks = handler.transport().subscribe(ACK_PROTOCOL).await?;

        let capacity = handler.config().channel_capacity.max(1);
        let (decoded_tx, decoded_rx) = mpsc::channel(capacity);
        let (mix_tx, mix_rx) = mpsc::channel(capacity);
        let (released_tx, released_rx) = mpsc::channel(capacity);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        let mut tasks = JoinSet::new();
        tasks.spawn(decode_stage(handler.clone(), packets, decoded_tx));
        tasks.spawn(dedup_stage(
            handler.clone(),
            decoded_rx,
            mix_tx,
            fatal_tx.clone(),
        ));

        let mixer = Mixer::new(handler.config());
        let overflow_handler = handler.clone();
        tasks.spawn(mixer.run(mix_rx, released_tx, move |packet: Packet| {
            overflow_handler.metrics().mixer_overflow.inc();
            debug!("Mixer full, dropped packet {}", hex::encode(&packet.tag[..8]));
        }));

        // The retry stage stops once every holder of `alive_tx` has stopped
        let (alive_tx, alive_rx) = mpsc::channel::<()>(1);
        tasks.spawn(forward_stage(
            handler.clone(),
            released_rx,
            fatal_tx.clone(),
            alive_tx.clone(),
        ));
        tasks.spawn(ack_stage(handler.clone(), acks, fatal_tx, alive_tx));
        tasks.spawn(retry_stage(handler.clone(), alive_rx));

        info!("Relay pipeline started for {}", hex::encode(&handler.peer_id()[..8]));
        Ok(PipelineHandle { tasks, fatal_rx })
    }
}

/// Handle to a running pipeline
pub struct PipelineHandle {
    tasks: JoinSet<()>,
    fatal_rx: mpsc::UnboundedReceiver<RelayError>,
}

impl PipelineHandle {
    /// Wait for the next fatal error. `None` once every stage has stopped.
    pub async fn next_fatal(&mut self) -> Option<RelayError> {
        self.fatal_rx.recv().await
    }

    /// Stop every stage immediately
    pub fn abort(&mut self) {
        self.tasks.abort_all();
    }

    /// Wait for the stages to drain and stop. Returns the first fatal error
    /// raised while running, if any.
    pub async fn join(mut self) -> Result<()> {
        let mut stopped = None;
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() && stopped.is_none() {
                    stopped = Some(RelayError::PipelineStopped(e.to_string()));
                }
            }
        }
        match self.fatal_rx.try_recv() {
            Ok(fatal) => Err(fatal),
            Err(_) => stopped.map_or(Ok(()), Err),
        }
    }
}

async fn decode_stage(
    handler: Arc<RelayHandler>,
    mut inbound: mpsc::Receiver<InboundMessage>,
    decoded: mpsc::Sender<Packet>,
) {
    while let Some(message) = inbound.recv().await {
        // Undecodable packets are counted and logged by the handler
        let Ok(packet) = handler.decode(&message.bytes, &message.from) else {
            continue;
        };
        if decoded.send(packet).await.is_err() {
            break;
        }
    }
    debug!("Decode stage stopped");
}

async fn dedup_stage(
    handler: Arc<RelayHandler>,
    mut decoded: mpsc::Receiver<Packet>,
    mixing: mpsc::Sender<Packet>,
    fatal: mpsc::UnboundedSender<RelayError>,
) {
    while let Some(packet) = decoded.recv().await {
        match handler.deduplicate(packet).await {
            Ok(packet) => {
                if mixing.send(packet).await.is_err() {
                    break;
                }
            }
            Err(e) => report(e, &fatal),
        }
    }
    debug!("Dedup stage stopped");
}

async fn forward_stage(
    handler: Arc<RelayHandler>,
    mut released: mpsc::Receiver<Packet>,
    fatal: mpsc::UnboundedSender<RelayError>,
    _alive: mpsc::Sender<()>,
) {
    let limit = handler.config().channel_capacity.max(1);
    let mut in_flight = JoinSet::new();
    while let Some(packet) = released.recv().await {
        while in_flight.len() >= limit {
            in_flight.join_next().await;
        }
        let handler = handler.clone();
        let fatal = fatal.clone();
        in_flight.spawn(async move {
            if let Err(e) = handler.process_released(packet).await {
                report(e, &fatal);
            }
        });
    }
    while in_flight.join_next().await.is_some() {}
    debug!("Forward stage stopped");
}

async fn ack_stage(
    handler: Arc<RelayHandler>,
    mut inbound: mpsc::Receiver<InboundMessage>,
    fatal: mpsc::UnboundedSender<RelayError>,
    _alive: mpsc::Sender<()>,
) {
    let limit = handler.config().channel_capacity.max(1);
    let mut in_flight = JoinSet::new();
    while let Some(message) = inbound.recv().await {
        while in_flight.len() >= limit {
            in_flight.join_next().await;
        }
        let handler = handler.clone();
        let fatal = fatal.clone();
        in_flight.spawn(async move {
            if let Err(e) = handler
                .handle_acknowledgement(&message.bytes, &message.from)
                .await
            {
                report(e, &fatal);
            }
        });
    }
    while in_flight.join_next().await.is_some() {}
    debug!("Ack stage stopped");
}

async fn retry_stage(handler: Arc<RelayHandler>, mut alive: mpsc::Receiver<()>) {
    let interval = handler
        .config()
        .parked_retry_interval
        .max(Duration::from_millis(1));
    loop {
        tokio::select! {
            _ = alive.recv() => break,
            _ = tokio::time::sleep(interval) => {
                if handler.parked_count().await == 0 {
                    continue;
                }
                // Failures were already reported when the work was parked
                match handler.retry_parked().await {
                    Ok(handled) => info!("Recovered {} parked items", handled),
                    Err(e) => debug!("Parked work still waiting: {}", e),
                }
            }
        }
    }
    debug!("Retry stage stopped");
}

fn report(e: RelayError, fatal: &mpsc::UnboundedSender<RelayError>) {
    if e.is_fatal() {
        error!("Relay pipeline: {}", e);
        let _ = fatal.send(e);
    } else {
        debug!("Dropped: {}", e);
    }
}

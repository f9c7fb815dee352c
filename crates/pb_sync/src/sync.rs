//! Sync Engine — replay, acknowledgement, and queue drain.
//!
//! Runs on the core task, as a second impl block over [`Core`]: the
//! Connection Manager owns the transport and calls down into these
//! methods, so the "cycle" between the two is just two views of one
//! state machine.
//!
//! Establishment sequence:
//! 1. reconcile the sequence allocator against `last_ack_device_seq`;
//! 2. stale pending entries (foreign identity, already-acked sequence)
//!    are excluded by the pending predicate itself;
//! 3. replay missed events page by page when the server has history for
//!    us (`last_ack > 0`);
//! 4. drain the pending queue in emission order.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use pb_proto::{Event, Frame};

use crate::{
    connection::{Core, ReplayState, SessionState},
    handshake::SessionInfo,
    subscribers::ConnectionStatus,
};

impl Core {
    pub(crate) async fn on_established(&mut self, info: SessionInfo) {
        self.handshake = None;
        self.clear_handshake_deadline();
        self.reset_reconnect_attempts();

        self.session = Some(SessionState {
            key: info.session_key,
            expires_at: info.expires_at,
        });

        // The relay's acknowledgement mark is authoritative for this
        // session; the allocator must end up strictly ahead of it.
        self.last_ack = info.last_ack_device_seq;
        if let Err(e) = self.shared.settings.set_last_ack_device_seq(self.last_ack).await {
            warn!(error = %e, "failed to persist last_ack");
        }
        if let Err(e) = self.allocator.reconcile(self.last_ack).await {
            warn!(error = %e, "sequence reconcile failed");
        }

        self.set_status(ConnectionStatus::Connected);
        self.schedule_rotation_before(info.expires_at);

        if self.last_ack > 0 {
            self.begin_replay().await;
        } else {
            self.drain_pending().await;
        }
    }

    // ── Replay ───────────────────────────────────────────────────────────

    async fn begin_replay(&mut self) {
        self.replay = Some(ReplayState { continuation_token: None });
        self.send_next_replay_request().await;
    }

    pub(crate) async fn send_next_replay_request(&mut self) {
        let Some(replay) = &self.replay else {
            return;
        };
        let request = Frame::ReplayRequest {
            last_ack_device_seq: self.last_ack,
            limit: self.shared.config.replay_page_limit,
            continuation_token: replay.continuation_token.clone(),
        };
        self.arm_replay_deadline();
        if let Err(e) = self.send_frame(&request).await {
            warn!(error = %e, "replay request failed");
        }
    }

    pub(crate) async fn on_replay_response(
        &mut self,
        events: Vec<Event>,
        has_more: bool,
        continuation_token: Option<String>,
        total_events: Option<u64>,
    ) {
        if self.replay.is_none() {
            debug!("unsolicited replay_response dropped");
            return;
        }
        self.clear_replay_deadline();
        debug!(page = events.len(), has_more, ?total_events, "replay page");

        for event in events {
            self.ingest_remote(event).await;
        }

        if has_more {
            if let Some(replay) = &mut self.replay {
                replay.continuation_token = continuation_token;
            }
            // Short inter-page delay before the next request.
            self.arm_replay_next(Duration::from_millis(
                self.shared.config.replay_page_delay_ms,
            ));
        } else {
            self.replay = None;
            info!("replay complete");
            self.drain_pending().await;
        }
    }

    // ── Inbound events & acks ────────────────────────────────────────────

    /// Idempotent ingest: append (first writer wins), adopt relay stream
    /// numbering, notify observers for genuinely new foreign events, then
    /// acknowledge receipt.
    pub(crate) async fn ingest_remote(&mut self, event: Event) {
        let our_device = self.shared.device().device_id;

        let inserted = match self.shared.log.append(&event).await {
            Ok(inserted) => inserted,
            Err(e) => {
                warn!(error = %e, event_id = %event.event_id, "append failed");
                return;
            }
        };
        if event.stream_seq > 0 {
            if let Err(e) = self
                .shared
                .log
                .set_stream_seq(&event.event_id, event.stream_seq)
                .await
            {
                debug!(error = %e, "stream_seq adoption failed");
            }
        }

        if inserted && event.device_id != our_device {
            self.shared.subscribers.notify_event(&event);
        }

        let ack = Frame::Ack {
            device_seq: event.device_seq,
            device_id: Some(event.device_id.clone()),
        };
        if let Err(e) = self.send_frame(&ack).await {
            debug!(error = %e, "ack transmit failed");
        }
    }

    /// Relay acknowledgement for one of our events: advance the high-water
    /// mark, never regress it.
    pub(crate) async fn on_ack(&mut self, device_seq: u64, device_id: Option<String>) {
        let ours = self.shared.device().device_id;
        if let Some(id) = device_id {
            if id != ours {
                debug!(device_id = %id, "ack for foreign device ignored");
                return;
            }
        }
        if device_seq > self.last_ack {
            self.last_ack = device_seq;
            if let Err(e) = self.shared.settings.set_last_ack_device_seq(device_seq).await {
                warn!(error = %e, "failed to persist last_ack");
            }
        }
    }

    // ── Drain ────────────────────────────────────────────────────────────

    /// Transmit every pending event in `device_seq` order. Events stay
    /// pending until the relay acknowledges them.
    pub(crate) async fn drain_pending(&mut self) {
        if self.session.is_none() {
            return;
        }
        let Ok(user_id) = self.shared.user_id() else {
            return;
        };
        let device = self.shared.device();
        let pending = match self
            .shared
            .log
            .pending(&user_id, &device.device_id, self.last_ack)
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "pending query failed");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "draining pending queue");
        for stored in pending {
            if let Err(e) = self.send_frame(&Frame::Event(stored.event)).await {
                warn!(error = %e, "drain interrupted");
                break;
            }
        }
    }

    // ── Timer plumbing (fields live on the manager side) ─────────────────

    fn arm_replay_deadline(&mut self) {
        self.set_replay_deadline(Some(
            Instant::now() + Duration::from_millis(self.shared.config.replay_page_timeout_ms),
        ));
    }

    fn clear_replay_deadline(&mut self) {
        self.set_replay_deadline(None);
    }

    fn arm_replay_next(&mut self, delay: Duration) {
        self.set_replay_next(Some(Instant::now() + delay));
    }
}

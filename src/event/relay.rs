//! # Ticketed Status Relay
//!
//! Correlates a request with the asynchronous status events produced for it
//! later. A requester takes a [`Ticket`], subscribes to it, and receives every
//! [`TicketStatus`] relayed under that ticket in the order it was generated.
//!
//! A ticket can be chained to an earlier, upstream ticket that represents the
//! same physical operation (an install started by a download, for example).
//! Statuses relayed on the downstream ticket are then delivered to the
//! upstream ticket's subscribers too.
//!
//! Delivery goes through unbounded channels, so relaying never awaits and the
//! per-subscriber order equals the relay order.

use std::{
    collections::HashSet,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::executor::protocol::OperationStatus;

/// Process-wide correlation id. Never persisted, never reused.
pub type Ticket = u64;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TicketStatus {
    /// Ticket the status was relayed on. Upstream subscribers see the
    /// downstream ticket here.
    pub ticket: Ticket,
    pub status: OperationStatus,
    pub timestamp: DateTime<Utc>,
}

impl TicketStatus {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RelayError {
    #[error("Ticket {0} was never issued")]
    UnknownTicket(Ticket),
    #[error("Chaining ticket {downstream} to {upstream} would form a cycle")]
    ChainCycle { downstream: Ticket, upstream: Ticket },
}

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Default)]
pub struct TicketRelay {
    last_ticket: AtomicU64,
    subscribers: DashMap<Ticket, Vec<mpsc::UnboundedSender<TicketStatus>>>,
    /// downstream -> upstream
    chains: DashMap<Ticket, Ticket>,
}

impl TicketRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next ticket. Strictly increasing, starting at 1.
    pub fn new_ticket(&self) -> Ticket {
        self.last_ticket.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn check_issued(&self, ticket: Ticket) -> RelayResult<()> {
        if ticket == 0 || ticket > self.last_ticket.load(Ordering::SeqCst) {
            return Err(RelayError::UnknownTicket(ticket));
        }
        Ok(())
    }

    pub fn subscribe(&self, ticket: Ticket) -> RelayResult<TicketReceiver> {
        self.check_issued(ticket)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.entry(ticket).or_default().push(sender);
        trace!("subscribed to ticket {}", ticket);
        Ok(TicketReceiver { ticket, receiver })
    }

    /// Make statuses of `downstream` visible to subscribers of `upstream`.
    pub fn chain(&self, downstream: Ticket, upstream: Ticket) -> RelayResult<()> {
        self.check_issued(downstream)?;
        self.check_issued(upstream)?;
        // walking up from upstream must never reach downstream
        let mut current = Some(upstream);
        while let Some(t) = current {
            if t == downstream {
                return Err(RelayError::ChainCycle {
                    downstream,
                    upstream,
                });
            }
            current = self.chains.get(&t).map(|up| *up);
        }
        self.chains.insert(downstream, upstream);
        debug!("chained ticket {} -> {}", downstream, upstream);
        Ok(())
    }

    pub fn upstream_of(&self, ticket: Ticket) -> Option<Ticket> {
        self.chains.get(&ticket).map(|up| *up)
    }

    /// Deliver `status` to subscribers of `ticket` and of every ticket it is
    /// chained to. Returns the number of subscribers reached.
    ///
    /// A terminal status releases the ticket: its subscriber list and its
    /// chain link are dropped after delivery.
    pub fn relay(&self, ticket: Ticket, status: OperationStatus) -> usize {
        let message = TicketStatus {
            ticket,
            status,
            timestamp: Utc::now(),
        };
        trace!("relay {}: {:?}", ticket, message.status);

        let mut delivered = 0;
        let mut visited = HashSet::new();
        let mut current = Some(ticket);
        while let Some(t) = current {
            if !visited.insert(t) {
                break;
            }
            if let Some(mut senders) = self.subscribers.get_mut(&t) {
                senders.retain(|sender| sender.send(message.clone()).is_ok());
                delivered += senders.len();
            }
            current = self.upstream_of(t);
        }

        if message.is_terminal() {
            self.release(ticket);
        }
        delivered
    }

    /// Drop every subscriber and the chain link of `ticket`. Receivers see
    /// the end of their stream.
    pub fn release(&self, ticket: Ticket) {
        self.subscribers.remove(&ticket);
        self.chains.remove(&ticket);
    }

    pub fn subscriber_count(&self, ticket: Ticket) -> usize {
        self.subscribers
            .get(&ticket)
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

/// Receiving end of one subscription.
#[derive(Debug)]
pub struct TicketReceiver {
    ticket: Ticket,
    receiver: mpsc::UnboundedReceiver<TicketStatus>,
}

impl TicketReceiver {
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// None once the ticket was released and everything buffered was read.
    pub async fn recv(&mut self) -> Option<TicketStatus> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TicketStatus> {
        self.receiver.try_recv().ok()
    }

    /// Read until the first terminal status for this subscription's own
    /// ticket, or until the stream ends.
    pub async fn until_terminal(&mut self) -> Vec<TicketStatus> {
        let mut statuses = Vec::new();
        while let Some(status) = self.receiver.recv().await {
            let done = status.ticket == self.ticket && status.is_terminal();
            statuses.push(status);
            if done {
                break;
            }
        }
        statuses
    }
}

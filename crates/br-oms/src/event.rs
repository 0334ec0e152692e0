//! Events emitted by the execution service to the hub.
//!
//! The runner drains an [`OmsEventReceiver`] and publishes each event under
//! its topic so that downstream ORDER subscribers of the symbol see order and
//! position changes.

use br_core::trading::{Order, Position};

/// Change to a reconciled order.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    /// The order changed and is still working.
    Updated(Order),
    /// The order reached a terminal state and will not change again.
    Finished(Order),
}

impl OrderEvent {
    /// `<symbol>.orderUpdate` or `<symbol>.orderFinished`.
    pub fn topic(&self) -> String {
        match self {
            Self::Updated(o) => format!("{}.orderUpdate", o.symbol),
            Self::Finished(o) => format!("{}.orderFinished", o.symbol),
        }
    }
}

/// Change to an aggregated position.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Changed(Position),
    /// Final snapshot of a position that just closed.
    Closed(Position),
}

impl PositionEvent {
    pub fn position(&self) -> &Position {
        match self {
            Self::Changed(p) | Self::Closed(p) => p,
        }
    }

    /// `<symbol>.position`.
    pub fn topic(&self) -> String {
        format!("{}.position", self.position().symbol)
    }
}

/// Anything the execution service reports downstream.
#[derive(Debug, Clone, PartialEq)]
pub enum OmsEvent {
    Order(OrderEvent),
    Position(PositionEvent),
}

impl OmsEvent {
    pub fn topic(&self) -> String {
        match self {
            Self::Order(e) => e.topic(),
            Self::Position(e) => e.topic(),
        }
    }
}

/// Sender half of the OMS event channel.
pub type OmsEventSender = tokio::sync::mpsc::UnboundedSender<OmsEvent>;

/// Receiver half of the OMS event channel.
pub type OmsEventReceiver = tokio::sync::mpsc::UnboundedReceiver<OmsEvent>;

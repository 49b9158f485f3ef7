//! Remote request correlation.
//!
//! A network listener (outside this crate) forwards copy/move orders carrying
//! an opaque `OrderId`. The engine threads it through to `OrderFinished` or
//! `OrderCanceled` once the request it created is settled.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::{Mode, RequestId};

/// Correlation token of a remote order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub u32);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "order {}", self.0)
    }
}

/// A copy or move order as delivered by a remote request source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRequest {
    pub order: OrderId,
    pub mode: Mode,
    pub sources: Vec<PathBuf>,
    /// Missing when the sender expects the host to pick one
    pub destination: Option<PathBuf>,
}

/// Open orders keyed by the request they created.
#[derive(Debug, Default)]
pub struct OrderBook {
    open: BTreeMap<RequestId, OrderId>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, request: RequestId, order: OrderId) {
        self.open.insert(request, order);
    }

    pub fn requests(&self) -> Vec<RequestId> {
        self.open.keys().copied().collect()
    }

    /// Close the order attached to `request`, if any.
    pub fn close(&mut self, request: RequestId) -> Option<OrderId> {
        self.open.remove(&request)
    }

    /// Close every open order, in request order.
    pub fn drain(&mut self) -> Vec<OrderId> {
        std::mem::take(&mut self.open).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl OrderBook {
        fn is_empty(&self) -> bool {
            self.open.is_empty()
        }
    }

    #[test]
    fn test_orders_are_closed_once() {
        let mut book = OrderBook::new();
        book.track(RequestId(1), OrderId(40));
        book.track(RequestId(2), OrderId(41));

        assert_eq!(book.close(RequestId(1)), Some(OrderId(40)));
        assert_eq!(book.close(RequestId(1)), None);
        assert_eq!(book.drain(), vec![OrderId(41)]);
        assert!(book.is_empty());
    }
}

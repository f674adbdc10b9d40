//! Per-fingerprint single-flight.
//!
//! The first caller to [`SingleFlight::join`] a key becomes the leader and
//! builds the value; callers arriving while the leader is working become
//! followers and wait for the value the leader publishes. A leader that goes
//! away without publishing releases the key and its followers see
//! [`FlightAbandoned`].

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("the leading request finished without publishing a result")]
pub struct FlightAbandoned;

type Slot<T> = watch::Receiver<Option<T>>;

#[derive(Debug)]
pub struct SingleFlight<T> {
    flights: Arc<DashMap<String, Slot<T>>>,
}

impl<T> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        Self {
            flights: Arc::clone(&self.flights),
        }
    }
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
        }
    }
}

pub enum Flight<T> {
    Leader(FlightLeader<T>),
    Follower(FlightFollower<T>),
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, key: &str) -> Flight<T> {
        match self.flights.entry(key.to_string()) {
            Entry::Occupied(occupied) => Flight::Follower(FlightFollower {
                slot: occupied.get().clone(),
            }),
            Entry::Vacant(vacant) => {
                let (sender, receiver) = watch::channel(None);
                vacant.insert(receiver);
                Flight::Leader(FlightLeader {
                    key: key.to_string(),
                    sender,
                    flights: Arc::clone(&self.flights),
                })
            }
        }
    }

    /// Number of keys currently being built.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

/// Held by the caller that builds the value. Dropping it releases the key.
pub struct FlightLeader<T> {
    key: String,
    sender: watch::Sender<Option<T>>,
    flights: Arc<DashMap<String, Slot<T>>>,
}

impl<T> FlightLeader<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publish `value` to every follower and release the key.
    pub fn complete(self, value: T) {
        self.sender.send_replace(Some(value));
        // Drop releases the key.
    }
}

impl<T> Drop for FlightLeader<T> {
    fn drop(&mut self) {
        self.flights.remove(&self.key);
    }
}

pub struct FlightFollower<T> {
    slot: Slot<T>,
}

impl<T: Clone> FlightFollower<T> {
    /// Wait for the leader. Dropping the returned future stops waiting
    /// without affecting the leader.
    pub async fn wait(mut self) -> Result<T, FlightAbandoned> {
        match self.slot.wait_for(Option::is_some).await {
            Ok(value) => value.clone().ok_or(FlightAbandoned),
            Err(_) => Err(FlightAbandoned),
        }
    }
}

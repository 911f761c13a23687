//! Interest registry and introduction matcher
//!
//! Tracks which topics each connected peer has declared and, on every join,
//! computes the overlap with every other peer.

use crate::protocol::{PeerId, TopicId};
use std::collections::{BTreeSet, HashMap};

/// "Tell `to` that `about` shares `topics` with it"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Introduction {
    pub to: PeerId,
    pub about: PeerId,
    /// Sorted intersection of both interest sets
    pub topics: Vec<TopicId>,
}

/// Per-peer interest sets. Not synchronized; the relay server guards it.
#[derive(Debug, Default)]
pub struct InterestRegistry {
    interests: HashMap<PeerId, BTreeSet<TopicId>>,
}

impl InterestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty entry for a peer whose introduction link just opened
    pub fn register(&mut self, peer: &str) {
        self.interests.entry(peer.to_string()).or_default();
    }

    /// Union `topics` into the peer's set and return every introduction the
    /// update produces, two per overlapping peer.
    ///
    /// Re-joining a held topic yields the same introductions again.
    pub fn join<I>(&mut self, peer: &str, topics: I) -> Vec<Introduction>
    where
        I: IntoIterator<Item = TopicId>,
    {
        let own = self.interests.entry(peer.to_string()).or_default();
        own.extend(topics);

        let own = &self.interests[peer];
        let mut introductions = Vec::new();
        for (other, their) in &self.interests {
            if other == peer {
                continue;
            }
            let common: Vec<TopicId> = own.intersection(their).cloned().collect();
            if common.is_empty() {
                continue;
            }
            introductions.push(Introduction {
                to: peer.to_string(),
                about: other.clone(),
                topics: common.clone(),
            });
            introductions.push(Introduction {
                to: other.clone(),
                about: peer.to_string(),
                topics: common,
            });
        }
        introductions
    }

    /// Remove topics from the peer's set. Nobody is notified.
    pub fn leave(&mut self, peer: &str, topics: &[TopicId]) {
        if let Some(own) = self.interests.get_mut(peer) {
            for topic in topics {
                own.remove(topic);
            }
        }
    }

    /// Drop the peer's entry entirely. Returns whether it was registered.
    pub fn disconnect(&mut self, peer: &str) -> bool {
        self.interests.remove(peer).is_some()
    }

    pub fn is_registered(&self, peer: &str) -> bool {
        self.interests.contains_key(peer)
    }

    /// Sorted topics currently held by the peer
    pub fn topics_of(&self, peer: &str) -> Vec<TopicId> {
        self.interests
            .get(peer)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn peer_count(&self) -> usize {
        self.interests.len()
    }
}

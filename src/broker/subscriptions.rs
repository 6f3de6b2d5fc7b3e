//! Channel subscription table.
//!
//! Three levels: channel, then connection, then peer id with a reference
//! count (one reference per registered listener). Every level prunes
//! eagerly, so a channel key exists iff at least one subscriber remains;
//! the mutators report the first-subscriber and last-subscriber transitions
//! the bridge relay logic feeds on.

use std::collections::HashMap;

/// Broker-local connection identifier.
pub(crate) type ConnId = u64;

#[derive(Debug, Default)]
pub(crate) struct SubscriptionMap {
    channels: HashMap<String, HashMap<ConnId, HashMap<String, u32>>>,
}

impl SubscriptionMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add one reference; true when this created the channel.
    pub(crate) fn add_ref(&mut self, channel: &str, conn: ConnId, peer_id: &str) -> bool {
        let fresh = !self.channels.contains_key(channel);
        let count = self
            .channels
            .entry(channel.to_owned())
            .or_default()
            .entry(conn)
            .or_default()
            .entry(peer_id.to_owned())
            .or_insert(0);
        *count += 1;
        fresh
    }

    /// Release one reference; true when the channel emptied out.
    pub(crate) fn release(&mut self, channel: &str, conn: ConnId, peer_id: &str) -> bool {
        let emptied = {
            let Some(conns) = self.channels.get_mut(channel) else {
                return false;
            };
            let gone = {
                let Some(peers) = conns.get_mut(&conn) else {
                    return false;
                };
                let Some(count) = peers.get_mut(peer_id) else {
                    return false;
                };
                *count = count.saturating_sub(1);
                if *count == 0 {
                    peers.remove(peer_id);
                }
                peers.is_empty()
            };
            if gone {
                conns.remove(&conn);
            }
            conns.is_empty()
        };
        if emptied {
            self.channels.remove(channel);
        }
        emptied
    }

    /// Drop every reference `peer_id` holds on `channel` through `conn`;
    /// true when the channel emptied out.
    pub(crate) fn release_peer(&mut self, channel: &str, conn: ConnId, peer_id: &str) -> bool {
        let emptied = {
            let Some(conns) = self.channels.get_mut(channel) else {
                return false;
            };
            let gone = {
                let Some(peers) = conns.get_mut(&conn) else {
                    return false;
                };
                peers.remove(peer_id);
                peers.is_empty()
            };
            if gone {
                conns.remove(&conn);
            }
            conns.is_empty()
        };
        if emptied {
            self.channels.remove(channel);
        }
        emptied
    }

    /// Drop every reference `peer_id` holds anywhere through `conn`,
    /// returning the channels that emptied out.
    pub(crate) fn release_peer_everywhere(&mut self, conn: ConnId, peer_id: &str) -> Vec<String> {
        let mut emptied = Vec::new();
        self.channels.retain(|channel, conns| {
            let gone = match conns.get_mut(&conn) {
                Some(peers) => {
                    peers.remove(peer_id);
                    peers.is_empty()
                }
                None => false,
            };
            if gone {
                conns.remove(&conn);
            }
            if conns.is_empty() {
                emptied.push(channel.clone());
                false
            } else {
                true
            }
        });
        emptied
    }

    /// Drop a whole connection, returning the channels that emptied out.
    pub(crate) fn remove_conn(&mut self, conn: ConnId) -> Vec<String> {
        let mut emptied = Vec::new();
        self.channels.retain(|channel, conns| {
            conns.remove(&conn);
            if conns.is_empty() {
                emptied.push(channel.clone());
                false
            } else {
                true
            }
        });
        emptied
    }

    /// Drop a channel outright; used to consume single-use reply channels.
    pub(crate) fn remove_channel(&mut self, channel: &str) -> bool {
        self.channels.remove(channel).is_some()
    }

    pub(crate) fn has_channel(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// True when `conn` itself subscribes to `channel`.
    pub(crate) fn conn_has_channel(&self, channel: &str, conn: ConnId) -> bool {
        self.channels
            .get(channel)
            .map(|conns| conns.contains_key(&conn))
            .unwrap_or(false)
    }

    /// True when someone other than `conn` subscribes to `channel`.
    pub(crate) fn has_channel_except(&self, channel: &str, conn: ConnId) -> bool {
        self.channels
            .get(channel)
            .map(|conns| conns.keys().any(|subscriber| *subscriber != conn))
            .unwrap_or(false)
    }

    /// Connections subscribed to `channel`.
    pub(crate) fn conns(&self, channel: &str) -> Vec<ConnId> {
        self.channels
            .get(channel)
            .map(|conns| conns.keys().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channels.keys().cloned().collect();
        channels.sort();
        channels
    }
}

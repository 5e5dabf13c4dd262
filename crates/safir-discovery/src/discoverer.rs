use std::time::{Duration, Instant};

use ahash::{HashMap, HashSet};
use rand::Rng;
use safir_core::{ConfigError, NodeId, NodeTypeId};
use safir_wire::{Discover, NodeDescriptor, NodeInfo, NODE_INFO_FIXED_SIZE, NODE_INFO_PER_NODE_SIZE};
use tracing::{debug, trace, warn};

const SEED_SENTINEL_NAME: &str = "seed";
const FIRST_TIMER_RANGE: (u64, u64) = (0, 1000);
const STEADY_TIMER_RANGE: (u64, u64) = (500, 3000);

/// An address-derived identity for a not-yet-contacted seed.
pub type SeedId = NodeId;

/// What happened to `excludedNodes[peer]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedEntry {
    pub until: Option<Instant>,
    pub seed_address: Option<String>,
}

/// Per-peer pagination progress for an in-flight `NodeInfo` exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IncompleteEntry {
    received: Vec<bool>,
}

impl IncompleteEntry {
    fn new(number_of_packets: i32) -> Self {
        Self {
            received: vec![false; number_of_packets.max(0) as usize],
        }
    }

    fn mark(&mut self, packet_number: i32) -> bool {
        if let Some(slot) = usize::try_from(packet_number).ok().and_then(|i| self.received.get_mut(i)) {
            *slot = true;
        }
        self.received.iter().all(|&done| done)
    }
}

/// Per-node-type discovery configuration.
#[derive(Debug, Clone)]
pub struct DiscovererConfig {
    pub is_light_node: bool,
    pub light_node_types: HashSet<NodeTypeId>,
    pub light_nodes_exclude_time_limit: Duration,
    pub fragment_size: usize,
}

impl Default for DiscovererConfig {
    fn default() -> Self {
        Self {
            is_light_node: false,
            light_node_types: HashSet::default(),
            light_nodes_exclude_time_limit: Duration::from_secs(30),
            fragment_size: 1500,
        }
    }
}

/// Surfaced to the facade so it can invoke the `NewNode`/`ExcludeNode`
/// callbacks the application registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    NewNode(NodeDescriptor),
    NodeExcluded(NodeId),
}

fn fnv1a_i64(s: &str) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in s.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let signed = (hash & 0x7fff_ffff_ffff_ffff) as i64;
    if signed == 0 {
        1
    } else {
        signed
    }
}

/// Gossip protocol engine for one node type: maintains `seeds`, `nodes`,
/// `reportedNodes`, `incompleteNodes`, and `excludedNodes`, and produces the
/// `Discover`/`NodeInfo` traffic and application-visible events a tick or an
/// inbound envelope implies. All state lives here; there is no hidden
/// continuation across calls.
#[derive(Debug)]
pub struct Discoverer {
    my_descriptor: NodeDescriptor,
    my_node_type: NodeTypeId,
    config: DiscovererConfig,
    seeds: HashMap<SeedId, String>,
    nodes: HashMap<NodeId, NodeDescriptor>,
    reported_nodes: HashMap<NodeId, NodeDescriptor>,
    incomplete_nodes: HashMap<NodeId, IncompleteEntry>,
    excluded_nodes: HashMap<NodeId, ExcludedEntry>,
    ticked_once: bool,
}

impl Discoverer {
    #[must_use]
    pub fn new(my_descriptor: NodeDescriptor, my_node_type: NodeTypeId, config: DiscovererConfig) -> Self {
        Self {
            my_descriptor,
            my_node_type,
            config,
            seeds: HashMap::default(),
            nodes: HashMap::default(),
            reported_nodes: HashMap::default(),
            incomplete_nodes: HashMap::default(),
            excluded_nodes: HashMap::default(),
            ticked_once: false,
        }
    }

    /// Direct access for the facade to register additional known node
    /// types (e.g. marking one as a light-node type) after construction.
    pub fn config_mut(&mut self) -> &mut DiscovererConfig {
        &mut self.config
    }

    /// Derives a stable per-process id for an address not yet backed by a
    /// real, contacted node, and records it as a seed if not already known
    /// in any of the three mutually-exclusive sets.
    pub fn inject_seed(&mut self, address: impl Into<String>) {
        let address = address.into();
        self.reseed(address);
    }

    fn reseed(&mut self, address: String) {
        let id = fnv1a_i64(&address);
        let id = NodeId(id);
        if self.nodes.contains_key(&id) || self.reported_nodes.contains_key(&id) {
            return;
        }
        self.seeds.entry(id).or_insert(address);
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_known(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// A uniform random delay for the next single-shot discovery timer:
    /// `[0, 1000ms)` before the first tick, `[500, 3000ms)` afterwards.
    pub fn next_timer_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let (lo, hi) = if self.ticked_once {
            STEADY_TIMER_RANGE
        } else {
            FIRST_TIMER_RANGE
        };
        Duration::from_millis(rng.gen_range(lo..hi))
    }

    /// Purges expired exclusions (re-seeding any that carried an address)
    /// and emits one `Discover` per element of `seeds ∪ reportedNodes ∪
    /// incompleteNodes`, each addressed to that element's last-known
    /// unicast endpoint.
    pub fn tick(&mut self, now: Instant) -> (Vec<DiscoveryEvent>, Vec<(String, Discover)>) {
        self.ticked_once = true;
        let expired: Vec<NodeId> = self
            .excluded_nodes
            .iter()
            .filter_map(|(id, entry)| match entry.until {
                Some(until) if until <= now => Some(*id),
                _ => None,
            })
            .collect();
        for id in expired {
            if let Some(entry) = self.excluded_nodes.remove(&id) {
                if let Some(address) = entry.seed_address {
                    self.reseed(address);
                }
                trace!(peer = id.0, "exclusion expired");
            }
        }

        let mut targets: Vec<(NodeId, String)> = Vec::new();
        for (id, address) in &self.seeds {
            targets.push((*id, address.clone()));
        }
        for (id, descriptor) in &self.reported_nodes {
            targets.push((*id, descriptor.control_address.clone()));
        }
        for id in self.incomplete_nodes.keys() {
            if let Some(descriptor) = self.nodes.get(id) {
                targets.push((*id, descriptor.control_address.clone()));
            }
        }

        let discover_messages = targets
            .into_iter()
            .map(|(id, address)| {
                (
                    address,
                    Discover {
                        from: self.my_descriptor.clone(),
                        sent_to_id: id.0,
                    },
                )
            })
            .collect();
        (Vec::new(), discover_messages)
    }

    fn check_light_node_peer(&self, peer_node_type: NodeTypeId) -> Result<(), ConfigError> {
        if self.config.is_light_node && self.config.light_node_types.contains(&peer_node_type) {
            return Err(ConfigError::LightNodeToLightNodeDiscovery {
                ours: self.my_node_type,
                theirs: peer_node_type,
            });
        }
        Ok(())
    }

    /// Handles an inbound `Discover`, returning any new-node events plus the
    /// paginated `NodeInfo` pages to send back (both empty if the sender is
    /// excluded, or if this is our own Discover reflected back to us).
    pub fn handle_discover(
        &mut self,
        sender_address: &str,
        discover: &Discover,
    ) -> Result<(Vec<DiscoveryEvent>, Vec<NodeInfo>), ConfigError> {
        let peer_type = NodeTypeId(discover.from.node_type_id);
        self.check_light_node_peer(peer_type)?;

        let sender_id = NodeId(discover.from.node_id);
        if sender_id == NodeId(self.my_descriptor.node_id) {
            // Our own Discover, reflected back to us: the seed entry it was
            // addressed to was actually us, so drop it instead of forever
            // re-discovering ourselves.
            self.seeds.remove(&NodeId(discover.sent_to_id));
            debug!(seed = discover.sent_to_id, "dropping self-seed");
            return Ok((Vec::new(), Vec::new()));
        }

        if self.excluded_nodes.contains_key(&sender_id) {
            debug!(peer = sender_id.0, "dropping Discover from excluded peer");
            return Ok((Vec::new(), Vec::new()));
        }

        let mut events = Vec::new();
        if !self.nodes.contains_key(&sender_id) {
            self.nodes.insert(sender_id, discover.from.clone());
            self.incomplete_nodes.entry(sender_id).or_insert_with(|| IncompleteEntry::new(0));
            events.push(DiscoveryEvent::NewNode(discover.from.clone()));
        }

        let requester_is_light = self.config.light_node_types.contains(&peer_type);
        let shareable = self.shareable_nodes(requester_is_light);
        let pages = self.paginate(sender_id, sender_address, shareable);
        Ok((events, pages))
    }

    fn shareable_nodes(&self, requester_is_light: bool) -> Vec<NodeDescriptor> {
        if self.config.is_light_node {
            return Vec::new();
        }
        let mut out = Vec::new();
        for address in self.seeds.values() {
            out.push(seed_sentinel(address));
        }
        for descriptor in self.nodes.values() {
            if requester_is_light && self.config.light_node_types.contains(&NodeTypeId(descriptor.node_type_id)) {
                continue;
            }
            out.push(descriptor.clone());
        }
        out
    }

    fn paginate(&self, to: NodeId, _address: &str, nodes: Vec<NodeDescriptor>) -> Vec<NodeInfo> {
        if self.config.is_light_node {
            return vec![NodeInfo {
                sent_from_id: self.my_descriptor.node_id,
                sent_to_id: to.0,
                sent_from_node: self.my_descriptor.clone(),
                nodes: Vec::new(),
                number_of_packets: 1,
                packet_number: 0,
            }];
        }
        if nodes.is_empty() {
            return vec![NodeInfo {
                sent_from_id: self.my_descriptor.node_id,
                sent_to_id: to.0,
                sent_from_node: self.my_descriptor.clone(),
                nodes: Vec::new(),
                number_of_packets: 1,
                packet_number: 0,
            }];
        }
        let per_packet = ((self.config.fragment_size.saturating_sub(NODE_INFO_FIXED_SIZE))
            / NODE_INFO_PER_NODE_SIZE)
            .max(1);
        let number_of_packets = i32::try_from(nodes.len().div_ceil(per_packet)).unwrap_or(i32::MAX);
        nodes
            .chunks(per_packet)
            .enumerate()
            .map(|(i, chunk)| NodeInfo {
                sent_from_id: self.my_descriptor.node_id,
                sent_to_id: to.0,
                sent_from_node: self.my_descriptor.clone(),
                nodes: chunk.to_vec(),
                number_of_packets,
                packet_number: i32::try_from(i).unwrap_or(i32::MAX),
            })
            .collect()
    }

    /// Handles an inbound `NodeInfo` page, updating pagination state and
    /// folding any newly-listed peers into `reportedNodes`/`seeds`.
    pub fn handle_node_info(&mut self, info: &NodeInfo) -> Result<Vec<DiscoveryEvent>, ConfigError> {
        let sender_type = NodeTypeId(info.sent_from_node.node_type_id);
        self.check_light_node_peer(sender_type)?;

        let sender_id = NodeId(info.sent_from_id);
        if self.excluded_nodes.contains_key(&sender_id) {
            debug!(peer = sender_id.0, "dropping NodeInfo from excluded peer");
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        self.seeds.remove(&sender_id);
        self.reported_nodes.remove(&sender_id);
        if !self.nodes.contains_key(&sender_id) {
            self.nodes.insert(sender_id, info.sent_from_node.clone());
            events.push(DiscoveryEvent::NewNode(info.sent_from_node.clone()));
        }

        let complete = self
            .incomplete_nodes
            .entry(sender_id)
            .or_insert_with(|| IncompleteEntry::new(info.number_of_packets))
            .mark(info.packet_number);
        if complete {
            self.incomplete_nodes.remove(&sender_id);
        }

        for descriptor in &info.nodes {
            let id = NodeId(descriptor.node_id);
            if self.excluded_nodes.contains_key(&id) {
                continue;
            }
            if descriptor.is_seed_sentinel() {
                if !self.seeds.values().any(|addr| addr == &descriptor.control_address) {
                    self.reseed(descriptor.control_address.clone());
                }
            } else if id != NodeId(self.my_descriptor.node_id) && !self.nodes.contains_key(&id) {
                self.reported_nodes.entry(id).or_insert_with(|| descriptor.clone());
            }
        }

        Ok(events)
    }

    /// `ExcludeNode`: branches on our own role and the target's role per
    /// the three exclusion cases (lightNode excluding anyone, ordinary
    /// excluding a lightNode, ordinary excluding an ordinary peer).
    pub fn exclude_node(&mut self, now: Instant, id: NodeId, target_node_type: NodeTypeId) -> Vec<DiscoveryEvent> {
        let seed_address = self.nodes.get(&id).map(|d| d.control_address.clone());
        self.nodes.remove(&id);
        self.reported_nodes.remove(&id);
        self.incomplete_nodes.remove(&id);

        let target_is_light = self.config.light_node_types.contains(&target_node_type);
        if self.config.is_light_node {
            self.excluded_nodes.insert(
                id,
                ExcludedEntry {
                    until: Some(now + self.config.light_nodes_exclude_time_limit),
                    seed_address,
                },
            );
        } else if target_is_light {
            if let Some(address) = seed_address {
                self.reseed(address);
            }
        } else {
            self.excluded_nodes.insert(
                id,
                ExcludedEntry {
                    until: None,
                    seed_address: None,
                },
            );
        }
        warn!(peer = id.0, "node excluded");
        vec![DiscoveryEvent::NodeExcluded(id)]
    }
}

fn seed_sentinel(address: &str) -> NodeDescriptor {
    NodeDescriptor {
        name: SEED_SENTINEL_NAME.to_owned(),
        node_id: 0,
        node_type_id: 0,
        control_address: address.to_owned(),
        data_address: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: i64, name: &str, node_type: i64) -> NodeDescriptor {
        NodeDescriptor {
            name: name.to_owned(),
            node_id: id,
            node_type_id: node_type,
            control_address: format!("127.0.0.1:{}", 10000 + id),
            data_address: format!("127.0.0.1:{}", 20000 + id),
        }
    }

    fn ordinary(id: i64) -> Discoverer {
        Discoverer::new(descriptor(id, &format!("n{id}"), 1), NodeTypeId(1), DiscovererConfig::default())
    }

    #[test]
    fn inject_seed_is_discovered_in_tick() {
        let mut d = ordinary(1);
        d.inject_seed("127.0.0.1:10000");
        let (_, discovers) = d.tick(Instant::now());
        assert_eq!(discovers.len(), 1);
        assert_eq!(discovers[0].0, "127.0.0.1:10000");
    }

    #[test]
    fn node_info_registers_new_node_and_completes_pagination() {
        let mut d = ordinary(1);
        let info = NodeInfo {
            sent_from_id: 2,
            sent_to_id: 1,
            sent_from_node: descriptor(2, "n2", 1),
            nodes: vec![descriptor(3, "n3", 1)],
            number_of_packets: 1,
            packet_number: 0,
        };
        let events = d.handle_node_info(&info).unwrap();
        assert_eq!(events, vec![DiscoveryEvent::NewNode(descriptor(2, "n2", 1))]);
        assert!(d.is_known(NodeId(2)));
        assert!(!d.incomplete_nodes.contains_key(&NodeId(2)));
        assert!(d.reported_nodes.contains_key(&NodeId(3)));
    }

    #[test]
    fn node_info_pagination_stays_incomplete_until_last_page() {
        let mut d = ordinary(1);
        let page = |n: i32| NodeInfo {
            sent_from_id: 2,
            sent_to_id: 1,
            sent_from_node: descriptor(2, "n2", 1),
            nodes: Vec::new(),
            number_of_packets: 2,
            packet_number: n,
        };
        d.handle_node_info(&page(0)).unwrap();
        assert!(d.incomplete_nodes.contains_key(&NodeId(2)));
        d.handle_node_info(&page(1)).unwrap();
        assert!(!d.incomplete_nodes.contains_key(&NodeId(2)));
    }

    #[test]
    fn light_node_to_light_node_discover_is_fatal() {
        let mut light_types = HashSet::default();
        light_types.insert(NodeTypeId(9));
        let mut d = Discoverer::new(
            descriptor(1, "n1", 9),
            NodeTypeId(9),
            DiscovererConfig {
                is_light_node: true,
                light_node_types: light_types,
                ..DiscovererConfig::default()
            },
        );
        let discover = Discover {
            from: descriptor(2, "n2", 9),
            sent_to_id: 1,
        };
        let err = d.handle_discover("127.0.0.1:10002", &discover).unwrap_err();
        assert!(matches!(err, ConfigError::LightNodeToLightNodeDiscovery { .. }));
    }

    #[test]
    fn light_node_shares_only_itself() {
        let mut d = Discoverer::new(
            descriptor(1, "n1", 9),
            NodeTypeId(9),
            DiscovererConfig {
                is_light_node: true,
                ..DiscovererConfig::default()
            },
        );
        d.nodes.insert(NodeId(5), descriptor(5, "n5", 1));
        let discover = Discover {
            from: descriptor(2, "n2", 1),
            sent_to_id: 1,
        };
        let (_, pages) = d.handle_discover("127.0.0.1:10002", &discover).unwrap();
        assert_eq!(pages.len(), 1);
        assert!(pages[0].nodes.is_empty());
        assert_eq!(pages[0].sent_from_node, descriptor(1, "n1", 9));
    }

    #[test]
    fn ordinary_never_shares_other_light_nodes_with_a_light_requester() {
        let mut light_types = HashSet::default();
        light_types.insert(NodeTypeId(9));
        let mut d = Discoverer::new(
            descriptor(1, "n1", 1),
            NodeTypeId(1),
            DiscovererConfig {
                light_node_types: light_types,
                ..DiscovererConfig::default()
            },
        );
        d.nodes.insert(NodeId(5), descriptor(5, "light5", 9));
        d.nodes.insert(NodeId(6), descriptor(6, "ordinary6", 1));
        let discover = Discover {
            from: descriptor(7, "n7", 9),
            sent_to_id: 1,
        };
        let (_, pages) = d.handle_discover("127.0.0.1:10007", &discover).unwrap();
        let all_nodes: Vec<_> = pages.iter().flat_map(|p| p.nodes.iter()).collect();
        assert!(all_nodes.iter().all(|n| n.node_id != 5));
        assert!(all_nodes.iter().any(|n| n.node_id == 6));
    }

    #[test]
    fn discover_from_an_unknown_peer_adds_it_and_fires_new_node() {
        let mut d = ordinary(1);
        let discover = Discover {
            from: descriptor(2, "n2", 1),
            sent_to_id: 1,
        };
        let (events, _) = d.handle_discover("127.0.0.1:10002", &discover).unwrap();
        assert_eq!(events, vec![DiscoveryEvent::NewNode(descriptor(2, "n2", 1))]);
        assert!(d.is_known(NodeId(2)));
        assert!(d.incomplete_nodes.contains_key(&NodeId(2)));
    }

    #[test]
    fn discover_reflected_back_from_ourselves_erases_the_self_seed() {
        let mut d = ordinary(1);
        d.inject_seed("127.0.0.1:10001");
        let self_seed_id = *d.seeds.keys().next().expect("seed was injected");
        let discover = Discover {
            from: descriptor(1, "n1", 1),
            sent_to_id: self_seed_id.0,
        };
        let (events, pages) = d.handle_discover("127.0.0.1:10001", &discover).unwrap();
        assert!(events.is_empty());
        assert!(pages.is_empty());
        assert!(!d.seeds.contains_key(&self_seed_id));
    }

    #[test]
    fn exclusion_ordinary_by_ordinary_is_permanent() {
        let mut d = ordinary(1);
        d.nodes.insert(NodeId(2), descriptor(2, "n2", 1));
        let events = d.exclude_node(Instant::now(), NodeId(2), NodeTypeId(1));
        assert_eq!(events, vec![DiscoveryEvent::NodeExcluded(NodeId(2))]);
        assert_eq!(d.excluded_nodes.get(&NodeId(2)).unwrap().until, None);
    }

    #[test]
    fn exclusion_by_light_node_is_time_limited_and_reseeds_on_expiry() {
        let mut light_types = HashSet::default();
        light_types.insert(NodeTypeId(9));
        let mut d = Discoverer::new(
            descriptor(1, "n1", 9),
            NodeTypeId(9),
            DiscovererConfig {
                is_light_node: true,
                light_node_types: light_types,
                light_nodes_exclude_time_limit: Duration::from_secs(10),
                ..DiscovererConfig::default()
            },
        );
        let mut seeded = descriptor(2, "n2", 1);
        seeded.control_address = "127.0.0.1:10000".to_owned();
        d.nodes.insert(NodeId(2), seeded);
        let now = Instant::now();
        d.exclude_node(now, NodeId(2), NodeTypeId(1));
        let entry = d.excluded_nodes.get(&NodeId(2)).unwrap();
        assert_eq!(entry.until, Some(now + Duration::from_secs(10)));
        assert_eq!(entry.seed_address.as_deref(), Some("127.0.0.1:10000"));

        let (_, discovers) = d.tick(now + Duration::from_secs(11));
        assert!(!d.excluded_nodes.contains_key(&NodeId(2)));
        assert!(discovers.iter().any(|(addr, _)| addr == "127.0.0.1:10000"));
    }

    #[test]
    fn ordinary_excluding_light_node_does_not_record_exclusion() {
        let mut light_types = HashSet::default();
        light_types.insert(NodeTypeId(9));
        let mut d = Discoverer::new(
            descriptor(1, "n1", 1),
            NodeTypeId(1),
            DiscovererConfig {
                light_node_types: light_types,
                ..DiscovererConfig::default()
            },
        );
        let mut light_peer = descriptor(5, "light5", 9);
        light_peer.control_address = "127.0.0.1:10005".to_owned();
        d.nodes.insert(NodeId(5), light_peer);
        d.exclude_node(Instant::now(), NodeId(5), NodeTypeId(9));
        assert!(!d.excluded_nodes.contains_key(&NodeId(5)));
        assert!(d.seeds.values().any(|addr| addr == "127.0.0.1:10005"));
    }
}

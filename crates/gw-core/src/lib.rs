//! # gw-core: Transmission Network Model
//!
//! Core data structures shared by the estimation-and-security engine:
//! the network graph, the field-measurement model, and the power-flow
//! collaborator interface.
//!
//! Networks are **undirected multigraphs** (petgraph) where nodes are
//! buses, generators and loads, and edges are branches (lines and
//! transformers). Keeping topology explicit makes outage application and
//! adjacency checks cheap, and newtype IDs keep bus/branch/generator
//! references from being confused at compile time.
//!
//! ## Modules
//!
//! - [`measurement`] - Typed field measurements and their identity keys
//! - [`powerflow`] - The [`PowerFlow`] collaborator seam
//! - [`units`] - Newtype wrappers for physical quantities

use petgraph::{prelude::*, Undirected};
use serde::{Deserialize, Serialize};

pub mod measurement;
pub mod powerflow;
pub mod units;

pub use measurement::{ElementRef, MeasKind, Measurement, MeasurementKey, Stream};
pub use petgraph::graph::NodeIndex;
pub use powerflow::{BranchResult, BusResult, PowerFlow, PowerFlowSolution};
pub use units::{Degrees, Kilovolts, Megavars, MegavoltAmperes, Megawatts, PerUnit, Radians};

// Newtype wrappers for IDs for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoadId(usize);

impl BusId {
    #[inline]
    pub fn new(value: usize) -> Self {
        BusId(value)
    }
    #[inline]
    pub fn value(&self) -> usize {
        self.0
    }
}

impl BranchId {
    #[inline]
    pub fn new(value: usize) -> Self {
        BranchId(value)
    }
    #[inline]
    pub fn value(&self) -> usize {
        self.0
    }
}

impl GenId {
    #[inline]
    pub fn new(value: usize) -> Self {
        GenId(value)
    }
    #[inline]
    pub fn value(&self) -> usize {
        self.0
    }
}

impl LoadId {
    #[inline]
    pub fn new(value: usize) -> Self {
        LoadId(value)
    }
    #[inline]
    pub fn value(&self) -> usize {
        self.0
    }
}

/// A network bus (node where branches, generation and load connect).
#[derive(Debug, Clone)]
pub struct Bus {
    pub id: BusId,
    pub name: String,
    /// Base voltage in kilovolts (for per-unit conversions)
    pub base_kv: Kilovolts,
    /// Voltage magnitude in per-unit
    pub voltage_pu: PerUnit,
    /// Voltage angle in radians
    pub angle_rad: Radians,
    /// Slack (angle-reference) bus flag; exactly one per island
    pub is_slack: bool,
}

impl Default for Bus {
    fn default() -> Self {
        Self {
            id: BusId(0),
            name: String::new(),
            base_kv: Kilovolts(0.0),
            voltage_pu: PerUnit(1.0),
            angle_rad: Radians(0.0),
            is_slack: false,
        }
    }
}

/// Line vs. transformer distinction for a branch edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchKind {
    Line,
    Transformer,
}

/// A transmission line or two-winding transformer.
#[derive(Debug, Clone)]
pub struct Branch {
    pub id: BranchId,
    pub name: String,
    pub from_bus: BusId,
    pub to_bus: BusId,
    pub kind: BranchKind,
    /// Series resistance (per-unit)
    pub resistance: f64,
    /// Series reactance (per-unit)
    pub reactance: f64,
    /// Total line charging susceptance (per-unit, split half/half)
    pub charging_b: PerUnit,
    /// Off-nominal tap magnitude applied at the from end
    pub tap_ratio: f64,
    /// Phase shift applied from from_bus to to_bus
    pub phase_shift: Radians,
    /// Thermal rating used for loading-percent computation
    pub rating: Option<MegavoltAmperes>,
    /// In-service status flag
    pub status: bool,
}

impl Default for Branch {
    fn default() -> Self {
        Self {
            id: BranchId(0),
            name: String::new(),
            from_bus: BusId(0),
            to_bus: BusId(0),
            kind: BranchKind::Line,
            resistance: 0.0,
            reactance: 0.0,
            charging_b: PerUnit(0.0),
            tap_ratio: 1.0,
            phase_shift: Radians(0.0),
            rating: None,
            status: true,
        }
    }
}

impl Branch {
    pub fn new(
        id: BranchId,
        name: String,
        from_bus: BusId,
        to_bus: BusId,
        resistance: f64,
        reactance: f64,
    ) -> Self {
        Self {
            id,
            name,
            from_bus,
            to_bus,
            resistance,
            reactance,
            ..Self::default()
        }
    }

    /// Attach a thermal rating in MVA.
    pub fn with_rating(mut self, rating_mva: f64) -> Self {
        self.rating = Some(MegavoltAmperes(rating_mva));
        self
    }

    /// Mark this branch as a transformer.
    pub fn as_transformer(mut self) -> Self {
        self.kind = BranchKind::Transformer;
        self
    }
}

/// A generating unit attached to a bus.
#[derive(Debug, Clone)]
pub struct Gen {
    pub id: GenId,
    pub name: String,
    pub bus: BusId,
    /// Active power output (MW)
    pub active_power: Megawatts,
    /// Reactive power output (Mvar)
    pub reactive_power: Megavars,
    /// Voltage setpoint (per-unit)
    pub voltage_setpoint: Option<PerUnit>,
    /// In-service status
    pub status: bool,
}

impl Gen {
    pub fn new(id: GenId, name: String, bus: BusId) -> Self {
        Self {
            id,
            name,
            bus,
            active_power: Megawatts(0.0),
            reactive_power: Megavars(0.0),
            voltage_setpoint: None,
            status: true,
        }
    }

    pub fn with_output(mut self, p_mw: f64, q_mvar: f64) -> Self {
        self.active_power = Megawatts(p_mw);
        self.reactive_power = Megavars(q_mvar);
        self
    }

    pub fn with_voltage_setpoint(mut self, v_pu: f64) -> Self {
        self.voltage_setpoint = Some(PerUnit(v_pu));
        self
    }
}

/// A load drawing power from a bus.
#[derive(Debug, Clone)]
pub struct Load {
    pub id: LoadId,
    pub name: String,
    pub bus: BusId,
    /// Active power demand (MW)
    pub active_power: Megawatts,
    /// Reactive power demand (Mvar)
    pub reactive_power: Megavars,
}

/// Node variants of the network graph.
#[derive(Debug, Clone)]
pub enum Node {
    Bus(Bus),
    Gen(Gen),
    Load(Load),
}

/// Edge variants of the network graph.
#[derive(Debug, Clone)]
pub enum Edge {
    Branch(Branch),
}

/// The transmission network graph.
#[derive(Debug, Clone, Default)]
pub struct Network {
    pub graph: Graph<Node, Edge, Undirected>,
}

impl Network {
    pub fn new() -> Self {
        Self {
            graph: Graph::new_undirected(),
        }
    }

    /// All buses, sorted by id so downstream index maps are deterministic.
    pub fn buses(&self) -> Vec<&Bus> {
        let mut buses: Vec<&Bus> = self
            .graph
            .node_weights()
            .filter_map(|n| match n {
                Node::Bus(b) => Some(b),
                _ => None,
            })
            .collect();
        buses.sort_by_key(|b| b.id);
        buses
    }

    /// All branches, sorted by id (fixed contingency enumeration order).
    pub fn branches(&self) -> Vec<&Branch> {
        let mut branches: Vec<&Branch> = self
            .graph
            .edge_weights()
            .map(|e| match e {
                Edge::Branch(b) => b,
            })
            .collect();
        branches.sort_by_key(|b| b.id);
        branches
    }

    /// In-service branches only.
    pub fn branches_in_service(&self) -> Vec<&Branch> {
        self.branches().into_iter().filter(|b| b.status).collect()
    }

    /// All generators.
    pub fn generators(&self) -> Vec<&Gen> {
        self.graph
            .node_weights()
            .filter_map(|n| match n {
                Node::Gen(g) => Some(g),
                _ => None,
            })
            .collect()
    }

    /// All loads.
    pub fn loads(&self) -> Vec<&Load> {
        self.graph
            .node_weights()
            .filter_map(|n| match n {
                Node::Load(l) => Some(l),
                _ => None,
            })
            .collect()
    }

    /// Look up a branch by id.
    pub fn branch(&self, id: BranchId) -> Option<&Branch> {
        self.graph.edge_weights().find_map(|e| {
            let Edge::Branch(b) = e;
            (b.id == id).then_some(b)
        })
    }

    /// Look up a bus by id.
    pub fn bus(&self, id: BusId) -> Option<&Bus> {
        self.graph.node_weights().find_map(|n| match n {
            Node::Bus(b) if b.id == id => Some(b),
            _ => None,
        })
    }

    /// The slack bus, falling back to the lowest-id bus when none is marked.
    pub fn slack_bus(&self) -> Option<BusId> {
        let buses = self.buses();
        buses
            .iter()
            .find(|b| b.is_slack)
            .or_else(|| buses.first())
            .map(|b| b.id)
    }

    /// Pairs of bus ids joined by an in-service branch.
    ///
    /// This is the adjacency used for angle-difference security checks.
    pub fn adjacent_bus_pairs(&self) -> Vec<(BusId, BusId)> {
        self.branches_in_service()
            .iter()
            .map(|b| (b.from_bus, b.to_bus))
            .collect()
    }

    /// Return a copy of the network with the given branches out of service.
    ///
    /// The original is untouched; unknown ids are ignored.
    pub fn with_outage(&self, outaged: &[BranchId]) -> Network {
        let mut net = self.clone();
        for edge in net.graph.edge_weights_mut() {
            let Edge::Branch(branch) = edge;
            if outaged.contains(&branch.id) {
                branch.status = false;
            }
        }
        net
    }

    /// Total active load (MW), used for sanity checks and logging.
    pub fn total_load_mw(&self) -> f64 {
        self.loads()
            .iter()
            .map(|l| l.active_power.value())
            .sum()
    }
}

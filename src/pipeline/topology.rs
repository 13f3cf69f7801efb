//! Stage graphs for each operating mode

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{HalError, Result};
use crate::frame::{
    ChildLink, EntityBufferType, EntitySpec, EntityType, LinkKind, NodeId, NodeSet, PipeId,
};

/// Operating mode of a frame factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineMode {
    /// FLITE -> 3AA -> ISP -> MCSC chained on the fly
    PreviewOtf,
    /// 3AA -> ISP -> MCSC through memory
    PreviewM2m,
    /// OTF chain without VRA
    HighSpeed,
    /// Bayer in, JPEG out
    Reprocessing,
}

impl PipelineMode {
    pub fn is_preview(self) -> bool {
        self != PipelineMode::Reprocessing
    }
}

/// Entity template plus the DMA outputs every frame of this mode enables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    mode: PipelineMode,
    entities: Vec<EntitySpec>,
    always_on: NodeSet,
}

fn entity(
    pipe: PipeId,
    entity_type: EntityType,
    src_count: usize,
    dst_count: usize,
    children: Vec<ChildLink>,
) -> EntitySpec {
    EntitySpec {
        pipe,
        entity_type,
        buffer_type: EntityBufferType::Fixed,
        src_count,
        dst_count,
        children,
    }
}

fn otf(child: usize) -> ChildLink {
    ChildLink {
        child,
        kind: LinkKind::Otf,
        src_index: 0,
        required_parent: None,
    }
}

fn m2m(child: usize, src_index: usize, parent: NodeId) -> ChildLink {
    ChildLink {
        child,
        kind: LinkKind::M2m,
        src_index,
        required_parent: Some(parent),
    }
}

impl Topology {
    /// Stage graph of `mode`. Entities are laid out in traversal order.
    pub fn build(mode: PipelineMode, use_vra: bool) -> Result<Self> {
        let vra = use_vra && mode != PipelineMode::HighSpeed;
        let mut entities = match mode {
            PipelineMode::PreviewOtf | PipelineMode::HighSpeed => vec![
                entity(PipeId::Flite, EntityType::OutputOnly, 0, 1, vec![otf(1)]),
                entity(PipeId::ThreeAa, EntityType::OutputOnly, 0, 1, vec![otf(2)]),
                entity(PipeId::Isp, EntityType::OutputOnly, 0, 1, vec![otf(3)]),
                entity(PipeId::Mcsc, EntityType::OutputOnly, 0, 4, Vec::new()),
            ],
            PipelineMode::PreviewM2m => vec![
                entity(PipeId::Flite, EntityType::OutputOnly, 0, 1, vec![otf(1)]),
                entity(
                    PipeId::ThreeAa,
                    EntityType::OutputOnly,
                    0,
                    1,
                    vec![m2m(2, 0, NodeId::ThreeAaOutput)],
                ),
                entity(
                    PipeId::Isp,
                    EntityType::InputOutput,
                    1,
                    1,
                    vec![m2m(3, 0, NodeId::IspOutput)],
                ),
                entity(PipeId::Mcsc, EntityType::InputOutput, 1, 4, Vec::new()),
            ],
            PipelineMode::Reprocessing => vec![
                entity(PipeId::ThreeAaReprocessing, EntityType::InputOnly, 1, 0, vec![otf(1)]),
                entity(PipeId::IspReprocessing, EntityType::OutputOnly, 0, 0, vec![otf(2)]),
                entity(
                    PipeId::McscReprocessing,
                    EntityType::OutputOnly,
                    0,
                    2,
                    vec![
                        m2m(3, 0, NodeId::ReprocessingYuv),
                        m2m(3, 1, NodeId::ReprocessingThumbnail),
                    ],
                ),
                EntitySpec {
                    pipe: PipeId::Jpeg,
                    entity_type: EntityType::InputOutput,
                    buffer_type: EntityBufferType::Delivery,
                    src_count: 2,
                    dst_count: 1,
                    children: Vec::new(),
                },
            ],
        };
        if vra && mode.is_preview() {
            let mcsc = entities.len() - 1;
            entities[mcsc].children.push(m2m(mcsc + 1, 0, NodeId::McscDs));
            entities.push(entity(PipeId::Vra, EntityType::InputOnly, 1, 0, Vec::new()));
        }

        let always_on = match mode {
            PipelineMode::PreviewM2m => NodeSet::of(&[NodeId::ThreeAaOutput, NodeId::IspOutput]),
            _ => NodeSet::EMPTY,
        };

        let topology = Self {
            mode,
            entities,
            always_on,
        };
        topology.validate()?;
        Ok(topology)
    }

    /// Reject graphs with ambiguous lookups or links that break traversal order.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (at, spec) in self.entities.iter().enumerate() {
            if !seen.insert(spec.pipe) {
                return Err(HalError::invalid_operation(format!(
                    "{} appears twice in {:?}",
                    spec.pipe, self.mode
                )));
            }
            for link in &spec.children {
                if link.child <= at || link.child >= self.entities.len() {
                    return Err(HalError::invalid_operation(format!(
                        "{} links to entity {} out of order",
                        spec.pipe, link.child
                    )));
                }
            }
        }
        let fed: HashSet<usize> = self
            .entities
            .iter()
            .flat_map(|s| s.children.iter().map(|l| l.child))
            .collect();
        if fed.contains(&0) || (1..self.entities.len()).any(|i| !fed.contains(&i)) {
            return Err(HalError::invalid_operation(format!(
                "{:?} graph is not rooted at its first entity",
                self.mode
            )));
        }
        Ok(())
    }

    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    pub fn entities(&self) -> &[EntitySpec] {
        &self.entities
    }

    /// Stage that receives new frames.
    pub fn head(&self) -> PipeId {
        self.entities[0].pipe
    }

    pub fn pipes(&self) -> Vec<PipeId> {
        self.entities.iter().map(|e| e.pipe).collect()
    }

    pub fn contains(&self, pipe: PipeId) -> bool {
        self.entities.iter().any(|e| e.pipe == pipe)
    }

    /// DMA output nodes present in this graph.
    pub fn nodes(&self) -> Vec<NodeId> {
        NodeId::ALL
            .into_iter()
            .filter(|n| {
                self.entities
                    .iter()
                    .any(|e| e.pipe == n.owner() && n.dst_index() < e.dst_count)
            })
            .collect()
    }

    pub fn always_on(&self) -> NodeSet {
        self.always_on
    }

    fn spec(&self, pipe: PipeId) -> Option<&EntitySpec> {
        self.entities.iter().find(|e| e.pipe == pipe)
    }

    /// Child the hardware feeds directly, if any.
    pub fn otf_next(&self, pipe: PipeId) -> Option<PipeId> {
        self.spec(pipe)?
            .children
            .iter()
            .find(|l| l.kind == LinkKind::Otf)
            .map(|l| self.entities[l.child].pipe)
    }

    /// Children software must feed, with the node each one consumes.
    pub fn m2m_children(&self, pipe: PipeId) -> Vec<(PipeId, Option<NodeId>)> {
        self.spec(pipe)
            .map(|spec| {
                let mut out: Vec<(PipeId, Option<NodeId>)> = Vec::new();
                for link in spec.children.iter().filter(|l| l.kind == LinkKind::M2m) {
                    let child = self.entities[link.child].pipe;
                    if !out.iter().any(|(p, _)| *p == child) {
                        out.push((child, link.required_parent));
                    }
                }
                out
            })
            .unwrap_or_default()
    }

    pub fn link_kind(&self, parent: PipeId, child: PipeId) -> Option<LinkKind> {
        self.spec(parent)?
            .children
            .iter()
            .find(|l| self.entities[l.child].pipe == child)
            .map(|l| l.kind)
    }
}

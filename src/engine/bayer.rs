//! Stream-set resolution: pipeline shape and reprocessing bayer source

use crate::error::{HalError, Result};
use crate::frame::{NodeId, NodeSet, PipeId};
use crate::pipeline::PipelineMode;
use crate::request::{StreamKind, StreamSet};
use crate::{BayerMode, PipelineConfig};

pub const PURE_SELECTOR_ID: u8 = 1;
pub const DIRTY_SELECTOR_ID: u8 = 2;

/// Where the dynamic-bayer selector picks its frames up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BayerHold {
    pub node: NodeId,
    /// Stage whose done handler hands the frame to the selector.
    pub pipe: PipeId,
    pub selector_id: u8,
}

/// Capabilities resolved once per `configure_streams`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPlan {
    pub mode: PipelineMode,
    pub use_vra: bool,
    pub bayer_mode: BayerMode,
    pub capture: bool,
    pub zsl_input: bool,
    pub bayer_copy: bool,
    pub hold: Option<BayerHold>,
}

impl StreamPlan {
    pub fn resolve(streams: &StreamSet, pipeline: &PipelineConfig) -> Result<Self> {
        let mode = pipeline.mode;
        if !mode.is_preview() {
            return Err(HalError::invalid_operation(format!(
                "{mode:?} cannot drive the live pipeline"
            )));
        }
        let capture = streams.has_capture();
        let zsl_input = streams.has(StreamKind::ZslInput);
        let bayer_copy = streams.streams().iter().any(|s| s.kind.is_bayer_copy());

        if mode == PipelineMode::HighSpeed && (capture || zsl_input || bayer_copy) {
            return Err(HalError::invalid_operation(
                "high speed streaming has no reprocessing path",
            ));
        }
        if zsl_input && !capture {
            return Err(HalError::invalid_operation("ZSL input without a JPEG stream"));
        }

        let hold = match (pipeline.bayer_mode, zsl_input, bayer_copy) {
            (BayerMode::Pure, _, _) => BayerHold {
                node: NodeId::FliteBayer,
                pipe: PipeId::Flite,
                selector_id: PURE_SELECTOR_ID,
            },
            (BayerMode::Dirty, false, false) => BayerHold {
                node: NodeId::ThreeAaOutput,
                // in M2M the ISP consumes the 3AA output before it can be held
                pipe: if mode == PipelineMode::PreviewM2m {
                    PipeId::Isp
                } else {
                    PipeId::ThreeAa
                },
                selector_id: DIRTY_SELECTOR_ID,
            },
            (BayerMode::Dirty, zsl, copy) => {
                return Err(HalError::invalid_operation(format!(
                    "dirty bayer cannot serve zsl_input={zsl} bayer_copy={copy}"
                )))
            }
        };

        Ok(Self {
            mode,
            use_vra: pipeline.use_vra && mode != PipelineMode::HighSpeed,
            bayer_mode: pipeline.bayer_mode,
            capture,
            zsl_input,
            bayer_copy,
            hold: capture.then_some(hold),
        })
    }

    pub fn needs_reprocessing(&self) -> bool {
        self.capture
    }

    /// Preview-factory outputs every frame must enable.
    pub fn always_request(&self) -> NodeSet {
        let mut nodes = NodeSet::EMPTY;
        if let Some(hold) = self.hold {
            nodes.insert(hold.node);
        }
        nodes
    }

    /// Reprocessing-factory outputs of every capture frame.
    pub fn capture_request() -> NodeSet {
        NodeSet::of(&[
            NodeId::ReprocessingYuv,
            NodeId::ReprocessingThumbnail,
            NodeId::JpegMain,
        ])
    }
}

//! Lifecycle extension points.
//!
//! A hook sees the job context at fixed stages and may change the skip
//! flag, settings, attachments and message fields for the current token.
//! The discovered token list and fragment map are held by the orchestrator
//! and are out of a hook's reach.

use std::fmt;

use thiserror::Error;

use crate::context::BurstingContext;

/// Named points in the bursting lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    StartBursting,
    StartParsePage,
    EndParsePage,
    StartExtractDocument,
    EndExtractDocument,
    DistributedBy,
    DistributionErrorHandling,
    QuarantineDocument,
    EndBursting,
}

impl HookStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartBursting => "start_bursting",
            Self::StartParsePage => "start_parse_page",
            Self::EndParsePage => "end_parse_page",
            Self::StartExtractDocument => "start_extract_document",
            Self::EndExtractDocument => "end_extract_document",
            Self::DistributedBy => "distributed_by",
            Self::DistributionErrorHandling => "distribution_error_handling",
            Self::QuarantineDocument => "quarantine_document",
            Self::EndBursting => "end_bursting",
        }
    }
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("{0}")]
pub struct HookError(pub String);

/// Capability invoked at each lifecycle stage.
pub trait LifecycleHook: Send + Sync {
    fn run(&self, stage: HookStage, ctx: &mut BurstingContext) -> Result<(), HookError>;
}

/// Hook that does nothing.
pub struct NoopHook;

impl LifecycleHook for NoopHook {
    fn run(&self, _stage: HookStage, _ctx: &mut BurstingContext) -> Result<(), HookError> {
        Ok(())
    }
}

/// Plain functions and closures are hooks.
impl<F> LifecycleHook for F
where
    F: Fn(HookStage, &mut BurstingContext) -> Result<(), HookError> + Send + Sync,
{
    fn run(&self, stage: HookStage, ctx: &mut BurstingContext) -> Result<(), HookError> {
        self(stage, ctx)
    }
}

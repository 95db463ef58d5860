//! Phase-stack dumps for invariant violations.

use std::fmt;

use serde::Serialize;

use crate::context::CaptureCounts;

/// Kind of invariant violation or misuse being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DiagnosticKind {
    Reentrance,
    Runaway,
    Unbalanced,
    EmptyStack,
    DoubleComplete,
    OffThread,
    CauseFrameLeak,
    TriggerPanic,
}

/// One frame of a dump, root first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameSummary {
    pub depth: usize,
    pub phase: &'static str,
    pub source: Option<String>,
    pub counts: CaptureCounts,
    /// `file:line:column` of the entry, when call sites are captured.
    pub entered_at: Option<String>,
}

/// Snapshot of the phase stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseStackDump {
    pub frames: Vec<FrameSummary>,
}

impl PhaseStackDump {
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Phase names, root first.
    pub fn phases(&self) -> Vec<&'static str> {
        self.frames.iter().map(|f| f.phase).collect()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for PhaseStackDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "phase stack ({} frames, innermost last):", self.frames.len())?;
        for frame in &self.frames {
            write!(f, "  #{} {}", frame.depth, frame.phase)?;
            if let Some(source) = &frame.source {
                write!(f, " source={source}")?;
            }
            let c = frame.counts;
            write!(
                f,
                " blocks={} spawns={} drops={} notifications={}",
                c.blocks, c.entity_spawns, c.item_drops, c.neighbor_notifications
            )?;
            if let Some(site) = &frame.entered_at {
                write!(f, " at {site}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

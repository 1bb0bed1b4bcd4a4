//! The six pipeline stages plus the ERROR side-stage (spec §2, §4.7).
//!
//! Serialized as their ordinal (not the variant name) so checkpoints stay
//! small and `last_completed_stage <= stage` comparisons in the pipeline loop
//! are plain integer comparisons.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A stage in the main pipeline sequence, or the `ERROR` side-stage.
///
/// `ERROR` is deliberately excluded from [`STAGE_ORDER`] — it's only ever
/// entered by explicit dispatch from the executor on fault, never as a
/// normal successor in the iteration sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PipelineStage {
    Input = 1,
    Parse = 2,
    Think = 3,
    Do = 4,
    Review = 5,
    Output = 6,
    Error = 7,
}

impl PipelineStage {
    fn from_ordinal(ordinal: u8) -> Result<Self, String> {
        match ordinal {
            1 => Ok(PipelineStage::Input),
            2 => Ok(PipelineStage::Parse),
            3 => Ok(PipelineStage::Think),
            4 => Ok(PipelineStage::Do),
            5 => Ok(PipelineStage::Review),
            6 => Ok(PipelineStage::Output),
            7 => Ok(PipelineStage::Error),
            other => Err(format!("unknown pipeline stage ordinal {other}")),
        }
    }
}

impl Serialize for PipelineStage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for PipelineStage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ordinal = u8::deserialize(deserializer)?;
        PipelineStage::from_ordinal(ordinal).map_err(serde::de::Error::custom)
    }
}

/// The normal execution order. `ERROR` is not a member: it's reached only by
/// explicit jump from a failed stage.
pub const STAGE_ORDER: [PipelineStage; 6] = [
    PipelineStage::Input,
    PipelineStage::Parse,
    PipelineStage::Think,
    PipelineStage::Do,
    PipelineStage::Review,
    PipelineStage::Output,
];

impl PipelineStage {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineStage::Input => "INPUT",
            PipelineStage::Parse => "PARSE",
            PipelineStage::Think => "THINK",
            PipelineStage::Do => "DO",
            PipelineStage::Review => "REVIEW",
            PipelineStage::Output => "OUTPUT",
            PipelineStage::Error => "ERROR",
        }
    }

    /// Position of this stage in [`STAGE_ORDER`], if it's a normal stage.
    pub fn index(&self) -> Option<usize> {
        STAGE_ORDER.iter().position(|s| s == self)
    }

    /// The stage that follows this one in [`STAGE_ORDER`], or `None` past OUTPUT.
    pub fn next(&self) -> Option<PipelineStage> {
        let idx = self.index()?;
        STAGE_ORDER.get(idx + 1).copied()
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for PipelineStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INPUT" => Ok(PipelineStage::Input),
            "PARSE" => Ok(PipelineStage::Parse),
            "THINK" => Ok(PipelineStage::Think),
            "DO" => Ok(PipelineStage::Do),
            "REVIEW" => Ok(PipelineStage::Review),
            "OUTPUT" => Ok(PipelineStage::Output),
            "ERROR" => Ok(PipelineStage::Error),
            other => Err(format!("unknown pipeline stage '{other}'")),
        }
    }
}

/// A stage name paired with the plugins registered for it, used by
/// [`crate::registry::PluginRegistry::get_plugins_for_stage`] callers that
/// want a serializable snapshot (e.g. for the GraphViz-style execution plan).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagePlugins {
    pub stage: PipelineStage,
    pub plugins: Vec<String>,
}

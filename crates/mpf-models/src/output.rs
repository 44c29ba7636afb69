//! Kinds of job outputs handled by the storage layer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a stored object is, from the job's point of view.
///
/// The kind picks the local directory used when an output lands on disk and
/// the wording of the warning attached to the job when remote storage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// The job's JSON output object.
    OutputObject,
    /// Markup (annotated media) produced by a markup action.
    Markup,
    /// A frame or image extracted from media as a detection artifact.
    Artifact,
    /// Media derived from a parent medium (e.g. pages extracted from a document).
    DerivativeMedia,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::OutputObject => "output_object",
            OutputKind::Markup => "markup",
            OutputKind::Artifact => "artifact",
            OutputKind::DerivativeMedia => "derivative_media",
        }
    }

    /// Directory under the local storage root for this kind.
    pub fn directory_name(&self) -> &'static str {
        match self {
            OutputKind::OutputObject => "output-objects",
            OutputKind::Markup => "markup",
            OutputKind::Artifact => "artifacts",
            OutputKind::DerivativeMedia => "derivative-media",
        }
    }

    /// Prefix of the job warning added when this kind falls back to local storage.
    pub fn local_fallback_message(&self) -> &'static str {
        match self {
            OutputKind::OutputObject => {
                "This output object was stored locally because storing it remotely failed due to"
            }
            OutputKind::Markup => {
                "Markup was stored locally because storing it remotely failed due to"
            }
            OutputKind::Artifact => {
                "Artifacts were stored locally because storing them remotely failed due to"
            }
            OutputKind::DerivativeMedia => {
                "Derivative media was stored locally because storing it remotely failed due to"
            }
        }
    }

    /// Whether losing this output fails the whole job.
    pub fn is_mandatory(&self) -> bool {
        matches!(self, OutputKind::OutputObject)
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of an extracted artifact: which track it belongs to and which frame
/// it was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub track_index: u32,
    pub frame_index: u32,
}

impl ArtifactKey {
    pub fn new(track_index: u32, frame_index: u32) -> Self {
        Self {
            track_index,
            frame_index,
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track {} frame {}", self.track_index, self.frame_index)
    }
}

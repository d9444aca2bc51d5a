//! Import submissions

use std::fmt;
use std::io::{BufRead, Cursor};

use super::batch::ImportKind;
use super::staged::EntityType;

/// Blocking reader consumed by the streaming parsers
pub type InputReader = Box<dyn BufRead + Send + 'static>;

/// How one input is parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// CSV text with a header row, for one entity
    Csv(EntityType),
    /// JSON step object or array of steps
    JsonSteps,
    /// JSON master plan object or array of plans
    JsonPlans,
}

impl SourceFormat {
    pub fn entity(&self) -> EntityType {
        match self {
            SourceFormat::Csv(entity) => *entity,
            SourceFormat::JsonSteps => EntityType::Step,
            SourceFormat::JsonPlans => EntityType::Plan,
        }
    }
}

/// One named input of a submission
pub struct SourceInput {
    pub name: String,
    pub format: SourceFormat,
    pub reader: InputReader,
}

impl SourceInput {
    pub fn new(name: impl Into<String>, format: SourceFormat, reader: InputReader) -> Self {
        Self {
            name: name.into(),
            format,
            reader,
        }
    }

    /// Input backed by an owned string
    pub fn from_text(name: impl Into<String>, format: SourceFormat, text: impl Into<String>) -> Self {
        Self::new(name, format, Box::new(Cursor::new(text.into())))
    }
}

impl fmt::Debug for SourceInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceInput")
            .field("name", &self.name)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// A request handed to the orchestrator
#[derive(Debug)]
pub struct ImportRequest {
    pub kind: ImportKind,
    /// Source descriptor stored on the batch
    pub source: String,
    pub actor: String,
    /// Higher is admitted first; ties are FIFO
    pub priority: i32,
    /// Per-request acceptance threshold override
    pub max_failure_ratio: Option<f64>,
    /// Processed in order inside one batch
    pub inputs: Vec<SourceInput>,
}

impl ImportRequest {
    pub fn new(kind: ImportKind, source: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            actor: actor.into(),
            priority: 0,
            max_failure_ratio: None,
            inputs: Vec::new(),
        }
    }

    pub fn with_input(mut self, input: SourceInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_failure_ratio(mut self, ratio: Option<f64>) -> Self {
        self.max_failure_ratio = ratio;
        self
    }
}

//! Operation handlers carried by worker nodes.
//!
//! Each handler is a pure function over a job's arguments and payload and
//! produces the serialized result the registry stores on the job. Heavy
//! lifting (transcoding, rendering, OCR) is delegated to external tooling in
//! a real deployment; these handlers cover the computation that stays inside
//! the platform: geometry, peak extraction, manifest summaries and caption
//! formatting.

use anyhow::Result;

pub mod captions;
pub mod crop;
pub mod inspect;
pub mod waveform;

/// A handler takes the job's argument list and optional payload and returns
/// the result payload.
pub type OperationFn = fn(args: &[String], payload: Option<&str>) -> Result<String>;

#[derive(Copy, Clone)]
pub struct Operation {
    pub name: &'static str,
    pub handler: OperationFn,
}

/// All handlers this build of the worker knows about.
pub const OPERATIONS: &[Operation] = &[
    Operation {
        name: "inspect",
        handler: inspect::inspect,
    },
    Operation {
        name: "crop",
        handler: crop::detect,
    },
    Operation {
        name: "waveform",
        handler: waveform::render,
    },
    Operation {
        name: "captions",
        handler: captions::format_vtt,
    },
];

/// Look an operation up by name.
pub fn named(name: &str) -> Option<Operation> {
    OPERATIONS.iter().copied().find(|op| op.name == name)
}

/// Service types to announce to the registry.
pub fn service_types() -> Vec<&'static str> {
    OPERATIONS.iter().map(|op| op.name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_and_unknown() {
        assert!(named("waveform").is_some());
        assert!(named("transmogrify").is_none());
    }
}
